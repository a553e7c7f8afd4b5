//! # mheap-core
//!
//! Object allocation engine of a managed runtime heap.
//!
//! Mutator threads allocate through a [`Heap`], which selects a strategy by
//! [`AllocatorKind`]:
//!
//! - a bump-pointer region, shared or carved into thread-local buffers;
//! - pluggable small-object allocators (a size-class space by default);
//! - a large-object space, either one mapping per object or a best-fit
//!   free list with coalescing.
//!
//! Footprint growth, OOM decisions and concurrent-collection triggers live in
//! [`FootprintController`]. Tracing and sweeping are left to a [`Collector`]
//! supplied by the embedder.

pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod footprint;
pub mod heap;
pub mod listener;
pub mod log;
pub mod mutator;
pub mod object;
pub mod os;
pub mod space;

pub use collector::{AllocationStack, Collector, GcCause, GcKind, NoopCollector};
pub use config::{HeapConfig, LargeObjectSpaceKind, VerifyLevel};
pub use dispatch::{AllocatorDispatcher, AllocatorKind, SmallObjectAllocator};
pub use error::{AllocError, HeapError};
pub use footprint::{FootprintController, FootprintSnapshot};
pub use heap::{Heap, HeapBuilder};
pub use listener::{AllocationListener, AllocationRecord, NoPaging, PagingHooks, RuntimeStats};
pub use log::{HeapLog, HeapLogLevel, HeapLogRecord, LogEvent};
pub use mutator::{Mutator, MutatorState};
pub use object::{BasicType, HEADER_SIZE, ObjRef, ObjectHeader, Shape, TypeDescriptor};
pub use space::{Allocation, ObjectBytePair, Space, SpaceCounters};
