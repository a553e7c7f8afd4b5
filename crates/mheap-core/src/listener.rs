//! Instrumentation hooks: allocation listeners, runtime statistics,
//! allocation tracking and the object-paging extension point.

use crate::mutator::Mutator;
use crate::object::{ObjRef, TypeDescriptor};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Observer of every allocation on the instrumented path.
pub trait AllocationListener: Send + Sync {
    /// Runs before dispatch and again on every restart. May adjust `byte_count`.
    fn pre_object_allocated(
        &self,
        _mutator: &Mutator,
        _ty: &dyn TypeDescriptor,
        _byte_count: &mut usize,
    ) {
    }

    /// Runs after construction, before the object is returned.
    fn object_allocated(&self, mutator: &Mutator, obj: ObjRef, byte_count: usize);
}

/// Hooks of an optional transparent object-paging extension.
pub trait PagingHooks: Send + Sync {
    /// `obj` must never be paged out.
    fn mark_non_swappable(&self, _obj: ObjRef) {}
}

/// Paging disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPaging;

impl PagingHooks for NoPaging {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub allocated_objects: u64,
    pub allocated_bytes: u64,
}

impl RuntimeStats {
    pub(crate) fn record(&mut self, bytes: usize) {
        self.allocated_objects += 1;
        self.allocated_bytes += bytes as u64;
    }
}

/// Process-wide counterpart of [`RuntimeStats`].
#[derive(Debug, Default)]
pub(crate) struct GlobalStats {
    objects: AtomicU64,
    bytes: AtomicU64,
}

impl GlobalStats {
    pub(crate) fn record(&self, bytes: usize) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            allocated_objects: self.objects.load(Ordering::Relaxed),
            allocated_bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub seq: u64,
    pub mutator_id: u32,
    pub addr: usize,
    pub byte_count: usize,
    pub type_word: usize,
}

/// Bounded ring of the most recent allocations. Capacity zero disables it.
#[derive(Debug)]
pub struct AllocationRecords {
    capacity: usize,
    next_seq: AtomicU64,
    ring: Mutex<VecDeque<AllocationRecord>>,
}

impl AllocationRecords {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub(crate) fn record(&self, mutator_id: u32, obj: ObjRef, byte_count: usize, type_word: usize) {
        if !self.is_enabled() {
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(AllocationRecord {
            seq,
            mutator_id,
            addr: obj.addr(),
            byte_count,
            type_word,
        });
    }

    /// Allocations ever recorded, including ones that fell off the ring.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        self.ring.lock().iter().copied().collect()
    }
}
