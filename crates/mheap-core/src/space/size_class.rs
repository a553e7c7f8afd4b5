//! Size-class space: the built-in small-object allocator.
//!
//! Requests are rounded to one of [`NUM_SIZE_CLASSES`] classes and carved
//! from a single mapping. Freed chunks go onto per-class central stacks and
//! are zeroed when handed out again. Requests above [`MAX_CLASS_SIZE`] are
//! rounded to whole pages and reused by exact size.

use crate::dispatch::SmallObjectAllocator;
use crate::error::HeapError;
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::object::ObjRef;
use crate::os::{MemMap, PAGE_SIZE, Protection, checked_round_up};
use crate::space::{Allocation, Space, SpaceCounters};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const COMPONENT: &str = "size-class";

/// Number of small size classes.
pub const NUM_SIZE_CLASSES: usize = 28;

/// Largest class; bigger requests take page-rounded chunks.
pub const MAX_CLASS_SIZE: usize = 32 * 1024;

// Every class is a multiple of the 8-byte object alignment and holds at
// least an object header.
const CLASS_SIZES: [usize; NUM_SIZE_CLASSES] = [
    16, 24, 32, 48, 64, 80, 96, 128, //
    160, 192, 256, 320, 384, 512, 640, 768, //
    1024, 1280, 1536, 2048, 3072, 4096, 6144, 8192, //
    12288, 16384, 24576, 32768,
];

/// Class holding `size` bytes, or `None` above [`MAX_CLASS_SIZE`].
#[must_use]
pub fn class_index(size: usize) -> Option<usize> {
    CLASS_SIZES.iter().position(|&class| size <= class)
}

#[must_use]
pub fn class_size(index: usize) -> usize {
    CLASS_SIZES.get(index).copied().unwrap_or(0)
}

/// Bytes actually reserved for a request of `size`.
#[must_use]
pub fn chunk_size(size: usize) -> Option<usize> {
    match class_index(size) {
        Some(index) => Some(CLASS_SIZES[index]),
        None => checked_round_up(size, PAGE_SIZE),
    }
}

#[derive(Debug, Default)]
struct ClassState {
    cursor: usize,
    central: Vec<Vec<usize>>,
    /// Oversized free chunks keyed by exact size.
    oversized: BTreeMap<usize, Vec<usize>>,
    /// Live chunk address -> chunk size.
    active: HashMap<usize, usize>,
    counters: SpaceCounters,
    reused: u64,
}

/// Small-object space with central per-class free stacks.
pub struct SizeClassSpace {
    mem_map: MemMap,
    begin: usize,
    limit: usize,
    state: Mutex<ClassState>,
    log: Arc<HeapLog>,
}

impl SizeClassSpace {
    pub fn create(name: &str, capacity: usize, log: Arc<HeapLog>) -> Result<Self, HeapError> {
        if capacity == 0 {
            return Err(HeapError::Config(format!("{name}: zero capacity")));
        }
        let mem_map = MemMap::map_anonymous(name, capacity, Protection::ReadWrite)
            .map_err(|e| HeapError::map(name, capacity, e))?;
        let begin = mem_map.begin();
        Ok(Self {
            begin,
            limit: begin + mem_map.size(),
            state: Mutex::new(ClassState {
                cursor: begin,
                central: vec![Vec::new(); NUM_SIZE_CLASSES],
                ..ClassState::default()
            }),
            mem_map,
            log,
        })
    }

    fn pop_free(state: &mut ClassState, bytes: usize) -> Option<usize> {
        match class_index(bytes) {
            Some(index) => state.central[index].pop(),
            None => state.oversized.get_mut(&bytes).and_then(Vec::pop),
        }
    }

    fn finish(&self, state: &mut ClassState, addr: usize, bytes: usize) -> Option<Allocation> {
        state.active.insert(addr, bytes);
        state.counters.on_alloc(bytes);
        ObjRef::from_addr(addr).map(|obj| Allocation::exact(obj, bytes))
    }

    fn reuse(&self, state: &mut ClassState, bytes: usize) -> Option<Allocation> {
        let addr = Self::pop_free(state, bytes)?;
        if let Err(e) = self.mem_map.zero(addr, bytes) {
            self.log.fatal(COMPONENT, "alloc", format!("reused chunk {addr:#x}: {e}"));
        }
        state.reused += 1;
        self.finish(state, addr, bytes)
    }

    /// Chunks handed out again from the free stacks.
    #[must_use]
    pub fn reuse_count(&self) -> u64 {
        self.state.lock().reused
    }
}

impl SmallObjectAllocator for SizeClassSpace {
    fn name(&self) -> &str {
        self.mem_map.name()
    }

    fn alloc(&self, num_bytes: usize) -> Option<Allocation> {
        let bytes = chunk_size(num_bytes)?;
        let mut state = self.state.lock();
        if let Some(allocation) = self.reuse(&mut state, bytes) {
            return Some(allocation);
        }
        let addr = state.cursor;
        match addr.checked_add(bytes) {
            Some(next) if next <= self.limit => {
                state.cursor = next;
                self.finish(&mut state, addr, bytes)
            }
            _ => {
                drop(state);
                self.log.emit(
                    LogEvent::new(HeapLogLevel::Debug, COMPONENT, "alloc")
                        .size(bytes)
                        .outcome("exhausted"),
                );
                None
            }
        }
    }

    /// Reuse a cached chunk without waiting on the space lock.
    fn alloc_thread_local(&self, num_bytes: usize) -> Option<Allocation> {
        let bytes = chunk_size(num_bytes)?;
        let mut state = self.state.try_lock()?;
        self.reuse(&mut state, bytes)
    }

    fn max_bytes_bulk_allocated_for(&self, num_bytes: usize) -> usize {
        chunk_size(num_bytes).unwrap_or(num_bytes)
    }

    fn free(&self, obj: ObjRef) -> usize {
        let mut state = self.state.lock();
        let Some(bytes) = state.active.remove(&obj.addr()) else {
            drop(state);
            self.log.fatal(
                COMPONENT,
                "free",
                format!("{:#x} is not allocated in {}", obj.addr(), self.mem_map.name()),
            );
        };
        match class_index(bytes) {
            Some(index) => state.central[index].push(obj.addr()),
            None => state.oversized.entry(bytes).or_default().push(obj.addr()),
        }
        state.counters.on_free(bytes);
        bytes
    }

    fn allocation_size(&self, obj: ObjRef) -> Option<usize> {
        self.state.lock().active.get(&obj.addr()).copied()
    }

    fn counters(&self) -> SpaceCounters {
        self.state.lock().counters
    }

    fn contains(&self, addr: usize) -> bool {
        Space::contains(self, addr)
    }

    fn dump(&self) -> String {
        Space::dump(self)
    }
}

impl Space for SizeClassSpace {
    fn name(&self) -> &str {
        self.mem_map.name()
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.state.lock().cursor
    }

    fn dump(&self) -> String {
        let state = self.state.lock();
        let cached: usize = state.central.iter().map(Vec::len).sum::<usize>()
            + state.oversized.values().map(Vec::len).sum::<usize>();
        format!(
            "{} [{:#x}, {:#x}) limit={:#x} objects={} bytes={} cached_free={} reused={}",
            self.mem_map.name(),
            self.begin,
            state.cursor,
            self.limit,
            state.counters.objects_allocated,
            state.counters.bytes_allocated,
            cached,
            state.reused,
        )
    }
}
