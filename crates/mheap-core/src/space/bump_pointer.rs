//! Bump-pointer region.
//!
//! A single contiguous mapping allocated by atomically advancing a cursor.
//! Objects allocated directly live in the headerless "main block"; every
//! thread-local buffer carved later gets a [`BlockHeader`] so the region stays
//! walkable after buffers are revoked.

#![allow(unsafe_code)]

use crate::error::HeapError;
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::object::ObjRef;
use crate::os::{MemMap, Protection, is_aligned, round_up};
use crate::space::{Allocation, Space};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Allocation quantum of the region.
pub const BUMP_ALIGNMENT: usize = 8;

const COMPONENT: &str = "bump-pointer";

#[repr(C)]
struct BlockHeader {
    size: usize,
    unused: usize,
}

const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// A mutator's private chunk of a [`BumpPointerRegion`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLocalBuffer {
    start: usize,
    pos: usize,
    end: usize,
    objects: u64,
}

impl ThreadLocalBuffer {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.start != 0
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.pos - self.start
    }

    #[must_use]
    pub fn objects(&self) -> u64 {
        self.objects
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Bump `n` bytes off the buffer. No synchronization: the buffer is owned
    /// by one mutator.
    pub(crate) fn bump(&mut self, n: usize) -> Option<ObjRef> {
        if n > self.remaining() {
            return None;
        }
        let obj = ObjRef::from_addr(self.pos)?;
        self.pos += n;
        self.objects += 1;
        Some(obj)
    }

    fn reset(&mut self, start: usize, end: usize) {
        *self = Self {
            start,
            pos: start,
            end,
            objects: 0,
        };
    }
}

/// Lifecycle of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Empty,
    Growing,
    /// Source of an evacuation; refuses allocations until cleared.
    Frozen,
}

#[derive(Debug, Default)]
struct BlockState {
    main_block_size: usize,
    num_blocks: usize,
}

/// Contiguous bump-pointer space.
pub struct BumpPointerRegion {
    mem_map: MemMap,
    begin: usize,
    limit: usize,
    end: AtomicUsize,
    growth_end: AtomicUsize,
    frozen: AtomicBool,
    /// Direct allocations plus revoked thread-local buffers.
    objects_allocated: AtomicU64,
    bytes_allocated: AtomicU64,
    block_lock: Mutex<BlockState>,
    log: Arc<HeapLog>,
}

impl BumpPointerRegion {
    pub fn create(name: &str, capacity: usize, log: Arc<HeapLog>) -> Result<Self, HeapError> {
        Self::create_with_growth_limit(name, capacity, capacity, log)
    }

    /// Region of `capacity` bytes that initially only grows to `growth_limit`.
    pub fn create_with_growth_limit(
        name: &str,
        capacity: usize,
        growth_limit: usize,
        log: Arc<HeapLog>,
    ) -> Result<Self, HeapError> {
        if capacity == 0 || !is_aligned(capacity, BUMP_ALIGNMENT) || growth_limit > capacity {
            return Err(HeapError::Config(format!(
                "{name}: bad capacity {capacity} / growth limit {growth_limit}"
            )));
        }
        let mem_map = MemMap::map_anonymous(name, capacity, Protection::ReadWrite)
            .map_err(|e| HeapError::map(name, capacity, e))?;
        let begin = mem_map.begin();
        Ok(Self {
            begin,
            limit: begin + capacity,
            end: AtomicUsize::new(begin),
            growth_end: AtomicUsize::new(begin + growth_limit),
            frozen: AtomicBool::new(false),
            objects_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            block_lock: Mutex::new(BlockState::default()),
            mem_map,
            log,
        })
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn growth_end(&self) -> usize {
        self.growth_end.load(Ordering::Relaxed)
    }

    /// Bytes between `begin` and the cursor.
    #[must_use]
    pub fn size(&self) -> usize {
        self.end() - self.begin
    }

    #[must_use]
    pub fn state(&self) -> RegionState {
        if self.frozen.load(Ordering::Acquire) {
            RegionState::Frozen
        } else if self.end() == self.begin {
            RegionState::Empty
        } else {
            RegionState::Growing
        }
    }

    /// Mark the region as an evacuation source.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Raise the soft cap to the full capacity.
    pub fn clear_growth_limit(&self) {
        self.growth_end.fetch_max(self.limit, Ordering::Relaxed);
    }

    /// Raise the soft cap to `new_end`; lowering it is a no-op.
    pub fn raise_growth_end(&self, new_end: usize) {
        self.growth_end
            .fetch_max(new_end.min(self.limit), Ordering::Relaxed);
    }

    /// Bump the cursor by `n` (already aligned) without touching counters.
    pub(crate) fn alloc_nonvirtual_without_accounting(&self, n: usize) -> Option<usize> {
        debug_assert!(is_aligned(n, BUMP_ALIGNMENT));
        if self.frozen.load(Ordering::Acquire) {
            return None;
        }
        let mut old_end = self.end.load(Ordering::Relaxed);
        loop {
            let new_end = old_end.checked_add(n)?;
            if new_end > self.growth_end.load(Ordering::Relaxed) {
                return None;
            }
            match self.end.compare_exchange_weak(
                old_end,
                new_end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(old_end),
                Err(actual) => old_end = actual,
            }
        }
    }

    /// Thread-safe allocation of `n` aligned bytes.
    pub fn alloc_nonvirtual(&self, n: usize) -> Option<ObjRef> {
        let obj = ObjRef::from_addr(self.alloc_nonvirtual_without_accounting(n)?)?;
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(n as u64, Ordering::Relaxed);
        Some(obj)
    }

    /// Thread-safe allocation; rounds `n` up to [`BUMP_ALIGNMENT`].
    pub fn alloc(&self, n: usize) -> Option<Allocation> {
        let rounded = round_up(n, BUMP_ALIGNMENT);
        self.alloc_nonvirtual(rounded)
            .map(|obj| Allocation::exact(obj, rounded))
    }

    /// Allocation for a collector that has stopped every mutator.
    pub fn alloc_thread_unsafe(&self, n: usize) -> Option<Allocation> {
        if self.frozen.load(Ordering::Relaxed) {
            return None;
        }
        let rounded = round_up(n, BUMP_ALIGNMENT);
        let end = self.end.load(Ordering::Relaxed);
        let new_end = end.checked_add(rounded)?;
        if new_end > self.growth_end.load(Ordering::Relaxed) {
            return None;
        }
        self.end.store(new_end, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(rounded as u64, Ordering::Relaxed);
        ObjRef::from_addr(end).map(|obj| Allocation::exact(obj, rounded))
    }

    /// Revoke `tlab` and carve a fresh buffer of `bytes` into it.
    pub fn alloc_new_tlab(&self, tlab: &mut ThreadLocalBuffer, bytes: usize) -> bool {
        let mut blocks = self.block_lock.lock();
        self.revoke_locked(tlab);
        let bytes = round_up(bytes, BUMP_ALIGNMENT);
        let Some(start) = self.alloc_block_locked(&mut blocks, bytes) else {
            return false;
        };
        tlab.reset(start, start + bytes);
        true
    }

    fn update_main_block(&self, blocks: &mut BlockState) {
        blocks.main_block_size = self.size();
    }

    fn alloc_block_locked(&self, blocks: &mut BlockState, bytes: usize) -> Option<usize> {
        if blocks.num_blocks == 0 {
            self.update_main_block(blocks);
        }
        let storage = self.alloc_nonvirtual_without_accounting(bytes + BLOCK_HEADER_SIZE)?;
        // SAFETY: `storage` is a fresh, exclusively owned, 8-aligned range of
        // `bytes + BLOCK_HEADER_SIZE` bytes inside the mapping.
        unsafe {
            (storage as *mut BlockHeader).write(BlockHeader {
                size: bytes,
                unused: 0,
            });
        }
        blocks.num_blocks += 1;
        Some(storage + BLOCK_HEADER_SIZE)
    }

    /// Fold `tlab`'s usage into the region counters and detach it.
    pub fn revoke_thread_local_buffer(&self, tlab: &mut ThreadLocalBuffer) -> usize {
        let _blocks = self.block_lock.lock();
        self.revoke_locked(tlab)
    }

    fn revoke_locked(&self, tlab: &mut ThreadLocalBuffer) -> usize {
        let old = std::mem::take(tlab);
        if !old.is_active() {
            return 0;
        }
        self.objects_allocated
            .fetch_add(old.objects, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(old.used() as u64, Ordering::Relaxed);
        old.used()
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.block_lock.lock().num_blocks
    }

    #[must_use]
    pub fn objects_allocated(&self) -> u64 {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Account objects reclaimed by the collector.
    pub fn record_free(&self, objects: u64, bytes: u64) {
        self.objects_allocated
            .fetch_sub(objects, Ordering::Relaxed);
        self.bytes_allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Reset to empty, returning every page to the kernel.
    pub fn clear(&self) {
        let mut blocks = self.block_lock.lock();
        if let Err(e) = self
            .mem_map
            .release_pages(self.begin, self.limit - self.begin)
        {
            self.log.fatal(COMPONENT, "clear", format!("madvise failed: {e}"));
        }
        self.end.store(self.begin, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.growth_end.store(self.limit, Ordering::Relaxed);
        self.frozen.store(false, Ordering::Release);
        *blocks = BlockState::default();
        self.log.emit(
            LogEvent::new(HeapLogLevel::Debug, COMPONENT, "clear").size(self.limit - self.begin),
        );
    }

    /// Visit every object in allocation order.
    ///
    /// Main-block objects are followed contiguously by size; thread-local
    /// blocks are visited through their headers. A zero type word marks the
    /// end of the initialized objects in a block.
    pub fn walk(&self, size_of: impl Fn(ObjRef) -> usize, mut visitor: impl FnMut(ObjRef)) {
        let mut pos = self.begin;
        let mut end = self.end();
        let main_end = {
            let mut blocks = self.block_lock.lock();
            if blocks.num_blocks == 0 {
                self.update_main_block(&mut blocks);
            }
            let main_end = self.begin + blocks.main_block_size;
            if blocks.num_blocks == 0 {
                // Another thread may still be bumping the main block.
                end = main_end;
            }
            main_end
        };
        let next = |obj: ObjRef| -> usize {
            let size = size_of(obj);
            if size == 0 {
                self.log.fatal(
                    COMPONENT,
                    "walk",
                    format!("object {:#x} reports size 0", obj.addr()),
                );
            }
            obj.addr() + round_up(size, BUMP_ALIGNMENT)
        };
        while pos < main_end {
            let Some(obj) = ObjRef::from_addr(pos) else { return };
            // SAFETY: `pos` lies below the cursor inside the mapping; the
            // header bytes are either installed or still zero.
            if unsafe { obj.type_word() } == 0 {
                return;
            }
            visitor(obj);
            pos = next(obj);
        }
        while pos < end {
            // SAFETY: after the main block, `pos` always points at a block
            // header written by `alloc_block_locked`.
            let block_size = unsafe { (*(pos as *const BlockHeader)).size };
            pos += BLOCK_HEADER_SIZE;
            let block_end = pos + block_size;
            if block_end > self.end() {
                self.log.fatal(
                    COMPONENT,
                    "walk",
                    format!("block at {pos:#x} overruns the region cursor"),
                );
            }
            let mut cursor = pos;
            while cursor < block_end {
                let Some(obj) = ObjRef::from_addr(cursor) else { break };
                // SAFETY: inside a carved block below the cursor.
                if unsafe { obj.type_word() } == 0 {
                    break;
                }
                visitor(obj);
                cursor = next(obj);
            }
            pos = block_end;
        }
    }
}

impl Space for BumpPointerRegion {
    fn name(&self) -> &str {
        self.mem_map.name()
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    fn dump(&self) -> String {
        let blocks = self.block_lock.lock();
        format!(
            "{} [{:#x}, {:#x}) growth_end={:#x} limit={:#x} state={:?} blocks={} main_block={} \
             objects={} bytes={}",
            self.name(),
            self.begin,
            self.end(),
            self.growth_end(),
            self.limit,
            self.state(),
            blocks.num_blocks,
            blocks.main_block_size,
            self.objects_allocated(),
            self.bytes_allocated(),
        )
    }
}
