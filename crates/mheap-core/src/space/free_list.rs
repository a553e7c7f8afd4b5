//! Best-fit, coalescing large-object space over a single mapping.
//!
//! Allocator metadata lives out of band in a page-granular side table of
//! [`AllocationInfo`] slots, so freed pages can be released and protected
//! without touching bookkeeping. Free runs that are not part of the
//! unbounded tail are indexed by a sorted set keyed on
//! `(run length, following slot's own length, following slot)`: a lower-bound
//! probe with the request length yields the best fit. Among runs of equal
//! length, the one followed by the shortest object wins, and the lowest
//! address only breaks ties between equal followers.
//!
//! Invariants, checked by [`FreeListSpace::verify_invariants`]:
//!
//! 1. No two adjacent runs are both free, and no free run touches the tail.
//! 2. The sorted set holds exactly the non-tail free runs.
//! 3. Runs plus the tail cover the region exactly.

#![allow(unsafe_code)]

use crate::config::VerifyLevel;
use crate::error::HeapError;
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::object::ObjRef;
use crate::os::{MemMap, PAGE_SIZE, Protection, checked_round_up, is_aligned};
use crate::space::{Allocation, ObjectBitmaps, Space, SpaceCounters};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Unit of allocation and of the side table.
pub const FREE_LIST_ALIGNMENT: usize = PAGE_SIZE;

const COMPONENT: &str = "free-list";

/// Side-table entry for one alignment unit.
///
/// Only the first unit of a run carries its length and flags. The unit right
/// after a free run also records that run's length in `prev_free`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    prev_free: u32,
    alloc_size: u32,
}

impl AllocationInfo {
    const FLAG_FREE: u32 = 0x8000_0000;
    const FLAG_ZYGOTE: u32 = 0x4000_0000;
    const FLAGS_MASK: u32 = Self::FLAG_FREE | Self::FLAG_ZYGOTE;
    /// Longest run a single entry can describe, in units.
    pub const MAX_UNITS: usize = !Self::FLAGS_MASK as usize;

    fn used(units: usize) -> Self {
        debug_assert!(units > 0 && units <= Self::MAX_UNITS);
        Self {
            prev_free: 0,
            alloc_size: units as u32,
        }
    }

    fn free_run(units: usize) -> Self {
        debug_assert!(units > 0 && units <= Self::MAX_UNITS);
        Self {
            prev_free: 0,
            alloc_size: units as u32 | Self::FLAG_FREE,
        }
    }

    /// Run length in units; zero for interior slots.
    #[must_use]
    pub fn align_size(&self) -> usize {
        (self.alloc_size & !Self::FLAGS_MASK) as usize
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.align_size() * FREE_LIST_ALIGNMENT
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.alloc_size & Self::FLAG_FREE != 0
    }

    #[must_use]
    pub fn is_zygote_object(&self) -> bool {
        self.alloc_size & Self::FLAG_ZYGOTE != 0
    }

    fn set_zygote_object(&mut self) {
        self.alloc_size |= Self::FLAG_ZYGOTE;
    }

    /// Length of the free run ending right before this unit.
    #[must_use]
    pub fn prev_free_units(&self) -> usize {
        self.prev_free as usize
    }

    fn set_prev_free_units(&mut self, units: usize) {
        debug_assert!(units <= Self::MAX_UNITS);
        self.prev_free = units as u32;
    }
}

/// Index entry of a free run, stored against the unit that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeRunKey {
    run_units: usize,
    following_units: usize,
    following_slot: usize,
}

impl FreeRunKey {
    fn probe(units: usize) -> Self {
        Self {
            run_units: units,
            following_units: 0,
            following_slot: 0,
        }
    }

    fn run_start(&self) -> usize {
        self.following_slot - self.run_units
    }
}

/// Side table of [`AllocationInfo`], itself backed by an anonymous mapping.
struct SideTable {
    map: MemMap,
    len: usize,
}

impl SideTable {
    fn new(name: &str, len: usize) -> Result<Self, HeapError> {
        let bytes = len * std::mem::size_of::<AllocationInfo>();
        let map = MemMap::map_anonymous(name, bytes, Protection::ReadWrite)
            .map_err(|e| HeapError::map(name, bytes, e))?;
        Ok(Self { map, len })
    }

    fn as_slice(&self) -> &[AllocationInfo] {
        // SAFETY: the mapping holds `len` zero-initialized entries, and an
        // all-zero `AllocationInfo` is valid. It lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.map.begin() as *const AllocationInfo, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [AllocationInfo] {
        // SAFETY: as above; `&mut self` gives exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(self.map.begin() as *mut AllocationInfo, self.len)
        }
    }
}

impl Index<usize> for SideTable {
    type Output = AllocationInfo;

    fn index(&self, slot: usize) -> &AllocationInfo {
        &self.as_slice()[slot]
    }
}

impl IndexMut<usize> for SideTable {
    fn index_mut(&mut self, slot: usize) -> &mut AllocationInfo {
        &mut self.as_mut_slice()[slot]
    }
}

struct FreeListState {
    infos: SideTable,
    free_runs: BTreeSet<FreeRunKey>,
    /// Bytes of the unbounded free extent at the end of the region.
    free_end: usize,
    counters: SpaceCounters,
}

impl FreeListState {
    fn tail_start(&self, num_slots: usize) -> usize {
        num_slots - self.free_end / FREE_LIST_ALIGNMENT
    }

    fn key_for(&self, following_slot: usize) -> FreeRunKey {
        let info = self.infos[following_slot];
        FreeRunKey {
            run_units: info.prev_free_units(),
            following_units: info.align_size(),
            following_slot,
        }
    }
}

/// One run of the side table, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    pub addr: usize,
    pub bytes: usize,
    pub free: bool,
    pub zygote: bool,
}

/// Large-object space with best-fit reuse and eager coalescing.
pub struct FreeListSpace {
    name: String,
    mem_map: MemMap,
    begin: usize,
    end: usize,
    num_slots: usize,
    /// Protect freed pages read-only and audit the side table.
    checked: bool,
    state: Mutex<FreeListState>,
    bitmaps: ObjectBitmaps,
    log: Arc<HeapLog>,
}

impl FreeListSpace {
    /// `capacity` must be a nonzero multiple of [`FREE_LIST_ALIGNMENT`].
    pub fn create(
        name: &str,
        capacity: usize,
        verify: VerifyLevel,
        log: Arc<HeapLog>,
    ) -> Result<Self, HeapError> {
        if capacity == 0 || !is_aligned(capacity, FREE_LIST_ALIGNMENT) {
            return Err(HeapError::Config(format!(
                "{name}: capacity {capacity} is not a nonzero multiple of {FREE_LIST_ALIGNMENT}"
            )));
        }
        let mem_map = MemMap::map_anonymous(name, capacity, Protection::ReadWrite)
            .map_err(|e| HeapError::map(name, capacity, e))?;
        let num_slots = capacity / FREE_LIST_ALIGNMENT;
        let infos = SideTable::new(&format!("{name} allocation info"), num_slots)?;
        let begin = mem_map.begin();
        Ok(Self {
            name: name.to_string(),
            begin,
            end: begin + capacity,
            num_slots,
            checked: verify.is_checked(),
            state: Mutex::new(FreeListState {
                infos,
                free_runs: BTreeSet::new(),
                free_end: capacity,
                counters: SpaceCounters::default(),
            }),
            bitmaps: ObjectBitmaps::default(),
            mem_map,
            log,
        })
    }

    fn slot_of(&self, addr: usize) -> usize {
        (addr - self.begin) / FREE_LIST_ALIGNMENT
    }

    fn addr_of(&self, slot: usize) -> usize {
        self.begin + slot * FREE_LIST_ALIGNMENT
    }

    /// Abort with a dump of the space. Must not be called with the lock held.
    #[cold]
    fn corrupt(&self, event: &'static str, message: String) -> ! {
        let dump = self.dump();
        self.log.fatal(COMPONENT, event, format!("{message}\n{dump}"))
    }

    /// Best-fit allocation of `n` bytes rounded up to whole pages.
    pub fn alloc(&self, n: usize) -> Option<Allocation> {
        let bytes = checked_round_up(n.max(1), FREE_LIST_ALIGNMENT)?;
        let units = bytes / FREE_LIST_ALIGNMENT;
        let mut state = self.state.lock();
        let slot = if let Some(key) = state
            .free_runs
            .range(FreeRunKey::probe(units)..)
            .next()
            .copied()
        {
            state.free_runs.remove(&key);
            let start = key.run_start();
            let remaining = key.run_units - units;
            state.infos[key.following_slot].set_prev_free_units(remaining);
            if remaining > 0 {
                let rest = start + units;
                state.infos[rest] = AllocationInfo::free_run(remaining);
                let rekey = state.key_for(key.following_slot);
                state.free_runs.insert(rekey);
            }
            start
        } else if state.free_end >= bytes {
            let start = state.tail_start(self.num_slots);
            state.free_end -= bytes;
            start
        } else {
            let free_end = state.free_end;
            let free_runs = state.free_runs.len();
            drop(state);
            self.log.emit(
                LogEvent::new(HeapLogLevel::Debug, COMPONENT, "alloc")
                    .size(bytes)
                    .outcome("no_fit")
                    .details(format!("free_end={free_end:#x} free_runs={free_runs}")),
            );
            return None;
        };
        state.infos[slot] = AllocationInfo::used(units);
        state.counters.on_alloc(bytes);
        if self.checked {
            if let Err(e) = self.verify_locked(&state) {
                drop(state);
                self.corrupt("alloc", e.to_string());
            }
        }
        drop(state);

        let addr = self.addr_of(slot);
        if self.checked {
            if let Err(e) = self.mem_map.protect(addr, bytes, Protection::ReadWrite) {
                self.log.fatal(COMPONENT, "alloc", format!("mprotect failed: {e}"));
            }
        }
        let obj = ObjRef::from_addr(addr)?;
        self.bitmaps.set_live(obj);
        Some(Allocation::exact(obj, bytes))
    }

    fn checked_used_slot(&self, obj: ObjRef, event: &'static str) -> usize {
        let addr = obj.addr();
        if addr < self.begin || addr >= self.end || !is_aligned(addr - self.begin, FREE_LIST_ALIGNMENT)
        {
            self.corrupt(event, format!("{addr:#x} is not a slot of {}", self.name));
        }
        self.slot_of(addr)
    }

    fn is_used_run_start(&self, state: &FreeListState, slot: usize) -> bool {
        let info = state.infos[slot];
        slot < state.tail_start(self.num_slots) && !info.is_free() && info.align_size() > 0
    }

    /// Release `obj` and coalesce it with its free neighbours. Returns the bytes freed.
    pub fn free(&self, obj: ObjRef) -> usize {
        let slot = self.checked_used_slot(obj, "free");
        let bytes = {
            let state = self.state.lock();
            if self.is_used_run_start(&state, slot) {
                Some(state.infos[slot].byte_size())
            } else {
                None
            }
        };
        let Some(bytes) = bytes else {
            self.corrupt("free", format!("{:#x} is not an allocated object", obj.addr()));
        };

        let addr = obj.addr();
        if let Err(e) = self.mem_map.release_pages(addr, bytes) {
            self.log.fatal(COMPONENT, "free", format!("madvise failed: {e}"));
        }
        if self.checked {
            if let Err(e) = self.mem_map.protect(addr, bytes, Protection::Read) {
                self.log.fatal(COMPONENT, "free", format!("mprotect failed: {e}"));
            }
        }
        self.bitmaps.clear_live(obj);

        let mut state = self.state.lock();
        if !self.is_used_run_start(&state, slot) {
            drop(state);
            self.corrupt("free", format!("{:#x} was freed concurrently", obj.addr()));
        }
        let outcome = match self.coalesce_locked(&mut state, slot) {
            Ok(outcome) => outcome,
            Err(message) => {
                drop(state);
                self.corrupt("free", message);
            }
        };
        state.counters.on_free(bytes);
        if self.checked {
            if let Err(e) = self.verify_locked(&state) {
                drop(state);
                self.corrupt("free", e.to_string());
            }
        }
        drop(state);
        self.log.emit(
            LogEvent::new(HeapLogLevel::Trace, COMPONENT, "free")
                .addr(addr)
                .size(bytes)
                .outcome(outcome),
        );
        bytes
    }

    /// Turn the used run at `slot` into free space, merging neighbours.
    fn coalesce_locked(
        &self,
        state: &mut FreeListState,
        slot: usize,
    ) -> Result<&'static str, String> {
        let tail_start = state.tail_start(self.num_slots);
        let info = state.infos[slot];
        let mut start = slot;
        let mut run_units = info.align_size();
        let mut merged_prev = false;

        let prev = info.prev_free_units();
        if prev > 0 {
            let key = state.key_for(slot);
            if !state.free_runs.remove(&key) {
                return Err(format!("free run before slot {slot} is not indexed"));
            }
            start = slot - prev;
            run_units += prev;
            state.infos[slot] = AllocationInfo::default();
            merged_prev = true;
        }

        let next = slot + info.align_size();
        if next >= tail_start {
            if next != tail_start {
                return Err(format!("run at slot {slot} overlaps the tail at {tail_start}"));
            }
            state.free_end += run_units * FREE_LIST_ALIGNMENT;
            state.infos[start] = AllocationInfo::default();
            return Ok("merged_into_tail");
        }

        let next_info = state.infos[next];
        let following = if next_info.is_free() {
            let after = next + next_info.align_size();
            if after >= tail_start {
                return Err(format!("free run at slot {next} touches the tail"));
            }
            let key = state.key_for(after);
            if !state.free_runs.remove(&key) {
                return Err(format!("free run at slot {next} is not indexed"));
            }
            run_units += key.run_units;
            state.infos[next] = AllocationInfo::default();
            after
        } else {
            next
        };
        let merged_next = following != next;
        state.infos[following].set_prev_free_units(run_units);
        state.infos[start] = AllocationInfo::free_run(run_units);
        let key = state.key_for(following);
        state.free_runs.insert(key);
        Ok(match (merged_prev, merged_next) {
            (false, false) => "isolated",
            (true, false) => "merged_prev",
            (false, true) => "merged_next",
            (true, true) => "merged_both",
        })
    }

    /// Free every object in `objs`, returning the total bytes released.
    pub fn free_list(&self, objs: &[ObjRef]) -> usize {
        objs.iter().map(|&obj| self.free(obj)).sum()
    }

    /// `(bytes_allocated, usable_size)` of a live object.
    #[must_use]
    pub fn allocation_size(&self, obj: ObjRef) -> Option<(usize, usize)> {
        let addr = obj.addr();
        if addr < self.begin || addr >= self.end {
            return None;
        }
        let slot = self.slot_of(addr);
        let state = self.state.lock();
        if addr != self.addr_of(slot) || !self.is_used_run_start(&state, slot) {
            return None;
        }
        let bytes = state.infos[slot].byte_size();
        Some((bytes, bytes))
    }

    /// Whether `obj` predates the last zygote fork. Unknown objects abort.
    pub fn is_zygote_large_object(&self, obj: ObjRef) -> bool {
        let slot = self.checked_used_slot(obj, "is_zygote");
        let flag = {
            let state = self.state.lock();
            self.is_used_run_start(&state, slot)
                .then(|| state.infos[slot].is_zygote_object())
        };
        match flag {
            Some(is_zygote) => is_zygote,
            None => self.corrupt(
                "is_zygote",
                format!("{:#x} is not an allocated object", obj.addr()),
            ),
        }
    }

    pub fn set_all_large_objects_as_zygote_objects(&self, set_mark_bit: bool) {
        let mut state = self.state.lock();
        let tail_start = state.tail_start(self.num_slots);
        let mut slot = 0;
        while slot < tail_start {
            let units = state.infos[slot].align_size();
            if units == 0 {
                break;
            }
            if !state.infos[slot].is_free() {
                state.infos[slot].set_zygote_object();
                if set_mark_bit {
                    if let Some(obj) = ObjRef::from_addr(self.addr_of(slot)) {
                        self.bitmaps.set_marked(obj);
                    }
                }
            }
            slot += units;
        }
    }

    /// Every run below the tail, in address order.
    #[must_use]
    pub fn runs(&self) -> Vec<RunInfo> {
        let state = self.state.lock();
        self.runs_locked(&state)
    }

    fn runs_locked(&self, state: &FreeListState) -> Vec<RunInfo> {
        let tail_start = state.tail_start(self.num_slots);
        let mut runs = Vec::new();
        let mut slot = 0;
        while slot < tail_start {
            let info = state.infos[slot];
            if info.align_size() == 0 {
                break;
            }
            runs.push(RunInfo {
                addr: self.addr_of(slot),
                bytes: info.byte_size(),
                free: info.is_free(),
                zygote: info.is_zygote_object(),
            });
            slot += info.align_size();
        }
        runs
    }

    /// Visit `(start, end, bytes)` of every allocated object.
    pub fn walk(&self, mut callback: impl FnMut(usize, usize, usize)) {
        for run in self.runs().into_iter().filter(|r| !r.free) {
            callback(run.addr, run.addr + run.bytes, run.bytes);
        }
    }

    /// Size of the unbounded free extent at the end of the region.
    #[must_use]
    pub fn free_end(&self) -> usize {
        self.state.lock().free_end
    }

    /// Number of indexed (non-tail) free runs.
    #[must_use]
    pub fn free_run_count(&self) -> usize {
        self.state.lock().free_runs.len()
    }

    pub fn for_each_mem_map(&self, mut f: impl FnMut(&MemMap)) {
        f(&self.mem_map);
        let state = self.state.lock();
        f(&state.infos.map);
    }

    #[must_use]
    pub fn begin_end_atomic(&self) -> (usize, usize) {
        (self.begin, self.end)
    }

    #[must_use]
    pub fn counters(&self) -> SpaceCounters {
        self.state.lock().counters
    }

    #[must_use]
    pub fn bitmaps(&self) -> &ObjectBitmaps {
        &self.bitmaps
    }

    /// Audit the side table against the free-run index and counters.
    pub fn verify_invariants(&self) -> Result<(), HeapError> {
        let state = self.state.lock();
        self.verify_locked(&state)
    }

    fn verify_locked(&self, state: &FreeListState) -> Result<(), HeapError> {
        let fail = |message: String| Err(HeapError::invariant(&self.name, message));
        let tail_start = state.tail_start(self.num_slots);
        let mut expected = BTreeSet::new();
        let mut used_bytes = 0u64;
        let mut prev_free_units = 0;
        let mut slot = 0;
        while slot < tail_start {
            let info = state.infos[slot];
            let units = info.align_size();
            if units == 0 {
                return fail(format!("zero-length run at slot {slot}"));
            }
            if info.prev_free_units() != prev_free_units {
                return fail(format!(
                    "slot {slot} records {} preceding free units, expected {prev_free_units}",
                    info.prev_free_units()
                ));
            }
            if let Some(interior) =
                (slot + 1..(slot + units).min(tail_start)).find(|&s| state.infos[s] != AllocationInfo::default())
            {
                return fail(format!("interior slot {interior} of run at {slot} is not clear"));
            }
            if info.is_free() {
                if prev_free_units > 0 {
                    return fail(format!("adjacent free runs at slot {slot}"));
                }
                prev_free_units = units;
            } else {
                if prev_free_units > 0 {
                    expected.insert(FreeRunKey {
                        run_units: prev_free_units,
                        following_units: units,
                        following_slot: slot,
                    });
                }
                prev_free_units = 0;
                used_bytes += info.byte_size() as u64;
            }
            slot += units;
        }
        if slot != tail_start {
            return fail(format!("runs end at slot {slot}, tail starts at {tail_start}"));
        }
        if prev_free_units > 0 {
            return fail(format!("free run of {prev_free_units} units touches the tail"));
        }
        if expected != state.free_runs {
            return fail(format!(
                "free-run index has {} entries, side table implies {}",
                state.free_runs.len(),
                expected.len()
            ));
        }
        if used_bytes != state.counters.bytes_allocated {
            return fail(format!(
                "side table holds {used_bytes} used bytes, counters say {}",
                state.counters.bytes_allocated
            ));
        }
        Ok(())
    }
}

impl Space for FreeListSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.end
    }

    fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = format!(
            "{} begin={:#x} end={:#x} free_end={:#x} free_runs={} objects={} bytes={}\n",
            self.name,
            self.begin,
            self.end,
            state.free_end,
            state.free_runs.len(),
            state.counters.objects_allocated,
            state.counters.bytes_allocated,
        );
        for run in self.runs_locked(&state) {
            let kind = if run.free { "free run" } else { "object" };
            out.push_str(&format!(
                "  {kind} at {:#x} size {:#x}{}\n",
                run.addr,
                run.bytes,
                if run.zygote { " zygote" } else { "" }
            ));
        }
        if state.free_end > 0 {
            out.push_str(&format!(
                "  tail at {:#x} size {:#x}\n",
                self.end - state.free_end,
                state.free_end
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: usize = FREE_LIST_ALIGNMENT;

    fn space(slots: usize) -> FreeListSpace {
        FreeListSpace::create(
            "free-list",
            slots * P,
            VerifyLevel::Checked,
            Arc::new(HeapLog::new(HeapLogLevel::Trace, 1024)),
        )
        .expect("create space")
    }

    fn alloc(space: &FreeListSpace, bytes: usize) -> ObjRef {
        space.alloc(bytes).expect("fits").obj
    }

    #[test]
    fn test_info_bitfield() {
        let mut info = AllocationInfo::free_run(5);
        assert!(info.is_free());
        assert_eq!(info.align_size(), 5);
        assert_eq!(info.byte_size(), 5 * P);
        info.set_prev_free_units(3);
        assert_eq!(info.prev_free_units(), 3);
        let mut used = AllocationInfo::used(AllocationInfo::MAX_UNITS);
        used.set_zygote_object();
        assert!(used.is_zygote_object());
        assert!(!used.is_free());
        assert_eq!(used.align_size(), AllocationInfo::MAX_UNITS);
    }

    #[test]
    fn test_freed_middle_slot_is_reused_before_tail() {
        let space = space(3);
        let a = alloc(&space, P);
        let b = alloc(&space, P);
        let c = alloc(&space, P);
        assert_eq!(b.addr(), a.addr() + P);
        assert_eq!(c.addr(), a.addr() + 2 * P);
        assert_eq!(space.free_end(), 0);
        assert_eq!(space.free(b), P);
        assert_eq!(space.free_run_count(), 1);
        let d = alloc(&space, P);
        assert_eq!(d, b);
        assert_eq!(space.free_run_count(), 0);
        space.verify_invariants().expect("invariants");
    }

    #[test]
    fn test_free_next_to_tail_merges_into_tail() {
        let space = space(8);
        let a = alloc(&space, P);
        let b = alloc(&space, 2 * P);
        assert_eq!(space.free_end(), 5 * P);
        space.free(b);
        assert_eq!(space.free_end(), 7 * P);
        assert_eq!(space.free_run_count(), 0);
        space.free(a);
        assert_eq!(space.free_end(), 8 * P);
        assert!(space.runs().is_empty());
        space.verify_invariants().expect("invariants");
    }

    #[test]
    fn test_coalesces_both_neighbours() {
        let space = space(8);
        let objs: Vec<ObjRef> = (0..5).map(|_| alloc(&space, P)).collect();
        space.free(objs[1]);
        space.free(objs[3]);
        assert_eq!(space.free_run_count(), 2);
        space.free(objs[2]);
        assert_eq!(space.free_run_count(), 1);
        let runs = space.runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(
            runs[1],
            RunInfo {
                addr: objs[1].addr(),
                bytes: 3 * P,
                free: true,
                zygote: false
            }
        );
        space.verify_invariants().expect("invariants");
        let log = space.log.snapshot();
        assert!(log.iter().any(|r| r.event == "free" && r.outcome == "merged_both"));
    }

    #[test]
    fn test_best_fit_prefers_smallest_then_lowest_address() {
        let space = space(16);
        // Runs (units): [3 free][1 used][2 free][1 used][2 free][1 used] tail
        let big = alloc(&space, 3 * P);
        let _u1 = alloc(&space, P);
        let mid1 = alloc(&space, 2 * P);
        let _u2 = alloc(&space, P);
        let mid2 = alloc(&space, 2 * P);
        let _u3 = alloc(&space, P);
        space.free(big);
        space.free(mid2);
        space.free(mid1);
        assert_eq!(space.free_run_count(), 3);

        assert_eq!(alloc(&space, 2 * P), mid1, "lowest of the 2-unit runs");
        assert_eq!(alloc(&space, 2 * P), mid2);
        // Only the 3-unit run is left: carve its front.
        assert_eq!(alloc(&space, P), big);
        let runs = space.runs();
        assert_eq!(
            runs[1],
            RunInfo {
                addr: big.addr() + P,
                bytes: 2 * P,
                free: true,
                zygote: false
            }
        );
        space.verify_invariants().expect("invariants");
    }

    #[test]
    fn test_round_trip_returns_same_address() {
        let space = space(16);
        let _a = alloc(&space, P);
        let b = alloc(&space, 3 * P);
        let _c = alloc(&space, P);
        space.free(b);
        assert_eq!(alloc(&space, 3 * P), b);
    }

    #[test]
    fn test_oversized_request_fails_without_fatal() {
        let space = space(4);
        assert!(space.alloc(5 * P).is_none());
        assert!(space.alloc(usize::MAX).is_none());
        let _a = alloc(&space, 4 * P);
        assert!(space.alloc(1).is_none());
        assert!(space.log.count("alloc") >= 2);
    }

    #[test]
    fn test_reused_pages_are_zero_and_writable() {
        let space = space(4);
        let a = space.alloc(P).expect("fits");
        // SAFETY: the page belongs to a live allocation.
        unsafe { (a.obj.addr() as *mut u64).write(0xDEAD_BEEF) };
        space.free(a.obj);
        let b = space.alloc(P).expect("fits");
        assert_eq!(b.obj, a.obj);
        // SAFETY: re-allocated, re-protected read/write.
        unsafe {
            assert_eq!((b.obj.addr() as *const u64).read(), 0);
            (b.obj.addr() as *mut u64).write(1);
        }
    }

    #[test]
    fn test_zygote_and_allocation_size() {
        let space = space(8);
        let a = alloc(&space, P);
        let b = alloc(&space, 2 * P);
        space.set_all_large_objects_as_zygote_objects(true);
        let c = alloc(&space, P);
        assert!(space.is_zygote_large_object(a));
        assert!(space.is_zygote_large_object(b));
        assert!(!space.is_zygote_large_object(c));
        assert!(space.bitmaps().is_marked(b));
        assert_eq!(space.allocation_size(b), Some((2 * P, 2 * P)));
        assert_eq!(space.allocation_size(ObjRef::from_addr(b.addr() + P).expect("nz")), None);
        space.free(b);
        assert_eq!(space.allocation_size(b), None);
    }

    #[test]
    fn test_walk_and_dump() {
        let space = space(8);
        let a = alloc(&space, P);
        let b = alloc(&space, 2 * P);
        let c = alloc(&space, P);
        space.free(b);
        let mut seen = Vec::new();
        space.walk(|start, end, bytes| seen.push((start, end, bytes)));
        assert_eq!(
            seen,
            vec![(a.addr(), a.addr() + P, P), (c.addr(), c.addr() + P, P)]
        );
        let dump = space.dump();
        assert!(dump.contains("free run at"), "{dump}");
        assert!(dump.contains("tail at"), "{dump}");
        let mut maps = 0;
        space.for_each_mem_map(|_| maps += 1);
        assert_eq!(maps, 2);
    }

    #[test]
    #[should_panic(expected = "is not an allocated object")]
    fn test_double_free_is_fatal() {
        let space = space(4);
        let a = alloc(&space, P);
        let _b = alloc(&space, P);
        space.free(a);
        space.free(a);
    }

    #[test]
    #[should_panic(expected = "is not an allocated object")]
    fn test_free_of_interior_slot_is_fatal() {
        let space = space(4);
        let a = alloc(&space, 3 * P);
        space.free(ObjRef::from_addr(a.addr() + P).expect("nz"));
    }

    #[test]
    #[should_panic(expected = "is not a slot of")]
    fn test_free_outside_space_is_fatal() {
        let space = space(4);
        space.free(ObjRef::from_addr(space.end() + P).expect("nz"));
    }

    #[test]
    fn test_rejects_unaligned_capacity() {
        let log = Arc::new(HeapLog::default());
        assert!(FreeListSpace::create("bad", P + 1, VerifyLevel::Fast, log.clone()).is_err());
        assert!(FreeListSpace::create("bad", 0, VerifyLevel::Fast, log).is_err());
    }
}
