//! Allocation spaces.
//!
//! A space owns address range(s) and hands out objects from them:
//!
//! - [`bump_pointer::BumpPointerRegion`]: contiguous cursor-bump region with
//!   thread-local buffer carving.
//! - [`large_object::LargeObjectSpace`]: either a per-object mapping space
//!   ([`map::LargeObjectMapSpace`]) or a best-fit free list
//!   ([`free_list::FreeListSpace`]).
//! - [`size_class::SizeClassSpace`]: default small-object allocator.

pub mod bump_pointer;
pub mod free_list;
pub mod large_object;
pub mod map;
pub mod size_class;

use crate::object::ObjRef;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;

/// Result of a successful allocation primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub obj: ObjRef,
    /// Accounted cost of this object.
    pub bytes_allocated: usize,
    /// Bytes the object may use; at least `bytes_allocated` unless guard pages shrink it.
    pub usable_size: usize,
    /// Bytes newly taken from the global footprint (zero when reusing a thread-local buffer).
    /// TLAB refills report it but are already charged by the dispatcher.
    pub bytes_tl_bulk_allocated: usize,
}

impl Allocation {
    pub(crate) fn exact(obj: ObjRef, bytes: usize) -> Self {
        Self {
            obj,
            bytes_allocated: bytes,
            usable_size: bytes,
            bytes_tl_bulk_allocated: bytes,
        }
    }
}

/// Objects and bytes, as freed by a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectBytePair {
    pub objects: u64,
    pub bytes: u64,
}

impl std::ops::AddAssign for ObjectBytePair {
    fn add_assign(&mut self, rhs: Self) {
        self.objects += rhs.objects;
        self.bytes += rhs.bytes;
    }
}

/// Common surface of every space.
pub trait Space {
    fn name(&self) -> &str;

    /// Start of the occupied extent.
    fn begin(&self) -> usize;

    /// End of the occupied extent.
    fn end(&self) -> usize;

    fn capacity(&self) -> usize {
        self.end() - self.begin()
    }

    fn contains(&self, addr: usize) -> bool {
        self.begin() <= addr && addr < self.end()
    }

    /// Human-readable description of the space and its occupancy.
    fn dump(&self) -> String;
}

/// Current and lifetime allocation counters of a space.
///
/// Always mutated under the owning space's lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceCounters {
    pub bytes_allocated: u64,
    pub objects_allocated: u64,
    pub total_bytes_allocated: u64,
    pub total_objects_allocated: u64,
}

impl SpaceCounters {
    pub(crate) fn on_alloc(&mut self, bytes: usize) {
        self.bytes_allocated += bytes as u64;
        self.objects_allocated += 1;
        self.total_bytes_allocated += bytes as u64;
        self.total_objects_allocated += 1;
    }

    pub(crate) fn on_free(&mut self, bytes: usize) {
        debug_assert!(self.bytes_allocated >= bytes as u64);
        debug_assert!(self.objects_allocated > 0);
        self.bytes_allocated -= bytes as u64;
        self.objects_allocated -= 1;
    }
}

#[derive(Debug, Default)]
struct BitmapPair {
    live: BTreeSet<ObjRef>,
    mark: BTreeSet<ObjRef>,
}

/// Live and mark sets of a discontiguous or sparsely populated space.
///
/// The allocator records every new object as live; the collector fills the
/// mark set and then sweeps live-but-unmarked objects.
#[derive(Debug, Default)]
pub struct ObjectBitmaps {
    inner: Mutex<BitmapPair>,
}

impl ObjectBitmaps {
    pub fn set_live(&self, obj: ObjRef) {
        self.inner.lock().live.insert(obj);
    }

    pub fn clear_live(&self, obj: ObjRef) {
        self.inner.lock().live.remove(&obj);
    }

    pub fn set_marked(&self, obj: ObjRef) {
        self.inner.lock().mark.insert(obj);
    }

    #[must_use]
    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.inner.lock().live.contains(&obj)
    }

    #[must_use]
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        self.inner.lock().mark.contains(&obj)
    }

    pub fn clear_marks(&self) {
        self.inner.lock().mark.clear();
    }

    /// Exchange the roles of the live and mark sets.
    pub fn swap(&self) {
        let mut inner = self.inner.lock();
        let BitmapPair { live, mark } = &mut *inner;
        std::mem::swap(live, mark);
    }

    /// Make the mark set a copy of the live set.
    pub fn copy_live_to_marked(&self) {
        let mut inner = self.inner.lock();
        inner.mark = inner.live.clone();
    }

    /// Objects in `[begin, end)` that are live but not marked. With `swapped`,
    /// the two sets trade roles first, as the collector will swap them after
    /// the sweep.
    pub(crate) fn garbage(&self, swapped: bool, begin: usize, end: usize) -> Vec<ObjRef> {
        let inner = self.inner.lock();
        let (live, mark) = if swapped {
            (&inner.mark, &inner.live)
        } else {
            (&inner.live, &inner.mark)
        };
        live.iter()
            .filter(|obj| obj.addr() >= begin && obj.addr() < end && !mark.contains(obj))
            .copied()
            .collect()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjRef {
        ObjRef::from_addr(addr).expect("nonzero")
    }

    #[test]
    fn test_garbage_is_live_minus_marked() {
        let bitmaps = ObjectBitmaps::default();
        for a in [0x1000, 0x2000, 0x3000] {
            bitmaps.set_live(obj(a));
        }
        bitmaps.set_marked(obj(0x2000));
        assert_eq!(
            bitmaps.garbage(false, 0, usize::MAX),
            vec![obj(0x1000), obj(0x3000)]
        );
        assert_eq!(bitmaps.garbage(false, 0x1800, 0x3000), Vec::<ObjRef>::new());
    }

    #[test]
    fn test_swap_and_copy() {
        let bitmaps = ObjectBitmaps::default();
        bitmaps.set_live(obj(0x1000));
        bitmaps.copy_live_to_marked();
        assert!(bitmaps.is_marked(obj(0x1000)));
        bitmaps.clear_marks();
        bitmaps.swap();
        assert!(bitmaps.is_marked(obj(0x1000)));
        assert!(!bitmaps.is_live(obj(0x1000)));
        // Swapped view: marked set acts as live.
        assert_eq!(bitmaps.garbage(true, 0, usize::MAX), vec![obj(0x1000)]);
    }

    #[test]
    fn test_counters() {
        let mut c = SpaceCounters::default();
        c.on_alloc(4096);
        c.on_alloc(8192);
        c.on_free(4096);
        assert_eq!(c.bytes_allocated, 8192);
        assert_eq!(c.objects_allocated, 1);
        assert_eq!(c.total_bytes_allocated, 12288);
        assert_eq!(c.total_objects_allocated, 2);
    }
}
