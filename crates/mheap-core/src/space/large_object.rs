//! The heap's large-object space: one of two fixed implementations.

use crate::object::ObjRef;
use crate::os::MemMap;
use crate::space::free_list::FreeListSpace;
use crate::space::map::LargeObjectMapSpace;
use crate::space::{Allocation, ObjectBitmaps, ObjectBytePair, Space, SpaceCounters};

/// Large-object space selected at heap construction.
pub enum LargeObjectSpace {
    Map(LargeObjectMapSpace),
    FreeList(FreeListSpace),
}

macro_rules! delegate {
    ($self:expr, $space:ident => $body:expr) => {
        match $self {
            LargeObjectSpace::Map($space) => $body,
            LargeObjectSpace::FreeList($space) => $body,
        }
    };
}

impl LargeObjectSpace {
    pub fn alloc(&self, n: usize) -> Option<Allocation> {
        delegate!(self, s => s.alloc(n))
    }

    /// Release one object; fatal if it is not allocated here.
    pub fn free(&self, obj: ObjRef) -> usize {
        delegate!(self, s => s.free(obj))
    }

    pub fn free_list(&self, objs: &[ObjRef]) -> usize {
        objs.iter().map(|&obj| self.free(obj)).sum()
    }

    #[must_use]
    pub fn allocation_size(&self, obj: ObjRef) -> Option<(usize, usize)> {
        delegate!(self, s => s.allocation_size(obj))
    }

    pub fn is_zygote_large_object(&self, obj: ObjRef) -> bool {
        delegate!(self, s => s.is_zygote_large_object(obj))
    }

    pub fn set_all_large_objects_as_zygote_objects(&self, set_mark_bit: bool) {
        delegate!(self, s => s.set_all_large_objects_as_zygote_objects(set_mark_bit))
    }

    pub fn walk(&self, callback: impl FnMut(usize, usize, usize)) {
        delegate!(self, s => s.walk(callback))
    }

    pub fn for_each_mem_map(&self, f: impl FnMut(&MemMap)) {
        delegate!(self, s => s.for_each_mem_map(f))
    }

    #[must_use]
    pub fn begin_end_atomic(&self) -> (usize, usize) {
        delegate!(self, s => s.begin_end_atomic())
    }

    #[must_use]
    pub fn counters(&self) -> SpaceCounters {
        delegate!(self, s => s.counters())
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.counters().bytes_allocated
    }

    #[must_use]
    pub fn objects_allocated(&self) -> u64 {
        self.counters().objects_allocated
    }

    #[must_use]
    pub fn bitmaps(&self) -> &ObjectBitmaps {
        delegate!(self, s => s.bitmaps())
    }

    pub fn swap_bitmaps(&self) {
        self.bitmaps().swap();
    }

    pub fn copy_live_to_marked(&self) {
        self.bitmaps().copy_live_to_marked();
    }

    /// Free every live object the collector did not mark.
    ///
    /// Zygote objects are shared with the parent process and always survive.
    /// With `swap_bitmaps`, the sets are read in swapped roles because the
    /// collector swaps them after sweeping; otherwise freed objects are also
    /// dropped from the live set.
    pub fn sweep(&self, swap_bitmaps: bool) -> ObjectBytePair {
        let (begin, end) = self.begin_end_atomic();
        if begin >= end {
            return ObjectBytePair::default();
        }
        let garbage: Vec<ObjRef> = self
            .bitmaps()
            .garbage(swap_bitmaps, begin, end)
            .into_iter()
            .filter(|&obj| !self.is_zygote_large_object(obj))
            .collect();
        if !swap_bitmaps {
            for &obj in &garbage {
                self.bitmaps().clear_live(obj);
            }
        }
        let bytes = self.free_list(&garbage);
        ObjectBytePair {
            objects: garbage.len() as u64,
            bytes: bytes as u64,
        }
    }

    #[must_use]
    pub fn as_space(&self) -> &dyn Space {
        delegate!(self, s => s as &dyn Space)
    }
}

impl Space for LargeObjectSpace {
    fn name(&self) -> &str {
        delegate!(self, s => s.name())
    }

    fn begin(&self) -> usize {
        delegate!(self, s => s.begin())
    }

    fn end(&self) -> usize {
        delegate!(self, s => s.end())
    }

    fn dump(&self) -> String {
        let body = delegate!(self, s => s.dump());
        format!("{}\nlive set: {}", body.trim_end(), self.bitmaps().live_count())
    }
}
