//! Allocator selection.
//!
//! [`AllocatorDispatcher::try_allocate`] routes a request to the space owned
//! by an [`AllocatorKind`] and reports the same three numbers for every
//! strategy: the object's accounted cost, its usable size, and the bytes newly
//! taken from the global footprint.

use crate::footprint::FootprintController;
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::mutator::Mutator;
use crate::object::ObjRef;
use crate::os::round_up;
use crate::space::bump_pointer::{BUMP_ALIGNMENT, BumpPointerRegion, ThreadLocalBuffer};
use crate::space::large_object::LargeObjectSpace;
use crate::space::{Allocation, SpaceCounters};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const COMPONENT: &str = "dispatch";

/// Allocation strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum AllocatorKind {
    /// Shared cursor of the bump-pointer region.
    BumpPointer = 0,
    /// Mutator-private buffer carved from the bump-pointer region.
    Tlab = 1,
    RosAlloc = 2,
    DlMalloc = 3,
    NonMoving = 4,
    LargeObject = 5,
}

impl AllocatorKind {
    pub const ALL: [Self; 6] = [
        Self::BumpPointer,
        Self::Tlab,
        Self::RosAlloc,
        Self::DlMalloc,
        Self::NonMoving,
        Self::LargeObject,
    ];

    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "bump-pointer" | "bump" => Some(Self::BumpPointer),
            "tlab" => Some(Self::Tlab),
            "ros-alloc" | "rosalloc" => Some(Self::RosAlloc),
            "dl-malloc" | "dlmalloc" => Some(Self::DlMalloc),
            "non-moving" | "nonmoving" => Some(Self::NonMoving),
            "large-object" | "los" => Some(Self::LargeObject),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BumpPointer => "bump-pointer",
            Self::Tlab => "tlab",
            Self::RosAlloc => "ros-alloc",
            Self::DlMalloc => "dl-malloc",
            Self::NonMoving => "non-moving",
            Self::LargeObject => "large-object",
        }
    }

    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::BumpPointer),
            1 => Some(Self::Tlab),
            2 => Some(Self::RosAlloc),
            3 => Some(Self::DlMalloc),
            4 => Some(Self::NonMoving),
            5 => Some(Self::LargeObject),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_tlab(self) -> bool {
        matches!(self, Self::Tlab)
    }

    /// Performs its own footprint check inside the dispatcher.
    #[must_use]
    pub const fn manages_own_growth_check(self) -> bool {
        matches!(self, Self::Tlab | Self::RosAlloc)
    }

    /// Runs alongside a concurrent collector.
    #[must_use]
    pub const fn may_have_concurrent_gc(self) -> bool {
        !matches!(self, Self::BumpPointer | Self::Tlab)
    }

    /// New objects are recorded on the allocation stack.
    #[must_use]
    pub const fn has_allocation_stack(self) -> bool {
        !matches!(self, Self::BumpPointer | Self::Tlab)
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pluggable small-object allocator.
pub trait SmallObjectAllocator: Send + Sync {
    fn name(&self) -> &str;

    fn alloc(&self, num_bytes: usize) -> Option<Allocation>;

    /// Serve from state the calling thread can reach without blocking.
    fn alloc_thread_local(&self, _num_bytes: usize) -> Option<Allocation> {
        None
    }

    /// Upper bound on the bytes `alloc(num_bytes)` may take from the footprint.
    fn max_bytes_bulk_allocated_for(&self, num_bytes: usize) -> usize {
        num_bytes
    }

    /// Release `obj`; returns its accounted size. Unknown objects abort.
    fn free(&self, obj: ObjRef) -> usize;

    fn allocation_size(&self, obj: ObjRef) -> Option<usize>;

    fn counters(&self) -> SpaceCounters;

    fn contains(&self, addr: usize) -> bool;

    fn dump(&self) -> String;
}

/// Routes requests to the space owning each [`AllocatorKind`].
pub struct AllocatorDispatcher {
    footprint: Arc<FootprintController>,
    bump: Option<BumpPointerRegion>,
    large_objects: Option<LargeObjectSpace>,
    ros_alloc: Option<Arc<dyn SmallObjectAllocator>>,
    dl_malloc: Option<Arc<dyn SmallObjectAllocator>>,
    non_moving: Option<Arc<dyn SmallObjectAllocator>>,
    tlab_size: usize,
    log: Arc<HeapLog>,
}

impl AllocatorDispatcher {
    #[must_use]
    pub fn new(footprint: Arc<FootprintController>, tlab_size: usize, log: Arc<HeapLog>) -> Self {
        Self {
            footprint,
            bump: None,
            large_objects: None,
            ros_alloc: None,
            dl_malloc: None,
            non_moving: None,
            tlab_size,
            log,
        }
    }

    #[must_use]
    pub fn with_bump_pointer_region(mut self, region: BumpPointerRegion) -> Self {
        self.bump = Some(region);
        self
    }

    #[must_use]
    pub fn with_large_object_space(mut self, space: LargeObjectSpace) -> Self {
        self.large_objects = Some(space);
        self
    }

    /// Install `allocator` for one of the small-object kinds. Other kinds are ignored.
    #[must_use]
    pub fn with_small_allocator(
        mut self,
        kind: AllocatorKind,
        allocator: Arc<dyn SmallObjectAllocator>,
    ) -> Self {
        match kind {
            AllocatorKind::RosAlloc => self.ros_alloc = Some(allocator),
            AllocatorKind::DlMalloc => self.dl_malloc = Some(allocator),
            AllocatorKind::NonMoving => self.non_moving = Some(allocator),
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn bump_pointer_region(&self) -> Option<&BumpPointerRegion> {
        self.bump.as_ref()
    }

    #[must_use]
    pub fn large_object_space(&self) -> Option<&LargeObjectSpace> {
        self.large_objects.as_ref()
    }

    #[must_use]
    pub fn small_allocator(&self, kind: AllocatorKind) -> Option<&Arc<dyn SmallObjectAllocator>> {
        match kind {
            AllocatorKind::RosAlloc => self.ros_alloc.as_ref(),
            AllocatorKind::DlMalloc => self.dl_malloc.as_ref(),
            AllocatorKind::NonMoving => self.non_moving.as_ref(),
            _ => None,
        }
    }

    /// Whether a space backs `kind`.
    #[must_use]
    pub fn supports(&self, kind: AllocatorKind) -> bool {
        match kind {
            AllocatorKind::BumpPointer | AllocatorKind::Tlab => self.bump.is_some(),
            AllocatorKind::LargeObject => self.large_objects.is_some(),
            _ => self.small_allocator(kind).is_some(),
        }
    }

    /// Every distinct small-object allocator, in kind order.
    pub(crate) fn small_allocators(&self) -> Vec<(AllocatorKind, &Arc<dyn SmallObjectAllocator>)> {
        let mut out: Vec<(AllocatorKind, &Arc<dyn SmallObjectAllocator>)> = Vec::new();
        for kind in [
            AllocatorKind::RosAlloc,
            AllocatorKind::DlMalloc,
            AllocatorKind::NonMoving,
        ] {
            if let Some(alloc) = self.small_allocator(kind) {
                if !out.iter().any(|(_, seen)| Arc::ptr_eq(seen, alloc)) {
                    out.push((kind, alloc));
                }
            }
        }
        out
    }

    fn missing(&self, kind: AllocatorKind) -> ! {
        self.log.fatal(
            COMPONENT,
            "try_allocate",
            format!("no space configured for the {kind} allocator"),
        )
    }

    fn region(&self, kind: AllocatorKind) -> &BumpPointerRegion {
        match &self.bump {
            Some(region) => region,
            None => self.missing(kind),
        }
    }

    fn small(&self, kind: AllocatorKind) -> &Arc<dyn SmallObjectAllocator> {
        match self.small_allocator(kind) {
            Some(alloc) => alloc,
            None => self.missing(kind),
        }
    }

    /// One allocation attempt with `kind`. `None` on refusal; never collects.
    pub fn try_allocate(
        &self,
        mutator: &Mutator,
        kind: AllocatorKind,
        alloc_size: usize,
        grow: bool,
    ) -> Option<Allocation> {
        if !kind.manages_own_growth_check()
            && self.footprint.is_out_of_memory_on_allocation(kind, alloc_size, grow)
        {
            return None;
        }
        match kind {
            AllocatorKind::BumpPointer => {
                let rounded = round_up(alloc_size, BUMP_ALIGNMENT);
                let obj = self.region(kind).alloc_nonvirtual(rounded)?;
                Some(Allocation::exact(obj, rounded))
            }
            AllocatorKind::Tlab => self.alloc_tlab(mutator, alloc_size, grow),
            AllocatorKind::RosAlloc => {
                let alloc = self.small(kind);
                let max_bulk = alloc.max_bytes_bulk_allocated_for(alloc_size);
                if self.footprint.is_out_of_memory_on_allocation(kind, max_bulk, grow) {
                    return None;
                }
                alloc.alloc(alloc_size)
            }
            AllocatorKind::DlMalloc | AllocatorKind::NonMoving => self.small(kind).alloc(alloc_size),
            AllocatorKind::LargeObject => match &self.large_objects {
                Some(space) => space.alloc(alloc_size),
                None => self.missing(kind),
            },
        }
    }

    /// Thread-local fast path of a small-object allocator, if it has one.
    ///
    /// Reused chunks are charged to the footprint like fresh ones, so the
    /// growth check runs first, without growing.
    pub fn try_allocate_thread_local(
        &self,
        kind: AllocatorKind,
        alloc_size: usize,
    ) -> Option<Allocation> {
        let alloc = self.small_allocator(kind)?;
        let max_bulk = alloc.max_bytes_bulk_allocated_for(alloc_size);
        if self.footprint.is_out_of_memory_on_allocation(kind, max_bulk, false) {
            return None;
        }
        alloc.alloc_thread_local(alloc_size)
    }

    fn alloc_tlab(&self, mutator: &Mutator, alloc_size: usize, grow: bool) -> Option<Allocation> {
        let kind = AllocatorKind::Tlab;
        let region = self.region(kind);
        let rounded = round_up(alloc_size, BUMP_ALIGNMENT);
        let mut tlab = mutator.shared().tlab.lock();
        if rounded <= tlab.remaining() {
            let obj = tlab.bump(rounded)?;
            return Some(Allocation {
                obj,
                bytes_allocated: rounded,
                usable_size: rounded,
                bytes_tl_bulk_allocated: 0,
            });
        }
        let new_tlab_size = rounded.checked_add(self.tlab_size)?;
        if self.footprint.is_out_of_memory_on_allocation(kind, new_tlab_size, grow) {
            return None;
        }
        self.revoke_tlab(region, &mut tlab);
        if !region.alloc_new_tlab(&mut tlab, new_tlab_size) {
            self.log.emit(
                LogEvent::new(HeapLogLevel::Debug, COMPONENT, "new_tlab")
                    .size(new_tlab_size)
                    .outcome("region_full"),
            );
            return None;
        }
        // Charged while the buffer is still locked: a revoke may follow at once.
        self.footprint.record_bulk_allocation(new_tlab_size);
        let obj = tlab.bump(rounded)?;
        Some(Allocation {
            obj,
            bytes_allocated: rounded,
            usable_size: rounded,
            bytes_tl_bulk_allocated: new_tlab_size,
        })
    }

    /// Retire `tlab`, returning its unused tail to the footprint.
    fn revoke_tlab(&self, region: &BumpPointerRegion, tlab: &mut ThreadLocalBuffer) -> usize {
        let unused = tlab.remaining();
        let used = region.revoke_thread_local_buffer(tlab);
        if unused > 0 {
            self.footprint.record_free(unused);
        }
        used
    }

    /// Retire a mutator's buffer; no-op without a bump-pointer region.
    pub(crate) fn revoke_thread_local_buffer(&self, tlab: &mut ThreadLocalBuffer) -> usize {
        match &self.bump {
            Some(region) => self.revoke_tlab(region, tlab),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::space::map::LargeObjectMapSpace;
    use crate::space::size_class::SizeClassSpace;

    const KIB: usize = 1024;

    fn dispatcher(target: usize, limit: usize, concurrent_gc: bool) -> AllocatorDispatcher {
        let log = Arc::new(HeapLog::default());
        let config = HeapConfig {
            initial_target_footprint: target,
            growth_limit: limit,
            concurrent_gc,
            ..HeapConfig::default()
        };
        let footprint = Arc::new(FootprintController::new(&config, log.clone()));
        let small: Arc<dyn SmallObjectAllocator> =
            Arc::new(SizeClassSpace::create("small", 256 * KIB, log.clone()).expect("small"));
        AllocatorDispatcher::new(footprint, 4 * KIB, log.clone())
            .with_bump_pointer_region(
                BumpPointerRegion::create("bump", 256 * KIB, log.clone()).expect("bump"),
            )
            .with_large_object_space(LargeObjectSpace::Map(LargeObjectMapSpace::new("los", log)))
            .with_small_allocator(AllocatorKind::RosAlloc, small.clone())
            .with_small_allocator(AllocatorKind::DlMalloc, small)
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in AllocatorKind::ALL {
            assert_eq!(AllocatorKind::from_str_loose(kind.as_str()), Some(kind));
            assert_eq!(AllocatorKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(AllocatorKind::from_str_loose("RosAlloc"), Some(AllocatorKind::RosAlloc));
        assert_eq!(AllocatorKind::from_u8(6), None);
        assert_eq!(AllocatorKind::LargeObject.to_string(), "large-object");
    }

    #[test]
    fn test_kind_predicates() {
        assert!(AllocatorKind::Tlab.manages_own_growth_check());
        assert!(AllocatorKind::RosAlloc.manages_own_growth_check());
        assert!(!AllocatorKind::BumpPointer.manages_own_growth_check());
        assert!(!AllocatorKind::Tlab.may_have_concurrent_gc());
        assert!(AllocatorKind::LargeObject.has_allocation_stack());
        assert!(!AllocatorKind::BumpPointer.has_allocation_stack());
    }

    #[test]
    fn test_bump_pointer_rounds_to_quantum() {
        let d = dispatcher(1 << 20, 1 << 20, false);
        let m = Mutator::new(1);
        let a = d.try_allocate(&m, AllocatorKind::BumpPointer, 20, false).expect("fits");
        assert_eq!(a.bytes_allocated, 24);
        assert_eq!(a.bytes_tl_bulk_allocated, 24);
        let b = d.try_allocate(&m, AllocatorKind::BumpPointer, 8, false).expect("fits");
        assert_eq!(b.obj.addr(), a.obj.addr() + 24);
    }

    #[test]
    fn test_tlab_bulk_only_on_refill() {
        let d = dispatcher(1 << 20, 1 << 20, false);
        let m = Mutator::new(1);
        let first = d.try_allocate(&m, AllocatorKind::Tlab, 32, false).expect("refill");
        assert_eq!(first.bytes_tl_bulk_allocated, 32 + 4 * KIB);
        assert_eq!(d.footprint.bytes_allocated(), 32 + 4 * KIB);
        let second = d.try_allocate(&m, AllocatorKind::Tlab, 32, false).expect("fast path");
        assert_eq!(second.bytes_tl_bulk_allocated, 0);
        assert_eq!(second.obj.addr(), first.obj.addr() + 32);
        let region = d.bump_pointer_region().expect("region");
        assert_eq!(region.num_blocks(), 1);
        assert_eq!(region.objects_allocated(), 0);
        assert_eq!(d.revoke_thread_local_buffer(&mut m.shared().tlab.lock()), 64);
        assert_eq!(region.objects_allocated(), 2);
        assert_eq!(d.footprint.bytes_allocated(), 64);
    }

    #[test]
    fn test_revoke_right_after_refill_returns_only_the_charged_tail() {
        let d = dispatcher(1 << 20, 1 << 20, false);
        let m = Mutator::new(1);
        d.try_allocate(&m, AllocatorKind::Tlab, 48, false).expect("refill");
        // A collector revoking before the front end finishes the object.
        let used = d.revoke_thread_local_buffer(&mut m.shared().tlab.lock());
        assert_eq!(used, 48);
        assert_eq!(d.footprint.bytes_allocated(), 48);
        assert_eq!(d.revoke_thread_local_buffer(&mut m.shared().tlab.lock()), 0);
        assert_eq!(d.footprint.bytes_allocated(), 48);
    }

    #[test]
    fn test_footprint_refusal_touches_no_space() {
        let d = dispatcher(4 * KIB, 8 * KIB, false);
        let m = Mutator::new(1);
        assert!(d.try_allocate(&m, AllocatorKind::DlMalloc, 6 * KIB, false).is_none());
        assert_eq!(d.small_allocator(AllocatorKind::DlMalloc).expect("dl").counters().objects_allocated, 0);
        assert!(d.try_allocate(&m, AllocatorKind::LargeObject, 16 * KIB, true).is_none());
        let a = d.try_allocate(&m, AllocatorKind::DlMalloc, 6 * KIB, true).expect("grown");
        assert_eq!(a.bytes_allocated, 6 * KIB);
    }

    #[test]
    fn test_ros_alloc_checks_rounded_bulk_size() {
        let d = dispatcher(4 * KIB, 8 * KIB, false);
        let m = Mutator::new(1);
        // 4000 rounds to the 4096 class, which fits the target exactly.
        assert!(d.try_allocate(&m, AllocatorKind::RosAlloc, 4000, false).is_some());
        d.footprint.record_bulk_allocation(4 * KIB);
        assert!(d.try_allocate(&m, AllocatorKind::RosAlloc, 4000, false).is_none());
    }

    #[test]
    fn test_shared_small_allocator_listed_once() {
        let d = dispatcher(1 << 20, 1 << 20, false);
        let listed = d.small_allocators();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, AllocatorKind::RosAlloc);
        assert!(!d.supports(AllocatorKind::NonMoving));
        assert!(d.supports(AllocatorKind::Tlab));
    }

    #[test]
    #[should_panic(expected = "no space configured for the non-moving allocator")]
    fn test_missing_space_is_fatal() {
        let d = dispatcher(1 << 20, 1 << 20, false);
        let m = Mutator::new(1);
        let _ = d.try_allocate(&m, AllocatorKind::NonMoving, 16, false);
    }
}
