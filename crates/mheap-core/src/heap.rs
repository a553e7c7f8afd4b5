//! The allocation front end.
//!
//! [`Heap::alloc_object`] turns a request into a constructed, published
//! object:
//!
//! 1. check preconditions and run the listener's pre-allocation hook;
//! 2. send large primitive arrays and strings to the large-object space;
//! 3. dispatch, falling back to collector-assisted retries;
//! 4. construct the object, charge the footprint, record it on the
//!    allocation stack and, if the concurrent threshold was crossed, ask the
//!    collector for a background collection.
//!
//! A collection may change the active allocator or instrumentation. The
//! request then restarts from step 1, a bounded number of times.

#![allow(unsafe_code)]

use crate::collector::{AllocationStack, Collector, GcCause, GcKind, NoopCollector};
use crate::config::{HeapConfig, LargeObjectSpaceKind};
use crate::dispatch::{AllocatorDispatcher, AllocatorKind, SmallObjectAllocator};
use crate::error::{AllocError, HeapError};
use crate::footprint::FootprintController;
use crate::listener::{
    AllocationListener, AllocationRecords, GlobalStats, NoPaging, PagingHooks, RuntimeStats,
};
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::mutator::{Mutator, MutatorShared, MutatorState};
use crate::object::{HEADER_SIZE, ObjRef, TypeDescriptor, install_header};
use crate::os::round_up;
use crate::space::bump_pointer::{BUMP_ALIGNMENT, BumpPointerRegion};
use crate::space::free_list::FreeListSpace;
use crate::space::large_object::LargeObjectSpace;
use crate::space::map::LargeObjectMapSpace;
use crate::space::size_class::SizeClassSpace;
use crate::space::{Allocation, ObjectBytePair, Space};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering, fence};
use std::sync::{Arc, Weak};

const COMPONENT: &str = "front-end";

const BUMP_SPACE_NAME: &str = "mheap bump region";
const LARGE_OBJECT_SPACE_NAME: &str = "mheap large objects";
const MAIN_SPACE_NAME: &str = "mheap small objects";
const NON_MOVING_SPACE_NAME: &str = "mheap non-moving objects";

enum Attempt {
    Done(Allocation),
    /// Allocator or instrumentation changed during a collection.
    Restart,
    Failed(AllocError),
}

/// Assembles a [`Heap`] from a configuration and optional collaborators.
#[must_use]
pub struct HeapBuilder {
    config: HeapConfig,
    log: Option<Arc<HeapLog>>,
    collector: Option<Arc<dyn Collector>>,
    paging: Option<Arc<dyn PagingHooks>>,
    small_allocators: Vec<(AllocatorKind, Arc<dyn SmallObjectAllocator>)>,
}

impl HeapBuilder {
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            log: None,
            collector: None,
            paging: None,
            small_allocators: Vec::new(),
        }
    }

    /// Share an existing log sink instead of creating one from the config.
    pub fn log(mut self, log: Arc<HeapLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn paging(mut self, paging: Arc<dyn PagingHooks>) -> Self {
        self.paging = Some(paging);
        self
    }

    /// Replace the built-in size-class space for `kind`.
    pub fn small_allocator(
        mut self,
        kind: AllocatorKind,
        allocator: Arc<dyn SmallObjectAllocator>,
    ) -> Self {
        self.small_allocators.push((kind, allocator));
        self
    }

    pub fn build(self) -> Result<Arc<Heap>, HeapError> {
        let Self {
            config,
            log,
            collector,
            paging,
            mut small_allocators,
        } = self;
        config.validate()?;
        let log =
            log.unwrap_or_else(|| Arc::new(HeapLog::new(config.log_level, config.log_capacity)));
        let footprint = Arc::new(FootprintController::new(&config, log.clone()));
        let mut dispatcher =
            AllocatorDispatcher::new(footprint.clone(), config.tlab_size, log.clone());

        if config.bump_pointer_capacity > 0 {
            let capacity = round_up(config.bump_pointer_capacity, BUMP_ALIGNMENT);
            dispatcher = dispatcher.with_bump_pointer_region(BumpPointerRegion::create(
                BUMP_SPACE_NAME,
                capacity,
                log.clone(),
            )?);
        }

        let large_objects = match config.large_object_space {
            LargeObjectSpaceKind::Disabled => None,
            LargeObjectSpaceKind::Map if config.guard_large_objects => Some(LargeObjectSpace::Map(
                LargeObjectMapSpace::with_guard_pages(LARGE_OBJECT_SPACE_NAME, log.clone()),
            )),
            LargeObjectSpaceKind::Map => Some(LargeObjectSpace::Map(LargeObjectMapSpace::new(
                LARGE_OBJECT_SPACE_NAME,
                log.clone(),
            ))),
            LargeObjectSpaceKind::FreeList => Some(LargeObjectSpace::FreeList(FreeListSpace::create(
                LARGE_OBJECT_SPACE_NAME,
                config.large_object_space_capacity,
                config.verify,
                log.clone(),
            )?)),
        };
        if let Some(space) = large_objects {
            dispatcher = dispatcher.with_large_object_space(space);
        }

        if config.small_object_capacity > 0 {
            let supplied = |kinds: &[(AllocatorKind, Arc<dyn SmallObjectAllocator>)],
                            kind: AllocatorKind| {
                kinds.iter().any(|(k, _)| *k == kind)
            };
            let missing_main: Vec<AllocatorKind> = [AllocatorKind::RosAlloc, AllocatorKind::DlMalloc]
                .into_iter()
                .filter(|&kind| !supplied(&small_allocators, kind))
                .collect();
            if !missing_main.is_empty() {
                let main: Arc<dyn SmallObjectAllocator> = Arc::new(SizeClassSpace::create(
                    MAIN_SPACE_NAME,
                    config.small_object_capacity,
                    log.clone(),
                )?);
                for kind in missing_main {
                    small_allocators.push((kind, main.clone()));
                }
            }
            if !supplied(&small_allocators, AllocatorKind::NonMoving) {
                let non_moving: Arc<dyn SmallObjectAllocator> = Arc::new(SizeClassSpace::create(
                    NON_MOVING_SPACE_NAME,
                    config.small_object_capacity,
                    log.clone(),
                )?);
                small_allocators.push((AllocatorKind::NonMoving, non_moving));
            }
        }
        for (kind, allocator) in small_allocators {
            dispatcher = dispatcher.with_small_allocator(kind, allocator);
        }
        if !dispatcher.supports(config.default_allocator) {
            return Err(HeapError::Config(format!(
                "default allocator {} has no backing space",
                config.default_allocator
            )));
        }

        let instrumented = config.stats_enabled || config.allocation_tracking_capacity > 0;
        log.emit(
            LogEvent::new(HeapLogLevel::Info, COMPONENT, "init")
                .size(config.growth_limit)
                .details(format!(
                    "allocator={} large_objects={:?} target={}",
                    config.default_allocator,
                    config.large_object_space,
                    config.initial_target_footprint
                )),
        );
        Ok(Arc::new(Heap {
            current_allocator: AtomicU8::new(config.default_allocator as u8),
            instrumented: AtomicBool::new(instrumented),
            listener: RwLock::new(None),
            collector: collector.unwrap_or_else(|| Arc::new(NoopCollector)),
            paging: paging.unwrap_or_else(|| Arc::new(NoPaging)),
            allocation_stack: AllocationStack::new(config.allocation_stack_capacity),
            records: AllocationRecords::new(config.allocation_tracking_capacity),
            stats: GlobalStats::default(),
            gcs_completed: AtomicU32::new(0),
            max_gc_requested: AtomicU32::new(0),
            is_zygote: AtomicBool::new(false),
            pinned: Mutex::new(BTreeSet::new()),
            mutators: Mutex::new(Vec::new()),
            next_mutator_id: AtomicU32::new(1),
            footprint,
            dispatcher,
            log,
            config,
        }))
    }
}

/// A managed heap: spaces, accounting and the allocation front end.
pub struct Heap {
    config: HeapConfig,
    log: Arc<HeapLog>,
    footprint: Arc<FootprintController>,
    dispatcher: AllocatorDispatcher,
    current_allocator: AtomicU8,
    instrumented: AtomicBool,
    listener: RwLock<Option<Arc<dyn AllocationListener>>>,
    collector: Arc<dyn Collector>,
    paging: Arc<dyn PagingHooks>,
    allocation_stack: AllocationStack,
    records: AllocationRecords,
    stats: GlobalStats,
    gcs_completed: AtomicU32,
    /// One past the highest GC number a background collection was requested for.
    max_gc_requested: AtomicU32,
    is_zygote: AtomicBool,
    pinned: Mutex<BTreeSet<ObjRef>>,
    mutators: Mutex<Vec<Weak<MutatorShared>>>,
    next_mutator_id: AtomicU32,
}

impl Heap {
    /// Heap built from `config` with the no-op collector.
    pub fn new(config: HeapConfig) -> Result<Arc<Self>, HeapError> {
        HeapBuilder::new(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn log(&self) -> &Arc<HeapLog> {
        &self.log
    }

    #[must_use]
    pub fn footprint(&self) -> &FootprintController {
        &self.footprint
    }

    #[must_use]
    pub fn dispatcher(&self) -> &AllocatorDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn allocation_stack(&self) -> &AllocationStack {
        &self.allocation_stack
    }

    #[must_use]
    pub fn large_object_space(&self) -> Option<&LargeObjectSpace> {
        self.dispatcher.large_object_space()
    }

    #[must_use]
    pub fn bump_pointer_region(&self) -> Option<&BumpPointerRegion> {
        self.dispatcher.bump_pointer_region()
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.footprint.bytes_allocated()
    }

    #[must_use]
    pub fn runtime_stats(&self) -> RuntimeStats {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn allocation_records(&self) -> &AllocationRecords {
        &self.records
    }

    // -- mutators ---------------------------------------------------------

    /// Register a new mutator. The handle belongs to the calling thread.
    pub fn attach_mutator(&self) -> Mutator {
        let mutator = Mutator::new(self.next_mutator_id.fetch_add(1, Ordering::Relaxed));
        let mut mutators = self.mutators.lock();
        mutators.retain(|m| m.strong_count() > 0);
        mutators.push(Arc::downgrade(mutator.shared()));
        mutator
    }

    /// Retire a mutator: revoke its buffer and flush its allocation stack.
    pub fn detach_mutator(&self, mutator: Mutator) {
        let shared = mutator.shared();
        self.dispatcher
            .revoke_thread_local_buffer(&mut shared.tlab.lock());
        self.flush_allocation_stack_of(shared);
        self.mutators
            .lock()
            .retain(|m| m.strong_count() > 0 && !std::ptr::eq(m.as_ptr(), Arc::as_ptr(shared)));
    }

    fn live_mutators(&self) -> Vec<Arc<MutatorShared>> {
        self.mutators.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Revoke every mutator's thread-local buffer; returns the bytes they used.
    pub fn revoke_all_thread_local_buffers(&self) -> usize {
        self.live_mutators()
            .iter()
            .map(|m| self.dispatcher.revoke_thread_local_buffer(&mut m.tlab.lock()))
            .sum()
    }

    /// Move every mutator's buffered objects onto the global allocation stack.
    pub fn flush_thread_local_allocation_stacks(&self) -> usize {
        self.live_mutators()
            .iter()
            .map(|m| self.flush_allocation_stack_of(m))
            .sum()
    }

    fn flush_allocation_stack_of(&self, shared: &MutatorShared) -> usize {
        let mut local = shared.alloc_stack.lock();
        if local.is_empty() {
            return 0;
        }
        if !self.allocation_stack.push_batch(&local) {
            let (len, capacity) = (self.allocation_stack.len(), self.allocation_stack.capacity());
            drop(local);
            self.log.fatal(
                COMPONENT,
                "flush_allocation_stack",
                format!("allocation stack overflow ({len}/{capacity}) flushing mutator {}", shared.id()),
            );
        }
        let flushed = local.len();
        local.clear();
        flushed
    }

    // -- allocator selection ----------------------------------------------

    #[must_use]
    pub fn current_allocator(&self) -> AllocatorKind {
        AllocatorKind::from_u8(self.current_allocator.load(Ordering::Acquire))
            .unwrap_or(self.config.default_allocator)
    }

    /// Switch the allocator used by [`Heap::alloc_object`].
    pub fn set_allocator(&self, kind: AllocatorKind) -> Result<(), HeapError> {
        if !self.dispatcher.supports(kind) {
            return Err(HeapError::Config(format!("allocator {kind} has no backing space")));
        }
        let previous = self.current_allocator.swap(kind as u8, Ordering::AcqRel);
        if previous != kind as u8 {
            self.log.emit(
                LogEvent::new(HeapLogLevel::Info, COMPONENT, "set_allocator").details(format!(
                    "{} -> {kind}",
                    AllocatorKind::from_u8(previous).map_or("unknown", AllocatorKind::as_str)
                )),
            );
        }
        Ok(())
    }

    /// Allocator a restarted request should use instead of `old`.
    #[must_use]
    pub fn updated_allocator(&self, old: AllocatorKind) -> AllocatorKind {
        if old == AllocatorKind::NonMoving {
            old
        } else {
            self.current_allocator()
        }
    }

    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.instrumented.load(Ordering::Acquire)
    }

    /// Install or remove the allocation listener; returns the previous one.
    pub fn set_allocation_listener(
        &self,
        listener: Option<Arc<dyn AllocationListener>>,
    ) -> Option<Arc<dyn AllocationListener>> {
        let mut slot = self.listener.write();
        let enabled = listener.is_some();
        let previous = std::mem::replace(&mut *slot, listener);
        self.instrumented.store(
            enabled || self.config.stats_enabled || self.records.is_enabled(),
            Ordering::Release,
        );
        previous
    }

    fn listener(&self) -> Option<Arc<dyn AllocationListener>> {
        self.listener.read().clone()
    }

    // -- allocation ---------------------------------------------------------

    /// Allocate and construct an object with the current allocator.
    ///
    /// `construct` receives the object and its usable size; the header is
    /// already installed and the memory is zeroed. On failure the error is
    /// returned and also left pending on `mutator`.
    pub fn alloc_object(
        &self,
        mutator: &Mutator,
        ty: &dyn TypeDescriptor,
        byte_count: usize,
        construct: impl FnOnce(ObjRef, usize),
    ) -> Result<ObjRef, AllocError> {
        self.allocate(mutator, ty, byte_count, self.current_allocator(), construct)
    }

    /// Allocate an object the collector will never move.
    pub fn alloc_non_movable_object(
        &self,
        mutator: &Mutator,
        ty: &dyn TypeDescriptor,
        byte_count: usize,
        construct: impl FnOnce(ObjRef, usize),
    ) -> Result<ObjRef, AllocError> {
        self.allocate(mutator, ty, byte_count, AllocatorKind::NonMoving, construct)
    }

    pub fn alloc_object_with_allocator(
        &self,
        mutator: &Mutator,
        ty: &dyn TypeDescriptor,
        byte_count: usize,
        kind: AllocatorKind,
        construct: impl FnOnce(ObjRef, usize),
    ) -> Result<ObjRef, AllocError> {
        self.allocate(mutator, ty, byte_count, kind, construct)
    }

    fn allocate(
        &self,
        mutator: &Mutator,
        ty: &dyn TypeDescriptor,
        requested: usize,
        mut kind: AllocatorKind,
        construct: impl FnOnce(ObjRef, usize),
    ) -> Result<ObjRef, AllocError> {
        self.check_preconditions(mutator, requested);
        let mut check_large_object = true;
        let max_restarts = self.config.max_allocation_restarts;
        // The one-shot large-object fallback does not count as a restart.
        let mut restarts = 0;
        while restarts < max_restarts {
            let instrumented = self.is_instrumented();
            let mut byte_count = requested;
            if instrumented {
                if let Some(listener) = self.listener() {
                    listener.pre_object_allocated(mutator, ty, &mut byte_count);
                    self.check_byte_count(byte_count);
                }
            }
            let large = check_large_object && self.is_large_object_request(ty, byte_count);
            let target = if large { AllocatorKind::LargeObject } else { kind };
            match self.attempt(mutator, target, byte_count, instrumented) {
                Attempt::Done(allocation) => {
                    return Ok(self.finish(mutator, ty, target, allocation, instrumented, construct));
                }
                Attempt::Restart => {
                    restarts += 1;
                    kind = self.updated_allocator(kind);
                    self.log.emit(
                        LogEvent::new(HeapLogLevel::Debug, COMPONENT, "restart")
                            .size(byte_count)
                            .details(format!("allocator={target} next={kind}")),
                    );
                }
                Attempt::Failed(_) if large => {
                    check_large_object = false;
                    kind = self.updated_allocator(kind);
                    self.log.emit(
                        LogEvent::new(HeapLogLevel::Debug, COMPONENT, "large_object_fallback")
                            .size(byte_count)
                            .details(format!("next={kind}")),
                    );
                }
                Attempt::Failed(error) => {
                    mutator.set_pending_error(error.clone());
                    return Err(error);
                }
            }
        }
        let error = AllocError::RestartLimit {
            restarts: max_restarts,
        };
        self.log.emit(
            LogEvent::new(HeapLogLevel::Warn, COMPONENT, "restart_limit")
                .size(requested)
                .outcome("failed")
                .details(error.to_string()),
        );
        mutator.set_pending_error(error.clone());
        Err(error)
    }

    fn fatal(&self, event: &'static str, details: String) -> ! {
        self.log.fatal(COMPONENT, event, details)
    }

    fn check_preconditions(&self, mutator: &Mutator, byte_count: usize) {
        if mutator.state() != MutatorState::Runnable {
            self.fatal(
                "precondition",
                format!("mutator {} allocating in state {:?}", mutator.id(), mutator.state()),
            );
        }
        if let Some(error) = mutator.pending_error() {
            self.fatal(
                "precondition",
                format!("mutator {} allocating with pending error: {error}", mutator.id()),
            );
        }
        if mutator.in_no_suspension_scope() {
            self.fatal(
                "precondition",
                format!("mutator {} allocating inside a no-suspension scope", mutator.id()),
            );
        }
        self.check_byte_count(byte_count);
    }

    fn check_byte_count(&self, byte_count: usize) {
        if byte_count < HEADER_SIZE || byte_count > isize::MAX as usize {
            self.fatal("precondition", format!("bad object size {byte_count}"));
        }
    }

    fn assert_may_suspend(&self, mutator: &Mutator) {
        if mutator.in_no_suspension_scope() {
            self.fatal(
                "suspend_point",
                format!("mutator {} reached a suspension point inside a no-suspension scope", mutator.id()),
            );
        }
    }

    /// Large primitive arrays and strings bypass the regular allocators.
    #[must_use]
    pub fn is_large_object_request(&self, ty: &dyn TypeDescriptor, byte_count: usize) -> bool {
        byte_count >= self.config.large_object_threshold
            && (ty.is_primitive_array() || ty.is_string())
            && self.dispatcher.large_object_space().is_some()
    }

    fn attempt(
        &self,
        mutator: &Mutator,
        kind: AllocatorKind,
        byte_count: usize,
        instrumented: bool,
    ) -> Attempt {
        if kind == AllocatorKind::RosAlloc && !instrumented {
            if let Some(allocation) = self.dispatcher.try_allocate_thread_local(kind, byte_count) {
                return Attempt::Done(allocation);
            }
        }
        if let Some(allocation) = self.dispatcher.try_allocate(mutator, kind, byte_count, false) {
            return Attempt::Done(allocation);
        }
        self.allocate_internal_with_gc(mutator, kind, byte_count, instrumented)
    }

    /// Slow path: escalate collections, then growth, then report OOM.
    fn allocate_internal_with_gc(
        &self,
        mutator: &Mutator,
        kind: AllocatorKind,
        byte_count: usize,
        instrumented: bool,
    ) -> Attempt {
        let was_default = kind == self.current_allocator();
        let changed = || {
            (was_default && self.current_allocator() != kind)
                || self.is_instrumented() != instrumented
        };
        let try_allocate = |grow| self.dispatcher.try_allocate(mutator, kind, byte_count, grow);

        self.assert_may_suspend(mutator);
        let waited = self.collector.wait_for_gc_to_complete(self, GcCause::Alloc);
        if changed() {
            return Attempt::Restart;
        }
        if waited.is_some() {
            if let Some(allocation) = try_allocate(false) {
                return Attempt::Done(allocation);
            }
        }
        for gc in [GcKind::Sticky, GcKind::Partial, GcKind::Full] {
            self.assert_may_suspend(mutator);
            let ran = self
                .collector
                .collect_for_allocation(self, gc, GcCause::Alloc, false);
            if changed() {
                return Attempt::Restart;
            }
            if ran.is_some() {
                if let Some(allocation) = try_allocate(false) {
                    return Attempt::Done(allocation);
                }
            }
        }
        if let Some(allocation) = try_allocate(true) {
            return Attempt::Done(allocation);
        }
        self.assert_may_suspend(mutator);
        self.collector
            .collect_for_allocation(self, GcKind::Full, GcCause::Alloc, true);
        if changed() {
            return Attempt::Restart;
        }
        if let Some(allocation) = try_allocate(true) {
            return Attempt::Done(allocation);
        }
        let snapshot = self.footprint.snapshot();
        let error = AllocError::OutOfMemory {
            requested: byte_count,
            allocator: kind,
            bytes_allocated: snapshot.bytes_allocated,
            target_footprint: snapshot.target_footprint,
            growth_limit: snapshot.growth_limit,
        };
        self.log.emit(
            LogEvent::new(HeapLogLevel::Warn, COMPONENT, "oom")
                .size(byte_count)
                .outcome("out_of_memory")
                .details(error.to_string()),
        );
        Attempt::Failed(error)
    }

    fn finish(
        &self,
        mutator: &Mutator,
        ty: &dyn TypeDescriptor,
        kind: AllocatorKind,
        allocation: Allocation,
        instrumented: bool,
        construct: impl FnOnce(ObjRef, usize),
    ) -> ObjRef {
        let obj = allocation.obj;
        {
            let _no_suspension = mutator.no_suspension();
            // SAFETY: `obj` is a fresh, zeroed allocation of at least
            // HEADER_SIZE bytes that no other thread can reach yet.
            unsafe { install_header(obj, ty.type_word()) };
            construct(obj, allocation.usable_size);
        }
        fence(Ordering::Release);

        let mut starting_gc_num = None;
        if allocation.bytes_tl_bulk_allocated > 0 {
            let gc_num = self.gcs_completed.load(Ordering::Acquire);
            // TLAB refills were charged by the dispatcher under the buffer lock.
            let new_total = if kind.is_tlab() {
                self.footprint.bytes_allocated()
            } else {
                self.footprint
                    .record_bulk_allocation(allocation.bytes_tl_bulk_allocated)
            };
            if self.footprint.is_concurrent_gc()
                && self.footprint.should_trigger_concurrent_gc(new_total)
            {
                starting_gc_num = Some(gc_num);
            }
        }

        if self.config.verify.is_checked() {
            let size = ty.compute_size(obj);
            if size > allocation.usable_size {
                self.fatal(
                    "verify_size",
                    format!(
                        "object {:#x} of {size} bytes overflows its {}-byte allocation",
                        obj.addr(),
                        allocation.usable_size
                    ),
                );
            }
        }

        if instrumented {
            let bytes = allocation.bytes_allocated;
            if self.config.stats_enabled {
                self.stats.record(bytes);
                mutator.record_stats(bytes);
            }
            self.records.record(mutator.id(), obj, bytes, ty.type_word());
            if let Some(listener) = self.listener() {
                listener.object_allocated(mutator, obj, bytes);
            }
        }

        if kind.has_allocation_stack() {
            self.push_on_allocation_stack(mutator, obj);
        }
        if kind == AllocatorKind::LargeObject && self.is_zygote() {
            self.paging.mark_non_swappable(obj);
        }
        if let Some(gc_num) = starting_gc_num {
            self.request_concurrent_gc(GcCause::Background, gc_num);
        }
        obj
    }

    fn push_on_allocation_stack(&self, mutator: &Mutator, obj: ObjRef) {
        let shared = mutator.shared();
        if self.try_push_local(shared, obj) {
            return;
        }
        self.log.emit(
            LogEvent::new(HeapLogLevel::Info, COMPONENT, "allocation_stack_full")
                .addr(obj.addr())
                .size(self.allocation_stack.capacity()),
        );
        self.assert_may_suspend(mutator);
        self.collector
            .collect_for_allocation(self, GcKind::Sticky, GcCause::AllocationStackFull, false);
        if !self.try_push_local(shared, obj) {
            self.fatal(
                "allocation_stack",
                format!(
                    "no room for {:#x} after collecting for a full allocation stack ({} entries)",
                    obj.addr(),
                    self.allocation_stack.len()
                ),
            );
        }
    }

    /// Buffer `obj` locally, flushing a full buffer to the global stack.
    fn try_push_local(&self, shared: &MutatorShared, obj: ObjRef) -> bool {
        let mut local = shared.alloc_stack.lock();
        if local.len() >= self.config.thread_local_allocation_stack_size {
            if !self.allocation_stack.push_batch(&local) {
                return false;
            }
            local.clear();
        }
        local.push(obj);
        true
    }

    // -- collector interface --------------------------------------------------

    #[must_use]
    pub fn gcs_completed(&self) -> u32 {
        self.gcs_completed.load(Ordering::Acquire)
    }

    /// Called by the collector at the end of every collection; returns the new GC number.
    pub fn record_gc_completed(&self) -> u32 {
        self.gcs_completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Forward a background collection request unless one is already
    /// outstanding for GC number `gc_num`.
    pub fn request_concurrent_gc(&self, cause: GcCause, gc_num: u32) -> bool {
        let mut requested = self.max_gc_requested.load(Ordering::Relaxed);
        loop {
            if gc_num < requested {
                return false;
            }
            match self.max_gc_requested.compare_exchange_weak(
                requested,
                gc_num.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => requested = actual,
            }
        }
        self.log.emit(
            LogEvent::new(HeapLogLevel::Debug, COMPONENT, "request_gc")
                .size(self.footprint.bytes_allocated())
                .details(format!("cause={cause:?} gc_num={gc_num}")),
        );
        self.collector.request_concurrent_gc(self, cause, gc_num);
        true
    }

    /// Account objects the collector reclaimed outside the front end.
    pub fn record_free(&self, objects: u64, bytes: usize) {
        self.footprint.record_free(bytes);
        self.log.emit(
            LogEvent::new(HeapLogLevel::Trace, COMPONENT, "record_free")
                .size(bytes)
                .details(format!("objects={objects}")),
        );
    }

    /// Free one large object; fatal if it is not live.
    pub fn free_large_object(&self, obj: ObjRef) -> usize {
        let Some(space) = self.dispatcher.large_object_space() else {
            self.fatal("free", format!("{:#x}: heap has no large-object space", obj.addr()));
        };
        let bytes = space.free(obj);
        self.footprint.record_free(bytes);
        bytes
    }

    /// Free one object of a small-object allocator; fatal if it is not live.
    pub fn free_object(&self, kind: AllocatorKind, obj: ObjRef) -> usize {
        let Some(allocator) = self.dispatcher.small_allocator(kind) else {
            self.fatal("free", format!("{:#x}: no {kind} allocator", obj.addr()));
        };
        let bytes = allocator.free(obj);
        self.footprint.record_free(bytes);
        bytes
    }

    /// Sweep the large-object space and return the freed totals.
    pub fn sweep_large_objects(&self, swap_bitmaps: bool) -> ObjectBytePair {
        let Some(space) = self.dispatcher.large_object_space() else {
            return ObjectBytePair::default();
        };
        let freed = space.sweep(swap_bitmaps);
        if freed.objects > 0 {
            self.record_free(freed.objects, freed.bytes as usize);
        }
        freed
    }

    pub fn set_concurrent_start_bytes(&self, bytes: usize) {
        self.footprint.set_concurrent_start_bytes(bytes);
    }

    /// Let the heap grow to its full capacity.
    pub fn clear_growth_limit(&self) {
        self.footprint.clear_growth_limit();
        if let Some(region) = self.dispatcher.bump_pointer_region() {
            region.clear_growth_limit();
        }
    }

    // -- zygote and pinning -----------------------------------------------------

    #[must_use]
    pub fn is_zygote(&self) -> bool {
        self.is_zygote.load(Ordering::Acquire)
    }

    pub fn set_zygote(&self, is_zygote: bool) {
        self.is_zygote.store(is_zygote, Ordering::Release);
    }

    /// Quiesce thread-local state and mark every large object as shared with
    /// future children.
    pub fn pre_zygote_fork(&self) {
        let revoked = self.revoke_all_thread_local_buffers();
        let flushed = self.flush_thread_local_allocation_stacks();
        if let Some(space) = self.dispatcher.large_object_space() {
            space.set_all_large_objects_as_zygote_objects(false);
        }
        self.log.emit(
            LogEvent::new(HeapLogLevel::Info, COMPONENT, "pre_zygote_fork")
                .size(self.footprint.bytes_allocated())
                .details(format!("revoked={revoked} flushed={flushed}")),
        );
    }

    /// Record `obj` in the pinning table; pinned objects are never paged out.
    pub fn pin_object(&self, obj: ObjRef) {
        if self.pinned.lock().insert(obj) {
            self.paging.mark_non_swappable(obj);
        }
    }

    pub fn unpin_object(&self, obj: ObjRef) -> bool {
        self.pinned.lock().remove(&obj)
    }

    #[must_use]
    pub fn is_pinned(&self, obj: ObjRef) -> bool {
        self.pinned.lock().contains(&obj)
    }

    // -- diagnostics ---------------------------------------------------------------

    /// Human-readable state of every space and of the footprint.
    #[must_use]
    pub fn dump_spaces(&self) -> String {
        let footprint = self.footprint.snapshot();
        let mut out = format!(
            "footprint: allocated={} target={} growth_limit={} concurrent_start={}\n",
            footprint.bytes_allocated,
            footprint.target_footprint,
            footprint.growth_limit,
            footprint.concurrent_start_bytes
        );
        if let Some(region) = self.dispatcher.bump_pointer_region() {
            out.push_str(&region.dump());
            out.push('\n');
        }
        for (_, allocator) in self.dispatcher.small_allocators() {
            out.push_str(&allocator.dump());
            out.push('\n');
        }
        if let Some(space) = self.dispatcher.large_object_space() {
            out.push_str(space.dump().trim_end());
            out.push('\n');
        }
        out.push_str(&format!(
            "allocation stack: {}/{}\n",
            self.allocation_stack.len(),
            self.allocation_stack.capacity()
        ));
        out
    }
}
