use mheap_core::os::PAGE_SIZE;
use mheap_core::space::Space;
use mheap_core::{
    AllocError, AllocationListener, AllocatorKind, BasicType, Collector, GcCause, GcKind, Heap,
    HeapBuilder, HeapConfig, HeapLogLevel, LargeObjectSpaceKind, Mutator, ObjRef, PagingHooks,
    Shape, TypeDescriptor,
};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

const POINT: BasicType = BasicType::new(0x10, Shape::Instance { size: 32 });
const BYTES: BasicType = BasicType::new(0x20, Shape::PrimitiveArray { component_size: 1 });

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn config() -> HeapConfig {
    HeapConfig {
        initial_target_footprint: 2 * MIB,
        growth_limit: 8 * MIB,
        concurrent_start_bytes: 2 * MIB,
        large_object_space_capacity: 4 * MIB,
        bump_pointer_capacity: 2 * MIB,
        small_object_capacity: 4 * MIB,
        tlab_size: 4 * KIB,
        log_level: HeapLogLevel::Debug,
        ..HeapConfig::default()
    }
}

fn instance(size: usize) -> BasicType {
    BasicType::new(0x40, Shape::Instance { size })
}

fn small_space_contains(heap: &Heap, kind: AllocatorKind, obj: ObjRef) -> bool {
    heap.dispatcher()
        .small_allocator(kind)
        .is_some_and(|a| a.contains(obj.addr()))
}

#[derive(Default)]
struct RecordingListener {
    pre_calls: AtomicUsize,
    seen: Mutex<Vec<(u32, ObjRef, usize)>>,
}

impl AllocationListener for RecordingListener {
    fn pre_object_allocated(&self, _mutator: &Mutator, _ty: &dyn TypeDescriptor, byte_count: &mut usize) {
        self.pre_calls.fetch_add(1, Ordering::Relaxed);
        *byte_count += 16;
    }

    fn object_allocated(&self, mutator: &Mutator, obj: ObjRef, byte_count: usize) {
        self.seen.lock().push((mutator.id(), obj, byte_count));
    }
}

#[test]
fn listener_observes_adjusted_size_and_stats_accumulate() {
    let heap = Heap::new(HeapConfig {
        stats_enabled: true,
        allocation_tracking_capacity: 2,
        ..config()
    })
    .expect("heap");
    let listener = Arc::new(RecordingListener::default());
    assert!(heap.set_allocation_listener(Some(listener.clone())).is_none());
    assert!(heap.is_instrumented());

    let m = heap.attach_mutator();
    let objs: Vec<ObjRef> = (0..3)
        .map(|_| heap.alloc_object(&m, &POINT, 32, |_, _| {}).expect("alloc"))
        .collect();

    assert_eq!(listener.pre_calls.load(Ordering::Relaxed), 3);
    let seen = listener.seen.lock().clone();
    assert_eq!(seen.len(), 3);
    for ((id, obj, bytes), expected) in seen.iter().zip(&objs) {
        assert_eq!(*id, m.id());
        assert_eq!(obj, expected);
        assert_eq!(*bytes, 48, "32 bytes plus 16 from the pre hook, in the 48-byte class");
    }

    let stats = heap.runtime_stats();
    assert_eq!(stats.allocated_objects, 3);
    assert_eq!(stats.allocated_bytes, 144);
    assert_eq!(m.stats(), stats);

    let records = heap.allocation_records();
    assert_eq!(records.total(), 3);
    let kept = records.snapshot();
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[1].addr, objs[2].addr());
    assert_eq!(kept[1].type_word, 0x10);

    assert!(heap.set_allocation_listener(None).is_some());
    assert!(heap.is_instrumented(), "stats keep the instrumented path on");
}

#[test]
fn removing_the_only_listener_leaves_the_fast_path() {
    let heap = Heap::new(config()).expect("heap");
    assert!(!heap.is_instrumented());
    heap.set_allocation_listener(Some(Arc::new(RecordingListener::default())));
    assert!(heap.is_instrumented());
    heap.set_allocation_listener(None);
    assert!(!heap.is_instrumented());
}

/// Switches to `next` the first time it is asked to collect.
struct SwitchingCollector {
    next: AllocatorKind,
    collections: AtomicUsize,
}

impl Collector for SwitchingCollector {
    fn request_concurrent_gc(&self, _heap: &Heap, _cause: GcCause, _gc_num: u32) {}

    fn collect_for_allocation(
        &self,
        heap: &Heap,
        kind: GcKind,
        _cause: GcCause,
        _clear_soft_references: bool,
    ) -> Option<GcKind> {
        if self.collections.fetch_add(1, Ordering::Relaxed) == 0 {
            heap.set_allocator(self.next).expect("switch allocator");
        }
        Some(kind)
    }
}

#[test]
fn allocator_switch_during_collection_restarts_with_new_allocator() {
    let collector = Arc::new(SwitchingCollector {
        next: AllocatorKind::DlMalloc,
        collections: AtomicUsize::new(0),
    });
    let heap = HeapBuilder::new(HeapConfig {
        default_allocator: AllocatorKind::BumpPointer,
        bump_pointer_capacity: 64 * KIB,
        ..config()
    })
    .collector(collector.clone())
    .build()
    .expect("heap");
    let m = heap.attach_mutator();
    let chunk = instance(32 * KIB);
    let region = heap.bump_pointer_region().expect("region");

    let first = heap.alloc_object(&m, &chunk, 32 * KIB, |_, _| {}).expect("first");
    let second = heap.alloc_object(&m, &chunk, 32 * KIB, |_, _| {}).expect("second");
    assert!(region.contains(first.addr()) && region.contains(second.addr()));

    let third = heap.alloc_object(&m, &chunk, 32 * KIB, |_, _| {}).expect("third");
    assert_eq!(collector.collections.load(Ordering::Relaxed), 1);
    assert_eq!(heap.current_allocator(), AllocatorKind::DlMalloc);
    assert!(small_space_contains(&heap, AllocatorKind::DlMalloc, third));
    assert_eq!(heap.log().count("restart"), 1);
    assert_eq!(heap.bytes_allocated(), 3 * 32 * KIB);
    assert!(!m.is_exception_pending());
}

/// Flips between two allocators on every collection.
struct FlippingCollector;

impl Collector for FlippingCollector {
    fn request_concurrent_gc(&self, _heap: &Heap, _cause: GcCause, _gc_num: u32) {}

    fn collect_for_allocation(
        &self,
        heap: &Heap,
        kind: GcKind,
        _cause: GcCause,
        _clear_soft_references: bool,
    ) -> Option<GcKind> {
        let next = match heap.current_allocator() {
            AllocatorKind::RosAlloc => AllocatorKind::DlMalloc,
            _ => AllocatorKind::RosAlloc,
        };
        heap.set_allocator(next).expect("flip");
        Some(kind)
    }
}

#[test]
fn endless_allocator_churn_hits_restart_limit() {
    let heap = HeapBuilder::new(HeapConfig {
        small_object_capacity: 64 * KIB,
        max_allocation_restarts: 3,
        ..config()
    })
    .collector(Arc::new(FlippingCollector))
    .build()
    .expect("heap");
    let m = heap.attach_mutator();
    let err = heap
        .alloc_object(&m, &instance(128 * KIB), 128 * KIB, |_, _| {})
        .expect_err("never fits");
    assert_eq!(err, AllocError::RestartLimit { restarts: 3 });
    assert!(!err.is_out_of_memory());
    assert_eq!(m.take_pending_error(), Some(err));
    assert_eq!(heap.log().count("restart"), 3);
    assert_eq!(heap.log().count("restart_limit"), 1);
    assert_eq!(heap.bytes_allocated(), 0);
}

#[test]
fn failed_large_object_request_falls_back_to_small_allocator() {
    let heap = Heap::new(HeapConfig {
        large_object_space_capacity: 4 * PAGE_SIZE,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    let len = 6 * PAGE_SIZE;
    let obj = heap
        .alloc_object(&m, &BYTES, BYTES.size_for(len), BasicType::init_length(len))
        .expect("fallback");
    let los = heap.large_object_space().expect("los");
    assert!(los.allocation_size(obj).is_none());
    assert!(small_space_contains(&heap, AllocatorKind::RosAlloc, obj));
    assert_eq!(heap.log().count("large_object_fallback"), 1);
    assert!(!m.is_exception_pending());
    // Length word written by the constructor.
    assert_eq!(BYTES.compute_size(obj), BYTES.size_for(len));
}

#[test]
fn large_object_fallback_does_not_consume_a_restart() {
    let heap = Heap::new(HeapConfig {
        large_object_space_capacity: 4 * PAGE_SIZE,
        max_allocation_restarts: 1,
        default_allocator: AllocatorKind::DlMalloc,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    let len = 5 * PAGE_SIZE;
    let obj = heap
        .alloc_object(&m, &BYTES, BYTES.size_for(len), BasicType::init_length(len))
        .expect("fallback within a single permitted restart");
    assert!(small_space_contains(&heap, AllocatorKind::DlMalloc, obj));
    assert_eq!(heap.log().count("large_object_fallback"), 1);
    assert_eq!(heap.log().count("restart"), 0);
    assert_eq!(heap.log().count("restart_limit"), 0);
    assert!(!m.is_exception_pending());
}

#[test]
fn thread_local_reuse_respects_the_growth_limit() {
    const LIMIT: usize = 64 * KIB;
    let heap = Heap::new(HeapConfig {
        initial_target_footprint: LIMIT,
        growth_limit: LIMIT,
        concurrent_start_bytes: LIMIT,
        concurrent_gc: false,
        default_allocator: AllocatorKind::DlMalloc,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    let objs: Vec<ObjRef> = (0..LIMIT / 32)
        .map(|_| heap.alloc_object(&m, &POINT, 32, |_, _| {}).expect("fill"))
        .collect();
    assert_eq!(heap.bytes_allocated(), LIMIT);

    // Two cached 32-byte chunks, then their budget spent on a fresh chunk.
    heap.free_object(AllocatorKind::DlMalloc, objs[10]);
    heap.free_object(AllocatorKind::DlMalloc, objs[20]);
    let wide = heap
        .alloc_object(&m, &instance(64), 64, |_, _| {})
        .expect("64 bytes back within the limit");
    assert_eq!(heap.bytes_allocated(), LIMIT);

    let err = heap
        .alloc_object_with_allocator(&m, &POINT, 32, AllocatorKind::RosAlloc, |_, _| {})
        .expect_err("a reused chunk still counts against the growth limit");
    assert!(err.is_out_of_memory());
    assert_eq!(m.take_pending_error(), Some(err));
    assert_eq!(heap.bytes_allocated(), LIMIT);

    // With budget back, the cached chunk is handed out again.
    heap.free_object(AllocatorKind::DlMalloc, wide);
    let reused = heap
        .alloc_object_with_allocator(&m, &POINT, 32, AllocatorKind::RosAlloc, |_, _| {})
        .expect("reuse");
    assert!(reused == objs[10] || reused == objs[20], "{reused:?} is not a cached chunk");
    assert!(heap.bytes_allocated() <= LIMIT);
}

#[test]
fn large_object_space_disabled_keeps_arrays_in_small_space() {
    let heap = Heap::new(HeapConfig {
        large_object_space: LargeObjectSpaceKind::Disabled,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    let len = 4 * PAGE_SIZE;
    assert!(!heap.is_large_object_request(&BYTES, BYTES.size_for(len)));
    let obj = heap
        .alloc_object(&m, &BYTES, BYTES.size_for(len), BasicType::init_length(len))
        .expect("alloc");
    assert!(small_space_contains(&heap, AllocatorKind::RosAlloc, obj));
}

#[derive(Default)]
struct RecordingPaging {
    non_swappable: Mutex<Vec<ObjRef>>,
}

impl PagingHooks for RecordingPaging {
    fn mark_non_swappable(&self, obj: ObjRef) {
        self.non_swappable.lock().push(obj);
    }
}

#[test]
fn zygote_large_objects_and_pinned_objects_are_never_paged() {
    let paging = Arc::new(RecordingPaging::default());
    let heap = HeapBuilder::new(config())
        .paging(paging.clone())
        .build()
        .expect("heap");
    let m = heap.attach_mutator();
    let len = 4 * PAGE_SIZE;

    let before = heap
        .alloc_object(&m, &BYTES, BYTES.size_for(len), BasicType::init_length(len))
        .expect("large");
    assert!(paging.non_swappable.lock().is_empty());

    heap.set_zygote(true);
    let large = heap
        .alloc_object(&m, &BYTES, BYTES.size_for(len), BasicType::init_length(len))
        .expect("large");
    let small = heap.alloc_object(&m, &POINT, 32, |_, _| {}).expect("small");
    assert_eq!(*paging.non_swappable.lock(), vec![large]);

    heap.pin_object(small);
    heap.pin_object(small);
    assert!(heap.is_pinned(small));
    assert_eq!(*paging.non_swappable.lock(), vec![large, small]);
    assert!(heap.unpin_object(small));
    assert!(!heap.is_pinned(small));
    assert!(!heap.unpin_object(small));

    heap.pre_zygote_fork();
    let los = heap.large_object_space().expect("los");
    assert!(los.is_zygote_large_object(before));
    assert!(los.is_zygote_large_object(large));

    heap.set_zygote(false);
    let fresh = heap
        .alloc_object(&m, &BYTES, BYTES.size_for(len), BasicType::init_length(len))
        .expect("large");
    let footprint = heap.bytes_allocated();
    let freed = heap.sweep_large_objects(false);
    assert_eq!(freed.objects, 1, "only the post-fork object is unmarked and not zygote");
    assert_eq!(freed.bytes, 5 * PAGE_SIZE as u64);
    assert!(los.allocation_size(fresh).is_none());
    assert_eq!(heap.bytes_allocated(), footprint - 5 * PAGE_SIZE);
}

#[derive(Default)]
struct RequestRecorder {
    requests: Mutex<Vec<(GcCause, u32)>>,
    collections: Mutex<Vec<(GcKind, bool)>>,
}

impl Collector for RequestRecorder {
    fn request_concurrent_gc(&self, _heap: &Heap, cause: GcCause, gc_num: u32) {
        self.requests.lock().push((cause, gc_num));
    }

    fn collect_for_allocation(
        &self,
        _heap: &Heap,
        kind: GcKind,
        _cause: GcCause,
        clear_soft_references: bool,
    ) -> Option<GcKind> {
        self.collections.lock().push((kind, clear_soft_references));
        Some(kind)
    }
}

#[test]
fn crossing_concurrent_start_requests_one_background_gc_per_epoch() {
    let recorder = Arc::new(RequestRecorder::default());
    let heap = HeapBuilder::new(HeapConfig {
        concurrent_start_bytes: 64 * KIB,
        ..config()
    })
    .collector(recorder.clone())
    .build()
    .expect("heap");
    let m = heap.attach_mutator();
    let chunk = instance(32 * KIB);

    heap.alloc_object(&m, &chunk, 32 * KIB, |_, _| {}).expect("below");
    assert!(recorder.requests.lock().is_empty());
    for _ in 0..3 {
        heap.alloc_object(&m, &chunk, 32 * KIB, |_, _| {}).expect("above");
    }
    assert_eq!(*recorder.requests.lock(), vec![(GcCause::Background, 0)]);

    assert_eq!(heap.record_gc_completed(), 1);
    heap.alloc_object(&m, &chunk, 32 * KIB, |_, _| {}).expect("next epoch");
    assert_eq!(
        *recorder.requests.lock(),
        vec![(GcCause::Background, 0), (GcCause::Background, 1)]
    );
    assert!(recorder.collections.lock().is_empty());
}

#[test]
fn out_of_memory_escalates_collections_before_failing() {
    let recorder = Arc::new(RequestRecorder::default());
    let heap = HeapBuilder::new(HeapConfig {
        initial_target_footprint: MIB,
        growth_limit: MIB,
        concurrent_start_bytes: MIB,
        ..config()
    })
    .collector(recorder.clone())
    .build()
    .expect("heap");
    let m = heap.attach_mutator();
    let chunk = instance(32 * KIB);

    let mut live = Vec::new();
    for i in 0..32 {
        let obj = heap
            .alloc_object_with_allocator(&m, &chunk, 32 * KIB, AllocatorKind::DlMalloc, |_, _| {})
            .unwrap_or_else(|e| panic!("allocation {i}: {e}"));
        live.push(obj);
    }
    assert_eq!(heap.bytes_allocated(), MIB);
    assert!(recorder.collections.lock().is_empty());

    let err = heap
        .alloc_object_with_allocator(&m, &chunk, 32 * KIB, AllocatorKind::DlMalloc, |_, _| {})
        .expect_err("growth limit reached");
    match &err {
        AllocError::OutOfMemory {
            requested,
            allocator,
            bytes_allocated,
            growth_limit,
            ..
        } => {
            assert_eq!(*requested, 32 * KIB);
            assert_eq!(*allocator, AllocatorKind::DlMalloc);
            assert_eq!(*bytes_allocated, MIB);
            assert_eq!(*growth_limit, MIB);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        *recorder.collections.lock(),
        vec![
            (GcKind::Sticky, false),
            (GcKind::Partial, false),
            (GcKind::Full, false),
            (GcKind::Full, true),
        ]
    );
    assert_eq!(m.take_pending_error(), Some(err));

    let freed = heap.free_object(AllocatorKind::DlMalloc, live[0]);
    assert_eq!(freed, 32 * KIB);
    heap.alloc_object_with_allocator(&m, &chunk, 32 * KIB, AllocatorKind::DlMalloc, |_, _| {})
        .expect("fits after a free");
}

#[test]
fn clear_growth_limit_lets_the_heap_grow() {
    let heap = Heap::new(HeapConfig {
        initial_target_footprint: MIB,
        growth_limit: MIB,
        concurrent_start_bytes: MIB,
        capacity: 4 * MIB,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    let big = instance(2 * MIB);
    heap.alloc_object_with_allocator(&m, &big, 2 * MIB, AllocatorKind::DlMalloc, |_, _| {})
        .expect_err("over the growth limit");
    m.take_pending_error();

    heap.clear_growth_limit();
    assert_eq!(heap.footprint().growth_limit(), 4 * MIB);
    heap.alloc_object_with_allocator(&m, &big, 2 * MIB, AllocatorKind::DlMalloc, |_, _| {})
        .expect("fits after clearing");
}

#[test]
fn allocation_stack_overflow_is_absorbed_by_a_collection() {
    let heap = Heap::new(HeapConfig {
        allocation_stack_capacity: 8,
        thread_local_allocation_stack_size: 4,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    for _ in 0..40 {
        heap.alloc_object_with_allocator(&m, &POINT, 32, AllocatorKind::DlMalloc, |_, _| {})
            .expect("alloc");
        assert!(heap.allocation_stack().len() <= 8);
        assert!(m.thread_local_allocation_stack_len() <= 4);
    }
    assert!(heap.log().count("allocation_stack_full") >= 1);
}

#[test]
fn bump_and_tlab_allocations_skip_the_allocation_stack() {
    let heap = Heap::new(HeapConfig {
        default_allocator: AllocatorKind::Tlab,
        ..config()
    })
    .expect("heap");
    let m = heap.attach_mutator();
    heap.alloc_object(&m, &POINT, 32, |_, _| {}).expect("tlab");
    heap.alloc_object_with_allocator(&m, &POINT, 32, AllocatorKind::BumpPointer, |_, _| {})
        .expect("bump");
    assert_eq!(m.thread_local_allocation_stack_len(), 0);
    heap.alloc_non_movable_object(&m, &POINT, 32, |_, _| {}).expect("non-moving");
    assert_eq!(m.thread_local_allocation_stack_len(), 1);
    heap.detach_mutator(m);
    assert_eq!(heap.allocation_stack().len(), 1);
}

#[test]
fn concurrent_tlab_allocations_are_disjoint_and_accounted() {
    const THREADS: u64 = 4;
    const ALLOCS: usize = 300;
    let heap = Heap::new(HeapConfig {
        default_allocator: AllocatorKind::Tlab,
        ..config()
    })
    .expect("heap");

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let m = heap.attach_mutator();
                let mut rng = XorShift64::new(0xA11C + t);
                let mut spans = Vec::with_capacity(ALLOCS);
                for _ in 0..ALLOCS {
                    let size = rng.gen_range_usize(2, 12) * 8;
                    let ty = BasicType::new(0x50, Shape::Instance { size });
                    let usable = Cell::new(0);
                    let obj = heap
                        .alloc_object(&m, &ty, size, |_, u| usable.set(u))
                        .expect("tlab alloc");
                    spans.push((obj.addr(), usable.get()));
                }
                heap.detach_mutator(m);
                spans
            })
        })
        .collect();

    let mut spans: Vec<(usize, usize)> = workers
        .into_iter()
        .flat_map(|w| w.join().expect("worker"))
        .collect();
    let total: usize = spans.iter().map(|(_, len)| len).sum();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "{:#x}+{} overlaps {:#x}",
            pair[0].0,
            pair[0].1,
            pair[1].0
        );
    }
    assert_eq!(heap.bytes_allocated(), total);
    let region = heap.bump_pointer_region().expect("region");
    assert_eq!(region.objects_allocated(), THREADS * ALLOCS as u64);
}

#[test]
fn footprint_matches_live_bytes_under_concurrent_churn() {
    const THREADS: u64 = 4;
    const STEPS: usize = 500;
    let heap = Heap::new(HeapConfig {
        small_object_capacity: 16 * MIB,
        ..config()
    })
    .expect("heap");

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let m = heap.attach_mutator();
                let mut rng = XorShift64::new(0xF007 + t);
                let mut live: Vec<(ObjRef, usize)> = Vec::new();
                for step in 0..STEPS {
                    if live.is_empty() || rng.next_u64() % 3 != 0 {
                        let size = rng.gen_range_usize(16, 4 * KIB);
                        let ty = BasicType::new(0x60, Shape::Instance { size });
                        let usable = Cell::new(0);
                        let obj = heap
                            .alloc_object_with_allocator(
                                &m,
                                &ty,
                                size,
                                AllocatorKind::DlMalloc,
                                |_, u| usable.set(u),
                            )
                            .unwrap_or_else(|e| panic!("seed={t} step={step}: {e}"));
                        live.push((obj, usable.get()));
                    } else {
                        let idx = rng.gen_range_usize(0, live.len() - 1);
                        let (obj, bytes) = live.swap_remove(idx);
                        assert_eq!(
                            heap.free_object(AllocatorKind::DlMalloc, obj),
                            bytes,
                            "seed={t} step={step}"
                        );
                    }
                }
                heap.detach_mutator(m);
                live.iter().map(|(_, bytes)| bytes).sum::<usize>()
            })
        })
        .collect();

    let live: usize = workers.into_iter().map(|w| w.join().expect("worker")).sum();
    assert_eq!(heap.bytes_allocated(), live);
    let counters = heap
        .dispatcher()
        .small_allocator(AllocatorKind::DlMalloc)
        .expect("dlmalloc")
        .counters();
    assert_eq!(counters.bytes_allocated, live as u64);
}
