//! Interface to the garbage collector.
//!
//! The allocation engine never traces or sweeps by itself. It asks a
//! [`Collector`] for help and exposes the allocation stack for root scanning.

use crate::heap::Heap;
use crate::object::ObjRef;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcCause {
    /// An allocation could not be satisfied.
    Alloc,
    /// Bulk allocation crossed the concurrent start threshold.
    Background,
    /// The global allocation stack overflowed.
    AllocationStackFull,
    Explicit,
}

/// Collection scope, from cheapest to most thorough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcKind {
    /// Only objects allocated since the last collection.
    Sticky,
    /// Everything except the zygote and image spaces.
    Partial,
    Full,
}

pub trait Collector: Send + Sync {
    /// Start a background collection; must not block the caller.
    fn request_concurrent_gc(&self, heap: &Heap, cause: GcCause, gc_num: u32);

    /// Run a blocking collection of at least `kind`; returns the kind that ran.
    fn collect_for_allocation(
        &self,
        _heap: &Heap,
        _kind: GcKind,
        _cause: GcCause,
        _clear_soft_references: bool,
    ) -> Option<GcKind> {
        None
    }

    /// Wait for a collection in progress; returns its kind if one was running.
    fn wait_for_gc_to_complete(&self, _heap: &Heap, _cause: GcCause) -> Option<GcKind> {
        None
    }
}

/// Collector that reclaims nothing.
///
/// It still empties the allocation stack when it overflows, so a heap without
/// a tracing collector can allocate indefinitely.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn request_concurrent_gc(&self, _heap: &Heap, _cause: GcCause, _gc_num: u32) {}

    fn collect_for_allocation(
        &self,
        heap: &Heap,
        kind: GcKind,
        cause: GcCause,
        _clear_soft_references: bool,
    ) -> Option<GcKind> {
        if cause != GcCause::AllocationStackFull {
            return None;
        }
        heap.allocation_stack().reset();
        Some(kind)
    }
}

/// Fixed-capacity stack of recently allocated objects.
///
/// Mutators reserve slots with a compare-exchange on the back index and then
/// fill them, so a concurrent reader may observe an empty slot; those are
/// skipped. Pushers share `pushing`; [`AllocationStack::reset`] takes it
/// exclusively, so no reservation is filled after the stack is emptied.
pub struct AllocationStack {
    slots: Box<[AtomicUsize]>,
    back: AtomicUsize,
    pushing: RwLock<()>,
}

impl AllocationStack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            back: AtomicUsize::new(0),
            pushing: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.back.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push all of `objs` or none; `false` when they do not fit.
    pub fn push_batch(&self, objs: &[ObjRef]) -> bool {
        let _pushing = self.pushing.read();
        let mut back = self.back.load(Ordering::Relaxed);
        let start = loop {
            let Some(new_back) = back.checked_add(objs.len()) else {
                return false;
            };
            if new_back > self.slots.len() {
                return false;
            }
            match self.back.compare_exchange_weak(
                back,
                new_back,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break back,
                Err(actual) => back = actual,
            }
        };
        for (slot, obj) in self.slots[start..start + objs.len()].iter().zip(objs) {
            slot.store(obj.addr(), Ordering::Release);
        }
        true
    }

    pub fn push(&self, obj: ObjRef) -> bool {
        self.push_batch(std::slice::from_ref(&obj))
    }

    #[must_use]
    pub fn contains(&self, obj: ObjRef) -> bool {
        self.slots[..self.len()]
            .iter()
            .any(|slot| slot.load(Ordering::Acquire) == obj.addr())
    }

    /// Published entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ObjRef> {
        self.slots[..self.len()]
            .iter()
            .filter_map(|slot| ObjRef::from_addr(slot.load(Ordering::Acquire)))
            .collect()
    }

    /// Empty the stack, waiting for in-flight pushes to land first.
    pub fn reset(&self) {
        let _exclusive = self.pushing.write();
        let len = self.back.swap(0, Ordering::AcqRel);
        for slot in &self.slots[..len.min(self.slots.len())] {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn obj(addr: usize) -> ObjRef {
        ObjRef::from_addr(addr).expect("nonzero")
    }

    #[test]
    fn test_push_batch_is_all_or_nothing() {
        let stack = AllocationStack::new(4);
        assert!(stack.push_batch(&[obj(8), obj(16), obj(24)]));
        assert!(!stack.push_batch(&[obj(32), obj(40)]));
        assert_eq!(stack.len(), 3);
        assert!(stack.push(obj(32)));
        assert!(!stack.push(obj(40)));
        assert_eq!(stack.snapshot(), vec![obj(8), obj(16), obj(24), obj(32)]);
        assert!(stack.contains(obj(16)));
    }

    #[test]
    fn test_reset_clears_slots() {
        let stack = AllocationStack::new(2);
        stack.push(obj(8));
        stack.reset();
        assert!(stack.is_empty());
        assert!(!stack.contains(obj(8)));
        assert!(stack.push_batch(&[obj(16), obj(24)]));
    }

    #[test]
    fn test_reset_racing_pushers_leaves_no_stale_slots() {
        let stack = Arc::new(AllocationStack::new(256));
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for i in 0..2000 {
                        let base = 8 * (t * 10_000 + i * 4 + 1);
                        let _ = stack.push_batch(&[obj(base), obj(base + 8), obj(base + 16), obj(base + 24)]);
                    }
                })
            })
            .collect();
        let resetter = {
            let stack = Arc::clone(&stack);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    stack.reset();
                    std::thread::yield_now();
                }
            })
        };
        for t in pushers {
            t.join().expect("pusher");
        }
        resetter.join().expect("resetter");
        stack.reset();
        assert!(
            stack.slots.iter().all(|slot| slot.load(Ordering::Relaxed) == 0),
            "a push landed beyond the back index"
        );
    }

    #[test]
    fn test_concurrent_pushes_fill_exactly() {
        let stack = Arc::new(AllocationStack::new(4000));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        assert!(stack.push(obj(8 * (t * 1000 + i + 1))));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("pusher");
        }
        let mut all = stack.snapshot();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert!(!stack.push(obj(8)));
    }
}
