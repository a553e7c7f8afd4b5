//! Mutator handles.
//!
//! A [`Mutator`] is owned by one thread. The parts the collector must reach
//! while the mutator runs (its thread-local buffer and thread-local
//! allocation stack) live in [`MutatorShared`] behind their own locks.
//!
//! Lock order: a mutator's buffer lock before the bump region's block lock.

use crate::error::AllocError;
use crate::listener::RuntimeStats;
use crate::object::ObjRef;
use crate::space::bump_pointer::ThreadLocalBuffer;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// Scheduling state of a mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorState {
    /// Running managed code; may allocate.
    Runnable,
    /// Running native code.
    Native,
    Suspended,
}

/// Collector-visible part of a mutator.
#[derive(Debug)]
pub struct MutatorShared {
    id: u32,
    pub(crate) tlab: Mutex<ThreadLocalBuffer>,
    pub(crate) alloc_stack: Mutex<Vec<ObjRef>>,
}

impl MutatorShared {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Per-thread allocation context. `Send` but not `Sync`.
#[derive(Debug)]
pub struct Mutator {
    shared: Arc<MutatorShared>,
    state: Cell<MutatorState>,
    pending_error: RefCell<Option<AllocError>>,
    no_suspension_depth: Cell<u32>,
    stats: Cell<RuntimeStats>,
}

impl Mutator {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            shared: Arc::new(MutatorShared {
                id,
                tlab: Mutex::new(ThreadLocalBuffer::default()),
                alloc_stack: Mutex::new(Vec::new()),
            }),
            state: Cell::new(MutatorState::Runnable),
            pending_error: RefCell::new(None),
            no_suspension_depth: Cell::new(0),
            stats: Cell::new(RuntimeStats::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<MutatorShared> {
        &self.shared
    }

    #[must_use]
    pub fn state(&self) -> MutatorState {
        self.state.get()
    }

    pub fn set_state(&self, state: MutatorState) {
        self.state.set(state);
    }

    #[must_use]
    pub fn is_exception_pending(&self) -> bool {
        self.pending_error.borrow().is_some()
    }

    #[must_use]
    pub fn pending_error(&self) -> Option<AllocError> {
        self.pending_error.borrow().clone()
    }

    /// Clear and return the pending error. Must be called before the next
    /// allocation on this mutator.
    pub fn take_pending_error(&self) -> Option<AllocError> {
        self.pending_error.borrow_mut().take()
    }

    pub(crate) fn set_pending_error(&self, error: AllocError) {
        *self.pending_error.borrow_mut() = Some(error);
    }

    /// Enter a region in which the mutator must not reach a suspension point.
    pub fn no_suspension(&self) -> NoSuspensionScope<'_> {
        self.no_suspension_depth.set(self.no_suspension_depth.get() + 1);
        NoSuspensionScope { mutator: self }
    }

    #[must_use]
    pub fn in_no_suspension_scope(&self) -> bool {
        self.no_suspension_depth.get() > 0
    }

    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        self.stats.get()
    }

    pub(crate) fn record_stats(&self, bytes: usize) {
        let mut stats = self.stats.get();
        stats.record(bytes);
        self.stats.set(stats);
    }

    /// Copy of the current thread-local buffer.
    #[must_use]
    pub fn tlab(&self) -> ThreadLocalBuffer {
        *self.shared.tlab.lock()
    }

    /// Objects buffered for the global allocation stack.
    #[must_use]
    pub fn thread_local_allocation_stack_len(&self) -> usize {
        self.shared.alloc_stack.lock().len()
    }
}

/// Guard returned by [`Mutator::no_suspension`].
#[must_use]
pub struct NoSuspensionScope<'a> {
    mutator: &'a Mutator,
}

impl Drop for NoSuspensionScope<'_> {
    fn drop(&mut self) {
        let depth = &self.mutator.no_suspension_depth;
        depth.set(depth.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_error_is_taken_once() {
        let m = Mutator::new(3);
        assert!(!m.is_exception_pending());
        m.set_pending_error(AllocError::RestartLimit { restarts: 2 });
        assert!(m.is_exception_pending());
        assert_eq!(m.pending_error(), Some(AllocError::RestartLimit { restarts: 2 }));
        assert!(m.take_pending_error().is_some());
        assert!(m.take_pending_error().is_none());
    }

    #[test]
    fn test_no_suspension_scopes_nest() {
        let m = Mutator::new(1);
        {
            let _outer = m.no_suspension();
            {
                let _inner = m.no_suspension();
                assert!(m.in_no_suspension_scope());
            }
            assert!(m.in_no_suspension_scope());
        }
        assert!(!m.in_no_suspension_scope());
    }

    #[test]
    fn test_mutator_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Mutator>();
        let m = Mutator::new(9);
        let id = std::thread::spawn(move || m.id()).join().expect("thread");
        assert_eq!(id, 9);
        assert_eq!(Mutator::new(1).state(), MutatorState::Runnable);
    }
}
