//! Footprint accounting: bytes allocated against a negotiated target and a
//! hard growth limit.
//!
//! Admission is lock-free. Concurrent growers race on a compare-exchange of
//! the target footprint, so no growth is ever lost, but the order in which
//! concurrent requests are admitted is unspecified.

use crate::config::HeapConfig;
use crate::dispatch::AllocatorKind;
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const COMPONENT: &str = "footprint";

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FootprintSnapshot {
    pub bytes_allocated: usize,
    pub target_footprint: usize,
    pub growth_limit: usize,
    pub concurrent_start_bytes: usize,
}

pub struct FootprintController {
    target_footprint: AtomicUsize,
    growth_limit: AtomicUsize,
    capacity: usize,
    num_bytes_allocated: AtomicUsize,
    concurrent_start_bytes: AtomicUsize,
    concurrent_gc: bool,
    log: Arc<HeapLog>,
}

impl FootprintController {
    #[must_use]
    pub fn new(config: &HeapConfig, log: Arc<HeapLog>) -> Self {
        Self {
            target_footprint: AtomicUsize::new(config.initial_target_footprint),
            growth_limit: AtomicUsize::new(config.growth_limit),
            capacity: config.capacity.max(config.growth_limit),
            num_bytes_allocated: AtomicUsize::new(0),
            concurrent_start_bytes: AtomicUsize::new(config.concurrent_start_bytes),
            concurrent_gc: config.concurrent_gc,
            log,
        }
    }

    /// Whether a request of `alloc_size` bytes by `kind` must be refused.
    ///
    /// Within the target footprint the request is admitted. Beyond the growth
    /// limit it is refused. In between, an allocator that runs alongside a
    /// concurrent collector is admitted and leaves the pressure to the
    /// collector; otherwise the target is raised to fit when `grow` is set.
    pub fn is_out_of_memory_on_allocation(
        &self,
        kind: AllocatorKind,
        alloc_size: usize,
        grow: bool,
    ) -> bool {
        let mut old_target = self.target_footprint.load(Ordering::Relaxed);
        loop {
            let allocated = self.num_bytes_allocated.load(Ordering::Relaxed);
            let Some(new_footprint) = allocated.checked_add(alloc_size) else {
                return true;
            };
            if new_footprint <= old_target {
                return false;
            }
            if new_footprint > self.growth_limit.load(Ordering::Relaxed) {
                self.log.emit(
                    LogEvent::new(HeapLogLevel::Debug, COMPONENT, "admit")
                        .size(alloc_size)
                        .outcome("over_growth_limit")
                        .details(format!("allocator={kind} allocated={allocated}")),
                );
                return true;
            }
            if self.concurrent_gc && kind.may_have_concurrent_gc() {
                return false;
            }
            if !grow {
                return true;
            }
            match self.target_footprint.compare_exchange_weak(
                old_target,
                new_footprint,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.log.emit(
                        LogEvent::new(HeapLogLevel::Debug, COMPONENT, "grow")
                            .size(new_footprint)
                            .details(format!("from={old_target} allocator={kind}")),
                    );
                    return false;
                }
                Err(actual) => old_target = actual,
            }
        }
    }

    /// Whether a bulk total of `new_total` bytes should start a concurrent collection.
    #[must_use]
    pub fn should_trigger_concurrent_gc(&self, new_total: usize) -> bool {
        new_total >= self.concurrent_start_bytes.load(Ordering::Relaxed)
    }

    /// Charge freshly obtained bytes; returns the new total.
    pub fn record_bulk_allocation(&self, bytes: usize) -> usize {
        self.num_bytes_allocated.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Return reclaimed bytes. Saturates at zero.
    pub fn record_free(&self, bytes: usize) {
        let previous = self
            .num_bytes_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(bytes))
            })
            .unwrap_or(0);
        debug_assert!(previous >= bytes, "freed {bytes} of {previous} allocated bytes");
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn target_footprint(&self) -> usize {
        self.target_footprint.load(Ordering::Relaxed)
    }

    /// Set the target after a collection, capped at the growth limit.
    pub fn set_target_footprint(&self, bytes: usize) {
        self.target_footprint
            .store(bytes.min(self.growth_limit()), Ordering::Relaxed);
    }

    #[must_use]
    pub fn growth_limit(&self) -> usize {
        self.growth_limit.load(Ordering::Relaxed)
    }

    /// Raise the growth limit to the heap capacity.
    pub fn clear_growth_limit(&self) {
        let previous = self.growth_limit.fetch_max(self.capacity, Ordering::Relaxed);
        if previous < self.capacity {
            self.log.emit(
                LogEvent::new(HeapLogLevel::Info, COMPONENT, "clear_growth_limit")
                    .size(self.capacity)
                    .details(format!("from={previous}")),
            );
        }
    }

    #[must_use]
    pub fn concurrent_start_bytes(&self) -> usize {
        self.concurrent_start_bytes.load(Ordering::Relaxed)
    }

    pub fn set_concurrent_start_bytes(&self, bytes: usize) {
        self.concurrent_start_bytes.store(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_concurrent_gc(&self) -> bool {
        self.concurrent_gc
    }

    #[must_use]
    pub fn snapshot(&self) -> FootprintSnapshot {
        FootprintSnapshot {
            bytes_allocated: self.bytes_allocated(),
            target_footprint: self.target_footprint(),
            growth_limit: self.growth_limit(),
            concurrent_start_bytes: self.concurrent_start_bytes(),
        }
    }
}
