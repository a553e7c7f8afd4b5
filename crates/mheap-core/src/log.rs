//! Structured heap decision log.
//!
//! Every space and the allocation front end record notable decisions
//! (growth, refusals, restarts, fatal corruption) into a shared [`HeapLog`].
//! The sink is a bounded ring: once full, the oldest record is dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Severity of a heap log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl HeapLogLevel {
    /// Parse from string (case-insensitive). Unknown input maps to `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "fatal" | "off" | "none" => Self::Fatal,
            _ => Self::Info,
        }
    }
}

/// One heap decision record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapLogRecord {
    /// Monotonic id, unique per [`HeapLog`].
    pub decision_id: u64,
    /// `mheap::<component>::<event>::<id>`.
    pub trace_id: String,
    pub level: HeapLogLevel,
    /// Emitting component (`footprint`, `free-list`, `front-end`, ...).
    pub component: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Builder for a record; ids are assigned by [`HeapLog::emit`].
#[derive(Debug, Clone)]
#[must_use]
pub struct LogEvent {
    level: HeapLogLevel,
    component: &'static str,
    event: &'static str,
    addr: Option<usize>,
    size: Option<usize>,
    outcome: &'static str,
    details: String,
}

impl LogEvent {
    pub fn new(level: HeapLogLevel, component: &'static str, event: &'static str) -> Self {
        Self {
            level,
            component,
            event,
            addr: None,
            size: None,
            outcome: "ok",
            details: String::new(),
        }
    }

    pub fn addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn outcome(mut self, outcome: &'static str) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded, thread-safe sink for [`HeapLogRecord`]s.
#[derive(Debug)]
pub struct HeapLog {
    min_level: HeapLogLevel,
    capacity: usize,
    next_decision_id: AtomicU64,
    dropped: AtomicU64,
    records: Mutex<VecDeque<HeapLogRecord>>,
}

impl Default for HeapLog {
    fn default() -> Self {
        Self::new(HeapLogLevel::Debug, 4096)
    }
}

impl HeapLog {
    #[must_use]
    pub fn new(min_level: HeapLogLevel, capacity: usize) -> Self {
        Self {
            min_level,
            capacity: capacity.max(1),
            next_decision_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            records: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn enabled(&self, level: HeapLogLevel) -> bool {
        level >= self.min_level
    }

    /// Record `event` if its level passes the filter; returns the assigned id.
    pub fn emit(&self, event: LogEvent) -> Option<u64> {
        if !self.enabled(event.level) {
            return None;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let record = HeapLogRecord {
            decision_id,
            trace_id: format!(
                "mheap::{}::{}::{:016x}",
                event.component, event.event, decision_id
            ),
            level: event.level,
            component: event.component,
            event: event.event,
            addr: event.addr,
            size: event.size,
            outcome: event.outcome,
            details: event.details,
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
        Some(decision_id)
    }

    /// Record a fatal heap corruption and abort the current thread of control.
    #[cold]
    #[track_caller]
    pub fn fatal(&self, component: &'static str, event: &'static str, details: String) -> ! {
        self.emit(
            LogEvent::new(HeapLogLevel::Fatal, component, event)
                .outcome("abort")
                .details(details.clone()),
        );
        panic!("heap corruption in {component} ({event}): {details}");
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<HeapLogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Remove and return every buffered record.
    pub fn drain(&self) -> Vec<HeapLogRecord> {
        self.records.lock().drain(..).collect()
    }

    /// Number of buffered records with the given event name.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.records.lock().iter().filter(|r| r.event == event).count()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Serialize the buffered records as JSON Lines.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let records = self.records.lock();
        let mut out = String::new();
        for record in records.iter() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}
