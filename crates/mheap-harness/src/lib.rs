//! Scenario runner and diagnostics for the mheap allocation engine.
//!
//! - [`scenarios`]: named end-to-end checks against real spaces and heaps.
//! - [`churn`]: seeded alloc/free churn against a large-object space.
//! - [`structured_log`]: JSONL evidence and artifact hashing.

#![forbid(unsafe_code)]

pub mod churn;
pub mod error;
pub mod scenarios;
pub mod structured_log;

pub use churn::{ChurnConfig, ChurnReport, ChurnSpace, run_churn};
pub use error::HarnessError;
pub use scenarios::{ScenarioReport, run_all, run_scenario, scenario_names};
