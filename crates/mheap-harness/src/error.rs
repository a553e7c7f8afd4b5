//! Harness error type.

use mheap_core::HeapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("invalid seed '{0}'")]
    InvalidSeed(String),
}
