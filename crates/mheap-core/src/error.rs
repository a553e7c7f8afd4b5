//! Error types.

use crate::dispatch::AllocatorKind;

/// Recoverable allocation failure, left pending on the mutator that hit it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error(
        "failed to allocate {requested} bytes with the {allocator} allocator \
         ({bytes_allocated} bytes allocated, target footprint {target_footprint}, \
         growth limit {growth_limit})"
    )]
    OutOfMemory {
        requested: usize,
        allocator: AllocatorKind,
        bytes_allocated: usize,
        target_footprint: usize,
        growth_limit: usize,
    },
    #[error("allocation restarted {restarts} times without a stable allocator configuration")]
    RestartLimit { restarts: usize },
}

impl AllocError {
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Failure to build or verify a heap component.
#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("invalid heap configuration: {0}")]
    Config(String),
    #[error("failed to map {size} bytes for {name}: {source}")]
    Map {
        name: String,
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("{space}: invariant violated: {message}")]
    Invariant { space: String, message: String },
}

impl HeapError {
    pub(crate) fn map(name: &str, size: usize, source: std::io::Error) -> Self {
        Self::Map {
            name: name.to_string(),
            size,
            source,
        }
    }

    pub(crate) fn invariant(space: &str, message: impl Into<String>) -> Self {
        Self::Invariant {
            space: space.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_message_names_allocator() {
        let err = AllocError::OutOfMemory {
            requested: 64,
            allocator: AllocatorKind::LargeObject,
            bytes_allocated: 10,
            target_footprint: 20,
            growth_limit: 30,
        };
        let msg = err.to_string();
        assert!(msg.contains("64 bytes"), "{msg}");
        assert!(msg.contains("large-object"), "{msg}");
        assert!(err.is_out_of_memory());
        assert!(!AllocError::RestartLimit { restarts: 3 }.is_out_of_memory());
    }

    #[test]
    fn test_map_error_keeps_source() {
        use std::error::Error as _;
        let err = HeapError::map("space", 4096, std::io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("failed to map 4096 bytes for space"));
    }
}
