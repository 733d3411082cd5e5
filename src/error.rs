//! Error types for nano-specinfer.
//!
//! Every variant is fatal for the forward call that produced it. Nothing in
//! this crate retries; recovery (e.g. dropping a malformed request from the
//! next batch) belongs to the request manager.

use thiserror::Error;

/// Result type alias for nano-specinfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-specinfer.
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported head dimension, group size, page size, dtype or mode.
    #[error("configuration error: {0}")]
    Config(String),

    /// A fixed-size buffer would overflow.
    #[error("capacity exceeded: {what} needs {requested}, limit is {limit}")]
    Capacity {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    /// A committed token would move forward in the cache.
    #[error(
        "commit ordering violated for request {request}: destination {destination} > source {source_depth}"
    )]
    CommitOrdering {
        request: usize,
        source_depth: usize,
        destination: usize,
    },

    /// Collective communication failed.
    #[error("collective communication failed: {0}")]
    Collective(String),

    /// Device allocator budget exhausted.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Operation is not supported by these attention variants.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Shape mismatch between accessors.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn capacity(what: &'static str, requested: usize, limit: usize) -> Self {
        Error::Capacity {
            what,
            requested,
            limit,
        }
    }
}
