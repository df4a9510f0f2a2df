#![forbid(unsafe_code)]
//! Error types for silt.
//!
//! Defines `SiltError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all silt operations.
#[derive(Debug, Error)]
pub enum SiltError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {field} ({reason})")]
    ConfigInvalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("reservation is stale: the chunk was abandoned or replaced")]
    StaleReservation,

    #[error("publish size mismatch: chunk holds {expected} bytes, got {actual}")]
    PublishSizeMismatch { expected: u64, actual: u64 },

    #[error("replay integrity violation: {detail}")]
    ReplayIntegrity { detail: String },
}

/// Result alias using `SiltError`.
pub type Result<T> = std::result::Result<T, SiltError>;
