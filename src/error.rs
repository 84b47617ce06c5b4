//! Error types for agglo.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for agglo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for agglo operations.
///
/// Fatal conditions (configuration, checkpoint I/O) unwind with phase and
/// file context and are never retried; cancellation aborts the current
/// document only.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed setup (bad thresholds, empty mention list, missing gold).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint read/write failure, with the phase and file it occurred in.
    #[error("Checkpoint failure during {phase} ({path}): {message}")]
    Checkpoint {
        /// Training phase the failure occurred in (e.g. "save-model").
        phase: String,
        /// File the failure relates to.
        path: PathBuf,
        /// Underlying error rendered as text.
        message: String,
    },

    /// Cooperative cancellation; the current document produced no output.
    #[error("Cancelled")]
    Cancelled,

    /// Invariant violation. Indicates a programmer error, not recoverable.
    #[error("Data consistency violation: {0}")]
    DataConsistency(String),
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Create a checkpoint error with phase and file context.
    pub fn checkpoint(
        phase: impl Into<String>,
        path: impl Into<PathBuf>,
        err: impl std::fmt::Display,
    ) -> Self {
        Error::Checkpoint {
            phase: phase.into(),
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a data consistency error.
    pub fn data_consistency(msg: impl Into<String>) -> Self {
        Error::DataConsistency(msg.into())
    }
}
