//! Error types for the function runtime.
//!
//! Failures are split along the line the callers care about: a function
//! that ran and rejected its input is *not* an error here (it is data in
//! the response); everything in this enum is a runtime problem - transport,
//! startup, or resource bounds.

use std::time::Duration;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the function runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No enabled execution mode can run the requested image.
    #[error("no enabled runtime supports image '{0}'")]
    Unsupported(String),

    /// The function process could not be started.
    #[error("failed to start function '{image}': {reason}")]
    Spawn {
        /// The image whose process failed to start.
        image: String,
        /// The underlying failure.
        reason: String,
    },

    /// The evaluation exceeded its time bound and was canceled.
    #[error("function '{image}' timed out after {timeout:?}")]
    Timeout {
        /// The image that timed out.
        image: String,
        /// The enforced bound.
        timeout: Duration,
    },

    /// A sandbox or the wire to it failed.
    #[error("function runtime transport failed: {0}")]
    Transport(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps a runtime failure onto its wire status.
    pub fn into_status(self) -> tonic::Status {
        match &self {
            Error::Unsupported(_) => tonic::Status::invalid_argument(self.to_string()),
            Error::Timeout { .. } => tonic::Status::deadline_exceeded(self.to_string()),
            Error::Transport(_) => tonic::Status::unavailable(self.to_string()),
            Error::Spawn { .. } | Error::Internal(_) => tonic::Status::internal(self.to_string()),
        }
    }
}
