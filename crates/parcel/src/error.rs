//! Error types shared across the control plane core.
//!
//! Every failure surfaced by the engine, cache, or a backend is classified
//! into one of a small set of kinds so callers can make retry and reporting
//! decisions without inspecting message text. Backend-specific error chains
//! are flattened into these kinds at the storage boundary.

use std::time::Duration;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

//================================================================================================
// Types
//================================================================================================

/// Errors distinguished by the control plane core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested key is not present, even after a fresh refresh.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition was violated: an illegal state transition, a backend
    /// rejecting a non-fast-forward write, or a duplicate revision id.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A malformed bundle, invalid revision id, or unknown repository type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend rejected the configured credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend or the function runtime could not be reached; the caller
    /// may retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation's context was canceled before completion.
    #[error("operation canceled")]
    Canceled,

    /// The operation's deadline elapsed before completion.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

//================================================================================================
// Impls
//================================================================================================

impl Error {
    /// A `NotFound` error for the given key.
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    /// A `Conflict` error with the violated precondition.
    pub fn conflict(why: impl std::fmt::Display) -> Self {
        Error::Conflict(why.to_string())
    }

    /// An `InvalidArgument` error describing the rejected input.
    pub fn invalid(why: impl std::fmt::Display) -> Self {
        Error::InvalidArgument(why.to_string())
    }

    /// An `Unavailable` error wrapping a transport failure.
    pub fn unavailable(why: impl std::fmt::Display) -> Self {
        Error::Unavailable(why.to_string())
    }

    /// An `Internal` error wrapping a violated invariant.
    pub fn internal(why: impl std::fmt::Display) -> Self {
        Error::Internal(why.to_string())
    }

    /// Whether retrying the operation may succeed without caller action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::unavailable("connection reset").is_transient());
        assert!(!Error::conflict("tag exists").is_transient());
        assert!(!Error::Canceled.is_transient());
    }
}
