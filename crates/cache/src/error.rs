//! Error types for the call cache

use miette::Diagnostic;
use thiserror::Error;

/// Error type for cached call operations.
///
/// The type is cheap to clone because a failed computation propagates the
/// same error value to every caller currently waiting on it.
#[derive(Error, Debug, Clone, Diagnostic, PartialEq, Eq)]
pub enum Error {
    /// A call transitively waits on its own cache key and would deadlock
    #[error("recursive call detected")]
    #[diagnostic(
        code(strata::cache::recursive_call),
        help("a computation may not wait on its own key in the same cache; derive a distinct key for the nested call")
    )]
    RecursiveCall,

    /// The caller's own context was canceled while waiting
    #[error("cached call canceled")]
    #[diagnostic(code(strata::cache::canceled))]
    Canceled,

    /// The computation itself failed
    #[error("{message}")]
    #[diagnostic(code(strata::cache::compute))]
    Compute {
        /// Failure reported by the computation
        message: String,
    },
}

impl Error {
    /// Create a computation error
    #[must_use]
    pub fn compute(msg: impl Into<String>) -> Self {
        Self::Compute {
            message: msg.into(),
        }
    }
}

/// Result type for cached call operations
pub type Result<T> = std::result::Result<T, Error>;
