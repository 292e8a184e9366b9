//! Error types for cache synchronization

use miette::Diagnostic;
use thiserror::Error;

/// Error type for cache synchronization operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid or unusable synchronization configuration
    #[error("cache sync configuration error: {message}")]
    #[diagnostic(
        code(strata::remote::configuration),
        help("the manager must not start half-configured; fix the remote cache configuration")
    )]
    Configuration {
        /// Description of the configuration problem
        message: String,
    },

    /// The cache service answered with a non-success status
    #[error("cache service {operation} failed with status {status}: {message}")]
    #[diagnostic(code(strata::remote::service))]
    Service {
        /// The logical operation that failed
        operation: String,
        /// HTTP status returned by the service
        status: u16,
        /// Response body, with presigned URLs redacted
        message: String,
    },

    /// The cache service could not be reached or its response not decoded
    #[error("cache service {operation} transport failed: {message}")]
    #[diagnostic(code(strata::remote::transport))]
    Transport {
        /// The logical operation that failed
        operation: String,
        /// The underlying transport error
        message: String,
    },

    /// Record model error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Records(#[from] strata_records::Error),

    /// Blob store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    BlobStore(#[from] strata_blobstore::Error),
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a service error; the message must already be redacted
    #[must_use]
    pub fn service(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Service {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a transport error
    #[must_use]
    pub fn transport(operation: impl Into<String>, source: impl ToString) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
        }
    }
}

/// Result type for cache synchronization operations
pub type Result<T> = std::result::Result<T, Error>;
