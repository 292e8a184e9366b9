//! Error types for blob storage

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for blob store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Object store request failed
    #[error("object store {operation} failed: {message}")]
    #[diagnostic(code(strata::blobstore::store))]
    Store {
        /// Operation that failed (e.g. "HeadObject", "PutObject")
        operation: String,
        /// Error reported by the store
        message: String,
    },

    /// I/O error during blob operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(code(strata::blobstore::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g. "read", "write", "create_dir_all")
        operation: String,
    },

    /// Blob not present in the store
    #[error("blob {digest} not found")]
    #[diagnostic(code(strata::blobstore::not_found))]
    NotFound {
        /// The missing blob's digest
        digest: String,
    },

    /// Record model error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Records(#[from] strata_records::Error),
}

impl Error {
    /// Create an object-store error
    #[must_use]
    pub fn store(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(digest: impl ToString) -> Self {
        Self::NotFound {
            digest: digest.to_string(),
        }
    }
}

/// Result type for blob store operations
pub type Result<T> = std::result::Result<T, Error>;
