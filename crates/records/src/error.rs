//! Error types for the record model

use miette::Diagnostic;
use thiserror::Error;

/// Error type for cache record operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A digest string did not have the expected `algorithm:hex` shape
    #[error("invalid digest: {value}")]
    #[diagnostic(code(strata::records::invalid_digest))]
    InvalidDigest {
        /// The rejected digest string
        value: String,
    },

    /// A manifest layer cannot be addressed without the annotation
    #[error("missing {annotation} annotation for layer {digest}")]
    #[diagnostic(
        code(strata::records::missing_annotation),
        help("the exporting engine must record the uncompressed digest for every pushed layer")
    )]
    MissingAnnotation {
        /// Blob digest of the unaddressable layer
        digest: String,
        /// The absent annotation key
        annotation: String,
    },

    /// A manifest result references a layer the manifest does not carry
    #[error("unknown layer {digest} referenced by result {result_id}")]
    #[diagnostic(code(strata::records::unknown_layer))]
    UnknownLayer {
        /// The dangling layer digest
        digest: String,
        /// The referencing result id
        result_id: String,
    },

    /// Cache key or result not found
    #[error("cache record not found: {id}")]
    #[diagnostic(code(strata::records::not_found))]
    NotFound {
        /// The id that was looked up
        id: String,
    },

    /// Write attempted against a read-only manager
    #[error("cache manager {id} is read-only")]
    #[diagnostic(code(strata::records::read_only))]
    ReadOnly {
        /// Id of the read-only manager
        id: String,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(strata::records::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create an invalid-digest error
    #[must_use]
    pub fn invalid_digest(value: impl Into<String>) -> Self {
        Self::InvalidDigest {
            value: value.into(),
        }
    }

    /// Create a missing-annotation error
    #[must_use]
    pub fn missing_annotation(digest: impl Into<String>, annotation: impl Into<String>) -> Self {
        Self::MissingAnnotation {
            digest: digest.into(),
            annotation: annotation.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

/// Result type for cache record operations
pub type Result<T> = std::result::Result<T, Error>;
