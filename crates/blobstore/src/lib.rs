//! Content-addressed blob and layer storage for the Strata build engine
//!
//! This crate defines the abstract store that cache export pushes compressed
//! result layers through, and cache import reads them back from:
//! - The [`BlobStore`] contract: probe-then-upload pushes and random-access
//!   reads optimized for the content pipeline's sequential access pattern
//! - An S3-compatible object-store backing
//! - An in-memory backing for tests and embedded configurations
//! - A generic file-sync executor used by cache-mount synchronization
//!
//! Blobs are immutable once pushed under their digest; re-pushing an
//! existing digest is a no-op after an existence probe.

mod error;
mod s3;
mod store;
mod sync;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use s3::{S3BlobStore, S3StoreConfig};
pub use store::{
    BlobReaderAt, BlobStore, BytesProvider, ContentProvider, ContentStream, MemoryBlobStore,
    PushOutcome,
};
pub use sync::{FileSyncExecutor, S3FileSync};
