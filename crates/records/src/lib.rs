//! Cache record model for the Strata build engine
//!
//! This crate defines the plain data exchanged between the local solver
//! cache and the remote cache service:
//! - Content digests addressing layers and records
//! - Cache keys, dependency links and materialized results
//! - Layer descriptors and the importable cache manifest
//! - The `CacheManager` contract the solver programs against, with local,
//!   snapshot (read-only import) and combined implementations

mod digest;
mod error;
mod manager;
mod manifest;
mod records;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use digest::Digest;
pub use manager::{
    CacheKeyStore, CacheManager, CacheOutput, CombinedCacheManager, LinkQuery,
    LocalCacheManager, SnapshotCacheManager,
};
pub use manifest::{CacheManifest, ResultLayers, MANIFEST_VERSION};
pub use records::{
    ANNOTATION_CREATED_AT, ANNOTATION_UNCOMPRESSED, CacheKeyRecord, CacheLayer, LayerAnnotations,
    LayerDescriptor, Link, MEDIA_TYPE_LAYER_ZSTD, ResultRecord,
};
