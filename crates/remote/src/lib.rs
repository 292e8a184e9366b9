//! Distributed cache synchronization for the Strata build engine
//!
//! This crate extends the local solver cache into a shared remote cache:
//! - An HTTP+JSON client for the remote cache service
//! - A layer store moving compressed blobs through presigned URLs
//! - The synchronization manager running periodic import and export cycles
//!   against the service and the object-store backing
//! - Cache-mount synchronization at engine startup and shutdown
//!
//! The solver talks to the manager exactly as it would a purely local cache;
//! reads transparently merge the local store with the latest imported remote
//! snapshot, writes go only to the local store.

pub mod client;
pub mod config;
pub mod redact;

mod error;
mod layers;
mod manager;
mod mountsync;
mod outputs;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use client::{CacheService, HttpCacheService};
pub use config::{BackingStoreConfig, SyncConfig};
pub use layers::ServiceLayerStore;
pub use manager::{LOCAL_CACHE_ID, Manager, ManagerConfig, SyncManager, new_manager};
pub use mountsync::CacheMountSynchronizer;
pub use outputs::{Compression, OutputStore, RemoteOutput};
