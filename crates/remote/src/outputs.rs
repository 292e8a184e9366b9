//! The boundary to the worker's output store
//!
//! Export needs two things from the execution side: whether a recorded
//! result still has a backing output, and that output resolved into
//! content-addressed remote layers. Outputs can be lazy or already pruned;
//! both are expected and surface as absence, not errors.

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use strata_blobstore::ContentProvider;
use strata_records::LayerDescriptor;

/// Compression requested for resolved remote layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Zstandard-compressed layers
    #[default]
    Zstd,
    /// Layers as materialized, without recompression
    Uncompressed,
}

/// An output resolved into pushable remote form.
pub struct RemoteOutput {
    /// Content-addressed descriptors of the output's layers, base first
    pub descriptors: Vec<LayerDescriptor>,
    /// Source of the layers' compressed content
    pub provider: Arc<dyn ContentProvider>,
}

/// Resolves materialized outputs to pushable remote layers.
#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Whether the backing output still exists.
    async fn exists(&self, output_id: &str) -> Result<bool>;

    /// Resolve an output to remote descriptors plus a content source,
    /// compressing as requested. `None` means the output has no resolvable
    /// remote form and should be skipped.
    async fn resolve_remote(
        &self,
        output_id: &str,
        compression: Compression,
    ) -> Result<Option<RemoteOutput>>;
}
