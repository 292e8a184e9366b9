//! Blob store contracts and the in-memory backing

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use strata_records::{Digest, LayerDescriptor};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Byte stream yielding a layer's compressed content.
pub type ContentStream = Pin<Box<dyn AsyncRead + Send>>;

/// Source of local layer content for pushes.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Open the content addressed by `desc` for reading.
    async fn open(&self, desc: &LayerDescriptor) -> Result<ContentStream>;
}

/// Result of a layer push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The blob was uploaded
    Uploaded,
    /// The blob already existed under its digest; nothing was transferred
    AlreadyExists,
}

/// Abstract push/pull of content-addressed compressed blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the layer if its digest is not already present.
    async fn push_layer(
        &self,
        desc: &LayerDescriptor,
        provider: &dyn ContentProvider,
    ) -> Result<PushOutcome>;

    /// Random-access reader over the layer's compressed content.
    async fn reader_at(&self, desc: &LayerDescriptor) -> Result<Box<dyn BlobReaderAt>>;
}

/// Random-access reader handed to the content pipeline.
///
/// The pipeline reads sequentially in large chunks; implementations keep a
/// stream open for that pattern and only pay a re-open for non-sequential
/// offsets, logging when they do since it indicates an access-pattern
/// assumption violation elsewhere.
#[async_trait]
pub trait BlobReaderAt: Send {
    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of blob.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Total size of the blob in bytes.
    fn size(&self) -> u64;
}

/// Content provider over a fixed set of in-memory blobs.
#[derive(Default)]
pub struct BytesProvider {
    blobs: HashMap<Digest, Bytes>,
}

impl BytesProvider {
    /// An empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add content for `digest`.
    #[must_use]
    pub fn with(mut self, digest: Digest, content: impl Into<Bytes>) -> Self {
        self.blobs.insert(digest, content.into());
        self
    }
}

#[async_trait]
impl ContentProvider for BytesProvider {
    async fn open(&self, desc: &LayerDescriptor) -> Result<ContentStream> {
        let content = self
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| Error::not_found(&desc.digest))?;
        Ok(Box::pin(std::io::Cursor::new(content)))
    }
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<Digest, Bytes>,
    uploads: usize,
}

/// In-process blob store used by tests and embedded engine configurations.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryState>,
}

impl MemoryBlobStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of uploads actually performed (existence-probe skips excluded).
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    /// Whether the store holds a blob under `digest`.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.lock().blobs.contains_key(digest)
    }

    /// Seed the store with a blob, bypassing the upload counter.
    pub fn insert(&self, digest: Digest, content: impl Into<Bytes>) {
        self.lock().blobs.insert(digest, content.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn push_layer(
        &self,
        desc: &LayerDescriptor,
        provider: &dyn ContentProvider,
    ) -> Result<PushOutcome> {
        if self.lock().blobs.contains_key(&desc.digest) {
            debug!(digest = %desc.digest, "blob already present, skipping upload");
            return Ok(PushOutcome::AlreadyExists);
        }

        let mut reader = provider.open(desc).await?;
        let mut content = Vec::with_capacity(usize::try_from(desc.size).unwrap_or(0));
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| Error::io_no_path(e, "read layer content"))?;

        let mut state = self.lock();
        state.blobs.insert(desc.digest.clone(), content.into());
        state.uploads += 1;
        Ok(PushOutcome::Uploaded)
    }

    async fn reader_at(&self, desc: &LayerDescriptor) -> Result<Box<dyn BlobReaderAt>> {
        let content = self
            .lock()
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| Error::not_found(&desc.digest))?;
        Ok(Box::new(MemoryReaderAt { content }))
    }
}

struct MemoryReaderAt {
    content: Bytes,
}

#[async_trait]
impl BlobReaderAt for MemoryReaderAt {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        if offset >= self.content.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.content.len() - offset);
        buf[..n].copy_from_slice(&self.content[offset..offset + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.content.len() as u64
    }
}
