//! Layer transfer through the cache service's presigned URLs

use crate::client::{CacheService, GetLayerDownloadUrlRequest, GetLayerUploadUrlRequest};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use strata_blobstore::{
    BlobReaderAt, BlobStore, ContentProvider, Error as StoreError, PushOutcome,
    Result as StoreResult,
};
use strata_records::LayerDescriptor;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Blob store backed by the cache service's presigned URLs.
///
/// The upload-URL response's skip flag doubles as the existence probe: the
/// service owns the backing store and already knows which digests it holds.
pub struct ServiceLayerStore {
    service: Arc<dyn CacheService>,
    http: reqwest::Client,
}

impl ServiceLayerStore {
    /// Create a layer store speaking through `service`.
    #[must_use]
    pub fn new(service: Arc<dyn CacheService>) -> Self {
        Self {
            service,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlobStore for ServiceLayerStore {
    async fn push_layer(
        &self,
        desc: &LayerDescriptor,
        provider: &dyn ContentProvider,
    ) -> StoreResult<PushOutcome> {
        let resp = self
            .service
            .get_layer_upload_url(GetLayerUploadUrlRequest {
                digest: desc.digest.clone(),
            })
            .await
            .map_err(|e| StoreError::store("GetLayerUploadURL", e))?;
        if resp.skip {
            debug!(digest = %desc.digest, "blob already present upstream, skipping upload");
            return Ok(PushOutcome::AlreadyExists);
        }

        let mut reader = provider.open(desc).await?;
        let mut content = Vec::with_capacity(usize::try_from(desc.size).unwrap_or(0));
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| StoreError::io_no_path(e, "read layer content"))?;

        debug!(digest = %desc.digest, size = content.len(), "uploading blob");
        let mut req = self.http.put(&resp.url).body(content);
        for (name, value) in &resp.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let upload = req
            .send()
            .await
            .map_err(|e| StoreError::store("upload layer", e))?;
        if !upload.status().is_success() {
            return Err(StoreError::store(
                "upload layer",
                format!("status {}", upload.status()),
            ));
        }
        Ok(PushOutcome::Uploaded)
    }

    async fn reader_at(&self, desc: &LayerDescriptor) -> StoreResult<Box<dyn BlobReaderAt>> {
        let resp = self
            .service
            .get_layer_download_url(GetLayerDownloadUrlRequest {
                digest: desc.digest.clone(),
            })
            .await
            .map_err(|e| StoreError::store("GetLayerDownloadURL", e))?;
        Ok(Box::new(HttpReaderAt {
            http: self.http.clone(),
            url: resp.url,
            size: desc.size,
            current: None,
        }))
    }
}

/// Ranged-GET reader with the same sequential-read optimization as the
/// object-store reader: one open stream consumed in order, re-opened (and
/// logged) only on a non-sequential offset.
struct HttpReaderAt {
    http: reqwest::Client,
    url: String,
    size: u64,

    current: Option<OpenStream>,
}

struct OpenStream {
    offset: u64,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffered: Bytes,
}

#[async_trait]
impl BlobReaderAt for HttpReaderAt {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        if self
            .current
            .as_ref()
            .is_none_or(|open| open.offset != offset)
        {
            if let Some(open) = &self.current {
                warn!(
                    expected = open.offset,
                    requested = offset,
                    "non-sequential blob read; re-opening download stream"
                );
            }
            let resp = self
                .http
                .get(&self.url)
                .header(reqwest::header::RANGE, format!("bytes={offset}-"))
                .send()
                .await
                .map_err(|e| StoreError::store("download layer", e))?;
            if !resp.status().is_success() {
                return Err(StoreError::store(
                    "download layer",
                    format!("status {}", resp.status()),
                ));
            }
            self.current = Some(OpenStream {
                offset,
                body: resp.bytes_stream().boxed(),
                buffered: Bytes::new(),
            });
        }

        let Some(open) = self.current.as_mut() else {
            return Ok(0);
        };
        while open.buffered.is_empty() {
            match open.body.next().await {
                Some(chunk) => {
                    open.buffered =
                        chunk.map_err(|e| StoreError::store("download layer body", e))?;
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(open.buffered.len());
        buf[..n].copy_from_slice(&open.buffered[..n]);
        open.buffered.advance(n);
        open.offset += n as u64;
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
