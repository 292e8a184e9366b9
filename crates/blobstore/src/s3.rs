//! S3-compatible object-store backing

use crate::store::{BlobReaderAt, BlobStore, ContentProvider, PushOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use strata_records::{Digest, LayerDescriptor};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Object-store parameters for the S3 backing.
///
/// Credentials and region fall back to the ambient AWS environment when not
/// set explicitly; endpoint and path-style overrides support S3-compatible
/// stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3StoreConfig {
    /// Bucket holding cache blobs and mounts
    #[serde(default)]
    pub bucket: String,
    /// AWS region of the bucket
    #[serde(default)]
    pub region: String,
    /// Key prefix under which all cache objects live
    #[serde(default)]
    pub prefix: String,
    /// Name of this engine under the prefix
    #[serde(default)]
    pub name: String,
    /// Endpoint override for S3-compatible stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    /// Use path-style addressing (required by some S3-compatible stores)
    #[serde(default)]
    pub use_path_style: bool,
    /// Static access key; the ambient environment is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    /// Static secret key; the ambient environment is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    /// Session token accompanying static credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Cache mount names synchronized through this store
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synchronized_cache_mounts: Vec<String>,
}

impl S3StoreConfig {
    /// The configured bucket, falling back to `AWS_BUCKET`.
    #[must_use]
    pub fn resolved_bucket(&self) -> String {
        if self.bucket.is_empty() {
            std::env::var("AWS_BUCKET").unwrap_or_default()
        } else {
            self.bucket.clone()
        }
    }

    /// The configured region, falling back to `AWS_REGION`.
    #[must_use]
    pub fn resolved_region(&self) -> String {
        if self.region.is_empty() {
            std::env::var("AWS_REGION").unwrap_or_default()
        } else {
            self.region.clone()
        }
    }

    /// Object key of a layer blob.
    #[must_use]
    pub fn blob_key(&self, digest: &Digest) -> String {
        format!("{}blobs/{digest}", self.prefix)
    }

    /// Key prefix under which every engine's cache mounts live.
    #[must_use]
    pub fn cache_mounts_root(&self) -> String {
        format!("{}cachemounts/", self.prefix)
    }

    /// Key prefix of one engine's copy of one cache mount.
    #[must_use]
    pub fn cache_mount_prefix(&self, engine: &str, mount: &str) -> String {
        format!("{}cachemounts/{engine}/{mount}/", self.prefix)
    }

    /// Build an S3 client for this configuration, layered over the ambient
    /// AWS environment (credential chain, shared config).
    pub async fn client(&self) -> Client {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        let region = self.resolved_region();
        if !region.is_empty() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let base = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let (Some(access_key), Some(secret_key)) =
            (self.access_key_id.as_deref(), self.secret_access_key.as_deref())
        {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                self.session_token.clone(),
                None,
                "static",
            ));
        }
        if let Some(endpoint) = self.endpoint_url.as_deref() {
            builder = builder
                .endpoint_url(endpoint)
                .force_path_style(self.use_path_style);
        }
        Client::from_conf(builder.build())
    }
}

/// Blob store backed by an S3-compatible object store.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    config: S3StoreConfig,
}

impl S3BlobStore {
    /// Connect a store for `config`.
    pub async fn new(config: S3StoreConfig) -> Self {
        let client = config.client().await;
        Self::from_client(client, config)
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn from_client(client: Client, config: S3StoreConfig) -> Self {
        Self {
            client,
            bucket: config.resolved_bucket(),
            config,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(Error::store("HeadObject", err)),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn push_layer(
        &self,
        desc: &LayerDescriptor,
        provider: &dyn ContentProvider,
    ) -> Result<PushOutcome> {
        let key = self.config.blob_key(&desc.digest);
        if self.exists(&key).await? {
            debug!(digest = %desc.digest, "blob already present, skipping upload");
            return Ok(PushOutcome::AlreadyExists);
        }

        // The store wants the full body (and its length) up front, so the
        // layer is staged through memory rather than streamed.
        let mut reader = provider.open(desc).await?;
        let mut content = Vec::with_capacity(usize::try_from(desc.size).unwrap_or(0));
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| Error::io_no_path(e, "read layer content"))?;

        debug!(digest = %desc.digest, size = content.len(), "uploading blob");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|err| Error::store("PutObject", err))?;
        Ok(PushOutcome::Uploaded)
    }

    async fn reader_at(&self, desc: &LayerDescriptor) -> Result<Box<dyn BlobReaderAt>> {
        Ok(Box::new(S3ReaderAt {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.config.blob_key(&desc.digest),
            size: desc.size,
            current: None,
        }))
    }
}

/// Reader optimized for the content pipeline's sequential 1MB-chunk access
/// pattern: the object stream is opened once and consumed in order. A
/// non-sequential read re-opens the stream at the requested offset, which is
/// slow and logged since it should not happen in practice.
struct S3ReaderAt {
    client: Client,
    bucket: String,
    key: String,
    size: u64,

    current: Option<OpenStream>,
}

struct OpenStream {
    offset: u64,
    body: ByteStream,
    buffered: Bytes,
}

#[async_trait]
impl BlobReaderAt for S3ReaderAt {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self
            .current
            .as_ref()
            .is_none_or(|open| open.offset != offset)
        {
            if let Some(open) = &self.current {
                warn!(
                    key = %self.key,
                    expected = open.offset,
                    requested = offset,
                    "non-sequential blob read; re-opening object stream"
                );
            }
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .range(format!("bytes={offset}-"))
                .send()
                .await
                .map_err(|err| Error::store("GetObject", err))?;
            self.current = Some(OpenStream {
                offset,
                body: resp.body,
                buffered: Bytes::new(),
            });
        }

        let Some(open) = self.current.as_mut() else {
            return Ok(0);
        };
        while open.buffered.is_empty() {
            match open
                .body
                .try_next()
                .await
                .map_err(|err| Error::store("GetObject body", err))?
            {
                Some(chunk) => open.buffered = chunk,
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
