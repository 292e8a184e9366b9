//! HTTP+JSON client for the remote cache service

use crate::config::SyncConfig;
use crate::redact::redact_urls;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_records::{CacheKeyRecord, CacheManifest, Digest, LayerDescriptor, Link};
use tracing::debug;

/// Request for [`CacheService::get_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigRequest {
    /// Id of the engine asking for configuration
    pub engine_id: String,
}

/// Request for [`CacheService::update_cache_records`]: the engine's full
/// key/link snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCacheRecordsRequest {
    /// Every cache key in the local store, with its results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_keys: Vec<CacheKeyRecord>,
    /// Every dependency backlink in the local store
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

/// The subset of submitted records the service considers novel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCacheRecordsResponse {
    /// Records the service wants layers for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_records: Vec<ExportRecord>,
}

/// One record the service wants exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    /// The service's digest for the record
    pub digest: Digest,
    /// Id of the locally materialized output backing the record
    pub cache_ref_id: String,
}

/// The layers now associated with an exported record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordLayers {
    /// The service's digest for the record
    pub record_digest: Digest,
    /// Descriptors of the pushed layers, base first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerDescriptor>,
}

/// Request for [`CacheService::update_cache_layers`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCacheLayersRequest {
    /// Layer sets for every record exported this cycle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_records: Vec<RecordLayers>,
}

/// Request for [`CacheService::get_layer_download_url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLayerDownloadUrlRequest {
    /// Digest of the layer to download
    pub digest: Digest,
}

/// Response for [`CacheService::get_layer_download_url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLayerDownloadUrlResponse {
    /// Time-limited download URL
    pub url: String,
}

/// Request for [`CacheService::get_layer_upload_url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLayerUploadUrlRequest {
    /// Digest of the layer to upload
    pub digest: Digest,
}

/// Response for [`CacheService::get_layer_upload_url`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLayerUploadUrlResponse {
    /// The blob already exists upstream; skip the upload
    #[serde(default)]
    pub skip: bool,
    /// Time-limited upload URL
    #[serde(default)]
    pub url: String,
    /// Headers to set on the upload request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Response for [`CacheService::get_cache_mount_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCacheMountConfigResponse {
    /// Cache mounts the service synchronizes for this engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_cache_mounts: Vec<SyncedCacheMount>,
}

/// One synchronized cache mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedCacheMount {
    /// Mount name
    pub name: String,
    /// Digest of the mount's archived contents
    pub digest: Digest,
    /// Size of the archive in bytes
    pub size: u64,
    /// Media type of the archive
    pub media_type: String,
    /// Time-limited download URL for the archive
    pub url: String,
}

/// Request for [`CacheService::get_cache_mount_upload_url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCacheMountUploadUrlRequest {
    /// Mount name being uploaded
    pub cache_name: String,
    /// Digest of the archived contents
    pub digest: Digest,
    /// Size of the archive in bytes
    pub size: u64,
}

/// Response for [`CacheService::get_cache_mount_upload_url`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCacheMountUploadUrlResponse {
    /// The archive already exists upstream; skip the upload
    #[serde(default)]
    pub skip: bool,
    /// Time-limited upload URL
    #[serde(default)]
    pub url: String,
    /// Headers to set on the upload request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// The remote cache service's RPC surface.
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Fetch the synchronization configuration for this engine.
    async fn get_config(&self, req: GetConfigRequest) -> Result<SyncConfig>;

    /// Submit the engine's key/link snapshot; the service replies with the
    /// records it considers novel and wants layers for.
    async fn update_cache_records(
        &self,
        req: UpdateCacheRecordsRequest,
    ) -> Result<UpdateCacheRecordsResponse>;

    /// Report the layer digests now associated with exported records.
    async fn update_cache_layers(&self, req: UpdateCacheLayersRequest) -> Result<()>;

    /// Fetch the importable cache manifest.
    async fn import_cache(&self) -> Result<CacheManifest>;

    /// Presigned download URL for a layer blob.
    async fn get_layer_download_url(
        &self,
        req: GetLayerDownloadUrlRequest,
    ) -> Result<GetLayerDownloadUrlResponse>;

    /// Presigned upload URL for a layer blob, or a skip marker if the blob
    /// already exists upstream.
    async fn get_layer_upload_url(
        &self,
        req: GetLayerUploadUrlRequest,
    ) -> Result<GetLayerUploadUrlResponse>;

    /// Which cache mounts the service synchronizes for this engine.
    async fn get_cache_mount_config(&self) -> Result<GetCacheMountConfigResponse>;

    /// Presigned upload URL for a cache-mount archive.
    async fn get_cache_mount_upload_url(
        &self,
        req: GetCacheMountUploadUrlRequest,
    ) -> Result<GetCacheMountUploadUrlResponse>;
}

const ROUTE_CONFIG: &str = "config";
const ROUTE_RECORDS: &str = "records";
const ROUTE_LAYERS: &str = "layers";
const ROUTE_IMPORT: &str = "import";
const ROUTE_LAYER_DOWNLOAD_URL: &str = "layer-download-url";
const ROUTE_LAYER_UPLOAD_URL: &str = "layer-upload-url";
const ROUTE_CACHE_MOUNT_CONFIG: &str = "cache-mount-config";
const ROUTE_CACHE_MOUNT_UPLOAD_URL: &str = "cache-mount-upload-url";

/// HTTP implementation of [`CacheService`].
///
/// Every operation is a JSON POST under the service base URL, optionally
/// authenticated with a bearer token. Non-success responses surface as
/// [`Error::Service`] with presigned URLs redacted from the body.
pub struct HttpCacheService {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpCacheService {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("strata-engine")
            .build()
            .map_err(|e| Error::transport("client construction", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    async fn call(&self, route: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        let url = format!("{}/{route}", self.base_url);
        debug!(%url, "calling cache service");
        let mut req = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| Error::transport(route, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::service(route, status.as_u16(), redact_urls(&body)));
        }
        Ok(resp)
    }

    async fn post<Resp: DeserializeOwned>(
        &self,
        route: &str,
        body: &impl Serialize,
    ) -> Result<Resp> {
        self.call(route, body)
            .await?
            .json()
            .await
            .map_err(|e| Error::transport(route, e))
    }

    async fn post_ack(&self, route: &str, body: &impl Serialize) -> Result<()> {
        self.call(route, body).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheService for HttpCacheService {
    async fn get_config(&self, req: GetConfigRequest) -> Result<SyncConfig> {
        self.post(ROUTE_CONFIG, &req).await
    }

    async fn update_cache_records(
        &self,
        req: UpdateCacheRecordsRequest,
    ) -> Result<UpdateCacheRecordsResponse> {
        self.post(ROUTE_RECORDS, &req).await
    }

    async fn update_cache_layers(&self, req: UpdateCacheLayersRequest) -> Result<()> {
        self.post_ack(ROUTE_LAYERS, &req).await
    }

    async fn import_cache(&self) -> Result<CacheManifest> {
        self.post(ROUTE_IMPORT, &serde_json::json!({})).await
    }

    async fn get_layer_download_url(
        &self,
        req: GetLayerDownloadUrlRequest,
    ) -> Result<GetLayerDownloadUrlResponse> {
        self.post(ROUTE_LAYER_DOWNLOAD_URL, &req).await
    }

    async fn get_layer_upload_url(
        &self,
        req: GetLayerUploadUrlRequest,
    ) -> Result<GetLayerUploadUrlResponse> {
        self.post(ROUTE_LAYER_UPLOAD_URL, &req).await
    }

    async fn get_cache_mount_config(&self) -> Result<GetCacheMountConfigResponse> {
        self.post(ROUTE_CACHE_MOUNT_CONFIG, &serde_json::json!({}))
            .await
    }

    async fn get_cache_mount_upload_url(
        &self,
        req: GetCacheMountUploadUrlRequest,
    ) -> Result<GetCacheMountUploadUrlResponse> {
        self.post(ROUTE_CACHE_MOUNT_UPLOAD_URL, &req).await
    }
}
