//! The distributed cache synchronization manager
//!
//! The manager exposes the same read/write surface as the local cache and
//! transparently merges in the latest imported remote snapshot. Two
//! background loops reconcile with the remote service: periodic Import
//! refreshes the snapshot, periodic Export pushes freshly completed local
//! results upstream. A final export always runs at shutdown.

use crate::client::{
    CacheService, GetConfigRequest, HttpCacheService, RecordLayers, UpdateCacheLayersRequest,
    UpdateCacheRecordsRequest,
};
use crate::config::{BackingStoreConfig, SyncConfig};
use crate::layers::ServiceLayerStore;
use crate::mountsync::CacheMountSynchronizer;
use crate::outputs::{Compression, OutputStore};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_blobstore::{BlobStore, S3FileSync};
use strata_records::{
    CacheKeyRecord, CacheKeyStore, CacheManager, CacheOutput, CombinedCacheManager, Digest,
    LinkQuery, Link, ResultRecord, Result as RecordsResult, SnapshotCacheManager,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Id of the local cache manager.
pub const LOCAL_CACHE_ID: &str = "local";

const MANAGER_ID: &str = "engine-cache";

/// Bound on one background import cycle.
const BACKGROUND_IMPORT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The solver-facing cache surface plus the manager's lifecycle operations.
#[async_trait]
pub trait Manager: CacheManager {
    /// Pull configured cache mounts from remote storage into their local
    /// mount points.
    async fn start_cache_mount_synchronization(&self) -> Result<()>;

    /// Signal shutdown, push cache mounts back, run the final export and
    /// wait for the export loop to finish.
    async fn close(&self) -> Result<()>;
}

/// Collaborators and settings for constructing a manager.
pub struct ManagerConfig {
    /// Base URL of the remote cache service; `None` disables remote caching
    pub service_url: Option<String>,
    /// Bearer token for the service; `None` disables remote caching
    pub token: Option<String>,
    /// Id of this engine
    pub engine_id: String,
    /// The local cache manager; always the writer
    pub local: Arc<dyn CacheManager>,
    /// Walkable view of the local key store for export
    pub key_store: Arc<dyn CacheKeyStore>,
    /// Resolves materialized outputs to pushable layers
    pub output_store: Arc<dyn OutputStore>,
    /// Directory containing local cache mount points
    pub mounts_dir: PathBuf,
    /// Layer transfer override; defaults to the service's presigned URLs
    pub layer_store: Option<Arc<dyn BlobStore>>,
}

/// Construct a cache manager from configuration.
///
/// Without a service URL and token this is a pass-through around the local
/// cache. With one, remote configuration is fetched and validated and one
/// synchronous import must succeed; any failure aborts construction rather
/// than silently degrading to local-only caching.
pub async fn new_manager(config: ManagerConfig) -> Result<Arc<dyn Manager>> {
    let has_service = config.service_url.as_deref().is_some_and(|u| !u.is_empty())
        && config.token.as_deref().is_some_and(|t| !t.is_empty());
    if !has_service {
        debug!("no cache service configured; using the local cache only");
        return Ok(Arc::new(PassthroughManager {
            local: config.local.clone(),
        }));
    }

    let url = config.service_url.clone().unwrap_or_default();
    debug!(url = %url, "using cache service");
    let service = Arc::new(HttpCacheService::new(url, config.token.clone())?);
    let manager: Arc<dyn Manager> = SyncManager::with_service(service, config).await?;
    Ok(manager)
}

/// Pass-through manager used when no remote service is configured.
struct PassthroughManager {
    local: Arc<dyn CacheManager>,
}

#[async_trait]
impl CacheManager for PassthroughManager {
    fn id(&self) -> &str {
        self.local.id()
    }

    async fn query(&self, link: &LinkQuery) -> RecordsResult<Vec<CacheKeyRecord>> {
        self.local.query(link).await
    }

    async fn records(&self, key_id: &str) -> RecordsResult<Vec<ResultRecord>> {
        self.local.records(key_id).await
    }

    async fn load(&self, record: &ResultRecord) -> RecordsResult<CacheOutput> {
        self.local.load(record).await
    }

    async fn save(
        &self,
        key_id: &str,
        links: &[Link],
        output: CacheOutput,
        created_at: DateTime<Utc>,
    ) -> RecordsResult<ResultRecord> {
        self.local.save(key_id, links, output, created_at).await
    }
}

#[async_trait]
impl Manager for PassthroughManager {
    async fn start_cache_mount_synchronization(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct Shared {
    service: Arc<dyn CacheService>,
    layer_store: Arc<dyn BlobStore>,
    key_store: Arc<dyn CacheKeyStore>,
    output_store: Arc<dyn OutputStore>,
    local: Arc<dyn CacheManager>,
    config: SyncConfig,
    engine_id: String,
    mounts_dir: PathBuf,

    /// the swappable combined (local ∪ imported) manager
    inner: RwLock<Arc<dyn CacheManager>>,
    shutdown: CancellationToken,
    mount_sync: Mutex<Option<CacheMountSynchronizer>>,
}

/// Manager synchronizing the local cache with a remote cache service.
pub struct SyncManager {
    shared: Arc<Shared>,
    export_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("engine_id", &self.shared.engine_id)
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Construct against an already-connected service client. Seam for
    /// tests and alternative transports; production goes through
    /// [`new_manager`].
    pub async fn with_service(
        service: Arc<dyn CacheService>,
        config: ManagerConfig,
    ) -> Result<Arc<Self>> {
        let sync_config = service
            .get_config(GetConfigRequest {
                engine_id: config.engine_id.clone(),
            })
            .await?;
        sync_config.validate()?;

        let layer_store = config
            .layer_store
            .unwrap_or_else(|| Arc::new(ServiceLayerStore::new(service.clone())));

        let shared = Arc::new(Shared {
            service,
            layer_store,
            key_store: config.key_store,
            output_store: config.output_store,
            local: config.local.clone(),
            config: sync_config,
            engine_id: config.engine_id,
            mounts_dir: config.mounts_dir,
            inner: RwLock::new(config.local),
            shutdown: CancellationToken::new(),
            mount_sync: Mutex::new(None),
        });

        // the initial import must succeed before the manager is usable
        shared.import().await?;

        spawn_import_loop(&shared);
        let export_loop = spawn_export_loop(&shared);

        Ok(Arc::new(Self {
            shared,
            export_loop: Mutex::new(Some(export_loop)),
        }))
    }
}

fn spawn_import_loop(shared: &Arc<Shared>) {
    let shared = shared.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.import_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the synchronous startup import already ran
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                // stale remote data at shutdown is acceptable; exit directly
                () = shared.shutdown.cancelled() => return,
            }
            match tokio::time::timeout(BACKGROUND_IMPORT_TIMEOUT, shared.import()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "failed to import cache"),
                Err(_) => error!(
                    timeout_secs = BACKGROUND_IMPORT_TIMEOUT.as_secs(),
                    "cache import timed out"
                ),
            }
        }
    });
}

fn spawn_export_loop(shared: &Arc<Shared>) -> JoinHandle<()> {
    let shared = shared.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.export_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            let shutting_down = tokio::select! {
                _ = ticker.tick() => false,
                // stale unexported local results are not acceptable; always
                // run one final export before terminating
                () = shared.shutdown.cancelled() => true,
            };
            match tokio::time::timeout(shared.config.export_timeout(), shared.export()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "failed to export cache"),
                Err(_) => error!(
                    timeout_secs = shared.config.export_timeout_secs,
                    "cache export timed out"
                ),
            }
            if shutting_down {
                return;
            }
        }
    })
}

impl Shared {
    async fn export(&self) -> Result<()> {
        debug!("starting cache export");

        let mut cache_keys = Vec::new();
        let mut links = Vec::new();
        for id in self.key_store.walk().await? {
            links.extend(self.key_store.backlinks(&id).await?);
            let mut key = CacheKeyRecord::new(&id);
            for result in self.key_store.results(&id).await? {
                if self.output_store.exists(&result.id).await? {
                    key.results.push(result);
                } else {
                    // the output may be lazy or pruned; expected, and
                    // releasing it saves work on future walks
                    debug!(result = %result.id, key = %id, "skipping cache result with no backing output");
                    if let Err(err) = self.key_store.release(&result.id).await {
                        error!(error = %err, result = %result.id, "failed to release cache result");
                    }
                }
            }
            cache_keys.push(key);
        }

        let resp = self
            .service
            .update_cache_records(UpdateCacheRecordsRequest { cache_keys, links })
            .await?;
        if resp.export_records.is_empty() {
            debug!("no cache records to export");
            return Ok(());
        }

        // layers can back multiple records; push each digest once per cycle
        let mut pushed: HashSet<Digest> = HashSet::new();
        let mut updated_records = Vec::with_capacity(resp.export_records.len());
        for record in resp.export_records {
            let Some(remote) = self
                .output_store
                .resolve_remote(&record.cache_ref_id, Compression::Zstd)
                .await?
            else {
                debug!(output = %record.cache_ref_id, "skipping cache record with no resolvable remote");
                continue;
            };
            for layer in &remote.descriptors {
                if pushed.insert(layer.digest.clone()) {
                    self.layer_store
                        .push_layer(layer, remote.provider.as_ref())
                        .await?;
                }
            }
            updated_records.push(RecordLayers {
                record_digest: record.digest,
                layers: remote.descriptors,
            });
        }

        self.service
            .update_cache_layers(UpdateCacheLayersRequest { updated_records })
            .await?;
        debug!("finished cache export");
        Ok(())
    }

    async fn import(&self) -> Result<()> {
        debug!("importing cache");
        let manifest = self.service.import_cache().await?;

        let snapshot =
            SnapshotCacheManager::from_manifest(format!("{MANAGER_ID}-import"), &manifest)?;
        let imported: Arc<dyn CacheManager> = Arc::new(snapshot);
        let combined =
            CombinedCacheManager::new(vec![self.local.clone(), imported], self.local.clone());

        *self.inner.write().await = Arc::new(combined);
        debug!(
            keys = manifest.cache_keys.len(),
            layers = manifest.layers.len(),
            "finished importing cache"
        );
        Ok(())
    }
}

#[async_trait]
impl CacheManager for SyncManager {
    fn id(&self) -> &str {
        MANAGER_ID
    }

    async fn query(&self, link: &LinkQuery) -> RecordsResult<Vec<CacheKeyRecord>> {
        let inner = self.shared.inner.read().await;
        inner.query(link).await
    }

    async fn records(&self, key_id: &str) -> RecordsResult<Vec<ResultRecord>> {
        let inner = self.shared.inner.read().await;
        inner.records(key_id).await
    }

    async fn load(&self, record: &ResultRecord) -> RecordsResult<CacheOutput> {
        let inner = self.shared.inner.read().await;
        inner.load(record).await
    }

    async fn save(
        &self,
        key_id: &str,
        links: &[Link],
        output: CacheOutput,
        created_at: DateTime<Utc>,
    ) -> RecordsResult<ResultRecord> {
        // exclusive so a save never runs against a mid-swap combined manager
        let inner = self.shared.inner.write().await;
        inner.save(key_id, links, output, created_at).await
    }
}

#[async_trait]
impl Manager for SyncManager {
    async fn start_cache_mount_synchronization(&self) -> Result<()> {
        let Some(BackingStoreConfig::S3(store)) = &self.shared.config.backing_store else {
            return Ok(());
        };

        let mut mounts = store.synchronized_cache_mounts.clone();
        if mounts.is_empty() {
            // mount sync is optional; a missing config only disables it
            match self.shared.service.get_cache_mount_config().await {
                Ok(resp) => {
                    mounts = resp
                        .synced_cache_mounts
                        .into_iter()
                        .map(|m| m.name)
                        .collect();
                }
                Err(err) => {
                    warn!(error = %err, "failed to fetch cache mount config");
                }
            }
        }
        if mounts.is_empty() {
            return Ok(());
        }

        let mut config = store.clone();
        if config.name.is_empty() {
            config.name = self.shared.engine_id.clone();
        }
        let client = config.client().await;
        let executor = Arc::new(S3FileSync::new(client, config.resolved_bucket()));
        let sync = CacheMountSynchronizer::new(
            executor,
            config,
            self.shared.mounts_dir.clone(),
            mounts,
        );
        sync.download_all().await?;
        *self.shared.mount_sync.lock().await = Some(sync);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.shutdown.cancel();

        let mut result = Ok(());
        let mount_sync = self.shared.mount_sync.lock().await.take();
        if let Some(sync) = mount_sync
            && let Err(err) = sync.upload_all().await
        {
            error!(error = %err, "failed to sync cache mounts remotely");
            result = Err(err);
        }

        // wait for the final export
        if let Some(handle) = self.export_loop.lock().await.take() {
            let _ = handle.await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::client::{
        GetCacheMountConfigResponse, GetCacheMountUploadUrlRequest,
        GetCacheMountUploadUrlResponse, GetLayerDownloadUrlRequest, GetLayerDownloadUrlResponse,
        GetLayerUploadUrlRequest, GetLayerUploadUrlResponse, UpdateCacheRecordsResponse,
        ExportRecord,
    };
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex as StdMutex;
    use strata_blobstore::{BytesProvider, ContentProvider, MemoryBlobStore};
    use strata_records::{
        ANNOTATION_UNCOMPRESSED, CacheLayer, CacheManifest, LayerAnnotations, LayerDescriptor,
        LocalCacheManager, MEDIA_TYPE_LAYER_ZSTD, ResultLayers,
    };
    use crate::outputs::RemoteOutput;

    fn test_config() -> SyncConfig {
        SyncConfig {
            import_period_secs: 3600,
            export_period_secs: 3600,
            export_timeout_secs: 30,
            backing_store: None,
        }
    }

    #[derive(Default)]
    struct MockState {
        known_keys: HashSet<String>,
        record_calls: usize,
        layer_updates: Vec<UpdateCacheLayersRequest>,
    }

    struct MockService {
        config: SyncConfig,
        manifest: CacheManifest,
        fail_import: bool,
        state: StdMutex<MockState>,
    }

    impl MockService {
        fn new(config: SyncConfig, manifest: CacheManifest) -> Self {
            Self {
                config,
                manifest,
                fail_import: false,
                state: StdMutex::new(MockState::default()),
            }
        }

        fn record_calls(&self) -> usize {
            self.state.lock().expect("mock lock").record_calls
        }

        fn layer_updates(&self) -> Vec<UpdateCacheLayersRequest> {
            self.state.lock().expect("mock lock").layer_updates.clone()
        }
    }

    #[async_trait]
    impl CacheService for MockService {
        async fn get_config(&self, _req: GetConfigRequest) -> Result<SyncConfig> {
            Ok(self.config.clone())
        }

        async fn update_cache_records(
            &self,
            req: UpdateCacheRecordsRequest,
        ) -> Result<UpdateCacheRecordsResponse> {
            let mut state = self.state.lock().expect("mock lock");
            state.record_calls += 1;
            let mut export_records = Vec::new();
            for key in &req.cache_keys {
                if key.results.is_empty() || !state.known_keys.insert(key.id.clone()) {
                    continue;
                }
                for result in &key.results {
                    export_records.push(ExportRecord {
                        digest: Digest::sha256(key.id.as_bytes()),
                        cache_ref_id: result.id.clone(),
                    });
                }
            }
            Ok(UpdateCacheRecordsResponse { export_records })
        }

        async fn update_cache_layers(&self, req: UpdateCacheLayersRequest) -> Result<()> {
            self.state
                .lock()
                .expect("mock lock")
                .layer_updates
                .push(req);
            Ok(())
        }

        async fn import_cache(&self) -> Result<CacheManifest> {
            if self.fail_import {
                return Err(Error::transport("import", "remote unavailable"));
            }
            Ok(self.manifest.clone())
        }

        async fn get_layer_download_url(
            &self,
            _req: GetLayerDownloadUrlRequest,
        ) -> Result<GetLayerDownloadUrlResponse> {
            Err(Error::transport("layer-download-url", "not used by this mock"))
        }

        async fn get_layer_upload_url(
            &self,
            _req: GetLayerUploadUrlRequest,
        ) -> Result<GetLayerUploadUrlResponse> {
            Err(Error::transport("layer-upload-url", "not used by this mock"))
        }

        async fn get_cache_mount_config(&self) -> Result<GetCacheMountConfigResponse> {
            Ok(GetCacheMountConfigResponse::default())
        }

        async fn get_cache_mount_upload_url(
            &self,
            _req: GetCacheMountUploadUrlRequest,
        ) -> Result<GetCacheMountUploadUrlResponse> {
            Err(Error::transport("cache-mount-upload-url", "not used by this mock"))
        }
    }

    struct MockOutputStore {
        outputs: HashMap<String, RemoteOutput>,
    }

    #[async_trait]
    impl OutputStore for MockOutputStore {
        async fn exists(&self, output_id: &str) -> Result<bool> {
            Ok(self.outputs.contains_key(output_id))
        }

        async fn resolve_remote(
            &self,
            output_id: &str,
            _compression: Compression,
        ) -> Result<Option<RemoteOutput>> {
            Ok(self.outputs.get(output_id).map(|remote| RemoteOutput {
                descriptors: remote.descriptors.clone(),
                provider: remote.provider.clone(),
            }))
        }
    }

    fn layer_descriptor(content: &[u8]) -> LayerDescriptor {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_UNCOMPRESSED.to_string(),
            Digest::sha256(b"uncompressed").to_string(),
        );
        LayerDescriptor {
            media_type: MEDIA_TYPE_LAYER_ZSTD.to_string(),
            digest: Digest::sha256(content),
            size: content.len() as u64,
            annotations,
        }
    }

    fn link(id: &str, linked_id: &str) -> Link {
        Link {
            id: id.to_string(),
            linked_id: linked_id.to_string(),
            input: 0,
            digest: Digest::sha256(b"op"),
            selector: None,
        }
    }

    fn query(linked_id: &str) -> LinkQuery {
        LinkQuery {
            linked_id: linked_id.to_string(),
            input: 0,
            digest: Digest::sha256(b"op"),
            selector: None,
        }
    }

    async fn seeded_local(desc: &LayerDescriptor) -> Arc<LocalCacheManager> {
        let local = Arc::new(LocalCacheManager::new(LOCAL_CACHE_ID));
        local
            .save(
                "key-1",
                &[link("key-1", "base-local")],
                CacheOutput {
                    id: "out-1".to_string(),
                    layers: vec![desc.clone()],
                    description: "exec /bin/build".to_string(),
                },
                Utc::now(),
            )
            .await
            .expect("seed local save");
        local
    }

    fn manager_config(
        local: Arc<LocalCacheManager>,
        output_store: Arc<dyn OutputStore>,
        layer_store: Arc<dyn BlobStore>,
    ) -> ManagerConfig {
        ManagerConfig {
            service_url: Some("https://cache.example.com".to_string()),
            token: Some("token".to_string()),
            engine_id: "engine-1".to_string(),
            local: local.clone(),
            key_store: local,
            output_store,
            mounts_dir: std::env::temp_dir(),
            layer_store: Some(layer_store),
        }
    }

    fn remote_manifest() -> CacheManifest {
        let blob = Digest::sha256(b"remote-layer");
        let mut manifest = CacheManifest::new();
        manifest.cache_keys = vec![CacheKeyRecord {
            id: "key-remote".to_string(),
            results: vec![ResultRecord {
                id: "out-remote".to_string(),
                created_at: Utc::now(),
                description: String::new(),
            }],
        }];
        manifest.links = vec![link("key-remote", "base-remote")];
        manifest.layers = vec![CacheLayer {
            blob: blob.clone(),
            annotations: Some(LayerAnnotations {
                media_type: MEDIA_TYPE_LAYER_ZSTD.to_string(),
                diff_id: Some(Digest::sha256(b"remote-diff")),
                size: 16,
                created_at: None,
            }),
        }];
        manifest.result_layers = vec![ResultLayers {
            result_id: "out-remote".to_string(),
            layers: vec![blob],
        }];
        manifest
    }

    #[tokio::test]
    async fn export_is_idempotent() {
        let content = b"layer-bytes".as_slice();
        let desc = layer_descriptor(content);
        let local = seeded_local(&desc).await;

        let provider: Arc<dyn ContentProvider> =
            Arc::new(BytesProvider::new().with(desc.digest.clone(), content));
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::from([(
                "out-1".to_string(),
                RemoteOutput {
                    descriptors: vec![desc.clone()],
                    provider,
                },
            )]),
        });
        let blob_store = Arc::new(MemoryBlobStore::new());
        let service = Arc::new(MockService::new(test_config(), CacheManifest::new()));

        let manager = SyncManager::with_service(
            service.clone(),
            manager_config(local, outputs, blob_store.clone()),
        )
        .await
        .expect("manager");

        manager.shared.export().await.expect("first export");
        assert_eq!(blob_store.upload_count(), 1);
        let updates = service.layer_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].updated_records.len(), 1);
        assert_eq!(updates[0].updated_records[0].layers, vec![desc]);

        // the same snapshot again: the service reports nothing novel and no
        // further state is created
        manager.shared.export().await.expect("second export");
        assert_eq!(blob_store.upload_count(), 1, "no re-upload");
        assert_eq!(service.layer_updates().len(), 1, "no second layer update");

        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn export_skips_results_with_no_backing_output() {
        let desc = layer_descriptor(b"bytes");
        let local = seeded_local(&desc).await;
        // no entry for "out-1" in the output store: the result is pruned
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::new(),
        });
        let blob_store = Arc::new(MemoryBlobStore::new());
        let service = Arc::new(MockService::new(test_config(), CacheManifest::new()));

        let manager = SyncManager::with_service(
            service.clone(),
            manager_config(local.clone(), outputs, blob_store.clone()),
        )
        .await
        .expect("manager");

        manager.shared.export().await.expect("export");
        assert_eq!(blob_store.upload_count(), 0);
        // the pruned result was released from the key store
        assert!(local.walk().await.expect("walk").is_empty());

        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn import_merges_the_remote_snapshot() {
        let desc = layer_descriptor(b"bytes");
        let local = seeded_local(&desc).await;
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::new(),
        });
        let blob_store = Arc::new(MemoryBlobStore::new());
        let service = Arc::new(MockService::new(test_config(), remote_manifest()));

        let manager = SyncManager::with_service(
            service,
            manager_config(local.clone(), outputs, blob_store),
        )
        .await
        .expect("manager");

        // reads see both the local store and the imported snapshot
        let keys = manager.query(&query("base-remote")).await.expect("query imported");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "key-remote");
        let keys = manager.query(&query("base-local")).await.expect("query local");
        assert_eq!(keys.len(), 1);

        let records = manager.records("key-remote").await.expect("records");
        let output = manager.load(&records[0]).await.expect("load imported");
        assert_eq!(output.layers.len(), 1);

        // writes go to the local store only
        manager
            .save(
                "key-new",
                &[link("key-new", "base-new")],
                CacheOutput {
                    id: "out-new".to_string(),
                    layers: Vec::new(),
                    description: String::new(),
                },
                Utc::now(),
            )
            .await
            .expect("save");
        assert_eq!(local.records("key-new").await.expect("records").len(), 1);

        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn zero_period_config_aborts_construction() {
        let desc = layer_descriptor(b"bytes");
        let local = seeded_local(&desc).await;
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::new(),
        });
        let blob_store = Arc::new(MemoryBlobStore::new());
        let mut config = test_config();
        config.export_period_secs = 0;
        let service = Arc::new(MockService::new(config, CacheManifest::new()));

        let err = SyncManager::with_service(
            service,
            manager_config(local, outputs, blob_store),
        )
        .await
        .expect_err("zero periods are fatal");
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn failed_startup_import_aborts_construction() {
        let desc = layer_descriptor(b"bytes");
        let local = seeded_local(&desc).await;
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::new(),
        });
        let blob_store = Arc::new(MemoryBlobStore::new());
        let mut service = MockService::new(test_config(), CacheManifest::new());
        service.fail_import = true;

        let err = SyncManager::with_service(
            Arc::new(service),
            manager_config(local, outputs, blob_store),
        )
        .await
        .expect_err("startup import failure is fatal");
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn close_runs_a_final_export() {
        let desc = layer_descriptor(b"bytes");
        let local = seeded_local(&desc).await;
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::new(),
        });
        let blob_store = Arc::new(MemoryBlobStore::new());
        let service = Arc::new(MockService::new(test_config(), CacheManifest::new()));

        let manager = SyncManager::with_service(
            service.clone(),
            manager_config(local, outputs, blob_store),
        )
        .await
        .expect("manager");

        assert_eq!(service.record_calls(), 0, "export waits for its period");
        manager.close().await.expect("close");
        assert_eq!(service.record_calls(), 1, "final export ran at shutdown");
    }

    #[tokio::test]
    async fn missing_service_config_falls_back_to_local() {
        let local = Arc::new(LocalCacheManager::new(LOCAL_CACHE_ID));
        let outputs = Arc::new(MockOutputStore {
            outputs: HashMap::new(),
        });
        let manager = new_manager(ManagerConfig {
            service_url: None,
            token: None,
            engine_id: "engine-1".to_string(),
            local: local.clone(),
            key_store: local.clone(),
            output_store: outputs,
            mounts_dir: std::env::temp_dir(),
            layer_store: None,
        })
        .await
        .expect("passthrough manager");

        assert_eq!(manager.id(), LOCAL_CACHE_ID);
        manager
            .save(
                "key-1",
                &[link("key-1", "base")],
                CacheOutput {
                    id: "out-1".to_string(),
                    layers: Vec::new(),
                    description: String::new(),
                },
                Utc::now(),
            )
            .await
            .expect("save through passthrough");
        assert_eq!(manager.query(&query("base")).await.expect("query").len(), 1);

        manager
            .start_cache_mount_synchronization()
            .await
            .expect("no-op mount sync");
        manager.close().await.expect("no-op close");
    }
}
