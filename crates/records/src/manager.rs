//! The cache-manager contract and its local, snapshot and combined
//! implementations
//!
//! The solver programs against [`CacheManager`] and never learns whether a
//! result came from the local store or an imported remote snapshot.

use crate::digest::Digest;
use crate::manifest::CacheManifest;
use crate::records::{CacheKeyRecord, LayerDescriptor, Link, ResultRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Pointer to a concrete, materialized build output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOutput {
    /// Id of the output
    pub id: String,
    /// Content-addressed layers composing the output, base first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerDescriptor>,
    /// Human-readable description of the producing step
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A link-shaped lookup: which cache keys were derived from `linked_id` at
/// `input` by the operation with `digest`?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkQuery {
    /// The ancestor cache key; empty for root keys
    pub linked_id: String,
    /// Input position of the edge
    pub input: u32,
    /// Digest of the deriving operation
    pub digest: Digest,
    /// Optional selector narrowing the linked input
    pub selector: Option<Digest>,
}

impl LinkQuery {
    fn matches(&self, link: &Link) -> bool {
        link.linked_id == self.linked_id
            && link.input == self.input
            && link.digest == self.digest
            && link.selector == self.selector
    }
}

/// The read/write surface the solver expects from any cache.
#[async_trait]
pub trait CacheManager: Send + Sync {
    /// Identifies this manager in logs and descriptions.
    fn id(&self) -> &str;

    /// Find cache keys matching a dependency link.
    async fn query(&self, link: &LinkQuery) -> Result<Vec<CacheKeyRecord>>;

    /// All materialized results recorded for a cache key.
    async fn records(&self, key_id: &str) -> Result<Vec<ResultRecord>>;

    /// Load the concrete output backing a result record.
    async fn load(&self, record: &ResultRecord) -> Result<CacheOutput>;

    /// Record a new result for a cache key together with its provenance
    /// links. Returns the stored result record.
    async fn save(
        &self,
        key_id: &str,
        links: &[Link],
        output: CacheOutput,
        created_at: DateTime<Utc>,
    ) -> Result<ResultRecord>;
}

/// Walkable view of the local key store, used by cache export.
#[async_trait]
pub trait CacheKeyStore: Send + Sync {
    /// Ids of every cache key in the store.
    async fn walk(&self) -> Result<Vec<String>>;

    /// Backlinks recorded for a cache key.
    async fn backlinks(&self, id: &str) -> Result<Vec<Link>>;

    /// Results recorded for a cache key.
    async fn results(&self, id: &str) -> Result<Vec<ResultRecord>>;

    /// Forget a result whose backing output is gone. Dropping the last
    /// result of a key drops the key and its links too.
    async fn release(&self, result_id: &str) -> Result<()>;
}

#[derive(Default)]
struct LocalState {
    keys: HashMap<String, CacheKeyRecord>,
    links: Vec<Link>,
    outputs: HashMap<String, CacheOutput>,
}

/// In-memory cache manager backing the solver's local store.
pub struct LocalCacheManager {
    id: String,
    state: RwLock<LocalState>,
}

impl LocalCacheManager {
    /// Create an empty local manager.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(LocalState::default()),
        }
    }
}

#[async_trait]
impl CacheManager for LocalCacheManager {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(&self, link: &LinkQuery) -> Result<Vec<CacheKeyRecord>> {
        let state = self.state.read().await;
        let mut found = Vec::new();
        for stored in &state.links {
            if link.matches(stored)
                && let Some(key) = state.keys.get(&stored.id)
                && !found.iter().any(|k: &CacheKeyRecord| k.id == key.id)
            {
                found.push(key.clone());
            }
        }
        Ok(found)
    }

    async fn records(&self, key_id: &str) -> Result<Vec<ResultRecord>> {
        let state = self.state.read().await;
        Ok(state
            .keys
            .get(key_id)
            .map(|key| key.results.clone())
            .unwrap_or_default())
    }

    async fn load(&self, record: &ResultRecord) -> Result<CacheOutput> {
        let state = self.state.read().await;
        state
            .outputs
            .get(&record.id)
            .cloned()
            .ok_or_else(|| Error::not_found(&record.id))
    }

    async fn save(
        &self,
        key_id: &str,
        links: &[Link],
        output: CacheOutput,
        created_at: DateTime<Utc>,
    ) -> Result<ResultRecord> {
        let mut state = self.state.write().await;
        let record = ResultRecord {
            id: output.id.clone(),
            created_at,
            description: output.description.clone(),
        };
        let key = state
            .keys
            .entry(key_id.to_string())
            .or_insert_with(|| CacheKeyRecord::new(key_id));
        if !key.results.iter().any(|r| r.id == record.id) {
            key.results.push(record.clone());
        }
        for link in links {
            if !state.links.contains(link) {
                state.links.push(link.clone());
            }
        }
        state.outputs.insert(output.id.clone(), output);
        Ok(record)
    }
}

#[async_trait]
impl CacheKeyStore for LocalCacheManager {
    async fn walk(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.keys.keys().cloned().collect())
    }

    async fn backlinks(&self, id: &str) -> Result<Vec<Link>> {
        let state = self.state.read().await;
        Ok(state
            .links
            .iter()
            .filter(|link| link.id == id)
            .cloned()
            .collect())
    }

    async fn results(&self, id: &str) -> Result<Vec<ResultRecord>> {
        self.records(id).await
    }

    async fn release(&self, result_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.outputs.remove(result_id);
        let mut emptied = Vec::new();
        for key in state.keys.values_mut() {
            key.results.retain(|r| r.id != result_id);
            if key.results.is_empty() {
                emptied.push(key.id.clone());
            }
        }
        for id in emptied {
            debug!(key = %id, "dropping cache key with no remaining results");
            state.keys.remove(&id);
            state.links.retain(|link| link.id != id);
        }
        Ok(())
    }
}

/// Read-only cache manager over an imported remote snapshot.
///
/// Built once per import and swapped in wholesale; never mutated.
pub struct SnapshotCacheManager {
    id: String,
    keys: HashMap<String, CacheKeyRecord>,
    links: Vec<Link>,
    outputs: HashMap<String, CacheOutput>,
}

impl SnapshotCacheManager {
    /// Build a snapshot manager from an imported manifest.
    ///
    /// Fails if any referenced layer is missing or unaddressable; a partial
    /// snapshot would serve results that cannot be loaded.
    pub fn from_manifest(id: impl Into<String>, manifest: &CacheManifest) -> Result<Self> {
        let descriptors = manifest.descriptors()?;

        let mut outputs = HashMap::new();
        for result in &manifest.result_layers {
            let mut layers = Vec::with_capacity(result.layers.len());
            for digest in &result.layers {
                let desc = descriptors.get(digest).ok_or_else(|| Error::UnknownLayer {
                    digest: digest.to_string(),
                    result_id: result.result_id.clone(),
                })?;
                layers.push(desc.clone());
            }
            outputs.insert(
                result.result_id.clone(),
                CacheOutput {
                    id: result.result_id.clone(),
                    layers,
                    description: String::new(),
                },
            );
        }

        Ok(Self {
            id: id.into(),
            keys: manifest
                .cache_keys
                .iter()
                .map(|key| (key.id.clone(), key.clone()))
                .collect(),
            links: manifest.links.clone(),
            outputs,
        })
    }
}

#[async_trait]
impl CacheManager for SnapshotCacheManager {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(&self, link: &LinkQuery) -> Result<Vec<CacheKeyRecord>> {
        let mut found = Vec::new();
        for stored in &self.links {
            if link.matches(stored)
                && let Some(key) = self.keys.get(&stored.id)
                && !found.iter().any(|k: &CacheKeyRecord| k.id == key.id)
            {
                found.push(key.clone());
            }
        }
        Ok(found)
    }

    async fn records(&self, key_id: &str) -> Result<Vec<ResultRecord>> {
        Ok(self
            .keys
            .get(key_id)
            .map(|key| key.results.clone())
            .unwrap_or_default())
    }

    async fn load(&self, record: &ResultRecord) -> Result<CacheOutput> {
        self.outputs
            .get(&record.id)
            .cloned()
            .ok_or_else(|| Error::not_found(&record.id))
    }

    async fn save(
        &self,
        _key_id: &str,
        _links: &[Link],
        _output: CacheOutput,
        _created_at: DateTime<Utc>,
    ) -> Result<ResultRecord> {
        Err(Error::ReadOnly {
            id: self.id.clone(),
        })
    }
}

/// Ordered union of cache managers: reads consult every member, writes go to
/// the designated writer only.
pub struct CombinedCacheManager {
    id: String,
    managers: Vec<Arc<dyn CacheManager>>,
    writer: Arc<dyn CacheManager>,
}

impl CombinedCacheManager {
    /// Combine `managers` for reads with `writer` receiving all saves.
    /// Earlier members win query deduplication.
    #[must_use]
    pub fn new(managers: Vec<Arc<dyn CacheManager>>, writer: Arc<dyn CacheManager>) -> Self {
        Self {
            id: "combined".to_string(),
            managers,
            writer,
        }
    }
}

#[async_trait]
impl CacheManager for CombinedCacheManager {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(&self, link: &LinkQuery) -> Result<Vec<CacheKeyRecord>> {
        let mut found: Vec<CacheKeyRecord> = Vec::new();
        for manager in &self.managers {
            for key in manager.query(link).await? {
                if !found.iter().any(|k| k.id == key.id) {
                    found.push(key);
                }
            }
        }
        Ok(found)
    }

    async fn records(&self, key_id: &str) -> Result<Vec<ResultRecord>> {
        let mut records: Vec<ResultRecord> = Vec::new();
        for manager in &self.managers {
            for record in manager.records(key_id).await? {
                if !records.iter().any(|r| r.id == record.id) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn load(&self, record: &ResultRecord) -> Result<CacheOutput> {
        for manager in &self.managers {
            match manager.load(record).await {
                Ok(output) => return Ok(output),
                Err(Error::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Err(Error::not_found(&record.id))
    }

    async fn save(
        &self,
        key_id: &str,
        links: &[Link],
        output: CacheOutput,
        created_at: DateTime<Utc>,
    ) -> Result<ResultRecord> {
        self.writer.save(key_id, links, output, created_at).await
    }
}
