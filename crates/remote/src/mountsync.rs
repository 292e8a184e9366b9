//! Cache-mount synchronization
//!
//! At engine startup, configured cache mounts are pulled from the object
//! store into their local mount points; at shutdown they are pushed back so
//! the remote becomes an exact mirror of the local state, deletions
//! included. Each mount is a paired download/upload job run through the
//! generic file-sync executor.

use crate::Result;
use futures::future::try_join_all;
use std::path::PathBuf;
use std::sync::Arc;
use strata_blobstore::{FileSyncExecutor, S3StoreConfig};
use tracing::debug;

/// Paired download/upload jobs for the engine's synchronized cache mounts.
pub struct CacheMountSynchronizer {
    executor: Arc<dyn FileSyncExecutor>,
    config: S3StoreConfig,
    mounts_dir: PathBuf,
    mounts: Vec<String>,
}

impl CacheMountSynchronizer {
    /// Create a synchronizer for `mounts`, each mapped to a directory of the
    /// same name under `mounts_dir`.
    #[must_use]
    pub fn new(
        executor: Arc<dyn FileSyncExecutor>,
        config: S3StoreConfig,
        mounts_dir: PathBuf,
        mounts: Vec<String>,
    ) -> Self {
        Self {
            executor,
            config,
            mounts_dir,
            mounts,
        }
    }

    /// Pull every synchronized mount into its local mount point.
    pub async fn download_all(&self) -> Result<()> {
        try_join_all(self.mounts.iter().map(|mount| self.download(mount))).await?;
        Ok(())
    }

    /// Mirror every synchronized mount back to this engine's remote prefix.
    pub async fn upload_all(&self) -> Result<()> {
        try_join_all(self.mounts.iter().map(|mount| self.upload(mount))).await?;
        Ok(())
    }

    async fn download(&self, mount: &str) -> Result<()> {
        let dir = self.mounts_dir.join(mount);

        // existing local data wins over any remote backup; the heuristic is
        // not always ideal but a populated mount must not be clobbered
        if has_entries(&dir).await {
            debug!(mount, "cache mount already has data, skipping download");
            return Ok(());
        }

        let mut prefix = self.config.cache_mount_prefix(&self.config.name, mount);
        if self.executor.list(&prefix).await?.is_empty() {
            // no backup of our own yet; fall back to another engine's copy
            match self.find_other_engine_backup(mount).await? {
                Some(other) => prefix = other,
                None => {
                    debug!(mount, "no cache mount backup found, skipping download");
                    return Ok(());
                }
            }
        }

        debug!(mount, prefix, "importing cache mount");
        self.executor.download(&prefix, &dir).await?;
        debug!(mount, "synced cache mount locally");
        Ok(())
    }

    async fn upload(&self, mount: &str) -> Result<()> {
        let dir = self.mounts_dir.join(mount);
        let prefix = self.config.cache_mount_prefix(&self.config.name, mount);
        debug!(mount, prefix, "syncing cache mount remotely");
        self.executor.sync_up(&dir, &prefix).await?;
        debug!(mount, "synced cache mount remotely");
        Ok(())
    }

    /// Find another engine's backup of `mount` under the shared prefix.
    async fn find_other_engine_backup(&self, mount: &str) -> Result<Option<String>> {
        let root = self.config.cache_mounts_root();
        for key in self.executor.list(&root).await? {
            let Some(rest) = key.strip_prefix(&root) else {
                continue;
            };
            let Some((engine, _)) = rest.split_once('/') else {
                continue;
            };
            if engine == self.config.name {
                continue;
            }
            let candidate = self.config.cache_mount_prefix(engine, mount);
            if key.starts_with(&candidate) {
                debug!(mount, engine, "using another engine's cache mount backup");
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

async fn has_entries(dir: &std::path::Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => entries.next_entry().await.ok().flatten().is_some(),
        Err(_) => false,
    }
}
