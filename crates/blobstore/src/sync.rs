//! Generic file synchronization against the object store
//!
//! Cache-mount synchronization runs a paired download/upload job per mount
//! through this executor: a download copies remote objects into a local
//! directory, an upload mirrors the directory back so the remote ends up an
//! exact copy, deletions included.

use crate::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Executor for prefix-scoped file synchronization jobs.
#[async_trait]
pub trait FileSyncExecutor: Send + Sync {
    /// Object keys currently under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Download everything under `prefix` into `dir` (copy semantics:
    /// local files not present remotely are left alone).
    async fn download(&self, prefix: &str, dir: &Path) -> Result<()>;

    /// Mirror `dir` to `prefix`: upload every local file and delete remote
    /// objects with no local counterpart.
    async fn sync_up(&self, dir: &Path, prefix: &str) -> Result<()>;
}

/// File sync against an S3-compatible object store.
pub struct S3FileSync {
    client: Client,
    bucket: String,
}

impl S3FileSync {
    /// Wrap an S3 client targeting `bucket`.
    #[must_use]
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    async fn download_object(&self, key: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Error::store("GetObject", err))?;

        let mut body = resp.body;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::io(e, dest, "create"))?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| Error::store("GetObject body", err))?
        {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(|e| Error::io(e, dest, "write"))?;
        }
        Ok(())
    }

    fn local_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|e| {
                Error::io_no_path(std::io::Error::other(e), "walk local directory")
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| Error::io_no_path(std::io::Error::other(e), "strip prefix"))?;
            // object keys always use forward slashes
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((entry.path().to_path_buf(), rel));
        }
        Ok(files)
    }
}

#[async_trait]
impl FileSyncExecutor for S3FileSync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| Error::store("ListObjectsV2", err))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn download(&self, prefix: &str, dir: &Path) -> Result<()> {
        let keys = self.list(prefix).await?;
        debug!(prefix, count = keys.len(), "downloading objects");
        for key in keys {
            let Some(rel) = key.strip_prefix(prefix) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            self.download_object(&key, &dir.join(rel)).await?;
        }
        Ok(())
    }

    async fn sync_up(&self, dir: &Path, prefix: &str) -> Result<()> {
        let files = Self::local_files(dir)?;
        debug!(prefix, count = files.len(), "uploading local files");

        let mut local_keys = HashSet::new();
        for (path, rel) in &files {
            let key = format!("{prefix}{rel}");
            let body = ByteStream::from_path(path)
                .await
                .map_err(|err| Error::store("read upload body", err))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|err| Error::store("PutObject", err))?;
            local_keys.insert(key);
        }

        // the remote must mirror the local directory, deletions included
        for key in self.list(prefix).await? {
            if !local_keys.contains(&key) {
                debug!(key, "deleting remote object with no local counterpart");
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|err| Error::store("DeleteObject", err))?;
            }
        }
        Ok(())
    }
}
