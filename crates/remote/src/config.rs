//! Synchronization configuration fetched from the cache service

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_blobstore::S3StoreConfig;

/// Runtime configuration for the synchronization manager, fetched from the
/// remote cache service at startup.
///
/// Periods and timeouts travel as whole seconds on the wire. A zero value
/// for any of them is a fatal configuration error: it would either disable a
/// cycle silently or unbound the final export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Seconds between periodic imports of the remote snapshot
    pub import_period_secs: u64,
    /// Seconds between periodic exports of local results
    pub export_period_secs: u64,
    /// Bound on a single export cycle, in seconds
    pub export_timeout_secs: u64,
    /// The object store backing layer and cache-mount transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_store: Option<BackingStoreConfig>,
}

/// Supported object-store backings.
///
/// An unknown `type` tag fails deserialization, which aborts manager
/// construction rather than running without a usable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackingStoreConfig {
    /// S3-compatible object storage
    S3(S3StoreConfig),
}

impl SyncConfig {
    /// Reject configurations the manager must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.import_period_secs == 0
            || self.export_period_secs == 0
            || self.export_timeout_secs == 0
        {
            return Err(Error::configuration(
                "import/export periods and export timeout must be non-zero",
            ));
        }
        Ok(())
    }

    /// Interval between periodic imports.
    #[must_use]
    pub fn import_period(&self) -> Duration {
        Duration::from_secs(self.import_period_secs)
    }

    /// Interval between periodic exports.
    #[must_use]
    pub fn export_period(&self) -> Duration {
        Duration::from_secs(self.export_period_secs)
    }

    /// Bound on a single export cycle, including the final one at shutdown.
    #[must_use]
    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            import_period_secs: 300,
            export_period_secs: 60,
            export_timeout_secs: 120,
            backing_store: None,
        }
    }

    #[test]
    fn nonzero_periods_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn zero_periods_are_fatal() {
        for broken in [
            SyncConfig {
                import_period_secs: 0,
                ..config()
            },
            SyncConfig {
                export_period_secs: 0,
                ..config()
            },
            SyncConfig {
                export_timeout_secs: 0,
                ..config()
            },
        ] {
            assert!(matches!(
                broken.validate(),
                Err(Error::Configuration { .. })
            ));
        }
    }

    #[test]
    fn backing_store_is_tag_dispatched() {
        let json = r#"{
            "importPeriodSecs": 300,
            "exportPeriodSecs": 60,
            "exportTimeoutSecs": 120,
            "backingStore": {"type": "s3", "bucket": "cache", "region": "us-east-1"}
        }"#;
        let config: SyncConfig = serde_json::from_str(json).expect("parse");
        let store = match config.backing_store {
            Some(BackingStoreConfig::S3(store)) => store,
            other => unreachable!("expected an s3 backing store, got {other:?}"),
        };
        assert_eq!(store.bucket, "cache");
    }

    #[test]
    fn unknown_backing_store_type_is_rejected() {
        let json = r#"{
            "importPeriodSecs": 300,
            "exportPeriodSecs": 60,
            "exportTimeoutSecs": 120,
            "backingStore": {"type": "carrier-pigeon"}
        }"#;
        assert!(serde_json::from_str::<SyncConfig>(json).is_err());
    }
}
