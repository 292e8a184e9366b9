//! Wire records describing cache keys, links, results and layers
//!
//! Links and results are append-only facts: the engine submits everything it
//! knows and the remote service decides which records are novel.

use crate::digest::Digest;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation carrying the uncompressed digest of a compressed layer.
pub const ANNOTATION_UNCOMPRESSED: &str = "build.strata.uncompressed";

/// Annotation carrying the creation time of a layer.
pub const ANNOTATION_CREATED_AT: &str = "build.strata.created-at";

/// Media type of zstd-compressed cache layer blobs.
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.strata.cache.layer.v1.tar+zstd";

/// Identifies one solver-graph node's cache key, with any materialized
/// results recorded for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeyRecord {
    /// The cache key id
    pub id: String,
    /// Materialized outputs recorded for this key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResultRecord>,
}

impl CacheKeyRecord {
    /// A key record with no results yet.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            results: Vec::new(),
        }
    }
}

/// A directed backlink recording that `id`'s cache key was derived, at input
/// position `input`, from `linked_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// The derived cache key
    pub id: String,
    /// The cache key it was derived from; empty for root keys
    #[serde(default)]
    pub linked_id: String,
    /// Input position of the edge
    pub input: u32,
    /// Digest of the operation deriving the key
    pub digest: Digest,
    /// Optional selector narrowing the linked input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Digest>,
}

/// A concrete, materialized output associated with a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    /// Id of the backing output
    pub id: String,
    /// When the result was created
    pub created_at: DateTime<Utc>,
    /// Human-readable description of the producing step
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A content-addressed, immutable compressed layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Media type of the blob
    pub media_type: String,
    /// Content digest addressing the blob
    pub digest: Digest,
    /// Size of the compressed blob in bytes
    pub size: u64,
    /// Provenance annotations (uncompressed digest, creation time)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl LayerDescriptor {
    /// The uncompressed digest recorded for this layer, if annotated.
    #[must_use]
    pub fn uncompressed_digest(&self) -> Option<Digest> {
        self.annotations
            .get(ANNOTATION_UNCOMPRESSED)
            .and_then(|v| v.parse().ok())
    }
}

/// A layer entry in a cache manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheLayer {
    /// Digest of the compressed blob
    pub blob: Digest,
    /// Addressing metadata; required to consume the layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<LayerAnnotations>,
}

/// Addressing metadata attached to a manifest layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerAnnotations {
    /// Media type of the blob
    pub media_type: String,
    /// Uncompressed digest of the layer contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<Digest>,
    /// Size of the compressed blob in bytes
    pub size: u64,
    /// When the layer was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CacheLayer {
    /// Build a manifest layer from an exported descriptor.
    pub fn from_descriptor(desc: &LayerDescriptor) -> Result<Self> {
        let diff_id = desc.uncompressed_digest().ok_or_else(|| {
            Error::missing_annotation(desc.digest.to_string(), ANNOTATION_UNCOMPRESSED)
        })?;
        let created_at = desc
            .annotations
            .get(ANNOTATION_CREATED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(Self {
            blob: desc.digest.clone(),
            annotations: Some(LayerAnnotations {
                media_type: desc.media_type.clone(),
                diff_id: Some(diff_id),
                size: desc.size,
                created_at,
            }),
        })
    }

    /// Convert back to a descriptor consumable by the content pipeline.
    ///
    /// A layer without its uncompressed digest cannot be addressed and is a
    /// hard error; an import must not silently drop it.
    pub fn descriptor(&self) -> Result<LayerDescriptor> {
        let annotations = self.annotations.as_ref().ok_or_else(|| {
            Error::missing_annotation(self.blob.to_string(), ANNOTATION_UNCOMPRESSED)
        })?;
        let diff_id = annotations.diff_id.as_ref().ok_or_else(|| {
            Error::missing_annotation(self.blob.to_string(), ANNOTATION_UNCOMPRESSED)
        })?;

        let mut map = BTreeMap::new();
        map.insert(ANNOTATION_UNCOMPRESSED.to_string(), diff_id.to_string());
        if let Some(created_at) = annotations.created_at {
            map.insert(ANNOTATION_CREATED_AT.to_string(), created_at.to_rfc3339());
        }
        Ok(LayerDescriptor {
            media_type: annotations.media_type.clone(),
            digest: self.blob.clone(),
            size: annotations.size,
            annotations: map,
        })
    }
}
