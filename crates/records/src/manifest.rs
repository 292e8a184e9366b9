//! The importable cache manifest
//!
//! A manifest is a whole-replace snapshot of the remote cache: keys, links,
//! layer metadata and the layer set backing each result. A new import
//! supersedes the previous snapshot; manifests are never mutated in place.

use crate::digest::Digest;
use crate::records::{CacheKeyRecord, CacheLayer, LayerDescriptor, Link};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// The layer digests backing one materialized result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultLayers {
    /// Id of the backing output
    pub result_id: String,
    /// Digests of the layers composing the output, base first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Digest>,
}

/// A versioned, whole-replace view of the remote cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    /// Manifest schema version
    pub version: u32,
    /// Every cache key the remote knows, with its results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_keys: Vec<CacheKeyRecord>,
    /// Dependency backlinks between cache keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    /// Metadata for every layer referenced by a result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<CacheLayer>,
    /// Which layers back which result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_layers: Vec<ResultLayers>,
}

impl Default for CacheManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            cache_keys: Vec::new(),
            links: Vec::new(),
            layers: Vec::new(),
            result_layers: Vec::new(),
        }
    }
}

impl CacheManifest {
    /// An empty manifest at the current version.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a manifest from its JSON serialization.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("failed to parse cache manifest: {e}")))
    }

    /// Serialize the manifest to JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::serialization(format!("failed to serialize cache manifest: {e}")))
    }

    /// Resolve every manifest layer to a consumable descriptor, keyed by
    /// blob digest. Any unaddressable layer fails the whole resolution.
    pub fn descriptors(&self) -> Result<BTreeMap<Digest, LayerDescriptor>> {
        let mut descriptors = BTreeMap::new();
        for layer in &self.layers {
            descriptors.insert(layer.blob.clone(), layer.descriptor()?);
        }
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LayerAnnotations, MEDIA_TYPE_LAYER_ZSTD, ResultRecord};
    use chrono::Utc;

    fn sample_manifest() -> CacheManifest {
        let blob = Digest::sha256(b"layer");
        CacheManifest {
            version: MANIFEST_VERSION,
            cache_keys: vec![CacheKeyRecord {
                id: "key-1".to_string(),
                results: vec![ResultRecord {
                    id: "result-1".to_string(),
                    created_at: Utc::now(),
                    description: "exec /bin/build".to_string(),
                }],
            }],
            links: vec![Link {
                id: "key-1".to_string(),
                linked_id: "key-0".to_string(),
                input: 0,
                digest: Digest::sha256(b"op"),
                selector: Some(Digest::sha256(b"selector")),
            }],
            layers: vec![CacheLayer {
                blob: blob.clone(),
                annotations: Some(LayerAnnotations {
                    media_type: MEDIA_TYPE_LAYER_ZSTD.to_string(),
                    diff_id: Some(Digest::sha256(b"diff")),
                    size: 2048,
                    created_at: None,
                }),
            }],
            result_layers: vec![ResultLayers {
                result_id: "result-1".to_string(),
                layers: vec![blob],
            }],
        }
    }

    #[test]
    fn serialized_manifest_parses_back_equal() {
        let manifest = sample_manifest();
        let bytes = manifest.to_bytes().expect("serialize");
        let parsed = CacheManifest::parse(&bytes).expect("parse");
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn descriptors_fail_on_unaddressable_layer() {
        let mut manifest = sample_manifest();
        manifest.layers.push(CacheLayer {
            blob: Digest::sha256(b"other"),
            annotations: None,
        });
        assert!(matches!(
            manifest.descriptors(),
            Err(Error::MissingAnnotation { .. })
        ));
    }

    #[test]
    fn garbage_fails_parsing() {
        assert!(matches!(
            CacheManifest::parse(b"not json"),
            Err(Error::Serialization { .. })
        ));
    }
}
