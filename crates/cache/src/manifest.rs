//! Cache manifest model and its JSON wire format
//!
//! A manifest describes every output tree of a cached entity as a pre-order
//! list of entries per property:
//!
//! ```json
//! {
//!   "originMetadata": {"buildInvocationId": "...", "executionTime": 1234},
//!   "type": "task",
//!   "identity": ":app:compile",
//!   "propertyManifests": {
//!     "classes": [
//!       {"type": "DIRECTORY", "path": "", "hash": "...", "length": 0},
//!       {"type": "REGULAR_FILE", "path": "Main.class", "hash": "...", "length": 512}
//!     ]
//!   }
//! }
//! ```

use crate::snapshot::{FileSystemSnapshot, FileType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use stowage_cas::ContentHash;

/// Where and how a cache entry was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginMetadata {
    /// Build invocation that stored the entry
    pub build_invocation_id: String,
    /// How long producing the outputs took
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,
}

/// One node of a property's output tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Node type
    #[serde(rename = "type")]
    pub entry_type: FileType,
    /// Path below the property root, empty for the root itself
    #[serde(rename = "path")]
    pub relative_path: String,
    /// Content hash of the node
    #[serde(rename = "hash")]
    pub content_hash: ContentHash,
    /// Content length, zero for directories and missing entries
    pub length: u64,
}

/// Description of all output trees of one cached entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Provenance of the entry
    #[serde(rename = "originMetadata")]
    pub origin_metadata: OriginMetadata,
    /// Kind of entity cached
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Which entity was cached
    #[serde(rename = "identity")]
    pub entity_identity: String,
    /// Pre-order entry list per output property
    #[serde(rename = "propertyManifests")]
    pub property_manifests: BTreeMap<String, Vec<ManifestEntry>>,
}

impl CacheManifest {
    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed documents
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("malformed cache manifest: {e}")))
    }

    /// Sum of the lengths of every entry
    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.property_manifests
            .values()
            .flatten()
            .map(|entry| entry.length)
            .sum()
    }
}

/// Flatten a snapshot into its pre-order manifest entries
#[must_use]
pub fn entries_for(snapshot: &FileSystemSnapshot) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    snapshot.visit_pre_order(|relative_path, node| {
        entries.push(ManifestEntry {
            entry_type: node.file_type(),
            relative_path: relative_path.to_string(),
            content_hash: node.hash(),
            length: node.length(),
        });
    });
    entries
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
