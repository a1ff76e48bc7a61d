//! Snapshot metadata record
//!
//! Per SNAPSHOT.md §2, `metadata.json` stores only immutable facts:
//! id, directory path, creation instant. Runtime state (refcount) is
//! never persisted; it reloads as zero because handles do not survive a
//! restart.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// On-disk metadata record for one snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Snapshot id (monotonically increasing per store)
    pub id: u64,

    /// Snapshot directory path
    pub path: PathBuf,

    /// Creation instant (wall clock)
    pub created_at: DateTime<Utc>,
}

impl SnapshotMetadata {
    /// Serializes the record to pretty JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Deserializes the record from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_roundtrip() {
        let meta = SnapshotMetadata {
            id: 3,
            path: PathBuf::from("/backingfiles/snapshots/snap-000003"),
            created_at: Utc::now(),
        };

        let json = meta.to_json().unwrap();
        let parsed = SnapshotMetadata::from_json(&json).unwrap();

        assert_eq!(meta, parsed);
    }

    #[test]
    fn test_metadata_json_fields() {
        let meta = SnapshotMetadata {
            id: 12,
            path: PathBuf::from("/snapshots/snap-000012"),
            created_at: Utc::now(),
        };

        let json = meta.to_json().unwrap();
        assert!(json.contains("\"id\""));
        assert!(json.contains("\"path\""));
        assert!(json.contains("\"created_at\""));
    }

    #[test]
    fn test_metadata_rejects_garbage() {
        assert!(SnapshotMetadata::from_json("not json").is_err());
        assert!(SnapshotMetadata::from_json("{\"id\": 1}").is_err());
    }
}
