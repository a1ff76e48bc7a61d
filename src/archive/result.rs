//! Archive result model
//!
//! Per ARCHIVE.md §2, an archive cycle produces one `ArchiveResult`:
//! terminal state, transfer counts, timestamps, an optional error, and
//! the per-directory manifests used later to delete archived files from
//! the live image.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// State of an archive operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    /// Created, nothing attempted yet
    Pending,
    /// Probing backend reachability
    Connecting,
    /// Copying clip directories
    Archiving,
    /// Every selected directory copied
    Completed,
    /// Unreachable backend or at least one directory failed
    Failed,
}

/// One manifest entry: a file captured from the snapshot before copying.
///
/// The size is the safety check for later deletion: a live file whose
/// size no longer matches is never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedFile {
    /// Path relative to the clip directory
    /// (e.g. `2024-01-01_12-00-00/front.mp4`)
    pub relative_path: PathBuf,
    /// Size in bytes at the moment of the snapshot-side scan
    pub size: u64,
}

/// Result of one backend directory copy
#[derive(Debug, Clone, Default)]
pub struct CopyOutcome {
    /// Whether the copy completed
    pub success: bool,
    /// Files the backend reported transferring
    pub files_transferred: u64,
    /// Bytes the backend reported transferring
    pub bytes_transferred: u64,
    /// Failure description when `success` is false
    pub error: Option<String>,
}

impl CopyOutcome {
    /// A failed copy with the given error
    pub fn failed(error: impl Into<String>) -> Self {
        CopyOutcome {
            success: false,
            error: Some(error.into()),
            ..CopyOutcome::default()
        }
    }
}

/// Result of one archive cycle
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    /// Snapshot the cycle archived from, when one was created
    pub snapshot_id: Option<u64>,
    /// Terminal (or current) state
    pub state: ArchiveState,
    /// Total files transferred across directories
    pub files_transferred: u64,
    /// Total bytes transferred across directories
    pub bytes_transferred: u64,
    /// When the cycle started
    pub started_at: Option<DateTime<Utc>>,
    /// When the cycle reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Concatenated per-directory failure descriptions
    pub error: Option<String>,
    /// Manifests keyed by logical directory name; only directories whose
    /// copy succeeded appear here, so a partial failure still allows
    /// reclaiming space for what did archive
    pub archived_files: BTreeMap<String, Vec<ArchivedFile>>,
}

impl ArchiveResult {
    /// A fresh PENDING result for `snapshot_id`
    pub fn pending(snapshot_id: Option<u64>) -> Self {
        ArchiveResult {
            snapshot_id,
            state: ArchiveState::Pending,
            files_transferred: 0,
            bytes_transferred: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
            archived_files: BTreeMap::new(),
        }
    }

    /// Whether the cycle completed with every directory archived
    pub fn success(&self) -> bool {
        self.state == ArchiveState::Completed
    }

    /// Whether any manifest entries exist (space can be reclaimed)
    pub fn has_manifests(&self) -> bool {
        self.archived_files.values().any(|files| !files.is_empty())
    }

    /// Wall-clock duration of the cycle, when both timestamps are set
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
