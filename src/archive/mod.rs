//! Archive subsystem
//!
//! Copies clip directories from a mounted snapshot to a remote
//! destination and reclaims the space on the live image afterwards.
//!
//! Per ARCHIVE.md:
//! - The backend is abstract: a reachability probe plus a directory copy
//!   whose failures are returned, never raised.
//! - The driver captures a manifest (relative path + size) of each
//!   directory from the snapshot side immediately before copying; the
//!   manifest is the delete-list applied later to the live image, and the
//!   recorded size is the guard against deleting content the car has
//!   rewritten since the snapshot.

mod backend;
mod driver;
mod result;

pub use backend::{ArchiveBackend, NullBackend, RcloneBackend};
pub use driver::{ArchiveDriver, ArchiveToggles};
pub use result::{ArchiveResult, ArchiveState, ArchivedFile, CopyOutcome};

/// Logical clip directory names and their paths on the camera filesystem
pub const CLIP_DIRS: [(&str, &str); 4] = [
    ("SavedClips", "TeslaCam/SavedClips"),
    ("SentryClips", "TeslaCam/SentryClips"),
    ("RecentClips", "TeslaCam/RecentClips"),
    ("TrackMode", "TeslaTrackMode"),
];

/// Path of a logical clip directory relative to the image root
pub fn clip_dir_path(name: &str) -> Option<&'static str> {
    CLIP_DIRS
        .iter()
        .find(|(logical, _)| *logical == name)
        .map(|(_, path)| *path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_dir_mapping() {
        assert_eq!(clip_dir_path("SavedClips"), Some("TeslaCam/SavedClips"));
        assert_eq!(clip_dir_path("TrackMode"), Some("TeslaTrackMode"));
        assert_eq!(clip_dir_path("Photobooth"), None);
    }
}
