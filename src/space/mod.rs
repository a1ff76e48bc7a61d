//! Space accounting for the backing volume
//!
//! Per SPACE.md, the live image is sized so that one worst-case snapshot
//! always fits:
//!
//! ```text
//! overhead  = floor(backing_size * 0.03)        filesystem metadata
//! raw       = floor((backing_size - overhead) / 2)
//! cam_size  = floor(raw / 512) * 512            sector-aligned, never up
//! ```
//!
//! Reflink snapshots start near zero cost and grow as the car rewrites
//! blocks; at full divergence the snapshot plus the live image occupy
//! 2 x cam_size. Bounding cam_size at half the usable volume means a
//! single snapshot can never run the volume out of space, and the
//! coordinator guarantees at most one snapshot exists. Rounding the size
//! up instead of down would let the loop-device layer truncate the last
//! partial sector, leaving the partition table addressing past the end of
//! the device.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::fsys::{Filesystem, FsResult};

/// Sector size the gadget layer exposes; the image must be a multiple
pub const SECTOR_SIZE: u64 = 512;

const OVERHEAD_PERCENT: u64 = 3;
const GIB: u64 = 1024 * 1024 * 1024;

/// Maximum live-image size for a backing volume of `backing_size` bytes.
pub fn cam_size_for_backing(backing_size: u64) -> u64 {
    let overhead = backing_size * OVERHEAD_PERCENT / 100;
    let raw = backing_size.saturating_sub(overhead) / 2;
    raw / SECTOR_SIZE * SECTOR_SIZE
}

/// Volume-level usage snapshot
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpaceInfo {
    /// Volume capacity in bytes
    pub total_bytes: u64,
    /// Bytes in use
    pub used_bytes: u64,
    /// Bytes available to the daemon
    pub available_bytes: u64,
}

impl SpaceInfo {
    /// Capacity in GiB
    pub fn total_gib(&self) -> f64 {
        self.total_bytes as f64 / GIB as f64
    }

    /// Available space in GiB
    pub fn available_gib(&self) -> f64 {
        self.available_bytes as f64 / GIB as f64
    }
}

impl std::fmt::Display for SpaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1} GiB available / {:.1} GiB total",
            self.available_gib(),
            self.total_gib()
        )
    }
}

/// Reports free space on the backing volume
pub struct SpaceManager {
    fs: Arc<dyn Filesystem>,
    backing_root: PathBuf,
}

impl SpaceManager {
    /// Create a manager for the volume containing `backing_root`
    pub fn new(fs: Arc<dyn Filesystem>, backing_root: PathBuf) -> Self {
        SpaceManager { fs, backing_root }
    }

    /// Current totals from statvfs
    pub fn space_info(&self) -> FsResult<SpaceInfo> {
        let stats = self.fs.statvfs(&self.backing_root)?;
        let total = stats.total_bytes();
        Ok(SpaceInfo {
            total_bytes: total,
            used_bytes: total.saturating_sub(stats.free_bytes()),
            available_bytes: stats.available_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::MemFilesystem;
    use std::path::Path;

    #[test]
    fn test_cam_size_is_sector_aligned() {
        for backing in [
            64 * GIB,
            118 * GIB,
            256 * GIB,
            1_000_000_000_000,
            123_456_789_012,
        ] {
            let cam = cam_size_for_backing(backing);
            assert_eq!(cam % SECTOR_SIZE, 0, "backing {}", backing);
        }
    }

    #[test]
    fn test_cam_size_at_most_half_of_usable() {
        for backing in [64 * GIB, 118 * GIB, 500 * GIB, 999_999_999_999] {
            let overhead = backing * 3 / 100;
            let cam = cam_size_for_backing(backing);
            assert!(cam <= (backing - overhead) / 2, "backing {}", backing);
        }
    }

    #[test]
    fn test_118_gib_volume() {
        let backing = 118 * GIB;
        let overhead = backing * 3 / 100;
        let cam = cam_size_for_backing(backing);

        assert_eq!(cam % 512, 0);
        // The half-point is not sector-aligned here, so alignment rounds
        // strictly down
        assert!(cam < (backing - overhead) / 2);
    }

    #[test]
    fn test_alignment_rounds_down_not_up() {
        // 10240 bytes: overhead 307, raw (10240-307)/2 = 4966,
        // aligned down to 4608 rather than up to 5120
        assert_eq!(cam_size_for_backing(10_240), 4_608);
    }

    #[test]
    fn test_space_info_from_statvfs() {
        let fs = Arc::new(MemFilesystem::new());
        fs.set_total_space(10 * GIB);
        fs.write_sized(Path::new("/backingfiles/cam_disk.bin"), 4096 * 100);

        let manager = SpaceManager::new(fs, PathBuf::from("/backingfiles"));
        let info = manager.space_info().unwrap();

        assert_eq!(info.total_bytes, 10 * GIB);
        assert!(info.used_bytes >= 4096 * 100);
        assert!(info.available_bytes < info.total_bytes);
    }
}
