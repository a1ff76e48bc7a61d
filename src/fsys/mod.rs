//! Filesystem adapter
//!
//! A narrow facade over the host filesystem so that every subsystem that
//! touches disk can run against an in-memory implementation in tests.
//!
//! Two implementations:
//! - `RealFilesystem`: actual system calls (production)
//! - `MemFilesystem`: in-memory tree with settable capacity (tests)
//!
//! The one non-obvious operation is `reflink_copy`: it must produce a
//! copy-on-write clone and must FAIL when the underlying filesystem cannot
//! reflink. A silent fallback to a full copy would double the physical
//! footprint of a snapshot and break the sizing bound in SPACE.md.

mod mem;
mod real;

pub use mem::MemFilesystem;
pub use real::RealFilesystem;

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Filesystem error. One kind per failure class; everything else is `Io`.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path does not exist
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Reflink clone rejected by the filesystem. Not recoverable by
    /// retrying; the backing volume must be XFS (reflink=1) or btrfs.
    #[error("reflink copy not supported: {0}")]
    ReflinkUnsupported(String),

    /// Any other I/O failure
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },
}

impl FsError {
    /// Classify an `io::Error` for `path` into the adapter's error kinds.
    pub fn from_io(path: &Path, err: io::Error) -> FsError {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_path_buf()),
            _ => FsError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

/// Result type for filesystem operations
pub type FsResult<T> = Result<T, FsError>;

/// Result of `stat()`
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
    /// Whether the path is a directory
    pub is_dir: bool,
    /// Whether the path is a regular file
    pub is_file: bool,
}

/// Result of `statvfs()` (volume-level statistics)
#[derive(Debug, Clone, Copy)]
pub struct VfsStats {
    /// Fragment size in bytes
    pub block_size: u64,
    /// Total blocks on the volume
    pub total_blocks: u64,
    /// Free blocks
    pub free_blocks: u64,
    /// Blocks available to unprivileged users
    pub available_blocks: u64,
}

impl VfsStats {
    /// Total volume capacity in bytes
    pub fn total_bytes(&self) -> u64 {
        self.block_size * self.total_blocks
    }

    /// Free bytes
    pub fn free_bytes(&self) -> u64 {
        self.block_size * self.free_blocks
    }

    /// Available bytes
    pub fn available_bytes(&self) -> u64 {
        self.block_size * self.available_blocks
    }
}

/// One level of a directory walk
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Directory being listed
    pub dir: PathBuf,
    /// Names of subdirectories directly under `dir`
    pub subdirs: Vec<String>,
    /// Names of files directly under `dir`
    pub files: Vec<String>,
}

/// Facade over filesystem operations.
///
/// All paths are absolute. Implementations must be shareable across
/// threads; the coordinator, store, and archive driver hold the same
/// instance behind an `Arc`.
pub trait Filesystem: Send + Sync {
    /// Whether `path` exists
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is a regular file
    fn is_file(&self, path: &Path) -> bool;

    /// Whether `path` is a directory
    fn is_dir(&self, path: &Path) -> bool;

    /// File or directory metadata
    fn stat(&self, path: &Path) -> FsResult<FileStat>;

    /// Volume statistics for the filesystem containing `path`.
    ///
    /// Must report accurate free space immediately after deletions; see
    /// `RealFilesystem` for the lazy-counter handling this requires.
    fn statvfs(&self, path: &Path) -> FsResult<VfsStats>;

    /// Directory entry names, sorted
    fn list_dir(&self, path: &Path) -> FsResult<Vec<String>>;

    /// Walk the tree rooted at `path`, top-down
    fn walk(&self, path: &Path) -> FsResult<Vec<WalkEntry>>;

    /// Create a directory and any missing parents
    fn create_dir_all(&self, path: &Path) -> FsResult<()>;

    /// Remove a file
    fn remove_file(&self, path: &Path) -> FsResult<()>;

    /// Remove an empty directory
    fn remove_dir(&self, path: &Path) -> FsResult<()>;

    /// Remove a directory tree
    fn remove_dir_all(&self, path: &Path) -> FsResult<()>;

    /// Rename a file or directory
    fn rename(&self, src: &Path, dst: &Path) -> FsResult<()>;

    /// Create a symbolic link at `link` pointing to `target`
    fn symlink(&self, target: &Path, link: &Path) -> FsResult<()>;

    /// Read a file as UTF-8 text
    fn read_to_string(&self, path: &Path) -> FsResult<String>;

    /// Write text to a file, replacing any existing content
    fn write_string(&self, path: &Path, contents: &str) -> FsResult<()>;

    /// Clone `src` to `dst` via copy-on-write reflink.
    ///
    /// Fails with `FsError::ReflinkUnsupported` when the filesystem cannot
    /// share extents. Never falls back to a byte copy.
    fn reflink_copy(&self, src: &Path, dst: &Path) -> FsResult<()>;
}
