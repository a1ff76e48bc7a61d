//! Archive driver
//!
//! Given an acquired snapshot mounted read-only, the driver enumerates
//! clip directories, captures a manifest of each (relative path + size,
//! scanned immediately before the copy), invokes the backend, and later
//! deletes archived files from the read-write live image with size
//! verification.
//!
//! Per ARCHIVE.md §4, a directory whose copy fails is recorded in the
//! result's error and blocks COMPLETED status, but manifests of
//! directories that did succeed are preserved so their space can still be
//! reclaimed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::fsys::Filesystem;
use crate::observability::Logger;
use crate::snapshot::SnapshotHandle;

use super::backend::ArchiveBackend;
use super::result::{ArchiveResult, ArchiveState, ArchivedFile};
use super::clip_dir_path;

/// Which logical clip directories to archive
#[derive(Debug, Clone, Copy)]
pub struct ArchiveToggles {
    /// TeslaCam/SavedClips
    pub saved: bool,
    /// TeslaCam/SentryClips
    pub sentry: bool,
    /// TeslaCam/RecentClips (off by default; the car churns these)
    pub recent: bool,
    /// TeslaTrackMode
    pub track: bool,
}

impl Default for ArchiveToggles {
    fn default() -> Self {
        ArchiveToggles {
            saved: true,
            sentry: true,
            recent: false,
            track: true,
        }
    }
}

/// Drives one archive pass over a mounted snapshot
pub struct ArchiveDriver {
    fs: Arc<dyn Filesystem>,
    backend: Arc<dyn ArchiveBackend>,
    toggles: ArchiveToggles,
}

impl ArchiveDriver {
    /// Create a driver copying through `backend`
    pub fn new(
        fs: Arc<dyn Filesystem>,
        backend: Arc<dyn ArchiveBackend>,
        toggles: ArchiveToggles,
    ) -> Self {
        ArchiveDriver {
            fs,
            backend,
            toggles,
        }
    }

    /// Logical directories enabled by configuration and present on the
    /// mounted snapshot
    fn dirs_to_archive(&self, mount: &Path) -> Vec<(PathBuf, &'static str)> {
        let selected = [
            (self.toggles.saved, "SavedClips"),
            (self.toggles.sentry, "SentryClips"),
            (self.toggles.recent, "RecentClips"),
            (self.toggles.track, "TrackMode"),
        ];

        let mut dirs = Vec::new();
        for (enabled, name) in selected {
            if !enabled {
                continue;
            }
            let path = mount.join(clip_dir_path(name).expect("known directory"));
            if self.fs.exists(&path) {
                dirs.push((path, name));
            }
        }
        dirs
    }

    /// Scan a clip directory, capturing relative path + size of every
    /// file. Unreadable files are skipped with a warning; they simply
    /// stay on the live image for the next cycle.
    fn scan_directory(&self, src: &Path) -> Vec<ArchivedFile> {
        let entries = match self.fs.walk(src) {
            Ok(entries) => entries,
            Err(e) => {
                Logger::warn(
                    "ARCHIVE_SCAN_FAILED",
                    &[("dir", &src.display().to_string()), ("error", &e.to_string())],
                );
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            for name in &entry.files {
                let full = entry.dir.join(name);
                match self.fs.stat(&full) {
                    Ok(stat) => {
                        let relative = full
                            .strip_prefix(src)
                            .expect("walk stays under src")
                            .to_path_buf();
                        files.push(ArchivedFile {
                            relative_path: relative,
                            size: stat.size,
                        });
                    }
                    Err(e) => {
                        Logger::warn(
                            "ARCHIVE_STAT_FAILED",
                            &[
                                ("path", &full.display().to_string()),
                                ("error", &e.to_string()),
                            ],
                        );
                    }
                }
            }
        }
        files
    }

    /// Archive every selected clip directory from the snapshot mounted at
    /// `mount_path`.
    ///
    /// State sequence: CONNECTING (reachability) -> ARCHIVING (per
    /// directory scan + copy) -> COMPLETED iff every directory succeeded,
    /// FAILED otherwise with the concatenated per-directory errors.
    pub fn archive(&self, handle: &SnapshotHandle, mount_path: &Path) -> ArchiveResult {
        let snapshot = handle.snapshot();
        let mut result = ArchiveResult::pending(Some(snapshot.id));

        Logger::info(
            "ARCHIVE_STARTED",
            &[
                ("snapshot_id", &snapshot.id.to_string()),
                ("mount", &mount_path.display().to_string()),
            ],
        );

        result.state = ArchiveState::Connecting;
        if !self.backend.is_reachable() {
            Logger::error("ARCHIVE_UNREACHABLE", &[]);
            result.state = ArchiveState::Failed;
            result.error = Some("archive destination not reachable".to_string());
            result.completed_at = Some(Utc::now());
            return result;
        }

        result.state = ArchiveState::Archiving;
        let dirs = self.dirs_to_archive(mount_path);
        if dirs.is_empty() {
            Logger::info("ARCHIVE_NOTHING_TO_DO", &[]);
            result.state = ArchiveState::Completed;
            result.completed_at = Some(Utc::now());
            return result;
        }

        let mut errors: Vec<String> = Vec::new();
        for (src_path, dst_name) in dirs {
            let manifest = self.scan_directory(&src_path);
            let outcome = self.backend.copy_directory(&src_path, dst_name);

            if outcome.success {
                Logger::info(
                    "ARCHIVE_DIR_DONE",
                    &[
                        ("dir", dst_name),
                        ("files", &outcome.files_transferred.to_string()),
                    ],
                );
                result.files_transferred += outcome.files_transferred;
                result.bytes_transferred += outcome.bytes_transferred;
                if !manifest.is_empty() {
                    result.archived_files.insert(dst_name.to_string(), manifest);
                }
            } else {
                let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                Logger::error("ARCHIVE_DIR_FAILED", &[("dir", dst_name), ("error", &error)]);
                errors.push(format!("{}: {}", dst_name, error));
            }
        }

        result.completed_at = Some(Utc::now());
        if errors.is_empty() {
            result.state = ArchiveState::Completed;
        } else {
            result.state = ArchiveState::Failed;
            result.error = Some(errors.join("; "));
        }

        Logger::info(
            "ARCHIVE_FINISHED",
            &[
                ("files", &result.files_transferred.to_string()),
                ("state", if result.success() { "completed" } else { "failed" }),
            ],
        );
        result
    }

    /// Delete archived files from the live image mounted read-write at
    /// `live_mount`.
    ///
    /// The caller must hold the gadget-exclusion window (COORDINATOR.md
    /// §4): the live FAT filesystem is single-writer-safe only.
    ///
    /// Per-file rules:
    /// - missing: counted as skipped (already gone)
    /// - size differs from the manifest: skipped with a warning; the car
    ///   has rewritten that slot since the snapshot and the content is
    ///   no longer what we archived
    /// - otherwise: unlinked
    ///
    /// Emptied event directories are removed bottom-up afterwards.
    /// Returns (deleted, skipped).
    pub fn delete_archived(&self, result: &ArchiveResult, live_mount: &Path) -> (u64, u64) {
        let mut deleted = 0u64;
        let mut skipped = 0u64;

        for (dir_name, files) in &result.archived_files {
            let Some(dir_path) = clip_dir_path(dir_name) else {
                Logger::warn("ARCHIVE_UNKNOWN_DIR", &[("dir", dir_name)]);
                continue;
            };
            let base = live_mount.join(dir_path);

            for archived in files {
                let file_path = base.join(&archived.relative_path);

                if !self.fs.exists(&file_path) {
                    skipped += 1;
                    continue;
                }

                let current_size = match self.fs.stat(&file_path) {
                    Ok(stat) => stat.size,
                    Err(e) => {
                        Logger::warn(
                            "DELETE_STAT_FAILED",
                            &[
                                ("path", &file_path.display().to_string()),
                                ("error", &e.to_string()),
                            ],
                        );
                        skipped += 1;
                        continue;
                    }
                };

                if current_size != archived.size {
                    Logger::warn(
                        "DELETE_SIZE_MISMATCH",
                        &[
                            ("path", &file_path.display().to_string()),
                            ("archived", &archived.size.to_string()),
                            ("current", &current_size.to_string()),
                        ],
                    );
                    skipped += 1;
                    continue;
                }

                match self.fs.remove_file(&file_path) {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        Logger::warn(
                            "DELETE_FAILED",
                            &[
                                ("path", &file_path.display().to_string()),
                                ("error", &e.to_string()),
                            ],
                        );
                        skipped += 1;
                    }
                }
            }

            self.cleanup_empty_dirs(&base);
        }

        Logger::info(
            "DELETE_ARCHIVED_DONE",
            &[
                ("deleted", &deleted.to_string()),
                ("skipped", &skipped.to_string()),
            ],
        );
        (deleted, skipped)
    }

    /// Remove now-empty directories under `base`, deepest first
    fn cleanup_empty_dirs(&self, base: &Path) {
        if !self.fs.exists(base) {
            return;
        }

        let Ok(entries) = self.fs.walk(base) else {
            return;
        };
        let mut dirs: Vec<PathBuf> = Vec::new();
        for entry in &entries {
            for name in &entry.subdirs {
                dirs.push(entry.dir.join(name));
            }
        }
        dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

        for dir in dirs {
            let empty = matches!(self.fs.list_dir(&dir), Ok(names) if names.is_empty());
            if empty {
                let _ = self.fs.remove_dir(&dir);
            }
        }
    }
}
