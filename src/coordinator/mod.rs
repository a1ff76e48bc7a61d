//! Coordinator
//!
//! Owns the main loop: wait for the archive destination to become
//! reachable, wait for the car to go quiet, snapshot the live image,
//! archive the snapshot, reclaim space on the live image inside the
//! gadget-exclusion window, and delete the snapshot.
//!
//! Per COORDINATOR.md §4, the exclusion window is a correctness boundary:
//! the live image's FAT filesystem is single-writer-safe only, so it is
//! bound to the USB gadget or mounted on the host, never both. Disabling
//! the gadget is verified by reading `is_enabled()` back; a gadget that
//! ignored the unbind skips the delete phase entirely.
//!
//! Within a cycle the order is fixed: eager purge, snapshot create,
//! archive, live-disk delete, snapshot delete.

mod backoff;
mod shutdown;

pub use backoff::Backoff;
pub use shutdown::ShutdownFlag;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::archive::{ArchiveBackend, ArchiveDriver, ArchiveResult, ArchiveState};
use crate::fsys::Filesystem;
use crate::gadget::MassStorageGadget;
use crate::idle::IdleDetector;
use crate::mount::{ImageMounter, MountMode};
use crate::observability::Logger;
use crate::snapshot::SnapshotStore;
use crate::space::{SpaceInfo, SpaceManager};

/// State of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Booting, running self-checks
    Starting,
    /// Polling backend reachability
    WaitingForArchive,
    /// Running an archive cycle
    Archiving,
    /// Shut down
    Stopped,
    /// Fatal startup condition
    Error,
}

impl CoordinatorState {
    fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Starting => "starting",
            CoordinatorState::WaitingForArchive => "waiting_for_archive",
            CoordinatorState::Archiving => "archiving",
            CoordinatorState::Stopped => "stopped",
            CoordinatorState::Error => "error",
        }
    }
}

/// Coordinator timing and path settings
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Base interval for reachability and idle backoff
    pub poll_base: Duration,
    /// Cap for both backoff schedules
    pub poll_max: Duration,
    /// Bound on the idle wait before snapshotting
    pub idle_timeout: Duration,
    /// Sleep after a failed cycle
    pub error_retry: Duration,
    /// Live image to delete archived files from; None disables the
    /// delete phase entirely
    pub live_image: Option<PathBuf>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            poll_base: Duration::from_secs(5),
            poll_max: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(90),
            error_retry: Duration::from_secs(30),
            live_image: None,
        }
    }
}

/// Outcome of one archive cycle
#[derive(Debug)]
pub struct CycleReport {
    /// The archive result (state, counts, manifests)
    pub result: ArchiveResult,
    /// Stale snapshots removed by the eager purge
    pub purged_stale: u32,
    /// Files deleted from the live image
    pub deleted: u64,
    /// Files skipped during live-image deletion
    pub skipped: u64,
}

/// Snapshot-store summary for status reporting
#[derive(Debug, Serialize)]
pub struct SnapshotSummary {
    /// Registered snapshots
    pub count: usize,
    /// Snapshots with refcount zero
    pub deletable: usize,
    /// All snapshot ids, oldest first
    pub ids: Vec<u64>,
}

/// Status report for the CLI
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Coordinator state
    pub state: CoordinatorState,
    /// Archive cycles attempted
    pub archive_count: u64,
    /// Cycles that failed
    pub error_count: u64,
    /// Snapshot id of the last archive, if any
    pub last_snapshot_id: Option<u64>,
    /// Backing volume usage, when statvfs succeeded
    pub space: Option<SpaceInfo>,
    /// Snapshot store summary
    pub snapshots: SnapshotSummary,
    /// Whether the backend answered the reachability probe
    pub archive_reachable: bool,
}

/// Orchestrates snapshots, archiving, and space reclamation
pub struct Coordinator {
    fs: Arc<dyn Filesystem>,
    store: Arc<SnapshotStore>,
    driver: ArchiveDriver,
    space: SpaceManager,
    backend: Arc<dyn ArchiveBackend>,
    mounter: Arc<dyn ImageMounter>,
    gadget: Option<Arc<dyn MassStorageGadget>>,
    idle: Option<Mutex<IdleDetector>>,
    settings: CoordinatorSettings,
    shutdown: ShutdownFlag,
    state: Mutex<CoordinatorState>,
    archive_count: AtomicU64,
    error_count: AtomicU64,
    last_result: Mutex<Option<ArchiveResult>>,
}

impl Coordinator {
    /// Assemble a coordinator over the given subsystems
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn Filesystem>,
        store: Arc<SnapshotStore>,
        driver: ArchiveDriver,
        space: SpaceManager,
        backend: Arc<dyn ArchiveBackend>,
        mounter: Arc<dyn ImageMounter>,
        settings: CoordinatorSettings,
        shutdown: ShutdownFlag,
    ) -> Self {
        Coordinator {
            fs,
            store,
            driver,
            space,
            backend,
            mounter,
            gadget: None,
            idle: None,
            settings,
            shutdown,
            state: Mutex::new(CoordinatorState::Stopped),
            archive_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_result: Mutex::new(None),
        }
    }

    /// Attach the USB gadget for the exclusion window
    pub fn with_gadget(mut self, gadget: Arc<dyn MassStorageGadget>) -> Self {
        self.gadget = Some(gadget);
        self
    }

    /// Attach an idle detector; without one, cycles snapshot immediately
    pub fn with_idle_detector(mut self, idle: IdleDetector) -> Self {
        self.idle = Some(Mutex::new(idle));
        self
    }

    /// The shared shutdown flag (for signal installation)
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Current state
    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().expect("coordinator state lock")
    }

    /// Request graceful shutdown
    pub fn stop(&self) {
        Logger::info("COORDINATOR_STOP_REQUESTED", &[]);
        self.shutdown.request_stop();
    }

    fn set_state(&self, new_state: CoordinatorState) {
        let mut state = self.state.lock().expect("coordinator state lock");
        Logger::info(
            "COORDINATOR_STATE",
            &[("from", state.as_str()), ("to", new_state.as_str())],
        );
        *state = new_state;
    }

    /// Operator-error check: the sizing bound in SPACE.md requires the
    /// live image to fit in half the backing volume.
    fn startup_self_check(&self) {
        let Some(live_image) = &self.settings.live_image else {
            return;
        };
        let Ok(stat) = self.fs.stat(live_image) else {
            return;
        };
        let Ok(info) = self.space.space_info() else {
            return;
        };
        if stat.size > info.total_bytes / 2 {
            Logger::error(
                "LIVE_IMAGE_OVERSIZED",
                &[
                    ("image_bytes", &stat.size.to_string()),
                    ("volume_bytes", &info.total_bytes.to_string()),
                ],
            );
        }
    }

    /// Block until the backend is reachable, polling on an exponential
    /// backoff. Returns false when shutdown interrupted the wait.
    fn wait_for_reachable(&self) -> bool {
        self.set_state(CoordinatorState::WaitingForArchive);
        let mut backoff = Backoff::new(self.settings.poll_base, self.settings.poll_max);

        while !self.shutdown.is_stopped() {
            if self.backend.is_reachable() {
                Logger::info("ARCHIVE_REACHABLE", &[]);
                return true;
            }
            if !self.shutdown.sleep(backoff.next_interval()) {
                return false;
            }
        }
        false
    }

    /// Remove refcount-zero snapshots left over from earlier runs.
    ///
    /// Zero is the normal case. One means the previous run did not get to
    /// its post-archive delete (likely an unclean shutdown). Two or more
    /// should be impossible while at most one snapshot exists per cycle.
    fn purge_stale_snapshots(&self) -> u32 {
        let mut purged = 0u32;
        while self.store.delete_oldest_deletable() {
            purged += 1;
        }
        match purged {
            0 => {}
            1 => Logger::warn(
                "STALE_SNAPSHOT_PURGED",
                &[("detail", "likely unclean shutdown")],
            ),
            n => Logger::error(
                "STALE_SNAPSHOTS_PURGED",
                &[
                    ("count", &n.to_string()),
                    ("detail", "multiple stragglers indicate a bug"),
                ],
            ),
        }
        purged
    }

    fn failed_result(error: impl Into<String>) -> ArchiveResult {
        let mut result = ArchiveResult::pending(None);
        result.state = ArchiveState::Failed;
        result.error = Some(error.into());
        result.completed_at = Some(chrono::Utc::now());
        result
    }

    /// Run one archive cycle: purge, idle wait, snapshot, archive,
    /// delete window, snapshot delete.
    pub fn run_cycle(&self) -> CycleReport {
        let purged_stale = self.purge_stale_snapshots();

        if let Some(idle) = &self.idle {
            let confirmed = idle
                .lock()
                .expect("idle detector lock")
                .wait_for_idle(self.settings.idle_timeout);
            if !confirmed && !self.shutdown.is_stopped() {
                Logger::warn("IDLE_TIMEOUT_PROCEEDING", &[]);
            }
        }

        if self.shutdown.is_stopped() {
            return self.finish_cycle(CycleReport {
                result: Self::failed_result("shutdown requested"),
                purged_stale,
                deleted: 0,
                skipped: 0,
            });
        }

        let handle = match self.store.session() {
            Ok(handle) => handle,
            Err(e) => {
                Logger::error("CYCLE_SNAPSHOT_FAILED", &[("error", &e.to_string())]);
                return self.finish_cycle(CycleReport {
                    result: Self::failed_result(e.to_string()),
                    purged_stale,
                    deleted: 0,
                    skipped: 0,
                });
            }
        };
        let snapshot_id = handle.snapshot().id;

        let mounted = match self
            .mounter
            .mount(&handle.snapshot().image_path(), MountMode::ReadOnly)
        {
            Ok(mounted) => mounted,
            Err(e) => {
                Logger::error("CYCLE_MOUNT_FAILED", &[("error", &e.to_string())]);
                drop(handle);
                self.delete_cycle_snapshot(snapshot_id);
                let mut result = Self::failed_result(e.to_string());
                result.snapshot_id = Some(snapshot_id);
                return self.finish_cycle(CycleReport {
                    result,
                    purged_stale,
                    deleted: 0,
                    skipped: 0,
                });
            }
        };

        let result = self.driver.archive(&handle, mounted.path());

        if let Err(e) = mounted.unmount() {
            Logger::warn("CYCLE_UNMOUNT_FAILED", &[("error", &e.to_string())]);
        }

        let (deleted, skipped) = match &self.settings.live_image {
            Some(live_image) if result.has_manifests() => self.delete_window(live_image, &result),
            _ => (0, 0),
        };

        drop(handle);
        self.delete_cycle_snapshot(snapshot_id);

        self.finish_cycle(CycleReport {
            result,
            purged_stale,
            deleted,
            skipped,
        })
    }

    fn finish_cycle(&self, report: CycleReport) -> CycleReport {
        self.archive_count.fetch_add(1, Ordering::Relaxed);
        if !report.result.success() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_result.lock().expect("last result lock") = Some(report.result.clone());
        report
    }

    /// Post-archive snapshot delete; failure is left to the next cycle's
    /// eager purge.
    fn delete_cycle_snapshot(&self, snapshot_id: u64) {
        if let Err(e) = self.store.delete(snapshot_id) {
            Logger::warn(
                "SNAPSHOT_DELETE_DEFERRED",
                &[("id", &snapshot_id.to_string()), ("error", &e.to_string())],
            );
        }
    }

    /// The gadget-exclusion delete window.
    ///
    /// Sequence: record gadget state, disable, VERIFY via is_enabled(),
    /// repair the FAT, mount read-write, delete with size verification,
    /// unmount, re-enable if it was enabled before. A gadget that stays
    /// enabled after disable() skips the window; the archive itself is
    /// unaffected.
    fn delete_window(&self, live_image: &Path, result: &ArchiveResult) -> (u64, u64) {
        let mut reenable = false;
        if let Some(gadget) = &self.gadget {
            if gadget.is_enabled() {
                if let Err(e) = gadget.disable() {
                    Logger::warn("GADGET_DISABLE_FAILED", &[("error", &e.to_string())]);
                    return (0, 0);
                }
                // Ground truth check: some kernels accept the unbind write
                // and leave the gadget bound.
                if gadget.is_enabled() {
                    Logger::warn("GADGET_STILL_ENABLED", &[]);
                    return (0, 0);
                }
                reenable = true;
            }
        }

        let counts = self.delete_from_live(live_image, result);

        if reenable {
            if let Some(gadget) = &self.gadget {
                if let Err(e) = gadget.enable() {
                    Logger::error("GADGET_REENABLE_FAILED", &[("error", &e.to_string())]);
                }
            }
        }
        counts
    }

    fn delete_from_live(&self, live_image: &Path, result: &ArchiveResult) -> (u64, u64) {
        // The car lost mid-write state when the gadget went away
        if let Err(e) = self.mounter.repair(live_image) {
            Logger::warn("LIVE_REPAIR_FAILED", &[("error", &e.to_string())]);
            return (0, 0);
        }

        let mounted = match self.mounter.mount(live_image, MountMode::ReadWrite) {
            Ok(mounted) => mounted,
            Err(e) => {
                Logger::warn("LIVE_MOUNT_FAILED", &[("error", &e.to_string())]);
                return (0, 0);
            }
        };

        let counts = self.driver.delete_archived(result, mounted.path());

        if let Err(e) = mounted.unmount() {
            Logger::warn("LIVE_UNMOUNT_FAILED", &[("error", &e.to_string())]);
        }
        counts
    }

    /// Sleep to schedule after a cycle.
    ///
    /// Successful cycles that moved nothing advance the idle backoff;
    /// cycles that moved files or failed reset it. Failures sleep the
    /// fixed error-retry interval.
    fn next_cycle_delay(
        settings: &CoordinatorSettings,
        idle_backoff: &mut Backoff,
        result: &ArchiveResult,
    ) -> Duration {
        if !result.success() {
            *idle_backoff = Backoff::new(settings.poll_base, settings.poll_max);
            return settings.error_retry;
        }
        if result.files_transferred == 0 {
            idle_backoff.next_interval()
        } else {
            *idle_backoff = Backoff::new(settings.poll_base, settings.poll_max);
            idle_backoff.next_interval()
        }
    }

    /// Run one cycle if the backend is reachable (manual trigger)
    pub fn run_once(&self) -> bool {
        if !self.backend.is_reachable() {
            Logger::error("ARCHIVE_UNREACHABLE", &[]);
            return false;
        }
        self.set_state(CoordinatorState::Archiving);
        let report = self.run_cycle();
        self.set_state(CoordinatorState::Stopped);
        report.result.success()
    }

    /// Run the main loop until shutdown
    pub fn run(&self) {
        self.set_state(CoordinatorState::Starting);
        self.startup_self_check();
        Logger::info("COORDINATOR_STARTED", &[]);

        let mut idle_backoff = Backoff::new(self.settings.poll_base, self.settings.poll_max);

        while !self.shutdown.is_stopped() {
            if !self.wait_for_reachable() {
                break;
            }

            self.set_state(CoordinatorState::Archiving);
            let report = self.run_cycle();

            if report.result.success() {
                Logger::info(
                    "CYCLE_COMPLETE",
                    &[
                        ("files", &report.result.files_transferred.to_string()),
                        ("deleted", &report.deleted.to_string()),
                        ("skipped", &report.skipped.to_string()),
                    ],
                );
            } else {
                Logger::warn(
                    "CYCLE_FAILED",
                    &[(
                        "error",
                        report.result.error.as_deref().unwrap_or("unknown"),
                    )],
                );
            }

            let delay = Self::next_cycle_delay(&self.settings, &mut idle_backoff, &report.result);
            if !self.shutdown.sleep(delay) {
                break;
            }
        }

        self.set_state(CoordinatorState::Stopped);
        Logger::info(
            "COORDINATOR_STOPPED",
            &[
                ("archives", &self.archive_count.load(Ordering::Relaxed).to_string()),
                ("errors", &self.error_count.load(Ordering::Relaxed).to_string()),
            ],
        );
    }

    /// Current status for the CLI
    pub fn status(&self) -> StatusReport {
        let snapshots = self.store.list();
        StatusReport {
            state: self.state(),
            archive_count: self.archive_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_snapshot_id: self
                .last_result
                .lock()
                .expect("last result lock")
                .as_ref()
                .and_then(|r| r.snapshot_id),
            space: self.space.space_info().ok(),
            snapshots: SnapshotSummary {
                count: snapshots.len(),
                deletable: self.store.deletable_ids().len(),
                ids: snapshots.iter().map(|s| s.id).collect(),
            },
            archive_reachable: self.backend.is_reachable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn result_with(state: ArchiveState, files: u64) -> ArchiveResult {
        let mut result = ArchiveResult::pending(Some(0));
        result.state = state;
        result.files_transferred = files;
        result
    }

    #[test]
    fn test_idle_backoff_advances_on_empty_cycles() {
        let settings = CoordinatorSettings::default();
        let mut idle_backoff = Backoff::new(settings.poll_base, settings.poll_max);

        // Completed cycles with file counts [0, 0, 0, 5]
        let delays: Vec<u64> = [0u64, 0, 0, 5]
            .iter()
            .map(|files| {
                Coordinator::next_cycle_delay(
                    &settings,
                    &mut idle_backoff,
                    &result_with(ArchiveState::Completed, *files),
                )
                .as_secs()
            })
            .collect();

        assert_eq!(delays, vec![5, 10, 20, 5]);
    }

    #[test]
    fn test_failed_cycle_uses_error_retry_and_resets_backoff() {
        let settings = CoordinatorSettings::default();
        let mut idle_backoff = Backoff::new(settings.poll_base, settings.poll_max);

        // Advance the idle backoff first
        Coordinator::next_cycle_delay(
            &settings,
            &mut idle_backoff,
            &result_with(ArchiveState::Completed, 0),
        );

        let failed = Coordinator::next_cycle_delay(
            &settings,
            &mut idle_backoff,
            &result_with(ArchiveState::Failed, 0),
        );
        assert_eq!(failed, secs(30));

        // Next empty cycle starts from base again
        let after = Coordinator::next_cycle_delay(
            &settings,
            &mut idle_backoff,
            &result_with(ArchiveState::Completed, 0),
        );
        assert_eq!(after, secs(5));
    }
}
