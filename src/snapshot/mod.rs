//! Snapshot subsystem
//!
//! Point-in-time reflink clones of the live camera image, held while
//! footage is archived.
//!
//! Per SNAPSHOT.md, the lifecycle is crash-safe by construction:
//!
//! - The completion marker (`snap.toc`) is the single source of truth.
//!   A snapshot directory is valid iff the marker exists.
//! - The marker is written LAST during creation and removed FIRST during
//!   deletion. A crash on either side leaves a markerless directory that
//!   the next load sweeps.
//! - State (READY vs IN_USE) is derived from the in-memory refcount, never
//!   persisted. Only immutable facts go to `metadata.json`.
//! - Ids are monotonic across restarts: next id = max(id on disk) + 1.
//!
//! Directory layout under the snapshots root:
//!
//! ```text
//! snap-000000/
//!   snap.bin        reflink clone of the live image
//!   metadata.json   id, path, creation instant
//!   snap.toc        zero-byte completion marker
//! ```

mod errors;
mod metadata;

pub use errors::{Severity, SnapshotError, SnapshotErrorCode, SnapshotResult};
pub use metadata::SnapshotMetadata;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use crate::fsys::Filesystem;
use crate::observability::Logger;

/// Snapshot id type (monotonically increasing per store)
pub type SnapshotId = u64;

/// Image file name inside a snapshot directory
pub const IMAGE_FILE: &str = "snap.bin";
/// Completion marker name; written last, removed first
pub const MARKER_FILE: &str = "snap.toc";
/// Metadata record name
pub const METADATA_FILE: &str = "metadata.json";

/// Immutable facts about one snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot id
    pub id: SnapshotId,
    /// Snapshot directory
    pub path: PathBuf,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Path to the reflinked image copy
    pub fn image_path(&self) -> PathBuf {
        self.path.join(IMAGE_FILE)
    }

    /// Path to the completion marker
    pub fn marker_path(&self) -> PathBuf {
        self.path.join(MARKER_FILE)
    }

    /// Path to the metadata record
    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }
}

/// Runtime state, derived entirely from refcount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// refcount == 0; available for use or deletion
    Ready,
    /// refcount > 0; cannot be deleted
    InUse,
}

#[derive(Debug)]
struct Entry {
    snapshot: Snapshot,
    refcount: u32,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<SnapshotId, Entry>,
    next_id: SnapshotId,
    creating: bool,
}

/// Owns the snapshots root and every snapshot lifecycle transition.
///
/// The mutex guards only the in-memory table and the create latch;
/// destructive filesystem work runs outside it.
pub struct SnapshotStore {
    fs: Arc<dyn Filesystem>,
    live_image: PathBuf,
    root: PathBuf,
    inner: Mutex<Inner>,
}

/// Scope-bound guard for an acquired snapshot.
///
/// Acquiring increments the snapshot's refcount; dropping (or calling
/// `release`) decrements it. Double release is a silent no-op. While any
/// handle is live, deleting the snapshot fails with
/// DASH_SNAPSHOT_IN_USE.
pub struct SnapshotHandle {
    store: Arc<SnapshotStore>,
    snapshot: Snapshot,
    released: bool,
}

impl SnapshotHandle {
    /// The acquired snapshot
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Release explicitly (equivalent to dropping)
    pub fn release(self) {
        // Drop runs the actual decrement
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.store.release(self.snapshot.id);
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn snap_dir_name(id: SnapshotId) -> String {
    format!("snap-{:06}", id)
}

impl SnapshotStore {
    /// Open the store, sweeping incomplete snapshot directories and
    /// loading every complete one with refcount zero.
    pub fn open(
        fs: Arc<dyn Filesystem>,
        live_image: PathBuf,
        root: PathBuf,
    ) -> SnapshotResult<Arc<SnapshotStore>> {
        let store = SnapshotStore {
            fs,
            live_image,
            root,
            inner: Mutex::new(Inner::default()),
        };
        store.load()?;
        Ok(Arc::new(store))
    }

    fn load(&self) -> SnapshotResult<()> {
        if !self.fs.exists(&self.root) {
            self.fs
                .create_dir_all(&self.root)
                .map_err(|e| SnapshotError::io("creating snapshots root", e))?;
            return Ok(());
        }

        let names = self
            .fs
            .list_dir(&self.root)
            .map_err(|e| SnapshotError::io("listing snapshots root", e))?;

        let mut inner = self.inner.lock().expect("snapshot store lock");
        for name in names {
            let Some(id_str) = name.strip_prefix("snap-") else {
                continue;
            };
            let snap_path = self.root.join(&name);
            if !self.fs.is_dir(&snap_path) {
                continue;
            }
            let Ok(id) = id_str.parse::<SnapshotId>() else {
                Logger::warn("SNAPSHOT_BAD_DIR_NAME", &[("name", &name)]);
                continue;
            };

            // The marker is the source of truth; anything without one is
            // an interrupted create or delete. The swept slot's id becomes
            // the next id again, so an interrupted create resumes where it
            // left off.
            if !self.fs.exists(&snap_path.join(MARKER_FILE)) {
                Logger::warn("SNAPSHOT_SWEPT", &[("id", &id.to_string())]);
                self.remove_dir_logged(&snap_path);
                inner.next_id = inner.next_id.max(id);
                continue;
            }

            let snapshot = self.load_or_rebuild(id, &snap_path);
            inner.entries.insert(
                id,
                Entry {
                    snapshot,
                    refcount: 0,
                },
            );
            inner.next_id = inner.next_id.max(id + 1);
        }

        Logger::info(
            "SNAPSHOTS_LOADED",
            &[("count", &inner.entries.len().to_string())],
        );
        Ok(())
    }

    /// Load metadata.json, or rebuild it from the image mtime when missing
    /// or corrupt. A valid marker outranks broken metadata.
    fn load_or_rebuild(&self, id: SnapshotId, snap_path: &Path) -> Snapshot {
        let metadata_path = snap_path.join(METADATA_FILE);
        if let Ok(text) = self.fs.read_to_string(&metadata_path) {
            if let Ok(meta) = SnapshotMetadata::from_json(&text) {
                return Snapshot {
                    id: meta.id,
                    path: snap_path.to_path_buf(),
                    created_at: meta.created_at,
                };
            }
        }

        Logger::warn("SNAPSHOT_METADATA_REBUILT", &[("id", &id.to_string())]);

        let created_at = self
            .fs
            .stat(&snap_path.join(IMAGE_FILE))
            .ok()
            .and_then(|stat| {
                stat.modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .ok()
                    .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, 0).single())
            })
            .unwrap_or_else(Utc::now);

        let snapshot = Snapshot {
            id,
            path: snap_path.to_path_buf(),
            created_at,
        };
        self.save_metadata(&snapshot);
        snapshot
    }

    fn save_metadata(&self, snapshot: &Snapshot) -> bool {
        let meta = SnapshotMetadata {
            id: snapshot.id,
            path: snapshot.path.clone(),
            created_at: snapshot.created_at,
        };
        let json = match meta.to_json() {
            Ok(json) => json,
            Err(e) => {
                Logger::warn("SNAPSHOT_METADATA_ENCODE_FAILED", &[("error", &e.to_string())]);
                return false;
            }
        };
        if let Err(e) = self.fs.write_string(&snapshot.metadata_path(), &json) {
            Logger::warn("SNAPSHOT_METADATA_WRITE_FAILED", &[("error", &e.to_string())]);
            return false;
        }
        true
    }

    fn remove_dir_logged(&self, path: &Path) {
        if self.fs.exists(path) {
            if let Err(e) = self.fs.remove_dir_all(path) {
                Logger::error(
                    "SNAPSHOT_REMOVE_FAILED",
                    &[("path", &path.display().to_string()), ("error", &e.to_string())],
                );
            }
        }
    }

    /// Create a new COW snapshot of the live image.
    ///
    /// Per SNAPSHOT.md §3, the sequence is:
    /// 1. Take the single-flight latch (fail with
    ///    DASH_SNAPSHOT_BUSY_CREATING if held)
    /// 2. mkdir `snap-<next_id>`
    /// 3. Reflink the live image into `snap.bin`
    /// 4. Write `metadata.json`
    /// 5. Write the zero-byte `snap.toc` marker LAST
    ///
    /// Any failure before step 5 removes the partial directory and fails;
    /// a crash before step 5 is swept by the next load.
    pub fn create(&self) -> SnapshotResult<Snapshot> {
        let id = {
            let mut inner = self.inner.lock().expect("snapshot store lock");
            if inner.creating {
                return Err(SnapshotError::busy_creating());
            }
            inner.creating = true;
            inner.next_id
        };

        let result = self.create_on_disk(id);

        let mut inner = self.inner.lock().expect("snapshot store lock");
        inner.creating = false;
        match result {
            Ok(snapshot) => {
                inner.entries.insert(
                    id,
                    Entry {
                        snapshot: snapshot.clone(),
                        refcount: 0,
                    },
                );
                inner.next_id = id + 1;
                Logger::info("SNAPSHOT_CREATED", &[("id", &id.to_string())]);
                Ok(snapshot)
            }
            Err(e) => Err(e),
        }
    }

    fn create_on_disk(&self, id: SnapshotId) -> SnapshotResult<Snapshot> {
        let snap_path = self.root.join(snap_dir_name(id));

        self.fs
            .create_dir_all(&snap_path)
            .map_err(|e| SnapshotError::create_failed_io("creating snapshot directory", e))?;

        let snapshot = Snapshot {
            id,
            path: snap_path.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.fs.reflink_copy(&self.live_image, &snapshot.image_path()) {
            self.remove_dir_logged(&snap_path);
            return Err(match e {
                crate::fsys::FsError::ReflinkUnsupported(_) => SnapshotError::reflink(e),
                other => SnapshotError::create_failed_io("cloning live image", other),
            });
        }

        let meta = SnapshotMetadata {
            id: snapshot.id,
            path: snapshot.path.clone(),
            created_at: snapshot.created_at,
        };
        let json = match meta.to_json() {
            Ok(json) => json,
            Err(e) => {
                self.remove_dir_logged(&snap_path);
                return Err(SnapshotError::create_failed(format!(
                    "encoding snapshot metadata: {}",
                    e
                )));
            }
        };
        if let Err(e) = self.fs.write_string(&snapshot.metadata_path(), &json) {
            self.remove_dir_logged(&snap_path);
            return Err(SnapshotError::create_failed_io("writing snapshot metadata", e));
        }

        // Marker goes last; its existence makes the snapshot real.
        if let Err(e) = self.fs.write_string(&snapshot.marker_path(), "") {
            self.remove_dir_logged(&snap_path);
            return Err(SnapshotError::create_failed_io("writing completion marker", e));
        }

        Ok(snapshot)
    }

    /// Acquire a handle, incrementing the refcount
    pub fn acquire(self: &Arc<Self>, id: SnapshotId) -> SnapshotResult<SnapshotHandle> {
        let mut inner = self.inner.lock().expect("snapshot store lock");
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| SnapshotError::not_found(id))?;
        entry.refcount += 1;
        Logger::trace(
            "SNAPSHOT_ACQUIRED",
            &[("id", &id.to_string()), ("refcount", &entry.refcount.to_string())],
        );
        Ok(SnapshotHandle {
            store: Arc::clone(self),
            snapshot: entry.snapshot.clone(),
            released: false,
        })
    }

    /// Create and immediately acquire (one archive session)
    pub fn session(self: &Arc<Self>) -> SnapshotResult<SnapshotHandle> {
        let snapshot = self.create()?;
        self.acquire(snapshot.id)
    }

    fn release(&self, id: SnapshotId) {
        let mut inner = self.inner.lock().expect("snapshot store lock");
        match inner.entries.get_mut(&id) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                Logger::trace(
                    "SNAPSHOT_RELEASED",
                    &[("id", &id.to_string()), ("refcount", &entry.refcount.to_string())],
                );
            }
            None => {
                Logger::warn("SNAPSHOT_RELEASE_ORPHANED", &[("id", &id.to_string())]);
            }
        }
    }

    /// Delete a snapshot.
    ///
    /// Fails with DASH_SNAPSHOT_IN_USE while any handle is live. The
    /// marker is removed FIRST so an interrupted delete degrades to a
    /// markerless directory the next load sweeps.
    pub fn delete(&self, id: SnapshotId) -> SnapshotResult<()> {
        let snapshot = {
            let mut inner = self.inner.lock().expect("snapshot store lock");
            let entry = inner
                .entries
                .get(&id)
                .ok_or_else(|| SnapshotError::not_found(id))?;
            if entry.refcount > 0 {
                return Err(SnapshotError::in_use(id, entry.refcount));
            }
            inner.entries.remove(&id).expect("entry present").snapshot
        };

        if self.fs.exists(&snapshot.marker_path()) {
            if let Err(e) = self.fs.remove_file(&snapshot.marker_path()) {
                Logger::warn(
                    "SNAPSHOT_MARKER_REMOVE_FAILED",
                    &[("id", &id.to_string()), ("error", &e.to_string())],
                );
            }
        }

        if self.fs.exists(&snapshot.path) {
            self.fs
                .remove_dir_all(&snapshot.path)
                .map_err(|e| SnapshotError::io("removing snapshot directory", e))?;
        }

        Logger::info("SNAPSHOT_DELETED", &[("id", &id.to_string())]);
        Ok(())
    }

    /// Delete the oldest refcount-zero snapshot.
    ///
    /// Returns true iff one was removed. The coordinator loops this to
    /// purge stragglers at the start of each archive cycle.
    pub fn delete_oldest_deletable(&self) -> bool {
        let candidate = {
            let inner = self.inner.lock().expect("snapshot store lock");
            inner
                .entries
                .values()
                .filter(|e| e.refcount == 0)
                .min_by_key(|e| (e.snapshot.created_at, e.snapshot.id))
                .map(|e| e.snapshot.id)
        };
        match candidate {
            Some(id) => self.delete(id).is_ok(),
            None => false,
        }
    }

    /// Snapshot by id
    pub fn get(&self, id: SnapshotId) -> Option<Snapshot> {
        let inner = self.inner.lock().expect("snapshot store lock");
        inner.entries.get(&id).map(|e| e.snapshot.clone())
    }

    /// Runtime state of a snapshot
    pub fn state(&self, id: SnapshotId) -> Option<SnapshotState> {
        let inner = self.inner.lock().expect("snapshot store lock");
        inner.entries.get(&id).map(|e| {
            if e.refcount > 0 {
                SnapshotState::InUse
            } else {
                SnapshotState::Ready
            }
        })
    }

    /// All snapshots, oldest first
    pub fn list(&self) -> Vec<Snapshot> {
        let inner = self.inner.lock().expect("snapshot store lock");
        let mut all: Vec<Snapshot> = inner.entries.values().map(|e| e.snapshot.clone()).collect();
        all.sort_by_key(|s| (s.created_at, s.id));
        all
    }

    /// Ids of snapshots with refcount zero, oldest first
    pub fn deletable_ids(&self) -> Vec<SnapshotId> {
        let inner = self.inner.lock().expect("snapshot store lock");
        let mut ids: Vec<(DateTime<Utc>, SnapshotId)> = inner
            .entries
            .values()
            .filter(|e| e.refcount == 0)
            .map(|e| (e.snapshot.created_at, e.snapshot.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of registered snapshots
    pub fn len(&self) -> usize {
        self.inner.lock().expect("snapshot store lock").entries.len()
    }

    /// Whether the store has no snapshots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::MemFilesystem;

    fn setup() -> (Arc<MemFilesystem>, PathBuf, PathBuf) {
        let fs = Arc::new(MemFilesystem::new());
        let live_image = PathBuf::from("/backingfiles/cam_disk.bin");
        let root = PathBuf::from("/backingfiles/snapshots");
        fs.write_bytes(&live_image, b"live image contents");
        (fs, live_image, root)
    }

    fn open_store(
        fs: &Arc<MemFilesystem>,
        live_image: &Path,
        root: &Path,
    ) -> Arc<SnapshotStore> {
        SnapshotStore::open(
            fs.clone() as Arc<dyn Filesystem>,
            live_image.to_path_buf(),
            root.to_path_buf(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_writes_image_metadata_and_marker() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);

        let snapshot = store.create().unwrap();

        assert_eq!(snapshot.id, 0);
        assert_eq!(snapshot.path, root.join("snap-000000"));
        assert!(fs.exists(&snapshot.image_path()));
        assert!(fs.exists(&snapshot.metadata_path()));
        assert!(fs.exists(&snapshot.marker_path()));
        assert_eq!(
            fs.read_bytes(&snapshot.image_path()).unwrap(),
            b"live image contents"
        );
    }

    #[test]
    fn test_ids_are_monotonic() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);

        assert_eq!(store.create().unwrap().id, 0);
        assert_eq!(store.create().unwrap().id, 1);
        store.delete(0).unwrap();
        store.delete(1).unwrap();

        // Ids never reuse even after everything is deleted and reloaded
        assert_eq!(store.create().unwrap().id, 2);
        let reloaded = open_store(&fs, &live_image, &root);
        assert_eq!(reloaded.create().unwrap().id, 3);
    }

    #[test]
    fn test_reflink_failure_aborts_and_cleans_up() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);
        fs.set_reflink_supported(false);

        let err = store.create().unwrap_err();

        assert_eq!(err.code(), SnapshotErrorCode::Reflink);
        assert!(!fs.exists(&root.join("snap-000000")));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_acquire_release_refcounts() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);
        let snapshot = store.create().unwrap();

        assert_eq!(store.state(snapshot.id), Some(SnapshotState::Ready));

        let handle = store.acquire(snapshot.id).unwrap();
        assert_eq!(store.state(snapshot.id), Some(SnapshotState::InUse));

        drop(handle);
        assert_eq!(store.state(snapshot.id), Some(SnapshotState::Ready));
    }

    #[test]
    fn test_two_handles_interleaved_release() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);
        let snapshot = store.create().unwrap();

        let h1 = store.acquire(snapshot.id).unwrap();
        let h2 = store.acquire(snapshot.id).unwrap();

        drop(h1);
        assert_eq!(store.state(snapshot.id), Some(SnapshotState::InUse));
        drop(h2);
        assert_eq!(store.state(snapshot.id), Some(SnapshotState::Ready));
    }

    #[test]
    fn test_delete_fails_while_in_use() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);
        let snapshot = store.create().unwrap();

        let handle = store.acquire(snapshot.id).unwrap();
        let err = store.delete(snapshot.id).unwrap_err();
        assert_eq!(err.code(), SnapshotErrorCode::InUse);
        assert!(fs.exists(&snapshot.marker_path()), "directory untouched");

        drop(handle);
        store.delete(snapshot.id).unwrap();
        assert!(!fs.exists(&snapshot.path));
    }

    #[test]
    fn test_delete_removes_directory() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);
        let snapshot = store.create().unwrap();

        store.delete(snapshot.id).unwrap();

        assert!(!fs.exists(&snapshot.path));
        assert!(store.get(snapshot.id).is_none());
    }

    #[test]
    fn test_single_flight_create() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);

        // Hold the latch by hand to simulate an in-flight create
        store.inner.lock().unwrap().creating = true;
        let err = store.create().unwrap_err();
        assert_eq!(err.code(), SnapshotErrorCode::BusyCreating);

        store.inner.lock().unwrap().creating = false;
        assert!(store.create().is_ok());
    }

    #[test]
    fn test_load_sweeps_markerless_directory() {
        let (fs, live_image, root) = setup();
        // snap-000003 with image and metadata but no marker: interrupted
        // create (or equally an interrupted delete)
        let stale = root.join("snap-000003");
        fs.write_bytes(&stale.join(IMAGE_FILE), b"partial");
        fs.write_bytes(&stale.join(METADATA_FILE), b"{}");

        let store = open_store(&fs, &live_image, &root);

        assert!(!fs.exists(&stale));
        assert_eq!(store.len(), 0);
        // The interrupted slot is reused: the next create gets id 3
        assert_eq!(store.create().unwrap().id, 3);
    }

    #[test]
    fn test_load_rebuilds_corrupt_metadata() {
        let (fs, live_image, root) = setup();
        {
            let store = open_store(&fs, &live_image, &root);
            let snapshot = store.create().unwrap();
            fs.write_bytes(&snapshot.metadata_path(), b"{corrupt");
        }

        let store = open_store(&fs, &live_image, &root);

        assert_eq!(store.len(), 1);
        let snapshot = store.get(0).unwrap();
        let text = fs.read_bytes(&snapshot.metadata_path()).unwrap();
        assert!(SnapshotMetadata::from_json(std::str::from_utf8(&text).unwrap()).is_ok());
    }

    #[test]
    fn test_reload_preserves_facts_and_zeroes_refcount() {
        let (fs, live_image, root) = setup();
        let (id, path, created_at) = {
            let store = open_store(&fs, &live_image, &root);
            let snapshot = store.create().unwrap();
            let _handle = store.acquire(snapshot.id).unwrap();
            (snapshot.id, snapshot.path.clone(), snapshot.created_at)
        };

        let store = open_store(&fs, &live_image, &root);
        let snapshot = store.get(id).unwrap();

        assert_eq!(snapshot.path, path);
        assert_eq!(snapshot.created_at.timestamp(), created_at.timestamp());
        assert_eq!(store.state(id), Some(SnapshotState::Ready));
    }

    #[test]
    fn test_delete_oldest_deletable_skips_held() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);
        let first = store.create().unwrap();
        let second = store.create().unwrap();

        let _handle = store.acquire(first.id).unwrap();

        // Only refcount-zero snapshots are candidates, so `second` goes
        assert!(store.delete_oldest_deletable());
        assert!(store.get(second.id).is_none());
        assert!(store.get(first.id).is_some());

        assert!(!store.delete_oldest_deletable());
    }

    #[test]
    fn test_session_creates_and_acquires() {
        let (fs, live_image, root) = setup();
        let store = open_store(&fs, &live_image, &root);

        let handle = store.session().unwrap();
        let id = handle.snapshot().id;
        assert_eq!(store.state(id), Some(SnapshotState::InUse));

        drop(handle);
        assert_eq!(store.state(id), Some(SnapshotState::Ready));
        store.delete(id).unwrap();
    }
}
