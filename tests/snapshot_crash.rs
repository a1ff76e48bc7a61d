//! Snapshot Crash Safety Tests
//!
//! The completion marker (snap.toc) is the single source of truth for
//! snapshot validity: written last on create, removed first on delete.
//! These tests seed the on-disk states a power cut can leave behind and
//! verify the store self-heals on load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashvault::fsys::{Filesystem, MemFilesystem};
use dashvault::snapshot::{SnapshotErrorCode, SnapshotStore, IMAGE_FILE, METADATA_FILE};

// =============================================================================
// Test Utilities
// =============================================================================

fn setup() -> (Arc<MemFilesystem>, PathBuf, PathBuf) {
    let fs = Arc::new(MemFilesystem::new());
    let live_image = PathBuf::from("/backingfiles/cam_disk.bin");
    let snapshots = PathBuf::from("/backingfiles/snapshots");
    fs.write_bytes(&live_image, b"live image");
    (fs, live_image, snapshots)
}

fn open_store(fs: &Arc<MemFilesystem>, live_image: &Path, root: &Path) -> Arc<SnapshotStore> {
    SnapshotStore::open(
        fs.clone() as Arc<dyn Filesystem>,
        live_image.to_path_buf(),
        root.to_path_buf(),
    )
    .expect("store opens")
}

/// Seed a snapshot directory with image + metadata but NO marker
fn seed_markerless(fs: &MemFilesystem, root: &Path, id: u64) -> PathBuf {
    let dir = root.join(format!("snap-{:06}", id));
    fs.write_bytes(&dir.join(IMAGE_FILE), b"image bytes");
    fs.write_bytes(
        &dir.join(METADATA_FILE),
        format!(
            "{{\"id\":{},\"path\":\"{}\",\"created_at\":\"2024-06-01T08:00:00Z\"}}",
            id,
            dir.display()
        )
        .as_bytes(),
    );
    dir
}

// =============================================================================
// Power cut mid-create
// =============================================================================

/// A directory with image and metadata but no marker is an interrupted
/// create: swept on load, and the interrupted id is handed out again.
#[test]
fn test_power_cut_mid_create_is_swept() {
    let (fs, live_image, root) = setup();
    let stale = seed_markerless(&fs, &root, 3);

    let store = open_store(&fs, &live_image, &root);

    assert!(!fs.exists(&stale), "incomplete snapshot must be removed");
    assert!(store.is_empty());
    assert_eq!(store.create().unwrap().id, 3);
}

// =============================================================================
// Power cut mid-delete
// =============================================================================

/// Deletion removes the marker first, so a crash mid-delete leaves the
/// same markerless shape as a crash mid-create. Same cleanup applies.
#[test]
fn test_power_cut_mid_delete_is_swept() {
    let (fs, live_image, root) = setup();
    let stale = seed_markerless(&fs, &root, 7);

    let store = open_store(&fs, &live_image, &root);

    assert!(!fs.exists(&stale));
    assert!(store.is_empty());
    assert_eq!(store.create().unwrap().id, 7);
}

/// A mix of valid and markerless directories: only the valid one loads,
/// and ids continue past the highest valid id.
#[test]
fn test_mixed_valid_and_garbage_directories() {
    let (fs, live_image, root) = setup();

    {
        let store = open_store(&fs, &live_image, &root);
        store.create().unwrap(); // snap-000000, valid
    }
    let stale = seed_markerless(&fs, &root, 1);

    let store = open_store(&fs, &live_image, &root);

    assert_eq!(store.len(), 1);
    assert!(store.get(0).is_some());
    assert!(!fs.exists(&stale));
    assert_eq!(store.create().unwrap().id, 1);
}

// =============================================================================
// Refcount race
// =============================================================================

/// Two handles; one release does not make the snapshot deletable.
#[test]
fn test_refcount_race_delete_blocked_until_last_release() {
    let (fs, live_image, root) = setup();
    let store = open_store(&fs, &live_image, &root);
    let snapshot = store.create().unwrap();

    let first = store.acquire(snapshot.id).unwrap();
    let second = store.acquire(snapshot.id).unwrap();

    drop(first);

    let err = store.delete(snapshot.id).unwrap_err();
    assert_eq!(err.code(), SnapshotErrorCode::InUse);
    assert!(fs.exists(&snapshot.marker_path()), "directory untouched");

    drop(second);

    store.delete(snapshot.id).unwrap();
    assert!(!fs.exists(&snapshot.path));
}

/// Acquire + release in any interleaving nets out to refcount zero:
/// the snapshot is deletable afterwards.
#[test]
fn test_acquire_release_round_trip_leaves_deletable() {
    let (fs, live_image, root) = setup();
    let store = open_store(&fs, &live_image, &root);
    let snapshot = store.create().unwrap();

    for _ in 0..3 {
        let a = store.acquire(snapshot.id).unwrap();
        let b = store.acquire(snapshot.id).unwrap();
        drop(b);
        drop(a);
    }

    assert_eq!(store.deletable_ids(), vec![snapshot.id]);
    store.delete(snapshot.id).unwrap();
}

// =============================================================================
// Crash-ordering on delete
// =============================================================================

/// After a successful delete nothing remains, including the marker.
#[test]
fn test_delete_leaves_no_residue() {
    let (fs, live_image, root) = setup();
    let store = open_store(&fs, &live_image, &root);
    let snapshot = store.create().unwrap();

    store.delete(snapshot.id).unwrap();

    assert!(!fs.exists(&snapshot.marker_path()));
    assert!(!fs.exists(&snapshot.image_path()));
    assert!(!fs.exists(&snapshot.path));
    assert!(fs.exists(&root), "snapshots root survives");
}

/// Marker presence is what load trusts, not metadata health: corrupt
/// metadata with a valid marker keeps the snapshot and rewrites the
/// record.
#[test]
fn test_marker_outranks_corrupt_metadata() {
    let (fs, live_image, root) = setup();
    let snapshot = {
        let store = open_store(&fs, &live_image, &root);
        store.create().unwrap()
    };
    fs.write_bytes(&snapshot.metadata_path(), b"\x00\x01 not json");

    let store = open_store(&fs, &live_image, &root);

    assert_eq!(store.len(), 1);
    assert!(store.get(snapshot.id).is_some());
    let rewritten = fs.read_bytes(&snapshot.metadata_path()).unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&rewritten).is_ok());
}

/// A file (not a directory) named like a snapshot is ignored, as are
/// directories with unparseable names.
#[test]
fn test_load_ignores_foreign_entries() {
    let (fs, live_image, root) = setup();
    fs.write_bytes(&root.join("snap-garbage"), b"not a dir name that parses");
    fs.write_bytes(&root.join("unrelated.txt"), b"");
    fs.create_dir_all(&root.join("snap-notanumber")).unwrap();

    let store = open_store(&fs, &live_image, &root);

    assert!(store.is_empty());
    assert!(fs.exists(&root.join("unrelated.txt")));
}
