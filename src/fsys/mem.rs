//! In-memory filesystem for tests
//!
//! Simulates a volume with settable capacity and a reflink-support switch,
//! so snapshot and coordinator logic can be exercised without loop devices
//! or a reflink-capable host filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{FileStat, FsError, FsResult, Filesystem, VfsStats, WalkEntry};

#[derive(Debug, Clone)]
struct MemFile {
    content: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<PathBuf, MemFile>,
    dirs: BTreeMap<PathBuf, SystemTime>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    total_bytes: u64,
    reflink_supported: bool,
}

/// In-memory `Filesystem` implementation
pub struct MemFilesystem {
    state: Mutex<State>,
}

const DEFAULT_TOTAL: u64 = 100 * 1024 * 1024 * 1024;
const BLOCK_SIZE: u64 = 4096;

impl Default for MemFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFilesystem {
    /// Create an empty filesystem with a 100 GiB volume
    pub fn new() -> Self {
        let mut state = State {
            total_bytes: DEFAULT_TOTAL,
            reflink_supported: true,
            ..State::default()
        };
        state.dirs.insert(PathBuf::from("/"), SystemTime::now());
        MemFilesystem {
            state: Mutex::new(state),
        }
    }

    /// Set the simulated volume capacity
    pub fn set_total_space(&self, total_bytes: u64) {
        self.state.lock().unwrap().total_bytes = total_bytes;
    }

    /// Toggle reflink support (false makes `reflink_copy` fail)
    pub fn set_reflink_supported(&self, supported: bool) {
        self.state.lock().unwrap().reflink_supported = supported;
    }

    /// Write raw bytes, creating parents implicitly (test convenience)
    pub fn write_bytes(&self, path: &Path, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        Self::mkdirs(&mut state, path.parent().unwrap_or(Path::new("/")));
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                content: content.to_vec(),
                modified: SystemTime::now(),
            },
        );
    }

    /// Write a file of `size` zero bytes (test convenience)
    pub fn write_sized(&self, path: &Path, size: usize) {
        self.write_bytes(path, &vec![0u8; size]);
    }

    /// Read raw bytes (test convenience)
    pub fn read_bytes(&self, path: &Path) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|f| f.content.clone())
    }

    fn mkdirs(state: &mut State, path: &Path) {
        let mut current = PathBuf::from("/");
        state.dirs.entry(current.clone()).or_insert_with(SystemTime::now);
        for component in path.components().skip(1) {
            current.push(component);
            state.dirs.entry(current.clone()).or_insert_with(SystemTime::now);
        }
    }

    fn used_bytes(state: &State) -> u64 {
        state.files.values().map(|f| f.content.len() as u64).sum()
    }

    fn children_of(state: &State, path: &Path) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let all = state
            .files
            .keys()
            .chain(state.dirs.keys())
            .chain(state.symlinks.keys());
        for p in all {
            if p.parent() == Some(path) && p != path {
                if let Some(name) = p.file_name() {
                    names.push(name.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn walk_into(state: &State, dir: &Path, out: &mut Vec<WalkEntry>) {
        let mut subdirs = Vec::new();
        let mut files = Vec::new();
        for name in Self::children_of(state, dir) {
            let child = dir.join(&name);
            if state.dirs.contains_key(&child) {
                subdirs.push(name);
            } else {
                files.push(name);
            }
        }
        out.push(WalkEntry {
            dir: dir.to_path_buf(),
            subdirs: subdirs.clone(),
            files,
        });
        for name in subdirs {
            Self::walk_into(state, &dir.join(name), out);
        }
    }

    fn is_under(path: &Path, root: &Path) -> bool {
        path == root || path.starts_with(root)
    }
}

impl Filesystem for MemFilesystem {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path)
            || state.dirs.contains_key(path)
            || state.symlinks.contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.state.lock().unwrap().dirs.contains_key(path)
    }

    fn stat(&self, path: &Path) -> FsResult<FileStat> {
        let state = self.state.lock().unwrap();
        if let Some(file) = state.files.get(path) {
            return Ok(FileStat {
                size: file.content.len() as u64,
                modified: file.modified,
                is_dir: false,
                is_file: true,
            });
        }
        if let Some(modified) = state.dirs.get(path) {
            return Ok(FileStat {
                size: 0,
                modified: *modified,
                is_dir: true,
                is_file: false,
            });
        }
        Err(FsError::NotFound(path.to_path_buf()))
    }

    fn statvfs(&self, path: &Path) -> FsResult<VfsStats> {
        let state = self.state.lock().unwrap();
        if !state.dirs.contains_key(path) && !state.files.contains_key(path) {
            return Err(FsError::NotFound(path.to_path_buf()));
        }
        let used = Self::used_bytes(&state);
        let free = state.total_bytes.saturating_sub(used);
        Ok(VfsStats {
            block_size: BLOCK_SIZE,
            total_blocks: state.total_bytes / BLOCK_SIZE,
            free_blocks: free / BLOCK_SIZE,
            available_blocks: free / BLOCK_SIZE,
        })
    }

    fn list_dir(&self, path: &Path) -> FsResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        if !state.dirs.contains_key(path) {
            return Err(FsError::NotFound(path.to_path_buf()));
        }
        Ok(Self::children_of(&state, path))
    }

    fn walk(&self, path: &Path) -> FsResult<Vec<WalkEntry>> {
        let state = self.state.lock().unwrap();
        if !state.dirs.contains_key(path) {
            return Err(FsError::NotFound(path.to_path_buf()));
        }
        let mut out = Vec::new();
        Self::walk_into(&state, path, &mut out);
        Ok(out)
    }

    fn create_dir_all(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(path) {
            return Err(FsError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            });
        }
        Self::mkdirs(&mut state, path);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.symlinks.remove(path).is_some() {
            return Ok(());
        }
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))
    }

    fn remove_dir(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirs.contains_key(path) {
            return Err(FsError::NotFound(path.to_path_buf()));
        }
        if !Self::children_of(&state, path).is_empty() {
            return Err(FsError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "directory not empty"),
            });
        }
        state.dirs.remove(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirs.contains_key(path) {
            return Err(FsError::NotFound(path.to_path_buf()));
        }
        state.files.retain(|p, _| !Self::is_under(p, path));
        state.symlinks.retain(|p, _| !Self::is_under(p, path));
        state.dirs.retain(|p, _| !Self::is_under(p, path));
        Ok(())
    }

    fn rename(&self, src: &Path, dst: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.files.remove(src) {
            state.files.insert(dst.to_path_buf(), file);
            return Ok(());
        }
        if state.dirs.contains_key(src) {
            let moved_files: Vec<(PathBuf, MemFile)> = state
                .files
                .iter()
                .filter(|(p, _)| Self::is_under(p, src))
                .map(|(p, f)| (p.clone(), f.clone()))
                .collect();
            let moved_dirs: Vec<(PathBuf, SystemTime)> = state
                .dirs
                .iter()
                .filter(|(p, _)| Self::is_under(p, src))
                .map(|(p, t)| (p.clone(), *t))
                .collect();
            state.files.retain(|p, _| !Self::is_under(p, src));
            state.dirs.retain(|p, _| !Self::is_under(p, src));
            for (p, f) in moved_files {
                let rel = p.strip_prefix(src).expect("path under src");
                state.files.insert(dst.join(rel), f);
            }
            for (p, t) in moved_dirs {
                let rel = p.strip_prefix(src).expect("path under src");
                state.dirs.insert(dst.join(rel), t);
            }
            return Ok(());
        }
        Err(FsError::NotFound(src.to_path_buf()))
    }

    fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.symlinks.insert(link.to_path_buf(), target.to_path_buf());
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> FsResult<String> {
        let state = self.state.lock().unwrap();
        let file = state
            .files
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;
        String::from_utf8(file.content.clone()).map_err(|_| FsError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidData),
        })
    }

    fn write_string(&self, path: &Path, contents: &str) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let parent = path.parent().unwrap_or(Path::new("/"));
        if !state.dirs.contains_key(parent) {
            return Err(FsError::NotFound(parent.to_path_buf()));
        }
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                content: contents.as_bytes().to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn reflink_copy(&self, src: &Path, dst: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.reflink_supported {
            return Err(FsError::ReflinkUnsupported(format!(
                "{} -> {}: volume does not share extents",
                src.display(),
                dst.display()
            )));
        }
        let file = state
            .files
            .get(src)
            .cloned()
            .ok_or_else(|| FsError::NotFound(src.to_path_buf()))?;
        let parent = dst.parent().unwrap_or(Path::new("/"));
        if !state.dirs.contains_key(parent) {
            return Err(FsError::NotFound(parent.to_path_buf()));
        }
        state.files.insert(dst.to_path_buf(), file);
        Ok(())
    }
}
