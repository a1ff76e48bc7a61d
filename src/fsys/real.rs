//! Real filesystem implementation over std::fs and libc

use std::fs;
use std::path::Path;

use super::{FileStat, FsError, FsResult, Filesystem, VfsStats, WalkEntry};

/// Filesystem implementation using actual system calls
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFilesystem;

impl RealFilesystem {
    /// Create a new real filesystem adapter
    pub fn new() -> Self {
        RealFilesystem
    }

    fn walk_into(&self, dir: &Path, out: &mut Vec<WalkEntry>) -> FsResult<()> {
        let mut subdirs = Vec::new();
        let mut files = Vec::new();

        let entries = fs::read_dir(dir).map_err(|e| FsError::from_io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::from_io(dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().map_err(|e| FsError::from_io(dir, e))?;
            if file_type.is_dir() {
                subdirs.push(name);
            } else {
                files.push(name);
            }
        }

        subdirs.sort();
        files.sort();

        out.push(WalkEntry {
            dir: dir.to_path_buf(),
            subdirs: subdirs.clone(),
            files,
        });

        for name in subdirs {
            self.walk_into(&dir.join(name), out)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn raw_statvfs(path: &Path) -> std::io::Result<libc::statvfs> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stats)
}

#[cfg(target_os = "linux")]
fn reflink_clone(src: &Path, dst: &Path) -> FsResult<()> {
    use std::os::unix::io::AsRawFd;

    let src_file = fs::File::open(src).map_err(|e| FsError::from_io(src, e))?;
    let dst_file = fs::File::create(dst).map_err(|e| FsError::from_io(dst, e))?;

    let rc = unsafe { libc::ioctl(dst_file.as_raw_fd(), libc::FICLONE, src_file.as_raw_fd()) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    // Leave no zero-length destination behind.
    drop(dst_file);
    let _ = fs::remove_file(dst);

    match err.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) | Some(libc::EXDEV) | Some(libc::EINVAL) => {
            Err(FsError::ReflinkUnsupported(format!(
                "{} -> {}: {}",
                src.display(),
                dst.display(),
                err
            )))
        }
        _ => Err(FsError::from_io(dst, err)),
    }
}

#[cfg(not(target_os = "linux"))]
fn reflink_clone(src: &Path, dst: &Path) -> FsResult<()> {
    Err(FsError::ReflinkUnsupported(format!(
        "{} -> {}: reflink ioctl only available on Linux",
        src.display(),
        dst.display()
    )))
}

impl Filesystem for RealFilesystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn stat(&self, path: &Path) -> FsResult<FileStat> {
        let meta = fs::metadata(path).map_err(|e| FsError::from_io(path, e))?;
        Ok(FileStat {
            size: meta.len(),
            modified: meta.modified().map_err(|e| FsError::from_io(path, e))?,
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
        })
    }

    #[cfg(unix)]
    fn statvfs(&self, path: &Path) -> FsResult<VfsStats> {
        // XFS lazy superblock counters (sb_lazysbcount) aggregate per-CPU
        // free block counts on demand. After unlink() the cached aggregate
        // is stale; the first statvfs() triggers aggregation and the second
        // reads the accurate result.
        raw_statvfs(path).map_err(|e| FsError::from_io(path, e))?;
        let stats = raw_statvfs(path).map_err(|e| FsError::from_io(path, e))?;
        Ok(VfsStats {
            block_size: stats.f_frsize as u64,
            total_blocks: stats.f_blocks as u64,
            free_blocks: stats.f_bfree as u64,
            available_blocks: stats.f_bavail as u64,
        })
    }

    #[cfg(not(unix))]
    fn statvfs(&self, path: &Path) -> FsResult<VfsStats> {
        Err(FsError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }

    fn list_dir(&self, path: &Path) -> FsResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(path).map_err(|e| FsError::from_io(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn walk(&self, path: &Path) -> FsResult<Vec<WalkEntry>> {
        let mut out = Vec::new();
        self.walk_into(path, &mut out)?;
        Ok(out)
    }

    fn create_dir_all(&self, path: &Path) -> FsResult<()> {
        fs::create_dir_all(path).map_err(|e| FsError::from_io(path, e))
    }

    fn remove_file(&self, path: &Path) -> FsResult<()> {
        fs::remove_file(path).map_err(|e| FsError::from_io(path, e))
    }

    fn remove_dir(&self, path: &Path) -> FsResult<()> {
        fs::remove_dir(path).map_err(|e| FsError::from_io(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> FsResult<()> {
        fs::remove_dir_all(path).map_err(|e| FsError::from_io(path, e))
    }

    fn rename(&self, src: &Path, dst: &Path) -> FsResult<()> {
        fs::rename(src, dst).map_err(|e| FsError::from_io(src, e))
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        std::os::unix::fs::symlink(target, link).map_err(|e| FsError::from_io(link, e))
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, link: &Path) -> FsResult<()> {
        Err(FsError::Io {
            path: link.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }

    fn read_to_string(&self, path: &Path) -> FsResult<String> {
        fs::read_to_string(path).map_err(|e| FsError::from_io(path, e))
    }

    fn write_string(&self, path: &Path, contents: &str) -> FsResult<()> {
        fs::write(path, contents).map_err(|e| FsError::from_io(path, e))
    }

    fn reflink_copy(&self, src: &Path, dst: &Path) -> FsResult<()> {
        reflink_clone(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stat_and_exists() {
        let temp_dir = TempDir::new().unwrap();
        let fs = RealFilesystem::new();
        let file = temp_dir.path().join("clip.mp4");

        assert!(!fs.exists(&file));
        fs.write_string(&file, "footage").unwrap();

        assert!(fs.exists(&file));
        assert!(fs.is_file(&file));
        let stat = fs.stat(&file).unwrap();
        assert_eq!(stat.size, 7);
        assert!(stat.is_file);
        assert!(!stat.is_dir);
    }

    #[test]
    fn test_stat_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let fs = RealFilesystem::new();

        let err = fs.stat(&temp_dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[test]
    fn test_list_dir_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let fs = RealFilesystem::new();

        fs.write_string(&temp_dir.path().join("b.mp4"), "").unwrap();
        fs.write_string(&temp_dir.path().join("a.mp4"), "").unwrap();

        let names = fs.list_dir(temp_dir.path()).unwrap();
        assert_eq!(names, vec!["a.mp4", "b.mp4"]);
    }

    #[test]
    fn test_walk_is_top_down() {
        let temp_dir = TempDir::new().unwrap();
        let fs = RealFilesystem::new();
        let event = temp_dir.path().join("SavedClips").join("2024-01-01_12-00-00");

        fs.create_dir_all(&event).unwrap();
        fs.write_string(&event.join("front.mp4"), "f").unwrap();

        let entries = fs.walk(temp_dir.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].dir, temp_dir.path());
        assert_eq!(entries[0].subdirs, vec!["SavedClips"]);
        assert_eq!(entries[2].files, vec!["front.mp4"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_reports_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let fs = RealFilesystem::new();

        let stats = fs.statvfs(temp_dir.path()).unwrap();
        assert!(stats.total_bytes() > 0);
        assert!(stats.available_bytes() <= stats.total_bytes());
    }
}
