//! Archive backends
//!
//! Per ARCHIVE.md §3, a backend is two operations: a reachability probe
//! and a directory copy. Failures are returned in the `CopyOutcome`, not
//! raised; a transient failure for one directory must not affect others.
//!
//! `RcloneBackend` shells out to rclone, which handles the remote
//! protocol for 40+ providers. Configure the remote first with
//! `rclone config`.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::coordinator::ShutdownFlag;
use crate::observability::Logger;

use super::result::CopyOutcome;

/// Abstract archive destination
pub trait ArchiveBackend: Send + Sync {
    /// Whether the destination is currently reachable.
    ///
    /// May block briefly; implementations must consult the shared
    /// shutdown flag so the coordinator can interrupt long probes.
    fn is_reachable(&self) -> bool;

    /// Copy the directory tree at `src` to the remote under `dst_name`
    fn copy_directory(&self, src: &Path, dst_name: &str) -> CopyOutcome;
}

/// Backend used when no archive system is configured (or an unknown one
/// was named): never reachable, so the coordinator idles in its
/// reachability backoff.
#[derive(Debug, Default)]
pub struct NullBackend;

impl ArchiveBackend for NullBackend {
    fn is_reachable(&self) -> bool {
        false
    }

    fn copy_directory(&self, _src: &Path, _dst_name: &str) -> CopyOutcome {
        CopyOutcome::failed("no archive backend configured")
    }
}

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// rclone-based archive backend
pub struct RcloneBackend {
    remote: String,
    path: String,
    flags: Vec<String>,
    copy_timeout: Duration,
    shutdown: ShutdownFlag,
}

impl RcloneBackend {
    /// Create a backend for `remote` (an rclone remote name), archiving
    /// under `path` within it.
    pub fn new(
        remote: impl Into<String>,
        path: impl Into<String>,
        flags: Vec<String>,
        copy_timeout: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        let path: String = path.into();
        RcloneBackend {
            remote: remote.into(),
            path: path.trim_matches('/').to_string(),
            flags,
            copy_timeout,
            shutdown,
        }
    }

    fn dest(&self, subpath: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !self.path.is_empty() {
            parts.push(&self.path);
        }
        if !subpath.is_empty() {
            parts.push(subpath);
        }
        format!("{}:{}", self.remote, parts.join("/"))
    }

    /// Wait for `child` to exit, killing it on timeout or shutdown.
    /// Returns the exit code, or None when it never finished.
    fn wait_child(&self, child: &mut Child, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => {}
                Err(_) => return None,
            }
            if self.shutdown.is_stopped() || Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn parse_stats(stderr: &str) -> (u64, u64) {
        // Final stats block prints both forms:
        //   Transferred:   1.234 MiB / 1.234 MiB, 100%, ...
        //   Transferred:   5 / 5, 100%
        let files_re = Regex::new(r"Transferred:\s*(\d+) / \d+").expect("static regex");
        let bytes_re =
            Regex::new(r"Transferred:\s*([0-9.]+)\s*(B|KiB|MiB|GiB|TiB)").expect("static regex");

        let mut files = 0u64;
        let mut bytes = 0u64;
        for line in stderr.lines() {
            Logger::trace("RCLONE_OUTPUT", &[("line", line)]);
            if let Some(caps) = files_re.captures(line) {
                files = caps[1].parse().unwrap_or(files);
            } else if let Some(caps) = bytes_re.captures(line) {
                let value: f64 = caps[1].parse().unwrap_or(0.0);
                let unit: u64 = match &caps[2] {
                    "B" => 1,
                    "KiB" => 1 << 10,
                    "MiB" => 1 << 20,
                    "GiB" => 1 << 30,
                    _ => 1 << 40,
                };
                bytes = (value * unit as f64) as u64;
            }
        }
        (files, bytes)
    }
}

impl ArchiveBackend for RcloneBackend {
    fn is_reachable(&self) -> bool {
        let spawned = Command::new("rclone")
            .args(["lsf", &format!("{}:", self.remote), "--max-depth", "1"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                Logger::warn("RCLONE_SPAWN_FAILED", &[("error", &e.to_string())]);
                return false;
            }
        };

        matches!(self.wait_child(&mut child, REACHABILITY_TIMEOUT), Some(0))
    }

    fn copy_directory(&self, src: &Path, dst_name: &str) -> CopyOutcome {
        let dest = self.dest(dst_name);
        Logger::info(
            "RCLONE_COPY",
            &[("src", &src.display().to_string()), ("dest", &dest)],
        );

        let spawned = Command::new("rclone")
            .arg("copy")
            .arg(src)
            .arg(&dest)
            .args(["--stats-one-line", "-v"])
            .args(&self.flags)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return CopyOutcome::failed(format!("rclone spawn failed: {}", e)),
        };

        // Drain stderr concurrently so a chatty transfer cannot fill the
        // pipe and stall rclone mid-copy.
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let reader = std::thread::spawn(move || {
            let mut output = String::new();
            let _ = stderr_pipe.read_to_string(&mut output);
            output
        });

        let code = self.wait_child(&mut child, self.copy_timeout);
        let output = reader.join().unwrap_or_default();

        match code {
            Some(0) => {
                let (files, bytes) = Self::parse_stats(&output);
                CopyOutcome {
                    success: true,
                    files_transferred: files,
                    bytes_transferred: bytes,
                    error: None,
                }
            }
            Some(code) => {
                let last_line = output.lines().last().unwrap_or("unknown error");
                CopyOutcome::failed(format!("rclone exited {}: {}", code, last_line))
            }
            None => CopyOutcome::failed("rclone timed out or was interrupted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dest_joins_path_segments() {
        let backend = RcloneBackend::new(
            "gdrive",
            "/TeslaCam/archive/",
            vec![],
            Duration::from_secs(1),
            ShutdownFlag::new(),
        );
        assert_eq!(backend.dest("SavedClips"), "gdrive:TeslaCam/archive/SavedClips");
        assert_eq!(backend.dest(""), "gdrive:TeslaCam/archive");
    }

    #[test]
    fn test_dest_without_base_path() {
        let backend = RcloneBackend::new(
            "s3",
            "",
            vec![],
            Duration::from_secs(1),
            ShutdownFlag::new(),
        );
        assert_eq!(backend.dest("SentryClips"), "s3:SentryClips");
        assert_eq!(backend.dest(""), "s3:");
    }

    #[test]
    fn test_parse_stats_reads_final_counts() {
        let stderr = "\
2024/01/01 INFO : front.mp4: Copied (new)
Transferred:   12.500 MiB / 12.500 MiB, 100%, 1.2 MiB/s
Transferred:   5 / 5, 100%
Elapsed time: 10.0s";
        let (files, bytes) = RcloneBackend::parse_stats(stderr);
        assert_eq!(files, 5);
        assert_eq!(bytes, (12.5 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn test_parse_stats_empty_output() {
        assert_eq!(RcloneBackend::parse_stats(""), (0, 0));
    }

    #[test]
    fn test_null_backend_is_never_reachable() {
        let backend = NullBackend;
        assert!(!backend.is_reachable());
        assert!(!backend.copy_directory(Path::new("/x"), "SavedClips").success);
    }
}
