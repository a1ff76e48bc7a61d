//! Disk-image mounting
//!
//! Mounts disk images through loop devices with partition scanning, and
//! runs filesystem repair before the read-write delete window. Every
//! external command runs with a hard timeout; a wedged mount must not
//! wedge the daemon.
//!
//! The `ImageMounter` trait is the seam the coordinator uses; tests mount
//! "images" by handing back fixed directories.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::observability::Logger;

/// Mount operation error
#[derive(Debug, Error)]
pub enum MountError {
    /// A mount-related command exited non-zero
    #[error("{command} failed: {detail}")]
    CommandFailed {
        /// Command name
        command: String,
        /// Last line of its stderr
        detail: String,
    },

    /// A mount-related command exceeded its timeout
    #[error("{0} timed out")]
    Timeout(String),

    /// The partition device never appeared after losetup
    #[error("partition device {0} not found")]
    PartitionMissing(PathBuf),

    /// Spawn or pipe failure
    #[error("mount I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mount operations
pub type MountResult<T> = Result<T, MountError>;

/// Whether to mount read-only or read-write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Read-only (snapshot archiving)
    ReadOnly,
    /// Read-write (live-image delete window)
    ReadWrite,
}

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const FSCK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct CommandOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

fn run_command(program: &str, args: &[&str], timeout: Duration) -> MountResult<CommandOutput> {
    Logger::trace(
        "MOUNT_COMMAND",
        &[("command", program), ("args", &args.join(" "))],
    );

    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_reader = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stdout_pipe.read_to_string(&mut buf);
        buf
    });
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr_pipe.read_to_string(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    let code = loop {
        match child.try_wait()? {
            Some(status) => break status.code().unwrap_or(-1),
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(MountError::Timeout(program.to_string()));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    for line in stderr.lines() {
        Logger::trace("MOUNT_COMMAND_STDERR", &[("command", program), ("line", line)]);
    }

    Ok(CommandOutput {
        code,
        stdout,
        stderr,
    })
}

fn command_failed(command: &str, output: &CommandOutput) -> MountError {
    MountError::CommandFailed {
        command: command.to_string(),
        detail: output
            .stderr
            .lines()
            .last()
            .unwrap_or("no output")
            .to_string(),
    }
}

/// A mounted image; unmounts and detaches its loop device on drop
pub struct MountedImage {
    path: PathBuf,
    cleanup: Option<Cleanup>,
}

struct Cleanup {
    mode: MountMode,
    loop_dev: String,
    // Held for its Drop: removes the mount-point directory
    _mount_dir: tempfile::TempDir,
}

impl MountedImage {
    /// A "mount" that is just an existing directory; nothing to clean up.
    /// Used by test mounters.
    pub fn preexisting(path: PathBuf) -> Self {
        MountedImage {
            path,
            cleanup: None,
        }
    }

    /// The mounted filesystem root
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmount explicitly, surfacing failures (Drop only logs them)
    pub fn unmount(mut self) -> MountResult<()> {
        self.detach()
    }

    fn detach(&mut self) -> MountResult<()> {
        let Some(cleanup) = self.cleanup.take() else {
            return Ok(());
        };

        // Flush the FAT before yanking a read-write mount
        if cleanup.mode == MountMode::ReadWrite {
            let _ = run_command("sync", &[], COMMAND_TIMEOUT);
        }

        let mount_point = self.path.display().to_string();
        let umount = run_command("umount", &[&mount_point], COMMAND_TIMEOUT)?;
        if umount.code != 0 {
            return Err(command_failed("umount", &umount));
        }

        let detach = run_command("losetup", &["-d", &cleanup.loop_dev], COMMAND_TIMEOUT)?;
        if detach.code != 0 {
            return Err(command_failed("losetup", &detach));
        }
        Ok(())
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            Logger::warn(
                "MOUNT_CLEANUP_FAILED",
                &[("path", &self.path.display().to_string()), ("error", &e.to_string())],
            );
        }
    }
}

/// Mounts disk images for the coordinator
pub trait ImageMounter: Send + Sync {
    /// Mount the first partition of `image`
    fn mount(&self, image: &Path, mode: MountMode) -> MountResult<MountedImage>;

    /// Repair the image's filesystem (run before a read-write mount; the
    /// car likely lost mid-write state when the gadget went away)
    fn repair(&self, image: &Path) -> MountResult<()>;
}

/// Production mounter using losetup/mount/fsck.vfat
#[derive(Debug, Default)]
pub struct LoopMounter;

impl LoopMounter {
    /// New loop-device mounter
    pub fn new() -> Self {
        LoopMounter
    }

    fn attach_loop(&self, image: &Path) -> MountResult<String> {
        let image_str = image.display().to_string();
        let output = run_command("losetup", &["-Pf", "--show", &image_str], COMMAND_TIMEOUT)?;
        if output.code != 0 {
            return Err(command_failed("losetup", &output));
        }
        Ok(output.stdout.trim().to_string())
    }

    fn wait_for_partition(&self, loop_dev: &str) -> MountResult<PathBuf> {
        let partition = PathBuf::from(format!("{}p1", loop_dev));
        for _ in 0..10 {
            if partition.exists() {
                return Ok(partition);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(MountError::PartitionMissing(partition))
    }

    fn detach_loop(&self, loop_dev: &str) {
        if let Ok(output) = run_command("losetup", &["-d", loop_dev], COMMAND_TIMEOUT) {
            if output.code != 0 {
                Logger::warn("LOSETUP_DETACH_FAILED", &[("loop_dev", loop_dev)]);
            }
        }
    }
}

impl ImageMounter for LoopMounter {
    fn mount(&self, image: &Path, mode: MountMode) -> MountResult<MountedImage> {
        let loop_dev = self.attach_loop(image)?;

        let partition = match self.wait_for_partition(&loop_dev) {
            Ok(partition) => partition,
            Err(e) => {
                self.detach_loop(&loop_dev);
                return Err(e);
            }
        };

        let mount_dir = match tempfile::Builder::new().prefix("dashvault-mount-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                self.detach_loop(&loop_dev);
                return Err(MountError::Io(e));
            }
        };

        let opts = match mode {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        };
        let partition_str = partition.display().to_string();
        let dir_str = mount_dir.path().display().to_string();
        let output = run_command("mount", &["-o", opts, &partition_str, &dir_str], COMMAND_TIMEOUT)?;
        if output.code != 0 {
            self.detach_loop(&loop_dev);
            return Err(command_failed("mount", &output));
        }

        Logger::info(
            "IMAGE_MOUNTED",
            &[
                ("image", &image.display().to_string()),
                ("mount", &dir_str),
                ("mode", opts),
            ],
        );

        Ok(MountedImage {
            path: mount_dir.path().to_path_buf(),
            cleanup: Some(Cleanup {
                mode,
                loop_dev,
                _mount_dir: mount_dir,
            }),
        })
    }

    fn repair(&self, image: &Path) -> MountResult<()> {
        let loop_dev = self.attach_loop(image)?;
        let result = (|| {
            let partition = self.wait_for_partition(&loop_dev)?;
            let partition_str = partition.display().to_string();
            let output = run_command("fsck.vfat", &["-a", &partition_str], FSCK_TIMEOUT)?;
            // 0 = clean, 1 = errors corrected
            if output.code > 1 {
                return Err(command_failed("fsck.vfat", &output));
            }
            Logger::info(
                "IMAGE_REPAIRED",
                &[("image", &image.display().to_string()), ("fsck_code", &output.code.to_string())],
            );
            Ok(())
        })();
        self.detach_loop(&loop_dev);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_captures_output() {
        let output = run_command("echo", &["hello"], Duration::from_secs(5)).unwrap();
        assert_eq!(output.code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_command_nonzero_exit() {
        let output = run_command("false", &[], Duration::from_secs(5)).unwrap();
        assert_ne!(output.code, 0);
    }

    #[test]
    fn test_run_command_timeout_kills() {
        let err = run_command("sleep", &["30"], Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, MountError::Timeout(_)));
    }

    #[test]
    fn test_preexisting_mount_has_no_cleanup() {
        let mounted = MountedImage::preexisting(PathBuf::from("/mnt/fake"));
        assert_eq!(mounted.path(), Path::new("/mnt/fake"));
        mounted.unmount().unwrap();
    }
}
