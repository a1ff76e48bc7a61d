//! Idle detection
//!
//! Watches the USB mass-storage kernel helper's cumulative write-byte
//! counter to decide when the car has stopped writing, so snapshots are
//! not taken mid-recording.
//!
//! Per COORDINATOR.md §3, a three-state machine over 1-second samples:
//!
//! - UNDETERMINED: no baseline yet, or quiet since baseline
//! - WRITING: a delta above the threshold was seen
//! - IDLE: quiet confirmed
//!
//! UNDETERMINED and IDLE share identical transition logic: accumulate
//! quiet samples toward the confirmation threshold, or enter WRITING on a
//! large delta. In particular UNDETERMINED reaches IDLE directly; a car
//! that never writes confirms idle in QUIET_CONFIRM_SAMPLES seconds
//! instead of burning the whole timeout.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::coordinator::ShutdownFlag;
use crate::observability::Logger;

/// Bytes per second above which the car counts as actively writing
pub const WRITE_THRESHOLD: u64 = 500_000;

/// Consecutive quiet samples required to confirm idle
pub const QUIET_CONFIRM_SAMPLES: u32 = 5;

/// Default bound on the idle wait
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// State of idle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// No baseline yet, or quiet since baseline
    Undetermined,
    /// Writes above threshold seen recently
    Writing,
    /// Confirmed quiet
    Idle,
}

/// Diagnostic snapshot of the detector
#[derive(Debug, Clone, Copy)]
pub struct IdleStatus {
    /// Current state
    pub state: IdleState,
    /// Last absolute counter value observed
    pub bytes_written: u64,
    /// Bytes accumulated in the current write burst
    pub burst_size: u64,
    /// Quiet samples counted toward confirmation
    pub quiet_samples: u32,
}

/// One reading of the write counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSample {
    /// The monitored process does not exist (nothing can be writing)
    NoProcess,
    /// The process exists but its counter could not be read this tick
    Unavailable,
    /// Cumulative write_bytes value
    Bytes(u64),
}

/// Source of write-counter samples; the seam for tests
pub trait WriteCounterSource: Send {
    /// Take one reading
    fn sample(&mut self) -> WriteSample;
}

/// Reads write_bytes from /proc/<pid>/io for a process found by comm name
pub struct ProcWriteCounter {
    proc_path: PathBuf,
    process_name: String,
    write_bytes_re: Regex,
}

impl ProcWriteCounter {
    /// Monitor `process_name` (e.g. `file-storage`) under `/proc`
    pub fn new(process_name: impl Into<String>) -> Self {
        Self::with_proc_path(PathBuf::from("/proc"), process_name)
    }

    /// Monitor under an alternate proc root
    pub fn with_proc_path(proc_path: PathBuf, process_name: impl Into<String>) -> Self {
        ProcWriteCounter {
            proc_path,
            process_name: process_name.into(),
            write_bytes_re: Regex::new(r"write_bytes:\s*(\d+)").expect("static regex"),
        }
    }

    fn find_pid(&self) -> Option<u32> {
        let entries = std::fs::read_dir(&self.proc_path).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let comm_path = entry.path().join("comm");
            if let Ok(comm) = std::fs::read_to_string(&comm_path) {
                if comm.trim() == self.process_name {
                    return Some(pid);
                }
            }
        }
        None
    }
}

impl WriteCounterSource for ProcWriteCounter {
    fn sample(&mut self) -> WriteSample {
        let Some(pid) = self.find_pid() else {
            return WriteSample::NoProcess;
        };
        let io_path = self.proc_path.join(pid.to_string()).join("io");
        let Ok(content) = std::fs::read_to_string(&io_path) else {
            return WriteSample::Unavailable;
        };
        match self
            .write_bytes_re
            .captures(&content)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        {
            Some(bytes) => WriteSample::Bytes(bytes),
            None => WriteSample::Unavailable,
        }
    }
}

/// Waits for the car to stop writing
pub struct IdleDetector {
    source: Box<dyn WriteCounterSource>,
    shutdown: ShutdownFlag,
    sample_period: Duration,
    state: IdleState,
    prev_written: Option<u64>,
    burst_size: u64,
    quiet_samples: u32,
}

impl IdleDetector {
    /// Detector sampling `source` once per second
    pub fn new(source: Box<dyn WriteCounterSource>, shutdown: ShutdownFlag) -> Self {
        Self::with_sample_period(source, shutdown, Duration::from_secs(1))
    }

    /// Detector with an explicit sampling period (tests shorten this)
    pub fn with_sample_period(
        source: Box<dyn WriteCounterSource>,
        shutdown: ShutdownFlag,
        sample_period: Duration,
    ) -> Self {
        IdleDetector {
            source,
            shutdown,
            sample_period,
            state: IdleState::Undetermined,
            prev_written: None,
            burst_size: 0,
            quiet_samples: 0,
        }
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> IdleStatus {
        IdleStatus {
            state: self.state,
            bytes_written: self.prev_written.unwrap_or(0),
            burst_size: self.burst_size,
            quiet_samples: self.quiet_samples,
        }
    }

    /// Wait up to `timeout` for the car to become idle.
    ///
    /// Returns true when idle was confirmed (or the monitored process is
    /// gone). Returns false on timeout or shutdown; timeout is a soft
    /// failure and the caller proceeds anyway.
    pub fn wait_for_idle(&mut self, timeout: Duration) -> bool {
        self.state = IdleState::Undetermined;
        self.prev_written = None;
        self.burst_size = 0;
        self.quiet_samples = 0;

        Logger::info(
            "IDLE_WAIT_STARTED",
            &[("timeout_secs", &timeout.as_secs().to_string())],
        );

        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.shutdown.sleep(self.sample_period) {
                Logger::info("IDLE_WAIT_ABORTED", &[]);
                return false;
            }

            let written = match self.source.sample() {
                WriteSample::NoProcess => {
                    Logger::info("IDLE_NO_WRITER_PROCESS", &[]);
                    self.state = IdleState::Idle;
                    return true;
                }
                WriteSample::Unavailable => continue,
                WriteSample::Bytes(bytes) => bytes,
            };

            let Some(prev) = self.prev_written.replace(written) else {
                // First reading is the baseline
                continue;
            };
            let delta = written.saturating_sub(prev);

            if self.state == IdleState::Writing {
                if delta < WRITE_THRESHOLD {
                    Logger::info(
                        "IDLE_BURST_ENDED",
                        &[("burst_bytes", &self.burst_size.to_string())],
                    );
                    self.state = IdleState::Idle;
                    self.burst_size = 0;
                    self.quiet_samples = 0;
                } else {
                    self.burst_size += delta;
                }
            } else if delta > WRITE_THRESHOLD {
                Logger::info("IDLE_WRITE_IN_PROGRESS", &[]);
                self.state = IdleState::Writing;
                self.burst_size = delta;
                self.quiet_samples = 0;
            } else {
                self.quiet_samples += 1;
                if self.quiet_samples >= QUIET_CONFIRM_SAMPLES {
                    Logger::info(
                        "IDLE_CONFIRMED",
                        &[("quiet_samples", &self.quiet_samples.to_string())],
                    );
                    self.state = IdleState::Idle;
                    return true;
                }
            }
        }

        Logger::warn("IDLE_WAIT_TIMEOUT", &[]);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Script {
        samples: VecDeque<WriteSample>,
    }

    impl Script {
        fn counters(values: &[u64]) -> Box<Script> {
            Box::new(Script {
                samples: values.iter().map(|v| WriteSample::Bytes(*v)).collect(),
            })
        }
    }

    impl WriteCounterSource for Script {
        fn sample(&mut self) -> WriteSample {
            self.samples.pop_front().unwrap_or(WriteSample::NoProcess)
        }
    }

    fn detector(source: Box<dyn WriteCounterSource>) -> IdleDetector {
        IdleDetector::with_sample_period(source, ShutdownFlag::new(), Duration::from_millis(1))
    }

    #[test]
    fn test_no_process_is_idle_immediately() {
        let mut detector = detector(Box::new(Script {
            samples: VecDeque::new(),
        }));

        assert!(detector.wait_for_idle(Duration::from_secs(1)));
        assert_eq!(detector.status().state, IdleState::Idle);
    }

    #[test]
    fn test_quiet_car_confirms_without_visiting_writing() {
        // Baseline + five quiet samples; UNDETERMINED goes straight to
        // IDLE through the confirmation path
        let mut detector = detector(Script::counters(&[100, 100, 100, 100, 100, 100]));

        assert!(detector.wait_for_idle(Duration::from_secs(5)));
        assert_eq!(detector.status().state, IdleState::Idle);
        assert_eq!(detector.status().quiet_samples, QUIET_CONFIRM_SAMPLES);
    }

    #[test]
    fn test_burst_then_quiet_confirms() {
        // Baseline, two big deltas (WRITING), then quiet until confirmed
        let mut detector = detector(Script::counters(&[
            0, 1_000_000, 2_000_000, 2_000_100, 2_000_200, 2_000_300, 2_000_400, 2_000_500,
            2_000_600,
        ]));

        assert!(detector.wait_for_idle(Duration::from_secs(5)));
        assert_eq!(detector.status().state, IdleState::Idle);
    }

    #[test]
    fn test_continuous_writing_times_out() {
        let counters: Vec<u64> = (0..200).map(|i| i * 10_000_000).collect();
        let mut detector = detector(Script::counters(&counters));

        assert!(!detector.wait_for_idle(Duration::from_millis(50)));
        assert_eq!(detector.status().state, IdleState::Writing);
    }

    #[test]
    fn test_unavailable_samples_are_skipped() {
        let mut samples: VecDeque<WriteSample> = VecDeque::new();
        samples.push_back(WriteSample::Bytes(100));
        samples.push_back(WriteSample::Unavailable);
        for _ in 0..QUIET_CONFIRM_SAMPLES {
            samples.push_back(WriteSample::Bytes(100));
        }
        let mut detector = detector(Box::new(Script { samples }));

        assert!(detector.wait_for_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_aborts_wait() {
        let shutdown = ShutdownFlag::new();
        shutdown.request_stop();
        let mut detector = IdleDetector::with_sample_period(
            Script::counters(&[0, 0, 0]),
            shutdown,
            Duration::from_millis(1),
        );

        assert!(!detector.wait_for_idle(Duration::from_secs(5)));
    }
}
