//! Shared shutdown flag
//!
//! One flag, set by SIGINT/SIGTERM handlers or `Coordinator::stop`, and
//! consulted by every blocking sleep in the daemon: the reachability
//! poll, inter-cycle waits, idle sampling, and the backend's network
//! probes. All waits are condvar-timed so a signal interrupts them
//! promptly instead of at the next tick.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::observability::Logger;

/// Cloneable shutdown flag with interruptible sleeps
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownFlag {
    /// A fresh, unset flag
    pub fn new() -> Self {
        ShutdownFlag::default()
    }

    /// Request shutdown, waking every sleeper
    pub fn request_stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().expect("shutdown flag lock") = true;
        cvar.notify_all();
    }

    /// Whether shutdown has been requested
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().expect("shutdown flag lock")
    }

    /// Sleep for `timeout`, or until shutdown is requested.
    ///
    /// Returns true when the full duration elapsed, false when the sleep
    /// was interrupted by shutdown.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = lock.lock().expect("shutdown flag lock");
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, wait) = cvar
                .wait_timeout(stopped, deadline - now)
                .expect("shutdown flag lock");
            stopped = guard;
            if wait.timed_out() && !*stopped {
                return true;
            }
        }
        false
    }

    /// Install SIGINT/SIGTERM handlers that set this flag.
    ///
    /// Installable once per process.
    pub fn install_signal_handlers(&self) -> Result<(), ctrlc::Error> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            Logger::info("SHUTDOWN_SIGNAL", &[]);
            flag.request_stop();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sleep_completes_when_unset() {
        let flag = ShutdownFlag::new();
        assert!(flag.sleep(Duration::from_millis(5)));
        assert!(!flag.is_stopped());
    }

    #[test]
    fn test_sleep_interrupted_by_stop() {
        let flag = ShutdownFlag::new();
        let sleeper = flag.clone();

        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        // Give the sleeper a moment to enter its wait
        thread::sleep(Duration::from_millis(10));
        flag.request_stop();

        assert!(!handle.join().unwrap(), "sleep must report interruption");
        assert!(flag.is_stopped());
    }

    #[test]
    fn test_sleep_after_stop_returns_immediately() {
        let flag = ShutdownFlag::new();
        flag.request_stop();

        let start = Instant::now();
        assert!(!flag.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
