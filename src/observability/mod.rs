//! Observability for dashvault
//!
//! Per OBSERVABILITY.md, this module provides structured JSON logging:
//! - One log line = one event
//! - Deterministic key ordering
//! - Explicit severity levels
//! - Synchronous, no buffering, no background threads
//!
//! Logging failure must never affect the archive pipeline; write errors
//! are swallowed.

mod logger;

pub use logger::{Logger, Severity};
