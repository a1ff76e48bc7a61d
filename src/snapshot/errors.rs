//! Snapshot error types following the ERRORS.md conventions
//!
//! Error codes:
//! - DASH_SNAPSHOT_NOT_FOUND (WARN severity)
//! - DASH_SNAPSHOT_IN_USE (WARN severity)
//! - DASH_SNAPSHOT_BUSY_CREATING (WARN severity)
//! - DASH_SNAPSHOT_REFLINK (ERROR severity)
//! - DASH_SNAPSHOT_CREATE_FAILED (ERROR severity)
//! - DASH_SNAPSHOT_IO (ERROR severity)

use std::fmt;

use crate::fsys::FsError;

/// Severity levels for snapshot errors as defined in ERRORS.md
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Expected contention or benign miss; callers back off or ignore
    Warn,
    /// Operation fails, the daemon continues
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Snapshot-specific error codes as defined in ERRORS.md
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotErrorCode {
    /// No snapshot registered under the requested id
    NotFound,
    /// Snapshot has live handles and cannot be deleted
    InUse,
    /// A create is already in flight (single-flight latch)
    BusyCreating,
    /// The backing volume refused a reflink clone
    Reflink,
    /// Snapshot creation aborted; partial directory removed
    CreateFailed,
    /// I/O failure in the snapshot directory
    Io,
}

impl SnapshotErrorCode {
    /// Returns the stable string code as defined in ERRORS.md
    pub fn code(&self) -> &'static str {
        match self {
            SnapshotErrorCode::NotFound => "DASH_SNAPSHOT_NOT_FOUND",
            SnapshotErrorCode::InUse => "DASH_SNAPSHOT_IN_USE",
            SnapshotErrorCode::BusyCreating => "DASH_SNAPSHOT_BUSY_CREATING",
            SnapshotErrorCode::Reflink => "DASH_SNAPSHOT_REFLINK",
            SnapshotErrorCode::CreateFailed => "DASH_SNAPSHOT_CREATE_FAILED",
            SnapshotErrorCode::Io => "DASH_SNAPSHOT_IO",
        }
    }

    /// Returns the severity level for this code
    pub fn severity(&self) -> Severity {
        match self {
            SnapshotErrorCode::NotFound
            | SnapshotErrorCode::InUse
            | SnapshotErrorCode::BusyCreating => Severity::Warn,
            SnapshotErrorCode::Reflink
            | SnapshotErrorCode::CreateFailed
            | SnapshotErrorCode::Io => Severity::Error,
        }
    }
}

impl fmt::Display for SnapshotErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Snapshot error with code, message, and optional filesystem source
#[derive(Debug)]
pub struct SnapshotError {
    code: SnapshotErrorCode,
    message: String,
    source: Option<FsError>,
}

impl SnapshotError {
    /// Snapshot id not registered
    pub fn not_found(id: u64) -> Self {
        Self {
            code: SnapshotErrorCode::NotFound,
            message: format!("snapshot {} not found", id),
            source: None,
        }
    }

    /// Snapshot has `refcount` live handles
    pub fn in_use(id: u64, refcount: u32) -> Self {
        Self {
            code: SnapshotErrorCode::InUse,
            message: format!("snapshot {} has {} active handles", id, refcount),
            source: None,
        }
    }

    /// A create is already running
    pub fn busy_creating() -> Self {
        Self {
            code: SnapshotErrorCode::BusyCreating,
            message: "snapshot creation already in progress".to_string(),
            source: None,
        }
    }

    /// Reflink clone rejected by the backing volume
    pub fn reflink(source: FsError) -> Self {
        Self {
            code: SnapshotErrorCode::Reflink,
            message: "backing volume cannot reflink the live image".to_string(),
            source: Some(source),
        }
    }

    /// Creation aborted before the completion marker was written
    pub fn create_failed(message: impl Into<String>) -> Self {
        Self {
            code: SnapshotErrorCode::CreateFailed,
            message: message.into(),
            source: None,
        }
    }

    /// Creation aborted with a filesystem source
    pub fn create_failed_io(message: impl Into<String>, source: FsError) -> Self {
        Self {
            code: SnapshotErrorCode::CreateFailed,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Generic snapshot-directory I/O failure
    pub fn io(message: impl Into<String>, source: FsError) -> Self {
        Self {
            code: SnapshotErrorCode::Io,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Returns the error code
    pub fn code(&self) -> SnapshotErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref source) = self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;
