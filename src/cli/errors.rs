//! CLI error type
//!
//! Wraps subsystem errors so `main` can render one error JSON and exit
//! non-zero. Per ERRORS.md, only these startup errors terminate the
//! process.

use thiserror::Error;

use crate::config::ConfigError;
use crate::fsys::FsError;
use crate::snapshot::SnapshotError;

/// Top-level CLI error
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration failed to load or parse
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Snapshot store failed to open
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Filesystem failure during startup
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Signal handler installation failed
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Report encoding failed
    #[error("encoding report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CliError {
    /// Stable error code for the exit JSON
    pub fn code_str(&self) -> &'static str {
        match self {
            CliError::Config(_) => "DASH_CONFIG_INVALID",
            CliError::Snapshot(e) => e.code().code(),
            CliError::Fs(_) => "DASH_FS_IO",
            CliError::Signal(_) => "DASH_SIGNAL_HANDLER",
            CliError::Encode(_) => "DASH_ENCODE_FAILED",
        }
    }

    /// Human-readable message for the exit JSON
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
