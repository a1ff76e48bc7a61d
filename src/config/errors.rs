//! Configuration error types
//!
//! Configuration errors are the only errors that terminate the process
//! (non-zero exit from the CLI); everything downstream of startup is
//! recovered in the coordinator loop.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The named config file does not exist
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    /// A size string could not be parsed
    #[error("invalid size string: {0}")]
    InvalidSize(String),

    /// A key holds an unparseable value
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key
        key: String,
        /// Offending value
        value: String,
    },

    /// I/O failure while reading configuration
    #[error("config I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
