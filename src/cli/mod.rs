//! CLI module
//!
//! Provides the command-line surface:
//! - run: start the archive daemon loop
//! - status: one-shot JSON status report
//! - space: backing-volume space report

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{run, run_command, space, status};
pub use errors::{CliError, CliResult};
