//! CLI argument definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// dashvault command line
#[derive(Debug, Parser)]
#[command(name = "dashvault", version, about = "Crash-safe dashcam footage archiver")]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse process arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the archive daemon until SIGINT/SIGTERM
    Run {
        /// Setup-variables file; environment variables are used when absent
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print a JSON status report (space, snapshots, reachability)
    Status {
        /// Setup-variables file; environment variables are used when absent
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the backing-volume space report and computed image size
    Space {
        /// Setup-variables file; environment variables are used when absent
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
