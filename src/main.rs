//! dashvault CLI entry point
//!
//! main.rs only parses arguments and dispatches; subsystems are wired in
//! the cli module.

use std::process;

use dashvault::cli::{run_command, Cli};

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = run_command(cli.command) {
        let error_json = serde_json::json!({
            "status": "error",
            "code": e.code_str(),
            "message": e.message()
        });

        eprintln!("{}", error_json);
        process::exit(1);
    }
}
