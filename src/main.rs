//! The main entry point for the orchard daemon.

#![warn(missing_docs)]

use std::process::ExitCode;

use clap::Parser;
use orchard::cli::{self, Args};

//================================================================================================
// Functions
//================================================================================================

/// Parses the command line, installs logging, and runs the selected
/// subcommand until it finishes or the process is interrupted.
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = cli::init_global_subscriber(args.log);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received; shutting down");
            ExitCode::SUCCESS
        }
        outcome = cli::run(args) => match outcome {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                orchard::fatal!(e);
                ExitCode::FAILURE
            }
        }
    }
}
