//! The command-line surface of the orchard daemon.

mod commands;
pub mod logging;

use clap::Parser;
pub use commands::run;
pub use logging::init_global_subscriber;

/// The top-level arguments of the daemon.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log verbosity flags shared by every subcommand.
    #[command(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    command: commands::Commands,
}

/// Controls how much the daemon logs.
#[derive(Parser, Clone, Copy, Debug)]
#[command(next_help_heading = "Log Options")]
pub struct LogArgs {
    /// Raise the log level: -v for debug, -vv for trace.
    ///
    /// The daemon logs at info without it. Fine-grained `RUST_LOG`
    /// directives still apply on top of whichever base level the flags
    /// pick, so individual targets can be tuned either way.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    /// Lower the log level: -q for warnings only, -qq for errors only.
    ///
    /// Meant for cron jobs and scripted invocations where routine output
    /// is noise. Quieting beats `--verbosity` when both are given.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
}
