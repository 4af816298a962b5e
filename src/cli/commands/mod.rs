//! This module defines the subcommands for the orchard daemon.
//!
//! Each subcommand is implemented in its own module and is responsible for
//! handling its own arguments and logic. The `run` function in this module
//! dispatches to the appropriate subcommand based on the parsed arguments.

use clap::Subcommand;

use super::Args;

mod run_functions;
mod serve;

//================================================================================================
// Types
//================================================================================================

/// The subcommands of the orchard daemon.
#[derive(Subcommand)]
pub(super) enum Commands {
    /// Run the package-orchestration control plane.
    ///
    /// Registers the declared repositories, starts their background
    /// refresh tasks, and serves the package-revision engine until
    /// interrupted. Repository declarations are read from the file given
    /// with `--repositories`; the rest of the configuration comes from
    /// `orchard.toml` and `ORCHARD_`-prefixed environment variables.
    Serve(serve::Args),
    /// Run the function evaluator service.
    ///
    /// Hosts the `Evaluate` RPC backed by the configured execution modes
    /// (bundled binaries and sandboxed wrappers) and the evaluation cache.
    /// The control plane's render pipeline is pointed at this endpoint.
    RunFunctions(run_functions::Args),
}

//================================================================================================
// Functions
//================================================================================================

/// The main entry point of the orchard daemon.
pub async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Commands::Serve(args) => serve::run(args).await?,
        Commands::RunFunctions(args) => run_functions::run(args).await?,
    }
    Ok(())
}
