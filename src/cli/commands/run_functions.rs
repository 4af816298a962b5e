//! The `run-functions` subcommand: the evaluator service.

use std::net::SocketAddr;
use std::sync::Arc;

use config::ExecutionMode;
use fnrun::runner::{self, FunctionRunner, Mode, RunnerOptions};

/// Arguments of the `run-functions` subcommand.
#[derive(clap::Parser)]
pub(crate) struct Args {
    /// The address to serve the evaluator on.
    #[arg(long, default_value = "0.0.0.0:9445")]
    listen: SocketAddr,
}

/// Hosts the evaluator service until the process is interrupted.
pub(crate) async fn run(args: Args) -> anyhow::Result<()> {
    let config = &config::CONFIG;

    let modes = config
        .runner
        .modes
        .iter()
        .map(|m| match m {
            ExecutionMode::Bundled => Mode::Bundled,
            ExecutionMode::Pod => Mode::Pod,
        })
        .collect();

    let runner = Arc::new(FunctionRunner::new(RunnerOptions {
        modes,
        functions_dir: config.runner.functions_dir.clone(),
        wrapper_bin: config.runner.wrapper_bin.clone(),
        cache_capacity: config.runner.cache_capacity,
        image_prefix: config.runner.image_prefix.clone(),
    }));

    runner::serve(args.listen, runner, std::future::pending()).await?;
    Ok(())
}
