//! The `serve` subcommand: the control plane proper.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use parcel::cache::{RepoCache, DEFAULT_BODY_BUDGET};
use parcel::engine::Engine;
use parcel::render::{RemoteEvaluator, Renderer};
use parcel::storage::Repository;

/// Arguments of the `serve` subcommand.
#[derive(clap::Parser)]
pub(crate) struct Args {
    /// Path to a YAML file declaring the repositories to register.
    #[arg(long, value_name = "FILE")]
    repositories: Option<PathBuf>,

    /// Budget for cached resource bodies, in bytes.
    #[arg(long, default_value_t = DEFAULT_BODY_BUDGET)]
    body_budget: usize,
}

/// Builds the engine, registers the declared repositories, and parks until
/// the process is interrupted.
pub(crate) async fn run(args: Args) -> anyhow::Result<()> {
    let config = &config::CONFIG;

    let cache = RepoCache::new(args.body_budget);
    let evaluator = Arc::new(RemoteEvaluator::new(config.runner.endpoint.clone()));
    let renderer = Arc::new(Renderer::new(evaluator));
    let engine = Engine::new(Arc::clone(&cache), renderer);

    for repository in load_repositories(args.repositories.as_deref())? {
        let key = repository.key.clone();
        if let Err(e) = engine.register_repository(repository).await {
            tracing::error!(repo = %key, error = %e, "could not register repository");
        }
    }

    tracing::info!(
        cache_root = %config.cache.root.display(),
        runner = %config.runner.endpoint,
        "control plane running"
    );

    // repositories poll in the background until the signal handler in
    // main tears the process down
    std::future::pending::<()>().await;
    Ok(())
}

fn load_repositories(path: Option<&std::path::Path>) -> anyhow::Result<Vec<Repository>> {
    let Some(path) = path else {
        tracing::warn!("no --repositories file given; starting with none registered");
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading repositories from {}", path.display()))?;
    let repositories: Vec<Repository> = serde_yaml_ng::from_str(&raw)
        .with_context(|| format!("parsing repositories from {}", path.display()))?;
    tracing::info!(count = repositories.len(), "loaded repository declarations");
    Ok(repositories)
}
