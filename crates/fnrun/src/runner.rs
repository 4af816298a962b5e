//! # Evaluator Service
//!
//! Front door of the function runtime: selects an execution mode per
//! request, consults the evaluation cache for digest-pinned images, and
//! serves the whole thing over the evaluator wire protocol together with
//! the standard health service.
//!
//! Mode selection is policy, not capability detection at request time: the
//! bundled path wins when it is enabled and ships a binary for the image,
//! the pod path takes everything else, and a request neither enabled mode
//! can serve is rejected as unsupported.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{pinned_digest, EvalCache};
use crate::error::{Error, Result};
use crate::exec::BundledExecutor;
use crate::pod::{PodPool, ProcessSandbox, Sandbox};
use crate::proto::function_evaluator_server::{FunctionEvaluator, FunctionEvaluatorServer};
use crate::proto::{EvaluateRequest, EvaluateResponse, FunctionResult};

//================================================================================================
// Types
//================================================================================================

/// The execution runtimes the service may route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fork-exec of a bundled binary.
    Bundled,
    /// A sandboxed wrapper reached over the wire protocol.
    Pod,
}

/// Configuration of a [`FunctionRunner`].
pub struct RunnerOptions {
    /// Enabled execution modes, in preference order.
    pub modes: Vec<Mode>,
    /// Directory of prebuilt function binaries.
    pub functions_dir: PathBuf,
    /// The wrapper binary launched for pod sandboxes.
    pub wrapper_bin: PathBuf,
    /// Evaluation-cache capacity, in entries.
    pub cache_capacity: usize,
    /// Registry prefix applied to bare function names.
    pub image_prefix: String,
}

/// The evaluator service.
pub struct FunctionRunner {
    modes: Vec<Mode>,
    bundled: Option<BundledExecutor>,
    pool: Option<PodPool>,
    cache: EvalCache,
    image_prefix: String,
    executions: AtomicU64,
}

/// The wire-facing wrapper around a shared runner.
#[derive(Clone)]
pub struct RunnerService(pub Arc<FunctionRunner>);

//================================================================================================
// Impls
//================================================================================================

impl FunctionRunner {
    /// Builds a runner from its options, wiring the enabled executors.
    pub fn new(options: RunnerOptions) -> Self {
        let bundled = options
            .modes
            .contains(&Mode::Bundled)
            .then(|| BundledExecutor::new(options.functions_dir.clone()));
        let pool = options.modes.contains(&Mode::Pod).then(|| {
            let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(
                options.wrapper_bin.clone(),
                options.functions_dir.clone(),
            ));
            PodPool::new(sandbox)
        });
        FunctionRunner {
            modes: options.modes,
            bundled,
            pool,
            cache: EvalCache::new(options.cache_capacity),
            image_prefix: options.image_prefix,
            executions: AtomicU64::new(0),
        }
    }

    /// Replaces the pod pool, for launchers other than local processes.
    pub fn with_pool(mut self, pool: PodPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// How many evaluations actually executed (cache misses).
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// How many evaluations the cache answered.
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    /// Evaluates one request, caching pinned-digest successes.
    pub async fn evaluate_raw(&self, mut request: EvaluateRequest) -> Result<EvaluateResponse> {
        request.image = self.qualify(&request.image);

        let cache_key = pinned_digest(&request.image).map(|_| {
            EvalCache::key(&request.image, &request.resource_list, &request.config)
        });
        if let Some(key) = &cache_key {
            if let Some(response) = self.cache.get(key) {
                tracing::debug!(image = %request.image, "evaluation served from cache");
                return Ok(response);
            }
        }

        let response = self.execute(&request).await?;
        self.executions.fetch_add(1, Ordering::Relaxed);

        if let Some(key) = cache_key {
            if response.results.iter().all(|r| r.exit_code == 0) {
                self.cache.put(key, response.clone());
            }
        }
        Ok(response)
    }

    async fn execute(&self, request: &EvaluateRequest) -> Result<EvaluateResponse> {
        for mode in &self.modes {
            match mode {
                Mode::Bundled => {
                    let Some(bundled) = &self.bundled else { continue };
                    if !bundled.supports(&request.image) {
                        continue;
                    }
                    let run = bundled
                        .evaluate(&request.image, &request.resource_list)
                        .await?;
                    let results = if run.exit_code != 0 {
                        vec![FunctionResult {
                            message: String::from_utf8_lossy(&run.stderr).trim().to_string(),
                            exit_code: run.exit_code,
                        }]
                    } else {
                        Vec::new()
                    };
                    return Ok(EvaluateResponse {
                        resource_list: if run.exit_code == 0 { run.stdout } else { Vec::new() },
                        log: run.stderr,
                        results,
                    });
                },
                Mode::Pod => {
                    let Some(pool) = &self.pool else { continue };
                    let mut client = pool.checkout(&request.image).await?;
                    let response = client
                        .evaluate(request.clone())
                        .await
                        .map_err(|status| Error::Transport(status.to_string()))?;
                    return Ok(response.into_inner());
                },
            }
        }
        Err(Error::Unsupported(request.image.clone()))
    }

    /// Resolves bare function names against the configured registry
    /// prefix.
    fn qualify(&self, image: &str) -> String {
        if self.image_prefix.is_empty() || image.contains('/') {
            return image.to_string();
        }
        format!("{}/{image}", self.image_prefix.trim_end_matches('/'))
    }
}

#[tonic::async_trait]
impl FunctionEvaluator for RunnerService {
    async fn evaluate(
        &self,
        request: tonic::Request<EvaluateRequest>,
    ) -> std::result::Result<tonic::Response<EvaluateResponse>, tonic::Status> {
        let request = request.into_inner();
        tracing::debug!(image = %request.image, bytes = request.resource_list.len(), "evaluate");
        self.0
            .evaluate_raw(request)
            .await
            .map(tonic::Response::new)
            .map_err(Error::into_status)
    }
}

//================================================================================================
// Functions
//================================================================================================

/// Serves the evaluator and health services until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    runner: Arc<FunctionRunner>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FunctionEvaluatorServer<RunnerService>>()
        .await;

    tracing::info!(%addr, "function runner listening");
    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(FunctionEvaluatorServer::new(RunnerService(runner)))
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(|e| Error::Transport(format!("serve failed: {e}")))
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_function(dir: &std::path::Path, name: &str, script: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(script.as_bytes()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    fn runner_over(dir: &std::path::Path) -> FunctionRunner {
        FunctionRunner::new(RunnerOptions {
            modes: vec![Mode::Bundled],
            functions_dir: dir.to_path_buf(),
            wrapper_bin: "wrapper-server".into(),
            cache_capacity: 16,
            image_prefix: String::new(),
        })
    }

    #[tokio::test]
    async fn pinned_evaluations_hit_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_function(dir.path(), "identity", "#!/bin/sh\ncat\n");
        let runner = runner_over(dir.path());

        let request = EvaluateRequest {
            image: "example.com/identity@sha256:abcd".to_string(),
            resource_list: b"kind: ResourceList\n".to_vec(),
            config: Vec::new(),
        };

        let first = runner.evaluate_raw(request.clone()).await.unwrap();
        let second = runner.evaluate_raw(request).await.unwrap();

        // identical bytes, and the runtime only executed once
        assert_eq!(first, second);
        assert_eq!(runner.executions(), 1);
        assert_eq!(runner.cache_hits(), 1);
    }

    #[tokio::test]
    async fn mutable_tags_bypass_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_function(dir.path(), "identity", "#!/bin/sh\ncat\n");
        let runner = runner_over(dir.path());

        let request = EvaluateRequest {
            image: "example.com/identity:v1".to_string(),
            resource_list: b"kind: ResourceList\n".to_vec(),
            config: Vec::new(),
        };

        runner.evaluate_raw(request.clone()).await.unwrap();
        runner.evaluate_raw(request).await.unwrap();
        assert_eq!(runner.executions(), 2);
        assert_eq!(runner.cache_hits(), 0);
    }

    #[tokio::test]
    async fn function_failure_is_data_not_error() {
        let dir = tempfile::tempdir().unwrap();
        write_function(
            dir.path(),
            "reject",
            "#!/bin/sh\necho 'bad input' >&2\nexit 2\n",
        );
        let runner = runner_over(dir.path());

        let response = runner
            .evaluate_raw(EvaluateRequest {
                image: "example.com/reject@sha256:ffff".to_string(),
                resource_list: b"{}".to_vec(),
                config: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].exit_code, 2);
        assert!(response.results[0].message.contains("bad input"));

        // failures are never cached
        assert!(runner.cache.is_empty());
    }

    #[tokio::test]
    async fn unsupported_images_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_over(dir.path());
        assert!(matches!(
            runner
                .evaluate_raw(EvaluateRequest {
                    image: "example.com/absent:v1".to_string(),
                    resource_list: Vec::new(),
                    config: Vec::new(),
                })
                .await,
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn bare_names_gain_the_prefix() {
        let runner = FunctionRunner::new(RunnerOptions {
            modes: vec![Mode::Bundled],
            functions_dir: "/nonexistent".into(),
            wrapper_bin: "wrapper-server".into(),
            cache_capacity: 1,
            image_prefix: "gcr.io/fns/".to_string(),
        });
        assert_eq!(runner.qualify("set-labels:v1"), "gcr.io/fns/set-labels:v1");
        assert_eq!(
            runner.qualify("example.com/fns/set-labels:v1"),
            "example.com/fns/set-labels:v1"
        );
    }
}
