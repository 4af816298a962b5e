//! # Rendering Pipeline
//!
//! Applies the function pipeline a manifest declares to the package's
//! bundle: each function receives the current contents in envelope form and
//! produces the input of the next one. The pipeline aborts on the first
//! failure; per-function outcomes are accumulated into a
//! [`RenderStatus`] the engine stores alongside the draft.
//!
//! Function failures (non-zero exit, diagnostics on stderr) are data: the
//! draft keeps its contents and the status carries the error. Transport
//! failures reaching the evaluator service are also folded into the status
//! by the engine, which never loses a draft to a rendering problem.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bundle::{self, Bundle};
use crate::core::{FunctionOutcome, RenderStatus};
use crate::error::{Error, Result};
use crate::manifest::Manifest;

//================================================================================================
// Types
//================================================================================================

/// The outcome of one function evaluation.
#[derive(Debug, Clone)]
pub struct Evaluated {
    /// The transformed envelope; meaningful only when `exit_code` is zero.
    pub resource_list: Vec<u8>,
    /// The function's stderr.
    pub log: Vec<u8>,
    /// The function's exit code.
    pub exit_code: i32,
    /// Structured diagnostics reported by the function.
    pub message: String,
}

/// Applies a package's declared pipeline to its bundle.
pub struct Renderer {
    evaluator: Arc<dyn FunctionEvaluator>,
}

/// An evaluator reached over the function-runtime wire protocol.
pub struct RemoteEvaluator {
    endpoint: String,
    client: Mutex<Option<fnrun::proto::EvaluatorClient>>,
}

//================================================================================================
// Traits
//================================================================================================

/// Evaluates one transformation function over an envelope.
///
/// The shipped implementation is [`RemoteEvaluator`]; tests substitute
/// scripted ones.
#[async_trait]
pub trait FunctionEvaluator: Send + Sync {
    /// Runs `image` over `resource_list`, returning the transformed
    /// envelope or the function's failure.
    ///
    /// Transport and startup failures are `Err`; a function that ran and
    /// rejected its input is `Ok` with a non-zero `exit_code`.
    async fn evaluate(
        &self,
        image: &str,
        resource_list: Vec<u8>,
        config: Option<Vec<u8>>,
    ) -> Result<Evaluated>;
}

//================================================================================================
// Impls
//================================================================================================

impl Renderer {
    /// A renderer backed by the given evaluator.
    pub fn new(evaluator: Arc<dyn FunctionEvaluator>) -> Self {
        Renderer { evaluator }
    }

    /// Feeds `bundle` through its manifest's pipeline.
    ///
    /// Returns the (possibly transformed) bundle and the per-function
    /// outcomes. A bundle without a manifest or without a pipeline renders
    /// trivially. On a function failure the input bundle is returned
    /// unchanged alongside the failing status.
    pub async fn render(&self, bundle: &Bundle) -> Result<(Bundle, RenderStatus)> {
        let Some(manifest_bytes) = bundle.manifest_bytes() else {
            return Ok((bundle.clone(), RenderStatus::success()));
        };
        let manifest = Manifest::parse(manifest_bytes)?;
        let Some(pipeline) = manifest.pipeline()? else {
            return Ok((bundle.clone(), RenderStatus::success()));
        };
        if pipeline.functions.is_empty() {
            return Ok((bundle.clone(), RenderStatus::success()));
        }

        let mut current = bundle.clone();
        let mut status = RenderStatus {
            ok: true,
            results: Vec::new(),
        };

        for function in pipeline.functions {
            let config_bytes = match &function.config {
                Some(value) => Some(
                    serde_yaml_ng::to_string(value)
                        .map_err(|e| Error::invalid(format!("function config: {e}")))?
                        .into_bytes(),
                ),
                None => None,
            };
            let envelope = bundle::to_envelope(&current, function.config.as_ref())?;

            let evaluated = self
                .evaluator
                .evaluate(&function.image, envelope, config_bytes)
                .await?;

            if evaluated.exit_code != 0 {
                tracing::info!(
                    image = %function.image,
                    exit_code = evaluated.exit_code,
                    "pipeline function failed"
                );
                status.ok = false;
                status.results.push(FunctionOutcome {
                    image: function.image,
                    exit_code: evaluated.exit_code,
                    message: failure_message(&evaluated),
                });
                // abort the pipeline; the input bundle stands
                return Ok((bundle.clone(), status));
            }

            let output = bundle::from_envelope(&evaluated.resource_list)?;
            current = merge_output(&current, output);
            status.results.push(FunctionOutcome {
                image: function.image,
                exit_code: 0,
                message: String::new(),
            });
        }

        Ok((current, status))
    }
}

impl RemoteEvaluator {
    /// An evaluator talking to the runner service at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        RemoteEvaluator {
            endpoint: endpoint.into(),
            client: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FunctionEvaluator for RemoteEvaluator {
    async fn evaluate(
        &self,
        image: &str,
        resource_list: Vec<u8>,
        config: Option<Vec<u8>>,
    ) -> Result<Evaluated> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let client = fnrun::proto::EvaluatorClient::connect(self.endpoint.clone())
                .await
                .map_err(|e| {
                    Error::unavailable(format!(
                        "function runner at `{}` unreachable: {e}",
                        self.endpoint
                    ))
                })?;
            *guard = Some(client);
        }
        let client = guard.as_mut().expect("client just connected");

        let response = client
            .evaluate(fnrun::proto::EvaluateRequest {
                image: image.to_string(),
                resource_list,
                config: config.unwrap_or_default(),
            })
            .await;

        let response = match response {
            Ok(response) => response.into_inner(),
            Err(status) => {
                // a broken channel should not poison later renders
                *guard = None;
                return Err(map_status(status));
            },
        };

        let exit_code = response
            .results
            .iter()
            .map(|r| r.exit_code)
            .find(|c| *c != 0)
            .unwrap_or(0);
        let message = response
            .results
            .iter()
            .filter(|r| !r.message.is_empty())
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        Ok(Evaluated {
            resource_list: response.resource_list,
            log: response.log,
            exit_code,
            message,
        })
    }
}

//================================================================================================
// Functions
//================================================================================================

/// Combines a function's structured output with the files that never
/// entered the envelope. The manifest cannot be deleted by a function.
fn merge_output(input: &Bundle, output: Bundle) -> Bundle {
    let mut merged = Bundle::new();
    for (path, contents) in input.iter() {
        if !bundle::is_structured(path) {
            // opaque files pass through untouched
            merged.insert(path, contents).ok();
        }
    }
    let manifest = input.manifest_bytes().map(<[u8]>::to_vec);
    for (path, contents) in output.iter() {
        merged.insert(path, contents).ok();
    }
    if merged.manifest_bytes().is_none() {
        if let Some(manifest) = manifest {
            merged.insert(crate::MANIFEST_FILE.as_str(), manifest).ok();
        }
    }
    merged
}

fn failure_message(evaluated: &Evaluated) -> String {
    if !evaluated.message.is_empty() {
        evaluated.message.clone()
    } else {
        String::from_utf8_lossy(&evaluated.log).trim().to_string()
    }
}

fn map_status(status: tonic::Status) -> Error {
    match status.code() {
        tonic::Code::Unavailable => Error::unavailable(status.message()),
        tonic::Code::DeadlineExceeded => {
            Error::DeadlineExceeded(std::time::Duration::from_secs(0))
        },
        tonic::Code::Cancelled => Error::Canceled,
        tonic::Code::InvalidArgument => Error::invalid(status.message()),
        _ => Error::internal(status.message()),
    }
}

//================================================================================================
// Tests
//================================================================================================
