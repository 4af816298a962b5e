//! The wrapper server that fronts a single transformation function inside
//! a sandbox.
//!
//! It listens on `--port` (default 9446), serving the evaluator wire
//! protocol plus the standard health service. Each `Evaluate` request
//! executes the configured entrypoint (everything after `--`) with the
//! request's resource list on stdin; stdout becomes the transformed
//! envelope and stderr the log. A non-zero exit is reported as a function
//! result, not a transport error.

use std::process::Stdio;

use clap::Parser;
use fnrun::proto::function_evaluator_server::{FunctionEvaluator, FunctionEvaluatorServer};
use fnrun::proto::{EvaluateRequest, EvaluateResponse, FunctionResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Parser)]
#[command(about = "Serves one transformation function over the evaluator protocol")]
struct Args {
    /// The port to listen on.
    #[arg(long, default_value_t = 9446)]
    port: u16,

    /// The function entrypoint and its arguments.
    #[arg(last = true, required = true)]
    entrypoint: Vec<String>,
}

struct SingleFunctionEvaluator {
    entrypoint: Vec<String>,
}

#[tonic::async_trait]
impl FunctionEvaluator for SingleFunctionEvaluator {
    async fn evaluate(
        &self,
        request: tonic::Request<EvaluateRequest>,
    ) -> Result<tonic::Response<EvaluateResponse>, tonic::Status> {
        let request = request.into_inner();

        let mut child = Command::new(&self.entrypoint[0])
            .args(&self.entrypoint[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tonic::Status::internal(format!(
                    "failed to execute function {:?}: {e}",
                    request.image
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| tonic::Status::internal("function has no stdin"))?;
        let input = request.resource_list.clone();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await.ok();
            drop(stdin);
        });

        let output = child.wait_with_output().await.map_err(|e| {
            tonic::Status::internal(format!("waiting for function {:?}: {e}", request.image))
        })?;
        writer.await.ok();

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::info!(
            image = %request.image,
            stdout = output.stdout.len(),
            exit_code,
            "evaluated function"
        );

        let results = if exit_code != 0 {
            vec![FunctionResult {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code,
            }]
        } else {
            Vec::new()
        };

        Ok(tonic::Response::new(EvaluateResponse {
            resource_list: if exit_code == 0 {
                output.stdout
            } else {
                Vec::new()
            },
            log: output.stderr,
            results,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let addr = format!("0.0.0.0:{}", args.port).parse()?;

    let evaluator = SingleFunctionEvaluator {
        entrypoint: args.entrypoint,
    };

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FunctionEvaluatorServer<SingleFunctionEvaluator>>()
        .await;

    tracing::info!(%addr, "wrapper server listening");
    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(FunctionEvaluatorServer::new(evaluator))
        .serve(addr)
        .await?;
    Ok(())
}
