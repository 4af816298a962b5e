//! # Pod Executor
//!
//! The isolation path: each image gets a sandboxed wrapper process serving
//! the evaluator wire protocol, and evaluations are routed to it over a
//! persistent channel. A single manager task owns the pool map; clients
//! request sandboxes over a command channel rather than sharing locks.
//! Sandboxes idle past their TTL are reaped on a timer tick.
//!
//! Provisioning is behind the [`Sandbox`] seam. The shipped
//! [`ProcessSandbox`] supervises `wrapper-server` child processes on the
//! local host; a cluster-backed launcher implements the same trait and the
//! pool is none the wiser.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::exec::image_binary_name;
use crate::proto::EvaluatorClient;

//================================================================================================
// Constants
//================================================================================================

/// How long an unused sandbox survives before being reaped.
pub const IDLE_TTL: Duration = Duration::from_secs(300);

/// How often the manager sweeps for idle sandboxes.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// How long a launching sandbox may take to start serving.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

//================================================================================================
// Types
//================================================================================================

/// A running sandbox: where to reach it, plus whatever keeps it alive.
pub struct SandboxHandle {
    /// The evaluator endpoint the sandbox serves.
    pub endpoint: String,
    _keepalive: Box<dyn std::any::Any + Send>,
}

/// A handle to the pod pool's manager task.
#[derive(Clone)]
pub struct PodPool {
    tx: mpsc::Sender<PoolCmd>,
}

enum PoolCmd {
    Checkout {
        image: String,
        reply: oneshot::Sender<Result<EvaluatorClient>>,
    },
}

struct PoolEntry {
    client: EvaluatorClient,
    _sandbox: SandboxHandle,
    last_used: Instant,
}

/// Launches `wrapper-server` child processes as sandboxes.
pub struct ProcessSandbox {
    wrapper_bin: PathBuf,
    functions_dir: PathBuf,
}

//================================================================================================
// Traits
//================================================================================================

/// Provisions an isolated wrapper for one function image.
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    /// Starts a wrapper serving the evaluator protocol for `image`.
    async fn launch(&self, image: &str) -> Result<SandboxHandle>;
}

//================================================================================================
// Impls
//================================================================================================

impl SandboxHandle {
    /// Wraps an endpoint together with the value whose drop tears the
    /// sandbox down.
    pub fn new(endpoint: String, keepalive: impl std::any::Any + Send) -> Self {
        SandboxHandle {
            endpoint,
            _keepalive: Box::new(keepalive),
        }
    }
}

impl PodPool {
    /// Starts the pool manager over the given launcher.
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self::with_ttl(sandbox, IDLE_TTL)
    }

    /// Starts the pool manager with an explicit idle TTL.
    pub fn with_ttl(sandbox: Arc<dyn Sandbox>, ttl: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(manage(sandbox, rx, ttl));
        PodPool { tx }
    }

    /// A connected client for `image`, launching its sandbox if none is
    /// warm.
    pub async fn checkout(&self, image: &str) -> Result<EvaluatorClient> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCmd::Checkout {
                image: image.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Internal("pod pool manager is gone".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("pod pool manager dropped the request".to_string()))?
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn launch(&self, image: &str) -> Result<SandboxHandle> {
        let entrypoint = image_binary_name(image)
            .map(|name| self.functions_dir.join(name))
            .filter(|p| p.is_file())
            .ok_or_else(|| Error::Unsupported(image.to_string()))?;

        let port = free_port()?;
        tracing::info!(image, port, "launching function sandbox");

        let child = Command::new(&self.wrapper_bin)
            .arg("--port")
            .arg(port.to_string())
            .arg("--")
            .arg(&entrypoint)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                image: image.to_string(),
                reason: format!("wrapper start failed: {e}"),
            })?;

        Ok(SandboxHandle::new(
            format!("http://127.0.0.1:{port}"),
            child,
        ))
    }
}

impl ProcessSandbox {
    /// A launcher running `wrapper_bin` over the binaries in
    /// `functions_dir`.
    pub fn new(wrapper_bin: PathBuf, functions_dir: PathBuf) -> Self {
        ProcessSandbox {
            wrapper_bin,
            functions_dir,
        }
    }
}

//================================================================================================
// Functions
//================================================================================================

/// The manager task: sole owner of the pool map.
async fn manage(
    sandbox: Arc<dyn Sandbox>,
    mut rx: mpsc::Receiver<PoolCmd>,
    ttl: Duration,
) {
    let mut pool: HashMap<String, PoolEntry> = HashMap::new();
    let mut reap = tokio::time::interval(REAP_INTERVAL.min(ttl));
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    PoolCmd::Checkout { image, reply } => {
                        let result = checkout(&sandbox, &mut pool, &image).await;
                        reply.send(result).ok();
                    }
                }
            }
            _ = reap.tick() => {
                let before = pool.len();
                pool.retain(|image, entry| {
                    let keep = entry.last_used.elapsed() < ttl;
                    if !keep {
                        tracing::info!(image, "reaping idle function sandbox");
                    }
                    keep
                });
                if pool.len() != before {
                    tracing::debug!(active = pool.len(), "sandbox pool swept");
                }
            }
        }
    }
}

async fn checkout(
    sandbox: &Arc<dyn Sandbox>,
    pool: &mut HashMap<String, PoolEntry>,
    image: &str,
) -> Result<EvaluatorClient> {
    if let Some(entry) = pool.get_mut(image) {
        entry.last_used = Instant::now();
        return Ok(entry.client.clone());
    }

    let handle = sandbox.launch(image).await?;
    let client = await_serving(&handle.endpoint).await?;
    pool.insert(
        image.to_string(),
        PoolEntry {
            client: client.clone(),
            _sandbox: handle,
            last_used: Instant::now(),
        },
    );
    Ok(client)
}

/// Polls a freshly launched sandbox until its channel accepts connections.
async fn await_serving(endpoint: &str) -> Result<EvaluatorClient> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        match EvaluatorClient::connect(endpoint.to_string()).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Error::Transport(format!(
                        "sandbox at `{endpoint}` never became ready: {e}"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
}

/// Asks the OS for an unused local port.
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| Error::Internal(format!("no free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("no free port: {e}")))?
        .port();
    Ok(port)
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A launcher that records launches but cannot actually serve; used to
    /// exercise pool bookkeeping without processes.
    struct CountingSandbox {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for CountingSandbox {
        async fn launch(&self, _image: &str) -> Result<SandboxHandle> {
            self.launches.fetch_add(1, Ordering::Relaxed);
            Err(Error::Unsupported("test sandbox never serves".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_launches_are_not_pooled() {
        let sandbox = Arc::new(CountingSandbox {
            launches: AtomicUsize::new(0),
        });
        let pool = PodPool::new(sandbox.clone());

        // both checkouts fail (the test sandbox cannot serve), but each
        // failure reflects exactly one launch attempt
        pool.checkout("img-a").await.unwrap_err();
        pool.checkout("img-a").await.unwrap_err();
        assert_eq!(sandbox.launches.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn free_ports_are_distinct_enough() {
        let a = free_port().unwrap();
        let b = free_port().unwrap();
        assert!(a > 0 && b > 0);
    }
}
