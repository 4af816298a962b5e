//! # Bundled Executor
//!
//! The fast path: the function image maps to a prebuilt binary shipped in
//! the runtime's own image, and evaluation is a fork-exec with the
//! envelope on stdin and the transformed envelope on stdout. A hard
//! timeout cancels the child process; its stderr is captured as the log.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

//================================================================================================
// Constants
//================================================================================================

/// Default bound on one function evaluation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

//================================================================================================
// Types
//================================================================================================

/// Runs functions whose images correspond to binaries under a local
/// directory.
pub struct BundledExecutor {
    functions_dir: PathBuf,
    timeout: Duration,
}

/// The raw outcome of one process run.
#[derive(Debug, Clone)]
pub struct Execution {
    /// The child's stdout: the transformed envelope on success.
    pub stdout: Vec<u8>,
    /// The child's stderr.
    pub stderr: Vec<u8>,
    /// The child's exit code.
    pub exit_code: i32,
}

//================================================================================================
// Impls
//================================================================================================

impl BundledExecutor {
    /// An executor over the binaries in `functions_dir`.
    pub fn new(functions_dir: PathBuf) -> Self {
        BundledExecutor {
            functions_dir,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the evaluation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a binary for `image` is present.
    pub fn supports(&self, image: &str) -> bool {
        self.binary_for(image).is_some()
    }

    /// The bundled binary an image maps to, if present.
    pub fn binary_for(&self, image: &str) -> Option<PathBuf> {
        let path = self.functions_dir.join(image_binary_name(image)?);
        path.is_file().then_some(path)
    }

    /// Executes the function with `input` on stdin, enforcing the timeout
    /// by killing the child.
    pub async fn evaluate(&self, image: &str, input: &[u8]) -> Result<Execution> {
        let binary = self
            .binary_for(image)
            .ok_or_else(|| Error::Unsupported(image.to_string()))?;

        tracing::debug!(image, binary = %binary.display(), "executing bundled function");

        let mut child = Command::new(&binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::Internal(
            "child process has no stdin".to_string(),
        ))?;
        let input = input.to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await.ok();
            // closing stdin signals end of input
            drop(stdin);
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                image: image.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| Error::Internal(format!("waiting for function failed: {e}")))?;
        writer.await.ok();

        Ok(Execution {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

//================================================================================================
// Functions
//================================================================================================

/// The binary name an image reference maps to: the last path segment with
/// any tag or digest stripped.
pub fn image_binary_name(image: &str) -> Option<String> {
    let image = image.split_once('@').map(|(i, _)| i).unwrap_or(image);
    let name = image.rsplit('/').next()?;
    let name = name.split_once(':').map(|(n, _)| n).unwrap_or(name);
    (!name.is_empty()).then(|| name.to_string())
}

//================================================================================================
// Tests
//================================================================================================
