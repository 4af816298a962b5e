//! Process-wide configuration for the orchard control plane.
//!
//! Settings are resolved once, at first use, by layering three sources in
//! increasing priority: the compiled-in defaults, the user's
//! `orchard.toml`, and `ORCHARD_`-prefixed environment variables. The
//! resolved [`Config`] is exposed through the [`CONFIG`] static so every
//! component reads the same view.

use std::path::PathBuf;
use std::sync::LazyLock;

use etcetera::BaseStrategy;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// The compiled-in defaults, kept as TOML so they double as documentation.
const BUILTIN_DEFAULTS: &str = include_str!("./orchard.default.toml");

//================================================================================================
// Statics
//================================================================================================

/// The process-wide configuration, resolved on first access.
///
/// A broken configuration file is reported and the compiled-in defaults
/// take over; the daemon does not refuse to start over a typo in an
/// override.
pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    Config::load().unwrap_or_else(|e| {
        tracing::error!(error = %e, "configuration could not be resolved; using built-in defaults");
        Config::default()
    })
});

//================================================================================================
// Types
//================================================================================================

/// Where scratch state lives.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Directory holding backend mirrors and scratch blobs. Nothing under
    /// it is authoritative; deleting it only costs re-fetching.
    pub root: PathBuf,
}

/// Settings governing registered repositories.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepoConfig {
    /// Seconds between background refreshes of a repository, unless the
    /// repository registration overrides it.
    pub poll_interval: u64,
}

/// Settings for the function evaluation runtime.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// Endpoint of the evaluator service the render pipeline talks to.
    pub endpoint: String,
    /// The execution modes the evaluator service may select from.
    pub modes: Vec<ExecutionMode>,
    /// Upper bound on retained evaluation-cache entries.
    pub cache_capacity: usize,
    /// Directory holding prebuilt function binaries for the bundled runtime.
    pub functions_dir: PathBuf,
    /// Path of the wrapper binary launched for pod-mode sandboxes.
    pub wrapper_bin: PathBuf,
    /// Registry prefix applied to bare function names before evaluation.
    pub image_prefix: String,
}

/// A function execution runtime the evaluator service can route to.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Fork-exec of a prebuilt binary shipped alongside the runtime.
    Bundled,
    /// A sandboxed wrapper process reached over the evaluator wire protocol.
    Pod,
}

/// Everything the daemon is configured by.
#[derive(Deserialize, Serialize, Default)]
pub struct Config {
    /// Scratch-state locations.
    #[serde(default)]
    pub cache: CacheConfig,
    /// How registered repositories are polled.
    #[serde(default)]
    pub repo: RepoConfig,
    /// How functions are evaluated.
    #[serde(default)]
    pub runner: RunnerConfig,
}

//================================================================================================
// Impls
//================================================================================================

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
        }
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self { poll_interval: 60 }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9445".into(),
            modes: vec![ExecutionMode::Bundled, ExecutionMode::Pod],
            cache_capacity: 1024,
            functions_dir: "/usr/local/lib/orchard/functions".into(),
            wrapper_bin: "wrapper-server".into(),
            image_prefix: String::new(),
        }
    }
}

impl Config {
    /// Resolves the configuration from all of its sources.
    ///
    /// Later sources win: built-in defaults, then the user's
    /// `orchard.toml` from the platform config directory, then the
    /// environment.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        sources().extract().map_err(Box::new)
    }
}

//================================================================================================
// Functions
//================================================================================================

fn sources() -> Figment {
    let mut layered = Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::string(BUILTIN_DEFAULTS));

    if let Ok(dirs) = etcetera::choose_base_strategy() {
        layered = layered.admerge(Toml::file(dirs.config_dir().join("orchard.toml")));
    }

    layered.admerge(Env::prefixed("ORCHARD_"))
}

/// The cache root used when no override is given: the platform cache
/// directory, or the system temp directory on platforms without one.
fn default_cache_root() -> PathBuf {
    etcetera::choose_base_strategy()
        .map(|dirs| dirs.cache_dir().join("orchard"))
        .unwrap_or_else(|_| std::env::temp_dir().join("orchard"))
}

//================================================================================================
// Tests
//================================================================================================
