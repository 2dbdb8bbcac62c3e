//! TOML-based configuration system for AssetSync.
//!
//! The API token is stored as a `token_env` field that references an
//! environment variable name. The actual secret is resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::models::SyncMode;

/// Default cache budget: 10 GiB.
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Default amount reclaimed below the budget once it is exceeded: 2 GiB.
pub const DEFAULT_CACHE_SHRINK_DELTA_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Maximum number of simultaneously active transfers.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 30;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local project layout and persistent data.
    pub workspace: WorkspaceConfig,

    /// Remote asset API settings.
    pub remote: RemoteConfig,

    /// Transfer engine tuning.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Local cache budget.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Import behaviour.
    #[serde(default)]
    pub import: ImportConfig,
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Local project layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root of the local project that receives imported assets.
    pub project_root: PathBuf,

    /// Folder under `project_root` where assets are placed (default `Assets`).
    #[serde(default = "default_assets_dir")]
    pub assets_dir: String,

    /// Directory for persistent data (database, index shards, downloads).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_assets_dir() -> String {
    "Assets".into()
}
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("assetsync"))
        .unwrap_or_else(|| PathBuf::from(".assetsync"))
}
fn default_log_level() -> String {
    "warn".into()
}

impl WorkspaceConfig {
    /// Absolute folder imported assets land in.
    pub fn assets_root(&self) -> PathBuf {
        self.project_root.join(&self.assets_dir)
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Remote asset API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the asset API (e.g. `https://assets.example.com/api/v1`).
    pub api_url: String,

    /// Environment variable holding the API bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Per-request timeout for metadata calls, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
            token: None,
        }
    }
}

fn default_token_env() -> String {
    "ASSETSYNC_TOKEN".into()
}
fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Transfer engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Cap on simultaneously active transfers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Minimum progress fraction change before a progress event is raised.
    #[serde(default = "default_progress_step")]
    pub progress_step: f64,

    /// Minimum byte change before a progress event is raised.
    #[serde(default = "default_progress_bytes")]
    pub progress_bytes: u64,

    /// Period of the host tick driving transfers and imports.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_TRANSFERS
}
fn default_progress_step() -> f64 {
    0.05
}
fn default_progress_bytes() -> u64 {
    1024 * 1024
}
fn default_tick_interval() -> u64 {
    100
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            progress_step: default_progress_step(),
            progress_bytes: default_progress_bytes(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl TransferConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Local cache budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory. Defaults to `<data_dir>/cache` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Size budget in bytes. Unset means [`DEFAULT_CACHE_MAX_BYTES`].
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    /// Bytes reclaimed per eviction pass.
    #[serde(default = "default_shrink_delta")]
    pub shrink_delta_bytes: u64,

    /// Files accessed more recently than this are never evicted.
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,
}

fn default_shrink_delta() -> u64 {
    DEFAULT_CACHE_SHRINK_DELTA_BYTES
}
fn default_lookback() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size_bytes: None,
            shrink_delta_bytes: default_shrink_delta(),
            lookback_secs: default_lookback(),
        }
    }
}

impl CacheConfig {
    /// Effective budget and whether it is the built-in default.
    pub fn effective_max(&self) -> (u64, bool) {
        match self.max_size_bytes {
            Some(max) => (max, false),
            None => (DEFAULT_CACHE_MAX_BYTES, true),
        }
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Import behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Glob patterns for internal/system files that are never downloaded.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Suffix marking a companion (sidecar) file of a primary file.
    #[serde(default = "default_companion_suffix")]
    pub companion_suffix: String,

    /// Whether dependency sync follows pinned versions or latest ones.
    #[serde(default)]
    pub sync_mode: SyncMode,
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/.DS_Store".into(),
        "**/Thumbs.db".into(),
        "**/__MACOSX/**".into(),
        "**/*.tmp".into(),
        ".assetsync/**".into(),
    ]
}
fn default_companion_suffix() -> String {
    ".meta".into()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: default_ignore_patterns(),
            companion_suffix: default_companion_suffix(),
            sync_mode: SyncMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the `token_env` field from the environment.
    ///
    /// A missing variable logs a warning but does not fail: anonymous access
    /// is valid for public asset APIs.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        self.remote.token = resolve_optional_env(&self.remote.token_env, "remote.token_env");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.api_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "remote.api_url".into(),
                detail: "API URL must not be empty".into(),
            });
        }
        if self.workspace.assets_dir.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "workspace.assets_dir".into(),
                detail: "assets directory must not be empty".into(),
            });
        }
        if self.transfer.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.max_concurrent".into(),
                detail: "must be > 0".into(),
            });
        }
        if !(self.transfer.progress_step > 0.0 && self.transfer.progress_step <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "transfer.progress_step".into(),
                detail: "must be in (0, 1]".into(),
            });
        }
        if self.transfer.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.tick_interval_ms".into(),
                detail: "tick interval must be > 0".into(),
            });
        }
        let (max, _) = self.cache.effective_max();
        if self.cache.shrink_delta_bytes > max {
            return Err(ConfigError::InvalidValue {
                field: "cache.shrink_delta_bytes".into(),
                detail: format!("shrink delta exceeds cache budget of {} bytes", max),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Cache directory, defaulting under the data directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.workspace.data_dir.join("cache"))
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
