//! Configuration loading and types for Ingot.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct, then `INGOT_*` environment variables are applied
//! on top.  Each subsection governs a different part of the system:
//! networking, blob storage, namespace index persistence, and logging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Namespace index settings.
    #[serde(default)]
    pub index: IndexConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum upload size in bytes (default 100 MiB).
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for blob files and staging area.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,

    /// Create the root directory tree if it does not exist.
    #[serde(default = "default_true")]
    pub create_dirs: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
            create_dirs: true,
        }
    }
}

/// Namespace index configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Backend type: `sqlite` or `memory`.
    #[serde(default = "default_index_engine")]
    pub engine: String,

    /// Path to the SQLite database file.
    #[serde(default = "default_index_path")]
    pub path: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            engine: default_index_engine(),
            path: default_index_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8420
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_upload_size() -> u64 {
    104_857_600 // 100 MiB
}

fn default_storage_root() -> String {
    "./data/blobs".to_string()
}

fn default_index_engine() -> String {
    "sqlite".to_string()
}

fn default_index_path() -> String {
    "./data/index.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`, then apply
/// `INGOT_*` environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config: Config = serde_yaml::from_str(&contents)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Build a configuration from defaults plus environment overrides only.
/// Used when no config file is given on the command line.
pub fn from_env() -> anyhow::Result<Config> {
    let mut config = Config::default();
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Apply `INGOT_*` environment variables on top of `config`.
///
/// Recognized variables: `INGOT_UPLOAD_ROOT`, `INGOT_MAX_FILE_SIZE`,
/// `INGOT_HOST`, `INGOT_PORT`, `INGOT_INDEX_PATH`.
fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(root) = std::env::var("INGOT_UPLOAD_ROOT") {
        config.storage.root_dir = root;
    }
    if let Ok(size) = std::env::var("INGOT_MAX_FILE_SIZE") {
        config.server.max_upload_size = size
            .parse()
            .map_err(|_| anyhow::anyhow!("INGOT_MAX_FILE_SIZE is not a valid byte count: {size}"))?;
    }
    if let Ok(host) = std::env::var("INGOT_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = std::env::var("INGOT_PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| anyhow::anyhow!("INGOT_PORT is not a valid port: {port}"))?;
    }
    if let Ok(path) = std::env::var("INGOT_INDEX_PATH") {
        config.index.path = path;
    }
    Ok(())
}
