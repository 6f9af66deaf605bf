//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/xping/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/xping/` (~/.config/xping/)
//! - Data: `$XDG_DATA_HOME/xping/` (~/.local/share/xping/), holds the offline queue
//! - State/Logs: `$XDG_STATE_HOME/xping/` (~/.local/state/xping/)
//!
//! Hosts that own their configuration can build a [`Config`] directly; every
//! section has working defaults except the credentials in [`ClientConfig`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Upload endpoint and resilience settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Buffering and flush settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Offline queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upload endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Enable/disable uploads
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Collection endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key, sent as a bearer credential
    pub api_key: Option<String>,

    /// Project identifier, sent as `X-Project-Id`
    pub project_id: Option<String>,

    /// HTTP request timeout in seconds (per attempt)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Total attempts per upload, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single backoff
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Random jitter added to each backoff, in `[0, retry_jitter_ms]`
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,

    /// Consecutive transient failures before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// How long an open circuit rejects calls before admitting a probe
    #[serde(default = "default_breaker_cooldown")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Gzip payloads above the threshold
    #[serde(default = "default_enabled")]
    pub compression_enabled: bool,

    /// Payload size (bytes) above which compression applies
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: default_endpoint(),
            api_key: None,
            project_id: None,
            timeout_secs: default_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter_ms: default_retry_jitter(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_ms: default_breaker_cooldown(),
            compression_enabled: default_enabled(),
            compression_threshold_bytes: default_compression_threshold(),
        }
    }
}

impl ClientConfig {
    /// Check if uploads are enabled and credentials are present
    pub fn is_ready(&self) -> bool {
        self.enabled && self.api_key.is_some() && self.project_id.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("client.endpoint must not be empty".to_string()));
        }
        if self.api_key.is_none() {
            return Err(Error::Config(
                "client.api_key is required when uploads are enabled".to_string(),
            ));
        }
        if self.project_id.is_none() {
            return Err(Error::Config(
                "client.project_id is required when uploads are enabled".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "client.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(Error::Config(
                "client.circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://upload.xping.io/api/v1/test-executions".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    4
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_retry_jitter() -> u64 {
    100
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30_000
}

fn default_compression_threshold() -> usize {
    1024
}

/// Buffering configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Records per automatic flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum buffered records; further records are dropped
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Max milliseconds between flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// How long shutdown waits for in-flight uploads
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            buffer_capacity: default_buffer_capacity(),
            flush_interval_ms: default_flush_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(
                "collector.batch_size must be at least 1".to_string(),
            ));
        }
        if self.buffer_capacity < self.batch_size {
            return Err(Error::Config(
                "collector.buffer_capacity must be at least collector.batch_size".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Config(
                "collector.flush_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_flush_interval() -> u64 {
    5_000
}

fn default_shutdown_timeout() -> u64 {
    10
}

/// Offline queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Queue directory (defaults to `$XDG_DATA_HOME/xping/offline-queue`)
    pub directory: Option<PathBuf>,

    /// Maximum records held on disk
    #[serde(default = "default_queue_max_records")]
    pub max_records: usize,

    /// Slots older than this are deleted
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Records re-sent per reconciliation cycle
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_records: default_queue_max_records(),
            retention_hours: default_retention_hours(),
            drain_batch_size: default_drain_batch_size(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(Error::Config(
                "queue.max_records must be at least 1".to_string(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(Error::Config(
                "queue.drain_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured directory or the XDG default
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(Config::queue_dir)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

fn default_queue_max_records() -> usize {
    50_000
}

fn default_retention_hours() -> u64 {
    168
}

fn default_drain_batch_size() -> usize {
    100
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Overlay credentials and endpoint from `XPING_*` environment variables.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(api_key) = std::env::var("XPING_API_KEY") {
            self.client.api_key = Some(api_key);
        }
        if let Ok(project_id) = std::env::var("XPING_PROJECT_ID") {
            self.client.project_id = Some(project_id);
        }
        if let Ok(endpoint) = std::env::var("XPING_ENDPOINT") {
            self.client.endpoint = endpoint;
        }
        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.collector.validate()?;
        self.queue.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/xping/config.toml` (~/.config/xping/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("xping").join("config.toml")
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/xping/` (~/.local/share/xping/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("xping")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/xping/` (~/.local/state/xping/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("xping")
    }

    /// Returns the default offline queue directory
    ///
    /// `$XDG_DATA_HOME/xping/offline-queue` (~/.local/share/xping/offline-queue)
    pub fn queue_dir() -> PathBuf {
        Self::data_dir().join("offline-queue")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/xping/xping-sdk.log` (~/.local/state/xping/xping-sdk.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("xping-sdk.log")
    }
}
