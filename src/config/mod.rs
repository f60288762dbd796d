//! Configuration management for reconcile-controller
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Remote list+watch source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Worker pool and startup configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Per-key requeue rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Backoff applied between relist attempts
    #[serde(default)]
    pub relist: RetryConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix RECONCILER_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(endpoint) = std::env::var("RECONCILER_SOURCE_ENDPOINT") {
            config.source.endpoint = endpoint;
        }
        if let Ok(path) = std::env::var("RECONCILER_SOURCE_PATH") {
            config.source.path = path;
        }
        if let Ok(token_file) = std::env::var("RECONCILER_SOURCE_TOKEN_FILE") {
            config.source.token_file = Some(token_file);
        }
        if let Ok(timeout) = std::env::var("RECONCILER_SOURCE_WATCH_TIMEOUT_SECS") {
            config.source.watch_timeout_secs = timeout
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid watch timeout".to_string()))?;
        }

        if let Ok(workers) = std::env::var("RECONCILER_WORKERS") {
            config.controller.workers = workers
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid worker count".to_string()))?;
        }
        if let Ok(max_retries) = std::env::var("RECONCILER_MAX_RETRIES") {
            config.controller.max_retries = max_retries
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid max retries".to_string()))?;
        }
        if let Ok(timeout) = std::env::var("RECONCILER_SYNC_TIMEOUT_SECS") {
            config.controller.sync_timeout_secs = timeout
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid sync timeout".to_string()))?;
        }

        if let Ok(level) = std::env::var("RECONCILER_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(enabled) = std::env::var("RECONCILER_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("RECONCILER_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingRequired("source.endpoint".to_string()));
        }
        if self.source.watch_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "source.watch_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.controller.workers == 0 {
            return Err(ConfigError::InvalidValue(
                "controller.workers must be at least 1".to_string(),
            ));
        }
        if self.controller.sync_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "controller.sync_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.qps.is_nan() || self.rate_limit.qps <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.qps must be positive".to_string(),
            ));
        }
        if !self.relist.backoff_multiplier.is_finite() || self.relist.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "relist.backoff_multiplier must be a finite number of at least 1.0".to_string(),
            ));
        }
        if self.relist.initial_backoff_secs > self.relist.max_backoff_secs {
            return Err(ConfigError::InvalidValue(
                "relist.initial_backoff_secs must not exceed relist.max_backoff_secs".to_string(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remote source configuration
///
/// Credentials are opaque to the controller: only a token file path is read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Base URL of the remote API
    #[serde(default = "default_source_endpoint")]
    pub endpoint: String,

    /// Collection path below the endpoint
    #[serde(default = "default_source_path")]
    pub path: String,

    /// File holding a bearer token
    #[serde(default)]
    pub token_file: Option<String>,

    /// Timeout for list requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Minimum server-side duration of one watch, in seconds
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_source_endpoint(),
            path: default_source_path(),
            token_file: None,
            request_timeout_secs: default_request_timeout(),
            watch_timeout_secs: default_watch_timeout(),
        }
    }
}

fn default_source_endpoint() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_source_path() -> String {
    "api/v1/pods".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_watch_timeout() -> u64 {
    300
}

/// Worker pool and startup configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Failed attempts allowed before a key is dropped
    #[serde(default = "default_controller_max_retries")]
    pub max_retries: u32,

    /// Bounded wait for the initial listing, in seconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Skip enqueueing updates whose resource version did not change
    #[serde(default = "default_suppress_unchanged")]
    pub suppress_unchanged_updates: bool,
}

impl ControllerConfig {
    /// Initial sync timeout as a Duration
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_controller_max_retries(),
            sync_timeout_secs: default_sync_timeout(),
            suppress_unchanged_updates: default_suppress_unchanged(),
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_controller_max_retries() -> u32 {
    5
}

fn default_sync_timeout() -> u64 {
    60
}

fn default_suppress_unchanged() -> bool {
    true
}

/// Requeue rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Delay for the first retry of a key, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the per-key delay, in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Overall requeue rate (tokens per second)
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Token bucket size
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

/// Retry configuration for relisting the remote source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Initial backoff duration in seconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Maximum backoff duration in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "reconcile-controller".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
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

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
