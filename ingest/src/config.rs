//! Configuration management for the ingestion pipeline
//!
//! Configuration is loaded once per run from a TOML file and environment
//! variables, validated, and then shared read-only by every component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default base URL of the ingestion endpoint
pub const DEFAULT_ENDPOINT_URL: &str = "http://localhost:8428";

/// Metric name used for rows without a `metric_name` column
pub const DEFAULT_METRIC_NAME: &str = "parquet_metric";

/// Upper bound on sender workers per writer
pub const MAX_WORKERS: usize = 4;

/// Main configuration structure for ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Ingestion endpoint configuration
    pub endpoint: EndpointConfig,

    /// Batching and worker pool configuration
    pub batching: BatchingConfig,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Source reading configuration
    pub source: SourceConfig,

    /// Propagate exhausted batches as fatal errors instead of counting them
    pub fail_fast: bool,
}

/// Ingestion endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the time-series store
    pub url: String,

    /// Timeout for a single write request in milliseconds
    pub request_timeout_ms: u64,
}

/// Batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Maximum samples per batch
    pub max_batch_size: usize,

    /// Inactivity timeout before a partial batch is flushed, in milliseconds
    pub flush_interval_ms: u64,

    /// Number of concurrent sender workers (1-4)
    pub workers: usize,

    /// Capacity of the queue between the batcher and the workers
    pub queue_capacity: usize,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum send attempts per batch, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

/// Source reading configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Metric name for tables without a `metric_name` column
    pub default_metric_name: String,

    /// Fraction of unparsable rows (0.0-1.0) tolerated before the read fails
    pub max_skip_ratio: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            batching: BatchingConfig::default(),
            retry: RetryConfig::default(),
            source: SourceConfig::default(),
            fail_fast: false,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT_URL.to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval_ms: 1000,
            workers: 2,
            queue_capacity: 4,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            default_metric_name: DEFAULT_METRIC_NAME.to_string(),
            max_skip_ratio: 0.5,
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl BatchingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl RetryConfig {
    /// Delay to wait before the given attempt (1-based); the first attempt never waits
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: IngestConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides on top of this configuration
    pub fn apply_env(mut self) -> ConfigResult<Self> {
        let url = std::env::var("PIPEBENCH_ENDPOINT_URL")
            .or_else(|_| std::env::var("VICTORIAMETRICS_URL"));
        if let Ok(url) = url {
            self.endpoint.url = url;
        }

        if let Ok(size) = std::env::var("PIPEBENCH_MAX_BATCH_SIZE") {
            self.batching.max_batch_size = parse_env("PIPEBENCH_MAX_BATCH_SIZE", size)?;
        }

        if let Ok(interval) = std::env::var("PIPEBENCH_FLUSH_INTERVAL_MS") {
            self.batching.flush_interval_ms = parse_env("PIPEBENCH_FLUSH_INTERVAL_MS", interval)?;
        }

        if let Ok(attempts) = std::env::var("PIPEBENCH_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("PIPEBENCH_RETRY_MAX_ATTEMPTS", attempts)?;
        }

        if let Ok(delay) = std::env::var("PIPEBENCH_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_env("PIPEBENCH_RETRY_BASE_DELAY_MS", delay)?;
        }

        if let Ok(fail_fast) = std::env::var("PIPEBENCH_FAIL_FAST") {
            self.fail_fast = parse_env("PIPEBENCH_FAIL_FAST", fail_fast)?;
        }

        Ok(self)
    }

    /// Load configuration from environment variables over defaults
    pub fn from_env() -> ConfigResult<Self> {
        let config = IngestConfig::default().apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = IngestConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = IngestConfig::from_file(path)?;
            }
        }

        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        parse_endpoint_url(&self.endpoint.url)?;

        if self.endpoint.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "endpoint.request_timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.batching.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batching.max_batch_size".to_string(),
                value: "0".to_string(),
            });
        }

        if self.batching.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batching.flush_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.batching.workers == 0 || self.batching.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue {
                field: "batching.workers".to_string(),
                value: self.batching.workers.to_string(),
            });
        }

        if self.batching.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batching.queue_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }

        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier".to_string(),
                value: self.retry.backoff_multiplier.to_string(),
            });
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::ValidationFailed {
                reason: "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
            });
        }

        if self.source.default_metric_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "source.default_metric_name".to_string(),
                value: self.source.default_metric_name.clone(),
            });
        }

        if !(0.0..=1.0).contains(&self.source.max_skip_ratio) {
            return Err(ConfigError::InvalidValue {
                field: "source.max_skip_ratio".to_string(),
                value: self.source.max_skip_ratio.to_string(),
            });
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("pipebench").join("ingest.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content)
            .map_err(|_| ConfigError::PermissionDenied { path: path.to_string_lossy().to_string() })?;

        Ok(())
    }
}

/// Parse an endpoint base URL, requiring an http(s) scheme and a host
pub fn parse_endpoint_url(url: &str) -> ConfigResult<reqwest::Url> {
    let invalid = || ConfigError::InvalidValue {
        field: "endpoint.url".to_string(),
        value: url.to_string(),
    };

    let parsed = reqwest::Url::parse(url.trim()).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid());
    }
    Ok(parsed)
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value,
    })
}
