//! Configuration management for benchmark sessions

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use pipebench_ingest::config::IngestConfig;
use pipebench_ingest::error::{ConfigError, ConfigResult};
use pipebench_ingest::{SourceDescriptor, SyntheticSpec};
use serde::{Deserialize, Serialize};

use crate::adapter::AdapterKind;

/// Main benchmark configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub benchmark: BenchmarkSettings,
    pub monitoring: MonitoringSettings,
    pub output: OutputSettings,
    pub workload: WorkloadSettings,
    pub pipeline: IngestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    /// Timed runs per adapter
    pub iterations: u32,
    pub per_run_timeout_secs: u64,
    /// Untimed runs per adapter before measuring
    pub warmup_iterations: u32,
    /// Pause between consecutive runs
    pub cooldown_ms: u64,
    pub adapters: Vec<AdapterKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub report_path: PathBuf,
}

/// What every adapter ingests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    /// Parquet or CSV table; synthetic data is generated when unset
    pub source: Option<PathBuf>,
    pub synthetic: SyntheticSettings,
}

/// Synthetic workload relative to the session start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSettings {
    pub lookback_hours: u64,
    pub interval_secs: u64,
    pub sensors: Vec<String>,
    pub metrics: Vec<String>,
    pub location: String,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            benchmark: BenchmarkSettings::default(),
            monitoring: MonitoringSettings::default(),
            output: OutputSettings::default(),
            workload: WorkloadSettings::default(),
            pipeline: IngestConfig::default(),
        }
    }
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            iterations: 5,
            per_run_timeout_secs: 300,
            warmup_iterations: 1,
            cooldown_ms: 3000,
            adapters: vec![AdapterKind::Staged, AdapterKind::streaming()],
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self { sample_interval_ms: 200 }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            report_path: PathBuf::from("./benchmark_results/benchmark_report.json"),
        }
    }
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            source: None,
            synthetic: SyntheticSettings::default(),
        }
    }
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            interval_secs: 60,
            sensors: vec!["sensor_01".to_string(), "sensor_02".to_string(), "sensor_03".to_string()],
            metrics: vec!["temperature_celsius".to_string(), "humidity_percent".to_string()],
            location: "room_a".to_string(),
            seed: 42,
        }
    }
}

impl BenchmarkSettings {
    pub fn per_run_timeout(&self) -> Duration {
        Duration::from_secs(self.per_run_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl MonitoringSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl SyntheticSettings {
    /// Spec covering the `lookback_hours` that end at `now`, truncated to whole seconds
    pub fn to_spec(&self, now: DateTime<Utc>) -> SyntheticSpec {
        let end = now.duration_trunc(ChronoDuration::seconds(1)).unwrap_or(now);
        let start = end - ChronoDuration::hours(self.lookback_hours as i64);
        let mut spec = SyntheticSpec::new(start, end, self.interval_secs, &self.sensors, &self.metrics)
            .with_seed(self.seed);
        if !self.location.is_empty() {
            spec.extra_labels.insert("location".to_string(), self.location.clone());
        }
        spec
    }
}

impl WorkloadSettings {
    /// Resolve the workload once per session so every run reads identical data
    pub fn descriptor(&self, now: DateTime<Utc>) -> SourceDescriptor {
        match &self.source {
            Some(path) => SourceDescriptor::Table { path: path.clone() },
            None => SourceDescriptor::Synthetic(self.synthetic.to_spec(now)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides, including the pipeline's own
    pub fn apply_env(mut self) -> ConfigResult<Self> {
        if let Ok(iterations) = std::env::var("PIPEBENCH_ITERATIONS") {
            self.benchmark.iterations = parse_env("PIPEBENCH_ITERATIONS", iterations)?;
        }

        if let Ok(timeout) = std::env::var("PIPEBENCH_PER_RUN_TIMEOUT_SECS") {
            self.benchmark.per_run_timeout_secs = parse_env("PIPEBENCH_PER_RUN_TIMEOUT_SECS", timeout)?;
        }

        if let Ok(path) = std::env::var("PIPEBENCH_REPORT_PATH") {
            self.output.report_path = PathBuf::from(path);
        }

        self.pipeline = self.pipeline.apply_env()?;
        Ok(self)
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = Config::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = Config::from_file(path)?;
            }
        }

        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.benchmark.iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "benchmark.iterations".to_string(),
                value: "0".to_string(),
            });
        }

        if self.benchmark.per_run_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "benchmark.per_run_timeout_secs".to_string(),
                value: "0".to_string(),
            });
        }

        if self.benchmark.adapters.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one adapter must be configured".to_string(),
            });
        }

        let mut ids: Vec<String> = self.benchmark.adapters.iter().map(AdapterKind::id).collect();
        ids.sort();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::InvalidValue {
                field: "benchmark.adapters".to_string(),
                value: format!("duplicate adapter id '{}'", pair[0]),
            });
        }

        if self.monitoring.sample_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitoring.sample_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.output.report_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "output.report_path".to_string(),
                value: String::new(),
            });
        }

        self.pipeline.validate()
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("pipebench").join("benchmark.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content)
            .map_err(|_| ConfigError::PermissionDenied { path: path.to_string_lossy().to_string() })
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.benchmark.iterations, 5);
        assert_eq!(config.monitoring.sample_interval(), Duration::from_millis(200));
        assert_eq!(
            config.output.report_path,
            PathBuf::from("./benchmark_results/benchmark_report.json")
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.benchmark.iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.benchmark.per_run_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitoring.sample_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.benchmark.adapters = vec![AdapterKind::Staged, AdapterKind::Staged];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.batching.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("benchmark.toml");

        let mut config = Config::default();
        config.benchmark.iterations = 3;
        config.benchmark.adapters.push(AdapterKind::Command {
            id: "engine".to_string(),
            program: "engine-cli".to_string(),
            args: vec!["run".to_string()],
        });
        config.workload.source = Some(PathBuf::from("data/sensors.parquet"));
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_synthetic_workload_matches_defaults() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let spec = SyntheticSettings::default().to_spec(now);

        assert_eq!(spec.end, now);
        assert_eq!(spec.tick_count(), 24 * 60);
        assert_eq!(spec.expected_samples(), 3 * 2 * 24 * 60);
        assert_eq!(spec.extra_labels["location"], "room_a");
    }
}
