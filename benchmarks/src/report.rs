//! Benchmark report assembly and persistence

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReportError;
use crate::stats::{self, AggregateStats, Comparison};
use crate::RunResult;

/// Report schema version written by this crate
pub const SCHEMA_VERSION: u32 = 1;

/// Results for one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterReport {
    pub stats: Option<AggregateStats>,
    pub error: Option<String>,
    pub runs: Vec<RunResult>,
}

/// Complete output of a benchmark session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub schema_version: u32,
    pub session_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub iterations: u32,
    pub per_adapter: BTreeMap<String, AdapterReport>,
    pub comparison: Option<Comparison>,
}

impl BenchmarkReport {
    /// Build a report from every adapter's runs
    ///
    /// Adapters without a successful run carry an `error` instead of stats.
    pub fn build(iterations: u32, runs: BTreeMap<String, Vec<RunResult>>) -> Self {
        let per_adapter: BTreeMap<String, AdapterReport> = runs
            .into_iter()
            .map(|(id, runs)| {
                let report = match stats::aggregate(&id, &runs) {
                    Ok(stats) => AdapterReport { stats: Some(stats), error: None, runs },
                    Err(e) => {
                        tracing::warn!("{}", e);
                        AdapterReport { stats: None, error: Some(e.to_string()), runs }
                    }
                };
                (id, report)
            })
            .collect();

        let with_stats: BTreeMap<String, AggregateStats> = per_adapter
            .iter()
            .filter_map(|(id, report)| report.stats.clone().map(|s| (id.clone(), s)))
            .collect();

        Self {
            schema_version: SCHEMA_VERSION,
            session_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            iterations,
            per_adapter,
            comparison: stats::compare(&with_stats),
        }
    }
}

/// Writes and reads reports at a fixed path
#[derive(Debug, Clone)]
pub struct ReportEmitter {
    path: PathBuf,
}

impl ReportEmitter {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the report atomically: temp file in the same directory, sync, rename
    pub fn write(&self, report: &BenchmarkReport) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(report)?;
        let write_err = |source| ReportError::Write { path: self.path.clone(), source };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let temp_path = self.temp_path(&report.session_id);
        let result = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(write_err(e));
        }

        tracing::info!("Report written to {}", self.path.display());
        Ok(())
    }

    /// Read a report back, rejecting unknown schema versions
    pub fn load(&self) -> Result<BenchmarkReport, ReportError> {
        let content = fs::read_to_string(&self.path).map_err(|source| ReportError::Read {
            path: self.path.clone(),
            source,
        })?;

        let value: serde_json::Value = serde_json::from_str(&content)?;
        let found = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found != SCHEMA_VERSION {
            return Err(ReportError::UnsupportedVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Per-session temp name so concurrent writers to one path never share it
    fn temp_path(&self, session_id: &Uuid) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "report".to_string());
        self.path.with_file_name(format!(".{}.{}.tmp", name, session_id))
    }
}
