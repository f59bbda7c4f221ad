//! Pipebench benchmark harness
//!
//! This crate times interchangeable pipeline implementations on an identical
//! ingestion workload and produces statistically comparable results:
//!
//! - Pipeline adapters for the staged, streaming and external-command models
//! - A sequential runner with warm-up, cooldown and per-run timeouts
//! - Per-run CPU and network sampling
//! - Aggregate statistics with outlier flagging and cross-adapter comparison
//! - Atomic JSON reports

pub mod adapter;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod report;
pub mod runner;
pub mod stats;
pub mod utils;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use adapter::{build_adapter, AdapterKind, PipelineAdapter, PipelineConfig, PipelineRunOutcome};
pub use config::Config;
pub use error::{AdapterError, BenchmarkError, Result};
pub use report::{BenchmarkReport, ReportEmitter};
pub use runner::{BenchmarkRunner, RunnerSettings};
pub use stats::{AggregateStats, Comparison, MetricSummary};

/// Why a run did not count as a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The run exceeded the per-run timeout and was cancelled
    Timeout,
    /// The adapter returned an error
    AdapterError(String),
    /// The run completed but some batches could not be delivered
    WriteExhausted(usize),
}

impl FailureReason {
    /// Stable key used to group failures in aggregate statistics
    pub fn key(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::AdapterError(_) => "adapter_error",
            FailureReason::WriteExhausted(_) => "write_exhausted",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::AdapterError(message) => write!(f, "adapter error: {}", message),
            FailureReason::WriteExhausted(batches) => write!(f, "{} batch(es) exhausted retries", batches),
        }
    }
}

/// Outcome classification of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed { reason: FailureReason },
}

/// Measurements of one timed adapter invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub adapter_id: String,
    /// 1-based position in the adapter's series
    pub iteration: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: f64,
    pub cpu_percent: f64,
    pub network_bytes: u64,
    pub samples_written: u64,
    pub status: RunStatus,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Success)
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.status {
            RunStatus::Success => None,
            RunStatus::Failed { reason } => Some(reason),
        }
    }
}
