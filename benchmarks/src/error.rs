//! Error handling for the benchmark harness

use std::io;
use std::path::PathBuf;

use pipebench_ingest::error::ConfigError;
use pipebench_ingest::IngestError;
use thiserror::Error;

/// The main error type for the benchmark harness
#[derive(Error, Debug)]
pub enum BenchmarkError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Insufficient data: {0}")]
    InsufficientData(#[from] InsufficientDataError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of a single pipeline run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// The ingestion pipeline failed fatally
    #[error("Pipeline failed: {0}")]
    Pipeline(String),

    /// An external command could not be started
    #[error("Failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// An external command exited unsuccessfully
    #[error("Command exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    /// A blocking pipeline stage panicked or was aborted
    #[error("Pipeline task failed: {0}")]
    Task(String),

    /// The run was cancelled before it finished
    #[error("Run cancelled")]
    Cancelled,
}

impl From<IngestError> for AdapterError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Cancelled => AdapterError::Cancelled,
            other => AdapterError::Pipeline(other.to_string()),
        }
    }
}

/// Raised when an adapter has no successful run to aggregate
#[derive(Error, Debug, Clone, PartialEq)]
#[error("No successful runs for '{adapter_id}' ({failures} failed)")]
pub struct InsufficientDataError {
    pub adapter_id: String,
    pub failures: usize,
}

/// Report persistence errors
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to read report {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Malformed report: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported report schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BenchmarkError>;

impl BenchmarkError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BenchmarkError::Adapter(_) => "adapter",
            BenchmarkError::InsufficientData(_) => "insufficient_data",
            BenchmarkError::Report(_) => "report",
            BenchmarkError::Config(_) => "config",
            BenchmarkError::Io(_) => "io",
            BenchmarkError::Serialization(_) => "serialization",
        }
    }

    /// Setup problems abort the session; everything else is captured per run
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BenchmarkError::Adapter(_) | BenchmarkError::InsufficientData(_))
    }
}
