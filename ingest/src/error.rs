//! Error handling for the ingestion pipeline
//!
//! This module provides the error taxonomy for every stage of ingestion:
//! reading and validating sources, transforming rows into samples, and
//! shipping batches to the remote ingestion endpoint.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed source, fatal for the whole read
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Row transformation failure that escalated to a fatal read error
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Batch write failure, only fatal when `fail_fast` is set
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Request rejected by the endpoint as malformed, never retried
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Writer metrics registration errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parquet decoding errors
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// CSV decoding errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A writer worker task panicked or was aborted
    #[error("Writer worker failed: {0}")]
    Worker(String),

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,
}

/// Source structure errors
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Required column '{column}' not found in {source_name}")]
    MissingColumn { column: String, source_name: String },

    #[error("Unsupported source format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Source file not found: {path}")]
    SourceNotFound { path: String },

    #[error("Invalid synthetic source: {reason}")]
    InvalidSpec { reason: String },
}

/// Row level transformation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Row {row}: invalid timestamp: {reason}")]
    InvalidTimestamp { row: u64, reason: String },

    #[error("Row {row}: invalid value: {reason}")]
    InvalidValue { row: u64, reason: String },

    #[error("Row {row}: invalid sample: {reason}")]
    InvalidSample { row: u64, reason: String },

    #[error("Row {row}: column {column} is not valid UTF-8")]
    InvalidEncoding { row: u64, column: usize },

    #[error("Skipped {skipped} of {total} rows, exceeding the allowed ratio of {max_ratio}")]
    SkipThresholdExceeded { skipped: u64, total: u64, max_ratio: f64 },
}

/// A batch that could not be delivered after exhausting its retries
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Batch {batch_seq} ({samples} samples) failed after {attempts} attempt(s): {reason}")]
pub struct WriteError {
    pub batch_seq: u64,
    pub samples: usize,
    pub attempts: u32,
    pub reason: String,
}

/// Malformed request errors
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Endpoint rejected batch {batch_seq} with status {status}: {body}")]
    Rejected { batch_seq: u64, status: u16, body: String },

    #[error("Batch construction failed: {reason}")]
    InvalidBatch { reason: String },
}

/// Sample invariant violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("Metric name is empty")]
    EmptyMetricName,

    #[error("Metric name '{0}' is not a valid Prometheus metric name")]
    InvalidMetricName(String),

    #[error("Label name '{0}' is not a valid Prometheus label name")]
    InvalidLabelName(String),

    #[error("Value {0} is not finite")]
    NonFiniteValue(f64),

    #[error("Timestamp {0} is in the future")]
    FutureTimestamp(String),
}

/// Transport level failures reported by an `IngestTransport`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request could not be built: {0}")]
    InvalidRequest(String),
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration file permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Metrics collection errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric registration failed: {name}")]
    RegistrationFailed { name: String },

    #[error("Metric export failed: {reason}")]
    ExportFailed { reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, IngestError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for metrics operations
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

impl IngestError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            IngestError::Write(_) => true,
            IngestError::Transform(TransformError::SkipThresholdExceeded { .. }) => false,
            IngestError::Transform(_) => true,
            IngestError::Schema(_) => false,
            IngestError::Payload(_) => false,
            IngestError::Config(_) => false,
            IngestError::Metrics(_) => false,
            IngestError::Worker(_) => false,
            IngestError::Cancelled => false,
            IngestError::Io(io_error) => {
                matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            IngestError::Parquet(_) | IngestError::Csv(_) => false,
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            IngestError::Schema(_) => "schema",
            IngestError::Transform(_) => "transform",
            IngestError::Write(_) => "write",
            IngestError::Payload(_) => "payload",
            IngestError::Config(_) => "config",
            IngestError::Metrics(_) => "metrics",
            IngestError::Worker(_) => "worker",
            IngestError::Io(_) => "io",
            IngestError::Parquet(_) => "parquet",
            IngestError::Csv(_) => "csv",
            IngestError::Cancelled => "cancelled",
        }
    }
}

impl TransportError {
    /// Transport failures and server errors are worth retrying; client errors are not
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect(_) | TransportError::Timeout => true,
            TransportError::Status { status, .. } => !(400..500).contains(status),
            TransportError::InvalidRequest(_) => false,
        }
    }
}
