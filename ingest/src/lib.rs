//! Pipebench ingestion library
//!
//! This library reads tabular sensor records or generates synthetic ones,
//! turns them into validated time-series samples, and ships them in batches
//! to a Prometheus-compatible import endpoint with bounded concurrency and
//! retries.

pub mod config;
pub mod error;
pub mod metrics;
pub mod sample;
pub mod source;
pub mod transport;
pub mod writer;

// Re-export commonly used types
pub use config::IngestConfig;
pub use error::{IngestError, Result, WriteError};
pub use metrics::WriterMetrics;
pub use sample::{Batch, Sample};
pub use source::{ReadStats, SampleIter, SourceDescriptor, SourceReader, SyntheticSpec};
pub use transport::{HttpTransport, IngestTransport};
pub use writer::{BatchWriter, WriteSummary};
