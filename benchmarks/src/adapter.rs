//! Pipeline adapters: one implementation per execution model
//!
//! The runner only sees `PipelineAdapter`. Each variant reads the same source
//! and writes through the same `BatchWriter`, differing only in how the two
//! stages are scheduled.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use pipebench_ingest::config::IngestConfig;
use pipebench_ingest::error::ConfigResult;
use pipebench_ingest::{
    BatchWriter, HttpTransport, IngestError, IngestTransport, ReadStats, Sample, SourceDescriptor,
    SourceReader, WriteError, WriteSummary,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;

/// How often the blocking reader checks for cancellation, in rows
const CANCEL_CHECK_ROWS: usize = 1024;

/// Everything a run needs, shared read-only across iterations
#[derive(Clone)]
pub struct PipelineConfig {
    pub source: SourceDescriptor,
    pub ingest: Arc<IngestConfig>,
    pub transport: Arc<dyn IngestTransport>,
}

impl PipelineConfig {
    /// Pipeline writing to the configured HTTP endpoint
    pub fn http(source: SourceDescriptor, ingest: IngestConfig) -> ConfigResult<Self> {
        let transport = Arc::new(HttpTransport::new(&ingest.endpoint)?);
        Ok(Self {
            source,
            ingest: Arc::new(ingest),
            transport,
        })
    }

    fn reader(&self) -> SourceReader {
        SourceReader::new(self.source.clone(), self.ingest.source.clone())
    }

    fn writer(&self) -> Result<BatchWriter, AdapterError> {
        Ok(BatchWriter::new(self.ingest.clone(), self.transport.clone())?)
    }
}

/// What one successful pipeline invocation produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunOutcome {
    pub samples_written: u64,
    pub batches_flushed: u64,
    pub rows_skipped: u64,
    pub errors: Vec<WriteError>,
}

impl PipelineRunOutcome {
    fn from_parts(summary: WriteSummary, read: ReadStats) -> Self {
        Self {
            samples_written: summary.samples_written,
            batches_flushed: summary.batches_flushed,
            rows_skipped: read.rows_skipped,
            errors: summary.errors,
        }
    }
}

/// A pipeline implementation the runner can time
#[async_trait]
pub trait PipelineAdapter: Send + Sync {
    /// Stable identifier used as the report key
    fn id(&self) -> &str;

    /// Run the whole read-transform-write workload once
    async fn run(
        &self,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<PipelineRunOutcome, AdapterError>;
}

/// Adapter selection as it appears in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterKind {
    Staged,
    Streaming {
        #[serde(default = "default_channel_capacity")]
        channel_capacity: usize,
    },
    Command {
        id: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_channel_capacity() -> usize {
    1024
}

impl AdapterKind {
    pub fn streaming() -> Self {
        AdapterKind::Streaming {
            channel_capacity: default_channel_capacity(),
        }
    }

    pub fn id(&self) -> String {
        match self {
            AdapterKind::Staged => StagedAdapter::ID.to_string(),
            AdapterKind::Streaming { .. } => StreamingAdapter::ID.to_string(),
            AdapterKind::Command { id, .. } => id.clone(),
        }
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            StagedAdapter::ID => Ok(AdapterKind::Staged),
            StreamingAdapter::ID => Ok(AdapterKind::streaming()),
            other => Err(format!(
                "unknown adapter '{}' (expected '{}' or '{}')",
                other,
                StagedAdapter::ID,
                StreamingAdapter::ID
            )),
        }
    }
}

/// Construct the adapter a configuration entry names
pub fn build_adapter(kind: &AdapterKind) -> Box<dyn PipelineAdapter> {
    match kind {
        AdapterKind::Staged => Box::new(StagedAdapter),
        AdapterKind::Streaming { channel_capacity } => Box::new(StreamingAdapter::new(*channel_capacity)),
        AdapterKind::Command { id, program, args } => {
            Box::new(CommandAdapter::new(id.clone(), program.clone(), args.clone()))
        }
    }
}

/// Asset-graph execution: materialize every sample, then write them
pub struct StagedAdapter;

impl StagedAdapter {
    pub const ID: &'static str = "staged";
}

#[async_trait]
impl PipelineAdapter for StagedAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(
        &self,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<PipelineRunOutcome, AdapterError> {
        let reader = config.reader();
        let read_cancel = cancel.clone();

        // Stage 1: load the whole source into memory
        let load = tokio::task::spawn_blocking(move || -> Result<(Vec<Sample>, ReadStats), IngestError> {
            let mut iter = reader.open()?;
            let counters = iter.counters();
            let mut samples = Vec::new();
            for (i, item) in iter.by_ref().enumerate() {
                if i % CANCEL_CHECK_ROWS == 0 && read_cancel.is_cancelled() {
                    return Err(IngestError::Cancelled);
                }
                samples.push(item?);
            }
            Ok((samples, counters.snapshot()))
        });

        let (samples, read) = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            joined = load => joined.map_err(|e| AdapterError::Task(e.to_string()))??,
        };
        tracing::info!("Materialized {} samples ({} rows skipped)", samples.len(), read.rows_skipped);

        // Stage 2: write the materialized samples
        let summary = config.writer()?.write_samples(samples, cancel).await?;
        Ok(PipelineRunOutcome::from_parts(summary, read))
    }
}

/// Task-flow execution: a reader task streams into the writer through a bounded channel
pub struct StreamingAdapter {
    channel_capacity: usize,
}

impl StreamingAdapter {
    pub const ID: &'static str = "streaming";

    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
        }
    }
}

#[async_trait]
impl PipelineAdapter for StreamingAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(
        &self,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<PipelineRunOutcome, AdapterError> {
        let writer = config.writer()?;
        let reader = config.reader();
        let read_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel::<pipebench_ingest::Result<Sample>>(self.channel_capacity);

        let producer = tokio::task::spawn_blocking(move || -> ReadStats {
            let mut iter = match reader.open() {
                Ok(iter) => iter,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return ReadStats::default();
                }
            };
            let counters = iter.counters();

            for (i, item) in iter.by_ref().enumerate() {
                if i % CANCEL_CHECK_ROWS == 0 && read_cancel.is_cancelled() {
                    break;
                }
                let failed = item.is_err();
                // A closed channel means the writer has already stopped
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
            counters.snapshot()
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let written = writer.write_stream(stream, cancel).await;

        let read = producer.await.map_err(|e| AdapterError::Task(e.to_string()))?;
        let summary = written?;
        Ok(PipelineRunOutcome::from_parts(summary, read))
    }
}

/// Runs an external engine binding as a child process
///
/// The child receives the endpoint and source through `PIPEBENCH_*`
/// environment variables. A `samples_written=<n>` line on stdout, when
/// present, is reported as the run's sample count.
pub struct CommandAdapter {
    id: String,
    program: String,
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(id: String, program: String, args: Vec<String>) -> Self {
        Self { id, program, args }
    }
}

#[async_trait]
impl PipelineAdapter for CommandAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<PipelineRunOutcome, AdapterError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("PIPEBENCH_ENDPOINT_URL", &config.ingest.endpoint.url)
            .env("PIPEBENCH_MAX_BATCH_SIZE", config.ingest.batching.max_batch_size.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let SourceDescriptor::Table { path } = &config.source {
            command.env("PIPEBENCH_SOURCE", path);
        }

        let child = command.spawn().map_err(|e| AdapterError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        tracing::debug!("Started '{}' for adapter {}", self.program, self.id);

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            output = child.wait_with_output() => output.map_err(|e| AdapterError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::CommandFailed {
                code: output.status.code(),
                stderr: tail(&stderr, 20),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(PipelineRunOutcome {
            samples_written: parse_counter(&stdout, "samples_written").unwrap_or(0),
            batches_flushed: parse_counter(&stdout, "batches_flushed").unwrap_or(0),
            rows_skipped: parse_counter(&stdout, "rows_skipped").unwrap_or(0),
            errors: Vec::new(),
        })
    }
}

/// Last `key=<n>` value printed on its own line
fn parse_counter(output: &str, key: &str) -> Option<u64> {
    output
        .lines()
        .rev()
        .filter_map(|line| line.trim().strip_prefix(key)?.strip_prefix('='))
        .find_map(|value| value.trim().parse().ok())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
