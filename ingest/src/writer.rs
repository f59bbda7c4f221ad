//! Batched, retrying writer for the Prometheus import API
//!
//! The writer pulls samples from a stream, groups them into batches by size or
//! inactivity, and hands each batch to a small pool of sender workers through a
//! bounded queue. A full queue blocks the producer. Every wait in the writer,
//! whether for input, queue space, a backoff delay, or an in-flight request, is
//! raced against the caller's cancellation token.

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::error::{IngestError, PayloadError, Result, TransportError, WriteError};
use crate::metrics::WriterMetrics;
use crate::sample::{Batch, Sample};
use crate::transport::IngestTransport;

/// Outcome of a completed write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub samples_written: u64,
    pub batches_flushed: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub errors: Vec<WriteError>,
}

/// Batched writer bound to one transport
pub struct BatchWriter {
    config: Arc<IngestConfig>,
    transport: Arc<dyn IngestTransport>,
    metrics: WriterMetrics,
}

/// Per-worker tally merged into the summary once the pool drains
#[derive(Debug, Default)]
struct WorkerTally {
    samples_written: u64,
    batches_sent: u64,
    errors: Vec<WriteError>,
}

enum DeliveryFailure {
    Exhausted(WriteError),
    Fatal(IngestError),
}

struct Sender {
    config: Arc<IngestConfig>,
    transport: Arc<dyn IngestTransport>,
    metrics: WriterMetrics,
    abort: CancellationToken,
}

impl BatchWriter {
    pub fn new(config: Arc<IngestConfig>, transport: Arc<dyn IngestTransport>) -> Result<Self> {
        config.validate()?;
        let metrics = WriterMetrics::new()?;
        Ok(Self {
            config,
            transport,
            metrics,
        })
    }

    pub fn metrics(&self) -> &WriterMetrics {
        &self.metrics
    }

    /// Write every sample of an in-memory collection
    pub async fn write_samples<I>(&self, samples: I, cancel: CancellationToken) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = Sample>,
        I::IntoIter: Send,
    {
        self.write_stream(futures::stream::iter(samples.into_iter().map(Ok)), cancel)
            .await
    }

    /// Drain a sample stream into batches and deliver them
    ///
    /// Source errors stop reading; batches already queued are still delivered
    /// before the error is returned. Exhausted batches are reported in the
    /// summary unless `fail_fast` is set. Rejected payloads are always fatal.
    pub async fn write_stream<S>(&self, stream: S, cancel: CancellationToken) -> Result<WriteSummary>
    where
        S: Stream<Item = Result<Sample>> + Send,
    {
        let batching = &self.config.batching;
        let max_batch_size = batching.max_batch_size;
        let flush_interval = batching.flush_interval();

        let (tx, rx) = mpsc::channel::<Batch>(batching.queue_capacity);
        let queue = Arc::new(Mutex::new(rx));
        let abort = cancel.child_token();

        let sender = Arc::new(Sender {
            config: self.config.clone(),
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            abort: abort.clone(),
        });

        let workers: Vec<_> = (0..batching.workers)
            .map(|id| {
                let queue = queue.clone();
                let sender = sender.clone();
                tokio::spawn(async move { sender.run_worker(id, queue).await })
            })
            .collect();

        let mut stream = std::pin::pin!(stream);
        let mut pending: Vec<Sample> = Vec::with_capacity(max_batch_size);
        let mut next_seq = 0u64;
        let mut source_error = None;

        loop {
            let next = if pending.is_empty() {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => break,
                    item = stream.next() => Some(item),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => break,
                    item = tokio::time::timeout(flush_interval, stream.next()) => item.ok(),
                }
            };

            match next {
                // Inactivity timeout with a partial batch pending
                None => {
                    tracing::debug!("Flushing {} samples after {:?} of inactivity", pending.len(), flush_interval);
                    let batch = Batch::new(next_seq, std::mem::take(&mut pending), max_batch_size)?;
                    if !enqueue(&tx, batch, &abort).await {
                        break;
                    }
                    next_seq += 1;
                }
                Some(None) => break,
                Some(Some(Ok(sample))) => {
                    pending.push(sample);
                    if pending.len() == max_batch_size {
                        let batch = Batch::new(next_seq, std::mem::take(&mut pending), max_batch_size)?;
                        if !enqueue(&tx, batch, &abort).await {
                            break;
                        }
                        next_seq += 1;
                    }
                }
                Some(Some(Err(e))) => {
                    tracing::error!("Source failed after {} batches: {}", next_seq, e);
                    source_error = Some(e);
                    break;
                }
            }
        }

        if !pending.is_empty() && !abort.is_cancelled() {
            let batch = Batch::new(next_seq, std::mem::take(&mut pending), max_batch_size)?;
            if enqueue(&tx, batch, &abort).await {
                next_seq += 1;
            }
        }

        // Closing the queue lets idle workers exit once it is drained
        drop(tx);

        let mut summary = WriteSummary {
            batches_flushed: next_seq,
            ..WriteSummary::default()
        };
        let mut worker_error: Option<IngestError> = None;

        for handle in workers {
            let outcome = handle
                .await
                .map_err(|e| IngestError::Worker(e.to_string()))
                .and_then(|result| result);

            match outcome {
                Ok(tally) => {
                    summary.samples_written += tally.samples_written;
                    summary.batches_sent += tally.batches_sent;
                    summary.errors.extend(tally.errors);
                }
                // A fatal error cancels the pool, so prefer it over the resulting cancellations
                Err(IngestError::Cancelled) => {
                    worker_error.get_or_insert(IngestError::Cancelled);
                }
                Err(e) => {
                    if matches!(worker_error, None | Some(IngestError::Cancelled)) {
                        worker_error = Some(e);
                    }
                }
            }
        }

        summary.errors.sort_by_key(|e| e.batch_seq);
        summary.batches_failed = summary.errors.len() as u64;

        if cancel.is_cancelled() {
            tracing::warn!("Write cancelled after {} of {} batches were sent", summary.batches_sent, summary.batches_flushed);
            return Err(IngestError::Cancelled);
        }
        if let Some(e) = worker_error {
            return Err(e);
        }
        if let Some(e) = source_error {
            return Err(e);
        }

        tracing::info!(
            "Write finished: {} samples in {} batches ({} sent, {} failed)",
            summary.samples_written,
            summary.batches_flushed,
            summary.batches_sent,
            summary.batches_failed
        );

        Ok(summary)
    }
}

async fn enqueue(tx: &mpsc::Sender<Batch>, batch: Batch, abort: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = abort.cancelled() => false,
        sent = tx.send(batch) => sent.is_ok(),
    }
}

impl Sender {
    async fn run_worker(&self, id: usize, queue: Arc<Mutex<mpsc::Receiver<Batch>>>) -> Result<WorkerTally> {
        let mut tally = WorkerTally::default();

        loop {
            let batch = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => return Err(IngestError::Cancelled),
                    batch = rx.recv() => batch,
                }
            };
            let Some(batch) = batch else { break };

            match self.deliver(&batch).await {
                Ok(()) => {
                    tally.samples_written += batch.len() as u64;
                    tally.batches_sent += 1;
                }
                Err(DeliveryFailure::Exhausted(write_error)) => {
                    if self.config.fail_fast {
                        self.abort.cancel();
                        return Err(write_error.into());
                    }
                    tally.errors.push(write_error);
                }
                Err(DeliveryFailure::Fatal(e)) => {
                    self.abort.cancel();
                    return Err(e);
                }
            }
        }

        tracing::debug!("Writer worker {} finished: {} batches sent", id, tally.batches_sent);
        Ok(tally)
    }

    async fn deliver(&self, batch: &Batch) -> std::result::Result<(), DeliveryFailure> {
        let retry = &self.config.retry;
        let body = batch.to_prometheus_text();
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 1..=retry.max_attempts {
            if attempt > 1 {
                let delay = retry.delay_before(attempt);
                self.metrics.send_retries.inc();
                tracing::warn!(
                    "Retrying batch {} (attempt {}/{}) in {:?}",
                    batch.seq(),
                    attempt,
                    retry.max_attempts,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => return Err(DeliveryFailure::Fatal(IngestError::Cancelled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.metrics.send_attempts.inc();
            let outcome = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(DeliveryFailure::Fatal(IngestError::Cancelled)),
                outcome = self.transport.push(body.clone()) => outcome,
            };

            match outcome {
                Ok(()) => {
                    self.metrics.batches_sent.inc();
                    self.metrics.samples_written.inc_by(batch.len() as u64);
                    self.metrics.record_flush(started.elapsed());
                    tracing::debug!("Batch {} delivered ({} samples)", batch.seq(), batch.len());
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    self.metrics.batches_failed.inc();
                    let (status, body) = match e {
                        TransportError::Status { status, body } => (status, body),
                        other => (0, other.to_string()),
                    };
                    tracing::error!("Endpoint rejected batch {} with status {}", batch.seq(), status);
                    return Err(DeliveryFailure::Fatal(
                        PayloadError::Rejected { batch_seq: batch.seq(), status, body }.into(),
                    ));
                }
                Err(e) => {
                    tracing::debug!("Batch {} attempt {} failed: {}", batch.seq(), attempt, e);
                    last_error = Some(e);
                }
            }
        }

        self.metrics.batches_failed.inc();
        self.metrics.record_flush(started.elapsed());

        let write_error = WriteError {
            batch_seq: batch.seq(),
            samples: batch.len(),
            attempts: retry.max_attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        };
        tracing::error!("{}", write_error);
        Err(DeliveryFailure::Exhausted(write_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted transport: fails the first `failures` calls with `error`, then accepts
    struct ScriptedTransport {
        failures: usize,
        error: Option<TransportError>,
        hang: bool,
        calls: AtomicUsize,
        bodies: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn accepting() -> Arc<Self> {
            Self::failing(0, TransportError::Timeout)
        }

        fn failing(failures: usize, error: TransportError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error: Some(error),
                hang: false,
                calls: AtomicUsize::new(0),
                bodies: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                failures: 0,
                error: None,
                hang: true,
                calls: AtomicUsize::new(0),
                bodies: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.bodies.lock().unwrap().iter().map(|b| b.lines().count()).collect()
        }
    }

    #[async_trait]
    impl IngestTransport for ScriptedTransport {
        async fn push(&self, body: String) -> std::result::Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if call < self.failures {
                return Err(self.error.clone().unwrap_or(TransportError::Timeout));
            }
            self.bodies.lock().unwrap().push(body);
            Ok(())
        }
    }

    fn test_config(max_batch_size: usize, workers: usize) -> Arc<IngestConfig> {
        let mut config = IngestConfig::default();
        config.batching.max_batch_size = max_batch_size;
        config.batching.workers = workers;
        config.batching.flush_interval_ms = 50;
        config.retry.base_delay_ms = 5;
        config.retry.max_delay_ms = 20;
        Arc::new(config)
    }

    fn samples(n: usize) -> Vec<Sample> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let labels = BTreeMap::from([("sensor_id".to_string(), format!("sensor_{:02}", i % 3))]);
                Sample::new("temperature_celsius", base + ChronoDuration::seconds(i as i64), i as f64, labels).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batches_by_size_with_final_partial() {
        let transport = ScriptedTransport::accepting();
        let writer = BatchWriter::new(test_config(8, 1), transport.clone()).unwrap();

        let summary = writer.write_samples(samples(20), CancellationToken::new()).await.unwrap();

        assert_eq!(transport.batch_sizes(), vec![8, 8, 4]);
        assert_eq!(summary.samples_written, 20);
        assert_eq!(summary.batches_flushed, 3);
        assert_eq!(summary.batches_sent, 3);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_workers_deliver_everything() {
        let transport = ScriptedTransport::accepting();
        let writer = BatchWriter::new(test_config(10, 4), transport.clone()).unwrap();

        let summary = writer.write_samples(samples(95), CancellationToken::new()).await.unwrap();

        let mut sizes = transport.batch_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes.len(), 10);
        assert_eq!(sizes.iter().sum::<usize>(), 95);
        assert_eq!(sizes[0], 5);
        assert_eq!(summary.samples_written, 95);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = ScriptedTransport::failing(2, TransportError::Status { status: 503, body: String::new() });
        let writer = BatchWriter::new(test_config(100, 1), transport.clone()).unwrap();

        let summary = writer.write_samples(samples(5), CancellationToken::new()).await.unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(summary.batches_sent, 1);
        assert_eq!(writer.metrics().send_attempts.get(), 3);
        assert_eq!(writer.metrics().send_retries.get(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_batches_are_reported_not_fatal() {
        let transport = ScriptedTransport::failing(usize::MAX, TransportError::Connect("refused".to_string()));
        let writer = BatchWriter::new(test_config(4, 2), transport.clone()).unwrap();

        let summary = writer.write_samples(samples(10), CancellationToken::new()).await.unwrap();

        assert_eq!(summary.batches_flushed, 3);
        assert_eq!(summary.batches_failed, 3);
        assert_eq!(summary.samples_written, 0);
        assert_eq!(transport.calls(), 3 * 3);
        assert_eq!(
            summary.errors.iter().map(|e| e.batch_seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(summary.errors.iter().all(|e| e.attempts == 3));
    }

    #[tokio::test]
    async fn test_fail_fast_propagates_write_error() {
        let mut config = (*test_config(4, 1)).clone();
        config.fail_fast = true;
        let transport = ScriptedTransport::failing(usize::MAX, TransportError::Timeout);
        let writer = BatchWriter::new(Arc::new(config), transport).unwrap();

        let err = writer.write_samples(samples(10), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, IngestError::Write(WriteError { batch_seq: 0, .. })));
    }

    #[tokio::test]
    async fn test_client_errors_are_never_retried() {
        let transport = ScriptedTransport::failing(usize::MAX, TransportError::Status { status: 400, body: "bad line".to_string() });
        let writer = BatchWriter::new(test_config(100, 1), transport.clone()).unwrap();

        let err = writer.write_samples(samples(5), CancellationToken::new()).await.unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert!(matches!(err, IngestError::Payload(PayloadError::Rejected { status: 400, .. })));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let mut config = (*test_config(100, 1)).clone();
        config.retry.base_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let transport = ScriptedTransport::failing(usize::MAX, TransportError::Timeout);
        let writer = BatchWriter::new(Arc::new(config), transport).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), writer.write_samples(samples(5), cancel))
            .await
            .expect("cancellation should not wait for the backoff");
        assert!(matches!(result, Err(IngestError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_inflight_request() {
        let transport = ScriptedTransport::hanging();
        let writer = BatchWriter::new(test_config(100, 2), transport).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), writer.write_samples(samples(3), cancel))
            .await
            .expect("cancellation should not wait for the request");
        assert!(matches!(result, Err(IngestError::Cancelled)));
    }

    #[tokio::test]
    async fn test_inactivity_flushes_partial_batch() {
        let transport = ScriptedTransport::accepting();
        let writer = BatchWriter::new(test_config(100, 1), transport.clone()).unwrap();

        let stream = futures::stream::iter(samples(3).into_iter().map(Ok)).chain(futures::stream::pending());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let observer = transport.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                if observer.calls() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let result = writer.write_stream(stream, cancel).await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(transport.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn test_source_error_drains_pending_samples() {
        let transport = ScriptedTransport::accepting();
        let writer = BatchWriter::new(test_config(4, 1), transport.clone()).unwrap();

        let items: Vec<Result<Sample>> = samples(6)
            .into_iter()
            .map(Ok)
            .chain(std::iter::once(Err(SchemaError::SourceNotFound { path: "gone.parquet".to_string() }.into())))
            .collect();

        let err = writer.write_stream(futures::stream::iter(items), CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, IngestError::Schema(SchemaError::SourceNotFound { .. })));
        assert_eq!(transport.batch_sizes(), vec![4, 2]);
    }

    #[tokio::test]
    async fn test_empty_stream_sends_nothing() {
        let transport = ScriptedTransport::accepting();
        let writer = BatchWriter::new(test_config(4, 2), transport.clone()).unwrap();

        let summary = writer.write_samples(Vec::new(), CancellationToken::new()).await.unwrap();

        assert_eq!(summary, WriteSummary::default());
        assert_eq!(transport.calls(), 0);
    }
}
