//! Writer metrics
//!
//! Each `BatchWriter` owns a private prometheus registry so that concurrent
//! writers (one per benchmark run) never share counters.

use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

use crate::error::{MetricsError, MetricsResult};

/// Counters and timings for one writer
#[derive(Clone)]
pub struct WriterMetrics {
    registry: Registry,

    pub batches_sent: IntCounter,
    pub batches_failed: IntCounter,
    pub samples_written: IntCounter,
    pub send_attempts: IntCounter,
    pub send_retries: IntCounter,
    pub flush_duration: Histogram,
}

fn register_counter(registry: &Registry, name: &str, help: &str) -> MetricsResult<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
    Ok(counter)
}

impl WriterMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new_custom(Some("pipebench".to_string()), None)
            .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;

        let batches_sent = register_counter(&registry, "batches_sent_total", "Batches accepted by the endpoint")?;
        let batches_failed = register_counter(&registry, "batches_failed_total", "Batches dropped after exhausting retries")?;
        let samples_written = register_counter(&registry, "samples_written_total", "Samples accepted by the endpoint")?;
        let send_attempts = register_counter(&registry, "send_attempts_total", "Write requests issued")?;
        let send_retries = register_counter(&registry, "send_retries_total", "Write requests issued after a failure")?;

        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Time from first send attempt to batch outcome")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )
        .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
        registry
            .register(Box::new(flush_duration.clone()))
            .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;

        Ok(Self {
            registry,
            batches_sent,
            batches_failed,
            samples_written,
            send_attempts,
            send_retries,
            flush_duration,
        })
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.flush_duration.observe(elapsed.as_secs_f64());
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn export_prometheus(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })?;
        String::from_utf8(buffer).map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writers_do_not_share_counters() {
        let first = WriterMetrics::new().unwrap();
        let second = WriterMetrics::new().unwrap();

        first.batches_sent.inc();
        first.samples_written.inc_by(8);

        assert_eq!(first.batches_sent.get(), 1);
        assert_eq!(second.batches_sent.get(), 0);
    }

    #[test]
    fn test_export_prometheus() {
        let metrics = WriterMetrics::new().unwrap();
        metrics.send_attempts.inc_by(3);
        metrics.record_flush(Duration::from_millis(20));

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("pipebench_send_attempts_total 3"));
        assert!(text.contains("pipebench_flush_duration_seconds_count 1"));
    }
}
