//! Sequential benchmark runner
//!
//! Iterations never overlap, so runs do not compete for CPU or network. Each
//! iteration gets a fresh cancellation token and its own resource sampler.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{PipelineAdapter, PipelineConfig};
use crate::config::Config;
use crate::monitoring::ResourceSampler;
use crate::{FailureReason, RunResult, RunStatus};

/// Runner timing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub iterations: u32,
    pub per_run_timeout: Duration,
    pub warmup_iterations: u32,
    pub cooldown: Duration,
    pub sample_interval: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            iterations: config.benchmark.iterations,
            per_run_timeout: config.benchmark.per_run_timeout(),
            warmup_iterations: config.benchmark.warmup_iterations,
            cooldown: config.benchmark.cooldown(),
            sample_interval: config.monitoring.sample_interval(),
        }
    }
}

pub struct BenchmarkRunner {
    settings: RunnerSettings,
    pipeline: PipelineConfig,
}

impl BenchmarkRunner {
    pub fn new(settings: RunnerSettings, pipeline: PipelineConfig) -> Self {
        Self { settings, pipeline }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Run every adapter's series in turn, keyed by adapter id
    pub async fn run_all(&self, adapters: &[Box<dyn PipelineAdapter>]) -> BTreeMap<String, Vec<RunResult>> {
        let mut results = BTreeMap::new();
        for (i, adapter) in adapters.iter().enumerate() {
            if i > 0 {
                self.cool_down().await;
            }
            results.insert(adapter.id().to_string(), self.run_series(adapter.as_ref()).await);
        }
        results
    }

    /// Warm up, then run exactly `iterations` timed runs of one adapter
    pub async fn run_series(&self, adapter: &dyn PipelineAdapter) -> Vec<RunResult> {
        for warmup in 1..=self.settings.warmup_iterations {
            let result = self.run_once(adapter, 0).await;
            tracing::info!(
                "Warm-up {}/{} for {} finished in {:.2}s ({})",
                warmup,
                self.settings.warmup_iterations,
                adapter.id(),
                result.duration_secs,
                describe(&result.status)
            );
            self.cool_down().await;
        }

        let mut results = Vec::with_capacity(self.settings.iterations as usize);
        for iteration in 1..=self.settings.iterations {
            if iteration > 1 {
                self.cool_down().await;
            }
            let result = self.run_once(adapter, iteration).await;
            tracing::info!(
                "{} iteration {}/{}: {:.2}s, {:.1}% CPU, {} network bytes ({})",
                adapter.id(),
                iteration,
                self.settings.iterations,
                result.duration_secs,
                result.cpu_percent,
                result.network_bytes,
                describe(&result.status)
            );
            results.push(result);
        }
        results
    }

    /// One timed invocation; failures are captured in the result, never propagated
    pub async fn run_once(&self, adapter: &dyn PipelineAdapter, iteration: u32) -> RunResult {
        let cancel = CancellationToken::new();
        let sampler = ResourceSampler::start(self.settings.sample_interval);
        let start = Utc::now();
        let timer = Instant::now();

        let outcome = tokio::time::timeout(
            self.settings.per_run_timeout,
            adapter.run(&self.pipeline, cancel.clone()),
        )
        .await;

        // Stop any work the adapter left behind before measuring stops
        cancel.cancel();
        let usage = sampler.stop().await;
        let duration = timer.elapsed();
        let end = Utc::now();

        let (status, samples_written) = match outcome {
            Err(_) => {
                tracing::warn!(
                    "{} iteration {} exceeded {:?} and was cancelled",
                    adapter.id(),
                    iteration,
                    self.settings.per_run_timeout
                );
                (RunStatus::Failed { reason: FailureReason::Timeout }, 0)
            }
            Ok(Err(e)) => {
                tracing::error!("{} iteration {} failed: {}", adapter.id(), iteration, e);
                (
                    RunStatus::Failed { reason: FailureReason::AdapterError(e.to_string()) },
                    0,
                )
            }
            Ok(Ok(outcome)) if !outcome.errors.is_empty() => (
                RunStatus::Failed {
                    reason: FailureReason::WriteExhausted(outcome.errors.len()),
                },
                outcome.samples_written,
            ),
            Ok(Ok(outcome)) => (RunStatus::Success, outcome.samples_written),
        };

        RunResult {
            adapter_id: adapter.id().to_string(),
            iteration,
            start,
            end,
            duration_secs: duration.as_secs_f64(),
            cpu_percent: usage.cpu_percent,
            network_bytes: usage.network_bytes,
            samples_written,
            status,
        }
    }

    async fn cool_down(&self) {
        if !self.settings.cooldown.is_zero() {
            tokio::time::sleep(self.settings.cooldown).await;
        }
    }
}

fn describe(status: &RunStatus) -> String {
    match status {
        RunStatus::Success => "success".to_string(),
        RunStatus::Failed { reason } => format!("failed: {}", reason),
    }
}
