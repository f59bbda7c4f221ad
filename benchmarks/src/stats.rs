//! Aggregate statistics over an adapter's runs
//!
//! Only successful runs contribute numbers. Failed runs are counted by reason
//! and never averaged in, so a timeout cannot masquerade as a slow success.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::InsufficientDataError;
use crate::utils::stats;
use crate::RunResult;

/// IQR multiplier for flagging duration outliers
const OUTLIER_IQR_FACTOR: f64 = 1.5;

/// Summary of one measured quantity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p95: f64,
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            mean: stats::mean(values),
            stddev: stats::standard_deviation(values),
            min: stats::min(values),
            max: stats::max(values),
            median: stats::median(values),
            p95: stats::percentile(values, 95.0),
        }
    }
}

/// Statistics for one adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Wall-clock duration in seconds
    pub duration: MetricSummary,
    pub cpu_percent: MetricSummary,
    pub network_bytes: MetricSummary,
    pub success_count: usize,
    pub failure_count: usize,
    pub failures_by_reason: BTreeMap<String, usize>,
    /// Iterations whose duration lies outside 1.5 IQR; flagged, not removed
    pub duration_outliers: Vec<u32>,
}

/// Aggregate one adapter's runs
pub fn aggregate(adapter_id: &str, runs: &[RunResult]) -> Result<AggregateStats, InsufficientDataError> {
    let (successes, failures): (Vec<&RunResult>, Vec<&RunResult>) = runs.iter().partition(|r| r.is_success());

    if successes.is_empty() {
        return Err(InsufficientDataError {
            adapter_id: adapter_id.to_string(),
            failures: failures.len(),
        });
    }

    let durations: Vec<f64> = successes.iter().map(|r| r.duration_secs).collect();
    let cpu: Vec<f64> = successes.iter().map(|r| r.cpu_percent).collect();
    let network: Vec<f64> = successes.iter().map(|r| r.network_bytes as f64).collect();

    let mut failures_by_reason = BTreeMap::new();
    for reason in failures.iter().filter_map(|r| r.failure_reason()) {
        *failures_by_reason.entry(reason.key().to_string()).or_insert(0) += 1;
    }

    let duration_outliers = stats::iqr_outliers(&durations, OUTLIER_IQR_FACTOR)
        .into_iter()
        .map(|i| successes[i].iteration)
        .collect();

    Ok(AggregateStats {
        duration: MetricSummary::from_values(&durations),
        cpu_percent: MetricSummary::from_values(&cpu),
        network_bytes: MetricSummary::from_values(&network),
        success_count: successes.len(),
        failure_count: failures.len(),
        failures_by_reason,
        duration_outliers,
    })
}

/// Relative standing of one adapter against the fastest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterComparison {
    pub mean_duration_secs: f64,
    /// How many times longer than the fastest adapter (1.0 for the fastest)
    pub relative_to_fastest: f64,
    pub time_difference_secs: f64,
    pub percent_slower: f64,
}

/// Cross-adapter comparison by mean duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub fastest: String,
    /// Slowest mean duration divided by the fastest; 1.0 with a single adapter
    pub speedup: f64,
    pub adapters: BTreeMap<String, AdapterComparison>,
}

/// Compare every adapter that produced statistics; `None` when none did
pub fn compare(stats: &BTreeMap<String, AggregateStats>) -> Option<Comparison> {
    let (fastest, fastest_stats) = stats
        .iter()
        .min_by(|a, b| a.1.duration.mean.total_cmp(&b.1.duration.mean))?;
    let fastest_mean = fastest_stats.duration.mean;

    let adapters: BTreeMap<String, AdapterComparison> = stats
        .iter()
        .map(|(id, s)| {
            let mean = s.duration.mean;
            let relative = if fastest_mean > 0.0 { mean / fastest_mean } else { 1.0 };
            (
                id.clone(),
                AdapterComparison {
                    mean_duration_secs: mean,
                    relative_to_fastest: relative,
                    time_difference_secs: mean - fastest_mean,
                    percent_slower: (relative - 1.0) * 100.0,
                },
            )
        })
        .collect();

    let speedup = adapters
        .values()
        .map(|a| a.relative_to_fastest)
        .fold(1.0, f64::max);

    Some(Comparison {
        fastest: fastest.clone(),
        speedup,
        adapters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureReason, RunStatus};
    use chrono::Utc;

    fn run(iteration: u32, duration_secs: f64, status: RunStatus) -> RunResult {
        let now = Utc::now();
        RunResult {
            adapter_id: "staged".to_string(),
            iteration,
            start: now,
            end: now,
            duration_secs,
            cpu_percent: 50.0,
            network_bytes: 1000,
            samples_written: 100,
            status,
        }
    }

    fn failed(iteration: u32, reason: FailureReason) -> RunResult {
        run(iteration, 999.0, RunStatus::Failed { reason })
    }

    #[test]
    fn test_aggregate_excludes_failed_runs() {
        let runs = vec![
            run(1, 2.0, RunStatus::Success),
            failed(2, FailureReason::Timeout),
            run(3, 4.0, RunStatus::Success),
            failed(4, FailureReason::AdapterError("boom".to_string())),
            failed(5, FailureReason::Timeout),
        ];

        let stats = aggregate("staged", &runs).unwrap();
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 3);
        assert_eq!(stats.duration.mean, 3.0);
        assert_eq!(stats.duration.max, 4.0);
        assert_eq!(stats.failures_by_reason["timeout"], 2);
        assert_eq!(stats.failures_by_reason["adapter_error"], 1);
    }

    #[test]
    fn test_single_success_has_zero_stddev() {
        let stats = aggregate("staged", &[run(1, 2.5, RunStatus::Success)]).unwrap();
        assert_eq!(stats.duration.stddev, 0.0);
        assert_eq!(stats.duration.min, 2.5);
        assert_eq!(stats.duration.p95, 2.5);
    }

    #[test]
    fn test_no_successes_is_insufficient_data() {
        let err = aggregate("streaming", &[failed(1, FailureReason::Timeout)]).unwrap_err();
        assert_eq!(err.adapter_id, "streaming");
        assert_eq!(err.failures, 1);

        assert!(aggregate("streaming", &[]).is_err());
    }

    #[test]
    fn test_duration_outliers_reported_by_iteration() {
        let runs: Vec<RunResult> = [1.0, 1.1, 0.9, 1.05, 6.0, 1.0]
            .iter()
            .enumerate()
            .map(|(i, d)| run(i as u32 + 1, *d, RunStatus::Success))
            .collect();

        let stats = aggregate("staged", &runs).unwrap();
        assert_eq!(stats.duration_outliers, vec![5]);
        // Outliers stay in the numbers
        assert_eq!(stats.duration.max, 6.0);
    }

    #[test]
    fn test_compare_picks_fastest() {
        let mut all = BTreeMap::new();
        all.insert("staged".to_string(), aggregate("staged", &[run(1, 2.0, RunStatus::Success)]).unwrap());
        all.insert("streaming".to_string(), aggregate("streaming", &[run(1, 3.0, RunStatus::Success)]).unwrap());

        let comparison = compare(&all).unwrap();
        assert_eq!(comparison.fastest, "staged");
        assert_eq!(comparison.speedup, 1.5);

        let streaming = &comparison.adapters["streaming"];
        assert_eq!(streaming.time_difference_secs, 1.0);
        assert_eq!(streaming.percent_slower, 50.0);
        assert_eq!(comparison.adapters["staged"].percent_slower, 0.0);

        assert!(compare(&BTreeMap::new()).is_none());
    }
}
