//! Utility functions for benchmark analysis and output

/// Statistical utilities
pub mod stats {
    fn sorted(values: &[f64]) -> Vec<f64> {
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted
    }

    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    pub fn median(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let sorted = sorted(values);
        let len = sorted.len();
        if len % 2 == 0 {
            (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
        } else {
            sorted[len / 2]
        }
    }

    /// Nearest-rank percentile, `p` in 0..=100
    pub fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let sorted = sorted(values);
        let len = sorted.len();
        let index = ((len as f64 - 1.0) * p / 100.0).round() as usize;
        sorted[index.min(len - 1)]
    }

    /// Linearly interpolated quantile, `q` in 0..=1
    pub fn quantile(values: &[f64], q: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let sorted = sorted(values);
        let rank = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
    }

    /// Sample standard deviation (n - 1); zero for fewer than two values
    pub fn standard_deviation(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean_val = mean(values);
        let variance = values.iter()
            .map(|x| (x - mean_val).powi(2))
            .sum::<f64>() / (values.len() - 1) as f64;
        variance.sqrt()
    }

    pub fn min(values: &[f64]) -> f64 {
        values.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    pub fn max(values: &[f64]) -> f64 {
        values.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Indices of values outside `[Q1 - k*IQR, Q3 + k*IQR]`
    pub fn iqr_outliers(values: &[f64], k: f64) -> Vec<usize> {
        if values.len() < 4 {
            return Vec::new();
        }
        let q1 = quantile(values, 0.25);
        let q3 = quantile(values, 0.75);
        let iqr = q3 - q1;
        let lower = q1 - k * iqr;
        let upper = q3 + k * iqr;

        values.iter()
            .enumerate()
            .filter(|(_, v)| **v < lower || **v > upper)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Format utilities
pub mod format {
    use std::time::Duration;

    pub fn duration_human(duration: Duration) -> String {
        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;
        let millis = duration.subsec_millis();

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else if seconds > 0 {
            format!("{}.{:03}s", seconds, millis)
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    pub fn bytes_human(bytes: f64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

        if bytes < 1.0 {
            return "0 B".to_string();
        }

        let i = (bytes.log10() / 3.0).floor() as usize;
        let size = bytes / 1000_f64.powi(i as i32);

        if i < UNITS.len() {
            format!("{:.2} {}", size, UNITS[i])
        } else {
            format!("{:.2} PB", bytes / 1000_f64.powi(5))
        }
    }
}
