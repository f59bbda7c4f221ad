//! Canonical time-series samples and the batches they are shipped in

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::error::{PayloadError, SampleError};

/// One timestamped numeric observation
///
/// Samples are validated on construction and immutable afterwards. Labels are
/// kept ordered by name so that the encoded line for a sample is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    metric_name: String,
    timestamp: DateTime<Utc>,
    value: f64,
    labels: BTreeMap<String, String>,
}

impl Sample {
    /// Create a sample, rejecting names, values, or timestamps the store cannot accept
    pub fn new(
        metric_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: f64,
        labels: BTreeMap<String, String>,
    ) -> Result<Self, SampleError> {
        let metric_name = metric_name.into();
        if metric_name.is_empty() {
            return Err(SampleError::EmptyMetricName);
        }
        if !is_valid_metric_name(&metric_name) {
            return Err(SampleError::InvalidMetricName(metric_name));
        }
        if let Some(name) = labels.keys().find(|name| !is_valid_label_name(name)) {
            return Err(SampleError::InvalidLabelName(name.clone()));
        }
        if !value.is_finite() {
            return Err(SampleError::NonFiniteValue(value));
        }
        if timestamp > Utc::now() {
            return Err(SampleError::FutureTimestamp(timestamp.to_rfc3339()));
        }

        Ok(Self {
            metric_name,
            timestamp,
            value,
            labels,
        })
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Append this sample as one Prometheus text line: `name{k="v"} value timestamp_ms`
    pub fn encode_into(&self, out: &mut String) {
        out.push_str(&self.metric_name);
        if !self.labels.is_empty() {
            out.push('{');
            for (i, (name, value)) in self.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(name);
                out.push_str("=\"");
                escape_label_value(value, out);
                out.push('"');
            }
            out.push('}');
        }
        let _ = write!(out, " {} {}", self.value, self.timestamp.timestamp_millis());
    }
}

/// A bounded, ordered group of samples flushed as one write
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    seq: u64,
    samples: Vec<Sample>,
    created_at: DateTime<Utc>,
}

impl Batch {
    /// Create a batch holding between 1 and `max_batch_size` samples
    pub fn new(seq: u64, samples: Vec<Sample>, max_batch_size: usize) -> Result<Self, PayloadError> {
        if samples.is_empty() {
            return Err(PayloadError::InvalidBatch {
                reason: format!("batch {} is empty", seq),
            });
        }
        if samples.len() > max_batch_size {
            return Err(PayloadError::InvalidBatch {
                reason: format!(
                    "batch {} holds {} samples, limit is {}",
                    seq,
                    samples.len(),
                    max_batch_size
                ),
            });
        }

        Ok(Self {
            seq,
            samples,
            created_at: Utc::now(),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Encode the batch in the bulk import format, one line per sample in insertion order
    pub fn to_prometheus_text(&self) -> String {
        let mut body = String::with_capacity(self.samples.len() * 64);
        for (i, sample) in self.samples.iter().enumerate() {
            if i > 0 {
                body.push('\n');
            }
            sample.encode_into(&mut body);
        }
        body
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_label_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
}
