//! Source readers that turn tabular rows or a synthetic spec into samples
//!
//! Every reader validates its schema before producing anything, then yields
//! samples lazily. Rows that cannot be transformed are skipped and counted;
//! the read only fails when the skipped fraction exceeds the configured ratio.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;
use crate::error::{IngestError, Result, SchemaError, TransformError};
use crate::sample::Sample;

const TIMESTAMP_COLUMN: &str = "timestamp";
const VALUE_COLUMN: &str = "value";
const METRIC_NAME_COLUMN: &str = "metric_name";
const SENSOR_LABEL: &str = "sensor_id";

/// Upper bound on a synthetic interval (100 years)
const MAX_INTERVAL_SECS: u64 = 100 * 365 * 86_400;

/// Where samples come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// A Parquet or CSV table on disk
    Table { path: PathBuf },

    /// Deterministically generated sensor readings
    Synthetic(SyntheticSpec),
}

/// Synthetic generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSpec {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_secs: u64,
    pub sensors: BTreeSet<String>,
    pub metrics: BTreeSet<String>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_value_range")]
    pub value_range: (f64, f64),
    /// Labels attached to every generated sample in addition to `sensor_id`
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
}

fn default_value_range() -> (f64, f64) {
    (10.0, 100.0)
}

impl SyntheticSpec {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_secs: u64,
        sensors: impl IntoIterator<Item = impl Into<String>>,
        metrics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            start,
            end,
            interval_secs,
            sensors: sensors.into_iter().map(Into::into).collect(),
            metrics: metrics.into_iter().map(Into::into).collect(),
            seed: 0,
            value_range: default_value_range(),
            extra_labels: BTreeMap::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of interval ticks in `[start, end)`
    pub fn tick_count(&self) -> u64 {
        if self.interval_secs == 0 || self.end <= self.start {
            return 0;
        }
        let span_ms = (self.end - self.start).num_milliseconds() as u64;
        span_ms.div_ceil(self.interval_ms())
    }

    fn interval_ms(&self) -> u64 {
        self.interval_secs.saturating_mul(1000)
    }

    /// Number of samples the spec produces
    pub fn expected_samples(&self) -> u64 {
        self.sensors.len() as u64 * self.metrics.len() as u64 * self.tick_count()
    }

    pub fn validate(&self) -> std::result::Result<(), SchemaError> {
        let invalid = |reason: String| Err(SchemaError::InvalidSpec { reason });

        if self.interval_secs == 0 {
            return invalid("interval must be greater than zero".to_string());
        }
        if self.interval_secs > MAX_INTERVAL_SECS {
            return invalid(format!(
                "interval of {}s exceeds the maximum of {}s",
                self.interval_secs, MAX_INTERVAL_SECS
            ));
        }
        if self.end <= self.start {
            return invalid(format!("end {} is not after start {}", self.end, self.start));
        }
        if self.end > Utc::now() {
            return invalid(format!("end {} is in the future", self.end));
        }
        if self.sensors.is_empty() {
            return invalid("at least one sensor is required".to_string());
        }
        if self.metrics.is_empty() {
            return invalid("at least one metric is required".to_string());
        }
        if let Some(metric) = self.metrics.iter().find(|m| Sample::new(m.as_str(), self.start, 0.0, BTreeMap::new()).is_err()) {
            return invalid(format!("metric name '{}' is not valid", metric));
        }
        let (low, high) = self.value_range;
        if !low.is_finite() || !high.is_finite() || low >= high {
            return invalid(format!("value range {}..{} is empty or not finite", low, high));
        }
        Ok(())
    }
}

/// Row counters shared between a running read and its observers
#[derive(Debug, Default)]
pub struct ReadCounters {
    rows_read: AtomicU64,
    rows_skipped: AtomicU64,
}

/// Snapshot of a read's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    pub rows_read: u64,
    pub rows_skipped: u64,
}

impl ReadCounters {
    pub fn snapshot(&self) -> ReadStats {
        ReadStats {
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Reads samples from a source descriptor
#[derive(Debug, Clone)]
pub struct SourceReader {
    descriptor: SourceDescriptor,
    config: SourceConfig,
}

/// A lazy, finite sequence of samples produced by `SourceReader::open`
pub struct SampleIter {
    inner: Box<dyn Iterator<Item = Result<Sample>>>,
    counters: Arc<ReadCounters>,
}

impl Iterator for SampleIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl SampleIter {
    /// Handle to the counters of this read, valid after the iterator is consumed
    pub fn counters(&self) -> Arc<ReadCounters> {
        self.counters.clone()
    }
}

impl SourceReader {
    pub fn new(descriptor: SourceDescriptor, config: SourceConfig) -> Self {
        Self { descriptor, config }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Validate the source and start a fresh pass over it
    ///
    /// Each call restarts from the first row; synthetic sources replay the
    /// same sequence for the same seed.
    pub fn open(&self) -> Result<SampleIter> {
        let counters = Arc::new(ReadCounters::default());
        let inner: Box<dyn Iterator<Item = Result<Sample>>> = match &self.descriptor {
            SourceDescriptor::Synthetic(spec) => {
                spec.validate()?;
                tracing::debug!(
                    expected = spec.expected_samples(),
                    seed = spec.seed,
                    "Opening synthetic source"
                );
                Box::new(SyntheticSamples::new(spec.clone(), counters.clone()))
            }
            SourceDescriptor::Table { path } => {
                let table = open_table(path)?;
                let layout = ColumnLayout::resolve(&table.columns, &path.display().to_string())?;
                tracing::info!(
                    path = %path.display(),
                    columns = ?table.columns,
                    total_rows = ?table.total_rows,
                    "Opened table source"
                );
                Box::new(TableSamples {
                    rows: table.rows,
                    layout,
                    default_metric_name: self.config.default_metric_name.clone(),
                    max_skip_ratio: self.config.max_skip_ratio,
                    total_rows: table.total_rows,
                    counters: counters.clone(),
                    finished: false,
                })
            }
        };

        Ok(SampleIter { inner, counters })
    }
}

/// One decoded cell of a tabular row
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TimestampMillis(i64),
    TimestampMicros(i64),
    /// Delimited cell whose bytes are not valid UTF-8
    Undecodable,
}

impl Cell {
    fn to_label(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Text(s) if s.is_empty() => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Bool(b) => Some(b.to_string()),
            Cell::Int(i) => Some(i.to_string()),
            Cell::Float(f) => Some(f.to_string()),
            Cell::TimestampMillis(ms) => Some(ms.to_string()),
            Cell::TimestampMicros(us) => Some(us.to_string()),
            Cell::Undecodable => None,
        }
    }
}

fn field_to_cell(field: &Field) -> Cell {
    match field {
        Field::Null => Cell::Null,
        Field::Bool(b) => Cell::Bool(*b),
        Field::Byte(v) => Cell::Int(*v as i64),
        Field::Short(v) => Cell::Int(*v as i64),
        Field::Int(v) => Cell::Int(*v as i64),
        Field::Long(v) => Cell::Int(*v),
        Field::UByte(v) => Cell::Int(*v as i64),
        Field::UShort(v) => Cell::Int(*v as i64),
        Field::UInt(v) => Cell::Int(*v as i64),
        Field::ULong(v) => Cell::Int(*v as i64),
        Field::Float(v) => Cell::Float(*v as f64),
        Field::Double(v) => Cell::Float(*v),
        Field::Str(s) => Cell::Text(s.clone()),
        Field::Date(days) => Cell::TimestampMillis(*days as i64 * 86_400_000),
        Field::TimestampMillis(ms) => Cell::TimestampMillis(*ms),
        Field::TimestampMicros(us) => Cell::TimestampMicros(*us),
        other => Cell::Text(other.to_string()),
    }
}

type RowIter = Box<dyn Iterator<Item = Result<Vec<Cell>>>>;

struct OpenTable {
    columns: Vec<String>,
    total_rows: Option<u64>,
    rows: RowIter,
}

fn open_table(path: &Path) -> Result<OpenTable> {
    if !path.exists() {
        return Err(SchemaError::SourceNotFound { path: path.display().to_string() }.into());
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("parquet") | Some("pq") => open_parquet(path),
        Some("csv") => open_csv(path),
        _ => Err(SchemaError::UnsupportedFormat { path: path.display().to_string() }.into()),
    }
}

fn open_parquet(path: &Path) -> Result<OpenTable> {
    let file = File::open(path)?;
    let reader = SerializedFileReader::new(file)?;

    let file_metadata = reader.metadata().file_metadata();
    let total_rows = Some(file_metadata.num_rows().max(0) as u64);
    let columns = file_metadata
        .schema_descr()
        .root_schema()
        .get_fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();

    let rows = reader.into_iter().map(|row| {
        let row = row?;
        Ok(row.get_column_iter().map(|(_, field)| field_to_cell(field)).collect())
    });

    Ok(OpenTable {
        columns,
        total_rows,
        rows: Box::new(rows),
    })
}

fn open_csv(path: &Path) -> Result<OpenTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let columns = reader.headers()?.iter().map(String::from).collect();

    // Byte records keep a badly encoded row from ending the read
    let rows = reader.into_byte_records().map(|record| {
        let record = record?;
        Ok(record
            .iter()
            .map(|cell| match std::str::from_utf8(cell) {
                Ok("") => Cell::Null,
                Ok(text) => Cell::Text(text.to_string()),
                Err(_) => Cell::Undecodable,
            })
            .collect())
    });

    Ok(OpenTable {
        columns,
        total_rows: None,
        rows: Box::new(rows),
    })
}

/// Column positions resolved once from the table header
#[derive(Debug, Clone)]
struct ColumnLayout {
    timestamp: usize,
    value: usize,
    metric_name: Option<usize>,
    labels: Vec<(usize, String)>,
}

impl ColumnLayout {
    fn resolve(columns: &[String], source_name: &str) -> std::result::Result<Self, SchemaError> {
        let position = |name: &str| columns.iter().position(|c| c == name);
        let required = |name: &str| {
            position(name).ok_or_else(|| SchemaError::MissingColumn {
                column: name.to_string(),
                source_name: source_name.to_string(),
            })
        };

        let timestamp = required(TIMESTAMP_COLUMN)?;
        let value = required(VALUE_COLUMN)?;
        let metric_name = position(METRIC_NAME_COLUMN);

        let labels = columns
            .iter()
            .enumerate()
            .filter(|(_, name)| {
                !matches!(name.as_str(), TIMESTAMP_COLUMN | VALUE_COLUMN | METRIC_NAME_COLUMN)
            })
            .map(|(i, name)| (i, sanitize_label_name(name)))
            .collect();

        Ok(Self {
            timestamp,
            value,
            metric_name,
            labels,
        })
    }
}

fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

struct TableSamples {
    rows: RowIter,
    layout: ColumnLayout,
    default_metric_name: String,
    max_skip_ratio: f64,
    total_rows: Option<u64>,
    counters: Arc<ReadCounters>,
    finished: bool,
}

impl TableSamples {
    fn threshold_error(&self, skipped: u64, total: u64) -> IngestError {
        tracing::warn!(skipped, total, max_ratio = self.max_skip_ratio, "Skipped row ratio exceeded");
        TransformError::SkipThresholdExceeded {
            skipped,
            total,
            max_ratio: self.max_skip_ratio,
        }
        .into()
    }

    fn finish(&mut self) -> Option<Result<Sample>> {
        self.finished = true;
        let stats = self.counters.snapshot();
        if stats.rows_skipped > 0 {
            tracing::warn!(
                skipped = stats.rows_skipped,
                total = stats.rows_read,
                "Finished reading with skipped rows"
            );
        }
        if stats.rows_read > 0
            && stats.rows_skipped as f64 / stats.rows_read as f64 > self.max_skip_ratio
        {
            return Some(Err(self.threshold_error(stats.rows_skipped, stats.rows_read)));
        }
        None
    }
}

impl Iterator for TableSamples {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let cells = match self.rows.next() {
                None => return self.finish(),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok(cells)) => cells,
            };

            let row = self.counters.rows_read.fetch_add(1, Ordering::Relaxed);
            match transform_row(row, &cells, &self.layout, &self.default_metric_name) {
                Ok(sample) => return Some(Ok(sample)),
                Err(e) => {
                    let skipped = self.counters.rows_skipped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(error = %e, "Skipping row");

                    // With a known row count the read can fail as soon as the ratio is unreachable
                    if let Some(total) = self.total_rows {
                        if total > 0 && skipped as f64 > self.max_skip_ratio * total as f64 {
                            self.finished = true;
                            return Some(Err(self.threshold_error(skipped, total)));
                        }
                    }
                }
            }
        }
    }
}

fn transform_row(
    row: u64,
    cells: &[Cell],
    layout: &ColumnLayout,
    default_metric_name: &str,
) -> std::result::Result<Sample, TransformError> {
    if let Some(column) = cells.iter().position(|c| matches!(c, Cell::Undecodable)) {
        return Err(TransformError::InvalidEncoding { row, column });
    }

    let cell = |i: usize| cells.get(i).unwrap_or(&Cell::Null);

    let timestamp = parse_timestamp(cell(layout.timestamp))
        .map_err(|reason| TransformError::InvalidTimestamp { row, reason })?;
    let value = parse_value(cell(layout.value))
        .map_err(|reason| TransformError::InvalidValue { row, reason })?;

    let metric_name = layout
        .metric_name
        .and_then(|i| cell(i).to_label())
        .unwrap_or_else(|| default_metric_name.to_string());

    let labels = layout
        .labels
        .iter()
        .filter_map(|(i, name)| cell(*i).to_label().map(|v| (name.clone(), v)))
        .collect();

    Sample::new(metric_name, timestamp, value, labels).map_err(|e| TransformError::InvalidSample {
        row,
        reason: e.to_string(),
    })
}

fn parse_timestamp(cell: &Cell) -> std::result::Result<DateTime<Utc>, String> {
    match cell {
        Cell::TimestampMillis(ms) => from_millis(*ms),
        Cell::TimestampMicros(us) => from_millis(us.div_euclid(1000)),
        Cell::Int(raw) => from_epoch_number(*raw),
        Cell::Float(raw) if raw.is_finite() => from_millis((raw * 1000.0) as i64),
        Cell::Text(text) => parse_timestamp_text(text),
        Cell::Null => Err("timestamp is missing".to_string()),
        other => Err(format!("unsupported timestamp cell {:?}", other)),
    }
}

fn parse_timestamp_text(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(raw) = text.parse::<i64>() {
        return from_epoch_number(raw);
    }
    if let Ok(secs) = text.parse::<f64>() {
        if secs.is_finite() {
            return from_millis((secs * 1000.0) as i64);
        }
    }
    Err(format!("cannot parse '{}' as a timestamp", text))
}

/// Integer epochs are read by magnitude: seconds, milliseconds, microseconds, nanoseconds
fn from_epoch_number(raw: i64) -> std::result::Result<DateTime<Utc>, String> {
    let magnitude = raw.unsigned_abs();
    let millis = if magnitude < 1_000_000_000_000 {
        raw.saturating_mul(1000)
    } else if magnitude < 1_000_000_000_000_000 {
        raw
    } else if magnitude < 1_000_000_000_000_000_000 {
        raw / 1000
    } else {
        raw / 1_000_000
    };
    from_millis(millis)
}

fn from_millis(ms: i64) -> std::result::Result<DateTime<Utc>, String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| format!("{} ms is out of range", ms))
}

fn parse_value(cell: &Cell) -> std::result::Result<f64, String> {
    match cell {
        Cell::Float(v) => Ok(*v),
        Cell::Int(v) => Ok(*v as f64),
        Cell::Text(text) => text
            .parse::<f64>()
            .map_err(|_| format!("cannot parse '{}' as a number", text)),
        Cell::Null => Err("value is missing".to_string()),
        other => Err(format!("unsupported value cell {:?}", other)),
    }
}

struct SyntheticSamples {
    spec: SyntheticSpec,
    sensors: Vec<String>,
    metrics: Vec<String>,
    rng: StdRng,
    values: Uniform<f64>,
    ticks: u64,
    tick: u64,
    sensor: usize,
    metric: usize,
    counters: Arc<ReadCounters>,
}

impl SyntheticSamples {
    fn new(spec: SyntheticSpec, counters: Arc<ReadCounters>) -> Self {
        let (low, high) = spec.value_range;
        Self {
            sensors: spec.sensors.iter().cloned().collect(),
            metrics: spec.metrics.iter().cloned().collect(),
            rng: StdRng::seed_from_u64(spec.seed),
            values: Uniform::new(low, high),
            ticks: spec.tick_count(),
            tick: 0,
            sensor: 0,
            metric: 0,
            counters,
            spec,
        }
    }

    fn advance(&mut self) {
        self.metric += 1;
        if self.metric == self.metrics.len() {
            self.metric = 0;
            self.sensor += 1;
            if self.sensor == self.sensors.len() {
                self.sensor = 0;
                self.tick += 1;
            }
        }
    }
}

impl Iterator for SyntheticSamples {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tick >= self.ticks {
            return None;
        }

        // tick < ticks keeps the offset below the span
        let offset_ms = self.tick.saturating_mul(self.spec.interval_ms());
        let offset = chrono::Duration::milliseconds(offset_ms.min(i64::MAX as u64) as i64);
        let timestamp = self.spec.start + offset;
        let mut labels = self.spec.extra_labels.clone();
        labels.insert(SENSOR_LABEL.to_string(), self.sensors[self.sensor].clone());
        let value = self.rng.sample(self.values);
        let metric_name = self.metrics[self.metric].clone();
        let row = self.counters.rows_read.fetch_add(1, Ordering::Relaxed);

        self.advance();

        Some(
            Sample::new(metric_name, timestamp, value, labels)
                .map_err(|e| TransformError::InvalidSample { row, reason: e.to_string() }.into()),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let per_tick = (self.sensors.len() * self.metrics.len()) as u64;
        let done = self.tick * per_tick + (self.sensor * self.metrics.len() + self.metric) as u64;
        let remaining = (self.ticks * per_tick).saturating_sub(done) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::TempDir;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn synthetic(sensors: &[&str], metrics: &[&str], minutes: i64) -> SyntheticSpec {
        SyntheticSpec::new(
            base_time(),
            base_time() + Duration::minutes(minutes),
            60,
            sensors.iter().copied(),
            metrics.iter().copied(),
        )
        .with_seed(42)
    }

    fn reader(descriptor: SourceDescriptor) -> SourceReader {
        SourceReader::new(descriptor, SourceConfig::default())
    }

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_synthetic_count_matches_spec() {
        let spec = synthetic(&["sensor_01", "sensor_02"], &["temperature_celsius"], 10);
        assert_eq!(spec.tick_count(), 10);
        assert_eq!(spec.expected_samples(), 20);

        let samples: Vec<Sample> = reader(SourceDescriptor::Synthetic(spec))
            .open()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(samples.len(), 20);
    }

    #[test]
    fn test_synthetic_partial_interval_rounds_up() {
        let mut spec = synthetic(&["a", "b", "c"], &["humidity_percent", "temperature_celsius"], 0);
        spec.end = base_time() + Duration::seconds(150);
        assert_eq!(spec.tick_count(), 3);

        let count = reader(SourceDescriptor::Synthetic(spec)).open().unwrap().count();
        assert_eq!(count, 3 * 2 * 3);
    }

    #[test]
    fn test_synthetic_is_deterministic_and_restartable() {
        let source = reader(SourceDescriptor::Synthetic(synthetic(&["s1", "s2"], &["m1", "m2"], 5)));

        let first: Vec<Sample> = source.open().unwrap().map(|s| s.unwrap()).collect();
        let second: Vec<Sample> = source.open().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(first, second);

        let other_seed = match source.descriptor().clone() {
            SourceDescriptor::Synthetic(spec) => spec.with_seed(7),
            _ => unreachable!(),
        };
        let third: Vec<Sample> = reader(SourceDescriptor::Synthetic(other_seed))
            .open()
            .unwrap()
            .map(|s| s.unwrap())
            .collect();
        assert_ne!(first, third);
    }

    #[test]
    fn test_synthetic_ordering_and_labels() {
        let source = reader(SourceDescriptor::Synthetic(synthetic(&["s2", "s1"], &["m"], 2)));
        let samples: Vec<Sample> = source.open().unwrap().map(|s| s.unwrap()).collect();

        let order: Vec<(&str, i64)> = samples
            .iter()
            .map(|s| (s.labels()["sensor_id"].as_str(), (s.timestamp() - base_time()).num_seconds()))
            .collect();
        assert_eq!(order, vec![("s1", 0), ("s2", 0), ("s1", 60), ("s2", 60)]);
        assert!(samples.iter().all(|s| (10.0..100.0).contains(&s.value())));
    }

    #[test]
    fn test_synthetic_invalid_specs() {
        let mut spec = synthetic(&["s"], &["m"], 10);
        spec.interval_secs = 0;
        assert!(matches!(
            reader(SourceDescriptor::Synthetic(spec)).open().err(),
            Some(IngestError::Schema(SchemaError::InvalidSpec { .. }))
        ));

        let spec = synthetic(&[], &["m"], 10);
        assert!(reader(SourceDescriptor::Synthetic(spec)).open().is_err());

        let mut spec = synthetic(&["s"], &["m"], 10);
        spec.end = Utc::now() + Duration::hours(1);
        assert!(reader(SourceDescriptor::Synthetic(spec)).open().is_err());

        let spec = synthetic(&["s"], &["not a metric"], 10);
        assert!(reader(SourceDescriptor::Synthetic(spec)).open().is_err());
    }

    #[test]
    fn test_synthetic_huge_interval() {
        let mut spec = synthetic(&["s"], &["m"], 10);
        spec.interval_secs = u64::MAX;
        assert_eq!(spec.tick_count(), 1);
        assert!(matches!(spec.validate(), Err(SchemaError::InvalidSpec { .. })));

        // Longer than the span but representable: a single tick at start
        spec.interval_secs = 86_400 * 365;
        assert!(spec.validate().is_ok());
        let samples: Vec<Sample> = reader(SourceDescriptor::Synthetic(spec))
            .open()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp(), base_time());
    }

    #[test]
    fn test_csv_reads_labels_and_default_metric() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "sensors.csv",
            "timestamp,value,sensor id,location\n\
             2024-03-01T12:00:00Z,21.5,sensor_01,room_a\n\
             1709294460,22.0,sensor_02,\n\
             1709294520000,22.5,sensor_03,room_b\n",
        );

        let samples: Vec<Sample> = reader(SourceDescriptor::Table { path })
            .open()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.metric_name() == "parquet_metric"));
        assert_eq!(samples[0].labels()["sensor_id"], "sensor_01");
        assert_eq!(samples[0].labels()["location"], "room_a");
        assert!(!samples[1].labels().contains_key("location"));
        assert_eq!(samples[1].timestamp(), base_time() + Duration::seconds(60));
        assert_eq!(samples[2].timestamp(), base_time() + Duration::seconds(120));
    }

    #[test]
    fn test_csv_row_with_invalid_utf8_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mixed.csv");
        let mut content = b"timestamp,value,sensor_id\n2024-03-01T12:00:00Z,1.0,sensor_01\n".to_vec();
        content.extend_from_slice(b"2024-03-01T12:01:00Z,2.0,sensor_\xff\xfe\n");
        content.extend_from_slice(b"2024-03-01T12:02:00Z,3.0,sensor_02\n2024-03-01T12:03:00Z,4.0,sensor_03\n");
        std::fs::write(&path, content).unwrap();

        let mut iter = reader(SourceDescriptor::Table { path }).open().unwrap();
        let counters = iter.counters();
        let samples: Vec<Sample> = iter.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(samples.iter().map(|s| s.value()).collect::<Vec<_>>(), vec![1.0, 3.0, 4.0]);
        let stats = counters.snapshot();
        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.rows_skipped, 1);
    }

    #[test]
    fn test_csv_missing_required_column() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "bad.csv", "timestamp,reading\n2024-03-01T12:00:00Z,1\n");

        let err = reader(SourceDescriptor::Table { path }).open().err().unwrap();
        match err {
            IngestError::Schema(SchemaError::MissingColumn { column, .. }) => assert_eq!(column, "value"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_rows_are_skipped_below_threshold() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "mixed.csv",
            "timestamp,value,metric_name\n\
             2024-03-01T12:00:00Z,1.0,cpu\n\
             yesterday,2.0,cpu\n\
             2024-03-01T12:02:00Z,NaN,cpu\n\
             2024-03-01T12:03:00Z,4.0,cpu\n\
             2024-03-01T12:04:00Z,5.0,cpu\n",
        );

        let mut iter = reader(SourceDescriptor::Table { path }).open().unwrap();
        let counters = iter.counters();
        let samples: Vec<Sample> = iter.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(samples.len(), 3);
        assert_eq!(
            counters.snapshot(),
            ReadStats { rows_read: 5, rows_skipped: 2 }
        );
    }

    #[test]
    fn test_bad_rows_above_threshold_fail_the_read() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "broken.csv",
            "timestamp,value\n\
             2024-03-01T12:00:00Z,1.0\n\
             2024-03-01T12:01:00Z,abc\n\
             2024-03-01T12:02:00Z,def\n",
        );

        let results: Vec<Result<Sample>> = reader(SourceDescriptor::Table { path }).open().unwrap().collect();
        assert!(matches!(
            results.last(),
            Some(Err(IngestError::Transform(TransformError::SkipThresholdExceeded { skipped: 2, total: 3, .. })))
        ));
    }

    #[test]
    fn test_unsupported_and_missing_files() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "data.json", "{}");
        assert!(matches!(
            reader(SourceDescriptor::Table { path }).open().err(),
            Some(IngestError::Schema(SchemaError::UnsupportedFormat { .. }))
        ));

        let missing = dir.path().join("nope.parquet");
        assert!(matches!(
            reader(SourceDescriptor::Table { path: missing }).open().err(),
            Some(IngestError::Schema(SchemaError::SourceNotFound { .. }))
        ));
    }

    #[test]
    fn test_epoch_magnitudes() {
        let expected = base_time();
        let secs = expected.timestamp();
        assert_eq!(from_epoch_number(secs).unwrap(), expected);
        assert_eq!(from_epoch_number(secs * 1000).unwrap(), expected);
        assert_eq!(from_epoch_number(secs * 1_000_000).unwrap(), expected);
        assert_eq!(from_epoch_number(secs * 1_000_000_000).unwrap(), expected);
    }

    #[test]
    fn test_sanitize_label_name() {
        assert_eq!(sanitize_label_name("sensor id"), "sensor_id");
        assert_eq!(sanitize_label_name("9lives"), "_9lives");
        assert_eq!(sanitize_label_name("room-a"), "room_a");
    }
}
