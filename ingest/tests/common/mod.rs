//! Shared fixtures for ingestion integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parquet::arrow::ArrowWriter;
use pipebench_ingest::IngestConfig;

/// In-process stand-in for the ingestion endpoint
#[derive(Clone)]
pub struct MockEndpoint {
    bodies: Arc<Mutex<Vec<String>>>,
    requests: Arc<AtomicUsize>,
    fail_first: usize,
    fail_status: StatusCode,
}

impl MockEndpoint {
    pub fn accepting() -> Self {
        Self::failing(0, StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn failing(fail_first: usize, fail_status: StatusCode) -> Self {
        Self {
            bodies: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(AtomicUsize::new(0)),
            fail_first,
            fail_status,
        }
    }

    /// Serve on an ephemeral port and return the base URL
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route("/api/v1/import/prometheus", post(import))
            .route("/api/v1/query", get(query))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.lines().map(String::from).collect::<Vec<_>>())
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.bodies.lock().unwrap().iter().map(|b| b.lines().count()).collect()
    }
}

async fn import(State(endpoint): State<MockEndpoint>, body: String) -> StatusCode {
    let request = endpoint.requests.fetch_add(1, Ordering::SeqCst);
    if request < endpoint.fail_first {
        return endpoint.fail_status;
    }
    endpoint.bodies.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

async fn query(
    State(endpoint): State<MockEndpoint>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let metric = params.get("query").cloned().unwrap_or_default();
    let count = endpoint
        .lines()
        .iter()
        .filter(|line| line.starts_with(&format!("{}{{", metric)) || line.starts_with(&format!("{} ", metric)))
        .count();

    Json(serde_json::json!({
        "status": "success",
        "data": { "resultType": "vector", "result": [], "stored": count }
    }))
}

/// Configuration tuned for fast tests against a local endpoint
pub fn create_test_config(url: &str, max_batch_size: usize) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.endpoint.url = url.to_string();
    config.endpoint.request_timeout_ms = 2_000;
    config.batching.max_batch_size = max_batch_size;
    config.batching.workers = 1;
    config.batching.flush_interval_ms = 100;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config
}

/// One Parquet row: epoch millis, optional value, sensor label
pub type FixtureRow = (i64, Option<f64>, &'static str);

/// Write a Parquet file with `timestamp`, `value` and `sensor_id` columns
pub fn write_sensor_parquet(path: &Path, rows: &[FixtureRow]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new("value", DataType::Float64, true),
        Field::new("sensor_id", DataType::Utf8, true),
    ]));

    let timestamps = TimestampMillisecondArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
    let values = Float64Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
    let sensors = StringArray::from(rows.iter().map(|r| r.2).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(timestamps) as ArrayRef,
            Arc::new(values) as ArrayRef,
            Arc::new(sensors) as ArrayRef,
        ],
    )
    .unwrap();

    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// Write a Parquet file that lacks the `value` column
pub fn write_parquet_without_value(path: &Path) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new("reading", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(TimestampMillisecondArray::from(vec![1_704_067_200_000])) as ArrayRef,
            Arc::new(Float64Array::from(vec![1.0])) as ArrayRef,
        ],
    )
    .unwrap();

    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}
