//! Transports that deliver encoded batches to the ingestion endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use crate::config::EndpointConfig;
use crate::error::{ConfigError, ConfigResult, TransportError};

/// Path of the Prometheus text import API
pub const IMPORT_PATH: &str = "/api/v1/import/prometheus";

/// Path of the instant query API
pub const QUERY_PATH: &str = "/api/v1/query";

/// Something that can accept one encoded batch per call
#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Deliver a newline separated Prometheus text body
    async fn push(&self, body: String) -> Result<(), TransportError>;
}

/// HTTP transport for a VictoriaMetrics compatible endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &EndpointConfig) -> ConfigResult<Self> {
        Self::with_timeout(&config.url, config.request_timeout())
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> ConfigResult<Self> {
        crate::config::parse_endpoint_url(base_url)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn import_url(&self) -> String {
        format!("{}{}", self.base_url, IMPORT_PATH)
    }

    /// Run an instant query and return the decoded JSON response
    pub async fn query(&self, query: &str) -> Result<serde_json::Value, TransportError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, QUERY_PATH))
            .query(&[("query", query)])
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), body });
        }

        response.json().await.map_err(classify)
    }
}

#[async_trait]
impl IngestTransport for HttpTransport {
    async fn push(&self, body: String) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.import_url())
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status { status: status.as_u16(), body })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_builder() {
        TransportError::InvalidRequest(error.to_string())
    } else if let Some(status) = error.status() {
        TransportError::Status { status: status.as_u16(), body: error.to_string() }
    } else {
        TransportError::Connect(error.to_string())
    }
}
