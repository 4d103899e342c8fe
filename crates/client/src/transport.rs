//! HTTP access to the API.
//!
//! The poller, registry and batch task depend only on the two traits here,
//! so tests swap in scripted transports.

use std::time::Duration;

use async_trait::async_trait;
use larder_core::{InventoryId, JobId};
use serde::Deserialize;
use serde_json::Value;

use crate::review::AddItemRequest;
use crate::types::JobStatusResponse;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("API error ({0}): {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
}

impl TransportError {
    /// Authorization failures are final; polling again cannot fix them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Unauthenticated | TransportError::Forbidden)
    }

    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 => TransportError::Unauthenticated,
            403 => TransportError::Forbidden,
            404 => TransportError::NotFound,
            code => TransportError::Api(code, body),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Parse(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Reads one job's status.
#[async_trait]
pub trait JobStatusTransport: Send + Sync + 'static {
    async fn job_status(&self, queue: &str, job_id: JobId) -> Result<JobStatusResponse, TransportError>;
}

/// Writes one reviewed item.
#[async_trait]
pub trait ItemWriter: Send + Sync + 'static {
    async fn add_item(&self, inventory: InventoryId, item: &AddItemRequest) -> Result<(), TransportError>;
}

/// Per-request limit for every API call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Accepted {
    job_id: JobId,
}

/// reqwest-backed client for the larder API.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    api_url: String,
    token: Option<String>,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl HttpApiClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_token(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::new(api_url)
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.timeout(self.request_timeout);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let resp = self.authorized(req).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(TransportError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        Ok(resp)
    }

    /// Check connectivity by hitting the health endpoint.
    pub async fn check_connectivity(&self) -> bool {
        self.http
            .get(self.url("/health"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// `POST /jobs/{queue}`; the payload is the queue's job body.
    pub async fn enqueue(&self, queue: &str, payload: &Value) -> Result<JobId, TransportError> {
        let resp = self
            .send(self.http.post(self.url(&format!("/jobs/{queue}"))).json(payload))
            .await?;
        let accepted: Accepted = resp.json().await?;
        Ok(accepted.job_id)
    }

    /// Upload a photo for OCR into `inventory`. Returns the image job id.
    pub async fn upload_image(
        &self,
        inventory: InventoryId,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<JobId, TransportError> {
        let req = self
            .http
            .post(self.url(&format!("/inventories/{inventory}/items/from-image")))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let accepted: Accepted = self.send(req).await?.json().await?;
        tracing::debug!(job_id = %accepted.job_id, inventory_id = %inventory, "image uploaded");
        Ok(accepted.job_id)
    }
}

#[async_trait]
impl JobStatusTransport for HttpApiClient {
    async fn job_status(&self, queue: &str, job_id: JobId) -> Result<JobStatusResponse, TransportError> {
        let resp = self
            .send(self.http.get(self.url(&format!("/jobs/{queue}/{job_id}"))))
            .await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ItemWriter for HttpApiClient {
    async fn add_item(&self, inventory: InventoryId, item: &AddItemRequest) -> Result<(), TransportError> {
        self.send(self.http.post(self.url(&format!("/inventories/{inventory}/items"))).json(item))
            .await?;
        Ok(())
    }
}
