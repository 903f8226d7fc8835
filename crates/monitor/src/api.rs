//! REST client for the testing platform's job endpoints.
//!
//! Wraps submission, status, result and health endpoints using
//! [`reqwest`]. Every job kind is served under `/api/{prefix}/` where the
//! prefix comes from [`JobKind::api_prefix`].
//!
//! The [`StatusSource`] trait is the seam the poll loop talks through, so
//! watchers can be driven by a scripted source in tests.

use std::time::Duration;

use advsec_core::job::{JobKind, JobStatus, StatusUpdate};
use advsec_core::types::JobId;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the poll path gets job status and result artifacts from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch the current status of a job.
    async fn fetch_status(&self, kind: JobKind, job_id: &str) -> Result<StatusReport, PollError>;

    /// Fetch the final artifact referenced by `result_ref`.
    async fn fetch_result(&self, kind: JobKind, result_ref: &str) -> Result<Value, PollError>;
}

/// Status payload nested under `status` in a status response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusReport {
    /// Backend label: `running`, `processing`, `completed`, `failed`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub report_id: Option<String>,
}

impl StatusReport {
    /// Translate the report into a [`StatusUpdate`].
    pub fn into_update(self) -> StatusUpdate {
        let status = JobStatus::from_label(&self.status);
        let mut update = StatusUpdate::new(status);
        update.progress = self.progress.filter(|p| !p.is_null());
        update.message = match status {
            JobStatus::Failed => Some(
                self.error
                    .or(self.message)
                    .unwrap_or_else(|| "job failed".to_string()),
            ),
            _ => self.message,
        };
        update.result_ref = self.report_id;
        update
    }
}

/// Errors from the poll path, classified for the watcher's retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The status endpoint does not exist for this job (HTTP 404).
    #[error("status endpoint not found")]
    NotFound,

    /// Timeout, dropped connection, 5xx or an unusable body.
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend answered `{"success": false, "error": ...}`.
    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

impl From<ApiError> for PollError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::ApiError { status: 404, .. } => PollError::NotFound,
            other => PollError::Transient(other.to_string()),
        }
    }
}

/// `{success, task_id | error}` returned by the start endpoints.
#[derive(Debug, Deserialize)]
struct SubmitEnvelope {
    success: bool,
    #[serde(default)]
    task_id: Option<JobId>,
    #[serde(default)]
    error: Option<String>,
}

/// `{success, status | error}` returned by the status endpoints.
#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    success: bool,
    #[serde(default)]
    status: Option<StatusReport>,
    #[serde(default)]
    error: Option<String>,
}

/// `{success, data | result | error}` returned by the result endpoints.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the testing platform backend.
pub struct BackendApi {
    client: reqwest::Client,
    api_url: String,
}

impl BackendApi {
    /// Create a client for the backend at `api_url` (e.g. `http://host:5000`).
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Launch a job. Sends `POST /api/{prefix}/start` with `params` as body.
    ///
    /// A `success: false` body is reported as [`ApiError::Rejected`].
    pub async fn submit(&self, kind: JobKind, params: &Value) -> Result<JobId, ApiError> {
        let response = self
            .client
            .post(self.url(kind, "start"))
            .json(params)
            .send()
            .await?;

        let envelope: SubmitEnvelope = Self::parse_response(response).await?;
        match envelope {
            SubmitEnvelope {
                success: true,
                task_id: Some(task_id),
                ..
            } => Ok(task_id),
            SubmitEnvelope { success: true, .. } => Err(ApiError::Rejected(
                "response did not include a task_id".to_string(),
            )),
            SubmitEnvelope { error, .. } => Err(ApiError::Rejected(
                error.unwrap_or_else(|| "job submission failed".to_string()),
            )),
        }
    }

    /// Sends `GET /api/{prefix}/status/{job_id}`.
    pub async fn get_status(&self, kind: JobKind, job_id: &str) -> Result<StatusReport, ApiError> {
        let response = self
            .client
            .get(self.url(kind, &format!("status/{job_id}")))
            .send()
            .await?;

        let envelope: StatusEnvelope = Self::parse_response(response).await?;
        match envelope {
            StatusEnvelope {
                success: true,
                status: Some(report),
                ..
            } => Ok(report),
            StatusEnvelope { error, .. } => Err(ApiError::Rejected(
                error.unwrap_or_else(|| "status payload missing".to_string()),
            )),
        }
    }

    /// Sends `GET /api/{prefix}/results/{result_ref}`.
    ///
    /// The artifact is read from `data`, falling back to `result`.
    pub async fn get_result(&self, kind: JobKind, result_ref: &str) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(self.url(kind, &format!("results/{result_ref}")))
            .send()
            .await?;

        let envelope: ResultEnvelope = Self::parse_response(response).await?;
        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope
                    .error
                    .unwrap_or_else(|| "result not available".to_string()),
            ));
        }
        envelope
            .data
            .or(envelope.result)
            .ok_or_else(|| ApiError::Rejected("result payload missing".to_string()))
    }

    /// Sends `GET /api/health`.
    pub async fn health(&self) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(format!("{}/api/health", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    fn url(&self, kind: JobKind, tail: &str) -> String {
        format!("{}/api/{}/{}", self.api_url, kind.api_prefix(), tail)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl StatusSource for BackendApi {
    async fn fetch_status(&self, kind: JobKind, job_id: &str) -> Result<StatusReport, PollError> {
        Ok(self.get_status(kind, job_id).await?)
    }

    async fn fetch_result(&self, kind: JobKind, result_ref: &str) -> Result<Value, PollError> {
        Ok(self.get_result(kind, result_ref).await?)
    }
}
