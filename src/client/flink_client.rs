//! HTTP client for the Flink job manager REST API.
//!
//! Every method takes the job manager base URL so one client serves all
//! applications. Errors are returned as-is and never retried here; the
//! reconciler requeues instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use super::types::{
    CheckpointResponse, CheckpointStatistics, ClusterOverviewResponse, ErrorResponse, FlinkJob,
    JobsResponse, SavepointRequest, SavepointStatus, SavepointStatusResponse,
    SavepointTriggerResponse, SubmitJobRequest, SubmitJobResponse, TaskManagerStats,
    TaskManagersResponse,
};

/// Default request timeout for job manager calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by the Flink REST client.
#[derive(Error, Debug)]
pub enum FlinkClientError {
    /// Connection, timeout or TLS failure.
    #[error("Flink transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The job manager answered with a non-success status.
    #[error("Flink API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The response body did not match the expected shape.
    #[error("Flink response decode error: {0}")]
    Decode(String),
}

/// Operations the controller needs from a Flink job manager.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlinkApi: Send + Sync {
    /// `GET /overview`
    async fn get_cluster_overview(
        &self,
        url: &str,
    ) -> Result<ClusterOverviewResponse, FlinkClientError>;

    /// `GET /taskmanagers`
    async fn get_task_managers(&self, url: &str)
    -> Result<Vec<TaskManagerStats>, FlinkClientError>;

    /// `GET /jobs`
    async fn get_jobs(&self, url: &str) -> Result<Vec<FlinkJob>, FlinkClientError>;

    /// `POST /jars/{jar}/run`
    async fn submit_job(
        &self,
        url: &str,
        jar_name: &str,
        request: SubmitJobRequest,
    ) -> Result<SubmitJobResponse, FlinkClientError>;

    /// `POST /jobs/{job}/savepoints` with `cancel-job: true`. Returns the trigger id.
    async fn cancel_job_with_savepoint(
        &self,
        url: &str,
        job_id: &str,
    ) -> Result<String, FlinkClientError>;

    /// `PATCH /jobs/{job}?mode=cancel`
    async fn cancel_job(&self, url: &str, job_id: &str) -> Result<(), FlinkClientError>;

    /// `GET /jobs/{job}/savepoints/{trigger}`
    async fn check_savepoint_status(
        &self,
        url: &str,
        job_id: &str,
        trigger_id: &str,
    ) -> Result<SavepointStatus, FlinkClientError>;

    /// `GET /jobs/{job}/checkpoints`, latest completed checkpoint if any.
    async fn get_latest_checkpoint(
        &self,
        url: &str,
        job_id: &str,
    ) -> Result<Option<CheckpointStatistics>, FlinkClientError>;
}

/// [`FlinkApi`] over HTTP.
#[derive(Clone, Debug)]
pub struct FlinkRestClient {
    http: reqwest::Client,
}

impl FlinkRestClient {
    /// Build a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FlinkClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Wrap an existing HTTP client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn request(&self, method: Method, url: &str, path: &str) -> RequestBuilder {
        let base = url.trim_end_matches('/');
        self.http.request(method, format!("{base}{path}"))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, FlinkClientError> {
        let response = check_status(request.send().await?).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FlinkClientError::Decode(e.to_string()))
    }
}

/// Turn a non-success response into [`FlinkClientError::Api`].
async fn check_status(response: Response) -> Result<Response, FlinkClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .filter(|e| !e.errors.is_empty())
        .map(|e| e.errors.join("; "))
        .unwrap_or(body);
    Err(FlinkClientError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl FlinkApi for FlinkRestClient {
    #[instrument(skip(self))]
    async fn get_cluster_overview(
        &self,
        url: &str,
    ) -> Result<ClusterOverviewResponse, FlinkClientError> {
        self.send_json(self.request(Method::GET, url, "/overview"))
            .await
    }

    #[instrument(skip(self))]
    async fn get_task_managers(
        &self,
        url: &str,
    ) -> Result<Vec<TaskManagerStats>, FlinkClientError> {
        let response: TaskManagersResponse = self
            .send_json(self.request(Method::GET, url, "/taskmanagers"))
            .await?;
        Ok(response.task_managers)
    }

    #[instrument(skip(self))]
    async fn get_jobs(&self, url: &str) -> Result<Vec<FlinkJob>, FlinkClientError> {
        let response: JobsResponse = self
            .send_json(self.request(Method::GET, url, "/jobs"))
            .await?;
        Ok(response.jobs)
    }

    #[instrument(skip(self, request), fields(parallelism = request.parallelism))]
    async fn submit_job(
        &self,
        url: &str,
        jar_name: &str,
        request: SubmitJobRequest,
    ) -> Result<SubmitJobResponse, FlinkClientError> {
        debug!(savepoint = ?request.savepoint_path, "Submitting job");
        self.send_json(
            self.request(Method::POST, url, &format!("/jars/{jar_name}/run"))
                .json(&request),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn cancel_job_with_savepoint(
        &self,
        url: &str,
        job_id: &str,
    ) -> Result<String, FlinkClientError> {
        let body = SavepointRequest {
            target_directory: None,
            cancel_job: true,
        };
        let response: SavepointTriggerResponse = self
            .send_json(
                self.request(Method::POST, url, &format!("/jobs/{job_id}/savepoints"))
                    .json(&body),
            )
            .await?;
        Ok(response.trigger_id)
    }

    #[instrument(skip(self))]
    async fn cancel_job(&self, url: &str, job_id: &str) -> Result<(), FlinkClientError> {
        let request = self.request(Method::PATCH, url, &format!("/jobs/{job_id}?mode=cancel"));
        check_status(request.send().await?).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_savepoint_status(
        &self,
        url: &str,
        job_id: &str,
        trigger_id: &str,
    ) -> Result<SavepointStatus, FlinkClientError> {
        let response: SavepointStatusResponse = self
            .send_json(self.request(
                Method::GET,
                url,
                &format!("/jobs/{job_id}/savepoints/{trigger_id}"),
            ))
            .await?;
        Ok(response.into())
    }

    #[instrument(skip(self))]
    async fn get_latest_checkpoint(
        &self,
        url: &str,
        job_id: &str,
    ) -> Result<Option<CheckpointStatistics>, FlinkClientError> {
        let response: CheckpointResponse = self
            .send_json(self.request(Method::GET, url, &format!("/jobs/{job_id}/checkpoints")))
            .await?;
        Ok(response
            .latest
            .completed
            .filter(|c| !c.external_path.is_empty()))
    }
}
