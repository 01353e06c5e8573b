//! HTTP implementation of [`QueueApi`] for workers on other hosts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::api::WORKER_TOKEN_HEADER;
use crate::api::types::{
    AckCancelRequest, AppendEventRequest, CancelRequest, ClaimResponse, CompleteRequest,
    ControlRequest, ErrorBody, EventsPage, FailRequest, HeartbeatRequest, ListJobsQuery,
    PageQuery, UploadQuery,
};
use crate::error::QueueError;
use crate::ledger::events::MAX_PAGE_LIMIT;
use crate::queue::QueueApi;
use crate::queue::model::{
    ArtifactUpload, ClaimRequest, EventLevel, Job, JobArtifact, JobEvent, JobFilter, NewJob,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Identifiers of the call, used to rebuild typed errors from a response.
#[derive(Debug, Clone, Default)]
struct CallContext {
    job_id: Option<Uuid>,
    artifact_id: Option<Uuid>,
    worker_id: Option<String>,
}

impl CallContext {
    fn job(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    fn worker(job_id: Uuid, worker_id: &str) -> Self {
        Self {
            job_id: Some(job_id),
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        }
    }
}

/// Queue client speaking the `/api/queue` HTTP surface.
pub struct HttpQueueClient {
    base_url: String,
    token: Option<SecretString>,
    worker_token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpQueueClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QueueError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            worker_token: None,
            client,
        })
    }

    /// Authenticate as a worker. Sent alongside any operator token.
    pub fn with_worker_token(mut self, token: Option<SecretString>) -> Self {
        self.worker_token = token;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/api/queue{path}", self.base_url));
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        };
        match &self.worker_token {
            Some(token) => builder.header(WORKER_TOKEN_HEADER, token.expose_secret()),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        ctx: CallContext,
    ) -> Result<T, QueueError> {
        let response = builder
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| QueueError::Unavailable(format!("invalid response body: {e}")));
        }
        let text = response.text().await.unwrap_or_default();
        Err(map_error(status, &text, &ctx))
    }

    async fn upload_all(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<(), QueueError> {
        for upload in artifacts {
            self.upload_artifact(job_id, upload, Some(worker_id)).await?;
        }
        Ok(())
    }
}

/// Rebuild a [`QueueError`] from an error response.
fn map_error(status: StatusCode, text: &str, ctx: &CallContext) -> QueueError {
    let body: Option<ErrorBody> = serde_json::from_str(text).ok();
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("HTTP {status}: {}", text.trim()));
    let kind = body
        .as_ref()
        .map(|b| b.kind.as_str())
        .unwrap_or(match status {
            StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => "validation",
            StatusCode::NOT_FOUND => "not_found",
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::FORBIDDEN => "ownership",
            StatusCode::CONFLICT => "invalid_state",
            _ => "unavailable",
        });
    let job_id = ctx.job_id.unwrap_or_else(Uuid::nil);

    match kind {
        "validation" => QueueError::Validation(message),
        "not_found" => match ctx.artifact_id {
            Some(artifact_id) => QueueError::ArtifactNotFound {
                job_id,
                artifact_id,
            },
            None => QueueError::JobNotFound(job_id),
        },
        "ownership" => QueueError::Ownership {
            id: job_id,
            worker_id: body
                .as_ref()
                .and_then(|b| b.worker_id.clone())
                .or_else(|| ctx.worker_id.clone())
                .unwrap_or_default(),
        },
        "invalid_state" => QueueError::InvalidState {
            id: job_id,
            status: body
                .as_ref()
                .and_then(|b| b.status.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            expected: body
                .as_ref()
                .and_then(|b| b.expected.clone())
                .unwrap_or_else(|| "a different state".to_string()),
        },
        "unauthorized" => QueueError::Unauthorized(message),
        "forbidden" => QueueError::Forbidden(message),
        _ => QueueError::Unavailable(message),
    }
}

#[async_trait]
impl QueueApi for HttpQueueClient {
    async fn create_job(&self, request: NewJob) -> Result<Job, QueueError> {
        self.send(
            self.request(Method::POST, "/jobs").json(&request),
            CallContext::default(),
        )
        .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, QueueError> {
        self.send(
            self.request(Method::GET, &format!("/jobs/{id}")),
            CallContext::job(id),
        )
        .await
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        let query = ListJobsQuery {
            status: filter.status.map(|s| s.as_str().to_string()),
            job_type: filter.job_type,
            limit: filter.limit,
        };
        self.send(
            self.request(Method::GET, "/jobs").query(&query),
            CallContext::default(),
        )
        .await
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Option<Job>, QueueError> {
        let response: ClaimResponse = self
            .send(
                self.request(Method::POST, "/jobs/claim").json(&request),
                CallContext::default(),
            )
            .await?;
        Ok(response.job)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: u32,
    ) -> Result<Job, QueueError> {
        let request = HeartbeatRequest {
            worker_id: worker_id.to_string(),
            lease_seconds,
        };
        self.send(
            self.request(Method::POST, &format!("/jobs/{id}/heartbeat"))
                .json(&request),
            CallContext::worker(id, worker_id),
        )
        .await
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result_summary: Option<String>,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<Job, QueueError> {
        self.upload_all(id, worker_id, artifacts).await?;
        let request = CompleteRequest {
            worker_id: worker_id.to_string(),
            result_summary,
        };
        self.send(
            self.request(Method::POST, &format!("/jobs/{id}/complete"))
                .json(&request),
            CallContext::worker(id, worker_id),
        )
        .await
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<Job, QueueError> {
        self.upload_all(id, worker_id, artifacts).await?;
        let request = FailRequest {
            worker_id: worker_id.to_string(),
            error_message: error_message.to_string(),
            retryable,
        };
        self.send(
            self.request(Method::POST, &format!("/jobs/{id}/fail"))
                .json(&request),
            CallContext::worker(id, worker_id),
        )
        .await
    }

    async fn request_cancel(&self, id: Uuid, reason: Option<String>) -> Result<Job, QueueError> {
        self.send(
            self.request(Method::POST, &format!("/jobs/{id}/cancel"))
                .json(&CancelRequest { reason }),
            CallContext::job(id),
        )
        .await
    }

    async fn ack_cancel(
        &self,
        id: Uuid,
        worker_id: &str,
        message: Option<String>,
    ) -> Result<Job, QueueError> {
        let request = AckCancelRequest {
            worker_id: worker_id.to_string(),
            message,
        };
        self.send(
            self.request(Method::POST, &format!("/jobs/{id}/cancel/ack"))
                .json(&request),
            CallContext::worker(id, worker_id),
        )
        .await
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Job, QueueError> {
        self.send(
            self.request(Method::POST, &format!("/jobs/{id}/control"))
                .json(&ControlRequest { paused }),
            CallContext::job(id),
        )
        .await
    }

    async fn append_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<JobEvent, QueueError> {
        let request = AppendEventRequest {
            level,
            message: message.to_string(),
            payload,
        };
        self.send(
            self.request(Method::POST, &format!("/jobs/{job_id}/events"))
                .json(&request),
            CallContext::job(job_id),
        )
        .await
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        after: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<JobEvent>, QueueError> {
        let page: EventsPage = self
            .send(
                self.request(Method::GET, &format!("/jobs/{job_id}/events"))
                    .query(&PageQuery { after, limit }),
                CallContext::job(job_id),
            )
            .await?;
        Ok(page.events)
    }

    async fn upload_artifact(
        &self,
        job_id: Uuid,
        upload: ArtifactUpload,
        worker_id: Option<&str>,
    ) -> Result<JobArtifact, QueueError> {
        let query = UploadQuery {
            name: upload.name,
            content_type: upload.content_type,
            digest: upload.digest,
            worker_id: worker_id.map(str::to_string),
        };
        let ctx = CallContext {
            job_id: Some(job_id),
            artifact_id: None,
            worker_id: query.worker_id.clone(),
        };
        self.send(
            self.request(Method::POST, &format!("/jobs/{job_id}/artifacts"))
                .query(&query)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(upload.content),
            ctx,
        )
        .await
    }

    async fn list_artifacts(
        &self,
        job_id: Uuid,
        limit: Option<u32>,
    ) -> Result<Vec<JobArtifact>, QueueError> {
        self.send(
            self.request(Method::GET, &format!("/jobs/{job_id}/artifacts"))
                .query(&PageQuery { after: None, limit }),
            CallContext::job(job_id),
        )
        .await
    }

    /// Metadata comes from the artifact listing. The bytes come from the
    /// download route.
    async fn download_artifact(
        &self,
        job_id: Uuid,
        artifact_id: Uuid,
    ) -> Result<(JobArtifact, Vec<u8>), QueueError> {
        let not_found = QueueError::ArtifactNotFound {
            job_id,
            artifact_id,
        };
        let artifact = self
            .list_artifacts(job_id, Some(MAX_PAGE_LIMIT))
            .await?
            .into_iter()
            .find(|a| a.id == artifact_id)
            .ok_or(not_found)?;

        let response = self
            .request(
                Method::GET,
                &format!("/jobs/{job_id}/artifacts/{artifact_id}"),
            )
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_error(
                status,
                &text,
                &CallContext {
                    job_id: Some(job_id),
                    artifact_id: Some(artifact_id),
                    worker_id: None,
                },
            ));
        }
        let content = response
            .bytes()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok((artifact, content.to_vec()))
    }
}
