//! Validated application layer over the job store.
//!
//! Normalizes inputs, applies redaction, writes artifact blobs and records a
//! lifecycle event after every state change. Lifecycle events are best
//! effort: a failed append is logged and never undoes a committed transition.
//!
//! Appends and their live publish happen under one lock, so subscribers in
//! this process see each job's events in sequence order.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::ledger::events::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, page_limit};
use crate::ledger::{ArtifactStorage, EventBus};
use crate::queue::QueueApi;
use crate::queue::model::{
    ArtifactUpload, CancelAction, ClaimRequest, EventLevel, FailAction, Job, JobArtifact,
    JobEvent, JobFilter, JobStatus, NewJob, normalize_list,
};
use crate::queue::policy::RetryPolicy;
use crate::queue::tokens::{
    NewWorkerToken, WorkerPolicy, WorkerToken, generate_token, hash_token,
};
use crate::safety::SecretRedactor;
use crate::store::{JobStore, ReclaimedJob};

const DEFAULT_JOB_LIMIT: u32 = 50;
const MAX_JOB_LIMIT: u32 = 200;
const MAX_ATTEMPTS_CEILING: u32 = 100;
const MAX_LEASE_SECONDS: u32 = 24 * 3600;
const MAX_MESSAGE_LEN: usize = 8 * 1024;

const MAX_JOB_TYPE_LEN: usize = 64;

/// The queue's validated lifecycle surface.
pub struct QueueService {
    store: Arc<dyn JobStore>,
    storage: ArtifactStorage,
    bus: EventBus,
    /// Held from event append until its publish.
    publish_gate: Mutex<()>,
    redactor: Arc<SecretRedactor>,
    policy: RetryPolicy,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: ArtifactStorage,
        redactor: Arc<SecretRedactor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            storage,
            bus: EventBus::new(),
            publish_gate: Mutex::new(()),
            redactor,
            policy,
        }
    }

    /// Live event bus for subscribers in this process.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn redactor(&self) -> &Arc<SecretRedactor> {
        &self.redactor
    }

    /// Persist an event and publish it in commit order.
    async fn append_and_publish(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<JobEvent, QueueError> {
        let _gate = self.publish_gate.lock().await;
        let event = self
            .store
            .append_event(job_id, level, message, payload)
            .await?;
        self.bus.publish(event.clone());
        Ok(event)
    }

    /// Append a lifecycle event, logging instead of failing.
    async fn record(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) {
        if let Err(e) = self
            .append_and_publish(job_id, level, message, payload.as_ref())
            .await
        {
            warn!(job_id = %job_id, error = %e, event = message, "Failed to record job event");
        }
    }

    async fn require_job(&self, id: Uuid) -> Result<Job, QueueError> {
        self.store.get_job(id).await?.ok_or(QueueError::JobNotFound(id))
    }

    async fn record_reclaimed(&self, reclaimed: &[ReclaimedJob]) {
        for item in reclaimed {
            let (level, message) = match item.job.status {
                JobStatus::Queued => (EventLevel::Warn, "Lease expired; job requeued"),
                JobStatus::Cancelled => (EventLevel::Warn, "Lease expired; job cancelled"),
                _ => (EventLevel::Error, "Lease expired; job dead-lettered"),
            };
            self.record(
                item.job.id,
                level,
                message,
                Some(serde_json::json!({
                    "previousOwner": item.previous_owner,
                    "attempt": item.job.attempt,
                    "status": item.job.status,
                })),
            )
            .await;
        }
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

    fn clean_message(&self, message: &str) -> String {
        let scrubbed = self.redactor.scrub(message.trim());
        truncate(&scrubbed, MAX_MESSAGE_LEN)
    }

    // ── Worker tokens ──────────────────────────────────────────────────

    /// Issue a worker token. The raw value is only ever returned here.
    pub async fn issue_worker_token(
        &self,
        request: NewWorkerToken,
    ) -> Result<(WorkerToken, SecretString), QueueError> {
        let worker_id = request.worker_id.trim().to_string();
        if worker_id.is_empty() {
            return Err(QueueError::Validation("workerId is required".into()));
        }
        let now = Utc::now();
        let token = WorkerToken {
            id: Uuid::new_v4(),
            worker_id,
            description: request
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            allowed_repositories: normalize_list(&request.allowed_repositories),
            allowed_job_types: normalize_list(&request.allowed_job_types),
            capabilities: normalize_list(&request.capabilities),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let raw = generate_token();
        self.redactor.register_secret(&raw);
        self.store
            .insert_worker_token(&token, &hash_token(raw.expose_secret()))
            .await?;
        info!(token_id = %token.id, worker_id = %token.worker_id, "Worker token issued");
        Ok((token, raw))
    }

    pub async fn list_worker_tokens(&self, limit: Option<u32>) -> Result<Vec<WorkerToken>, QueueError> {
        let limit = page_limit(limit, DEFAULT_JOB_LIMIT, MAX_JOB_LIMIT)?;
        self.store.list_worker_tokens(limit).await
    }

    pub async fn revoke_worker_token(&self, id: Uuid) -> Result<WorkerToken, QueueError> {
        let token = self
            .store
            .revoke_worker_token(id)
            .await?
            .ok_or(QueueError::TokenNotFound(id))?;
        info!(token_id = %id, worker_id = %token.worker_id, "Worker token revoked");
        Ok(token)
    }

    /// Resolve a presented raw token to its claim policy.
    pub async fn resolve_worker_token(&self, raw: &str) -> Result<WorkerPolicy, QueueError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(QueueError::Unauthorized("worker token is required".into()));
        }
        let token = self
            .store
            .find_worker_token(&hash_token(raw))
            .await?
            .ok_or_else(|| QueueError::Unauthorized("invalid worker token".into()))?;
        if !token.is_active {
            return Err(QueueError::Unauthorized("worker token is inactive".into()));
        }
        Ok(WorkerPolicy::from(&token))
    }
}

#[async_trait]
impl QueueApi for QueueService {
    async fn create_job(&self, request: NewJob) -> Result<Job, QueueError> {
        let job_type = request.job_type.trim().to_ascii_lowercase();
        if !is_valid_job_type(&job_type) {
            return Err(QueueError::Validation(format!(
                "invalid job type: {:?}",
                request.job_type
            )));
        }
        if !request.payload.is_object() {
            return Err(QueueError::Validation("payload must be a JSON object".into()));
        }
        if request.max_attempts < 1 || request.max_attempts > MAX_ATTEMPTS_CEILING {
            return Err(QueueError::Validation(format!(
                "maxAttempts must be between 1 and {MAX_ATTEMPTS_CEILING}"
            )));
        }
        let affinity_key = request
            .affinity_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let job = Job::new(NewJob {
            job_type,
            affinity_key,
            ..request
        });
        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "Job queued");
        self.record(
            job.id,
            EventLevel::Info,
            "Job queued",
            Some(serde_json::json!({
                "type": job.job_type,
                "priority": job.priority,
                "maxAttempts": job.max_attempts,
            })),
        )
        .await;
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, QueueError> {
        self.require_job(id).await
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        let limit = page_limit(filter.limit, DEFAULT_JOB_LIMIT, MAX_JOB_LIMIT)?;
        let filter = JobFilter {
            job_type: filter
                .job_type
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty()),
            ..filter
        };
        self.store.list_jobs(&filter, limit).await
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Option<Job>, QueueError> {
        let worker_id = request.worker_id.trim().to_string();
        if worker_id.is_empty() {
            return Err(QueueError::Validation("workerId is required".into()));
        }
        if request.lease_seconds < 1 || request.lease_seconds > MAX_LEASE_SECONDS {
            return Err(QueueError::Validation(format!(
                "leaseSeconds must be between 1 and {MAX_LEASE_SECONDS}"
            )));
        }
        let request = ClaimRequest {
            worker_id,
            lease_seconds: request.lease_seconds,
            allowed_types: normalize_list(&request.allowed_types),
            worker_capabilities: normalize_list(&request.worker_capabilities),
            allowed_repositories: normalize_list(&request.allowed_repositories),
        };

        let outcome = self
            .store
            .claim_job(&request, &self.policy, Utc::now())
            .await?;
        self.record_reclaimed(&outcome.reclaimed).await;

        if let Some(job) = &outcome.job {
            info!(job_id = %job.id, worker_id = %request.worker_id, attempt = job.attempt, "Job claimed");
            self.record(
                job.id,
                EventLevel::Info,
                "Job claimed",
                Some(serde_json::json!({
                    "workerId": request.worker_id,
                    "attempt": job.attempt,
                    "leaseExpiresAt": job.lease_expires_at,
                })),
            )
            .await;
        }
        Ok(outcome.job)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: u32,
    ) -> Result<Job, QueueError> {
        if lease_seconds < 1 || lease_seconds > MAX_LEASE_SECONDS {
            return Err(QueueError::Validation(format!(
                "leaseSeconds must be between 1 and {MAX_LEASE_SECONDS}"
            )));
        }
        let job = self.store.heartbeat(id, worker_id.trim(), lease_seconds).await?;
        debug!(job_id = %id, worker_id, "Heartbeat received");
        self.record(
            id,
            EventLevel::Info,
            "Heartbeat received",
            Some(serde_json::json!({"leaseExpiresAt": job.lease_expires_at})),
        )
        .await;
        Ok(job)
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result_summary: Option<String>,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<Job, QueueError> {
        let worker_id = worker_id.trim();
        self.upload_all(id, worker_id, artifacts).await?;
        let summary = result_summary
            .map(|s| self.clean_message(&s))
            .filter(|s| !s.is_empty());
        let job = self
            .store
            .complete_job(id, worker_id, summary.as_deref())
            .await?;
        info!(job_id = %id, worker_id, "Job completed");
        self.record(
            id,
            EventLevel::Info,
            "Job completed",
            Some(serde_json::json!({"resultSummary": job.result_summary})),
        )
        .await;
        Ok(job)
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<Job, QueueError> {
        let worker_id = worker_id.trim();
        let error_message = self.clean_message(error_message);
        if error_message.is_empty() {
            return Err(QueueError::Validation("errorMessage is required".into()));
        }
        self.upload_all(id, worker_id, artifacts).await?;
        let (job, action) = self
            .store
            .fail_job(id, worker_id, &error_message, retryable, &self.policy)
            .await?;

        let (level, message) = match action {
            FailAction::Requeued => (EventLevel::Warn, "Job failed (retryable)"),
            FailAction::DeadLettered => (EventLevel::Error, "Job dead-lettered"),
            FailAction::Failed => (EventLevel::Error, "Job failed"),
            FailAction::Cancelled => (EventLevel::Warn, "Job cancelled"),
        };
        warn!(job_id = %id, worker_id, action = ?action, attempt = job.attempt, "{message}");
        self.record(
            id,
            level,
            message,
            Some(serde_json::json!({
                "error": error_message,
                "retryable": retryable,
                "attempt": job.attempt,
                "nextAttemptAt": job.next_attempt_at,
            })),
        )
        .await;
        Ok(job)
    }

    async fn request_cancel(&self, id: Uuid, reason: Option<String>) -> Result<Job, QueueError> {
        let reason = reason
            .map(|r| self.clean_message(&r))
            .filter(|r| !r.is_empty());
        let (job, action) = self.store.request_cancel(id, reason.as_deref()).await?;
        match action {
            CancelAction::QueuedCancelled => {
                info!(job_id = %id, "Queued job cancelled");
                self.record(
                    id,
                    EventLevel::Info,
                    "Job cancelled",
                    Some(serde_json::json!({"reason": reason, "action": action})),
                )
                .await;
            }
            CancelAction::RunningRequested => {
                info!(job_id = %id, "Cancellation requested");
                self.record(
                    id,
                    EventLevel::Warn,
                    "Cancellation requested",
                    Some(serde_json::json!({"reason": reason, "action": action})),
                )
                .await;
            }
            CancelAction::Noop => {
                debug!(job_id = %id, status = %job.status, "Cancel request was a no-op");
            }
        }
        Ok(job)
    }

    async fn ack_cancel(
        &self,
        id: Uuid,
        worker_id: &str,
        message: Option<String>,
    ) -> Result<Job, QueueError> {
        let worker_id = worker_id.trim();
        let (job, changed) = self.store.ack_cancel(id, worker_id).await?;
        if changed {
            let message = message
                .map(|m| self.clean_message(&m))
                .filter(|m| !m.is_empty());
            info!(job_id = %id, worker_id, "Cancellation acknowledged");
            self.record(
                id,
                EventLevel::Warn,
                "Job cancelled",
                Some(serde_json::json!({
                    "workerId": worker_id,
                    "message": message,
                    "action": "acknowledged",
                })),
            )
            .await;
        }
        Ok(job)
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Job, QueueError> {
        let job = self.store.set_paused(id, paused).await?;
        info!(job_id = %id, paused, "Live control updated");
        self.record(
            id,
            EventLevel::Info,
            "Live control updated",
            Some(serde_json::json!({"paused": paused})),
        )
        .await;
        Ok(job)
    }

    async fn append_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<JobEvent, QueueError> {
        let message = self.clean_message(message);
        if message.is_empty() {
            return Err(QueueError::Validation("event message is required".into()));
        }
        let payload = payload.map(|p| self.redactor.scrub_json(&p));
        self.append_and_publish(job_id, level, &message, payload.as_ref())
            .await
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        after: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<JobEvent>, QueueError> {
        let limit = page_limit(limit, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)?;
        if after.is_some_and(|a| a < 0) {
            return Err(QueueError::Validation("after must be >= 0".into()));
        }
        self.require_job(job_id).await?;
        self.store.list_events(job_id, after, limit).await
    }

    async fn upload_artifact(
        &self,
        job_id: Uuid,
        upload: ArtifactUpload,
        worker_id: Option<&str>,
    ) -> Result<JobArtifact, QueueError> {
        self.storage
            .check_upload(upload.content.len(), upload.content_type.as_deref())?;
        let job = self.require_job(job_id).await?;
        if let Some(worker_id) = worker_id.map(str::trim) {
            if job.status != JobStatus::Running {
                return Err(QueueError::InvalidState {
                    id: job_id,
                    status: job.status.to_string(),
                    expected: JobStatus::Running.to_string(),
                });
            }
            if job.claimed_by.as_deref() != Some(worker_id) {
                return Err(QueueError::Ownership {
                    id: job_id,
                    worker_id: worker_id.to_string(),
                });
            }
        }

        let content_type = upload
            .content_type
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let artifact_id = Uuid::new_v4();
        let blob = self
            .storage
            .write(
                job_id,
                artifact_id,
                &upload.name,
                &upload.content,
                content_type.as_deref(),
            )
            .await?;
        let digest = upload
            .digest
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| blob.digest.clone());

        let artifact = JobArtifact {
            id: artifact_id,
            job_id,
            name: upload.name.trim().to_string(),
            content_type,
            size_bytes: blob.size_bytes,
            digest: Some(digest),
            storage_path: blob.storage_path,
            created_at: Utc::now(),
        };
        self.store.insert_artifact(&artifact).await?;
        debug!(job_id = %job_id, artifact_id = %artifact.id, name = %artifact.name, "Artifact uploaded");
        self.record(
            job_id,
            EventLevel::Info,
            "Artifact uploaded",
            Some(serde_json::json!({
                "artifactId": artifact.id,
                "name": artifact.name,
                "sizeBytes": artifact.size_bytes,
            })),
        )
        .await;
        Ok(artifact)
    }

    async fn list_artifacts(
        &self,
        job_id: Uuid,
        limit: Option<u32>,
    ) -> Result<Vec<JobArtifact>, QueueError> {
        let limit = page_limit(limit, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)?;
        self.require_job(job_id).await?;
        self.store.list_artifacts(job_id, limit).await
    }

    async fn download_artifact(
        &self,
        job_id: Uuid,
        artifact_id: Uuid,
    ) -> Result<(JobArtifact, Vec<u8>), QueueError> {
        let artifact = self
            .store
            .get_artifact(artifact_id)
            .await?
            .filter(|a| a.job_id == job_id)
            .ok_or(QueueError::ArtifactNotFound {
                job_id,
                artifact_id,
            })?;
        let data = self.storage.read(&artifact.storage_path).await?;
        Ok((artifact, data))
    }
}

/// Lowercase identifier: a letter, then letters, digits, `_`, `.` or `-`.
fn is_valid_job_type(job_type: &str) -> bool {
    let mut chars = job_type.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    starts_with_letter
        && job_type.len() <= MAX_JOB_TYPE_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
