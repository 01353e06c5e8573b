//! `JobStore` trait: the single async interface for queue persistence.
//!
//! Every mutating method is atomic with respect to other workers sharing
//! the same store. State and ownership preconditions are checked inside the
//! same write transaction that applies the change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::queue::model::{
    CancelAction, ClaimRequest, EventLevel, FailAction, Job, JobArtifact, JobEvent, JobFilter,
};
use crate::queue::policy::RetryPolicy;
use crate::queue::tokens::WorkerToken;

/// A job moved out of `running` by the lease sweep.
#[derive(Debug, Clone)]
pub struct ReclaimedJob {
    pub job: Job,
    /// Worker whose lease expired.
    pub previous_owner: Option<String>,
}

/// Result of one claim transaction.
#[derive(Debug, Clone, Default)]
pub struct ClaimOutcome {
    pub job: Option<Job>,
    pub reclaimed: Vec<ReclaimedJob>,
}

/// Backend-agnostic persistence for jobs, events and artifact metadata.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Persist a freshly built job.
    async fn insert_job(&self, job: &Job) -> Result<(), QueueError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError>;

    /// List jobs newest first.
    async fn list_jobs(&self, filter: &JobFilter, limit: u32) -> Result<Vec<Job>, QueueError>;

    /// Reclaim expired leases, then lease the next eligible job.
    async fn claim_job(
        &self,
        request: &ClaimRequest,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, QueueError>;

    /// Extend the lease of a running job owned by `worker_id`.
    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: u32,
    ) -> Result<Job, QueueError>;

    /// Mark a running job owned by `worker_id` as succeeded.
    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: &str,
        result_summary: Option<&str>,
    ) -> Result<Job, QueueError>;

    /// Apply a failure report from the owning worker.
    async fn fail_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<(Job, FailAction), QueueError>;

    /// Request cancellation. Queued jobs cancel immediately.
    async fn request_cancel(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<(Job, CancelAction), QueueError>;

    /// Owner acknowledgement of a pending cancellation.
    async fn ack_cancel(&self, id: Uuid, worker_id: &str) -> Result<(Job, bool), QueueError>;

    /// Set `payload.liveControl.paused` on a non-terminal job.
    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Job, QueueError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Append an event. The store assigns the next per-job sequence.
    async fn append_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<JobEvent, QueueError>;

    /// Events with `sequence > after`, ascending.
    async fn list_events(
        &self,
        job_id: Uuid,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<JobEvent>, QueueError>;

    // ── Artifacts ───────────────────────────────────────────────────

    /// Record metadata for a blob already written to storage.
    async fn insert_artifact(&self, artifact: &JobArtifact) -> Result<(), QueueError>;

    /// Artifacts for a job, oldest first.
    async fn list_artifacts(&self, job_id: Uuid, limit: u32)
    -> Result<Vec<JobArtifact>, QueueError>;

    /// Get one artifact by ID.
    async fn get_artifact(&self, artifact_id: Uuid) -> Result<Option<JobArtifact>, QueueError>;

    // ── Worker tokens ───────────────────────────────────────────────

    /// Persist token metadata with the hash of its raw value.
    async fn insert_worker_token(
        &self,
        token: &WorkerToken,
        token_hash: &str,
    ) -> Result<(), QueueError>;

    /// Look a token up by the hash of its raw value.
    async fn find_worker_token(&self, token_hash: &str)
    -> Result<Option<WorkerToken>, QueueError>;

    /// Tokens newest first.
    async fn list_worker_tokens(&self, limit: u32) -> Result<Vec<WorkerToken>, QueueError>;

    /// Deactivate a token. `None` when the id is unknown.
    async fn revoke_worker_token(&self, id: Uuid) -> Result<Option<WorkerToken>, QueueError>;
}
