//! Job lifecycle: model, transition policy and the validated service.

pub mod model;
pub mod policy;
pub mod service;
pub mod tokens;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;

pub use model::{
    ArtifactUpload, CancelAction, ClaimRequest, EventLevel, FailAction, Job, JobArtifact,
    JobEvent, JobFilter, JobStatus, NewJob,
};
pub use policy::RetryPolicy;
pub use service::QueueService;
pub use tokens::{NewWorkerToken, WorkerPolicy, WorkerToken};

/// Transport-agnostic job lifecycle surface.
///
/// Implemented in-process by [`QueueService`] and over HTTP by
/// [`crate::client::HttpQueueClient`]. Workers only depend on this trait.
#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn create_job(&self, request: NewJob) -> Result<Job, QueueError>;

    async fn get_job(&self, id: Uuid) -> Result<Job, QueueError>;

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, QueueError>;

    /// Lease the next eligible job, if any.
    async fn claim(&self, request: ClaimRequest) -> Result<Option<Job>, QueueError>;

    /// Renew a lease. The returned job echoes `cancel_requested_at`.
    async fn heartbeat(&self, id: Uuid, worker_id: &str, lease_seconds: u32)
    -> Result<Job, QueueError>;

    /// Upload `artifacts`, then mark the job succeeded.
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result_summary: Option<String>,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<Job, QueueError>;

    /// Upload `artifacts`, then report a failure.
    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
        artifacts: Vec<ArtifactUpload>,
    ) -> Result<Job, QueueError>;

    async fn request_cancel(&self, id: Uuid, reason: Option<String>) -> Result<Job, QueueError>;

    async fn ack_cancel(
        &self,
        id: Uuid,
        worker_id: &str,
        message: Option<String>,
    ) -> Result<Job, QueueError>;

    /// Pause or resume a job at its next stage or step boundary.
    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Job, QueueError>;

    async fn append_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<JobEvent, QueueError>;

    async fn list_events(
        &self,
        job_id: Uuid,
        after: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<JobEvent>, QueueError>;

    /// Store a blob. With `worker_id`, the worker must hold the job's lease.
    async fn upload_artifact(
        &self,
        job_id: Uuid,
        upload: ArtifactUpload,
        worker_id: Option<&str>,
    ) -> Result<JobArtifact, QueueError>;

    async fn list_artifacts(
        &self,
        job_id: Uuid,
        limit: Option<u32>,
    ) -> Result<Vec<JobArtifact>, QueueError>;

    async fn download_artifact(
        &self,
        job_id: Uuid,
        artifact_id: Uuid,
    ) -> Result<(JobArtifact, Vec<u8>), QueueError>;
}
