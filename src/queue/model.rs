//! Job, event and artifact records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// Leased by a worker.
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Retries exhausted. Needs an operator.
    DeadLetter,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Queued) | (Running, Succeeded) | (Running, Failed) |
            (Running, Cancelled) | (Running, DeadLetter)
        )
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::DeadLetter
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Severity of a job event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    #[default]
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event level: {other}")),
        }
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub affinity_key: Option<String>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Executions so far, including the current one. Starts at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub artifacts_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh queued job from a producer request.
    pub fn new(request: NewJob) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            job_type: request.job_type,
            status: JobStatus::Queued,
            priority: request.priority,
            payload: request.payload,
            affinity_key: request.affinity_key,
            claimed_by: None,
            lease_expires_at: None,
            next_attempt_at: None,
            attempt: 1,
            max_attempts: request.max_attempts,
            cancel_requested_at: None,
            cancel_reason: None,
            result_summary: None,
            error_message: None,
            artifacts_path: Some(id.to_string()),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Capabilities a worker must advertise to claim this job.
    pub fn required_capabilities(&self) -> Vec<String> {
        self.payload
            .get("requiredCapabilities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `payload.repository`, lowercased. Used by worker token policies.
    pub fn repository(&self) -> Option<String> {
        self.payload
            .get("repository")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
    }

    /// True while the job is running and a cancel has been requested.
    pub fn cancel_pending(&self) -> bool {
        self.status == JobStatus::Running && self.cancel_requested_at.is_some()
    }

    /// True when the lease has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }
}

/// Producer request for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub affinity_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: 0,
            affinity_key: None,
            max_attempts: default_max_attempts(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}

fn default_max_attempts() -> u32 {
    3
}

/// List filter for jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<u32>,
}

/// Worker request for the next eligible job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_id: String,
    pub lease_seconds: u32,
    #[serde(default)]
    pub allowed_types: Vec<String>,
    #[serde(default)]
    pub worker_capabilities: Vec<String>,
    /// Only jobs whose `payload.repository` is listed. Empty means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_repositories: Vec<String>,
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>, lease_seconds: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_seconds,
            allowed_types: Vec::new(),
            worker_capabilities: Vec::new(),
            allowed_repositories: Vec::new(),
        }
    }
}

/// Trim, lowercase and dedupe a list of identifiers, dropping blanks.
pub fn normalize_list(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.trim().to_ascii_lowercase();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAction {
    /// Queued job moved straight to cancelled.
    QueuedCancelled,
    /// Running job flagged. The owning worker must acknowledge.
    RunningRequested,
    /// Already terminal, or already requested.
    Noop,
}

/// Result of a job-level failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailAction {
    Requeued,
    DeadLettered,
    Failed,
    Cancelled,
}

/// An append-only job event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Strictly increasing per job.
    pub sequence: i64,
    pub level: EventLevel,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Metadata for a stored artifact blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobArtifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub digest: Option<String>,
    /// Relative to the artifact root.
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}

/// An artifact to upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactUpload {
    pub name: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub digest: Option<String>,
}

impl ArtifactUpload {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            content_type: None,
            digest: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}
