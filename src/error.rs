//! Error types for the agent queue.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the queue and its workers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Self-heal error: {0}")]
    SelfHeal(#[from] SelfHealError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the job lifecycle surface.
///
/// Every variant maps to exactly one HTTP status in the API layer and back
/// again in the HTTP client, so remote and local callers see the same kinds.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job {0} was not found")]
    JobNotFound(Uuid),

    #[error("Artifact {artifact_id} was not found for job {job_id}")]
    ArtifactNotFound { job_id: Uuid, artifact_id: Uuid },

    #[error("Job {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: String,
        expected: String,
    },

    #[error("Worker {worker_id} does not own job {id}")]
    Ownership { id: Uuid, worker_id: String },

    #[error("Worker token {0} was not found")]
    TokenNotFound(Uuid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl QueueError {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::JobNotFound(_) | Self::ArtifactNotFound { .. } | Self::TokenNotFound(_) => {
                "not_found"
            }
            Self::InvalidState { .. } => "invalid_state",
            Self::Ownership { .. } => "ownership",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Unavailable(_) | Self::Database(_) => "unavailable",
            Self::Storage(StorageError::InvalidPath(_))
            | Self::Storage(StorageError::TooLarge { .. })
            | Self::Storage(StorageError::Empty)
            | Self::Storage(StorageError::ContentTypeNotAllowed(_)) => "validation",
            Self::Storage(_) => "unavailable",
        }
    }
}

/// Artifact blob storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("Artifact exceeds max bytes: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Artifact content is empty")]
    Empty,

    #[error("Content type not allowed: {0}")]
    ContentTypeNotAllowed(String),

    #[error("Artifact file missing: {0}")]
    Missing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Step executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No executor registered for runtime {0}")]
    UnknownRuntime(String),

    #[error("Step {step_id} timed out after {timeout:?}")]
    Timeout { step_id: String, timeout: Duration },

    #[error("Step {step_id} produced no output for {timeout:?}")]
    IdleTimeout { step_id: String, timeout: Duration },

    #[error("Step {step_id} failed to start: {reason}")]
    SpawnFailed { step_id: String, reason: String },

    #[error("Step {step_id} was interrupted: {reason}")]
    Interrupted { step_id: String, reason: String },

    #[error("Replay failed: {0}")]
    Replay(String),
}

/// Self-heal budget errors.
#[derive(Debug, thiserror::Error)]
pub enum SelfHealError {
    #[error("Attempt budget exhausted for step {step_id} (max={max})")]
    AttemptBudgetExceeded { step_id: String, max: u32 },

    #[error("Hard reset budget exhausted (max={max})")]
    HardResetBudgetExceeded { max: u32 },

    #[error("No active step")]
    NoActiveStep,
}

/// Job workspace errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP surface errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queue(e) => e.kind(),
            Self::BadRequest(_) => "validation",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// Result type alias for the agent queue.
pub type Result<T> = std::result::Result<T, Error>;
