//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. SQLite has no row-level
//! `SKIP LOCKED`, so every mutation runs in a `BEGIN IMMEDIATE` transaction,
//! which takes the database write lock before the first read. Competing
//! writers in other processes wait on `busy_timeout`. Callers in this process
//! share one connection, so every statement (reads included) runs under
//! `conn_gate`. A read never lands inside another caller's open transaction.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::queue::model::{
    CancelAction, ClaimRequest, EventLevel, FailAction, Job, JobArtifact, JobEvent, JobFilter,
    JobStatus,
};
use crate::queue::policy::{LeaseExpiry, RetryPolicy};
use crate::queue::tokens::WorkerToken;
use crate::store::migrations;
use crate::store::traits::{ClaimOutcome, JobStore, ReclaimedJob};

/// Rows scanned per claim batch while matching capabilities.
const CLAIM_BATCH_SIZE: i64 = 200;

/// How long a writer waits for another process's write lock.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// libSQL job store.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    conn_gate: Mutex<()>,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            conn_gate: Mutex::new(()),
        };
        store.pragma("PRAGMA journal_mode = WAL").await?;
        store
            .pragma(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .await?;
        store.run_migrations().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            conn_gate: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// PRAGMAs that report a value must go through `query`.
    async fn pragma(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
        while let Ok(Some(_)) = rows.next().await {}
        Ok(())
    }

    async fn begin_immediate(&self) -> Result<Transaction, QueueError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| QueueError::Unavailable(format!("begin immediate: {e}")))
    }
}

/// Commit on success, roll back on error.
async fn finish<T>(tx: Transaction, result: Result<T, QueueError>) -> Result<T, QueueError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback failed");
            }
            Err(err)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps, so TEXT comparison matches time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Parse a status string from the DB.
fn str_to_status(s: &str) -> JobStatus {
    s.parse().unwrap_or(JobStatus::Queued)
}

fn str_to_level(s: &str) -> EventLevel {
    s.parse().unwrap_or_default()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

const JOB_COLUMNS: &str = "id, type, status, priority, payload, affinity_key, claimed_by, \
    lease_expires_at, next_attempt_at, attempt, max_attempts, cancel_requested_at, \
    cancel_reason, result_summary, error_message, artifacts_path, created_at, updated_at, \
    started_at, finished_at";

const EVENT_COLUMNS: &str = "id, job_id, sequence, level, message, payload, created_at";

const ARTIFACT_COLUMNS: &str =
    "id, job_id, name, content_type, size_bytes, digest, storage_path, created_at";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let payload_str: String = row.get(4)?;
    let attempt: i64 = row.get(9)?;
    let max_attempts: i64 = row.get(10)?;
    let created_str: String = row.get(16)?;
    let updated_str: String = row.get(17)?;

    Ok(Job {
        id: parse_uuid(&id_str),
        job_type: row.get(1)?,
        status: str_to_status(&status_str),
        priority: row.get(3)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        affinity_key: row.get(5).ok(),
        claimed_by: row.get(6).ok(),
        lease_expires_at: parse_optional_datetime(&row.get(7).ok()),
        next_attempt_at: parse_optional_datetime(&row.get(8).ok()),
        attempt: u32::try_from(attempt).unwrap_or(1),
        max_attempts: u32::try_from(max_attempts).unwrap_or(1),
        cancel_requested_at: parse_optional_datetime(&row.get(11).ok()),
        cancel_reason: row.get(12).ok(),
        result_summary: row.get(13).ok(),
        error_message: row.get(14).ok(),
        artifacts_path: row.get(15).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        started_at: parse_optional_datetime(&row.get(18).ok()),
        finished_at: parse_optional_datetime(&row.get(19).ok()),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<JobEvent, libsql::Error> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let level_str: String = row.get(3)?;
    let payload_str: Option<String> = row.get(5).ok();
    let created_str: String = row.get(6)?;

    Ok(JobEvent {
        id: parse_uuid(&id_str),
        job_id: parse_uuid(&job_str),
        sequence: row.get(2)?,
        level: str_to_level(&level_str),
        message: row.get(4)?,
        payload: payload_str.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_artifact(row: &libsql::Row) -> Result<JobArtifact, libsql::Error> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let size: i64 = row.get(4)?;
    let created_str: String = row.get(7)?;

    Ok(JobArtifact {
        id: parse_uuid(&id_str),
        job_id: parse_uuid(&job_str),
        name: row.get(2)?,
        content_type: row.get(3).ok(),
        size_bytes: u64::try_from(size).unwrap_or(0),
        digest: row.get(5).ok(),
        storage_path: row.get(6)?,
        created_at: parse_datetime(&created_str),
    })
}

const TOKEN_COLUMNS: &str = "id, worker_id, description, allowed_repositories, \
    allowed_job_types, capabilities, is_active, created_at, updated_at";

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|r| serde_json::from_str(&r).ok())
        .unwrap_or_default()
}

fn row_to_token(row: &libsql::Row) -> Result<WorkerToken, libsql::Error> {
    let id_str: String = row.get(0)?;
    let active: i64 = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok(WorkerToken {
        id: parse_uuid(&id_str),
        worker_id: row.get(1)?,
        description: row.get(2).ok(),
        allowed_repositories: json_list(row.get(3).ok()),
        allowed_job_types: json_list(row.get(4).ok()),
        capabilities: json_list(row.get(5).ok()),
        is_active: active != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_tokens(mut rows: libsql::Rows, op: &str) -> Result<Vec<WorkerToken>, DatabaseError> {
    let mut tokens = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let token = row_to_token(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                tokens.push(token);
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(tokens)
}

async fn fetch_token(conn: &Connection, id: Uuid) -> Result<Option<WorkerToken>, QueueError> {
    let rows = conn
        .query(
            &format!("SELECT {TOKEN_COLUMNS} FROM agent_worker_tokens WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_worker_token: {e}")))?;
    Ok(collect_tokens(rows, "get_worker_token").await?.into_iter().next())
}

async fn collect_jobs(mut rows: libsql::Rows, op: &str) -> Result<Vec<Job>, DatabaseError> {
    let mut jobs = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                jobs.push(job);
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(jobs)
}

// ── Transaction bodies ──────────────────────────────────────────────

async fn fetch_job(conn: &Connection, id: Uuid) -> Result<Option<Job>, QueueError> {
    let rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;
    Ok(collect_jobs(rows, "get_job").await?.into_iter().next())
}

async fn require_job(conn: &Connection, id: Uuid) -> Result<Job, QueueError> {
    fetch_job(conn, id).await?.ok_or(QueueError::JobNotFound(id))
}

/// Load a job and check that `worker_id` holds its running lease.
async fn require_running_owned(
    conn: &Connection,
    id: Uuid,
    worker_id: &str,
) -> Result<Job, QueueError> {
    let job = require_job(conn, id).await?;
    if job.status != JobStatus::Running {
        return Err(QueueError::InvalidState {
            id,
            status: job.status.to_string(),
            expected: JobStatus::Running.to_string(),
        });
    }
    if job.claimed_by.as_deref() != Some(worker_id) {
        return Err(QueueError::Ownership {
            id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(job)
}

/// Move a job to a terminal status, clearing claim and lease.
async fn finish_job(
    conn: &Connection,
    id: Uuid,
    status: JobStatus,
    now: DateTime<Utc>,
    error_message: Option<&str>,
    result_summary: Option<&str>,
) -> Result<(), QueueError> {
    conn.execute(
        "UPDATE agent_jobs SET status = ?2, claimed_by = NULL, lease_expires_at = NULL, \
         next_attempt_at = NULL, finished_at = ?3, updated_at = ?3, \
         error_message = COALESCE(?4, error_message), \
         result_summary = COALESCE(?5, result_summary) \
         WHERE id = ?1",
        params![
            id.to_string(),
            status.as_str(),
            fmt_ts(now),
            opt_text(error_message),
            opt_text(result_summary),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("finish_job: {e}")))?;
    Ok(())
}

/// Put a running job back in the queue under a new attempt number.
async fn requeue_job(
    conn: &Connection,
    id: Uuid,
    attempt: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    error_message: Option<&str>,
) -> Result<(), QueueError> {
    conn.execute(
        "UPDATE agent_jobs SET status = 'queued', claimed_by = NULL, lease_expires_at = NULL, \
         attempt = ?2, next_attempt_at = ?3, updated_at = ?4, \
         error_message = COALESCE(?5, error_message) \
         WHERE id = ?1",
        params![
            id.to_string(),
            i64::from(attempt),
            opt_ts(next_attempt_at),
            fmt_ts(now),
            opt_text(error_message),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("requeue_job: {e}")))?;
    Ok(())
}

/// Sweep running jobs whose lease ran out.
async fn reclaim_expired(
    conn: &Connection,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<ReclaimedJob>, QueueError> {
    let rows = conn
        .query(
            &format!(
                "SELECT {JOB_COLUMNS} FROM agent_jobs \
                 WHERE status = 'running' AND lease_expires_at IS NOT NULL \
                 AND lease_expires_at < ?1"
            ),
            params![fmt_ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("reclaim_expired: {e}")))?;
    let expired = collect_jobs(rows, "reclaim_expired").await?;

    let mut reclaimed = Vec::with_capacity(expired.len());
    for job in expired {
        match policy.on_lease_expired(&job, now) {
            LeaseExpiry::Cancel => {
                finish_job(conn, job.id, JobStatus::Cancelled, now, None, None).await?;
            }
            LeaseExpiry::DeadLetter { error_message } => {
                finish_job(
                    conn,
                    job.id,
                    JobStatus::DeadLetter,
                    now,
                    Some(&error_message),
                    None,
                )
                .await?;
            }
            LeaseExpiry::Requeue {
                attempt,
                next_attempt_at,
            } => {
                requeue_job(conn, job.id, attempt, next_attempt_at, now, None).await?;
            }
        }
        let previous_owner = job.claimed_by.clone();
        let updated = require_job(conn, job.id).await?;
        warn!(
            job_id = %updated.id,
            previous_owner = previous_owner.as_deref().unwrap_or("-"),
            status = %updated.status,
            "Reclaimed expired lease"
        );
        reclaimed.push(ReclaimedJob {
            job: updated,
            previous_owner,
        });
    }
    Ok(reclaimed)
}

/// Find the first queued job this worker may take.
async fn select_candidate(
    conn: &Connection,
    request: &ClaimRequest,
    now: DateTime<Utc>,
) -> Result<Option<Job>, QueueError> {
    let capabilities: HashSet<String> = request
        .worker_capabilities
        .iter()
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    let repositories: HashSet<String> = request
        .allowed_repositories
        .iter()
        .map(|r| r.trim().to_ascii_lowercase())
        .filter(|r| !r.is_empty())
        .collect();

    let mut sql = format!(
        "SELECT {JOB_COLUMNS} FROM agent_jobs WHERE status = 'queued' \
         AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)"
    );
    let mut values = vec![libsql::Value::Text(fmt_ts(now))];
    if !request.allowed_types.is_empty() {
        let placeholders: Vec<String> = request
            .allowed_types
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect();
        sql.push_str(&format!(" AND type IN ({})", placeholders.join(", ")));
        values.extend(
            request
                .allowed_types
                .iter()
                .map(|t| libsql::Value::Text(t.clone())),
        );
    }
    sql.push_str(&format!(
        " ORDER BY priority DESC, created_at ASC, id ASC LIMIT {CLAIM_BATCH_SIZE} OFFSET ?{}",
        values.len() + 1
    ));

    let mut offset: i64 = 0;
    loop {
        let mut batch_values = values.clone();
        batch_values.push(libsql::Value::Integer(offset));
        let rows = conn
            .query(&sql, libsql::params::Params::Positional(batch_values))
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job select: {e}")))?;
        let batch = collect_jobs(rows, "claim_job select").await?;
        if batch.is_empty() {
            return Ok(None);
        }
        let batch_len = batch.len() as i64;
        if let Some(job) = batch.into_iter().find(|job| {
            let repository_allowed = repositories.is_empty()
                || job
                    .repository()
                    .is_some_and(|repo| repositories.contains(&repo));
            repository_allowed
                && job
                    .required_capabilities()
                    .iter()
                    .all(|cap| capabilities.contains(cap))
        }) {
            return Ok(Some(job));
        }
        if batch_len < CLAIM_BATCH_SIZE {
            return Ok(None);
        }
        offset += CLAIM_BATCH_SIZE;
    }
}

async fn claim_in_tx(
    conn: &Connection,
    request: &ClaimRequest,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, QueueError> {
    let reclaimed = reclaim_expired(conn, policy, now).await?;

    let Some(candidate) = select_candidate(conn, request, now).await? else {
        return Ok(ClaimOutcome {
            job: None,
            reclaimed,
        });
    };

    let lease_expires_at = now + chrono::Duration::seconds(i64::from(request.lease_seconds));
    let changed = conn
        .execute(
            "UPDATE agent_jobs SET status = 'running', claimed_by = ?2, lease_expires_at = ?3, \
             next_attempt_at = NULL, started_at = COALESCE(started_at, ?4), updated_at = ?4 \
             WHERE id = ?1 AND status = 'queued'",
            params![
                candidate.id.to_string(),
                request.worker_id.as_str(),
                fmt_ts(lease_expires_at),
                fmt_ts(now),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_job update: {e}")))?;

    if changed != 1 {
        return Ok(ClaimOutcome {
            job: None,
            reclaimed,
        });
    }

    let job = require_job(conn, candidate.id).await?;
    Ok(ClaimOutcome {
        job: Some(job),
        reclaimed,
    })
}

async fn next_sequence(conn: &Connection, job_id: Uuid) -> Result<i64, QueueError> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM agent_job_events WHERE job_id = ?1",
            params![job_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("next_sequence: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("next_sequence row: {e}")))?),
        Ok(None) => Ok(1),
        Err(e) => Err(DatabaseError::Query(format!("next_sequence: {e}")).into()),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;

        let _gate = self.conn_gate.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO agent_jobs ({JOB_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.priority,
                    payload,
                    opt_text(job.affinity_key.as_deref()),
                    opt_text(job.claimed_by.as_deref()),
                    opt_ts(job.lease_expires_at),
                    opt_ts(job.next_attempt_at),
                    i64::from(job.attempt),
                    i64::from(job.max_attempts),
                    opt_ts(job.cancel_requested_at),
                    opt_text(job.cancel_reason.as_deref()),
                    opt_text(job.result_summary.as_deref()),
                    opt_text(job.error_message.as_deref()),
                    opt_text(job.artifacts_path.as_deref()),
                    fmt_ts(job.created_at),
                    fmt_ts(job.updated_at),
                    opt_ts(job.started_at),
                    opt_ts(job.finished_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        fetch_job(self.conn(), id).await
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: u32) -> Result<Vec<Job>, QueueError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(job_type) = &filter.job_type {
            values.push(libsql::Value::Text(job_type.clone()));
            clauses.push(format!("type = ?{}", values.len()));
        }
        values.push(libsql::Value::Integer(i64::from(limit)));
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM agent_jobs{where_sql} \
             ORDER BY created_at DESC, id DESC LIMIT ?{}",
            values.len()
        );
        let _gate = self.conn_gate.lock().await;
        let rows = self
            .conn()
            .query(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;
        Ok(collect_jobs(rows, "list_jobs").await?)
    }

    async fn claim_job(
        &self,
        request: &ClaimRequest,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result = claim_in_tx(&tx, request, policy, now).await;
        let outcome = finish(tx, result).await?;
        if let Some(job) = &outcome.job {
            debug!(job_id = %job.id, worker_id = %request.worker_id, attempt = job.attempt, "Job claimed");
        }
        Ok(outcome)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease_seconds: u32,
    ) -> Result<Job, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            require_running_owned(&tx, id, worker_id).await?;
            let now = Utc::now();
            let lease_expires_at = now + chrono::Duration::seconds(i64::from(lease_seconds));
            tx.execute(
                "UPDATE agent_jobs SET lease_expires_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), fmt_ts(lease_expires_at), fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("heartbeat: {e}")))?;
            require_job(&tx, id).await
        }
        .await;
        finish(tx, result).await
    }

    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: &str,
        result_summary: Option<&str>,
    ) -> Result<Job, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            require_running_owned(&tx, id, worker_id).await?;
            finish_job(&tx, id, JobStatus::Succeeded, Utc::now(), None, result_summary).await?;
            require_job(&tx, id).await
        }
        .await;
        finish(tx, result).await
    }

    async fn fail_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<(Job, FailAction), QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            let job = require_running_owned(&tx, id, worker_id).await?;
            let now = Utc::now();
            let decision = policy.on_failure(&job, retryable, now);
            match decision.action {
                FailAction::Requeued => {
                    requeue_job(
                        &tx,
                        id,
                        decision.attempt,
                        decision.next_attempt_at,
                        now,
                        Some(error_message),
                    )
                    .await?;
                }
                FailAction::DeadLettered => {
                    finish_job(&tx, id, JobStatus::DeadLetter, now, Some(error_message), None)
                        .await?;
                }
                FailAction::Failed => {
                    finish_job(&tx, id, JobStatus::Failed, now, Some(error_message), None).await?;
                }
                FailAction::Cancelled => {
                    finish_job(&tx, id, JobStatus::Cancelled, now, Some(error_message), None)
                        .await?;
                }
            }
            Ok((require_job(&tx, id).await?, decision.action))
        }
        .await;
        finish(tx, result).await
    }

    async fn request_cancel(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<(Job, CancelAction), QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            let job = require_job(&tx, id).await?;
            let now = Utc::now();
            let action = match job.status {
                status if status.is_terminal() => CancelAction::Noop,
                JobStatus::Running if job.cancel_requested_at.is_some() => CancelAction::Noop,
                JobStatus::Queued => {
                    tx.execute(
                        "UPDATE agent_jobs SET cancel_requested_at = ?2, cancel_reason = ?3 \
                         WHERE id = ?1",
                        params![id.to_string(), fmt_ts(now), opt_text(reason)],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("request_cancel: {e}")))?;
                    finish_job(&tx, id, JobStatus::Cancelled, now, None, None).await?;
                    CancelAction::QueuedCancelled
                }
                _ => {
                    tx.execute(
                        "UPDATE agent_jobs SET cancel_requested_at = ?2, cancel_reason = ?3, \
                         updated_at = ?2 WHERE id = ?1",
                        params![id.to_string(), fmt_ts(now), opt_text(reason)],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("request_cancel: {e}")))?;
                    CancelAction::RunningRequested
                }
            };
            Ok((require_job(&tx, id).await?, action))
        }
        .await;
        finish(tx, result).await
    }

    /// Already cancelled is a no-op. Otherwise the job must be running, owned
    /// by `worker_id` and have a pending cancel request.
    async fn ack_cancel(&self, id: Uuid, worker_id: &str) -> Result<(Job, bool), QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            let job = require_job(&tx, id).await?;
            if job.status == JobStatus::Cancelled {
                return Ok((job, false));
            }
            let job = require_running_owned(&tx, id, worker_id).await?;
            if job.cancel_requested_at.is_none() {
                return Err(QueueError::InvalidState {
                    id,
                    status: job.status.to_string(),
                    expected: "cancellation requested".to_string(),
                });
            }
            finish_job(&tx, id, JobStatus::Cancelled, Utc::now(), None, None).await?;
            Ok((require_job(&tx, id).await?, true))
        }
        .await;
        finish(tx, result).await
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Job, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            let job = require_job(&tx, id).await?;
            if job.status.is_terminal() {
                return Err(QueueError::InvalidState {
                    id,
                    status: job.status.to_string(),
                    expected: "queued or running".to_string(),
                });
            }
            let mut payload = job.payload;
            if let Some(map) = payload.as_object_mut() {
                let control = map
                    .entry("liveControl")
                    .or_insert_with(|| serde_json::json!({}));
                if !control.is_object() {
                    *control = serde_json::json!({});
                }
                control["paused"] = serde_json::Value::Bool(paused);
            }
            let payload = serde_json::to_string(&payload)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            tx.execute(
                "UPDATE agent_jobs SET payload = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), payload, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_paused: {e}")))?;
            require_job(&tx, id).await
        }
        .await;
        finish(tx, result).await
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(
        &self,
        job_id: Uuid,
        level: EventLevel,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<JobEvent, QueueError> {
        let payload_json = payload
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("event payload: {e}")))?;

        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            require_job(&tx, job_id).await?;
            let event = JobEvent {
                id: Uuid::new_v4(),
                job_id,
                sequence: next_sequence(&tx, job_id).await?,
                level,
                message: message.to_string(),
                payload: payload.cloned(),
                created_at: Utc::now(),
            };
            tx.execute(
                &format!(
                    "INSERT INTO agent_job_events ({EVENT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    event.id.to_string(),
                    job_id.to_string(),
                    event.sequence,
                    level.as_str(),
                    event.message.as_str(),
                    opt_text(payload_json.as_deref()),
                    fmt_ts(event.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
            Ok(event)
        }
        .await;
        finish(tx, result).await
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<JobEvent>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM agent_job_events \
                     WHERE job_id = ?1 AND sequence > ?2 ORDER BY sequence ASC LIMIT ?3"
                ),
                params![job_id.to_string(), after.unwrap_or(0), i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let event = row_to_event(&row)
                        .map_err(|e| DatabaseError::Query(format!("list_events row parse: {e}")))?;
                    events.push(event);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_events: {e}")).into()),
            }
        }
        Ok(events)
    }

    // ── Artifacts ───────────────────────────────────────────────────

    async fn insert_artifact(&self, artifact: &JobArtifact) -> Result<(), QueueError> {
        let _gate = self.conn_gate.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO agent_job_artifacts ({ARTIFACT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    artifact.id.to_string(),
                    artifact.job_id.to_string(),
                    artifact.name.as_str(),
                    opt_text(artifact.content_type.as_deref()),
                    i64::try_from(artifact.size_bytes).unwrap_or(i64::MAX),
                    opt_text(artifact.digest.as_deref()),
                    artifact.storage_path.as_str(),
                    fmt_ts(artifact.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_artifact: {e}")))?;
        debug!(job_id = %artifact.job_id, artifact_id = %artifact.id, name = %artifact.name, "Artifact recorded");
        Ok(())
    }

    async fn list_artifacts(
        &self,
        job_id: Uuid,
        limit: u32,
    ) -> Result<Vec<JobArtifact>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM agent_job_artifacts \
                     WHERE job_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2"
                ),
                params![job_id.to_string(), i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_artifacts: {e}")))?;

        let mut artifacts = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let artifact = row_to_artifact(&row).map_err(|e| {
                        DatabaseError::Query(format!("list_artifacts row parse: {e}"))
                    })?;
                    artifacts.push(artifact);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_artifacts: {e}")).into()),
            }
        }
        Ok(artifacts)
    }

    async fn get_artifact(&self, artifact_id: Uuid) -> Result<Option<JobArtifact>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM agent_job_artifacts WHERE id = ?1"),
                params![artifact_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_artifact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let artifact = row_to_artifact(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_artifact row parse: {e}")))?;
                Ok(Some(artifact))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_artifact: {e}")).into()),
        }
    }

    // ── Worker tokens ───────────────────────────────────────────────

    async fn insert_worker_token(
        &self,
        token: &WorkerToken,
        token_hash: &str,
    ) -> Result<(), QueueError> {
        let list = |items: &[String]| {
            serde_json::to_string(items)
                .map_err(|e| DatabaseError::Serialization(format!("worker token list: {e}")))
        };
        let repositories = list(&token.allowed_repositories)?;
        let job_types = list(&token.allowed_job_types)?;
        let capabilities = list(&token.capabilities)?;

        let _gate = self.conn_gate.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO agent_worker_tokens ({TOKEN_COLUMNS}, token_hash) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    token.id.to_string(),
                    token.worker_id.as_str(),
                    opt_text(token.description.as_deref()),
                    repositories,
                    job_types,
                    capabilities,
                    i64::from(token.is_active),
                    fmt_ts(token.created_at),
                    fmt_ts(token.updated_at),
                    token_hash,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_worker_token: {e}")))?;
        debug!(token_id = %token.id, worker_id = %token.worker_id, "Worker token stored");
        Ok(())
    }

    async fn find_worker_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<WorkerToken>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {TOKEN_COLUMNS} FROM agent_worker_tokens WHERE token_hash = ?1"),
                params![token_hash],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_worker_token: {e}")))?;
        Ok(collect_tokens(rows, "find_worker_token").await?.into_iter().next())
    }

    async fn list_worker_tokens(&self, limit: u32) -> Result<Vec<WorkerToken>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM agent_worker_tokens \
                     ORDER BY created_at DESC, id DESC LIMIT ?1"
                ),
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_worker_tokens: {e}")))?;
        Ok(collect_tokens(rows, "list_worker_tokens").await?)
    }

    async fn revoke_worker_token(&self, id: Uuid) -> Result<Option<WorkerToken>, QueueError> {
        let _gate = self.conn_gate.lock().await;
        let tx = self.begin_immediate().await?;
        let result: Result<_, QueueError> = async {
            tx.execute(
                "UPDATE agent_worker_tokens SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("revoke_worker_token: {e}")))?;
            fetch_token(&tx, id).await
        }
        .await;
        finish(tx, result).await
    }
}
