//! REST handlers for jobs, events and artifacts.

use axum::{Extension, Json};
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::ApiState;
use super::types::{
    AckCancelRequest, AppendEventRequest, CancelRequest, ClaimResponse, CompleteRequest,
    ControlRequest, EventsPage, FailRequest, HeartbeatRequest, ListJobsQuery, PageQuery,
    UploadQuery,
};
use crate::error::ApiError;
use crate::ledger::events::next_cursor;
use crate::queue::QueueApi;
use crate::queue::model::{
    ArtifactUpload, ClaimRequest, Job, JobArtifact, JobEvent, JobFilter, JobStatus, NewJob,
};
use crate::queue::tokens::WorkerPolicy;

pub(super) type ApiResult<T> = Result<T, ApiError>;

pub(super) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

pub(super) fn query<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    params
        .map(|Query(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

pub(super) fn path<T>(params: Result<Path<T>, PathRejection>) -> ApiResult<T> {
    params
        .map(|Path(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// Parse an optional JSON body. Empty means the default.
fn optional_body<T: DeserializeOwned + Default>(raw: &Bytes) -> ApiResult<T> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Under a worker token, the caller may only act as the token's worker.
fn acting_as(policy: &Option<Extension<WorkerPolicy>>, worker_id: &str) -> ApiResult<()> {
    if let Some(Extension(policy)) = policy {
        policy.ensure_worker(worker_id)?;
    }
    Ok(())
}

// ── Jobs ────────────────────────────────────────────────────────────────

/// POST /api/queue/jobs
pub async fn create_job(
    State(state): State<ApiState>,
    payload: Result<Json<NewJob>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state.service.create_job(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/queue/jobs?status&type&limit
pub async fn list_jobs(
    State(state): State<ApiState>,
    params: Result<Query<ListJobsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Job>>> {
    let params = query(params)?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let jobs = state
        .service
        .list_jobs(JobFilter {
            status,
            job_type: params.job_type,
            limit: params.limit,
        })
        .await?;
    Ok(Json(jobs))
}

/// GET /api/queue/jobs/{id}
pub async fn get_job(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.service.get_job(path(id)?).await?))
}

/// POST /api/queue/jobs/claim
///
/// Under a worker token the request is narrowed to the token's policy.
pub async fn claim(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> ApiResult<Json<ClaimResponse>> {
    let mut request = body(payload)?;
    if let Some(Extension(policy)) = &policy {
        request = policy.apply(request)?;
    }
    let job = state.service.claim(request).await?;
    Ok(Json(ClaimResponse { job }))
}

/// POST /api/queue/jobs/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let request = body(payload)?;
    acting_as(&policy, &request.worker_id)?;
    let job = state
        .service
        .heartbeat(path(id)?, &request.worker_id, request.lease_seconds)
        .await?;
    Ok(Json(job))
}

/// POST /api/queue/jobs/{id}/complete
pub async fn complete(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let request = body(payload)?;
    acting_as(&policy, &request.worker_id)?;
    let job = state
        .service
        .complete(
            path(id)?,
            &request.worker_id,
            request.result_summary,
            Vec::new(),
        )
        .await?;
    Ok(Json(job))
}

/// POST /api/queue/jobs/{id}/fail
pub async fn fail(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let request = body(payload)?;
    acting_as(&policy, &request.worker_id)?;
    let job = state
        .service
        .fail(
            path(id)?,
            &request.worker_id,
            &request.error_message,
            request.retryable,
            Vec::new(),
        )
        .await?;
    Ok(Json(job))
}

/// POST /api/queue/jobs/{id}/cancel
///
/// The body is optional.
pub async fn request_cancel(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
    raw: Bytes,
) -> ApiResult<Json<Job>> {
    let request: CancelRequest = optional_body(&raw)?;
    let job = state
        .service
        .request_cancel(path(id)?, request.reason)
        .await?;
    Ok(Json(job))
}

/// POST /api/queue/jobs/{id}/cancel/ack
pub async fn ack_cancel(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AckCancelRequest>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let request = body(payload)?;
    acting_as(&policy, &request.worker_id)?;
    let job = state
        .service
        .ack_cancel(path(id)?, &request.worker_id, request.message)
        .await?;
    Ok(Json(job))
}

/// POST /api/queue/jobs/{id}/control
pub async fn set_control(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ControlRequest>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let request = body(payload)?;
    let job = state.service.set_paused(path(id)?, request.paused).await?;
    Ok(Json(job))
}

// ── Events ──────────────────────────────────────────────────────────────

/// POST /api/queue/jobs/{id}/events
pub async fn append_event(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AppendEventRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobEvent>)> {
    let request = body(payload)?;
    let event = state
        .service
        .append_event(path(id)?, request.level, &request.message, request.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// GET /api/queue/jobs/{id}/events?after&limit
pub async fn list_events(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<EventsPage>> {
    let params = query(params)?;
    let events = state
        .service
        .list_events(path(id)?, params.after, params.limit)
        .await?;
    let next_after = next_cursor(&events, params.after);
    Ok(Json(EventsPage { events, next_after }))
}

// ── Artifacts ───────────────────────────────────────────────────────────

/// POST /api/queue/jobs/{id}/artifacts?name&contentType&digest&workerId
///
/// The request body is the raw artifact content. Under a worker token the
/// upload is always checked against the token's worker.
pub async fn upload_artifact(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<UploadQuery>, QueryRejection>,
    content: Bytes,
) -> ApiResult<(StatusCode, Json<JobArtifact>)> {
    let mut params = query(params)?;
    if let Some(Extension(policy)) = &policy {
        let worker_id = params
            .worker_id
            .take()
            .unwrap_or_else(|| policy.worker_id.clone());
        policy.ensure_worker(&worker_id)?;
        params.worker_id = Some(worker_id);
    }
    let upload = ArtifactUpload {
        name: params.name,
        content: content.to_vec(),
        content_type: params.content_type,
        digest: params.digest,
    };
    let artifact = state
        .service
        .upload_artifact(path(id)?, upload, params.worker_id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

/// GET /api/queue/jobs/{id}/artifacts?limit
pub async fn list_artifacts(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<JobArtifact>>> {
    let params = query(params)?;
    let artifacts = state
        .service
        .list_artifacts(path(id)?, params.limit)
        .await?;
    Ok(Json(artifacts))
}

/// GET /api/queue/jobs/{id}/artifacts/{artifact_id}
pub async fn download_artifact(
    State(state): State<ApiState>,
    ids: Result<Path<(Uuid, Uuid)>, PathRejection>,
) -> ApiResult<Response> {
    let (job_id, artifact_id) = path(ids)?;
    let (artifact, content) = state
        .service
        .download_artifact(job_id, artifact_id)
        .await?;
    let content_type = artifact
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    Ok(([(header::CONTENT_TYPE, content_type)], content).into_response())
}
