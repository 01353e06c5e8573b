//! Worker token administration.
//!
//! These routes need the operator credential. A caller holding only a worker
//! token is refused.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use secrecy::ExposeSecret;
use uuid::Uuid;

use super::ApiState;
use super::jobs::{ApiResult, body, path, query};
use super::types::{IssuedWorkerToken, PageQuery};
use crate::error::QueueError;
use crate::queue::tokens::{NewWorkerToken, WorkerPolicy, WorkerToken};

fn operator_only(policy: Option<Extension<WorkerPolicy>>) -> ApiResult<()> {
    match policy {
        Some(_) => Err(QueueError::Forbidden(
            "worker tokens cannot manage worker tokens".into(),
        )
        .into()),
        None => Ok(()),
    }
}

/// POST /api/queue/workers/tokens
pub async fn issue_token(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    payload: Result<Json<NewWorkerToken>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<IssuedWorkerToken>)> {
    operator_only(policy)?;
    let (worker_token, raw) = state.service.issue_worker_token(body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(IssuedWorkerToken {
            token: raw.expose_secret().to_string(),
            worker_token,
        }),
    ))
}

/// GET /api/queue/workers/tokens?limit
pub async fn list_tokens(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<WorkerToken>>> {
    operator_only(policy)?;
    let params = query(params)?;
    Ok(Json(state.service.list_worker_tokens(params.limit).await?))
}

/// POST /api/queue/workers/tokens/{id}/revoke
pub async fn revoke_token(
    State(state): State<ApiState>,
    policy: Option<Extension<WorkerPolicy>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<WorkerToken>> {
    operator_only(policy)?;
    Ok(Json(state.service.revoke_worker_token(path(id)?).await?))
}
