//! HTTP surface for the queue (axum).

mod jobs;
pub mod types;
mod workers;
mod ws;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, QueueError};
use crate::queue::QueueService;
use types::ErrorBody;

/// Header carrying a worker token.
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

/// Default request body cap for artifact uploads.
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Shared state for queue routes.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<QueueService>,
    /// Operator bearer token for `/api` routes. `None` disables the check.
    /// Requests presenting a worker token are authorized by that instead.
    pub api_token: Option<SecretString>,
    /// Largest upload body accepted before the artifact checks run.
    pub max_upload_bytes: usize,
}

impl ApiState {
    pub fn new(service: Arc<QueueService>) -> Self {
        Self {
            service,
            api_token: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max: usize) -> Self {
        self.max_upload_bytes = max;
        self
    }

    pub fn with_api_token(mut self, token: Option<SecretString>) -> Self {
        self.api_token = token;
        self
    }
}

/// Build the queue REST and WebSocket routes.
pub fn queue_routes(state: ApiState) -> Router {
    // One byte over the cap so oversized uploads reach the artifact checks.
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes.saturating_add(1));
    let api = Router::new()
        .route("/api/queue/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/api/queue/jobs/claim", post(jobs::claim))
        .route("/api/queue/jobs/{id}", get(jobs::get_job))
        .route("/api/queue/jobs/{id}/heartbeat", post(jobs::heartbeat))
        .route("/api/queue/jobs/{id}/complete", post(jobs::complete))
        .route("/api/queue/jobs/{id}/fail", post(jobs::fail))
        .route("/api/queue/jobs/{id}/cancel", post(jobs::request_cancel))
        .route("/api/queue/jobs/{id}/cancel/ack", post(jobs::ack_cancel))
        .route("/api/queue/jobs/{id}/control", post(jobs::set_control))
        .route(
            "/api/queue/jobs/{id}/events",
            post(jobs::append_event).get(jobs::list_events),
        )
        .route("/api/queue/jobs/{id}/events/ws", get(ws::events_ws))
        .route(
            "/api/queue/workers/tokens",
            post(workers::issue_token).get(workers::list_tokens),
        )
        .route(
            "/api/queue/workers/tokens/{id}/revoke",
            post(workers::revoke_token),
        )
        .route(
            "/api/queue/jobs/{id}/artifacts",
            post(jobs::upload_artifact)
                .layer(upload_limit)
                .get(jobs::list_artifacts),
        )
        .route(
            "/api/queue/jobs/{id}/artifacts/{artifact_id}",
            get(jobs::download_artifact),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-queue"
    }))
}

// ── Auth ────────────────────────────────────────────────────────────────

/// A worker token, when presented, is resolved to its policy and attached
/// to the request. Otherwise the operator bearer token must match.
async fn require_token(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let worker_token = request
        .headers()
        .get(WORKER_TOKEN_HEADER)
        .map(|v| v.to_str().map(str::to_string));
    if let Some(raw) = worker_token {
        let raw = raw.map_err(|_| QueueError::Unauthorized("invalid worker token".into()))?;
        let policy = state.service.resolve_worker_token(&raw).await?;
        request.extensions_mut().insert(policy);
        return Ok(next.run(request).await);
    }

    if let Some(expected) = &state.api_token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if !provided.is_some_and(|p| tokens_match(p, expected.expose_secret())) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// Constant-time comparison over the sha256 digests of both values.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

// ── Errors ──────────────────────────────────────────────────────────────

/// HTTP status for an error kind. The client maps statuses back to kinds.
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "validation" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "ownership" | "forbidden" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_state" => StatusCode::CONFLICT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for_kind(kind);
        if status.is_server_error() {
            tracing::error!(error = %self, "Queue request failed");
        } else {
            tracing::debug!(error = %self, kind, "Queue request rejected");
        }

        let mut body = ErrorBody {
            error: self.to_string(),
            kind: kind.to_string(),
            status: None,
            expected: None,
            worker_id: None,
        };
        match &self {
            ApiError::Queue(QueueError::InvalidState {
                status, expected, ..
            }) => {
                body.status = Some(status.clone());
                body.expected = Some(expected.clone());
            }
            ApiError::Queue(QueueError::Ownership { worker_id, .. }) => {
                body.worker_id = Some(worker_id.clone());
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use super::*;
    use crate::ledger::ArtifactStorage;
    use crate::queue::RetryPolicy;
    use crate::safety::SecretRedactor;
    use crate::store::{JobStore, LibSqlJobStore};

    async fn router(dir: &std::path::Path, token: Option<&str>) -> Router {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let service = Arc::new(QueueService::new(
            store,
            ArtifactStorage::new(dir.join("artifacts"), 1024, vec![]),
            Arc::new(SecretRedactor::new()),
            RetryPolicy::default(),
        ));
        queue_routes(
            ApiState::new(service).with_api_token(token.map(|t| SecretString::from(t.to_string()))),
        )
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), None).await;

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/queue/jobs")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"type":"task","payload":{"runtime":"shell"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job = json_body(response).await;
        assert_eq!(job["status"], "queued");

        let id = job["id"].as_str().unwrap();
        let response = app
            .oneshot(HttpRequest::get(format!("/api/queue/jobs/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["type"], "task");
    }

    #[tokio::test]
    async fn malformed_id_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), None).await;
        let response = app
            .oneshot(HttpRequest::get("/api/queue/jobs/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "validation");
    }

    #[tokio::test]
    async fn token_guards_api_but_not_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), Some("s3cret")).await;

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/api/queue/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["kind"], "unauthorized");

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/api/queue/jobs")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_must_match_exactly() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("s3cretX", "s3cret"));
        assert!(!tokens_match("", "s3cret"));

        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), Some("s3cret")).await;
        for bearer in ["Bearer s3cre", "Bearer s3cretX", "Bearer S3CRET", "s3cret"] {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::get("/api/queue/jobs")
                        .header(header::AUTHORIZATION, bearer)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{bearer}");
        }
    }

    fn operator(method: &str, uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer op")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn as_worker(token: &str, uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header(WORKER_TOKEN_HEADER, token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn worker_token_scopes_requests() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path(), Some("op")).await;

        let response = app
            .clone()
            .oneshot(operator(
                "POST",
                "/api/queue/workers/tokens",
                serde_json::json!({"workerId": "w1", "allowedRepositories": ["Acme/API"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let issued = json_body(response).await;
        let token = issued["token"].as_str().unwrap().to_string();
        let token_id = issued["workerToken"]["id"].as_str().unwrap().to_string();
        assert_eq!(issued["workerToken"]["allowedRepositories"][0], "acme/api");

        for repo in ["acme/web", "acme/api"] {
            let response = app
                .clone()
                .oneshot(operator(
                    "POST",
                    "/api/queue/jobs",
                    serde_json::json!({"type": "task", "payload": {"repository": repo}}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let claim_body = serde_json::json!({"workerId": "w1", "leaseSeconds": 30});
        let response = app
            .clone()
            .oneshot(as_worker(&token, "/api/queue/jobs/claim", claim_body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let claimed = json_body(response).await;
        assert_eq!(claimed["job"]["payload"]["repository"], "acme/api");
        let job_id = claimed["job"]["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(as_worker(&token, "/api/queue/jobs/claim", claim_body.clone()))
            .await
            .unwrap();
        assert!(json_body(response).await["job"].is_null());

        let response = app
            .clone()
            .oneshot(as_worker(
                &token,
                "/api/queue/jobs/claim",
                serde_json::json!({"workerId": "w2", "leaseSeconds": 30}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["kind"], "forbidden");

        let response = app
            .clone()
            .oneshot(as_worker(
                &token,
                &format!("/api/queue/jobs/{job_id}/heartbeat"),
                serde_json::json!({"workerId": "w2", "leaseSeconds": 30}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(as_worker(
                &token,
                "/api/queue/workers/tokens",
                serde_json::json!({"workerId": "w1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(operator(
                "POST",
                &format!("/api/queue/workers/tokens/{token_id}/revoke"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["isActive"], false);

        let response = app
            .clone()
            .oneshot(as_worker(&token, "/api/queue/jobs/claim", claim_body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["kind"], "unauthorized");

        let response = app
            .oneshot(as_worker("aqwt_bogus", "/api/queue/jobs/claim", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_for_kind("validation"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_kind("ownership"), StatusCode::FORBIDDEN);
        assert_eq!(status_for_kind("invalid_state"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("unavailable"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for_kind("unauthorized"), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for_kind("forbidden"), StatusCode::FORBIDDEN);
    }

    #[test]
    fn error_body_carries_kind() {
        let error = ApiError::Queue(QueueError::Validation("bad type".into()));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
