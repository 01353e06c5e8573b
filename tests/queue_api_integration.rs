//! Integration tests for the queue REST + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port and drives it through
//! reqwest, the `HttpQueueClient` or tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use agent_queue::api::{ApiState, queue_routes};
use agent_queue::client::HttpQueueClient;
use agent_queue::config::{SelfHealConfig, WorkerConfig};
use agent_queue::error::QueueError;
use agent_queue::ledger::ArtifactStorage;
use agent_queue::queue::{
    ArtifactUpload, ClaimRequest, EventLevel, JobStatus, NewJob, NewWorkerToken, QueueApi,
    QueueService, RetryPolicy,
};
use agent_queue::safety::SecretRedactor;
use agent_queue::store::{JobStore, LibSqlJobStore};
use agent_queue::worker::{ExecutorRegistry, QueueWorker};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Artifact size cap used by the test server.
const MAX_ARTIFACT_BYTES: usize = 1024;

struct TestServer {
    base: String,
    port: u16,
    service: Arc<QueueService>,
    _dir: TempDir,
}

fn service_on(store: Arc<dyn JobStore>, dir: &std::path::Path) -> Arc<QueueService> {
    Arc::new(QueueService::new(
        store,
        ArtifactStorage::new(dir.join("artifacts"), MAX_ARTIFACT_BYTES, vec![]),
        Arc::new(SecretRedactor::new()),
        RetryPolicy::default(),
    ))
}

/// Start an Axum server on a random port.
async fn start_server(token: Option<&str>) -> TestServer {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
    start_server_with(store, dir, token).await
}

/// Start an Axum server over an existing store.
async fn start_server_with(
    store: Arc<dyn JobStore>,
    dir: TempDir,
    token: Option<&str>,
) -> TestServer {
    let service = service_on(store, dir.path());
    let state = ApiState::new(Arc::clone(&service))
        .with_api_token(token.map(|t| SecretString::from(t.to_string())));
    let app = queue_routes(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        port,
        service,
        _dir: dir,
    }
}

fn claim(worker_id: &str) -> ClaimRequest {
    ClaimRequest::new(worker_id, 30)
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn full_lifecycle_through_http_client() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let client = HttpQueueClient::new(&server.base, None).unwrap();

        let job = client
            .create_job(NewJob::new("task", json!({"runtime": "shell"})).with_priority(5))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(client.get_job(job.id).await.unwrap().priority, 5);

        let claimed = client.claim(claim("w1")).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(client.claim(claim("w2")).await.unwrap().is_none());

        let renewed = client.heartbeat(job.id, "w1", 60).await.unwrap();
        assert!(renewed.lease_expires_at > claimed.lease_expires_at);

        let done = client
            .complete(
                job.id,
                "w1",
                Some("all good".into()),
                vec![ArtifactUpload::new("logs/run.log", b"hello log".to_vec())
                    .with_content_type("text/plain")],
            )
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result_summary.as_deref(), Some("all good"));

        let artifacts = client.list_artifacts(job.id, None).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        let (meta, bytes) = client
            .download_artifact(job.id, artifacts[0].id)
            .await
            .unwrap();
        assert_eq!(meta.name, "logs/run.log");
        assert_eq!(bytes, b"hello log");

        let raw = reqwest::get(format!(
            "{}/api/queue/jobs/{}/artifacts/{}",
            server.base, job.id, meta.id
        ))
        .await
        .unwrap();
        assert_eq!(raw.headers()["content-type"], "text/plain");

        let listed = client
            .list_jobs(agent_queue::queue::JobFilter {
                status: Some(JobStatus::Succeeded),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn errors_map_to_statuses_and_back() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let http = reqwest::Client::new();
        let client = HttpQueueClient::new(&server.base, None).unwrap();

        // Unknown job: 404 with a JSON body.
        let missing = uuid::Uuid::new_v4();
        let resp = http
            .get(format!("{}/api/queue/jobs/{missing}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "not_found");
        assert!(matches!(
            client.get_job(missing).await,
            Err(QueueError::JobNotFound(id)) if id == missing
        ));

        // Invalid type: 400.
        let resp = http
            .post(format!("{}/api/queue/jobs", server.base))
            .json(&json!({"type": "Bad Type!"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Malformed body: 400 with the same error shape.
        let resp = http
            .post(format!("{}/api/queue/jobs/claim", server.base))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "validation");

        // Foreign worker: 403 -> Ownership.
        let job = client.create_job(NewJob::new("task", json!({}))).await.unwrap();
        client.claim(claim("w1")).await.unwrap().unwrap();
        let err = client.heartbeat(job.id, "w2", 30).await.unwrap_err();
        assert!(matches!(err, QueueError::Ownership { .. }));

        // Completing twice: 409 -> InvalidState.
        client.complete(job.id, "w1", None, vec![]).await.unwrap();
        let err = client.complete(job.id, "w1", None, vec![]).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { ref status, .. } if status == "succeeded"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_and_control_routes() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let http = reqwest::Client::new();
        let client = HttpQueueClient::new(&server.base, None).unwrap();

        // Queued: cancelled immediately, body optional.
        let queued = client.create_job(NewJob::new("task", json!({}))).await.unwrap();
        let resp = http
            .post(format!("{}/api/queue/jobs/{}/cancel", server.base, queued.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "cancelled");

        // Running: pause flag round-trips, cancel is flagged then acked.
        let running = client.create_job(NewJob::new("task", json!({}))).await.unwrap();
        client.claim(claim("w1")).await.unwrap().unwrap();
        let paused = client.set_paused(running.id, true).await.unwrap();
        assert_eq!(paused.payload["liveControl"]["paused"], true);

        let flagged = client
            .request_cancel(running.id, Some("operator".into()))
            .await
            .unwrap();
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(flagged.cancel_requested_at.is_some());

        let beat = client.heartbeat(running.id, "w1", 30).await.unwrap();
        assert!(beat.cancel_requested_at.is_some());

        let acked = client.ack_cancel(running.id, "w1", None).await.unwrap();
        assert_eq!(acked.status, JobStatus::Cancelled);

        // Control on a terminal job: 409.
        let err = client.set_paused(running.id, false).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn event_cursor_paging() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let client = HttpQueueClient::new(&server.base, None).unwrap();
        let job = client.create_job(NewJob::new("task", json!({}))).await.unwrap();
        for i in 0..3 {
            client
                .append_event(job.id, EventLevel::Info, &format!("note {i}"), None)
                .await
                .unwrap();
        }

        let all = client.list_events(job.id, None, None).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let resp = reqwest::get(format!(
            "{}/api/queue/jobs/{}/events?after={}&limit=1",
            server.base, job.id, all[0].sequence
        ))
        .await
        .unwrap();
        let page: Value = resp.json().await.unwrap();
        assert_eq!(page["events"].as_array().unwrap().len(), 1);
        assert_eq!(page["nextAfter"], all[1].sequence);

        let resp = reqwest::get(format!(
            "{}/api/queue/jobs/{}/events?limit=501",
            server.base, job.id
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let job = server
            .service
            .create_job(NewJob::new("task", json!({})))
            .await
            .unwrap();
        let resp = reqwest::Client::new()
            .post(format!(
                "{}/api/queue/jobs/{}/artifacts?name=big.bin",
                server.base, job.id
            ))
            .body(vec![0u8; MAX_ARTIFACT_BYTES + 1])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = reqwest::Client::new()
            .post(format!(
                "{}/api/queue/jobs/{}/artifacts?name=../escape.txt",
                server.base, job.id
            ))
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bearer_token_is_enforced() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(Some("queue-secret")).await;

        let resp = reqwest::get(format!("{}/api/queue/jobs", server.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        // Health stays open.
        let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);

        let client = HttpQueueClient::new(
            &server.base,
            Some(SecretString::from("queue-secret".to_string())),
        )
        .unwrap();
        assert!(client.list_jobs(Default::default()).await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_token_client_is_scoped_to_its_policy() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(Some("queue-secret")).await;
        let (_, raw) = server
            .service
            .issue_worker_token(NewWorkerToken::new("w1").with_repositories(&["acme/api"]))
            .await
            .unwrap();
        let operator = HttpQueueClient::new(
            &server.base,
            Some(SecretString::from("queue-secret".to_string())),
        )
        .unwrap();
        let web = operator
            .create_job(NewJob::new("task", json!({"repository": "acme/web"})))
            .await
            .unwrap();
        let api = operator
            .create_job(NewJob::new("task", json!({"repository": "acme/api"})))
            .await
            .unwrap();

        let worker = HttpQueueClient::new(&server.base, None)
            .unwrap()
            .with_worker_token(Some(raw));
        let claimed = worker.claim(claim("w1")).await.unwrap().unwrap();
        assert_eq!(claimed.id, api.id);
        assert!(worker.claim(claim("w1")).await.unwrap().is_none());

        let err = worker.claim(claim("w2")).await.unwrap_err();
        assert!(matches!(err, QueueError::Forbidden(_)));
        let err = worker
            .complete(api.id, "w2", None, Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        worker.complete(api.id, "w1", None, Vec::new()).await.unwrap();
        assert_eq!(
            operator.get_job(web.id).await.unwrap().status,
            JobStatus::Queued
        );

        let stranger = HttpQueueClient::new(&server.base, None)
            .unwrap()
            .with_worker_token(Some(SecretString::from("aqwt_nope".to_string())));
        let err = stranger.claim(claim("w1")).await.unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized(_)));
    })
    .await
    .expect("test timed out");
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_sends_backlog_then_live_events() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let job = server
            .service
            .create_job(NewJob::new("task", json!({})))
            .await
            .unwrap();
        let queued = server.service.list_events(job.id, None, None).await.unwrap();
        let after = queued.last().map(|e| e.sequence).unwrap_or(0);
        server
            .service
            .append_event(job.id, EventLevel::Info, "backlog", None)
            .await
            .unwrap();

        let (mut ws, _resp) = connect_async(format!(
            "ws://127.0.0.1:{}/api/queue/jobs/{}/events/ws?after={after}",
            server.port, job.id
        ))
        .await
        .expect("WS connect failed");

        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["message"], "backlog");
        assert_eq!(first["sequence"], after + 1);

        server
            .service
            .append_event(job.id, EventLevel::Warn, "live", Some(json!({"n": 1})))
            .await
            .unwrap();
        let second = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(second["message"], "live");
        assert_eq!(second["level"], "warn");
        assert_eq!(second["sequence"], after + 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_resyncs_events_written_by_another_process() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("queue.db");
        let server_store: Arc<dyn JobStore> =
            Arc::new(LibSqlJobStore::new_local(&db_path).await.unwrap());
        let other_store: Arc<dyn JobStore> =
            Arc::new(LibSqlJobStore::new_local(&db_path).await.unwrap());
        let other = service_on(other_store, &dir.path().join("other"));
        let server = start_server_with(server_store, dir, None).await;

        let job = server
            .service
            .create_job(NewJob::new("task", json!({})))
            .await
            .unwrap();
        let (mut ws, _resp) = connect_async(format!(
            "ws://127.0.0.1:{}/api/queue/jobs/{}/events/ws?after=1",
            server.port, job.id
        ))
        .await
        .expect("WS connect failed");

        // Written through a second store: never published on the server's bus.
        for message in ["elsewhere 1", "elsewhere 2"] {
            other
                .append_event(job.id, EventLevel::Info, message, None)
                .await
                .unwrap();
        }
        server
            .service
            .append_event(job.id, EventLevel::Info, "local", None)
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            let frame = parse_ws_json(&ws.next().await.unwrap().unwrap());
            received.push((
                frame["sequence"].as_i64().unwrap(),
                frame["message"].as_str().unwrap().to_string(),
            ));
        }
        assert_eq!(
            received,
            vec![
                (2, "elsewhere 1".to_string()),
                (3, "elsewhere 2".to_string()),
                (4, "local".to_string()),
            ]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_unknown_job_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let result = connect_async(format!(
            "ws://127.0.0.1:{}/api/queue/jobs/{}/events/ws",
            server.port,
            uuid::Uuid::new_v4()
        ))
        .await;
        assert!(result.is_err());
    })
    .await
    .expect("test timed out");
}

// ── Remote Worker ────────────────────────────────────────────────────

#[tokio::test]
async fn remote_worker_runs_exec_job() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(None).await;
        let work = TempDir::new().unwrap();
        let api: Arc<dyn QueueApi> = Arc::new(HttpQueueClient::new(&server.base, None).unwrap());

        let job = api
            .create_job(NewJob::new(
                "exec",
                json!({ "runtime": "shell", "instructions": "echo remote-ok" }),
            ))
            .await
            .unwrap();

        let worker = QueueWorker::new(
            Arc::clone(&api),
            WorkerConfig {
                worker_id: "remote-1".into(),
                lease_seconds: 10,
                workdir: work.path().to_path_buf(),
                ..Default::default()
            },
            SelfHealConfig::default(),
            Arc::new(ExecutorRegistry::with_builtins()),
            Arc::new(SecretRedactor::new()),
        );
        assert!(worker.run_once().await.unwrap());

        let job = api.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.result_summary.unwrap().contains("remote-ok"));

        let names: Vec<String> = api
            .list_artifacts(job.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert!(names.contains(&"logs/execute.log".to_string()));

        let messages: Vec<String> = api
            .list_events(job.id, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(messages.contains(&"stage.finished".to_string()));
        assert!(messages.contains(&"Job completed".to_string()));
    })
    .await
    .expect("test timed out");
}
