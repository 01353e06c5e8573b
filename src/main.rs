use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_queue::api::{ApiState, queue_routes};
use agent_queue::client::HttpQueueClient;
use agent_queue::config::{QueueConfig, SelfHealConfig, WorkerConfig};
use agent_queue::ledger::ArtifactStorage;
use agent_queue::queue::{QueueApi, QueueService, RetryPolicy};
use agent_queue::safety::SecretRedactor;
use agent_queue::store::{JobStore, LibSqlJobStore};
use agent_queue::worker::{ExecutorRegistry, QueueWorker};

const USAGE: &str = "usage: agent-queue [serve|worker]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    match mode.as_str() {
        "serve" => serve().await,
        "worker" => run_worker().await,
        "-h" | "--help" | "help" => {
            eprintln!("{USAGE}");
            Ok(())
        }
        other => anyhow::bail!("unknown mode {other:?}\n{USAGE}"),
    }
}

/// `fmt` to stderr, plus a daily rolling file when `AGENT_QUEUE_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("AGENT_QUEUE_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-queue.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

async fn open_service(config: &QueueConfig, redactor: Arc<SecretRedactor>) -> anyhow::Result<Arc<QueueService>> {
    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    Ok(Arc::new(QueueService::new(
        store,
        ArtifactStorage::from_config(config),
        redactor,
        RetryPolicy::from(config),
    )))
}

async fn serve() -> anyhow::Result<()> {
    let config = QueueConfig::from_env()?;
    let redactor = Arc::new(SecretRedactor::from_env());
    if let Some(token) = &config.api_token {
        redactor.register_secret(token);
    }
    let service = open_service(&config, redactor).await?;

    eprintln!("Agent Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Artifacts: {}", config.artifact_root.display());
    eprintln!("   API: http://0.0.0.0:{}/api/queue", config.http_port);

    let state = ApiState::new(service)
        .with_api_token(config.api_token.clone())
        .with_max_upload_bytes(config.artifact_max_bytes);
    let app = queue_routes(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("binding port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Queue API server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

async fn run_worker() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    let self_heal = SelfHealConfig::from_env()?;
    let redactor = Arc::new(SecretRedactor::from_env());
    for token in [&config.api_token, &config.worker_token].into_iter().flatten() {
        redactor.register_secret(token);
    }

    let api: Arc<dyn QueueApi> = match &config.api_url {
        Some(url) => {
            eprintln!("   Queue API: {url}");
            Arc::new(
                HttpQueueClient::new(url.clone(), config.api_token.clone())?
                    .with_worker_token(config.worker_token.clone()),
            )
        }
        None => {
            let queue_config = QueueConfig::from_env()?;
            eprintln!("   Database: {}", queue_config.db_path.display());
            open_service(&queue_config, redactor.clone()).await?
        }
    };

    eprintln!("Agent Queue worker {}", config.worker_id);
    eprintln!("   Workdir: {}", config.workdir.display());
    tokio::fs::create_dir_all(&config.workdir)
        .await
        .with_context(|| format!("creating {}", config.workdir.display()))?;

    let worker = QueueWorker::new(
        api,
        config,
        self_heal,
        Arc::new(ExecutorRegistry::with_builtins()),
        redactor,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested; finishing current job");
        shutdown_tx.send_replace(true);
    });
    worker.run_forever(shutdown_rx).await;
    Ok(())
}
