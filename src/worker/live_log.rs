//! Step output forwarded as `log` job events.
//!
//! Output is redacted on arrival and batched. A batch is sent once it reaches
//! the size limit, on every flush tick, and when the attempt ends.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::warn;
use uuid::Uuid;

use crate::config::LiveLogConfig;
use crate::queue::QueueApi;
use crate::queue::model::EventLevel;
use crate::safety::SecretRedactor;

/// Event message of every output batch.
pub const LOG_EVENT: &str = "log";

/// Splits buffered output into event-sized batches.
#[derive(Debug)]
pub struct LogBatcher {
    pending: String,
    limit: usize,
}

impl LogBatcher {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: String::new(),
            limit: limit.max(1),
        }
    }

    /// Buffer one chunk as a line. Returns the batches that are already full.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        if !chunk.ends_with('\n') {
            self.pending.push('\n');
        }
        self.take(false)
    }

    /// Everything still buffered.
    pub fn flush(&mut self) -> Vec<String> {
        self.take(true)
    }

    fn take(&mut self, force: bool) -> Vec<String> {
        let mut batches = Vec::new();
        while self.pending.len() >= self.limit || (force && !self.pending.is_empty()) {
            let cut = if self.pending.len() <= self.limit {
                self.pending.len()
            } else {
                split_point(&self.pending, self.limit)
            };
            let rest = self.pending.split_off(cut);
            let batch = std::mem::replace(&mut self.pending, rest);
            if !batch.trim().is_empty() {
                batches.push(batch);
            }
        }
        batches
    }
}

/// Cut after the last newline within `limit`, else at the last char
/// boundary. Always at least one char.
fn split_point(text: &str, limit: usize) -> usize {
    let mut end = limit.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        return text.chars().next().map_or(text.len(), char::len_utf8);
    }
    match text[..end].rfind('\n') {
        Some(i) => i + 1,
        None => end,
    }
}

/// Background forwarder for one step attempt.
pub struct LiveLog {
    tx: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    redactor: Arc<SecretRedactor>,
}

impl LiveLog {
    /// Start forwarding. `context` is merged into every event payload.
    pub fn start(
        api: Arc<dyn QueueApi>,
        redactor: Arc<SecretRedactor>,
        job_id: Uuid,
        context: Value,
        config: LiveLogConfig,
    ) -> Self {
        if !config.enabled {
            return Self {
                tx: None,
                task: None,
                redactor,
            };
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            let mut batcher = LogBatcher::new(config.batch_bytes);
            let mut ticker = interval(config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let batches = tokio::select! {
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => batcher.push(&chunk),
                        None => break,
                    },
                    _ = ticker.tick() => batcher.flush(),
                };
                for text in batches {
                    send(api.as_ref(), job_id, &context, text).await;
                }
            }
            for text in batcher.flush() {
                send(api.as_ref(), job_id, &context, text).await;
            }
        });

        Self {
            tx: Some(tx),
            task: Some(task),
            redactor,
        }
    }

    pub fn push(&self, chunk: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(self.redactor.scrub(chunk));
        }
    }

    /// Send whatever is still buffered and wait for it.
    pub async fn finish(mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Live log forwarder failed");
            }
        }
    }
}

async fn send(api: &dyn QueueApi, job_id: Uuid, context: &Value, text: String) {
    let mut payload = match context {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    payload.insert("kind".into(), Value::from(LOG_EVENT));
    payload.insert("text".into(), Value::String(text));
    if let Err(e) = api
        .append_event(job_id, EventLevel::Info, LOG_EVENT, Some(Value::Object(payload)))
        .await
    {
        warn!(job_id = %job_id, error = %e, "Failed to append log event");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::ledger::ArtifactStorage;
    use crate::queue::model::NewJob;
    use crate::queue::{QueueService, RetryPolicy};
    use crate::store::{JobStore, LibSqlJobStore};

    #[test]
    fn small_output_waits_for_flush() {
        let mut batcher = LogBatcher::new(128);
        assert!(batcher.push("line one").is_empty());
        assert!(batcher.push("line two\n").is_empty());
        assert_eq!(batcher.flush(), vec!["line one\nline two\n"]);
        assert!(batcher.flush().is_empty());
    }

    #[test]
    fn full_batches_split_on_newlines() {
        let mut batcher = LogBatcher::new(16);
        let ready = batcher.push("aaaaaaaaaa");
        assert!(ready.is_empty());
        let ready = batcher.push("bbbbbbbbbb");
        assert_eq!(ready, vec!["aaaaaaaaaa\n"]);
        assert_eq!(batcher.flush(), vec!["bbbbbbbbbb\n"]);

        let ready = batcher.push(&"x".repeat(40));
        assert_eq!(ready, vec!["x".repeat(16), "x".repeat(16)]);
        assert_eq!(batcher.flush(), vec![format!("{}\n", "x".repeat(8))]);
    }

    #[test]
    fn blank_output_is_dropped() {
        let mut batcher = LogBatcher::new(128);
        batcher.push("   ");
        batcher.push("");
        assert!(batcher.flush().is_empty());
    }

    #[test]
    fn split_respects_char_boundaries() {
        assert_eq!(split_point("ééé", 3), 2);
        assert_eq!(split_point("é", 1), 2);
        assert_eq!(split_point("ab\ncd", 4), 3);
    }

    #[tokio::test]
    async fn forwarded_output_becomes_redacted_log_events() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let service = Arc::new(QueueService::new(
            store,
            ArtifactStorage::new(dir.path().to_path_buf(), 1024, vec![]),
            Arc::new(SecretRedactor::new()),
            RetryPolicy::default(),
        ));
        let job = service
            .create_job(NewJob::new("task", json!({})))
            .await
            .unwrap();
        let redactor = Arc::new(SecretRedactor::new());
        redactor.register("hunter2-secret");

        let live = LiveLog::start(
            service.clone(),
            redactor,
            job.id,
            json!({"stepId": "build", "attempt": 1}),
            LiveLogConfig {
                enabled: true,
                batch_bytes: 1024,
                flush_interval: Duration::from_secs(60),
            },
        );
        live.push("compiling");
        live.push("password hunter2-secret");
        live.finish().await;

        let logs: Vec<_> = service
            .list_events(job.id, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.message == LOG_EVENT)
            .collect();
        assert_eq!(logs.len(), 1);
        let payload = logs[0].payload.clone().unwrap();
        assert_eq!(payload["kind"], "log");
        assert_eq!(payload["stepId"], "build");
        assert_eq!(payload["text"], "compiling\npassword [REDACTED]\n");
    }

    #[tokio::test]
    async fn disabled_forwarder_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let service = Arc::new(QueueService::new(
            store,
            ArtifactStorage::new(dir.path().to_path_buf(), 1024, vec![]),
            Arc::new(SecretRedactor::new()),
            RetryPolicy::default(),
        ));
        let job = service
            .create_job(NewJob::new("task", json!({})))
            .await
            .unwrap();
        let live = LiveLog::start(
            service.clone(),
            Arc::new(SecretRedactor::new()),
            job.id,
            json!({}),
            LiveLogConfig {
                enabled: false,
                ..LiveLogConfig::default()
            },
        );
        live.push("quiet");
        live.finish().await;
        let events = service.list_events(job.id, None, None).await.unwrap();
        assert!(events.iter().all(|e| e.message != LOG_EVENT));
    }
}
