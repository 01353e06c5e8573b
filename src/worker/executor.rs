//! Step executor abstraction.
//!
//! An executor runs one step of a job in the job's workspace. The attempt
//! runner wraps every call with the wall-clock and idle-output timeouts and
//! drops the executor future when either fires, so adapters must release
//! their child processes on drop.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::worker::checkpoint::Checkpoint;
use crate::worker::task::StepSpec;

/// Reduced context handed to a retry instead of a full prior transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryContext {
    /// Attempt number of the retry, starting at 2.
    pub attempt: u32,
    pub failure_summary: String,
    pub changed_files: Vec<String>,
    /// The workspace was rebuilt from checkpoints before this attempt.
    pub hard_reset: bool,
}

/// Everything an executor may read while running one step attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: Uuid,
    pub runtime: String,
    pub step_index: usize,
    pub attempt: u32,
    /// Working directory for the step.
    pub repo_dir: PathBuf,
    pub state_dir: PathBuf,
    pub retry: Option<RetryContext>,
}

/// Result of one step attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub success: bool,
    pub summary: String,
    pub exit_code: Option<i32>,
    /// Adapter-specific classification hint, e.g. `"permission_denied"`.
    pub failure_hint: Option<String>,
    pub changed_files: Vec<String>,
    /// Unified diff produced by the step, if the adapter tracks one.
    pub diff: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_failure_hint(mut self, hint: impl Into<String>) -> Self {
        self.failure_hint = Some(hint.into());
        self
    }

    pub fn with_changed_files(mut self, files: Vec<String>) -> Self {
        self.changed_files = files;
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }
}

/// Output channel from an executor back to the attempt runner.
///
/// Every chunk resets the idle timer and is appended to the step log.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a chunk of output. Dropped silently once the runner is gone.
    pub fn report(&self, chunk: impl Into<String>) {
        let _ = self.tx.send(chunk.into());
    }
}

/// A pluggable runtime adapter.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runtime name this executor is registered under.
    fn runtime(&self) -> &str;

    /// Run one attempt of `step`.
    ///
    /// A failing step is `Ok` with `success == false`. `Err` is reserved for
    /// the adapter being unable to run the step at all.
    async fn execute_step(
        &self,
        ctx: &StepContext,
        step: &StepSpec,
        progress: &ProgressSink,
    ) -> Result<StepOutcome, ExecutorError>;

    /// Restore adapter state after a hard reset rebuilt the workspace.
    async fn replay(
        &self,
        _ctx: &StepContext,
        _checkpoints: &[Checkpoint],
    ) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Run one attempt under the wall-clock and idle-output timeouts.
///
/// `on_output` sees every progress chunk in order. Timeouts drop the
/// executor future, which kills the step process.
pub async fn run_attempt<F>(
    executor: &dyn StepExecutor,
    ctx: &StepContext,
    step: &StepSpec,
    timeout: Duration,
    idle_timeout: Duration,
    mut on_output: F,
) -> Result<StepOutcome, ExecutorError>
where
    F: FnMut(&str),
{
    let (sink, mut chunks) = ProgressSink::channel();
    let execution = executor.execute_step(ctx, step, &sink);
    tokio::pin!(execution);

    let deadline = Instant::now() + timeout;
    let mut last_output = Instant::now();
    let mut chunks_open = true;

    let result = loop {
        tokio::select! {
            biased;
            outcome = &mut execution => break outcome,
            chunk = chunks.recv(), if chunks_open => match chunk {
                Some(chunk) => {
                    last_output = Instant::now();
                    on_output(&chunk);
                }
                None => chunks_open = false,
            },
            _ = sleep_until(deadline) => {
                break Err(ExecutorError::Timeout {
                    step_id: step.id.clone(),
                    timeout,
                });
            }
            _ = sleep_until(last_output + idle_timeout) => {
                break Err(ExecutorError::IdleTimeout {
                    step_id: step.id.clone(),
                    timeout: idle_timeout,
                });
            }
        }
    };

    // Output reported right before the executor returned.
    while let Ok(chunk) = chunks.try_recv() {
        on_output(&chunk);
    }
    result
}
