//! Queue worker: claim loop and the per-job stage pipeline.
//!
//! Every claimed job runs `prepare -> execute -> publish`. Cancellation and
//! pause flags arrive through the heartbeat and are honored at stage and step
//! boundaries, before every retry, and while a step is running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SelfHealConfig, WorkerConfig};
use crate::error::{QueueError, WorkspaceError};
use crate::queue::QueueApi;
use crate::queue::model::{ArtifactUpload, ClaimRequest, EventLevel, Job};
use crate::safety::SecretRedactor;
use crate::worker::checkpoint::{Checkpoint, CheckpointStore};
use crate::worker::executor::{RetryContext, StepContext, StepExecutor, run_attempt};
use crate::worker::heartbeat::{Heartbeat, JobControl, StopSignal};
use crate::worker::live_log::LiveLog;
use crate::worker::registry::ExecutorRegistry;
use crate::worker::self_heal::{
    AttemptFailure, SelfHealController, SelfHealStrategy, classify_error, classify_outcome,
};
use crate::worker::task::{JobSpec, PublishMode, StepSpec};
use crate::workspace::{JobWorkspace, RepoSnapshot, paths};

/// Longest failure summary handed to a retry.
const MAX_RETRY_SUMMARY_CHARS: usize = 2000;

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Prepare,
    Execute,
    Publish,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Execute => "execute",
            Self::Publish => "publish",
        }
    }
}

/// Why a stage did not finish.
#[derive(Debug)]
enum StageFailure {
    Failed { message: String, retryable: bool },
    Stopped(StopSignal),
}

impl StageFailure {
    fn failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::Failed {
            message: message.into(),
            retryable,
        }
    }
}

impl From<WorkspaceError> for StageFailure {
    fn from(error: WorkspaceError) -> Self {
        let retryable = !matches!(error, WorkspaceError::InvalidPayload(_));
        Self::failed(error.to_string(), retryable)
    }
}

/// How a job run ended, before it is reported.
#[derive(Debug)]
enum JobOutcome {
    Succeeded {
        summary: String,
        artifacts: Vec<ArtifactUpload>,
    },
    Failed {
        message: String,
        retryable: bool,
        artifacts: Vec<ArtifactUpload>,
    },
    Stopped(StopSignal),
}

impl JobOutcome {
    fn from_failure(failure: StageFailure, artifacts: Vec<ArtifactUpload>) -> Self {
        match failure {
            StageFailure::Failed { message, retryable } => Self::Failed {
                message,
                retryable,
                artifacts,
            },
            StageFailure::Stopped(signal) => Self::Stopped(signal),
        }
    }
}

/// Everything the prepare stage resolved for the later stages.
struct PreparedJob {
    spec: JobSpec,
    workspace: JobWorkspace,
    executor: Arc<dyn StepExecutor>,
    /// Repo state right after prepare. Diff hashes are relative to it.
    baseline: RepoSnapshot,
}

/// Polls the queue and runs one job at a time.
pub struct QueueWorker {
    api: Arc<dyn QueueApi>,
    config: WorkerConfig,
    self_heal: SelfHealConfig,
    executors: Arc<ExecutorRegistry>,
    redactor: Arc<SecretRedactor>,
}

impl QueueWorker {
    pub fn new(
        api: Arc<dyn QueueApi>,
        config: WorkerConfig,
        self_heal: SelfHealConfig,
        executors: Arc<ExecutorRegistry>,
        redactor: Arc<SecretRedactor>,
    ) -> Self {
        Self {
            api,
            config,
            self_heal,
            executors,
            redactor,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    ///
    /// A job in flight is always finished before the loop checks shutdown.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            runtimes = ?self.executors.list().await,
            "Worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(worker_id = %self.config.worker_id, error = %e, "Claim failed");
                    false
                }
            };
            if worked {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.idle_delay()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "Worker stopped");
    }

    /// Claim and run at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let claimed = self
            .api
            .claim(ClaimRequest {
                worker_id: self.config.worker_id.clone(),
                lease_seconds: self.config.lease_seconds,
                allowed_types: self.config.allowed_types.clone(),
                worker_capabilities: self.config.capabilities.clone(),
                allowed_repositories: Vec::new(),
            })
            .await?;
        match claimed {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a job this worker already holds the lease on, then report it.
    pub async fn process(&self, job: Job) {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "Processing job"
        );
        let (heartbeat, control) = Heartbeat::spawn(
            self.api.clone(),
            &job,
            self.config.worker_id.clone(),
            self.config.lease_seconds,
            self.config.heartbeat_interval(),
        );
        let outcome = self.run_pipeline(&job, &control).await;
        heartbeat.stop().await;
        self.report(&job, outcome).await;
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    async fn run_pipeline(&self, job: &Job, control: &JobControl) -> JobOutcome {
        let prepared = match self
            .run_stage(job.id, Stage::Prepare, self.prepare(job, control))
            .await
        {
            Ok(prepared) => prepared,
            Err(failure) => return JobOutcome::from_failure(failure, Vec::new()),
        };

        let summary = match self
            .run_stage(job.id, Stage::Execute, self.execute(job, &prepared, control))
            .await
        {
            Ok(summary) => summary,
            Err(failure) => {
                let artifacts = match prepared.spec.publish {
                    PublishMode::Artifacts => self.log_artifacts(&prepared.workspace).await,
                    PublishMode::None => Vec::new(),
                };
                return JobOutcome::from_failure(failure, artifacts);
            }
        };

        let artifacts = match prepared.spec.publish {
            PublishMode::None => Vec::new(),
            PublishMode::Artifacts => match self
                .run_stage(job.id, Stage::Publish, self.publish(job, &prepared, control))
                .await
            {
                Ok(artifacts) => artifacts,
                Err(failure) => return JobOutcome::from_failure(failure, Vec::new()),
            },
        };
        JobOutcome::Succeeded { summary, artifacts }
    }

    /// Wrap a stage with its started / finished / failed events.
    async fn run_stage<T, F>(&self, job_id: Uuid, stage: Stage, work: F) -> Result<T, StageFailure>
    where
        F: Future<Output = Result<T, StageFailure>>,
    {
        self.emit(
            job_id,
            EventLevel::Info,
            "stage.started",
            json!({ "stage": stage.as_str() }),
        )
        .await;
        let started = Instant::now();
        let result = work.await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(_) => {
                self.emit(
                    job_id,
                    EventLevel::Info,
                    "stage.finished",
                    json!({ "stage": stage.as_str(), "durationMs": duration_ms }),
                )
                .await;
            }
            Err(StageFailure::Failed { message, retryable }) => {
                self.emit(
                    job_id,
                    EventLevel::Error,
                    "stage.failed",
                    json!({
                        "stage": stage.as_str(),
                        "durationMs": duration_ms,
                        "error": message,
                        "retryable": retryable,
                    }),
                )
                .await;
            }
            Err(StageFailure::Stopped(StopSignal::CancelRequested)) => {
                self.emit(
                    job_id,
                    EventLevel::Warn,
                    "stage.failed",
                    json!({
                        "stage": stage.as_str(),
                        "durationMs": duration_ms,
                        "error": "cancellation requested",
                    }),
                )
                .await;
            }
            // The job belongs to someone else now.
            Err(StageFailure::Stopped(StopSignal::LeaseLost)) => {}
        }
        result
    }

    async fn prepare(&self, job: &Job, control: &JobControl) -> Result<PreparedJob, StageFailure> {
        self.boundary(job.id, control).await?;

        let spec = JobSpec::from_job(job).map_err(|e| StageFailure::failed(e.to_string(), false))?;
        let executor = self
            .executors
            .resolve(&spec.runtime)
            .await
            .map_err(|e| StageFailure::failed(e.to_string(), false))?;

        let workspace = JobWorkspace::prepare(&self.config.workdir, job.id).await?;
        if let Some(repository) = spec.repository.as_deref() {
            workspace.seed_repo(std::path::Path::new(repository)).await?;
        }

        let context = json!({
            "job": job,
            "spec": spec,
            "worker": {
                "id": self.config.worker_id,
                "capabilities": self.config.capabilities,
            },
            "preparedAt": Utc::now(),
        });
        workspace
            .write_context(&self.redactor.scrub_json(&context))
            .await?;

        let baseline = workspace.snapshot().await?;
        workspace.save_last_good().await?;
        workspace
            .append_log(
                Stage::Prepare.as_str(),
                &format!(
                    "job {} attempt {} runtime {} with {} step(s), {} file(s) in repo",
                    job.id,
                    job.attempt,
                    spec.runtime,
                    spec.steps.len(),
                    baseline.len()
                ),
            )
            .await?;
        debug!(job_id = %job.id, root = %workspace.root().display(), "Workspace prepared");

        Ok(PreparedJob {
            spec,
            workspace,
            executor,
            baseline,
        })
    }

    async fn execute(
        &self,
        job: &Job,
        prepared: &PreparedJob,
        control: &JobControl,
    ) -> Result<String, StageFailure> {
        let checkpoints = CheckpointStore::new(prepared.workspace.state_dir());
        let mut controller = SelfHealController::new(self.self_heal, self.redactor.clone());
        let mut last_summary = String::new();

        for step in &prepared.spec.steps {
            self.boundary(job.id, control).await?;
            controller.begin_step(&step.id, step.index);
            self.emit(
                job.id,
                EventLevel::Info,
                "step.started",
                json!({ "stepId": step.id, "index": step.index, "title": step.label() }),
            )
            .await;

            last_summary = self
                .run_step(job, prepared, control, step, &checkpoints, &mut controller)
                .await?;

            self.emit(
                job.id,
                EventLevel::Info,
                "step.finished",
                json!({ "stepId": step.id, "index": step.index }),
            )
            .await;
        }

        let steps = prepared.spec.steps.len();
        Ok(if last_summary.is_empty() {
            format!("{steps} step(s) completed")
        } else {
            format!("{steps} step(s) completed: {last_summary}")
        })
    }

    /// The bounded attempt loop for one step. Returns the successful summary.
    async fn run_step(
        &self,
        job: &Job,
        prepared: &PreparedJob,
        control: &JobControl,
        step: &StepSpec,
        checkpoints: &CheckpointStore,
        controller: &mut SelfHealController,
    ) -> Result<String, StageFailure> {
        let workspace = &prepared.workspace;
        let config = *controller.config();
        let mut retry: Option<RetryContext> = None;

        loop {
            let mut record = controller
                .new_attempt()
                .map_err(|e| StageFailure::failed(e.to_string(), true))?;
            let ctx = StepContext {
                job_id: job.id,
                runtime: prepared.spec.runtime.clone(),
                step_index: step.index,
                attempt: record.attempt,
                repo_dir: workspace.repo_dir(),
                state_dir: workspace.state_dir(),
                retry: retry.take(),
            };
            let before = workspace.snapshot().await?;

            let live = LiveLog::start(
                self.api.clone(),
                self.redactor.clone(),
                job.id,
                json!({
                    "stage": Stage::Execute.as_str(),
                    "stepId": step.id,
                    "stepIndex": step.index,
                    "attempt": record.attempt,
                }),
                self.config.live_log,
            );
            let mut output = String::new();
            let result = tokio::select! {
                result = run_attempt(
                    prepared.executor.as_ref(),
                    &ctx,
                    step,
                    config.step_timeout,
                    config.step_idle_timeout,
                    |chunk| {
                        live.push(chunk);
                        output.push_str(chunk);
                        if !chunk.ends_with('\n') {
                            output.push('\n');
                        }
                    },
                ) => result,
                signal = wait_for_stop(control.stop.clone()) => {
                    return Err(StageFailure::Stopped(signal));
                }
            };
            live.finish().await;

            let header = format!("== step {} attempt {} ==\n", step.id, record.attempt);
            workspace
                .append_log(
                    Stage::Execute.as_str(),
                    &self.redactor.scrub(&format!("{header}{output}")),
                )
                .await?;

            let after = workspace.snapshot().await?;
            let diff_hash = after.diff_hash(&prepared.baseline);
            let changed_files = after.changed_since(&before);
            record.finished_at = Some(Utc::now());
            record.diff_hash = Some(diff_hash.clone());
            record.changed_files = changed_files.clone();

            let (class, exit_code, failure_hint, message) = match result {
                Ok(outcome) if outcome.success => {
                    let changed = if outcome.changed_files.is_empty() {
                        changed_files
                    } else {
                        outcome.changed_files.clone()
                    };
                    checkpoints.write_attempt(&record).await?;
                    checkpoints
                        .write_checkpoint(&Checkpoint {
                            job_id: job.id,
                            step_id: step.id.clone(),
                            step_index: step.index,
                            attempt: record.attempt,
                            summary: self.redactor.scrub(&outcome.summary),
                            diff_hash: Some(diff_hash),
                            changed_files: changed,
                            patch: outcome.diff.as_deref().map(|d| self.redactor.scrub(d)),
                            created_at: Utc::now(),
                        })
                        .await?;
                    workspace.save_last_good().await?;
                    controller.reset_after_success();
                    return Ok(self.redactor.scrub(&outcome.summary));
                }
                Ok(outcome) => (
                    classify_outcome(&outcome),
                    outcome.exit_code,
                    outcome.failure_hint,
                    outcome.summary,
                ),
                Err(e) => (classify_error(&e), None, None, e.to_string()),
            };

            let signature =
                controller.signature(&step.id, exit_code, failure_hint.as_deref(), &message);
            record.failure_signature = signature.as_ref().map(|s| s.value.clone());
            record.failure_signature_hash = signature.as_ref().map(|s| s.fingerprint.clone());
            let verdict = controller
                .on_failure(AttemptFailure {
                    class,
                    signature,
                    diff_hash: record.diff_hash.clone(),
                })
                .map_err(|e| StageFailure::failed(e.to_string(), true))?;
            record.failure_class = Some(verdict.class);
            record.strategy = verdict.strategy;
            checkpoints.write_attempt(&record).await?;

            let message = self.redactor.scrub(&message);
            warn!(
                job_id = %job.id,
                step_id = %step.id,
                attempt = record.attempt,
                class = ?verdict.class,
                strategy = ?verdict.strategy,
                "Step attempt failed"
            );
            self.emit(
                job.id,
                EventLevel::Warn,
                "step.attempt.failed",
                json!({
                    "stepId": step.id,
                    "attempt": record.attempt,
                    "exitCode": exit_code,
                    "failureClass": verdict.class,
                    "strategy": verdict.strategy,
                    "error": message,
                }),
            )
            .await;

            let hard_reset = match verdict.strategy {
                SelfHealStrategy::Abort => {
                    return Err(StageFailure::failed(
                        format!("step {} failed: {}", step.id, message),
                        false,
                    ));
                }
                SelfHealStrategy::QueueRetry | SelfHealStrategy::None => {
                    return Err(StageFailure::failed(
                        format!(
                            "step {} failed after {} attempt(s): {}",
                            step.id, record.attempt, message
                        ),
                        true,
                    ));
                }
                SelfHealStrategy::SoftReset => false,
                SelfHealStrategy::HardReset => true,
            };

            self.boundary(job.id, control).await?;
            if hard_reset {
                self.hard_reset(job, prepared, &ctx, checkpoints, controller)
                    .await?;
            }
            retry = Some(RetryContext {
                attempt: record.attempt + 1,
                failure_summary: message.chars().take(MAX_RETRY_SUMMARY_CHARS).collect(),
                changed_files: record.changed_files.clone(),
                hard_reset,
            });
        }
    }

    /// Rebuild the repo from the last good state and replay completed steps.
    async fn hard_reset(
        &self,
        job: &Job,
        prepared: &PreparedJob,
        ctx: &StepContext,
        checkpoints: &CheckpointStore,
        controller: &mut SelfHealController,
    ) -> Result<(), StageFailure> {
        controller
            .consume_hard_reset()
            .map_err(|e| StageFailure::failed(e.to_string(), true))?;
        prepared.workspace.restore_last_good().await?;
        let completed = checkpoints.load_checkpoints().await?;
        self.emit(
            job.id,
            EventLevel::Warn,
            "self_heal.hard_reset",
            json!({
                "stepIndex": ctx.step_index,
                "resetsConsumed": controller.resets_consumed(),
                "replayedSteps": completed.len(),
            }),
        )
        .await;
        prepared
            .executor
            .replay(ctx, &completed)
            .await
            .map_err(|e| StageFailure::failed(e.to_string(), true))
    }

    async fn publish(
        &self,
        job: &Job,
        prepared: &PreparedJob,
        control: &JobControl,
    ) -> Result<Vec<ArtifactUpload>, StageFailure> {
        self.boundary(job.id, control).await?;
        let workspace = &prepared.workspace;
        let mut artifacts = self.log_artifacts(workspace).await;

        let context = fs::read(workspace.root().join(paths::CONTEXT))
            .await
            .map_err(WorkspaceError::from)?;
        artifacts.push(ArtifactUpload::new(paths::CONTEXT, context).with_content_type("application/json"));

        let checkpoints = CheckpointStore::new(workspace.state_dir())
            .load_checkpoints()
            .await?;
        let patch: String = checkpoints
            .iter()
            .filter_map(|c| c.patch.as_deref())
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !patch.is_empty() {
            artifacts.push(
                ArtifactUpload::new("patches/changes.patch", patch.into_bytes())
                    .with_content_type("text/x-diff"),
            );
        }

        let current = workspace.snapshot().await?;
        let changes = json!({
            "changedFiles": current.changed_since(&prepared.baseline),
            "diffHash": current.diff_hash(&prepared.baseline),
            "steps": checkpoints
                .iter()
                .map(|c| json!({ "stepId": c.step_id, "attempt": c.attempt, "summary": c.summary }))
                .collect::<Vec<_>>(),
        });
        artifacts.push(
            ArtifactUpload::new("changes.json", serde_json::to_vec_pretty(&changes).map_err(WorkspaceError::from)?)
                .with_content_type("application/json"),
        );
        debug!(job_id = %job.id, count = artifacts.len(), "Artifacts staged for publish");
        Ok(artifacts)
    }

    /// Non-empty stage logs as uploads.
    async fn log_artifacts(&self, workspace: &JobWorkspace) -> Vec<ArtifactUpload> {
        let mut artifacts = Vec::new();
        for stage in [Stage::Prepare, Stage::Execute] {
            match workspace.read_log(stage.as_str()).await {
                Ok(log) if !log.is_empty() => artifacts.push(
                    ArtifactUpload::new(format!("logs/{}.log", stage.as_str()), log)
                        .with_content_type("text/plain"),
                ),
                Ok(_) => {}
                Err(e) => warn!(job_id = %workspace.job_id(), error = %e, "Failed to read stage log"),
            }
        }
        artifacts
    }

    /// Honor cancel and pause at a boundary.
    ///
    /// A pause holds here until cleared. A cancel or lost lease during the
    /// pause ends the wait.
    async fn boundary(&self, job_id: Uuid, control: &JobControl) -> Result<(), StageFailure> {
        if let Some(signal) = control.stop_signal() {
            return Err(StageFailure::Stopped(signal));
        }
        if !control.is_paused() {
            return Ok(());
        }

        info!(job_id = %job_id, "Job paused");
        self.emit(
            job_id,
            EventLevel::Warn,
            "task.control.pause.active",
            json!({ "status": "paused" }),
        )
        .await;

        let mut stop = control.stop.clone();
        let mut paused = control.paused.clone();
        loop {
            if let Some(signal) = *stop.borrow_and_update() {
                return Err(StageFailure::Stopped(signal));
            }
            if !*paused.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Err(StageFailure::Stopped(StopSignal::LeaseLost));
                    }
                }
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Err(StageFailure::Stopped(StopSignal::LeaseLost));
                    }
                }
            }
        }

        info!(job_id = %job_id, "Job resumed");
        self.emit(
            job_id,
            EventLevel::Info,
            "task.control.pause.cleared",
            json!({ "status": "running" }),
        )
        .await;
        Ok(())
    }

    async fn report(&self, job: &Job, outcome: JobOutcome) {
        let worker_id = self.config.worker_id.as_str();
        match outcome {
            JobOutcome::Succeeded { summary, artifacts } => {
                let result = match self
                    .api
                    .complete(job.id, worker_id, Some(summary.clone()), artifacts)
                    .await
                {
                    Err(e) if e.kind() == "validation" => {
                        warn!(job_id = %job.id, error = %e, "Artifact upload rejected; completing without artifacts");
                        self.api
                            .complete(job.id, worker_id, Some(summary), Vec::new())
                            .await
                    }
                    other => other,
                };
                match result {
                    Ok(job) => info!(job_id = %job.id, "Job completed"),
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to report completion"),
                }
            }
            JobOutcome::Failed {
                message,
                retryable,
                artifacts,
            } => {
                let result = match self
                    .api
                    .fail(job.id, worker_id, &message, retryable, artifacts)
                    .await
                {
                    Err(e) if e.kind() == "validation" => {
                        self.api
                            .fail(job.id, worker_id, &message, retryable, Vec::new())
                            .await
                    }
                    other => other,
                };
                match result {
                    Ok(job) => info!(
                        job_id = %job.id,
                        status = %job.status,
                        retryable,
                        "Job failure reported"
                    ),
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to report failure"),
                }
            }
            JobOutcome::Stopped(StopSignal::LeaseLost) => {
                warn!(job_id = %job.id, "Lease lost; abandoning job without reporting");
            }
            JobOutcome::Stopped(StopSignal::CancelRequested) => {
                self.acknowledge_cancel(job).await;
            }
        }
    }

    async fn acknowledge_cancel(&self, job: &Job) {
        let worker_id = self.config.worker_id.as_str();
        self.emit(
            job.id,
            EventLevel::Warn,
            "Job cancellation requested; stopping",
            json!({ "workerId": worker_id }),
        )
        .await;
        match self
            .api
            .ack_cancel(job.id, worker_id, Some("stopped by worker".to_string()))
            .await
        {
            Ok(job) => info!(job_id = %job.id, "Cancellation acknowledged"),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Cancel ack failed; failing job instead");
                if let Err(e) = self
                    .api
                    .fail(
                        job.id,
                        worker_id,
                        "cancellation requested but cancel ack failed",
                        false,
                        Vec::new(),
                    )
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "Failed to report cancel fallback");
                }
            }
        }
    }

    /// Append a job event, logging instead of failing.
    async fn emit(&self, job_id: Uuid, level: EventLevel, message: &str, payload: serde_json::Value) {
        if let Err(e) = self
            .api
            .append_event(job_id, level, message, Some(payload))
            .await
        {
            warn!(job_id = %job_id, error = %e, event = message, "Failed to append job event");
        }
    }
}

/// Resolve once a stop signal is raised. Never resolves if the sender is gone
/// without one.
async fn wait_for_stop(mut stop: watch::Receiver<Option<StopSignal>>) -> StopSignal {
    loop {
        if let Some(signal) = *stop.borrow_and_update() {
            return signal;
        }
        if stop.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
