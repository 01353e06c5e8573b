//! Lease renewal loop for the job a worker is running.
//!
//! The heartbeat response is the worker's only inbound channel: it echoes
//! `cancelRequestedAt` and the job's `liveControl.paused` flag. Both are
//! republished on `watch` channels the pipeline checks at its boundaries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::queue::QueueApi;
use crate::queue::model::{Job, JobStatus};

/// Why the pipeline must stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// A cancel was requested. The worker acknowledges it.
    CancelRequested,
    /// The lease is gone. The worker must not report on the job again.
    LeaseLost,
}

/// Receiving side of the control flags.
#[derive(Debug, Clone)]
pub struct JobControl {
    pub stop: watch::Receiver<Option<StopSignal>>,
    pub paused: watch::Receiver<bool>,
}

impl JobControl {
    /// Control handle that never fires, for tests and replays.
    pub fn detached() -> (Self, watch::Sender<Option<StopSignal>>, watch::Sender<bool>) {
        let (stop_tx, stop) = watch::channel(None);
        let (pause_tx, paused) = watch::channel(false);
        (Self { stop, paused }, stop_tx, pause_tx)
    }

    pub fn stop_signal(&self) -> Option<StopSignal> {
        *self.stop.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

/// Running heartbeat task. Dropping it without `stop` aborts the task.
#[derive(Debug)]
pub struct Heartbeat {
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawn the heartbeat loop for `job`.
    ///
    /// The initial flags come from the claimed job itself so a cancel or
    /// pause requested before the claim is seen immediately.
    pub fn spawn(
        api: Arc<dyn QueueApi>,
        job: &Job,
        worker_id: String,
        lease_seconds: u32,
        interval: Duration,
    ) -> (Self, JobControl) {
        let (stop_tx, stop) = watch::channel(initial_stop(job));
        let (pause_tx, paused) = watch::channel(paused_flag(job));
        let job_id = job.id;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately. The claim already set the lease.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match api.heartbeat(job_id, &worker_id, lease_seconds).await {
                    Ok(job) => {
                        apply(&job, &stop_tx, &pause_tx);
                        if job.status != JobStatus::Running {
                            break;
                        }
                    }
                    Err(e) if lease_lost(&e) => {
                        warn!(job_id = %job_id, worker_id = %worker_id, error = %e, "Lease lost");
                        stop_tx.send_replace(Some(StopSignal::LeaseLost));
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Heartbeat failed; will retry");
                    }
                }
            }
            debug!(job_id = %job_id, "Heartbeat loop finished");
        });

        (
            Self {
                handle: Some(handle),
            },
            JobControl { stop, paused },
        )
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn apply(job: &Job, stop_tx: &watch::Sender<Option<StopSignal>>, pause_tx: &watch::Sender<bool>) {
    let signal = match job.status {
        JobStatus::Running if job.cancel_requested_at.is_some() => Some(StopSignal::CancelRequested),
        JobStatus::Running => None,
        // Reclaimed or finished elsewhere.
        _ => Some(StopSignal::LeaseLost),
    };
    if signal.is_some() {
        stop_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = signal;
                true
            } else {
                false
            }
        });
    }
    let paused = paused_flag(job);
    pause_tx.send_if_modified(|current| {
        if *current != paused {
            *current = paused;
            true
        } else {
            false
        }
    });
}

fn initial_stop(job: &Job) -> Option<StopSignal> {
    job.cancel_requested_at
        .is_some()
        .then_some(StopSignal::CancelRequested)
}

/// `payload.liveControl.paused`, false when absent.
pub fn paused_flag(job: &Job) -> bool {
    job.payload
        .get("liveControl")
        .and_then(|c| c.get("paused"))
        .and_then(|p| p.as_bool())
        .unwrap_or(false)
}

fn lease_lost(error: &QueueError) -> bool {
    matches!(
        error,
        QueueError::Ownership { .. } | QueueError::InvalidState { .. } | QueueError::JobNotFound(_)
    )
}
