//! Pure transition decisions for lease expiry and failure reports.
//!
//! The store applies these inside its write transaction. Keeping them free
//! of I/O lets every branch be tested directly.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::QueueConfig;
use crate::queue::model::{FailAction, Job};

/// Message recorded when lease expiry exhausts the attempt budget.
pub const LEASE_EXHAUSTED_MESSAGE: &str =
    "Lease expired and max attempts reached before reclaim.";

/// What to do with a running job whose lease has expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseExpiry {
    /// A cancel was pending. Finish as cancelled.
    Cancel,
    /// Out of attempts.
    DeadLetter { error_message: String },
    /// Requeue with the next attempt number.
    Requeue {
        attempt: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    },
}

/// What to do with a job-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailDecision {
    pub action: FailAction,
    pub attempt: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Retry timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub lease_retry_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            lease_retry_delay: config.lease_retry_delay,
            backoff_base: config.retry_backoff_base,
            backoff_max: config.retry_backoff_max,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given attempt failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = 1u32 << exponent;
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Decide the fate of a job whose lease expired.
    pub fn on_lease_expired(&self, job: &Job, now: DateTime<Utc>) -> LeaseExpiry {
        if job.cancel_requested_at.is_some() {
            return LeaseExpiry::Cancel;
        }
        if job.attempt >= job.max_attempts {
            return LeaseExpiry::DeadLetter {
                error_message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| LEASE_EXHAUSTED_MESSAGE.to_string()),
            };
        }
        LeaseExpiry::Requeue {
            attempt: job.attempt + 1,
            next_attempt_at: delay_from(now, self.lease_retry_delay),
        }
    }

    /// Decide the fate of a failure reported by the owning worker.
    pub fn on_failure(&self, job: &Job, retryable: bool, now: DateTime<Utc>) -> FailDecision {
        if job.cancel_requested_at.is_some() {
            return FailDecision {
                action: FailAction::Cancelled,
                attempt: job.attempt,
                next_attempt_at: None,
            };
        }
        if !retryable {
            return FailDecision {
                action: FailAction::Failed,
                attempt: job.attempt,
                next_attempt_at: None,
            };
        }
        if job.attempt >= job.max_attempts {
            return FailDecision {
                action: FailAction::DeadLettered,
                attempt: job.attempt,
                next_attempt_at: None,
            };
        }
        FailDecision {
            action: FailAction::Requeued,
            attempt: job.attempt + 1,
            next_attempt_at: delay_from(now, self.backoff(job.attempt)),
        }
    }
}

fn delay_from(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        return None;
    }
    chrono::Duration::from_std(delay).ok().map(|d| now + d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::{JobStatus, NewJob};

    fn running(attempt: u32, max_attempts: u32) -> Job {
        let mut job = Job::new(NewJob::new("task", serde_json::json!({})).with_max_attempts(max_attempts));
        job.status = JobStatus::Running;
        job.claimed_by = Some("w1".into());
        job.attempt = attempt;
        job
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(15));
        assert_eq!(policy.backoff(2), Duration::from_secs(30));
        assert_eq!(policy.backoff(3), Duration::from_secs(60));
        assert_eq!(policy.backoff(10), Duration::from_secs(600));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn zero_base_means_immediate() {
        let policy = RetryPolicy {
            backoff_base: Duration::ZERO,
            ..Default::default()
        };
        let decision = policy.on_failure(&running(1, 3), true, Utc::now());
        assert_eq!(decision.action, FailAction::Requeued);
        assert_eq!(decision.next_attempt_at, None);
    }

    #[test]
    fn lease_expiry_requeues_below_budget() {
        let policy = RetryPolicy::default();
        let decision = policy.on_lease_expired(&running(1, 3), Utc::now());
        assert_eq!(
            decision,
            LeaseExpiry::Requeue {
                attempt: 2,
                next_attempt_at: None
            }
        );
    }

    #[test]
    fn lease_expiry_dead_letters_at_budget() {
        let policy = RetryPolicy::default();
        let decision = policy.on_lease_expired(&running(3, 3), Utc::now());
        assert_eq!(
            decision,
            LeaseExpiry::DeadLetter {
                error_message: LEASE_EXHAUSTED_MESSAGE.to_string()
            }
        );
    }

    #[test]
    fn pending_cancel_wins_over_requeue() {
        let policy = RetryPolicy::default();
        let mut job = running(1, 3);
        job.cancel_requested_at = Some(Utc::now());
        assert_eq!(policy.on_lease_expired(&job, Utc::now()), LeaseExpiry::Cancel);
        assert_eq!(
            policy.on_failure(&job, true, Utc::now()).action,
            FailAction::Cancelled
        );
        assert_eq!(
            policy.on_failure(&job, false, Utc::now()).action,
            FailAction::Cancelled
        );
    }

    #[test]
    fn failure_branches() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let requeue = policy.on_failure(&running(1, 3), true, now);
        assert_eq!(requeue.action, FailAction::Requeued);
        assert_eq!(requeue.attempt, 2);
        assert_eq!(requeue.next_attempt_at, Some(now + chrono::Duration::seconds(15)));

        let dead = policy.on_failure(&running(3, 3), true, now);
        assert_eq!(dead.action, FailAction::DeadLettered);
        assert_eq!(dead.attempt, 3);

        let failed = policy.on_failure(&running(1, 3), false, now);
        assert_eq!(failed.action, FailAction::Failed);
    }
}
