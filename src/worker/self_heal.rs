//! Bounded step retries with no-progress detection.
//!
//! Each step gets `step_max_attempts` attempts. A failure whose signature
//! fingerprint and diff hash both match the previous attempt counts as no
//! progress. Reaching `step_no_progress_limit` consecutive no-progress
//! failures escalates to a hard reset, bounded per job by
//! `job_self_heal_max_resets`.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SelfHealConfig;
use crate::error::{ExecutorError, SelfHealError};
use crate::safety::SecretRedactor;
use crate::worker::executor::StepOutcome;

/// Failure buckets that drive the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    NoProgress,
    Deterministic,
}

impl FailureClass {
    /// Transient and no-progress failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::NoProgress)
    }
}

/// What happens before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfHealStrategy {
    None,
    /// Retry in the same workspace with reduced context.
    SoftReset,
    /// Rebuild the workspace from checkpoints, then retry.
    HardReset,
    /// Give up on the step and fail the job as retryable.
    QueueRetry,
    /// Give up on the job without retry.
    Abort,
}

static DETERMINISTIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bvalidation\b",
        r"(?i)\binvalid (input|payload|argument|configuration)\b",
        r"(?i)\bschema\b",
        r"(?i)\bpermission denied\b",
        r"(?i)\bforbidden\b",
        r"(?i)\bunauthori[sz]ed\b",
        r"(?i)\bpolicy\b",
        r"(?i)\bcapabilit(y|ies)\b",
        r"(?i)\bnot supported\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Lines of command output worth matching against the deterministic patterns.
static ERROR_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(^\s*(error|fatal)\b|\berror:|\bdenied\b|\bforbidden\b|\bunauthori[sz]ed\b)")
        .ok()
});

/// Exit codes a shell reports for a missing or non-executable command.
const DETERMINISTIC_EXIT_CODES: &[i32] = &[126, 127];

/// Lowercase a failure hint and turn `_`/`-` separators into spaces.
fn normalize_hint(hint: &str) -> String {
    hint.trim().to_lowercase().replace(['_', '-'], " ")
}

fn is_deterministic_text(text: &str) -> bool {
    DETERMINISTIC_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Error lines pulled from a summary. Plain test output is skipped.
fn error_lines(summary: &str) -> impl Iterator<Item = &str> {
    summary
        .lines()
        .filter(|line| ERROR_LINE.as_ref().is_some_and(|re| re.is_match(line)))
}

/// Classify a failed attempt from its outcome alone.
///
/// Patterns run against the hint and the summary's error lines only.
/// No-progress is not visible here. It comes from the attempt history.
pub fn classify_outcome(outcome: &StepOutcome) -> FailureClass {
    let hint_matches = outcome
        .failure_hint
        .as_deref()
        .is_some_and(|hint| is_deterministic_text(&normalize_hint(hint)));
    let deterministic = hint_matches
        || error_lines(&outcome.summary).any(is_deterministic_text)
        || outcome
            .exit_code
            .is_some_and(|code| DETERMINISTIC_EXIT_CODES.contains(&code));
    if deterministic {
        FailureClass::Deterministic
    } else {
        FailureClass::Transient
    }
}

/// Classify an executor error.
pub fn classify_error(error: &ExecutorError) -> FailureClass {
    match error {
        ExecutorError::UnknownRuntime(_) | ExecutorError::SpawnFailed { .. } => {
            FailureClass::Deterministic
        }
        ExecutorError::Timeout { .. }
        | ExecutorError::IdleTimeout { .. }
        | ExecutorError::Interrupted { .. }
        | ExecutorError::Replay(_) => FailureClass::Transient,
    }
}

/// Normalized, scrubbed signature of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignature {
    pub value: String,
    /// Hex sha256 of `value`.
    pub fingerprint: String,
}

impl FailureSignature {
    /// Build a signature from the failure's parts.
    ///
    /// Returns `None` when there is nothing to sign.
    pub fn build(
        step_id: Option<&str>,
        exit_code: Option<i32>,
        failure_hint: Option<&str>,
        message: Option<&str>,
        redactor: &SecretRedactor,
    ) -> Option<Self> {
        let mut parts = Vec::new();
        if let Some(step_id) = step_id.filter(|s| !s.is_empty()) {
            parts.push(format!("step:{step_id}"));
        }
        if let Some(code) = exit_code {
            parts.push(format!("exit:{code}"));
        }
        if let Some(hint) = failure_hint.filter(|s| !s.is_empty()) {
            parts.push(format!("hint:{hint}"));
        }
        if let Some(message) = message.filter(|s| !s.trim().is_empty()) {
            parts.push(message.to_string());
        }
        if parts.is_empty() {
            return None;
        }

        let joined = collapse_whitespace(&parts.join(" | "));
        let value = collapse_whitespace(&redactor.scrub(&joined).to_lowercase());
        let fingerprint = format!("{:x}", Sha256::digest(value.as_bytes()));
        Some(Self { value, fingerprint })
    }

    pub fn matches(&self, other: Option<&FailureSignature>) -> bool {
        other.is_some_and(|o| o.fingerprint == self.fingerprint)
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Bookkeeping for one step's attempts.
#[derive(Debug, Clone)]
pub struct StepAttemptState {
    pub step_id: String,
    pub step_index: usize,
    pub attempts_consumed: u32,
    pub consecutive_no_progress: u32,
    last_signature: Option<FailureSignature>,
    last_diff_hash: Option<String>,
}

impl StepAttemptState {
    pub fn new(step_id: impl Into<String>, step_index: usize) -> Self {
        Self {
            step_id: step_id.into(),
            step_index,
            attempts_consumed: 0,
            consecutive_no_progress: 0,
            last_signature: None,
            last_diff_hash: None,
        }
    }

    /// Reserve the next attempt number.
    pub fn next_attempt(&mut self, max_attempts: u32) -> Result<u32, SelfHealError> {
        if self.attempts_consumed >= max_attempts {
            return Err(SelfHealError::AttemptBudgetExceeded {
                step_id: self.step_id.clone(),
                max: max_attempts,
            });
        }
        self.attempts_consumed += 1;
        Ok(self.attempts_consumed)
    }

    /// Track a failure. Returns true when it repeats the previous one.
    pub fn record_failure(
        &mut self,
        signature: Option<FailureSignature>,
        diff_hash: Option<String>,
    ) -> bool {
        let matched = signature
            .as_ref()
            .is_some_and(|s| s.matches(self.last_signature.as_ref()))
            && diff_hash == self.last_diff_hash;
        if matched {
            self.consecutive_no_progress += 1;
        } else {
            self.consecutive_no_progress = u32::from(signature.is_some());
        }
        self.last_signature = signature;
        self.last_diff_hash = diff_hash;
        matched
    }

    /// Clear the no-progress window.
    pub fn reset_no_progress(&mut self) {
        self.consecutive_no_progress = 0;
        self.last_signature = None;
        self.last_diff_hash = None;
    }
}

/// Persisted record of one step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAttempt {
    pub step_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_class: Option<FailureClass>,
    pub failure_signature: Option<String>,
    pub failure_signature_hash: Option<String>,
    pub diff_hash: Option<String>,
    pub changed_files: Vec<String>,
    pub strategy: SelfHealStrategy,
}

impl StepAttempt {
    pub fn begin(step_id: impl Into<String>, step_index: usize, attempt: u32) -> Self {
        Self {
            step_id: step_id.into(),
            step_index,
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            failure_class: None,
            failure_signature: None,
            failure_signature_hash: None,
            diff_hash: None,
            changed_files: Vec::new(),
            strategy: SelfHealStrategy::None,
        }
    }
}

/// A failed attempt as seen by the controller.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub class: FailureClass,
    pub signature: Option<FailureSignature>,
    pub diff_hash: Option<String>,
}

/// Controller verdict for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureVerdict {
    pub class: FailureClass,
    pub strategy: SelfHealStrategy,
}

/// Coordinates self-heal budgets for the steps of one job.
#[derive(Debug)]
pub struct SelfHealController {
    config: SelfHealConfig,
    redactor: Arc<SecretRedactor>,
    resets_consumed: u32,
    active: Option<StepAttemptState>,
}

impl SelfHealController {
    pub fn new(config: SelfHealConfig, redactor: Arc<SecretRedactor>) -> Self {
        Self {
            config,
            redactor,
            resets_consumed: 0,
            active: None,
        }
    }

    pub fn config(&self) -> &SelfHealConfig {
        &self.config
    }

    pub fn active_step(&self) -> Option<&StepAttemptState> {
        self.active.as_ref()
    }

    pub fn resets_consumed(&self) -> u32 {
        self.resets_consumed
    }

    pub fn can_hard_reset(&self) -> bool {
        self.resets_consumed < self.config.job_self_heal_max_resets
    }

    /// Start tracking a new step.
    pub fn begin_step(&mut self, step_id: &str, step_index: usize) {
        self.active = Some(StepAttemptState::new(step_id, step_index));
    }

    /// Reserve an attempt for the active step.
    pub fn new_attempt(&mut self) -> Result<StepAttempt, SelfHealError> {
        let max = self.config.step_max_attempts;
        let state = self.active.as_mut().ok_or(SelfHealError::NoActiveStep)?;
        let attempt = state.next_attempt(max)?;
        Ok(StepAttempt::begin(&state.step_id, state.step_index, attempt))
    }

    pub fn reset_after_success(&mut self) {
        if let Some(state) = self.active.as_mut() {
            state.reset_no_progress();
        }
    }

    /// Consume one hard reset from the job budget.
    pub fn consume_hard_reset(&mut self) -> Result<(), SelfHealError> {
        let max = self.config.job_self_heal_max_resets;
        if self.resets_consumed >= max {
            return Err(SelfHealError::HardResetBudgetExceeded { max });
        }
        self.resets_consumed += 1;
        if let Some(state) = self.active.as_mut() {
            state.reset_no_progress();
        }
        Ok(())
    }

    /// Signature built with this controller's redactor.
    pub fn signature(
        &self,
        step_id: &str,
        exit_code: Option<i32>,
        failure_hint: Option<&str>,
        message: &str,
    ) -> Option<FailureSignature> {
        FailureSignature::build(
            Some(step_id),
            exit_code,
            failure_hint,
            Some(message),
            &self.redactor,
        )
    }

    /// Record a failed attempt and pick what happens next.
    ///
    /// Does not consume the hard reset budget. The caller does that once the
    /// rebuild is about to start.
    pub fn on_failure(&mut self, failure: AttemptFailure) -> Result<FailureVerdict, SelfHealError> {
        let limit = self.config.step_no_progress_limit;
        let max_attempts = self.config.step_max_attempts;
        let can_hard_reset = self.can_hard_reset();
        let state = self.active.as_mut().ok_or(SelfHealError::NoActiveStep)?;

        if failure.class == FailureClass::Deterministic {
            return Ok(FailureVerdict {
                class: FailureClass::Deterministic,
                strategy: SelfHealStrategy::Abort,
            });
        }

        let repeated = state.record_failure(failure.signature, failure.diff_hash);
        let class = if repeated {
            FailureClass::NoProgress
        } else {
            failure.class
        };

        let strategy = if state.attempts_consumed >= max_attempts {
            SelfHealStrategy::QueueRetry
        } else if state.consecutive_no_progress >= limit {
            if can_hard_reset {
                SelfHealStrategy::HardReset
            } else {
                SelfHealStrategy::QueueRetry
            }
        } else {
            SelfHealStrategy::SoftReset
        };
        Ok(FailureVerdict { class, strategy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: SelfHealConfig) -> SelfHealController {
        SelfHealController::new(config, Arc::new(SecretRedactor::new()))
    }

    fn failure(controller: &SelfHealController, message: &str, diff: &str) -> AttemptFailure {
        AttemptFailure {
            class: FailureClass::Transient,
            signature: controller.signature("build", Some(1), None, message),
            diff_hash: Some(diff.to_string()),
        }
    }

    #[test]
    fn signature_is_normalized_and_scrubbed() {
        let redactor = SecretRedactor::new();
        redactor.register("hunter2-secret");
        let a = FailureSignature::build(
            Some("build"),
            Some(1),
            Some("Compile"),
            Some("Error:   token hunter2-secret\n rejected"),
            &redactor,
        )
        .unwrap();
        assert_eq!(
            a.value,
            "step:build | exit:1 | hint:compile | error: token [redacted] rejected"
        );
        let b = FailureSignature::build(
            Some("build"),
            Some(1),
            Some("compile"),
            Some("error: token hunter2-secret rejected"),
            &redactor,
        )
        .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
        assert!(FailureSignature::build(None, None, None, Some("  "), &redactor).is_none());
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut state = StepAttemptState::new("s", 0);
        assert_eq!(state.next_attempt(2).unwrap(), 1);
        assert_eq!(state.next_attempt(2).unwrap(), 2);
        assert!(matches!(
            state.next_attempt(2),
            Err(SelfHealError::AttemptBudgetExceeded { max: 2, .. })
        ));
    }

    #[test]
    fn repeated_failures_escalate_to_hard_reset() {
        let mut c = controller(SelfHealConfig::default());
        c.begin_step("build", 0);

        c.new_attempt().unwrap();
        let first = c.on_failure(failure(&c, "boom", "d1")).unwrap();
        assert_eq!(first.class, FailureClass::Transient);
        assert_eq!(first.strategy, SelfHealStrategy::SoftReset);

        c.new_attempt().unwrap();
        let second = c.on_failure(failure(&c, "boom", "d1")).unwrap();
        assert_eq!(second.class, FailureClass::NoProgress);
        assert_eq!(second.strategy, SelfHealStrategy::HardReset);

        c.consume_hard_reset().unwrap();
        assert!(!c.can_hard_reset());
        assert_eq!(c.active_step().unwrap().consecutive_no_progress, 0);

        let third = c.new_attempt().unwrap();
        assert_eq!(third.attempt, 3);
        let verdict = c.on_failure(failure(&c, "boom", "d1")).unwrap();
        assert_eq!(verdict.strategy, SelfHealStrategy::QueueRetry);
        assert!(c.new_attempt().is_err());
    }

    #[test]
    fn changed_diff_is_progress() {
        let mut c = controller(SelfHealConfig::default());
        c.begin_step("build", 0);
        c.new_attempt().unwrap();
        c.on_failure(failure(&c, "boom", "d1")).unwrap();
        c.new_attempt().unwrap();
        let verdict = c.on_failure(failure(&c, "boom", "d2")).unwrap();
        assert_eq!(verdict.class, FailureClass::Transient);
        assert_eq!(verdict.strategy, SelfHealStrategy::SoftReset);
    }

    #[test]
    fn exhausted_reset_budget_fails_the_step() {
        let config = SelfHealConfig {
            step_max_attempts: 5,
            ..SelfHealConfig::default()
        };
        let mut c = controller(config);
        c.begin_step("build", 0);
        c.consume_hard_reset().unwrap();
        assert!(matches!(
            c.consume_hard_reset(),
            Err(SelfHealError::HardResetBudgetExceeded { max: 1 })
        ));

        c.new_attempt().unwrap();
        c.on_failure(failure(&c, "boom", "d1")).unwrap();
        c.new_attempt().unwrap();
        let verdict = c.on_failure(failure(&c, "boom", "d1")).unwrap();
        assert_eq!(verdict.strategy, SelfHealStrategy::QueueRetry);
    }

    #[test]
    fn deterministic_failures_abort() {
        let mut c = controller(SelfHealConfig::default());
        c.begin_step("build", 0);
        c.new_attempt().unwrap();
        let verdict = c
            .on_failure(AttemptFailure {
                class: FailureClass::Deterministic,
                signature: None,
                diff_hash: None,
            })
            .unwrap();
        assert_eq!(verdict.strategy, SelfHealStrategy::Abort);
        assert!(!verdict.class.is_retryable());
    }

    #[test]
    fn no_active_step_is_an_error() {
        let mut c = controller(SelfHealConfig::default());
        assert!(matches!(c.new_attempt(), Err(SelfHealError::NoActiveStep)));
    }

    #[test]
    fn test_output_mentioning_patterns_is_transient() {
        let outcome = StepOutcome::failed(
            "running 12 tests\ntest validation::parses_dates ... FAILED\ntest schema::loads ... ok\n... timeout",
        )
        .with_exit_code(1);
        assert_eq!(classify_outcome(&outcome), FailureClass::Transient);

        let outcome = StepOutcome::failed("checking policy docs\n2 capability tests failed")
            .with_exit_code(101);
        assert_eq!(classify_outcome(&outcome), FailureClass::Transient);
    }

    #[test]
    fn classification() {
        let outcome = StepOutcome::failed("Permission denied while writing").with_exit_code(1);
        assert_eq!(classify_outcome(&outcome), FailureClass::Deterministic);

        let outcome = StepOutcome::failed("tests failed").with_failure_hint("schema_mismatch");
        assert_eq!(classify_outcome(&outcome), FailureClass::Deterministic);

        let outcome = StepOutcome::failed("sh: frobnicate: not found").with_exit_code(127);
        assert_eq!(classify_outcome(&outcome), FailureClass::Deterministic);

        let outcome = StepOutcome::failed("3 tests failed").with_exit_code(1);
        assert_eq!(classify_outcome(&outcome), FailureClass::Transient);

        let outcome = StepOutcome::failed("write failed").with_failure_hint("permission_denied");
        assert_eq!(classify_outcome(&outcome), FailureClass::Deterministic);

        let outcome = StepOutcome::failed("blocked").with_failure_hint("Invalid-Input");
        assert_eq!(classify_outcome(&outcome), FailureClass::Deterministic);

        let outcome = StepOutcome::failed("error: unsupported schema version 3").with_exit_code(2);
        assert_eq!(classify_outcome(&outcome), FailureClass::Deterministic);

        let timeout = ExecutorError::Timeout {
            step_id: "s".into(),
            timeout: std::time::Duration::from_secs(1),
        };
        assert_eq!(classify_error(&timeout), FailureClass::Transient);
        assert_eq!(
            classify_error(&ExecutorError::UnknownRuntime("x".into())),
            FailureClass::Deterministic
        );
    }
}
