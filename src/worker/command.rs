//! Built-in executor that runs a step's instructions as a shell command.
//!
//! Provides:
//! - execution inside the job's `repo/` directory
//! - line-by-line output streaming to the progress sink, with invalid
//!   UTF-8 replaced instead of ending the stream
//! - output capture and truncation for the step summary
//! - blocked command patterns, reported as policy failures
//!
//! The child is spawned with `kill_on_drop`, so the attempt runner's
//! timeouts terminate it by dropping the future.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::ExecutorError;
use crate::worker::executor::{ProgressSink, StepContext, StepExecutor, StepOutcome};
use crate::worker::task::StepSpec;

/// Runtime name of the built-in executor.
pub const SHELL_RUNTIME: &str = "shell";

/// Maximum captured output before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Tail of the output used as the step summary.
const SUMMARY_TAIL: usize = 2 * 1024;

/// Commands that are always blocked.
static BLOCKED_COMMANDS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:", // Fork bomb
        "dd if=/dev/zero of=/dev/",
        "mkfs",
        "chmod -r 777 /",
        "> /dev/sda",
        "curl | sh",
        "wget | sh",
        "curl | bash",
        "wget | bash",
    ]
});

/// Check whether a command matches a blocked pattern.
pub fn blocked_reason(command: &str) -> Option<&'static str> {
    let normalized = command.to_lowercase();
    BLOCKED_COMMANDS
        .iter()
        .any(|blocked| normalized.contains(blocked))
        .then_some("command blocked by policy")
}

/// Shell command step executor.
#[derive(Debug, Default)]
pub struct CommandExecutor {
    /// Extra environment passed to every step.
    env: HashMap<String, String>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for every step.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build_command(&self, ctx: &StepContext, step: &StepSpec) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &step.instructions]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &step.instructions]);
            c
        };

        command
            .current_dir(&ctx.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .envs(&self.env)
            .env("AGENT_QUEUE_JOB_ID", ctx.job_id.to_string())
            .env("AGENT_QUEUE_STEP_ID", &step.id)
            .env("AGENT_QUEUE_STEP_INDEX", ctx.step_index.to_string())
            .env("AGENT_QUEUE_STEP_ATTEMPT", ctx.attempt.to_string())
            .env("AGENT_QUEUE_STATE_DIR", &ctx.state_dir);

        if let Some(retry) = &ctx.retry {
            command
                .env("AGENT_QUEUE_RETRY_SUMMARY", &retry.failure_summary)
                .env("AGENT_QUEUE_CHANGED_FILES", retry.changed_files.join("\n"))
                .env("AGENT_QUEUE_HARD_RESET", if retry.hard_reset { "1" } else { "0" });
        }
        command
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    fn runtime(&self) -> &str {
        SHELL_RUNTIME
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        step: &StepSpec,
        progress: &ProgressSink,
    ) -> Result<StepOutcome, ExecutorError> {
        if let Some(reason) = blocked_reason(&step.instructions) {
            return Ok(StepOutcome::failed(format!(
                "{reason}: {}",
                truncate_for_error(&step.instructions)
            ))
            .with_failure_hint("policy"));
        }

        let mut child = self
            .build_command(ctx, step)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed {
                step_id: step.id.clone(),
                reason: e.to_string(),
            })?;

        let mut stdout = child.stdout.take().map(LossyLines::new);
        let mut stderr = child.stderr.take().map(LossyLines::new);
        let mut output = OutputBuffer::default();

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        progress.report(line.clone());
                        output.push(&line);
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        progress.report(line.clone());
                        output.push(&line);
                    }
                    None => stderr = None,
                },
            }
        }

        let status = child.wait().await.map_err(|e| ExecutorError::Interrupted {
            step_id: step.id.clone(),
            reason: e.to_string(),
        })?;
        let captured = output.finish();
        let summary = summary_tail(&captured);

        Ok(match status.code() {
            Some(0) => {
                let summary = if summary.is_empty() {
                    format!("Step {} completed", step.id)
                } else {
                    summary
                };
                StepOutcome::succeeded(summary).with_exit_code(0)
            }
            Some(code) => {
                let summary = if summary.is_empty() {
                    format!("Step {} exited with code {code}", step.id)
                } else {
                    summary
                };
                StepOutcome::failed(summary).with_exit_code(code)
            }
            None => StepOutcome::failed(format!("Step {} was terminated by a signal", step.id))
                .with_failure_hint("interrupted"),
        })
    }
}

/// Line reader over child output that never stops on bad bytes.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    ///
    /// Cancel safe: bytes of a partial line stay in `buf` for the next call.
    async fn next_line(&mut self) -> Option<String> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await;
        if self.buf.is_empty() {
            return None;
        }
        if let Err(e) = read {
            tracing::debug!(error = %e, "Output stream read failed");
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

async fn next_line<R>(lines: &mut Option<LossyLines<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

/// Keeps the head and tail of the output within `MAX_OUTPUT_SIZE`.
#[derive(Debug, Default)]
struct OutputBuffer {
    head: String,
    tail: VecDeque<String>,
    tail_bytes: usize,
    dropped: usize,
}

impl OutputBuffer {
    fn push(&mut self, line: &str) {
        // Leaves room for the truncation marker.
        let half = MAX_OUTPUT_SIZE / 2 - 128;
        if self.head.len() + line.len() < half && self.tail.is_empty() {
            self.head.push_str(line);
            self.head.push('\n');
            return;
        }
        self.tail.push_back(format!("{line}\n"));
        self.tail_bytes += line.len() + 1;
        while self.tail_bytes > half && self.tail.len() > 1 {
            if let Some(old) = self.tail.pop_front() {
                self.tail_bytes -= old.len();
                self.dropped += old.len();
            }
        }
    }

    fn finish(self) -> String {
        let tail: String = self.tail.into_iter().collect();
        let joined = if self.dropped > 0 {
            format!(
                "{}\n... [truncated {} bytes] ...\n\n{}",
                self.head, self.dropped, tail
            )
        } else {
            format!("{}{}", self.head, tail)
        };
        truncate_output(joined.trim_end())
    }
}

/// Last `SUMMARY_TAIL` bytes of the output (UTF-8 safe).
fn summary_tail(output: &str) -> String {
    let output = output.trim();
    if output.len() <= SUMMARY_TAIL {
        return output.to_string();
    }
    let start = ceil_char_boundary(output, output.len() - SUMMARY_TAIL);
    output[start..].to_string()
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = ceil_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            tail_start - head_end,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Find the smallest byte index >= `i` that is a valid char boundary.
fn ceil_char_boundary(s: &str, i: usize) -> usize {
    let mut pos = i.min(s.len());
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

/// Truncate command for error messages.
fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}
