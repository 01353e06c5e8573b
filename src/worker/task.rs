//! Job contract resolution: turn a claimed job's payload into ordered steps.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::queue::model::Job;

/// Job type with a multi-step payload.
pub const TASK_JOB_TYPE: &str = "task";

/// Job type with a single command payload.
pub const EXEC_JOB_TYPE: &str = "exec";

/// What the publish stage does after every step succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Skip publish.
    None,
    /// Upload stage logs and the accumulated patch.
    #[default]
    Artifacts,
}

/// One resolved step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub id: String,
    pub index: usize,
    pub title: Option<String>,
    pub instructions: String,
}

impl StepSpec {
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

/// The resolved contract for a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(rename = "type")]
    pub job_type: String,
    pub runtime: String,
    pub steps: Vec<StepSpec>,
    pub publish: PublishMode,
    pub repository: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPayload {
    runtime: String,
    #[serde(default)]
    steps: Vec<TaskStep>,
    #[serde(default)]
    publish: Option<PublishMode>,
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskStep {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecPayload {
    runtime: String,
    instructions: String,
    #[serde(default)]
    publish: Option<PublishMode>,
    #[serde(default)]
    repository: Option<String>,
}

impl JobSpec {
    /// Resolve the contract for `job`.
    ///
    /// Unknown types and malformed payloads are errors the worker reports
    /// as non-retryable.
    pub fn from_job(job: &Job) -> Result<Self, WorkspaceError> {
        match job.job_type.as_str() {
            TASK_JOB_TYPE => Self::from_task(job),
            EXEC_JOB_TYPE => Self::from_exec(job),
            other => Err(WorkspaceError::InvalidPayload(format!(
                "unsupported job type: {other}"
            ))),
        }
    }

    fn from_task(job: &Job) -> Result<Self, WorkspaceError> {
        let payload: TaskPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| WorkspaceError::InvalidPayload(e.to_string()))?;
        let runtime = required(&payload.runtime, "runtime")?;
        if payload.steps.is_empty() {
            return Err(WorkspaceError::InvalidPayload(
                "task payload needs at least one step".into(),
            ));
        }

        let default_instructions = payload
            .instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(payload.steps.len());
        for (index, step) in payload.steps.into_iter().enumerate() {
            let id = required(&step.id, "steps[].id")?;
            if !seen.insert(id.clone()) {
                return Err(WorkspaceError::InvalidPayload(format!(
                    "duplicate step id: {id}"
                )));
            }
            let instructions = step
                .instructions
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .or(default_instructions)
                .ok_or_else(|| {
                    WorkspaceError::InvalidPayload(format!("step {id} has no instructions"))
                })?
                .to_string();
            steps.push(StepSpec {
                id,
                index,
                title: step.title.filter(|t| !t.trim().is_empty()),
                instructions,
            });
        }

        Ok(Self {
            job_type: TASK_JOB_TYPE.to_string(),
            runtime,
            steps,
            publish: payload.publish.unwrap_or_default(),
            repository: payload.repository,
        })
    }

    fn from_exec(job: &Job) -> Result<Self, WorkspaceError> {
        let payload: ExecPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| WorkspaceError::InvalidPayload(e.to_string()))?;
        let runtime = required(&payload.runtime, "runtime")?;
        let instructions = required(&payload.instructions, "instructions")?;
        Ok(Self {
            job_type: EXEC_JOB_TYPE.to_string(),
            runtime,
            steps: vec![StepSpec {
                id: "exec".to_string(),
                index: 0,
                title: None,
                instructions,
            }],
            publish: payload.publish.unwrap_or_default(),
            repository: payload.repository,
        })
    }
}

fn required(value: &str, field: &str) -> Result<String, WorkspaceError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(WorkspaceError::InvalidPayload(format!("{field} is required")));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::NewJob;

    fn job(job_type: &str, payload: serde_json::Value) -> Job {
        Job::new(NewJob::new(job_type, payload))
    }

    #[test]
    fn task_steps_resolve_in_order() {
        let spec = JobSpec::from_job(&job(
            "task",
            serde_json::json!({
                "runtime": "shell",
                "instructions": "make test",
                "steps": [
                    {"id": "build", "title": "Build", "instructions": "make"},
                    {"id": "test"}
                ],
                "publish": "none"
            }),
        ))
        .unwrap();

        assert_eq!(spec.runtime, "shell");
        assert_eq!(spec.publish, PublishMode::None);
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[0].label(), "Build");
        assert_eq!(spec.steps[1].index, 1);
        assert_eq!(spec.steps[1].instructions, "make test");
        assert_eq!(spec.steps[1].label(), "test");
    }

    #[test]
    fn exec_is_a_single_step() {
        let spec = JobSpec::from_job(&job(
            "exec",
            serde_json::json!({"runtime": "shell", "instructions": "echo hi"}),
        ))
        .unwrap();
        assert_eq!(spec.steps.len(), 1);
        assert_eq!(spec.steps[0].instructions, "echo hi");
        assert_eq!(spec.publish, PublishMode::Artifacts);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let cases = [
            job("deploy", serde_json::json!({"runtime": "shell"})),
            job("task", serde_json::json!({"runtime": "shell", "steps": []})),
            job("task", serde_json::json!({"steps": [{"id": "a", "instructions": "x"}]})),
            job("task", serde_json::json!({"runtime": "shell", "steps": [{"id": "a"}]})),
            job(
                "task",
                serde_json::json!({
                    "runtime": "shell",
                    "steps": [
                        {"id": "a", "instructions": "x"},
                        {"id": "a", "instructions": "y"}
                    ]
                }),
            ),
            job("exec", serde_json::json!({"runtime": "shell", "instructions": "  "})),
            job("exec", serde_json::json!({"runtime": "shell", "publish": "everything", "instructions": "x"})),
        ];
        for case in cases {
            assert!(
                matches!(JobSpec::from_job(&case), Err(WorkspaceError::InvalidPayload(_))),
                "payload should be rejected: {}",
                case.payload
            );
        }
    }
}
