//! Append-only JSON checkpoints under a job's `state/` directory.
//!
//! Layout:
//! - `steps/step-{index:04}-{attempt:04}.json`: successful step checkpoints
//! - `self_heal/attempt-{index:04}-{attempt:04}.json`: every attempt record

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::WorkspaceError;
use crate::worker::self_heal::StepAttempt;

/// State recorded after a step succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: Uuid,
    pub step_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub summary: String,
    pub diff_hash: Option<String>,
    pub changed_files: Vec<String>,
    pub patch: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Reads and writes checkpoint files for one job.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    state_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn steps_dir(&self) -> PathBuf {
        self.state_dir.join("steps")
    }

    fn attempts_dir(&self) -> PathBuf {
        self.state_dir.join("self_heal")
    }

    /// Persist a successful step. Earlier files are never overwritten.
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<PathBuf, WorkspaceError> {
        let path = self.steps_dir().join(format!(
            "step-{:04}-{:04}.json",
            checkpoint.step_index, checkpoint.attempt
        ));
        write_json(&path, checkpoint).await?;
        Ok(path)
    }

    /// Persist an attempt record.
    pub async fn write_attempt(&self, attempt: &StepAttempt) -> Result<PathBuf, WorkspaceError> {
        let path = self.attempts_dir().join(format!(
            "attempt-{:04}-{:04}.json",
            attempt.step_index, attempt.attempt
        ));
        write_json(&path, attempt).await?;
        Ok(path)
    }

    /// Latest checkpoint per step, ordered by step index.
    pub async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, WorkspaceError> {
        let mut latest: BTreeMap<usize, Checkpoint> = BTreeMap::new();
        for checkpoint in read_all::<Checkpoint>(&self.steps_dir()).await? {
            match latest.get(&checkpoint.step_index) {
                Some(existing) if existing.attempt >= checkpoint.attempt => {}
                _ => {
                    latest.insert(checkpoint.step_index, checkpoint);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    /// Every attempt record, ordered by step then attempt.
    pub async fn load_attempts(&self) -> Result<Vec<StepAttempt>, WorkspaceError> {
        let mut attempts = read_all::<StepAttempt>(&self.attempts_dir()).await?;
        attempts.sort_by_key(|a| (a.step_index, a.attempt));
        Ok(attempts)
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkspaceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    fs::write(path, json).await?;
    Ok(())
}

async fn read_all<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<Vec<T>, WorkspaceError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut items = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let data = fs::read(&path).await?;
        items.push(serde_json::from_slice(&data)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(job_id: Uuid, index: usize, attempt: u32, summary: &str) -> Checkpoint {
        Checkpoint {
            job_id,
            step_id: format!("step{index}"),
            step_index: index,
            attempt,
            summary: summary.to_string(),
            diff_hash: None,
            changed_files: vec![],
            patch: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn latest_checkpoint_per_step_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let job = Uuid::new_v4();

        store.write_checkpoint(&checkpoint(job, 1, 1, "second step")).await.unwrap();
        store.write_checkpoint(&checkpoint(job, 0, 1, "first try")).await.unwrap();
        store.write_checkpoint(&checkpoint(job, 0, 3, "after reset")).await.unwrap();

        let loaded = store.load_checkpoints().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].summary, "after reset");
        assert_eq!(loaded[1].step_index, 1);
        assert!(dir.path().join("steps/step-0000-0001.json").exists());
    }

    #[tokio::test]
    async fn attempts_are_recorded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.write_attempt(&StepAttempt::begin("b", 1, 1)).await.unwrap();
        store.write_attempt(&StepAttempt::begin("a", 0, 2)).await.unwrap();
        store.write_attempt(&StepAttempt::begin("a", 0, 1)).await.unwrap();

        let attempts = store.load_attempts().await.unwrap();
        let keys: Vec<(usize, u32)> = attempts.iter().map(|a| (a.step_index, a.attempt)).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (1, 1)]);
        assert!(dir.path().join("self_heal/attempt-0000-0002.json").exists());
    }

    #[tokio::test]
    async fn empty_state_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("missing"));
        assert!(store.load_checkpoints().await.unwrap().is_empty());
    }
}
