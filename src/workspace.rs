//! Per-job workspace on disk.
//!
//! Each claimed job gets `<workdir>/<job_id>/` containing:
//! - `repo/`: working directory for steps
//! - `artifacts/`: stage logs and files staged for upload
//! - `state/`: checkpoints, attempt records and the last-good repo copy
//! - `context.json`: redacted snapshot of the job and its resolved steps

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::WorkspaceError;

/// Well-known workspace paths, relative to the job root.
pub mod paths {
    pub const REPO: &str = "repo";
    pub const ARTIFACTS: &str = "artifacts";
    pub const STATE: &str = "state";
    pub const CONTEXT: &str = "context.json";
    pub const LOGS: &str = "artifacts/logs";
    pub const LAST_GOOD: &str = "state/last_good";
}

/// Content digests of every file under `repo/`, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSnapshot {
    files: BTreeMap<String, String>,
}

impl RepoSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths added, modified or removed relative to `base`.
    pub fn changed_since(&self, base: &RepoSnapshot) -> Vec<String> {
        let mut changed: Vec<String> = self
            .files
            .iter()
            .filter(|(path, digest)| base.files.get(*path) != Some(*digest))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            base.files
                .keys()
                .filter(|path| !self.files.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }

    /// Stable hash of the changes relative to `base`.
    ///
    /// Two attempts that leave the repo in the same state produce the same
    /// hash.
    pub fn diff_hash(&self, base: &RepoSnapshot) -> String {
        let mut hasher = Sha256::new();
        for path in self.changed_since(base) {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(self.files.get(&path).map(String::as_str).unwrap_or("-").as_bytes());
            hasher.update([b'\n']);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Isolated directory tree for one job run.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    job_id: Uuid,
    root: PathBuf,
}

impl JobWorkspace {
    /// Create a fresh workspace, discarding any left over from an earlier run.
    pub async fn prepare(workdir: &Path, job_id: Uuid) -> Result<Self, WorkspaceError> {
        let root = workdir.join(job_id.to_string());
        if fs::try_exists(&root).await? {
            fs::remove_dir_all(&root).await?;
        }
        let workspace = Self { job_id, root };
        for dir in [paths::REPO, paths::ARTIFACTS, paths::STATE, paths::LOGS] {
            fs::create_dir_all(workspace.root.join(dir)).await?;
        }
        Ok(workspace)
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join(paths::REPO)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(paths::ARTIFACTS)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(paths::STATE)
    }

    pub fn log_path(&self, stage: &str) -> PathBuf {
        self.root.join(paths::LOGS).join(format!("{stage}.log"))
    }

    /// Write `context.json`. The caller redacts.
    pub async fn write_context<T: Serialize>(&self, context: &T) -> Result<(), WorkspaceError> {
        let json = serde_json::to_vec_pretty(context)?;
        fs::write(self.root.join(paths::CONTEXT), json).await?;
        Ok(())
    }

    /// Append text to a stage log.
    pub async fn append_log(&self, stage: &str, text: &str) -> Result<(), WorkspaceError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(stage))
            .await?;
        file.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Read a stage log, empty if it was never written.
    pub async fn read_log(&self, stage: &str) -> Result<Vec<u8>, WorkspaceError> {
        match fs::read(self.log_path(stage)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Digest every file under `repo/`. `.git` is skipped.
    pub async fn snapshot(&self) -> Result<RepoSnapshot, WorkspaceError> {
        let repo = self.repo_dir();
        let mut files = BTreeMap::new();
        collect_digests(&repo, &repo, &mut files).await?;
        Ok(RepoSnapshot { files })
    }

    /// Populate `repo/` from a local directory.
    pub async fn seed_repo(&self, source: &Path) -> Result<(), WorkspaceError> {
        if !fs::metadata(source).await.is_ok_and(|m| m.is_dir()) {
            return Err(WorkspaceError::InvalidPayload(format!(
                "repository is not a directory: {}",
                source.display()
            )));
        }
        copy_dir(source, &self.repo_dir()).await
    }

    /// Copy `repo/` to the last-good slot after a successful step.
    pub async fn save_last_good(&self) -> Result<(), WorkspaceError> {
        let last_good = self.root.join(paths::LAST_GOOD);
        if fs::try_exists(&last_good).await? {
            fs::remove_dir_all(&last_good).await?;
        }
        copy_dir(&self.repo_dir(), &last_good).await
    }

    /// Rebuild `repo/` from the last-good slot.
    pub async fn restore_last_good(&self) -> Result<(), WorkspaceError> {
        let repo = self.repo_dir();
        if fs::try_exists(&repo).await? {
            fs::remove_dir_all(&repo).await?;
        }
        let last_good = self.root.join(paths::LAST_GOOD);
        if fs::try_exists(&last_good).await? {
            copy_dir(&last_good, &repo).await
        } else {
            fs::create_dir_all(&repo).await?;
            Ok(())
        }
    }
}

fn collect_digests<'a>(
    base: &'a Path,
    dir: &'a Path,
    files: &'a mut BTreeMap<String, String>,
) -> Pin<Box<dyn Future<Output = Result<(), WorkspaceError>> + Send + 'a>> {
    Box::pin(async move {
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    collect_digests(base, &path, files).await?;
                }
            } else if file_type.is_file() {
                let data = fs::read(&path).await?;
                let relative = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                files.insert(relative, format!("{:x}", Sha256::digest(&data)));
            }
        }
        Ok(())
    })
}

fn copy_dir<'a>(
    from: &'a Path,
    to: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<(), WorkspaceError>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(to).await?;
        let mut read_dir = fs::read_dir(from).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                copy_dir(&entry.path(), &target).await?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn workspace() -> (JobWorkspace, TempDir) {
        let dir = TempDir::new().unwrap();
        let ws = JobWorkspace::prepare(dir.path(), Uuid::new_v4()).await.unwrap();
        (ws, dir)
    }

    #[tokio::test]
    async fn prepare_creates_layout_and_discards_leftovers() {
        let dir = TempDir::new().unwrap();
        let job = Uuid::new_v4();
        let ws = JobWorkspace::prepare(dir.path(), job).await.unwrap();
        fs::write(ws.repo_dir().join("stale.txt"), "x").await.unwrap();

        let ws = JobWorkspace::prepare(dir.path(), job).await.unwrap();
        assert!(ws.repo_dir().exists());
        assert!(ws.artifacts_dir().exists());
        assert!(ws.state_dir().exists());
        assert!(!ws.repo_dir().join("stale.txt").exists());
        assert_eq!(ws.root(), dir.path().join(job.to_string()));
    }

    #[tokio::test]
    async fn logs_append() {
        let (ws, _dir) = workspace().await;
        ws.append_log("execute", "first").await.unwrap();
        ws.append_log("execute", "second\n").await.unwrap();
        let log = ws.read_log("execute").await.unwrap();
        assert_eq!(String::from_utf8(log).unwrap(), "first\nsecond\n");
        assert!(ws.read_log("publish").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_tracks_changes() {
        let (ws, _dir) = workspace().await;
        fs::write(ws.repo_dir().join("a.txt"), "a").await.unwrap();
        let base = ws.snapshot().await.unwrap();

        fs::create_dir_all(ws.repo_dir().join("src")).await.unwrap();
        fs::write(ws.repo_dir().join("src/b.txt"), "b").await.unwrap();
        fs::create_dir_all(ws.repo_dir().join(".git")).await.unwrap();
        fs::write(ws.repo_dir().join(".git/HEAD"), "ref").await.unwrap();
        let after = ws.snapshot().await.unwrap();

        assert_eq!(after.len(), 2);
        assert_eq!(after.changed_since(&base), vec!["src/b.txt"]);
        assert_eq!(after.diff_hash(&base), ws.snapshot().await.unwrap().diff_hash(&base));

        fs::remove_file(ws.repo_dir().join("a.txt")).await.unwrap();
        let removed = ws.snapshot().await.unwrap();
        assert_eq!(removed.changed_since(&base), vec!["a.txt", "src/b.txt"]);
        assert_ne!(removed.diff_hash(&base), after.diff_hash(&base));
    }

    #[tokio::test]
    async fn restore_last_good_rebuilds_repo() {
        let (ws, _dir) = workspace().await;
        fs::write(ws.repo_dir().join("good.txt"), "good").await.unwrap();
        ws.save_last_good().await.unwrap();

        fs::write(ws.repo_dir().join("good.txt"), "broken").await.unwrap();
        fs::write(ws.repo_dir().join("junk.txt"), "junk").await.unwrap();
        ws.restore_last_good().await.unwrap();

        let content = fs::read_to_string(ws.repo_dir().join("good.txt")).await.unwrap();
        assert_eq!(content, "good");
        assert!(!ws.repo_dir().join("junk.txt").exists());
    }

    #[tokio::test]
    async fn seed_repo_copies_source_tree() {
        let (ws, _dir) = workspace().await;
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("src")).await.unwrap();
        fs::write(source.path().join("src/lib.rs"), "fn main() {}").await.unwrap();

        ws.seed_repo(source.path()).await.unwrap();
        assert!(ws.repo_dir().join("src/lib.rs").exists());

        let err = ws.seed_repo(&source.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn context_is_written() {
        let (ws, _dir) = workspace().await;
        ws.write_context(&serde_json::json!({"jobId": ws.job_id()}))
            .await
            .unwrap();
        let raw = fs::read_to_string(ws.root().join(paths::CONTEXT)).await.unwrap();
        assert!(raw.contains(&ws.job_id().to_string()));
    }
}
