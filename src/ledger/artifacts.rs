//! Artifact blob storage under `<root>/<job_id>/<artifact_id>/<name>`.
//!
//! Every upload gets its own directory, so two uploads with the same name
//! never share a file. Blobs are created once and never rewritten.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::StorageError;

/// A blob written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Relative to the storage root.
    pub storage_path: String,
    pub size_bytes: u64,
    pub digest: String,
}

/// Filesystem storage for artifact blobs.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    root: PathBuf,
    max_bytes: usize,
    allowed_content_types: Vec<String>,
}

impl ArtifactStorage {
    pub fn new(root: PathBuf, max_bytes: usize, allowed_content_types: Vec<String>) -> Self {
        Self {
            root,
            max_bytes,
            allowed_content_types: allowed_content_types
                .into_iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            config.artifact_root.clone(),
            config.artifact_max_bytes,
            config.allowed_content_types.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check size and content type before anything touches disk.
    pub fn check_upload(&self, size: usize, content_type: Option<&str>) -> Result<(), StorageError> {
        if size == 0 {
            return Err(StorageError::Empty);
        }
        if size > self.max_bytes {
            return Err(StorageError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        if !self.allowed_content_types.is_empty() {
            let content_type = content_type
                .map(|c| c.split(';').next().unwrap_or(c).trim().to_ascii_lowercase())
                .unwrap_or_default();
            if !self.allowed_content_types.contains(&content_type) {
                return Err(StorageError::ContentTypeNotAllowed(content_type));
            }
        }
        Ok(())
    }

    /// Write the blob of artifact `artifact_id` and return its relative path,
    /// size and digest. Fails if that blob already exists.
    pub async fn write(
        &self,
        job_id: Uuid,
        artifact_id: Uuid,
        name: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<StoredBlob, StorageError> {
        self.check_upload(data.len(), content_type)?;
        let relative = normalize_name(name)?;
        let storage_path = format!("{job_id}/{artifact_id}/{relative}");
        let full_path = self.resolve(&storage_path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await?;
        file.write_all(data).await?;
        file.sync_all().await?;

        Ok(StoredBlob {
            storage_path,
            size_bytes: data.len() as u64,
            digest: sha256_digest(data),
        })
    }

    /// Read a blob by its relative storage path.
    pub async fn read(&self, storage_path: &str) -> Result<Vec<u8>, StorageError> {
        let full_path = self.resolve(storage_path)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::Missing(storage_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a relative storage path to an absolute path under the root.
    pub fn resolve(&self, storage_path: &str) -> Result<PathBuf, StorageError> {
        let relative = normalize_name(storage_path)?;
        let full = self.root.join(&relative);
        if !full.starts_with(&self.root) {
            return Err(StorageError::InvalidPath(storage_path.to_string()));
        }
        Ok(full)
    }
}

/// Normalize an artifact name to a safe relative path.
///
/// Rejects empty names, absolute paths, backslashes, NUL bytes and any
/// `..` component. `.` and empty components are dropped.
pub fn normalize_name(name: &str) -> Result<String, StorageError> {
    let trimmed = name.trim();
    let invalid = || StorageError::InvalidPath(name.to_string());

    if trimmed.is_empty() || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(invalid());
    }
    let path = Path::new(trimmed);
    if path.is_absolute() || trimmed.starts_with('/') {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(invalid)?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid());
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> ArtifactStorage {
        ArtifactStorage::new(dir.to_path_buf(), 16, vec![])
    }

    #[test]
    fn traversal_names_are_rejected() {
        for name in [
            "../../etc/passwd",
            "logs/../../secret",
            "/etc/passwd",
            "..",
            "",
            "   ",
            "a\\b",
            ".",
        ] {
            assert!(normalize_name(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn safe_names_are_normalized() {
        assert_eq!(normalize_name("logs/execute.log").unwrap(), "logs/execute.log");
        assert_eq!(normalize_name("./logs//a.txt").unwrap(), "logs/a.txt");
    }

    #[test]
    fn digest_format() {
        assert_eq!(
            sha256_digest(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let job = Uuid::new_v4();
        let artifact = Uuid::new_v4();

        let blob = storage
            .write(job, artifact, "logs/out.txt", b"hello", Some("text/plain"))
            .await
            .unwrap();
        assert_eq!(blob.storage_path, format!("{job}/{artifact}/logs/out.txt"));
        assert_eq!(blob.size_bytes, 5);
        assert!(
            dir.path()
                .join(job.to_string())
                .join(artifact.to_string())
                .join("logs/out.txt")
                .exists()
        );

        let data = storage.read(&blob.storage_path).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn same_name_uploads_keep_separate_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let job = Uuid::new_v4();

        let first = storage
            .write(job, Uuid::new_v4(), "report.txt", b"first", None)
            .await
            .unwrap();
        let second = storage
            .write(job, Uuid::new_v4(), "report.txt", b"second", None)
            .await
            .unwrap();
        assert_ne!(first.storage_path, second.storage_path);
        assert_eq!(storage.read(&first.storage_path).await.unwrap(), b"first");
        assert_eq!(storage.read(&second.storage_path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn existing_blob_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let (job, artifact) = (Uuid::new_v4(), Uuid::new_v4());

        let blob = storage
            .write(job, artifact, "a.txt", b"original", None)
            .await
            .unwrap();
        let err = storage
            .write(job, artifact, "a.txt", b"replaced", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(storage.read(&blob.storage_path).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn write_rejects_bad_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let job = Uuid::new_v4();

        let artifact = Uuid::new_v4();

        let err = storage
            .write(job, artifact, "../../etc/passwd", b"x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));

        let err = storage
            .write(job, artifact, "empty.txt", b"", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Empty));

        let err = storage
            .write(job, artifact, "big.bin", &[0u8; 17], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn content_type_allowlist() {
        let storage = ArtifactStorage::new(
            PathBuf::from("/tmp/unused"),
            1024,
            vec!["text/plain".into(), "Application/JSON".into()],
        );
        assert!(storage.check_upload(1, Some("text/plain; charset=utf-8")).is_ok());
        assert!(storage.check_upload(1, Some("application/json")).is_ok());
        assert!(matches!(
            storage.check_upload(1, Some("image/png")),
            Err(StorageError::ContentTypeNotAllowed(_))
        ));
        assert!(storage.check_upload(1, None).is_err());
    }

    #[tokio::test]
    async fn read_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let err = storage.read("nope/missing.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::Missing(_)));
    }
}
