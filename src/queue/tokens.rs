//! Worker tokens: per-worker credentials that carry a claim policy.
//!
//! Only the sha256 of a raw token is stored. The raw value is returned once,
//! at issue time. A request presenting a token acts as the token's worker and
//! may only claim what the token allows.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::model::{ClaimRequest, normalize_list};

/// Prefix of every raw worker token.
pub const WORKER_TOKEN_PREFIX: &str = "aqwt_";

/// Stored worker token metadata. Never contains the raw token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerToken {
    pub id: Uuid,
    pub worker_id: String,
    pub description: Option<String>,
    pub allowed_repositories: Vec<String>,
    pub allowed_job_types: Vec<String>,
    pub capabilities: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator request for a new worker token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkerToken {
    pub worker_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_repositories: Vec<String>,
    #[serde(default)]
    pub allowed_job_types: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl NewWorkerToken {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_repositories(mut self, repositories: &[&str]) -> Self {
        self.allowed_repositories = repositories.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_job_types(mut self, types: &[&str]) -> Self {
        self.allowed_job_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// Policy resolved from a presented worker token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPolicy {
    pub token_id: Uuid,
    pub worker_id: String,
    pub allowed_repositories: Vec<String>,
    pub allowed_job_types: Vec<String>,
    pub capabilities: Vec<String>,
}

impl From<&WorkerToken> for WorkerPolicy {
    fn from(token: &WorkerToken) -> Self {
        Self {
            token_id: token.id,
            worker_id: token.worker_id.clone(),
            allowed_repositories: token.allowed_repositories.clone(),
            allowed_job_types: token.allowed_job_types.clone(),
            capabilities: token.capabilities.clone(),
        }
    }
}

impl WorkerPolicy {
    /// Reject a request made under another worker's identity.
    pub fn ensure_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        if worker_id.trim() == self.worker_id {
            Ok(())
        } else {
            Err(QueueError::Forbidden(format!(
                "workerId {:?} does not match token worker {:?}",
                worker_id.trim(),
                self.worker_id
            )))
        }
    }

    /// Narrow a claim request to what the token allows.
    ///
    /// Requested types and repositories are intersected with the token's
    /// lists. Token capabilities replace the advertised ones.
    pub fn apply(&self, mut request: ClaimRequest) -> Result<ClaimRequest, QueueError> {
        self.ensure_worker(&request.worker_id)?;
        request.allowed_types =
            intersect(&request.allowed_types, &self.allowed_job_types, "allowedTypes")?;
        request.allowed_repositories = intersect(
            &request.allowed_repositories,
            &self.allowed_repositories,
            "allowedRepositories",
        )?;
        if !self.capabilities.is_empty() {
            request.worker_capabilities = self.capabilities.clone();
        }
        Ok(request)
    }
}

fn intersect(requested: &[String], allowed: &[String], field: &str) -> Result<Vec<String>, QueueError> {
    let requested = normalize_list(requested);
    if allowed.is_empty() {
        return Ok(requested);
    }
    if requested.is_empty() {
        return Ok(allowed.to_vec());
    }
    let overlap: Vec<String> = requested
        .into_iter()
        .filter(|item| allowed.contains(item))
        .collect();
    if overlap.is_empty() {
        return Err(QueueError::Forbidden(format!(
            "requested {field} do not overlap with the worker token policy"
        )));
    }
    Ok(overlap)
}

/// Fresh raw token: the prefix plus 24 random bytes as hex.
pub fn generate_token() -> SecretString {
    let bytes: [u8; 24] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    SecretString::from(format!("{WORKER_TOKEN_PREFIX}{hex}"))
}

/// Hex sha256 of a raw token, the only form that is stored.
pub fn hash_token(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn policy() -> WorkerPolicy {
        WorkerPolicy {
            token_id: Uuid::new_v4(),
            worker_id: "w1".into(),
            allowed_repositories: vec!["acme/api".into()],
            allowed_job_types: vec!["task".into(), "exec".into()],
            capabilities: vec!["docker".into()],
        }
    }

    #[test]
    fn generated_tokens_are_unique_and_prefixed() {
        let a = generate_token();
        let b = generate_token();
        assert!(a.expose_secret().starts_with(WORKER_TOKEN_PREFIX));
        assert_eq!(a.expose_secret().len(), WORKER_TOKEN_PREFIX.len() + 48);
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn hash_ignores_surrounding_whitespace() {
        assert_eq!(hash_token(" aqwt_x "), hash_token("aqwt_x"));
        assert_ne!(hash_token("aqwt_x"), hash_token("aqwt_y"));
        assert_eq!(hash_token("abc").len(), 64);
    }

    #[test]
    fn apply_narrows_the_claim() {
        let request = ClaimRequest {
            allowed_types: vec!["Task".into(), "review".into()],
            worker_capabilities: vec!["gpu".into()],
            ..ClaimRequest::new("w1", 30)
        };
        let narrowed = policy().apply(request).unwrap();
        assert_eq!(narrowed.allowed_types, vec!["task"]);
        assert_eq!(narrowed.allowed_repositories, vec!["acme/api"]);
        assert_eq!(narrowed.worker_capabilities, vec!["docker"]);

        let open = policy().apply(ClaimRequest::new("w1", 30)).unwrap();
        assert_eq!(open.allowed_types, vec!["task", "exec"]);
    }

    #[test]
    fn apply_rejects_other_workers_and_disjoint_types() {
        let err = policy().apply(ClaimRequest::new("w2", 30)).unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        let request = ClaimRequest {
            allowed_types: vec!["review".into()],
            ..ClaimRequest::new("w1", 30)
        };
        let err = policy().apply(request).unwrap_err();
        assert!(matches!(err, QueueError::Forbidden(_)));
    }
}
