//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` that overlays environment
//! variables on top of it. Unparseable values are errors, never silently
//! replaced by defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Queue service configuration (store, artifacts, retry policy, HTTP port).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Root directory for artifact blobs.
    pub artifact_root: PathBuf,
    /// Maximum size of a single artifact upload.
    pub artifact_max_bytes: usize,
    /// Allowed artifact content types. Empty means any.
    pub allowed_content_types: Vec<String>,
    /// Delay before a job requeued by lease expiry becomes claimable.
    pub lease_retry_delay: Duration,
    /// Backoff for retryable failures: `base * 2^(attempt-1)`.
    pub retry_backoff_base: Duration,
    /// Upper bound for the retry backoff.
    pub retry_backoff_max: Duration,
    /// HTTP listen port.
    pub http_port: u16,
    /// Bearer token required on `/api` routes when set.
    pub api_token: Option<SecretString>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/agent-queue.db"),
            artifact_root: PathBuf::from("./data/artifacts"),
            artifact_max_bytes: 50 * 1024 * 1024,
            allowed_content_types: Vec::new(),
            lease_retry_delay: Duration::ZERO,
            retry_backoff_base: Duration::from_secs(15),
            retry_backoff_max: Duration::from_secs(600),
            http_port: 8080,
            api_token: None,
        }
    }
}

impl QueueConfig {
    /// Load from `AGENT_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = env_string("AGENT_QUEUE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("AGENT_QUEUE_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(path);
        }
        if let Some(max) = env_parse::<usize>("AGENT_QUEUE_ARTIFACT_MAX_BYTES")? {
            config.artifact_max_bytes = max;
        }
        if let Some(types) = env_string("AGENT_QUEUE_ARTIFACT_CONTENT_TYPES") {
            config.allowed_content_types = split_list(&types);
        }
        if let Some(secs) = env_parse::<u64>("AGENT_QUEUE_LEASE_RETRY_DELAY_SECS")? {
            config.lease_retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("AGENT_QUEUE_RETRY_BACKOFF_BASE_SECS")? {
            config.retry_backoff_base = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("AGENT_QUEUE_RETRY_BACKOFF_MAX_SECS")? {
            config.retry_backoff_max = Duration::from_secs(secs);
        }
        if let Some(port) = env_parse::<u16>("AGENT_QUEUE_HTTP_PORT")? {
            config.http_port = port;
        }
        config.api_token = env_string("AGENT_QUEUE_API_TOKEN").map(SecretString::from);
        Ok(config)
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity reported as `claimed_by`.
    pub worker_id: String,
    /// Lease granted per claim and heartbeat.
    pub lease_seconds: u32,
    /// Idle poll interval when no job is claimable.
    pub poll_interval: Duration,
    /// Upper bound of random jitter added to each idle poll.
    pub poll_jitter: Duration,
    /// Job types this worker accepts. Empty means any.
    pub allowed_types: Vec<String>,
    /// Capabilities advertised at claim time.
    pub capabilities: Vec<String>,
    /// Root for per-job workspaces.
    pub workdir: PathBuf,
    /// Remote queue API. When unset the worker opens the store directly.
    pub api_url: Option<String>,
    /// Bearer token for the remote queue API.
    pub api_token: Option<SecretString>,
    /// Worker token for the remote queue API.
    pub worker_token: Option<SecretString>,
    pub live_log: LiveLogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            lease_seconds: 120,
            poll_interval: Duration::from_millis(1000),
            poll_jitter: Duration::from_millis(250),
            allowed_types: Vec::new(),
            capabilities: Vec::new(),
            workdir: PathBuf::from("./data/work"),
            api_url: None,
            api_token: None,
            worker_token: None,
            live_log: LiveLogConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from `AGENT_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(id) = env_string("AGENT_QUEUE_WORKER_ID") {
            config.worker_id = id;
        }
        if let Some(lease) = env_parse::<u32>("AGENT_QUEUE_LEASE_SECONDS")? {
            if lease == 0 {
                return Err(invalid("AGENT_QUEUE_LEASE_SECONDS", "must be positive"));
            }
            config.lease_seconds = lease;
        }
        if let Some(ms) = env_parse::<u64>("AGENT_QUEUE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("AGENT_QUEUE_POLL_JITTER_MS")? {
            config.poll_jitter = Duration::from_millis(ms);
        }
        if let Some(types) = env_string("AGENT_QUEUE_ALLOWED_TYPES") {
            config.allowed_types = split_list(&types);
        }
        if let Some(caps) = env_string("AGENT_QUEUE_WORKER_CAPABILITIES") {
            config.capabilities = split_list(&caps);
        }
        if let Some(dir) = env_string("AGENT_QUEUE_WORKDIR") {
            config.workdir = PathBuf::from(dir);
        }
        config.api_url = env_string("AGENT_QUEUE_API_URL");
        config.api_token = env_string("AGENT_QUEUE_API_TOKEN").map(SecretString::from);
        config.worker_token = env_string("AGENT_QUEUE_WORKER_TOKEN").map(SecretString::from);
        config.live_log = LiveLogConfig::from_lookup(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Heartbeat cadence: a third of the lease, clamped to 1..=10 seconds.
    pub fn heartbeat_interval(&self) -> Duration {
        let third = Duration::from_secs(u64::from(self.lease_seconds)) / 3;
        third.clamp(Duration::from_secs(1), Duration::from_secs(10))
    }
}

/// Budgets for the in-job step retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfHealConfig {
    pub step_max_attempts: u32,
    pub step_timeout: Duration,
    pub step_idle_timeout: Duration,
    pub step_no_progress_limit: u32,
    pub job_self_heal_max_resets: u32,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            step_max_attempts: 3,
            step_timeout: Duration::from_secs(900),
            step_idle_timeout: Duration::from_secs(300),
            step_no_progress_limit: 2,
            job_self_heal_max_resets: 1,
        }
    }
}

impl SelfHealConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. All values must be positive integers.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key).map(|v| v.trim().to_string()) {
                None => Ok(default),
                Some(v) if v.is_empty() => Ok(default),
                Some(v) => {
                    let parsed: u64 = v
                        .parse()
                        .map_err(|_| invalid(key, "must be an integer"))?;
                    if parsed < 1 {
                        return Err(invalid(key, "must be >= 1"));
                    }
                    Ok(parsed)
                }
            }
        };
        let narrow = |key: &str, value: u64| -> Result<u32, ConfigError> {
            u32::try_from(value).map_err(|_| invalid(key, "out of range"))
        };

        Ok(Self {
            step_max_attempts: narrow(
                "STEP_MAX_ATTEMPTS",
                read("STEP_MAX_ATTEMPTS", defaults.step_max_attempts.into())?,
            )?,
            step_timeout: Duration::from_secs(read(
                "STEP_TIMEOUT_SECONDS",
                defaults.step_timeout.as_secs(),
            )?),
            step_idle_timeout: Duration::from_secs(read(
                "STEP_IDLE_TIMEOUT_SECONDS",
                defaults.step_idle_timeout.as_secs(),
            )?),
            step_no_progress_limit: narrow(
                "STEP_NO_PROGRESS_LIMIT",
                read("STEP_NO_PROGRESS_LIMIT", defaults.step_no_progress_limit.into())?,
            )?,
            job_self_heal_max_resets: narrow(
                "JOB_SELF_HEAL_MAX_RESETS",
                read(
                    "JOB_SELF_HEAL_MAX_RESETS",
                    defaults.job_self_heal_max_resets.into(),
                )?,
            )?,
        })
    }
}

/// Streaming of step output as `log` job events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveLogConfig {
    pub enabled: bool,
    /// Pending output at least this large is sent without waiting.
    pub batch_bytes: usize,
    pub flush_interval: Duration,
}

impl Default for LiveLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_bytes: 8192,
            flush_interval: Duration::from_millis(300),
        }
    }
}

impl LiveLogConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_ascii_lowercase())
                .filter(|v| !v.is_empty())
        };

        const ENABLED: &str = "AGENT_QUEUE_LIVE_LOG_EVENTS";
        if let Some(raw) = value(ENABLED) {
            config.enabled = match raw.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(ENABLED, "must be a boolean")),
            };
        }

        const BATCH: &str = "AGENT_QUEUE_LIVE_LOG_BATCH_BYTES";
        if let Some(raw) = value(BATCH) {
            let bytes: usize = raw.parse().map_err(|_| invalid(BATCH, "must be an integer"))?;
            if bytes < 128 {
                return Err(invalid(BATCH, "must be >= 128"));
            }
            config.batch_bytes = bytes;
        }

        const FLUSH: &str = "AGENT_QUEUE_LIVE_LOG_FLUSH_INTERVAL_MS";
        if let Some(raw) = value(FLUSH) {
            let ms: u64 = raw.parse().map_err(|_| invalid(FLUSH, "must be an integer"))?;
            if ms < 10 {
                return Err(invalid(FLUSH, "must be >= 10"));
            }
            config.flush_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(key, &format!("cannot parse {raw:?}"))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
