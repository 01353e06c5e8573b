//! Secret redaction for everything the queue persists.
//!
//! Two layers are applied in order:
//! - exact replacement of known secret values (env vars with sensitive
//!   names, plus values registered at runtime such as the worker token)
//! - regex patterns for token-shaped strings that were never registered

use std::sync::{LazyLock, RwLock};

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

/// Replacement written in place of a secret.
pub const REDACTED: &str = "[REDACTED]";

/// Values shorter than this are never registered. Replacing them would
/// mangle ordinary text.
const MIN_SECRET_LEN: usize = 6;

/// Env var name fragments that mark the value as secret.
const SENSITIVE_KEY_PARTS: &[&str] = &[
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "KEY",
    "CREDENTIAL",
    "AUTH",
];

static TOKEN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // GitHub tokens
        r"gh[pousr]_[A-Za-z0-9]{20,}",
        r"github_pat_[A-Za-z0-9_]{20,}",
        // Provider API keys
        r"sk-[A-Za-z0-9_-]{16,}",
        r"xox[abpr]-[A-Za-z0-9-]{10,}",
        r"AKIA[0-9A-Z]{16}",
        // Bearer headers
        r"(?i)bearer\s+[A-Za-z0-9._~+/-]{12,}=*",
        // JWTs
        r"eyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}",
        // key=value assignments
        r#"(?i)(?:password|passwd|secret|token|api[_-]?key)\s*[:=]\s*["']?[^\s"']{6,}"#,
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Scrubs known secret values and token-like strings from text.
#[derive(Debug, Default)]
pub struct SecretRedactor {
    secrets: RwLock<Vec<String>>,
}

impl SecretRedactor {
    /// Create an empty redactor (patterns only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a redactor seeded from the process environment.
    pub fn from_env() -> Self {
        let redactor = Self::new();
        for (key, value) in std::env::vars() {
            if is_sensitive_key(&key) {
                redactor.register(&value);
            }
        }
        redactor
    }

    /// Register an additional value to scrub.
    pub fn register(&self, value: &str) {
        let value = value.trim();
        if value.len() < MIN_SECRET_LEN {
            return;
        }
        if let Ok(mut secrets) = self.secrets.write()
            && !secrets.iter().any(|s| s == value)
        {
            secrets.push(value.to_string());
            // Longest first so a secret containing another is replaced whole.
            secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
    }

    /// Register a `SecretString` without exposing it anywhere else.
    pub fn register_secret(&self, secret: &SecretString) {
        self.register(secret.expose_secret());
    }

    /// Scrub a string.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        if let Ok(secrets) = self.secrets.read() {
            for secret in secrets.iter() {
                if out.contains(secret.as_str()) {
                    out = out.replace(secret.as_str(), REDACTED);
                }
            }
        }
        for pattern in TOKEN_PATTERNS.iter() {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, REDACTED).into_owned();
            }
        }
        out
    }

    /// Scrub every string leaf of a JSON value.
    pub fn scrub_json(&self, value: &serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.scrub(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.scrub_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        if is_sensitive_key(k) && v.is_string() {
                            (k.clone(), Value::String(REDACTED.to_string()))
                        } else {
                            (k.clone(), self.scrub_json(v))
                        }
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Scrub bytes that decode as UTF-8. Binary content is returned unchanged.
    pub fn scrub_bytes(&self, data: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(data) {
            Ok(text) => self.scrub(text).into_bytes(),
            Err(_) => data.to_vec(),
        }
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| upper.contains(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_values_are_replaced() {
        let redactor = SecretRedactor::new();
        redactor.register("hunter2-super");
        assert_eq!(
            redactor.scrub("login with hunter2-super now"),
            "login with [REDACTED] now"
        );
    }

    #[test]
    fn short_values_are_ignored() {
        let redactor = SecretRedactor::new();
        redactor.register("abc");
        assert_eq!(redactor.scrub("abc def"), "abc def");
    }

    #[test]
    fn token_patterns_are_replaced() {
        let redactor = SecretRedactor::new();
        let text = "push failed for ghp_abcdefghijklmnopqrstuvwx123 on origin";
        let out = redactor.scrub(text);
        assert!(!out.contains("ghp_"));
        assert!(out.contains(REDACTED));

        let out = redactor.scrub("Authorization: Bearer abc.def-ghijklmnop");
        assert!(!out.contains("abc.def-ghijklmnop"));

        let out = redactor.scrub("API_KEY=sekrit-value-123");
        assert!(!out.contains("sekrit-value-123"));
    }

    #[test]
    fn plain_text_is_untouched() {
        let redactor = SecretRedactor::new();
        let text = "cargo test failed: 3 passed, 1 failed";
        assert_eq!(redactor.scrub(text), text);
    }

    #[test]
    fn json_leaves_and_sensitive_keys_are_scrubbed() {
        let redactor = SecretRedactor::new();
        redactor.register("topsecretvalue");
        let value = serde_json::json!({
            "note": "uses topsecretvalue",
            "githubToken": "anything",
            "nested": [{"count": 3}],
        });
        let out = redactor.scrub_json(&value);
        assert_eq!(out["note"], "uses [REDACTED]");
        assert_eq!(out["githubToken"], REDACTED);
        assert_eq!(out["nested"][0]["count"], 3);
    }

    #[test]
    fn secret_strings_register() {
        let redactor = SecretRedactor::new();
        redactor.register_secret(&SecretString::from("worker-token-xyz"));
        assert_eq!(redactor.scrub("token worker-token-xyz"), "token [REDACTED]");
    }

    #[test]
    fn binary_bytes_pass_through() {
        let redactor = SecretRedactor::new();
        let data = vec![0xff, 0xfe, 0x00];
        assert_eq!(redactor.scrub_bytes(&data), data);
    }
}
