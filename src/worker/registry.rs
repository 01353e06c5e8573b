//! Registry mapping runtime names to step executors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ExecutorError;
use crate::worker::command::{CommandExecutor, SHELL_RUNTIME};
use crate::worker::executor::StepExecutor;

/// Runtime names of built-in executors that cannot be shadowed.
const PROTECTED_RUNTIMES: &[&str] = &[SHELL_RUNTIME];

/// Registry of available step executors.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn StepExecutor>>>,
    /// Names registered as built-in (protected from shadowing).
    builtin_names: RwLock<HashSet<String>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Registry with the built-in shell executor.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_sync(Arc::new(CommandExecutor::new()));
        registry
    }

    /// Register an executor. Rejects adapters that try to shadow a built-in name.
    pub async fn register(&self, executor: Arc<dyn StepExecutor>) {
        let name = normalize(executor.runtime());
        if self.builtin_names.read().await.contains(&name) {
            tracing::warn!(
                runtime = %name,
                "Rejected executor registration: would shadow a built-in runtime"
            );
            return;
        }
        self.executors.write().await.insert(name.clone(), executor);
        tracing::debug!("Registered executor: {}", name);
    }

    /// Register an executor (sync version for startup, marks as built-in).
    pub fn register_sync(&self, executor: Arc<dyn StepExecutor>) {
        let name = normalize(executor.runtime());
        if let Ok(mut executors) = self.executors.try_write() {
            executors.insert(name.clone(), executor);
            if PROTECTED_RUNTIMES.contains(&name.as_str())
                && let Ok(mut builtins) = self.builtin_names.try_write()
            {
                builtins.insert(name.clone());
            }
            tracing::debug!("Registered executor: {}", name);
        }
    }

    /// Get an executor by runtime name.
    pub async fn get(&self, runtime: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.read().await.get(&normalize(runtime)).cloned()
    }

    /// Get an executor or fail with `UnknownRuntime`.
    pub async fn resolve(&self, runtime: &str) -> Result<Arc<dyn StepExecutor>, ExecutorError> {
        self.get(runtime)
            .await
            .ok_or_else(|| ExecutorError::UnknownRuntime(runtime.to_string()))
    }

    /// Check if a runtime is registered.
    pub async fn has(&self, runtime: &str) -> bool {
        self.executors.read().await.contains_key(&normalize(runtime))
    }

    /// List all runtime names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered executors.
    pub fn count(&self) -> usize {
        self.executors.try_read().map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(runtime: &str) -> String {
    runtime.trim().to_ascii_lowercase()
}
