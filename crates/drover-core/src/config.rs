use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};

/// Top-level Drover configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file backing both the record store and the queue.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.drover/drover.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Failures tolerated before an item is dead-lettered.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    /// How long queue-side results stay readable.
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// Dead-letter list is trimmed to this many entries.
    #[serde(default = "default_dead_letter_cap")]
    pub dead_letter_cap: usize,
    /// Processing claims older than this are considered abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Wake interval for a blocking dequeue waiting on other processes.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            result_ttl_secs: default_result_ttl_secs(),
            dead_letter_cap: default_dead_letter_cap(),
            stale_after_secs: default_stale_after_secs(),
            poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

fn default_queue_max_retries() -> u32 { 3 }
fn default_result_ttl_secs() -> u64 { 3600 }
fn default_dead_letter_cap() -> usize { 1000 }
fn default_stale_after_secs() -> u64 { 900 }
fn default_queue_poll_interval_ms() -> u64 { 100 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on how long a dispatcher waits for a terminal status.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_dispatch_poll_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_dispatch_poll_interval_ms() -> u64 { 2000 }
fn default_max_wait_secs() -> u64 { 600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum steps in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-step timeout applied by the pool.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

fn default_max_concurrency() -> usize { 5 }
fn default_step_timeout_secs() -> u64 { 900 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker loops `drover worker` spawns.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_dequeue_timeout_secs")]
    pub dequeue_timeout_secs: u64,
    /// Fill a missing `upstream` from the latest completed sibling.
    #[serde(default = "default_backfill_upstream")]
    pub backfill_upstream: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            dequeue_timeout_secs: default_dequeue_timeout_secs(),
            backfill_upstream: default_backfill_upstream(),
        }
    }
}

fn default_worker_count() -> usize { 4 }
fn default_dequeue_timeout_secs() -> u64 { 5 }
fn default_backfill_upstream() -> bool { true }

/// Backoff for transient queue/store unavailability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_retry_max_retries() -> u32 { 5 }
fn default_initial_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 5000 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.drover/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = job summary only, 2 = per-phase, 3 = per-step (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| DroverError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| DroverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_concurrency == 0 {
            return Err(DroverError::Config(
                "executor.max_concurrency must be at least 1".into(),
            ));
        }
        if self.worker.count == 0 {
            return Err(DroverError::Config("worker.count must be at least 1".into()));
        }
        if self.dispatch.poll_interval_ms == 0 || self.queue.poll_interval_ms == 0 {
            return Err(DroverError::Config("poll intervals must be non-zero".into()));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(DroverError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Resolve the store path (expand ~). `:memory:` is passed through.
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the run log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.drover/logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
