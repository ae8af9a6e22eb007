//! Fake capabilities and fixtures shared by Drover tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use drover_core::config::AppConfig;
use drover_core::error::Result;
use drover_core::output::{CapabilityOutput, CapabilityResult};
use drover_core::traits::Capability;
use drover_core::types::{Payload, UPSTREAM_KEY};
use drover_store::{Database, SqliteQueue, SqliteStore};

/// Returns the `text` input verbatim. Named `echo`.
pub struct EchoCapability;

impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            let text = input
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Ok(CapabilityResult::success(CapabilityOutput::text(text)))
        })
    }
}

/// Always reports an error status.
pub struct FailingCapability {
    name: String,
    message: String,
}

impl FailingCapability {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Capability for FailingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move { Ok(CapabilityResult::error(self.message.clone())) })
    }
}

/// Fails the first `failures` calls, then succeeds. Clones share the counter.
#[derive(Clone)]
pub struct FlakyCapability {
    name: String,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyCapability {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Capability for FlakyCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Ok(CapabilityResult::error(format!("transient failure {}", call)))
            } else {
                Ok(CapabilityResult::success(CapabilityOutput::text(format!(
                    "ok after {} calls",
                    call
                ))))
            }
        })
    }
}

/// Sleeps before answering. Named `slow`.
pub struct SlowCapability {
    delay: Duration,
    timeout_secs: u64,
}

impl SlowCapability {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timeout_secs: 300,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Capability for SlowCapability {
    fn name(&self) -> &str {
        "slow"
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(CapabilityResult::success(CapabilityOutput::text("done")))
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

/// Returns a fixed JSON value, normalized through `CapabilityOutput::from_value`.
pub struct StructuredCapability {
    name: String,
    value: serde_json::Value,
}

impl StructuredCapability {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Capability for StructuredCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            Ok(CapabilityResult::success(CapabilityOutput::from_value(
                self.value.clone(),
            )))
        })
    }
}

/// Panics on every call. Named `panic`.
pub struct PanickingCapability;

impl Capability for PanickingCapability {
    fn name(&self) -> &str {
        "panic"
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move { Ok(explode()) })
    }
}

fn explode() -> CapabilityResult {
    panic!("capability blew up")
}

/// Records every input it receives and answers with the number of upstream
/// entries it saw. Clones share the recording.
#[derive(Clone)]
pub struct RecordingCapability {
    name: String,
    requires_upstream: bool,
    inputs: Arc<Mutex<Vec<Payload>>>,
}

impl RecordingCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires_upstream: false,
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Declare that this capability expects upstream content.
    pub fn requiring_upstream(mut self) -> Self {
        self.requires_upstream = true;
        self
    }

    pub fn inputs(&self) -> Vec<Payload> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }
}

impl Capability for RecordingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<CapabilityResult>> {
        Box::pin(async move {
            let upstream = input
                .get(UPSTREAM_KEY)
                .and_then(|v| v.as_object())
                .map(|m| m.len())
                .unwrap_or(0);
            self.inputs.lock().unwrap().push(input);
            Ok(CapabilityResult::success(CapabilityOutput::text(format!(
                "{} saw {} upstream",
                self.name, upstream
            ))))
        })
    }

    fn requires_upstream(&self) -> bool {
        self.requires_upstream
    }
}

/// Configuration with short poll intervals and backoffs for fast tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.path = ":memory:".to_string();
    config.queue.max_retries = 3;
    config.queue.poll_interval_ms = 10;
    config.dispatch.poll_interval_ms = 20;
    config.dispatch.max_wait_secs = 10;
    config.executor.max_concurrency = 4;
    config.executor.step_timeout_secs = 10;
    config.worker.count = 2;
    config.worker.dequeue_timeout_secs = 1;
    config.retry.max_retries = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config
}

/// Record store and queue sharing one in-memory database.
pub fn memory_backend() -> (SqliteStore, SqliteQueue) {
    let db = Database::in_memory().expect("open in-memory database");
    (
        SqliteStore::new(db.clone()),
        SqliteQueue::new(db, test_config().queue),
    )
}

/// Record store and queue on a database file inside a fresh temp dir.
/// Keep the returned dir alive for as long as the backend is used.
pub fn temp_backend() -> (tempfile::TempDir, SqliteStore, SqliteQueue) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = Database::open(&dir.path().join("drover.db")).expect("open database file");
    (
        dir,
        SqliteStore::new(db.clone()),
        SqliteQueue::new(db, test_config().queue),
    )
}
