use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use drover_core::event::EventBus;
use drover_core::types::{JobId, OrchestrationEvent};

/// JSONL job logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single job. The file is append-only and flushed per entry, so a crash
/// mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    job_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to
    /// `{log_dir}/{job_id}/{timestamp}.jsonl`.
    /// `level`: 1 = job summary, 2 = + phases and progress, 3 = + steps and work items.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task, so no event published
    /// after this call is missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, job_id, cancel))
    }

    /// Write entries until the job ends, the bus closes or `cancel` fires.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<OrchestrationEvent>,
        job_id: JobId,
        cancel: CancellationToken,
    ) {
        let job_dir = self.log_dir.join(&job_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = job_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.job_id() != Some(&job_id) {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&job_id, &event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if matches!(
                                event,
                                OrchestrationEvent::JobCompleted { .. }
                                    | OrchestrationEvent::JobFailed { .. }
                                    | OrchestrationEvent::JobCancelled { .. }
                            ) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, job_id: &JobId, event: &OrchestrationEvent) -> Option<LogEntry> {
        let (level, event_type, detail) = match event {
            // L1: job summary
            OrchestrationEvent::JobStarted { .. } => (1, "job_started", None),
            OrchestrationEvent::JobCompleted { .. } => (1, "job_completed", None),
            OrchestrationEvent::JobFailed { error, .. } => {
                (1, "job_failed", Some(serde_json::json!({ "error": error })))
            }
            OrchestrationEvent::JobCancelled { .. } => (1, "job_cancelled", None),

            // L2: phases and progress
            OrchestrationEvent::PhaseStarted { phase, index, .. } => (
                2,
                "phase_started",
                Some(serde_json::json!({ "phase": phase, "index": index })),
            ),
            OrchestrationEvent::PhaseCompleted { phase, status, .. } => (
                2,
                "phase_completed",
                Some(serde_json::json!({ "phase": phase, "status": status })),
            ),
            OrchestrationEvent::Progress { percent, .. } => (
                2,
                "progress",
                Some(serde_json::json!({ "percent": percent })),
            ),

            // L3: steps and work items
            OrchestrationEvent::StepStarted { step_id, .. } => (
                3,
                "step_started",
                Some(serde_json::json!({ "step_id": step_id })),
            ),
            OrchestrationEvent::StepCompleted { step_id, .. } => (
                3,
                "step_completed",
                Some(serde_json::json!({ "step_id": step_id })),
            ),
            OrchestrationEvent::StepFailed { step_id, error, .. } => (
                3,
                "step_failed",
                Some(serde_json::json!({
                    "step_id": step_id,
                    "error": truncate_str(error, 500),
                })),
            ),
            OrchestrationEvent::StepSkipped { step_id, reason, .. } => (
                3,
                "step_skipped",
                Some(serde_json::json!({ "step_id": step_id, "reason": reason })),
            ),
            OrchestrationEvent::WorkItemEnqueued { item_id, .. } => (
                3,
                "work_item_enqueued",
                Some(serde_json::json!({ "item_id": item_id.0 })),
            ),
            OrchestrationEvent::WorkItemDeadLettered { .. } => return None,
        };

        if level > self.level {
            return None;
        }
        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            job_id: job_id.0.clone(),
            event_type,
            detail,
        })
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
