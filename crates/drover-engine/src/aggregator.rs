use std::sync::Arc;

use tracing::{debug, info, warn};

use drover_core::error::{DroverError, Result};
use drover_core::event::EventBus;
use drover_core::traits::RecordStore;
use drover_core::types::{
    JobId, JobStatus, OrchestrationEvent, Step, StepStatus, WorkItem, WorkItemStatus,
};

use crate::combine::{combine_items, combine_steps};

/// Decides whether a job is finished and writes its combined output.
///
/// This is the single writer of terminal job status. `check` is idempotent:
/// once the job is terminal, further calls change nothing and publish nothing.
pub struct CompletionAggregator {
    store: Arc<dyn RecordStore>,
    event_bus: Arc<EventBus>,
}

enum Verdict {
    Running,
    Completed(String),
    Failed(String),
}

impl CompletionAggregator {
    pub fn new(store: Arc<dyn RecordStore>, event_bus: Arc<EventBus>) -> Self {
        Self { store, event_bus }
    }

    /// Re-evaluate a job and finalize it if every child is done.
    pub async fn check(&self, job_id: &JobId) -> Result<JobStatus> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DroverError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }

        let steps = self.store.list_steps(job_id).await?;
        let items = self.store.list_work_items(job_id).await?;
        let verdict = if steps.is_empty() {
            judge_items(&items)
        } else {
            judge_steps(&steps, &items)
        };

        let (status, output, error) = match verdict {
            Verdict::Running => {
                debug!(job_id = %job_id, "Job still running");
                return Ok(job.status);
            }
            Verdict::Completed(output) => (JobStatus::Completed, Some(output), None),
            Verdict::Failed(error) => {
                let output = if steps.is_empty() {
                    combine_items(&items)
                } else {
                    combine_steps(&steps)
                };
                (JobStatus::Failed, Some(output), Some(error))
            }
        };

        let changed = self
            .store
            .set_job_status(job_id, status, output, error.clone())
            .await?;
        if !changed {
            // Another caller finalized it first.
            let current = self.store.get_job(job_id).await?;
            return Ok(current.map(|j| j.status).unwrap_or(status));
        }

        match error {
            None => {
                info!(job_id = %job_id, "Job completed");
                self.event_bus.publish(OrchestrationEvent::JobCompleted {
                    job_id: job_id.clone(),
                });
            }
            Some(error) => {
                warn!(job_id = %job_id, error = %error, "Job failed");
                self.event_bus.publish(OrchestrationEvent::JobFailed {
                    job_id: job_id.clone(),
                    error,
                });
            }
        }
        Ok(status)
    }
}

fn has_active_items(items: &[WorkItem]) -> bool {
    items
        .iter()
        .any(|i| matches!(i.status, WorkItemStatus::Queued | WorkItemStatus::Processing))
}

fn judge_steps(steps: &[Step], items: &[WorkItem]) -> Verdict {
    if steps.iter().any(|s| !s.status.is_terminal()) || has_active_items(items) {
        return Verdict::Running;
    }

    let blocking: Vec<String> = steps
        .iter()
        .filter(|s| !s.optional && matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
        .map(|s| match &s.error {
            Some(error) => format!("{} ({}): {}", s.id, s.status, error),
            None => format!("{} ({})", s.id, s.status),
        })
        .collect();

    if blocking.is_empty() {
        Verdict::Completed(combine_steps(steps))
    } else {
        Verdict::Failed(format!(
            "{} step(s) did not complete: {}",
            blocking.len(),
            blocking.join("; ")
        ))
    }
}

fn judge_items(items: &[WorkItem]) -> Verdict {
    let live: Vec<&WorkItem> = items
        .iter()
        .filter(|i| i.status != WorkItemStatus::Cancelled)
        .collect();
    if live.is_empty() {
        return Verdict::Running;
    }
    if live.iter().all(|i| i.status == WorkItemStatus::Completed) {
        return Verdict::Completed(combine_items(items));
    }
    if has_active_items(items) {
        return Verdict::Running;
    }

    let failed: Vec<String> = live
        .iter()
        .filter(|i| i.status.is_failure())
        .map(|i| format!("{}: {}", i.step_id, i.error.as_deref().unwrap_or("failed")))
        .collect();
    if failed.is_empty() {
        Verdict::Running
    } else {
        Verdict::Failed(format!("{} work item(s) failed: {}", failed.len(), failed.join("; ")))
    }
}
