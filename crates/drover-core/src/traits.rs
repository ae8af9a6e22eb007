use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::output::{CapabilityOutput, CapabilityResult};
use crate::types::*;

/// Capability — the pluggable, black-box unit of domain logic.
pub trait Capability: Send + Sync + 'static {
    /// Capability name (steps refer to it by this name).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute the capability against an input payload.
    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<CapabilityResult>>;

    /// Timeout in seconds for one invocation.
    fn timeout_secs(&self) -> u64 {
        300
    }

    /// Whether this capability expects upstream content under `upstream`.
    fn requires_upstream(&self) -> bool {
        false
    }
}

/// Work queue — durable, priority-aware hand-off between dispatchers and workers.
pub trait WorkQueue: Send + Sync + 'static {
    /// Push an item. Priority 0 goes to the normal FIFO lane, anything higher
    /// to the priority lane.
    fn enqueue(&self, item: &WorkItemId, priority: u32) -> BoxFuture<'_, Result<()>>;

    /// Pop the next item, waiting up to `timeout` when the queue is empty.
    fn dequeue(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<WorkItemId>>>;

    /// Record that a worker claimed the item.
    fn mark_processing(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>>;

    /// Store the item's result (with a bounded TTL) and clear its bookkeeping.
    fn mark_complete(
        &self,
        item: &WorkItemId,
        result: &CapabilityOutput,
    ) -> BoxFuture<'_, Result<()>>;

    /// Count a failure. Returns true if the item was re-enqueued, false if it
    /// was moved to the dead-letter list.
    fn mark_failed(&self, item: &WorkItemId, error: &str) -> BoxFuture<'_, Result<bool>>;

    /// Forget an item entirely (cancellation).
    fn remove(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>>;

    /// Number of items waiting across both lanes.
    fn size(&self) -> BoxFuture<'_, Result<usize>>;

    /// Number of entries in the dead-letter list.
    fn dead_letter_count(&self) -> BoxFuture<'_, Result<usize>>;

    /// Most recent dead-letter entries, newest first.
    fn dead_letters(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DeadLetter>>>;

    /// Failures counted so far for an item.
    fn retry_count(&self, item: &WorkItemId) -> BoxFuture<'_, Result<u32>>;

    /// Stored result, unless expired.
    fn result(&self, item: &WorkItemId) -> BoxFuture<'_, Result<Option<CapabilityOutput>>>;

    /// Re-enqueue items claimed longer ago than `older_than` (crashed workers).
    /// Returns the ids put back on the queue.
    fn requeue_stale(&self, older_than: Duration) -> BoxFuture<'_, Result<Vec<WorkItemId>>>;
}

/// Record store — persistence for jobs, steps and work items.
pub trait RecordStore: Send + Sync + 'static {
    fn create_job(&self, job: &Job) -> BoxFuture<'_, Result<()>>;

    fn get_job(&self, id: &JobId) -> BoxFuture<'_, Result<Option<Job>>>;

    fn list_jobs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>>;

    /// Set job status; terminal statuses stamp `completed_at`.
    ///
    /// A terminal job never changes status again (only its output may be
    /// replaced). Returns true if this call moved the job out of a
    /// non-terminal status.
    fn set_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Insert or replace a step record.
    fn save_step(&self, step: &Step) -> BoxFuture<'_, Result<()>>;

    fn get_step(&self, job_id: &JobId, step_id: &str) -> BoxFuture<'_, Result<Option<Step>>>;

    /// Steps of a job, ordered by phase then declared position.
    fn list_steps(&self, job_id: &JobId) -> BoxFuture<'_, Result<Vec<Step>>>;

    fn create_work_item(&self, item: &WorkItem) -> BoxFuture<'_, Result<()>>;

    fn get_work_item(&self, id: &WorkItemId) -> BoxFuture<'_, Result<Option<WorkItem>>>;

    /// Work items of a job, ordered by enqueue time.
    fn list_work_items(&self, job_id: &JobId) -> BoxFuture<'_, Result<Vec<WorkItem>>>;

    /// Persist a work item's mutable fields. A cancelled record is never
    /// overwritten; returns false in that case.
    fn update_work_item(&self, item: &WorkItem) -> BoxFuture<'_, Result<bool>>;

    /// Move a work item to `processing` and stamp `started_at`.
    /// Returns false if the record is already terminal (completed, failed or cancelled).
    /// Exclusivity between workers comes from the queue's atomic dequeue.
    fn claim_work_item(&self, id: &WorkItemId) -> BoxFuture<'_, Result<bool>>;

    /// Most recently completed work item of the same job, excluding `exclude`.
    fn latest_completed_sibling(
        &self,
        job_id: &JobId,
        exclude: &WorkItemId,
    ) -> BoxFuture<'_, Result<Option<WorkItem>>>;

    /// Cancel a job and its non-terminal steps and work items.
    /// Returns the ids of work items that were cancelled.
    fn cancel_job(&self, id: &JobId) -> BoxFuture<'_, Result<Vec<WorkItemId>>>;
}
