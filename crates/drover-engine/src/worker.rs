use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drover_core::config::{RetryConfig, WorkerConfig};
use drover_core::error::{DroverError, Result};
use drover_core::event::EventBus;
use drover_core::output::CapabilityOutput;
use drover_core::traits::{RecordStore, WorkQueue};
use drover_core::types::{
    OrchestrationEvent, WorkItem, WorkItemId, WorkItemStatus, BACKFILL_MARKER, UPSTREAM_KEY,
};

use crate::aggregator::CompletionAggregator;
use crate::backoff::calculate_backoff;
use crate::registry::CapabilityRegistry;

/// Dequeues work items and runs their capabilities until cancelled.
///
/// Every failure is handled locally: an item ends up completed, re-queued,
/// dead-lettered or discarded, and the loop moves on to the next one.
#[derive(Clone)]
pub struct WorkerLoop {
    id: usize,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<CapabilityRegistry>,
    aggregator: Arc<CompletionAggregator>,
    event_bus: Arc<EventBus>,
    config: WorkerConfig,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl WorkerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn WorkQueue>,
        registry: Arc<CapabilityRegistry>,
        aggregator: Arc<CompletionAggregator>,
        event_bus: Arc<EventBus>,
        config: WorkerConfig,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: 0,
            store,
            queue,
            registry,
            aggregator,
            event_bus,
            config,
            retry,
            cancel,
        }
    }

    /// Worker number used in log fields.
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Run the loop. Blocks until cancelled; an item already dequeued is
    /// always carried to a terminal decision first.
    pub async fn run(&self) {
        info!(worker = self.id, "Worker started");
        let timeout = Duration::from_secs(self.config.dequeue_timeout_secs);
        let mut consecutive_errors: u32 = 0;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.queue.dequeue(timeout) => next,
            };

            match next {
                Ok(Some(item_id)) => {
                    consecutive_errors = 0;
                    if let Err(e) = self.process(&item_id).await {
                        error!(
                            worker = self.id,
                            item_id = %item_id,
                            error = %e,
                            "Work item processing failed"
                        );
                    }
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    let backoff = calculate_backoff(consecutive_errors, &self.retry);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        worker = self.id,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Dequeue failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Take one dequeued item through to a terminal decision.
    pub async fn process(&self, item_id: &WorkItemId) -> Result<()> {
        self.queue.mark_processing(item_id).await?;

        let Some(mut item) = self.store.get_work_item(item_id).await? else {
            warn!(worker = self.id, item_id = %item_id, "Dequeued unknown work item, dropping");
            return self.queue.remove(item_id).await;
        };
        if item.status.is_terminal() || !self.store.claim_work_item(item_id).await? {
            debug!(
                worker = self.id,
                item_id = %item_id,
                status = %item.status,
                "Work item already settled, dropping"
            );
            return self.queue.remove(item_id).await;
        }
        item.status = WorkItemStatus::Processing;
        item.started_at = Some(Utc::now());

        let Some(capability) = self.registry.get(&item.capability) else {
            let message = DroverError::CapabilityNotFound(item.capability.clone()).to_string();
            warn!(
                worker = self.id,
                item_id = %item_id,
                capability = %item.capability,
                "Unknown capability"
            );
            item.status = WorkItemStatus::Failed;
            item.error = Some(message);
            item.completed_at = Some(Utc::now());
            self.store.update_work_item(&item).await?;
            self.queue.remove(item_id).await?;
            return self.settle(&item).await;
        };

        if self.config.backfill_upstream && capability.requires_upstream() && !item.has_upstream() {
            self.backfill(&mut item).await;
        }

        info!(
            worker = self.id,
            item_id = %item_id,
            step_id = %item.step_id,
            capability = %item.capability,
            attempt = item.retry_count + 1,
            "Executing work item"
        );
        let invocation = self.registry.execute(&item.capability, item.input.clone());
        let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(result)) if result.is_success() => Ok(result.output),
            Ok(Ok(result)) => Err(result.error.unwrap_or_else(|| result.output.render())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match outcome {
            Ok(output) => self.complete(item, output).await,
            Err(message) => self.fail(item, message).await,
        }
    }

    async fn complete(&self, mut item: WorkItem, output: CapabilityOutput) -> Result<()> {
        item.status = WorkItemStatus::Completed;
        item.result = Some(output.clone());
        item.error = None;
        item.completed_at = Some(Utc::now());

        if !self.store.update_work_item(&item).await? {
            info!(
                worker = self.id,
                item_id = %item.id,
                "Work item was cancelled, discarding result"
            );
            return self.queue.remove(&item.id).await;
        }
        self.queue.mark_complete(&item.id, &output).await?;
        info!(worker = self.id, item_id = %item.id, step_id = %item.step_id, "Work item completed");
        self.settle(&item).await
    }

    async fn fail(&self, mut item: WorkItem, message: String) -> Result<()> {
        // The record goes back to queued before the queue can hand the item
        // to another worker.
        item.status = WorkItemStatus::Queued;
        item.retry_count += 1;
        item.error = Some(message.clone());
        if !self.store.update_work_item(&item).await? {
            info!(
                worker = self.id,
                item_id = %item.id,
                "Work item was cancelled, discarding failure"
            );
            return self.queue.remove(&item.id).await;
        }

        if self.queue.mark_failed(&item.id, &message).await? {
            warn!(
                worker = self.id,
                item_id = %item.id,
                retries = item.retry_count,
                error = %message,
                "Work item failed, re-queued"
            );
            return Ok(());
        }

        item.status = WorkItemStatus::PermanentlyFailed;
        item.completed_at = Some(Utc::now());
        if !self.store.update_work_item(&item).await? {
            return Ok(());
        }
        error!(
            worker = self.id,
            item_id = %item.id,
            retries = item.retry_count,
            error = %message,
            "Work item permanently failed"
        );
        self.event_bus.publish(OrchestrationEvent::WorkItemDeadLettered {
            item_id: item.id.clone(),
            error: message,
        });
        self.settle(&item).await
    }

    /// Let the aggregator re-evaluate the parent job. Its errors never fail the item.
    async fn settle(&self, item: &WorkItem) -> Result<()> {
        if let Err(e) = self.aggregator.check(&item.job_id).await {
            warn!(worker = self.id, job_id = %item.job_id, error = %e, "Completion check failed");
        }
        Ok(())
    }

    /// Compatibility shim: splice the latest completed sibling output into an
    /// input that arrived without upstream content.
    async fn backfill(&self, item: &mut WorkItem) {
        let sibling = match self.store.latest_completed_sibling(&item.job_id, &item.id).await {
            Ok(Some(sibling)) => sibling,
            Ok(None) => {
                debug!(item_id = %item.id, "No completed sibling to backfill from");
                return;
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Backfill lookup failed");
                return;
            }
        };
        let Some(result) = sibling.result else { return };
        let value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Backfill serialization failed");
                return;
            }
        };

        let mut upstream = serde_json::Map::new();
        upstream.insert(sibling.step_id.clone(), value);
        item.input
            .insert(UPSTREAM_KEY.to_string(), serde_json::Value::Object(upstream));
        item.input
            .insert(BACKFILL_MARKER.to_string(), serde_json::Value::Bool(true));
        warn!(
            item_id = %item.id,
            step_id = %item.step_id,
            from_step = %sibling.step_id,
            "Upstream content missing, backfilled from sibling; check dependency wiring"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("capability panicked: {}", detail)
}

/// A set of worker loops sharing one cancellation token.
pub struct WorkerPool {
    workers: JoinSet<()>,
    cancel: CancellationToken,
    size: usize,
}

impl WorkerPool {
    /// Spawn `count` copies of `template`, numbered from 0.
    pub fn spawn(template: WorkerLoop, count: usize) -> Self {
        let cancel = template.cancel.clone();
        let mut workers = JoinSet::new();
        for id in 0..count {
            let worker = template.clone().with_id(id);
            workers.spawn(async move { worker.run().await });
        }
        info!(count, "Worker pool started");
        Self {
            workers,
            cancel,
            size: count,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every worker to exit (after the token is cancelled elsewhere).
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Cancel all workers and wait for them to finish their current item.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
        info!("Worker pool stopped");
    }
}
