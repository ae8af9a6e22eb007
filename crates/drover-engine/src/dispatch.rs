use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use drover_core::config::{DispatchConfig, RetryConfig};
use drover_core::error::{DroverError, Result};
use drover_core::event::EventBus;
use drover_core::output::CapabilityOutput;
use drover_core::traits::{RecordStore, WorkQueue};
use drover_core::types::{
    JobId, OrchestrationEvent, Payload, WorkItem, WorkItemId, WorkItemStatus, UPSTREAM_KEY,
};

use crate::backoff::with_backoff;

/// A unit of work handed to the dispatch protocol.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Pre-generated so the caller can abandon the item after its own timeout.
    pub item_id: WorkItemId,
    pub job_id: JobId,
    pub step_id: String,
    pub capability: String,
    pub input: Payload,
    /// Outputs of the step's dependencies, keyed by step id.
    pub upstream: BTreeMap<String, CapabilityOutput>,
    pub priority: u32,
}

impl DispatchRequest {
    pub fn new(job_id: JobId, step_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            item_id: WorkItemId::new(),
            job_id,
            step_id: step_id.into(),
            capability: capability.into(),
            input: Payload::new(),
            upstream: BTreeMap::new(),
            priority: 0,
        }
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<String, CapabilityOutput>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// The input as the worker will see it, upstream outputs attached under
    /// the reserved `upstream` key.
    pub fn build_input(&self) -> Result<Payload> {
        let mut input = self.input.clone();
        if !self.upstream.is_empty() {
            let mut upstream = serde_json::Map::new();
            for (step_id, output) in &self.upstream {
                upstream.insert(step_id.clone(), serde_json::to_value(output)?);
            }
            input.insert(UPSTREAM_KEY.to_string(), serde_json::Value::Object(upstream));
        }
        Ok(input)
    }
}

/// The executor's only route to capabilities.
///
/// Implementations hand work to out-of-process workers and wait for a
/// durable result; the executor never runs a capability itself.
pub trait StepDispatch: Send + Sync + 'static {
    /// Dispatch one step and wait for its terminal result.
    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'_, Result<CapabilityOutput>>;

    /// Give up on an item so a late worker result is discarded.
    fn abandon(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>>;
}

/// Queue-backed dispatch: persist, enqueue, poll the record.
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    event_bus: Arc<EventBus>,
    config: DispatchConfig,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn WorkQueue>,
        event_bus: Arc<EventBus>,
        config: DispatchConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            event_bus,
            config,
            retry,
        }
    }

    /// Create the record and enqueue its id, retrying transient store failures.
    async fn submit(&self, request: &DispatchRequest) -> Result<WorkItem> {
        let mut item = WorkItem::new(
            request.job_id.clone(),
            request.step_id.clone(),
            request.capability.clone(),
            request.build_input()?,
        );
        item.id = request.item_id.clone();

        with_backoff(&self.retry, "create work item", || {
            self.store.create_work_item(&item)
        })
        .await?;
        with_backoff(&self.retry, "enqueue", || {
            self.queue.enqueue(&item.id, request.priority)
        })
        .await?;

        self.event_bus.publish(OrchestrationEvent::WorkItemEnqueued {
            job_id: item.job_id.clone(),
            item_id: item.id.clone(),
        });
        debug!(
            item_id = %item.id,
            job_id = %item.job_id,
            step_id = %item.step_id,
            capability = %item.capability,
            upstream = request.upstream.len(),
            "Work item dispatched"
        );
        Ok(item)
    }

    /// Poll the record until it is terminal or the wait bound elapses.
    async fn await_result(&self, item_id: &WorkItemId) -> Result<CapabilityOutput> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait();
        let poll = self.config.poll_interval();
        let mut observed_processing = false;

        loop {
            match self.store.get_work_item(item_id).await {
                Ok(Some(record)) => match record.status {
                    WorkItemStatus::Completed => {
                        let output = match record.result {
                            Some(output) => output,
                            None => self
                                .queue
                                .result(item_id)
                                .await?
                                .unwrap_or_else(|| CapabilityOutput::text("")),
                        };
                        return Ok(output);
                    }
                    WorkItemStatus::Failed | WorkItemStatus::PermanentlyFailed => {
                        return Err(DroverError::WorkerFailed {
                            work_item: item_id.to_string(),
                            message: record
                                .error
                                .unwrap_or_else(|| "worker reported failure".to_string()),
                        });
                    }
                    WorkItemStatus::Cancelled => return Err(DroverError::Cancelled),
                    WorkItemStatus::Processing => observed_processing = true,
                    // A queued record with retries has been picked up before.
                    WorkItemStatus::Queued => {
                        if record.retry_count > 0 {
                            observed_processing = true;
                        }
                    }
                },
                Ok(None) => {
                    return Err(DroverError::NotFound {
                        kind: "work item",
                        id: item_id.to_string(),
                    })
                }
                Err(e) if e.is_retryable() => {
                    warn!(item_id = %item_id, error = %e, "Status poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(poll)).await;
        }

        let waited_secs = started.elapsed().as_secs();
        if observed_processing {
            warn!(item_id = %item_id, waited_secs, "Work item still running at wait bound");
        } else {
            warn!(
                item_id = %item_id,
                waited_secs,
                "Work item never picked up, worker pool may be stalled or absent"
            );
        }
        if let Err(e) = self.abandon(item_id).await {
            warn!(item_id = %item_id, error = %e, "Failed to abandon timed out work item");
        }
        Err(DroverError::DispatchTimeout {
            work_item: item_id.to_string(),
            waited_secs,
            observed_processing,
        })
    }
}

impl StepDispatch for Dispatcher {
    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            let item = self.submit(&request).await?;
            self.await_result(&item.id).await
        })
    }

    fn abandon(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>> {
        let item_id = item.clone();
        Box::pin(async move {
            if let Some(mut record) = self.store.get_work_item(&item_id).await? {
                if !record.status.is_terminal() {
                    record.status = WorkItemStatus::Cancelled;
                    record.completed_at = Some(Utc::now());
                    record.error = Some("abandoned by dispatcher".to_string());
                    self.store.update_work_item(&record).await?;
                    info!(item_id = %item_id, "Work item abandoned");
                }
            }
            self.queue.remove(&item_id).await
        })
    }
}
