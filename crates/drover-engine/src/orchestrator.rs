use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drover_core::config::AppConfig;
use drover_core::error::{DroverError, Result};
use drover_core::event::EventBus;
use drover_core::traits::{RecordStore, WorkQueue};
use drover_core::types::{
    DeadLetter, Job, JobId, OrchestrationEvent, Step, WorkItem, WorkItemStatus,
};
use drover_store::{Database, SqliteQueue, SqliteStore};

use crate::aggregator::CompletionAggregator;
use crate::dispatch::{Dispatcher, StepDispatch};
use crate::planner::Planner;
use crate::registry::CapabilityRegistry;
use crate::run_log::RunLogger;
use crate::worker::{WorkerLoop, WorkerPool};
use crate::workflow::{StepSpec, Workflow, WorkflowExecutor, WorkflowReport};

/// Everything recorded about one job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: Job,
    pub steps: Vec<Step>,
    pub items: Vec<WorkItem>,
}

impl JobSnapshot {
    /// Work items still waiting for or held by a worker.
    pub fn active_items(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.status, WorkItemStatus::Queued | WorkItemStatus::Processing))
            .count()
    }
}

/// Wires the store, queue, dispatcher, executor and workers together.
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<CapabilityRegistry>,
    event_bus: Arc<EventBus>,
    aggregator: Arc<CompletionAggregator>,
    executor: WorkflowExecutor,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn WorkQueue>,
        registry: CapabilityRegistry,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let aggregator = Arc::new(CompletionAggregator::new(store.clone(), event_bus.clone()));
        let dispatcher: Arc<dyn StepDispatch> = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            event_bus.clone(),
            config.dispatch.clone(),
            config.retry.clone(),
        ));
        let executor = WorkflowExecutor::new(
            store.clone(),
            dispatcher,
            aggregator.clone(),
            event_bus.clone(),
            config.executor.clone(),
        );

        Self {
            config,
            store,
            queue,
            registry: Arc::new(registry),
            event_bus,
            aggregator,
            executor,
        }
    }

    /// Open the SQLite backend named in `config.store` and wire everything to it.
    pub fn open(config: AppConfig, registry: CapabilityRegistry) -> Result<Self> {
        let path = config.store_path();
        let db = Database::open(&path)?;
        info!(path = %path.display(), "Store opened");
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(db.clone()));
        let queue: Arc<dyn WorkQueue> = Arc::new(SqliteQueue::new(db, config.queue.clone()));
        Ok(Self::new(config, store, queue, registry))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        self.registry.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Validate a workflow and create its job record.
    pub async fn submit_workflow(&self, owner: &str, workflow: &Workflow) -> Result<JobId> {
        workflow.validate()?;
        let description = if workflow.description.is_empty() {
            workflow.name.clone()
        } else {
            workflow.description.clone()
        };
        let job = Job::new(owner, description);
        self.store.create_job(&job).await?;
        info!(job_id = %job.id, workflow = %workflow.name, owner, "Job submitted");
        Ok(job.id)
    }

    /// Run a workflow for an already submitted job.
    ///
    /// Needs workers draining the same queue, in this process or another.
    pub async fn execute(&self, job_id: &JobId, workflow: &Workflow) -> Result<WorkflowReport> {
        let logger = self.config.log_dir().map(|dir| {
            let level = self.config.log.as_ref().map(|l| l.level).unwrap_or(2);
            let cancel = CancellationToken::new();
            let handle = RunLogger::new(dir, level).spawn(
                &self.event_bus,
                job_id.clone(),
                cancel.clone(),
            );
            (handle, cancel)
        });

        let report = self.executor.execute(job_id, workflow).await;

        if let Some((mut handle, cancel)) = logger {
            // The logger stops by itself on the terminal job event
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                cancel.cancel();
                handle.await.ok();
            }
        }
        report
    }

    /// Submit and execute in one call.
    pub async fn run_workflow(&self, owner: &str, workflow: &Workflow) -> Result<WorkflowReport> {
        let job_id = self.submit_workflow(owner, workflow).await?;
        self.execute(&job_id, workflow).await
    }

    /// Plan a flat list of steps into level phases and run it.
    pub async fn run_flat(
        &self,
        owner: &str,
        name: &str,
        steps: Vec<StepSpec>,
    ) -> Result<WorkflowReport> {
        let workflow = Planner::plan_flat(name, steps);
        self.run_workflow(owner, &workflow).await
    }

    /// A worker loop bound to this orchestrator's backend and registry.
    pub fn worker(&self, cancel: CancellationToken) -> WorkerLoop {
        WorkerLoop::new(
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            self.aggregator.clone(),
            self.event_bus.clone(),
            self.config.worker.clone(),
            self.config.retry.clone(),
            cancel,
        )
    }

    pub fn spawn_workers(&self, count: usize, cancel: CancellationToken) -> WorkerPool {
        WorkerPool::spawn(self.worker(cancel), count)
    }

    /// Cancel a job and pull its pending work off the queue.
    ///
    /// Returns false when the job had already finished. Items a worker is
    /// holding are not interrupted; their results are discarded.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DroverError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        if job.status.is_terminal() {
            debug!(
                job_id = %job_id,
                status = %job.status,
                "Job already finished, nothing to cancel"
            );
            return Ok(false);
        }

        let items = self.store.cancel_job(job_id).await?;
        for item in &items {
            if let Err(e) = self.queue.remove(item).await {
                warn!(
                    job_id = %job_id,
                    item_id = %item,
                    error = %e,
                    "Failed to remove cancelled item from queue"
                );
            }
        }
        self.event_bus.publish(OrchestrationEvent::JobCancelled {
            job_id: job_id.clone(),
        });
        info!(job_id = %job_id, items = items.len(), "Job cancelled");
        Ok(true)
    }

    pub async fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DroverError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        let steps = self.store.list_steps(job_id).await?;
        let items = self.store.list_work_items(job_id).await?;
        Ok(JobSnapshot { job, steps, items })
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.store.list_jobs(limit).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters(limit).await
    }

    /// Re-enqueue items claimed more than `queue.stale_after_secs` ago, such as
    /// those left behind by a crashed worker.
    pub async fn recover_stale(&self) -> Result<usize> {
        let stale_after = Duration::from_secs(self.config.queue.stale_after_secs);
        let ids = self.queue.requeue_stale(stale_after).await?;
        for id in &ids {
            let Some(mut item) = self.store.get_work_item(id).await? else {
                continue;
            };
            if item.status == WorkItemStatus::Processing {
                item.status = WorkItemStatus::Queued;
                item.started_at = None;
                self.store.update_work_item(&item).await?;
            }
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Recovered stale work items");
        }
        Ok(ids.len())
    }
}
