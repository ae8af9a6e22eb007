use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use drover_core::config::ExecutorConfig;
use drover_core::error::{DroverError, Result};
use drover_core::event::EventBus;
use drover_core::output::CapabilityOutput;
use drover_core::traits::RecordStore;
use drover_core::types::{JobId, JobStatus, OrchestrationEvent, Step, StepStatus};

use super::outputs::StepOutputs;
use super::phase::{FailurePolicy, Phase, PhaseMode, StepSpec, Workflow};
use crate::aggregator::CompletionAggregator;
use crate::dispatch::{DispatchRequest, StepDispatch};
use crate::scheduler::{DependencyScheduler, GraphNode};

/// Terminal state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    Partial,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub name: String,
    pub status: PhaseStatus,
    pub policy: FailurePolicy,
    /// 2 when the phase was retried.
    pub attempts: u32,
    pub completed: Vec<String>,
    /// Steps that failed or were skipped.
    pub unfinished: Vec<String>,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub phases: Vec<PhaseReport>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl WorkflowReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Mutable state of one job while its workflow runs.
struct JobRun {
    job_id: JobId,
    records: HashMap<String, Step>,
    outputs: StepOutputs,
    /// Set during the first attempt of a retry phase: failed and skipped
    /// steps are persisted as `pending` so no completion check can settle
    /// the job before the retry runs.
    hold_failures: bool,
}

impl JobRun {
    fn settled_percent(&self) -> u8 {
        if self.records.is_empty() {
            return 100;
        }
        let settled = self
            .records
            .values()
            .filter(|s| s.status.is_terminal())
            .count();
        ((settled * 100) / self.records.len()) as u8
    }
}

/// Runs workflows phase by phase through the dispatch protocol.
///
/// The executor never invokes a capability itself: every step becomes a
/// dispatch request, so a misbehaving capability cannot take the executor
/// down with it.
pub struct WorkflowExecutor {
    store: Arc<dyn RecordStore>,
    dispatch: Arc<dyn StepDispatch>,
    aggregator: Arc<CompletionAggregator>,
    event_bus: Arc<EventBus>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        dispatch: Arc<dyn StepDispatch>,
        aggregator: Arc<CompletionAggregator>,
        event_bus: Arc<EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            dispatch,
            aggregator,
            event_bus,
            config,
        }
    }

    /// Persist every step of the workflow as `pending`.
    pub async fn register_steps(&self, job_id: &JobId, workflow: &Workflow) -> Result<Vec<Step>> {
        let mut steps = Vec::with_capacity(workflow.step_count());
        for (phase_index, phase) in workflow.phases.iter().enumerate() {
            let optional = phase.failure_policy() == FailurePolicy::Skip;
            for (position, spec) in phase.steps.iter().enumerate() {
                let mut step = Step::new(job_id.clone(), spec.id.clone(), spec.capability.clone());
                step.phase_index = phase_index;
                step.phase_name = phase.name.clone();
                step.position = position;
                step.input = spec.input.clone();
                step.dependencies = spec.dependencies.clone();
                step.optional = optional;
                step.tolerate_failed_deps = spec.tolerate_failed_deps;
                self.store.save_step(&step).await?;
                steps.push(step);
            }
        }
        debug!(job_id = %job_id, steps = steps.len(), "Workflow steps registered");
        Ok(steps)
    }

    /// Run a workflow for an existing job and return once the job is settled.
    pub async fn execute(&self, job_id: &JobId, workflow: &Workflow) -> Result<WorkflowReport> {
        let start = Instant::now();
        workflow.validate()?;

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DroverError::NotFound {
                kind: "job",
                id: job_id.to_string(),
            })?;
        if job.status.is_terminal() {
            return Ok(WorkflowReport {
                job_id: job_id.clone(),
                status: job.status,
                phases: vec![],
                output: job.output,
                error: job.error,
                elapsed_ms: 0,
            });
        }

        let steps = self.register_steps(job_id, workflow).await?;
        let mut run = JobRun {
            job_id: job_id.clone(),
            records: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
            outputs: StepOutputs::new(),
            hold_failures: false,
        };

        self.store
            .set_job_status(job_id, JobStatus::Running, None, None)
            .await?;
        self.event_bus.publish(OrchestrationEvent::JobStarted {
            job_id: job_id.clone(),
        });
        info!(
            job_id = %job_id,
            workflow = %workflow.name,
            phases = workflow.phases.len(),
            steps = run.records.len(),
            "Workflow started"
        );

        let mut reports = Vec::with_capacity(workflow.phases.len());
        for (index, phase) in workflow.phases.iter().enumerate() {
            if self.is_cancelled(job_id).await? {
                info!(job_id = %job_id, phase = %phase.name, "Job cancelled, stopping workflow");
                break;
            }

            self.event_bus.publish(OrchestrationEvent::PhaseStarted {
                job_id: job_id.clone(),
                phase: phase.name.clone(),
                index,
            });
            info!(
                job_id = %job_id,
                phase = %phase.name,
                index,
                mode = ?phase.mode,
                "Phase started"
            );

            let policy = phase.failure_policy();
            let mut attempts = 1;
            run.hold_failures = policy == FailurePolicy::Retry;
            let mut status = self.run_phase(&mut run, phase).await?;
            run.hold_failures = false;

            if status != PhaseStatus::Completed && !self.is_cancelled(job_id).await? {
                match policy {
                    FailurePolicy::Abort => {}
                    FailurePolicy::Skip => {
                        warn!(
                            job_id = %job_id,
                            phase = %phase.name,
                            status = %status,
                            "Optional phase did not complete, continuing"
                        );
                    }
                    FailurePolicy::Retry => {
                        warn!(
                            job_id = %job_id,
                            phase = %phase.name,
                            status = %status,
                            "Phase did not complete, retrying once"
                        );
                        attempts = 2;
                        status = self.run_phase(&mut run, phase).await?;
                        if status != PhaseStatus::Completed {
                            warn!(
                                job_id = %job_id,
                                phase = %phase.name,
                                status = %status,
                                "Phase retry exhausted, continuing"
                            );
                        }
                    }
                }
            }

            let report = phase_report(&run, phase, status, policy, attempts);
            self.event_bus.publish(OrchestrationEvent::PhaseCompleted {
                job_id: job_id.clone(),
                phase: phase.name.clone(),
                status: status.as_str().to_string(),
            });
            info!(
                job_id = %job_id,
                phase = %phase.name,
                status = %status,
                completed = report.completed.len(),
                unfinished = report.unfinished.len(),
                "Phase finished"
            );
            reports.push(report);

            if status != PhaseStatus::Completed && policy == FailurePolicy::Abort {
                error!(
                    job_id = %job_id,
                    phase = %phase.name,
                    "Critical phase failed, aborting job"
                );
                let reason = DroverError::JobAborted {
                    phase: phase.name.clone(),
                }
                .to_string();
                self.skip_phases(&mut run, &workflow.phases[index + 1..], &reason)
                    .await?;
                self.publish_progress(&run);
                break;
            }
            self.publish_progress(&run);
        }

        let status = self.aggregator.check(job_id).await?;
        let job = self.store.get_job(job_id).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(job_id = %job_id, status = %status, elapsed_ms, "Workflow finished");

        Ok(WorkflowReport {
            job_id: job_id.clone(),
            status,
            phases: reports,
            output: job.as_ref().and_then(|j| j.output.clone()),
            error: job.and_then(|j| j.error),
            elapsed_ms,
        })
    }

    /// Run every not yet completed step of a phase; returns once all of them
    /// are terminal.
    async fn run_phase(&self, run: &mut JobRun, phase: &Phase) -> Result<PhaseStatus> {
        let pending: Vec<&StepSpec> = phase
            .steps
            .iter()
            .filter(|s| !run.outputs.is_completed(&s.id))
            .collect();

        match phase.mode {
            PhaseMode::Parallel => {
                let nodes: Vec<GraphNode> = pending.iter().map(|s| s.graph_node()).collect();
                let schedule = DependencyScheduler::order(&nodes);
                let by_id: HashMap<&str, &StepSpec> =
                    pending.iter().map(|s| (s.id.as_str(), *s)).collect();

                for level in &schedule.levels {
                    if self.is_cancelled(&run.job_id).await? {
                        break;
                    }
                    let mut ready = Vec::with_capacity(level.len());
                    for id in level {
                        let Some(spec) = by_id.get(id.as_str()) else { continue };
                        if self.check_ready(run, spec).await? {
                            ready.push(*spec);
                        }
                    }
                    self.run_batch(run, &ready).await?;
                }
            }
            PhaseMode::Sequential => {
                for (i, spec) in pending.iter().enumerate() {
                    if self.is_cancelled(&run.job_id).await? {
                        break;
                    }
                    let mut ran = self.check_ready(run, spec).await?;
                    if ran {
                        self.run_batch(run, &[*spec]).await?;
                        ran = run.outputs.is_completed(&spec.id);
                    }
                    if !ran {
                        let reason = format!(
                            "not attempted: step '{}' in sequential phase '{}' did not complete",
                            spec.id, phase.name
                        );
                        for rest in &pending[i + 1..] {
                            self.skip_step(run, &rest.id, &reason).await?;
                        }
                        break;
                    }
                }
            }
        }

        let completed = phase
            .steps
            .iter()
            .filter(|s| run.outputs.is_completed(&s.id))
            .count();
        Ok(if completed == phase.steps.len() {
            PhaseStatus::Completed
        } else if completed == 0 {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Partial
        })
    }

    /// Skip the step if its dependencies are unmet. Returns whether it may run.
    async fn check_ready(&self, run: &mut JobRun, spec: &StepSpec) -> Result<bool> {
        let missing: Vec<String> = run
            .outputs
            .unmet(&spec.dependencies, spec.tolerate_failed_deps)
            .into_iter()
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            return Ok(true);
        }
        let reason = DroverError::DependencyUnmet {
            step: spec.id.clone(),
            missing,
        }
        .to_string();
        self.skip_step(run, &spec.id, &reason).await?;
        Ok(false)
    }

    /// Dispatch a batch of ready steps on the bounded pool and record results
    /// as they arrive, in completion order.
    async fn run_batch(&self, run: &mut JobRun, specs: &[&StepSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let step_timeout = Duration::from_secs(self.config.step_timeout_secs);
        let mut tasks = JoinSet::new();
        let mut outstanding: HashSet<String> = HashSet::new();

        for spec in specs {
            let Some(record) = run.records.get_mut(&spec.id) else {
                continue;
            };
            // Dependencies are met; the step now only waits for a permit.
            record.status = StepStatus::Ready;
            record.error = None;
            record.completed_at = None;
            self.store.save_step(record).await?;
            let record = record.clone();

            let request =
                DispatchRequest::new(run.job_id.clone(), spec.id.clone(), spec.capability.clone())
                    .with_input(spec.input.clone())
                    .with_upstream(run.outputs.upstream_for(&spec.dependencies));
            outstanding.insert(spec.id.clone());

            let dispatch = self.dispatch.clone();
            let store = self.store.clone();
            let event_bus = self.event_bus.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started_at = Utc::now();

                let mut started = record;
                started.status = StepStatus::InProgress;
                started.started_at = Some(started_at);
                if let Err(e) = store.save_step(&started).await {
                    warn!(step_id = %started.id, error = %e, "Failed to persist step start");
                }
                event_bus.publish(OrchestrationEvent::StepStarted {
                    job_id: started.job_id.clone(),
                    step_id: started.id.clone(),
                });

                let item_id = request.item_id.clone();
                let dispatched =
                    tokio::time::timeout(step_timeout, dispatch.dispatch(request)).await;
                let result = match dispatched {
                    Ok(result) => result,
                    Err(_) => {
                        if let Err(e) = dispatch.abandon(&item_id).await {
                            warn!(
                                item_id = %item_id,
                                error = %e,
                                "Failed to abandon timed out step"
                            );
                        }
                        Err(DroverError::DispatchTimeout {
                            work_item: item_id.to_string(),
                            waited_secs: step_timeout.as_secs(),
                            observed_processing: false,
                        })
                    }
                };
                (started.id, started_at, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((step_id, started_at, result)) => {
                    outstanding.remove(&step_id);
                    self.record_result(run, &step_id, started_at, result).await?;
                }
                Err(e) => error!(job_id = %run.job_id, error = %e, "Step task ended abnormally"),
            }
        }

        // Tasks that panicked never reported back.
        for step_id in outstanding {
            self.record_result(
                run,
                &step_id,
                Utc::now(),
                Err(DroverError::Capability {
                    capability: "dispatch".into(),
                    message: "step task ended abnormally".into(),
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn record_result(
        &self,
        run: &mut JobRun,
        step_id: &str,
        started_at: DateTime<Utc>,
        result: Result<CapabilityOutput>,
    ) -> Result<()> {
        let hold = run.hold_failures;
        let Some(step) = run.records.get_mut(step_id) else {
            return Ok(());
        };
        step.started_at = Some(started_at);

        match result {
            Ok(output) => {
                step.finish(StepStatus::Completed, Some(output.clone()), None);
                run.outputs.insert(step_id, output);
                info!(job_id = %run.job_id, step_id, "Step completed");
                self.event_bus.publish(OrchestrationEvent::StepCompleted {
                    job_id: run.job_id.clone(),
                    step_id: step_id.to_string(),
                });
            }
            Err(DroverError::Cancelled) => {
                step.finish(StepStatus::Cancelled, None, Some("cancelled".into()));
                run.outputs.mark(step_id, StepStatus::Cancelled);
                debug!(job_id = %run.job_id, step_id, "Step cancelled");
            }
            Err(e) => {
                let error = e.to_string();
                step.finish(StepStatus::Failed, None, Some(error.clone()));
                run.outputs.mark(step_id, StepStatus::Failed);
                warn!(job_id = %run.job_id, step_id, error = %error, "Step failed");
                self.event_bus.publish(OrchestrationEvent::StepFailed {
                    job_id: run.job_id.clone(),
                    step_id: step_id.to_string(),
                    error,
                });
            }
        }
        self.persist_outcome(step, hold).await
    }

    /// Save a settled step. While failures are held, a failed or skipped
    /// step is stored as `pending` with its error, keeping the job open.
    async fn persist_outcome(&self, step: &Step, hold: bool) -> Result<()> {
        if hold && matches!(step.status, StepStatus::Failed | StepStatus::Skipped) {
            let mut held = step.clone();
            held.status = StepStatus::Pending;
            held.completed_at = None;
            return self.store.save_step(&held).await;
        }
        self.store.save_step(step).await
    }

    async fn skip_step(&self, run: &mut JobRun, step_id: &str, reason: &str) -> Result<()> {
        let hold = run.hold_failures;
        let Some(step) = run.records.get_mut(step_id) else {
            return Ok(());
        };
        step.finish(StepStatus::Skipped, None, Some(reason.to_string()));
        self.persist_outcome(step, hold).await?;
        run.outputs.mark(step_id, StepStatus::Skipped);
        warn!(job_id = %run.job_id, step_id, reason, "Step skipped");
        self.event_bus.publish(OrchestrationEvent::StepSkipped {
            job_id: run.job_id.clone(),
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn skip_phases(&self, run: &mut JobRun, phases: &[Phase], reason: &str) -> Result<()> {
        for phase in phases {
            for spec in &phase.steps {
                self.skip_step(run, &spec.id, reason).await?;
            }
        }
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool> {
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .is_some_and(|j| j.status == JobStatus::Cancelled))
    }

    fn publish_progress(&self, run: &JobRun) {
        self.event_bus.publish(OrchestrationEvent::Progress {
            job_id: run.job_id.clone(),
            percent: run.settled_percent(),
        });
    }
}

fn phase_report(
    run: &JobRun,
    phase: &Phase,
    status: PhaseStatus,
    policy: FailurePolicy,
    attempts: u32,
) -> PhaseReport {
    let (completed, unfinished): (Vec<&StepSpec>, Vec<&StepSpec>) = phase
        .steps
        .iter()
        .partition(|s| run.outputs.is_completed(&s.id));
    PhaseReport {
        name: phase.name.clone(),
        status,
        policy,
        attempts,
        completed: completed.into_iter().map(|s| s.id.clone()).collect(),
        unfinished: unfinished.into_iter().map(|s| s.id.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::future::BoxFuture;

    use drover_core::types::{Job, WorkItem, WorkItemId};
    use drover_store::SqliteStore;

    /// Dispatch stand-in: answers directly, failing the configured steps.
    #[derive(Default)]
    struct ScriptedDispatch {
        failing: HashSet<String>,
        /// Steps that fail on their first call only.
        flaky: HashSet<String>,
        delay: Duration,
        requests: Mutex<Vec<DispatchRequest>>,
        spans: Mutex<Vec<(String, Instant, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        abandoned: Mutex<Vec<WorkItemId>>,
    }

    impl ScriptedDispatch {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn failing_once(ids: &[&str]) -> Self {
            Self {
                flaky: ids.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self, step_id: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.step_id == step_id)
                .count()
        }

        fn request(&self, step_id: &str) -> DispatchRequest {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.step_id == step_id)
                .cloned()
                .unwrap()
        }

        fn span(&self, step_id: &str) -> (Instant, Instant) {
            let spans = self.spans.lock().unwrap();
            let (_, start, end) = spans.iter().find(|(id, _, _)| id == step_id).unwrap();
            (*start, *end)
        }
    }

    impl StepDispatch for ScriptedDispatch {
        fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'_, Result<CapabilityOutput>> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                let attempt = {
                    let mut requests = self.requests.lock().unwrap();
                    requests.push(request.clone());
                    requests
                        .iter()
                        .filter(|r| r.step_id == request.step_id)
                        .count()
                };
                let start = Instant::now();
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.spans
                    .lock()
                    .unwrap()
                    .push((request.step_id.clone(), start, Instant::now()));

                let flaked = attempt == 1 && self.flaky.contains(&request.step_id);
                if flaked || self.failing.contains(&request.step_id) {
                    Err(DroverError::WorkerFailed {
                        work_item: request.item_id.to_string(),
                        message: format!("{} exploded", request.step_id),
                    })
                } else {
                    Ok(CapabilityOutput::text(format!("{} done", request.step_id)))
                }
            })
        }

        fn abandon(&self, item: &WorkItemId) -> BoxFuture<'_, Result<()>> {
            let item = item.clone();
            Box::pin(async move {
                self.abandoned.lock().unwrap().push(item);
                Ok(())
            })
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        dispatch: Arc<ScriptedDispatch>,
        executor: WorkflowExecutor,
        job_id: JobId,
    }

    async fn fixture(dispatch: ScriptedDispatch, config: ExecutorConfig) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::default());
        let dispatch = Arc::new(dispatch);
        let aggregator = Arc::new(CompletionAggregator::new(store.clone(), bus.clone()));
        let executor = WorkflowExecutor::new(
            store.clone(),
            dispatch.clone(),
            aggregator,
            bus,
            config,
        );
        let job = Job::new("tester", "workflow");
        store.create_job(&job).await.unwrap();
        Fixture {
            store,
            dispatch,
            executor,
            job_id: job.id,
        }
    }

    /// Runs a completion check after every step write, the way a worker
    /// settling an item in another process can land at any moment.
    struct SettlingStore {
        inner: Arc<SqliteStore>,
        aggregator: Arc<CompletionAggregator>,
    }

    impl RecordStore for SettlingStore {
        fn create_job(&self, job: &Job) -> BoxFuture<'_, Result<()>> {
            self.inner.create_job(job)
        }

        fn get_job(&self, id: &JobId) -> BoxFuture<'_, Result<Option<Job>>> {
            self.inner.get_job(id)
        }

        fn list_jobs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>> {
            self.inner.list_jobs(limit)
        }

        fn set_job_status(
            &self,
            id: &JobId,
            status: JobStatus,
            output: Option<String>,
            error: Option<String>,
        ) -> BoxFuture<'_, Result<bool>> {
            self.inner.set_job_status(id, status, output, error)
        }

        fn save_step(&self, step: &Step) -> BoxFuture<'_, Result<()>> {
            let step = step.clone();
            Box::pin(async move {
                self.inner.save_step(&step).await?;
                self.aggregator.check(&step.job_id).await?;
                Ok(())
            })
        }

        fn get_step(&self, job_id: &JobId, step_id: &str) -> BoxFuture<'_, Result<Option<Step>>> {
            self.inner.get_step(job_id, step_id)
        }

        fn list_steps(&self, job_id: &JobId) -> BoxFuture<'_, Result<Vec<Step>>> {
            self.inner.list_steps(job_id)
        }

        fn create_work_item(&self, item: &WorkItem) -> BoxFuture<'_, Result<()>> {
            self.inner.create_work_item(item)
        }

        fn get_work_item(&self, id: &WorkItemId) -> BoxFuture<'_, Result<Option<WorkItem>>> {
            self.inner.get_work_item(id)
        }

        fn list_work_items(&self, job_id: &JobId) -> BoxFuture<'_, Result<Vec<WorkItem>>> {
            self.inner.list_work_items(job_id)
        }

        fn update_work_item(&self, item: &WorkItem) -> BoxFuture<'_, Result<bool>> {
            self.inner.update_work_item(item)
        }

        fn claim_work_item(&self, id: &WorkItemId) -> BoxFuture<'_, Result<bool>> {
            self.inner.claim_work_item(id)
        }

        fn latest_completed_sibling(
            &self,
            job_id: &JobId,
            exclude: &WorkItemId,
        ) -> BoxFuture<'_, Result<Option<WorkItem>>> {
            self.inner.latest_completed_sibling(job_id, exclude)
        }

        fn cancel_job(&self, id: &JobId) -> BoxFuture<'_, Result<Vec<WorkItemId>>> {
            self.inner.cancel_job(id)
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: 5,
            step_timeout_secs: 10,
        }
    }

    async fn step(f: &Fixture, id: &str) -> Step {
        f.store.get_step(&f.job_id, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_partial_phase_keeps_successful_output() {
        let f = fixture(ScriptedDispatch::failing(&["b"]), config()).await;
        let workflow = Workflow::new("w")
            .with_phase(
                Phase::parallel("build")
                    .with_step(StepSpec::new("a", "echo"))
                    .with_step(StepSpec::new("b", "echo")),
            )
            .with_phase(
                Phase::parallel("ship").with_step(StepSpec::new("c", "join").with_deps(["a"])),
            );

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();

        let build = report.phase("build").unwrap();
        assert_eq!(build.status, PhaseStatus::Partial);
        assert_eq!(build.attempts, 2);
        assert_eq!(build.unfinished, vec!["b"]);
        // Retry re-runs only the unfinished step
        assert_eq!(f.dispatch.calls("a"), 1);
        assert_eq!(f.dispatch.calls("b"), 2);

        let b = step(&f, "b").await;
        assert_eq!(b.status, StepStatus::Failed);
        assert!(b.error.unwrap().contains("b exploded"));

        let c = f.dispatch.request("c");
        assert_eq!(c.upstream["a"], CapabilityOutput::text("a done"));
        assert_eq!(step(&f, "c").await.status, StepStatus::Completed);

        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.error.unwrap().contains("b (failed)"));
    }

    #[tokio::test]
    async fn test_critical_phase_aborts_job() {
        let f = fixture(ScriptedDispatch::failing(&["setup"]), config()).await;
        let workflow = Workflow::new("w")
            .with_phase(
                Phase::sequential("critical setup").with_step(StepSpec::new("setup", "echo")),
            )
            .with_phase(Phase::parallel("work").with_step(StepSpec::new("work", "echo")));

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].attempts, 1);
        assert_eq!(f.dispatch.calls("work"), 0);
        let work = step(&f, "work").await;
        assert_eq!(work.status, StepStatus::Skipped);
        assert!(work.error.unwrap().contains("critical setup"));
    }

    #[tokio::test]
    async fn test_optional_phase_failure_is_skipped() {
        let f = fixture(ScriptedDispatch::failing(&["lint"]), config()).await;
        let workflow = Workflow::new("w")
            .with_phase(Phase::parallel("draft").with_step(StepSpec::new("draft", "echo")))
            .with_phase(Phase::parallel("qa").with_step(StepSpec::new("lint", "echo")))
            .with_phase(
                Phase::parallel("publish")
                    .with_step(StepSpec::new("publish", "echo").with_deps(["draft"])),
            );

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();

        assert_eq!(report.phase("qa").unwrap().status, PhaseStatus::Failed);
        assert_eq!(report.phase("qa").unwrap().attempts, 1);
        assert_eq!(f.dispatch.calls("lint"), 1);
        assert_eq!(report.status, JobStatus::Completed);
        let output = report.output.unwrap();
        assert!(output.contains("### publish\npublish done"));
        assert!(output.contains("[failed]"));
    }

    #[tokio::test]
    async fn test_sequential_phase_stops_on_first_failure() {
        let f = fixture(ScriptedDispatch::failing(&["two"]), config()).await;
        let workflow = Workflow::new("w").with_phase(
            Phase::sequential("steps")
                .with_policy(FailurePolicy::Skip)
                .with_step(StepSpec::new("one", "echo"))
                .with_step(StepSpec::new("two", "echo"))
                .with_step(StepSpec::new("three", "echo")),
        );

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();

        assert_eq!(report.phases[0].status, PhaseStatus::Partial);
        assert_eq!(f.dispatch.calls("three"), 0);
        let three = step(&f, "three").await;
        assert_eq!(three.status, StepStatus::Skipped);
        assert!(three.error.unwrap().starts_with("not attempted"));
        let one = f.dispatch.span("one");
        let two = f.dispatch.span("two");
        assert!(one.1 <= two.0);
    }

    #[tokio::test]
    async fn test_unmet_dependency_is_skipped_not_dropped() {
        let f = fixture(ScriptedDispatch::failing(&["fetch"]), config()).await;
        let workflow = Workflow::new("w").with_phase(
            Phase::parallel("pipeline")
                .with_policy(FailurePolicy::Skip)
                .with_step(StepSpec::new("fetch", "echo"))
                .with_step(StepSpec::new("parse", "echo").with_deps(["fetch"]))
                .with_step(
                    StepSpec::new("report", "echo")
                        .with_deps(["fetch"])
                        .tolerating_failed_deps(),
                ),
        );

        f.executor.execute(&f.job_id, &workflow).await.unwrap();

        assert_eq!(f.dispatch.calls("parse"), 0);
        let parse = step(&f, "parse").await;
        assert_eq!(parse.status, StepStatus::Skipped);
        assert!(parse.error.unwrap().contains("fetch"));
        // Tolerant steps still run, just without the failed upstream
        assert_eq!(f.dispatch.calls("report"), 1);
        assert!(f.dispatch.request("report").upstream.is_empty());
    }

    #[tokio::test]
    async fn test_phases_run_strictly_in_order() {
        let f = fixture(
            ScriptedDispatch::default().with_delay(Duration::from_millis(30)),
            config(),
        )
        .await;
        let workflow = Workflow::new("w")
            .with_phase(
                Phase::parallel("a")
                    .with_step(StepSpec::new("a1", "echo"))
                    .with_step(StepSpec::new("a2", "echo")),
            )
            .with_phase(
                Phase::parallel("b")
                    .with_step(StepSpec::new("b1", "echo").with_deps(["a1"]))
                    .with_step(StepSpec::new("b2", "echo")),
            );

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();
        assert!(report.succeeded());

        let a_done = f.dispatch.span("a1").1.max(f.dispatch.span("a2").1);
        for b in ["b1", "b2"] {
            assert!(f.dispatch.span(b).0 >= a_done);
        }
        for id in ["a1", "a2", "b1", "b2"] {
            let s = step(&f, id).await;
            assert!(s.started_at.unwrap() <= s.completed_at.unwrap());
        }
    }

    #[tokio::test]
    async fn test_intra_phase_levels_and_concurrency_bound() {
        let f = fixture(
            ScriptedDispatch::default().with_delay(Duration::from_millis(20)),
            ExecutorConfig {
                max_concurrency: 2,
                step_timeout_secs: 10,
            },
        )
        .await;
        let mut phase = Phase::parallel("fan");
        for i in 0..5 {
            phase = phase.with_step(StepSpec::new(format!("s{}", i), "echo"));
        }
        phase = phase
            .with_step(StepSpec::new("join", "join").with_deps(["s0", "s1", "s2", "s3", "s4"]));
        let workflow = Workflow::new("w").with_phase(phase);

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();
        assert!(report.succeeded());
        assert!(f.dispatch.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(f.dispatch.request("join").upstream.len(), 5);
    }

    #[tokio::test]
    async fn test_step_timeout_abandons_item() {
        let f = fixture(
            ScriptedDispatch::default().with_delay(Duration::from_secs(3)),
            ExecutorConfig {
                max_concurrency: 1,
                step_timeout_secs: 1,
            },
        )
        .await;
        let workflow = Workflow::new("w").with_phase(
            Phase::parallel("slow")
                .with_policy(FailurePolicy::Skip)
                .with_step(StepSpec::new("slow", "echo")),
        );

        f.executor.execute(&f.job_id, &workflow).await.unwrap();

        let slow = step(&f, "slow").await;
        assert_eq!(slow.status, StepStatus::Failed);
        assert!(slow.error.unwrap().contains("timed out"));
        assert_eq!(f.dispatch.abandoned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_job_is_not_rerun() {
        let f = fixture(ScriptedDispatch::default(), config()).await;
        f.store.cancel_job(&f.job_id).await.unwrap();
        let workflow = Workflow::new("w")
            .with_phase(Phase::parallel("p").with_step(StepSpec::new("a", "echo")));

        let report = f.executor.execute(&f.job_id, &workflow).await.unwrap();
        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(f.dispatch.calls("a"), 0);
    }

    #[tokio::test]
    async fn test_successful_retry_completes_job_despite_eager_checks() {
        let inner = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::default());
        let aggregator = Arc::new(CompletionAggregator::new(inner.clone(), bus.clone()));
        let store = Arc::new(SettlingStore {
            inner: inner.clone(),
            aggregator: aggregator.clone(),
        });
        let dispatch = Arc::new(ScriptedDispatch::failing_once(&["b"]));
        let executor =
            WorkflowExecutor::new(store, dispatch.clone(), aggregator, bus, config());
        let job = Job::new("tester", "retry");
        inner.create_job(&job).await.unwrap();

        let workflow = Workflow::new("w").with_phase(
            Phase::parallel("build")
                .with_step(StepSpec::new("a", "echo"))
                .with_step(StepSpec::new("b", "echo")),
        );
        let report = executor.execute(&job.id, &workflow).await.unwrap();

        let build = report.phase("build").unwrap();
        assert_eq!(build.policy, FailurePolicy::Retry);
        assert_eq!(build.attempts, 2);
        assert_eq!(build.status, PhaseStatus::Completed);
        assert_eq!(dispatch.calls("b"), 2);

        assert_eq!(report.status, JobStatus::Completed, "{:?}", report.error);
        let b = inner.get_step(&job.id, "b").await.unwrap().unwrap();
        assert_eq!(b.status, StepStatus::Completed);
        assert!(b.error.is_none());
        let job = inner.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.output.unwrap().contains("### b\nb done"));
    }

    #[tokio::test]
    async fn test_failed_first_attempt_is_stored_as_pending() {
        let inner = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::default());
        let aggregator = Arc::new(CompletionAggregator::new(inner.clone(), bus.clone()));
        let executor = WorkflowExecutor::new(
            inner.clone(),
            Arc::new(ScriptedDispatch::failing(&["b"])),
            aggregator.clone(),
            bus,
            config(),
        );
        let job = Job::new("tester", "held");
        inner.create_job(&job).await.unwrap();
        inner
            .set_job_status(&job.id, JobStatus::Running, None, None)
            .await
            .unwrap();

        let workflow = Workflow::new("w").with_phase(
            Phase::parallel("build")
                .with_step(StepSpec::new("a", "echo"))
                .with_step(StepSpec::new("b", "echo"))
                .with_step(StepSpec::new("c", "echo").with_deps(["b"])),
        );
        let steps = executor.register_steps(&job.id, &workflow).await.unwrap();
        let mut run = JobRun {
            job_id: job.id.clone(),
            records: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
            outputs: StepOutputs::new(),
            hold_failures: true,
        };
        let status = executor
            .run_phase(&mut run, &workflow.phases[0])
            .await
            .unwrap();
        assert_eq!(status, PhaseStatus::Partial);

        // The in-memory view knows the truth; the store keeps the job open
        assert_eq!(run.records["b"].status, StepStatus::Failed);
        assert_eq!(run.records["c"].status, StepStatus::Skipped);
        for id in ["b", "c"] {
            let held = inner.get_step(&job.id, id).await.unwrap().unwrap();
            assert_eq!(held.status, StepStatus::Pending);
            assert!(held.error.is_some());
        }
        assert_eq!(aggregator.check(&job.id).await.unwrap(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_steps_waiting_for_a_permit_are_ready() {
        let f = fixture(
            ScriptedDispatch::default().with_delay(Duration::from_millis(300)),
            ExecutorConfig {
                max_concurrency: 1,
                step_timeout_secs: 10,
            },
        )
        .await;
        let workflow = Workflow::new("w").with_phase(
            Phase::parallel("pair")
                .with_step(StepSpec::new("x", "echo"))
                .with_step(StepSpec::new("y", "echo")),
        );

        let observe = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut statuses = vec![step(&f, "x").await.status, step(&f, "y").await.status];
            statuses.sort_by_key(|s| s.as_str());
            statuses
        };
        let (report, statuses) = tokio::join!(f.executor.execute(&f.job_id, &workflow), observe);

        assert_eq!(statuses, vec![StepStatus::InProgress, StepStatus::Ready]);
        assert!(report.unwrap().succeeded());
        assert_eq!(step(&f, "y").await.status, StepStatus::Completed);
    }
}
