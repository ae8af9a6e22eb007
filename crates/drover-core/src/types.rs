use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DroverError;
use crate::output::CapabilityOutput;

/// Input payload handed to a capability.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Reserved input key under which dependency outputs are attached.
pub const UPSTREAM_KEY: &str = "upstream";

/// Marker set on an input whose upstream content was backfilled by a worker.
pub const BACKFILL_MARKER: &str = "upstream_backfilled";

/// Unique job identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique work item identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn unknown_status(kind: &str, value: &str) -> DroverError {
    DroverError::Database(format!("unknown {} status '{}'", kind, value))
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(unknown_status("job", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl FromStr for StepStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(unknown_status("step", other)),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    PermanentlyFailed,
    Cancelled,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Processing)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::PermanentlyFailed)
    }
}

impl FromStr for WorkItemStatus {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(unknown_status("work item", other)),
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-initiated unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub description: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Final combined output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(owner: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            owner: owner.into(),
            description: description.into(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            output: None,
            error: None,
        }
    }
}

/// One unit of capability work within a job, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub job_id: JobId,
    /// Stable id, unique within the job.
    pub id: String,
    pub phase_index: usize,
    pub phase_name: String,
    /// Declared position inside the phase.
    pub position: usize,
    pub capability: String,
    pub input: Payload,
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CapabilityOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Belongs to a phase whose failures do not fail the job.
    #[serde(default)]
    pub optional: bool,
    /// May start even when a dependency failed or was skipped.
    #[serde(default)]
    pub tolerate_failed_deps: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(job_id: JobId, id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            job_id,
            id: id.into(),
            phase_index: 0,
            phase_name: String::new(),
            position: 0,
            capability: capability.into(),
            input: Payload::new(),
            dependencies: vec![],
            status: StepStatus::Pending,
            output: None,
            error: None,
            optional: false,
            tolerate_failed_deps: false,
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to a terminal state, stamping the completion time.
    pub fn finish(
        &mut self,
        status: StepStatus,
        output: Option<CapabilityOutput>,
        error: Option<String>,
    ) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

/// The durable, queue-visible record of one attempt of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub job_id: JobId,
    pub step_id: String,
    pub capability: String,
    pub input: Payload,
    pub status: WorkItemStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CapabilityOutput>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(
        job_id: JobId,
        step_id: impl Into<String>,
        capability: impl Into<String>,
        input: Payload,
    ) -> Self {
        Self {
            id: WorkItemId::new(),
            job_id,
            step_id: step_id.into(),
            capability: capability.into(),
            input,
            status: WorkItemStatus::Queued,
            retry_count: 0,
            error: None,
            result: None,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the input already carries upstream content.
    pub fn has_upstream(&self) -> bool {
        match self.input.get(UPSTREAM_KEY) {
            Some(serde_json::Value::Object(map)) => !map.is_empty(),
            Some(serde_json::Value::Null) | None => false,
            Some(_) => true,
        }
    }
}

/// Terminal storage entry for work that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item_id: WorkItemId,
    pub error: String,
    pub retries: u32,
    pub failed_at: DateTime<Utc>,
}

/// Lifecycle notification published to the event sink.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    JobStarted { job_id: JobId },
    JobCompleted { job_id: JobId },
    JobFailed { job_id: JobId, error: String },
    JobCancelled { job_id: JobId },
    PhaseStarted { job_id: JobId, phase: String, index: usize },
    PhaseCompleted { job_id: JobId, phase: String, status: String },
    StepStarted { job_id: JobId, step_id: String },
    StepCompleted { job_id: JobId, step_id: String },
    StepFailed { job_id: JobId, step_id: String, error: String },
    StepSkipped { job_id: JobId, step_id: String, reason: String },
    WorkItemEnqueued { job_id: JobId, item_id: WorkItemId },
    WorkItemDeadLettered { item_id: WorkItemId, error: String },
    Progress { job_id: JobId, percent: u8 },
}

impl OrchestrationEvent {
    /// The job this event belongs to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::JobStarted { job_id }
            | Self::JobCompleted { job_id }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id }
            | Self::PhaseStarted { job_id, .. }
            | Self::PhaseCompleted { job_id, .. }
            | Self::StepStarted { job_id, .. }
            | Self::StepCompleted { job_id, .. }
            | Self::StepFailed { job_id, .. }
            | Self::StepSkipped { job_id, .. }
            | Self::WorkItemEnqueued { job_id, .. }
            | Self::Progress { job_id, .. } => Some(job_id),
            Self::WorkItemDeadLettered { .. } => None,
        }
    }
}
