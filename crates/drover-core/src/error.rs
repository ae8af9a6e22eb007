use thiserror::Error;

#[derive(Debug, Error)]
pub enum DroverError {
    // Capability errors
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Capability failed: {capability}: {message}")]
    Capability { capability: String, message: String },

    #[error("Capability timeout after {timeout_secs}s: {capability}")]
    CapabilityTimeout { capability: String, timeout_secs: u64 },

    // Scheduling errors
    #[error("Dependencies unmet for step {step}: {missing:?}")]
    DependencyUnmet { step: String, missing: Vec<String> },

    #[error("Cycle detected in dependency graph involving: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    // Dispatch errors
    #[error("Work item {work_item} timed out after {waited_secs}s (observed processing: {observed_processing})")]
    DispatchTimeout {
        work_item: String,
        waited_secs: u64,
        observed_processing: bool,
    },

    #[error("Worker failed on {work_item}: {message}")]
    WorkerFailed { work_item: String, message: String },

    // Workflow errors
    #[error("Job aborted: critical phase '{phase}' failed")]
    JobAborted { phase: String },

    #[error("Job cancelled")]
    Cancelled,

    // Storage errors
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DroverError {
    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QueueUnavailable(_) | Self::WorkerFailed { .. } => true,
            Self::Database(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("locked") || msg.contains("busy") || msg.contains("poisoned")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DroverError>;
