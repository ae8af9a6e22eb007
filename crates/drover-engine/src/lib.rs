pub mod aggregator;
pub mod backoff;
pub mod combine;
pub mod dispatch;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod run_log;
pub mod scheduler;
pub mod worker;
pub mod workflow;

pub use aggregator::CompletionAggregator;
pub use dispatch::{DispatchRequest, Dispatcher, StepDispatch};
pub use orchestrator::{JobSnapshot, Orchestrator};
pub use planner::{BatchPlan, Planner};
pub use registry::CapabilityRegistry;
pub use run_log::RunLogger;
pub use scheduler::{DependencyScheduler, GraphNode, Schedule};
pub use worker::{WorkerLoop, WorkerPool};
pub use workflow::{
    FailurePolicy, Phase, PhaseMode, PhaseReport, PhaseStatus, StepOutputs, StepSpec, Workflow,
    WorkflowExecutor, WorkflowReport,
};
