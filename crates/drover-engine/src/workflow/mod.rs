//! Workflow execution: phases of steps run against the dependency scheduler.
//!
//! A workflow is an ordered list of `Phase`s. Phases run strictly in order;
//! steps inside a phase run in parallel (in scheduler levels, bounded by the
//! executor's concurrency) or one at a time. Every step goes through the
//! dispatch protocol, and each completed output is recorded in `StepOutputs`
//! so later steps can receive it under their `upstream` input key.

pub mod executor;
pub mod outputs;
pub mod phase;

pub use executor::{PhaseReport, PhaseStatus, WorkflowExecutor, WorkflowReport};
pub use outputs::StepOutputs;
pub use phase::{FailurePolicy, Phase, PhaseMode, StepSpec, Workflow};
