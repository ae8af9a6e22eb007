use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use drover_core::error::{DroverError, Result};
use drover_core::types::Payload;

use crate::scheduler::{DependencyScheduler, GraphNode};

/// How steps inside a phase are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseMode {
    #[default]
    Parallel,
    Sequential,
}

/// What happens when a phase does not fully succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the job; no further phases run.
    Abort,
    /// Log and continue with the next phase.
    Skip,
    /// Re-run the unfinished steps once, then continue.
    Retry,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Skip => "skip",
            Self::Retry => "retry",
        })
    }
}

/// A step as declared in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Duration estimate used by batch plans.
    #[serde(default = "default_estimated_minutes")]
    pub estimated_minutes: u32,
    /// Start even if a dependency failed or was skipped.
    #[serde(default)]
    pub tolerate_failed_deps: bool,
    #[serde(default)]
    pub input: Payload,
}

fn default_estimated_minutes() -> u32 {
    1
}

impl StepSpec {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            dependencies: vec![],
            estimated_minutes: default_estimated_minutes(),
            tolerate_failed_deps: false,
            input: Payload::new(),
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    /// Convenience for the common `{"text": ...}` input.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.input
            .insert("text".to_string(), serde_json::Value::String(text.into()));
        self
    }

    pub fn with_minutes(mut self, minutes: u32) -> Self {
        self.estimated_minutes = minutes;
        self
    }

    pub fn tolerating_failed_deps(mut self) -> Self {
        self.tolerate_failed_deps = true;
        self
    }

    pub(crate) fn graph_node(&self) -> GraphNode {
        GraphNode::new(self.id.clone(), self.dependencies.iter().cloned())
    }
}

/// An ordered, named group of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub mode: PhaseMode,
    /// Metadata markers such as `critical`, `qa` or `optional`.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Explicit failure policy; overrides the marker rule.
    #[serde(default)]
    pub policy: Option<FailurePolicy>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl Phase {
    pub fn new(name: impl Into<String>, mode: PhaseMode) -> Self {
        Self {
            name: name.into(),
            mode,
            tags: vec![],
            policy: None,
            steps: vec![],
        }
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, PhaseMode::Parallel)
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, PhaseMode::Sequential)
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Resolve the failure policy.
    ///
    /// An explicit `policy` wins. Otherwise the name (split into words) and
    /// tags are searched for markers: `critical` aborts, `qa` or `optional`
    /// skips, anything else retries once.
    pub fn failure_policy(&self) -> FailurePolicy {
        if let Some(policy) = self.policy {
            return policy;
        }

        let markers: Vec<String> = self
            .name
            .split(|c: char| !c.is_alphanumeric())
            .chain(self.tags.iter().map(String::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .collect();
        let has = |marker: &str| markers.iter().any(|m| m == marker);

        if has("critical") {
            FailurePolicy::Abort
        } else if has("qa") || has("optional") {
            FailurePolicy::Skip
        } else {
            FailurePolicy::Retry
        }
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            phases: vec![],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Parse and validate a TOML workflow definition.
    pub fn from_toml(content: &str) -> Result<Self> {
        let workflow: Self = toml::from_str(content)
            .map_err(|e| DroverError::InvalidWorkflow(e.to_string()))?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Load a workflow definition from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// All steps in phase order.
    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    /// Structural checks. Cycles are not an error: they are reported and the
    /// scheduler breaks them at run time.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(DroverError::InvalidWorkflow(format!(
                "workflow '{}' has no phases",
                self.name
            )));
        }
        if self.step_count() == 0 {
            return Err(DroverError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for step in self.steps() {
            if step.id.is_empty() {
                return Err(DroverError::InvalidWorkflow("step with empty id".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(DroverError::InvalidWorkflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        for step in self.steps() {
            if let Some(unknown) = step.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(DroverError::InvalidWorkflow(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, unknown
                )));
            }
        }

        let nodes: Vec<GraphNode> = self.steps().map(StepSpec::graph_node).collect();
        if let Err(e) = DependencyScheduler::check_acyclic(&nodes) {
            warn!(workflow = %self.name, error = %e, "Workflow has a dependency cycle");
        }
        Ok(())
    }
}
