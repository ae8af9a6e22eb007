use std::collections::{BTreeMap, HashMap};

use drover_core::output::CapabilityOutput;
use drover_core::types::StepStatus;

/// Per-job table of step results, keyed by step id.
///
/// Outputs recorded here become visible to every later step that lists the
/// producing step in its dependencies.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    outputs: HashMap<String, CapabilityOutput>,
    statuses: HashMap<String, StepStatus>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed step's output.
    pub fn insert(&mut self, step_id: impl Into<String>, output: CapabilityOutput) {
        let step_id = step_id.into();
        self.statuses.insert(step_id.clone(), StepStatus::Completed);
        self.outputs.insert(step_id, output);
    }

    /// Record a non-completed terminal status.
    pub fn mark(&mut self, step_id: impl Into<String>, status: StepStatus) {
        let step_id = step_id.into();
        if status != StepStatus::Completed {
            self.outputs.remove(&step_id);
        }
        self.statuses.insert(step_id, status);
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.statuses.get(step_id).copied()
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.status_of(step_id) == Some(StepStatus::Completed)
    }

    /// Dependencies that do not allow the step to start yet.
    ///
    /// A dependency is satisfied once completed. With `tolerate_failed` a
    /// failed or skipped dependency is accepted too. An unknown dependency is
    /// always unmet.
    pub fn unmet<'a>(&self, dependencies: &'a [String], tolerate_failed: bool) -> Vec<&'a str> {
        dependencies
            .iter()
            .filter(|dep| match self.status_of(dep) {
                Some(StepStatus::Completed) => false,
                Some(StepStatus::Failed | StepStatus::Skipped) => !tolerate_failed,
                _ => true,
            })
            .map(String::as_str)
            .collect()
    }

    /// Outputs of the given dependencies that exist, keyed by step id.
    pub fn upstream_for(&self, dependencies: &[String]) -> BTreeMap<String, CapabilityOutput> {
        dependencies
            .iter()
            .filter_map(|dep| self.outputs.get(dep).map(|o| (dep.clone(), o.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unmet_dependencies() {
        let mut outputs = StepOutputs::new();
        outputs.insert("a", CapabilityOutput::text("alpha"));
        outputs.mark("b", StepStatus::Failed);

        assert!(outputs.unmet(&deps(&["a"]), false).is_empty());
        assert_eq!(outputs.unmet(&deps(&["a", "b"]), false), vec!["b"]);
        assert!(outputs.unmet(&deps(&["a", "b"]), true).is_empty());
        // Unknown ids stay unmet even when tolerating failures
        assert_eq!(outputs.unmet(&deps(&["ghost"]), true), vec!["ghost"]);
    }

    #[test]
    fn test_upstream_only_includes_outputs() {
        let mut outputs = StepOutputs::new();
        outputs.insert("a", CapabilityOutput::text("alpha"));
        outputs.mark("b", StepStatus::Skipped);

        let upstream = outputs.upstream_for(&deps(&["a", "b", "c"]));
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream["a"], CapabilityOutput::text("alpha"));
    }

    #[test]
    fn test_mark_clears_stale_output() {
        let mut outputs = StepOutputs::new();
        outputs.insert("a", CapabilityOutput::text("first"));
        outputs.mark("a", StepStatus::Failed);
        assert!(!outputs.is_completed("a"));
        assert!(outputs.upstream_for(&deps(&["a"])).is_empty());
    }
}
