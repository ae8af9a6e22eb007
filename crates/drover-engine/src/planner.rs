use std::collections::HashMap;
use std::fmt;

use crate::scheduler::{parallel_efficiency, DependencyScheduler, GraphNode, Schedule};
use crate::workflow::{Phase, StepSpec, Workflow};

/// Single-pass planner for flat jobs: a list of steps with dependencies and
/// no declared phases.
pub struct Planner;

impl Planner {
    /// One parallel phase per scheduler level, named `level-1`, `level-2`, ...
    pub fn plan_flat(name: impl Into<String>, steps: Vec<StepSpec>) -> Workflow {
        let nodes: Vec<GraphNode> = steps.iter().map(StepSpec::graph_node).collect();
        let schedule = DependencyScheduler::order(&nodes);
        let mut by_id: HashMap<String, StepSpec> =
            steps.into_iter().map(|s| (s.id.clone(), s)).collect();

        let mut workflow = Workflow::new(name);
        for (i, level) in schedule.levels.iter().enumerate() {
            let mut phase = Phase::parallel(format!("level-{}", i + 1));
            for id in level {
                if let Some(step) = by_id.remove(id) {
                    phase = phase.with_step(step);
                }
            }
            workflow = workflow.with_phase(phase);
        }
        workflow
    }
}

/// Execution plan summary for a batch of steps.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub schedule: Schedule,
    pub critical_path_minutes: u32,
    pub sequential_minutes: u32,
    /// Sequential over critical-path time, capped.
    pub efficiency: f64,
}

impl BatchPlan {
    pub fn from_steps(steps: &[StepSpec]) -> Self {
        let nodes: Vec<GraphNode> = steps.iter().map(StepSpec::graph_node).collect();
        let minutes: HashMap<&str, u32> = steps
            .iter()
            .map(|s| (s.id.as_str(), s.estimated_minutes))
            .collect();
        let duration = |id: &str| minutes.get(id).copied().unwrap_or(0);

        let schedule = DependencyScheduler::order(&nodes);
        let critical_path_minutes = schedule.critical_path_minutes(duration);
        let sequential_minutes = schedule.sequential_minutes(duration);
        Self {
            efficiency: parallel_efficiency(critical_path_minutes, sequential_minutes),
            schedule,
            critical_path_minutes,
            sequential_minutes,
        }
    }

    pub fn from_workflow(workflow: &Workflow) -> Self {
        let steps: Vec<StepSpec> = workflow.steps().cloned().collect();
        Self::from_steps(&steps)
    }

    pub fn parallel_groups(&self) -> Vec<&[String]> {
        self.schedule.parallel_groups()
    }
}

impl fmt::Display for BatchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.schedule.levels.iter().enumerate() {
            writeln!(f, "Level {}: {}", i + 1, level.join(", "))?;
        }
        writeln!(
            f,
            "Parallel groups: {}",
            self.schedule.parallel_groups().len()
        )?;
        writeln!(f, "Critical path: {} min", self.critical_path_minutes)?;
        writeln!(f, "Sequential: {} min", self.sequential_minutes)?;
        write!(f, "Parallel efficiency: {:.1}x", self.efficiency)?;
        if self.schedule.is_degraded() {
            write!(
                f,
                "\nWarning: dependency cycle broken at {}",
                self.schedule.cycle_breaks.join(", ")
            )?;
        }
        Ok(())
    }
}
