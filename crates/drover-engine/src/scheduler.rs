//! Dependency graph scheduling.
//!
//! One Kahn-style leveling pass shared by workflow phases, the flat planner
//! and batch plans. Each level is a set of ids whose dependencies were all
//! emitted in earlier levels.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use drover_core::error::{DroverError, Result};

/// Upper bound on the reported parallel speedup.
pub const MAX_EFFICIENCY: f64 = 5.0;

/// A node handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    pub dependencies: Vec<String>,
}

impl GraphNode {
    pub fn new<I, S>(id: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

/// Execution order produced by [`DependencyScheduler::order`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub levels: Vec<Vec<String>>,
    /// Ids emitted early to break a cycle, in the order they were forced.
    pub cycle_breaks: Vec<String>,
}

impl Schedule {
    /// Levels with more than one member.
    pub fn parallel_groups(&self) -> Vec<&[String]> {
        self.levels
            .iter()
            .filter(|l| l.len() > 1)
            .map(Vec::as_slice)
            .collect()
    }

    /// Sum over levels of the longest member: wall-clock time with unlimited workers.
    pub fn critical_path_minutes(&self, minutes: impl Fn(&str) -> u32) -> u32 {
        self.levels
            .iter()
            .map(|level| level.iter().map(|id| minutes(id)).max().unwrap_or(0))
            .sum()
    }

    /// Sum of every member's duration: wall-clock time with one worker.
    pub fn sequential_minutes(&self, minutes: impl Fn(&str) -> u32) -> u32 {
        self.levels.iter().flatten().map(|id| minutes(id)).sum()
    }

    /// Whether a cycle had to be broken to produce this order.
    pub fn is_degraded(&self) -> bool {
        !self.cycle_breaks.is_empty()
    }

    /// Level index of each id.
    pub fn level_of(&self) -> HashMap<&str, usize> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(i, level)| level.iter().map(move |id| (id.as_str(), i)))
            .collect()
    }
}

/// Sequential over critical-path minutes, capped at [`MAX_EFFICIENCY`].
pub fn parallel_efficiency(critical_path_minutes: u32, sequential_minutes: u32) -> f64 {
    if critical_path_minutes == 0 {
        return if sequential_minutes == 0 { 1.0 } else { MAX_EFFICIENCY };
    }
    (sequential_minutes as f64 / critical_path_minutes as f64).min(MAX_EFFICIENCY)
}

pub struct DependencyScheduler;

impl DependencyScheduler {
    /// Order nodes into levels.
    ///
    /// Dependencies naming ids outside `nodes` are treated as already
    /// satisfied (they belong to an earlier phase). Within a level, ids keep
    /// their input order. A cycle never stalls the scheduler: when nothing is
    /// ready the lowest remaining id is emitted on its own and a warning is
    /// logged.
    pub fn order(nodes: &[GraphNode]) -> Schedule {
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let deps: HashSet<&str> = node.dependencies.iter().map(String::as_str).collect();
            for dep in deps {
                if let Some(&d) = index.get(dep) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut emitted = vec![false; nodes.len()];
        let mut remaining = nodes.len();
        let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut schedule = Schedule::default();

        while remaining > 0 {
            if ready.is_empty() {
                let stuck: Vec<&str> = (0..nodes.len())
                    .filter(|&i| !emitted[i])
                    .map(|i| nodes[i].id.as_str())
                    .collect();
                let forced = (0..nodes.len())
                    .filter(|&i| !emitted[i])
                    .min_by(|&a, &b| nodes[a].id.cmp(&nodes[b].id));
                let Some(forced) = forced else { break };
                warn!(
                    forced = %nodes[forced].id,
                    remaining = ?stuck,
                    "Dependency cycle detected, forcing progress"
                );
                schedule.cycle_breaks.push(nodes[forced].id.clone());
                ready.push(forced);
            }

            ready.sort_unstable();
            ready.dedup();
            let mut next = Vec::new();
            for &i in &ready {
                emitted[i] = true;
            }
            remaining -= ready.len();
            for &i in &ready {
                for &d in &dependents[i] {
                    if emitted[d] {
                        continue;
                    }
                    in_degree[d] = in_degree[d].saturating_sub(1);
                    if in_degree[d] == 0 {
                        next.push(d);
                    }
                }
            }
            schedule
                .levels
                .push(ready.iter().map(|&i| nodes[i].id.clone()).collect());
            ready = next;
        }

        schedule
    }

    /// Strict check: error with the ids that sit on or behind a cycle.
    pub fn check_acyclic(nodes: &[GraphNode]) -> Result<()> {
        let schedule = Self::order(nodes);
        if !schedule.is_degraded() {
            return Ok(());
        }
        // Everything from the first forced level onward is tainted by the cycle.
        let first = schedule
            .levels
            .iter()
            .position(|l| l.iter().any(|id| schedule.cycle_breaks.contains(id)))
            .unwrap_or(0);
        let mut members: Vec<String> = schedule.levels[first..].iter().flatten().cloned().collect();
        members.sort();
        Err(DroverError::CycleDetected(members))
    }
}
