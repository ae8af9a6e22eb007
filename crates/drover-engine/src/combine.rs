//! Stitching step outputs into one human-readable artifact.

use drover_core::types::{Step, StepStatus, WorkItem, WorkItemStatus};

/// Combine step outputs in phase order, then declared position.
///
/// Completed steps contribute their rendered output; failed and skipped
/// steps contribute a one-line note so gaps in the artifact are explained.
pub fn combine_steps(steps: &[Step]) -> String {
    let mut ordered: Vec<&Step> = steps.iter().collect();
    ordered.sort_by_key(|s| (s.phase_index, s.position));

    let mut out = String::new();
    let mut current_phase: Option<usize> = None;
    for step in ordered {
        let body = match (step.status, &step.output) {
            (StepStatus::Completed, Some(output)) => output.render(),
            (StepStatus::Completed, None) => String::new(),
            (StepStatus::Failed, _) => format!(
                "[failed] {}",
                step.error.as_deref().unwrap_or("no error message")
            ),
            (StepStatus::Skipped, _) => format!(
                "[skipped] {}",
                step.error.as_deref().unwrap_or("not attempted")
            ),
            _ => continue,
        };

        if current_phase != Some(step.phase_index) {
            if !out.is_empty() {
                out.push('\n');
            }
            let title = if step.phase_name.is_empty() {
                format!("Phase {}", step.phase_index + 1)
            } else {
                step.phase_name.clone()
            };
            out.push_str(&format!("## {}\n\n", title));
            current_phase = Some(step.phase_index);
        }

        out.push_str(&format!("### {}\n", step.id));
        if !body.is_empty() {
            out.push_str(&body);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Combine completed work item results for a job without step records.
pub fn combine_items(items: &[WorkItem]) -> String {
    items
        .iter()
        .filter(|i| i.status == WorkItemStatus::Completed)
        .filter_map(|i| {
            i.result
                .as_ref()
                .map(|r| format!("### {}\n{}", i.step_id, r.render()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
