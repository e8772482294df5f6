//! Cross-flow dependency resolution (§4.C point 3): turning a task's
//! `sourceWorkflowId` + `sourceTaskPath` into the latest VALID outcome
//! recorded on the matching sibling flow in the same FlowGroup.
//!
//! A task path is `"{nodeName}/{taskName}"`, unique within one
//! [`WorkflowVersion`] snapshot — the source graph never exposes raw ids
//! across a workflow boundary.

use flowspec_core::error::Result;
use flowspec_core::kernel::{compute_validity_map, SiblingOutcomes};
use flowspec_core::models::*;
use flowspec_core::repository::{FlowRepository, TruthRepository, WorkflowRepository};

pub fn task_path(node: &SnapshotNode, task: &SnapshotTask) -> String {
    format!("{}/{}", node.name, task.name)
}

/// Builds the [`SiblingOutcomes`] map a flow needs to evaluate its
/// cross-flow dependencies, by reading every sibling flow in the same
/// FlowGroup bound to one of `workflow_ids`.
pub async fn resolve_sibling_outcomes<R>(
    repo: &R,
    flow_group_id: FlowGroupId,
    workflow_ids: &[WorkflowId],
) -> Result<SiblingOutcomes>
where
    R: WorkflowRepository + FlowRepository + TruthRepository + ?Sized,
{
    let mut out = SiblingOutcomes::new();
    for &workflow_id in workflow_ids {
        let Some(flow) = repo.find_flow_for_workflow(flow_group_id, workflow_id).await? else {
            continue;
        };
        let version = repo.get_version(workflow_id, flow.workflow_version).await?;
        let executions = repo.executions_for_flow(flow.id).await?;
        let validity_events = repo.validity_events_for_flow(flow.id).await?;
        let validity = compute_validity_map(&validity_events);

        for node in &version.nodes {
            for task in &node.tasks {
                let path = task_path(node, task);
                let latest = executions
                    .iter()
                    .filter(|e| e.task_id == task.id && e.has_outcome())
                    .max_by_key(|e| e.iteration);
                if let Some(execution) = latest {
                    let state = validity
                        .get(&execution.id)
                        .copied()
                        .unwrap_or(ValidityState::Valid);
                    if state == ValidityState::Valid {
                        if let Some(outcome) = &execution.outcome {
                            out.insert((workflow_id, path), outcome.clone());
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// The distinct `sourceWorkflowId`s a task graph's cross-flow dependencies
/// reference, deduplicated so the caller reads each sibling once.
pub fn referenced_workflow_ids(version: &WorkflowVersion) -> Vec<WorkflowId> {
    let mut ids: Vec<WorkflowId> = version
        .nodes
        .iter()
        .flat_map(|n| n.tasks.iter())
        .flat_map(|t| t.cross_flow_dependencies.iter())
        .map(|d| d.source_workflow_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
