//! Diagnosis (spec §4.M): when a flow is ACTIVE but stalled — no actionable
//! tasks and not complete — classify the reason deterministically from
//! Truth. Read-only, no I/O.

use crate::kernel::{compute_validity_map, FlowTruth, SiblingOutcomes};
use crate::models::{
    DetourRecord, DetourStatus, DetourType, FlowId, NodeId, TaskId, WorkflowId, WorkflowVersion,
};

/// Why a flow has stalled, most-specific cause first when several could
/// apply — cross-flow waits are reported before detours, detours before join
/// barriers, mirroring the gating order in `computeTaskActionable` (§4.C).
#[derive(Debug, Clone, PartialEq)]
pub enum StallReason {
    /// A task is blocked on an unresolved dependency in a sibling flow.
    CrossFlowDependency {
        task_id: TaskId,
        source_workflow_id: WorkflowId,
        required_outcome: String,
    },
    /// An ACTIVE BLOCKING detour is suppressing the node containing the task.
    BlockingDetour { detour: DetourRecord },
    /// The node is waiting on a join barrier: an inbound ancestor is blocked.
    JoinBarrier { node_id: NodeId, blocking_ancestor_id: NodeId },
}

/// `diagnose(flow)`: returns `None` when the flow is complete or otherwise
/// making progress (has actionable tasks); `Some(reason)` when stalled.
pub fn diagnose(
    snapshot: &WorkflowVersion,
    flow_id: FlowId,
    truth: &FlowTruth,
    sibling_outcomes: &SiblingOutcomes,
) -> Option<StallReason> {
    if crate::kernel::compute_flow_complete(flow_id, snapshot, truth, sibling_outcomes) {
        return None;
    }
    if !crate::kernel::compute_actionable_tasks(flow_id, snapshot, truth, sibling_outcomes)
        .is_empty()
    {
        return None;
    }

    let validity = compute_validity_map(truth.validity_events);

    for node in &snapshot.nodes {
        let Some(k) = crate::kernel::node_current_iteration(truth.activations, node.id) else {
            continue;
        };
        if crate::kernel::compute_node_complete(node, truth.executions, &validity, k) {
            continue;
        }

        for task in &node.tasks {
            for dep in &task.cross_flow_dependencies {
                let satisfied = sibling_outcomes
                    .get(&(dep.source_workflow_id, dep.source_task_path.clone()))
                    .is_some_and(|o| o == &dep.required_outcome);
                if !satisfied {
                    return Some(StallReason::CrossFlowDependency {
                        task_id: task.id,
                        source_workflow_id: dep.source_workflow_id,
                        required_outcome: dep.required_outcome.clone(),
                    });
                }
            }
        }

        if let Some(detour) = blocking_detour_for(snapshot, truth.detours, node.id) {
            return Some(StallReason::BlockingDetour { detour: detour.clone() });
        }

        let inbound = snapshot.inbound_gates(node.id);
        if inbound.len() > 1 {
            if let Some(ancestor) = inbound.iter().find(|g| {
                is_node_blocked(snapshot, truth.detours, g.source_node_id)
            }) {
                return Some(StallReason::JoinBarrier {
                    node_id: node.id,
                    blocking_ancestor_id: ancestor.source_node_id,
                });
            }
        }
    }

    None
}

fn blocking_detour_for<'a>(
    snapshot: &WorkflowVersion,
    detours: &'a [DetourRecord],
    node_id: NodeId,
) -> Option<&'a DetourRecord> {
    detours.iter().find(|d| {
        d.status == DetourStatus::Active
            && d.detour_type == DetourType::Blocking
            && crate::kernel::blocked_scope(snapshot, d).contains(&node_id)
    })
}

fn is_node_blocked(snapshot: &WorkflowVersion, detours: &[DetourRecord], node_id: NodeId) -> bool {
    detours
        .iter()
        .filter(|d| d.status == DetourStatus::Active && d.detour_type == DetourType::Blocking)
        .any(|d| crate::kernel::blocked_scope(snapshot, d).contains(&node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use chrono::Utc;

    fn task(id: TaskId, deps: Vec<CrossFlowDependency>) -> SnapshotTask {
        SnapshotTask {
            id,
            name: format!("task-{id}"),
            instructions: None,
            display_order: id as i32,
            evidence_required: false,
            evidence_schema: None,
            default_sla_hours: None,
            metadata: None,
            outcomes: vec![Outcome { name: "DONE".into() }],
            cross_flow_dependencies: deps,
        }
    }

    fn node(id: NodeId, tasks: Vec<SnapshotTask>) -> SnapshotNode {
        SnapshotNode {
            id,
            name: format!("node-{id}"),
            is_entry: id == 1,
            node_kind: NodeKind::Mainline,
            completion_rule: CompletionRule::AllTasksDone,
            specific_tasks: vec![],
            transitive_successors: vec![],
            tasks,
        }
    }

    #[test]
    fn reports_unresolved_cross_flow_dependency() {
        let dep = CrossFlowDependency {
            source_workflow_id: 99,
            source_task_path: "approval".into(),
            required_outcome: "APPROVED".into(),
        };
        let snapshot = WorkflowVersion {
            workflow_id: 1,
            version: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![node(1, vec![task(10, vec![dep])])],
            gates: vec![],
        };
        let activations = vec![NodeActivation {
            flow_id: 1,
            node_id: 1,
            iteration: 1,
            activated_at: Utc::now(),
        }];
        let truth = FlowTruth {
            activations: &activations,
            executions: &[],
            validity_events: &[],
            detours: &[],
        };
        let siblings = SiblingOutcomes::new();
        let reason = diagnose(&snapshot, 1, &truth, &siblings);
        assert_eq!(
            reason,
            Some(StallReason::CrossFlowDependency {
                task_id: 10,
                source_workflow_id: 99,
                required_outcome: "APPROVED".into(),
            })
        );
    }

    #[test]
    fn reports_blocking_detour() {
        let snapshot = WorkflowVersion {
            workflow_id: 1,
            version: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![node(1, vec![task(10, vec![])])],
            gates: vec![],
        };
        let activations = vec![NodeActivation {
            flow_id: 1,
            node_id: 1,
            iteration: 1,
            activated_at: Utc::now(),
        }];
        let detours = vec![DetourRecord {
            id: 1,
            flow_id: 1,
            checkpoint_node_id: 1,
            resume_target_node_id: 1,
            checkpoint_task_execution_id: 1,
            detour_type: DetourType::Blocking,
            status: DetourStatus::Active,
            change_request_id: None,
        }];
        let truth = FlowTruth {
            activations: &activations,
            executions: &[],
            validity_events: &[],
            detours: &detours,
        };
        let siblings = SiblingOutcomes::new();
        match diagnose(&snapshot, 1, &truth, &siblings) {
            Some(StallReason::BlockingDetour { detour }) => assert_eq!(detour.id, 1),
            other => panic!("expected BlockingDetour, got {other:?}"),
        }
    }
}
