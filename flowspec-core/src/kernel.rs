//! The derived-state kernel (spec §4.C): pure functions over a flow's Truth
//! (activations, executions, evidence, validity events, detours) plus its
//! bound [`WorkflowVersion`] snapshot. No I/O — drivers (the engine) fetch
//! Truth and pass it in. This lets the kernel be property-tested in
//! isolation and keeps transaction durations in the engine bounded.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{
    DetourRecord, DetourStatus, DetourType, NodeActivation, NodeId, SnapshotNode, SnapshotTask,
    TaskExecution, TaskExecutionId, TaskId, ValidityEvent, ValidityState, WorkflowVersion,
};

/// A task's Truth, scoped to one flow. Borrowed, not owned: the engine reads
/// these rows from storage once per mutation and passes slices through.
#[derive(Debug, Clone, Copy)]
pub struct FlowTruth<'a> {
    pub activations: &'a [NodeActivation],
    pub executions: &'a [TaskExecution],
    pub validity_events: &'a [ValidityEvent],
    pub detours: &'a [DetourRecord],
}

/// Latest outcome recorded for a `(source_workflow_id, source_task_path)`
/// pair among a flow group's sibling flows, precomputed by the engine before
/// calling into the kernel (§4.C point 3).
pub type SiblingOutcomes = HashMap<(crate::models::WorkflowId, String), String>;

/// `computeValidityMap`: latest-wins by `(created_at DESC, id DESC)`.
/// Absence of a row for a `task_execution_id` key implies VALID at lookup
/// time — this map only holds overridden (non-default) states.
pub fn compute_validity_map(
    events: &[ValidityEvent],
) -> HashMap<TaskExecutionId, ValidityState> {
    let mut latest: HashMap<TaskExecutionId, &ValidityEvent> = HashMap::new();
    for event in events {
        match latest.get(&event.task_execution_id) {
            Some(current)
                if (current.created_at, current.id) >= (event.created_at, event.id) => {}
            _ => {
                latest.insert(event.task_execution_id, event);
            }
        }
    }
    latest
        .into_iter()
        .map(|(id, event)| (id, event.state))
        .collect()
}

fn effective_validity(
    execution: &TaskExecution,
    validity: &HashMap<TaskExecutionId, ValidityState>,
) -> ValidityState {
    validity
        .get(&execution.id)
        .copied()
        .unwrap_or(ValidityState::Valid)
}

/// A recorded outcome counts as "done" only while its validity resolves to
/// VALID; PROVISIONAL/INVALID are treated as not done (§4.C).
fn is_task_done(
    executions: &[TaskExecution],
    validity: &HashMap<TaskExecutionId, ValidityState>,
    task_id: TaskId,
    iteration: i32,
) -> bool {
    executions
        .iter()
        .find(|e| e.task_id == task_id && e.iteration == iteration)
        .is_some_and(|e| e.has_outcome() && effective_validity(e, validity) == ValidityState::Valid)
}

/// `computeNodeComplete`: whether `node`'s completion rule is satisfied at
/// `iteration`, over the executions recorded for that node and iteration.
pub fn compute_node_complete(
    node: &SnapshotNode,
    executions: &[TaskExecution],
    validity: &HashMap<TaskExecutionId, ValidityState>,
    iteration: i32,
) -> bool {
    use crate::models::CompletionRule::*;
    match node.completion_rule {
        AllTasksDone => node
            .tasks
            .iter()
            .all(|t| is_task_done(executions, validity, t.id, iteration)),
        AnyTaskDone => node
            .tasks
            .iter()
            .any(|t| is_task_done(executions, validity, t.id, iteration)),
        SpecificTasksDone => node
            .specific_tasks
            .iter()
            .all(|&tid| is_task_done(executions, validity, tid, iteration)),
    }
}

fn current_iteration(activations: &[NodeActivation], node_id: NodeId) -> Option<i32> {
    activations
        .iter()
        .filter(|a| a.node_id == node_id)
        .map(|a| a.iteration)
        .max()
}

/// The blocked scope of an ACTIVE BLOCKING detour: the checkpoint node and
/// everything reachable from it that is not also reachable from the resume
/// target (§4.C point 4): `{checkpoint} ∪ succ(checkpoint) \ succ(resume)`.
pub(crate) fn blocked_scope(snapshot: &WorkflowVersion, detour: &DetourRecord) -> HashSet<NodeId> {
    let mut scope: HashSet<NodeId> = HashSet::new();
    scope.insert(detour.checkpoint_node_id);
    if let Some(checkpoint) = snapshot.node(detour.checkpoint_node_id) {
        scope.extend(checkpoint.transitive_successors.iter().copied());
    }
    if let Some(resume) = snapshot.node(detour.resume_target_node_id) {
        for succ in &resume.transitive_successors {
            scope.remove(succ);
        }
    }
    scope
}

fn active_blocking_detours<'a>(detours: &'a [DetourRecord]) -> impl Iterator<Item = &'a DetourRecord> {
    detours
        .iter()
        .filter(|d| d.status == DetourStatus::Active && d.detour_type == DetourType::Blocking)
}

fn is_node_blocked(snapshot: &WorkflowVersion, detours: &[DetourRecord], node_id: NodeId) -> bool {
    active_blocking_detours(detours).any(|d| blocked_scope(snapshot, d).contains(&node_id))
}

/// `computeTaskActionable`: the five gating conditions of §4.C, evaluated in
/// order. Returns `false` as soon as any gate fails.
pub fn compute_task_actionable(
    snapshot: &WorkflowVersion,
    node: &SnapshotNode,
    task: &SnapshotTask,
    truth: &FlowTruth,
    validity: &HashMap<TaskExecutionId, ValidityState>,
    sibling_outcomes: &SiblingOutcomes,
) -> bool {
    // 1. node must be activated at some iteration k.
    let Some(k) = current_iteration(truth.activations, node.id) else {
        return false;
    };

    // 2. no VALID outcome exists for (task, k); an INVALID outcome reopens it.
    if is_task_done(truth.executions, validity, task.id, k) {
        return false;
    }

    // 3. cross-flow dependencies must all be satisfied.
    let deps_satisfied = task.cross_flow_dependencies.iter().all(|dep| {
        sibling_outcomes
            .get(&(dep.source_workflow_id, dep.source_task_path.clone()))
            .is_some_and(|outcome| outcome == &dep.required_outcome)
    });
    if !deps_satisfied {
        return false;
    }

    // 4. no ACTIVE BLOCKING detour covers this node.
    if is_node_blocked(snapshot, truth.detours, node.id) {
        return false;
    }

    // 5. join barrier: every ancestor feeding an inbound edge must itself be
    // unblocked when the node has more than one inbound gate.
    let inbound = snapshot.inbound_gates(node.id);
    if inbound.len() > 1 {
        let all_ancestors_unblocked = inbound
            .iter()
            .all(|g| !is_node_blocked(snapshot, truth.detours, g.source_node_id));
        if !all_ancestors_unblocked {
            return false;
        }
    }

    true
}

/// One task currently permitted to be worked on (§3 Glossary).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActionableTask {
    pub flow_id: crate::models::FlowId,
    pub task_id: TaskId,
    pub iteration: i32,
    pub node_id: NodeId,
}

/// Canonical ordering: `flowId ASC, taskId ASC, iteration ASC` (§4.C, §8).
/// Enrichment (assignments, signals, recommendations) is strictly additive
/// and MUST NOT reorder this vector.
pub fn compute_actionable_tasks(
    flow_id: crate::models::FlowId,
    snapshot: &WorkflowVersion,
    truth: &FlowTruth,
    sibling_outcomes: &SiblingOutcomes,
) -> Vec<ActionableTask> {
    let validity = compute_validity_map(truth.validity_events);
    let mut out = Vec::new();
    for node in &snapshot.nodes {
        for task in &node.tasks {
            if compute_task_actionable(snapshot, node, task, truth, &validity, sibling_outcomes) {
                let iteration = current_iteration(truth.activations, node.id).unwrap_or(1);
                out.push(ActionableTask {
                    flow_id,
                    task_id: task.id,
                    iteration,
                    node_id: node.id,
                });
            }
        }
    }
    out.sort();
    out
}

/// `computeFlowComplete`: true iff every activated node is complete, no
/// detour is ACTIVE, and the workflow is not marked non-terminating (§4.C).
pub fn compute_flow_complete(
    flow_id: crate::models::FlowId,
    snapshot: &WorkflowVersion,
    truth: &FlowTruth,
    sibling_outcomes: &SiblingOutcomes,
) -> bool {
    if snapshot.is_non_terminating {
        return false;
    }
    if truth.detours.iter().any(|d| d.status == DetourStatus::Active) {
        return false;
    }
    if !compute_actionable_tasks(flow_id, snapshot, truth, sibling_outcomes).is_empty() {
        return false;
    }

    let validity = compute_validity_map(truth.validity_events);
    snapshot.nodes.iter().all(|node| {
        match current_iteration(truth.activations, node.id) {
            None => true, // never activated: not on this flow's path
            Some(k) => compute_node_complete(node, truth.executions, &validity, k),
        }
    })
}

/// The iteration a task's node is currently at, i.e. the "current iteration"
/// semantics of §4.F: `max(NodeActivation.iteration)` for its node.
pub fn node_current_iteration(activations: &[NodeActivation], node_id: NodeId) -> Option<i32> {
    current_iteration(activations, node_id)
}

/// Evaluates whether `asOf` falls within a due-soon window, exposed here so
/// the policy module (§4.I) shares one clock-comparison helper with the
/// kernel's detour/validity logic.
pub fn is_within(as_of: DateTime<Utc>, due_at: DateTime<Utc>, window: chrono::Duration) -> bool {
    let remaining = due_at - as_of;
    remaining > chrono::Duration::zero() && remaining <= window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use chrono::Utc;

    fn task(id: TaskId, outcomes: &[&str]) -> SnapshotTask {
        SnapshotTask {
            id,
            name: format!("task-{id}"),
            instructions: None,
            display_order: id as i32,
            evidence_required: false,
            evidence_schema: None,
            default_sla_hours: None,
            metadata: None,
            outcomes: outcomes.iter().map(|o| Outcome { name: o.to_string() }).collect(),
            cross_flow_dependencies: vec![],
        }
    }

    fn node(id: NodeId, is_entry: bool, tasks: Vec<SnapshotTask>) -> SnapshotNode {
        SnapshotNode {
            id,
            name: format!("node-{id}"),
            is_entry,
            node_kind: NodeKind::Mainline,
            completion_rule: CompletionRule::AllTasksDone,
            specific_tasks: vec![],
            transitive_successors: vec![],
            tasks,
        }
    }

    fn linear_snapshot() -> WorkflowVersion {
        WorkflowVersion {
            workflow_id: 1,
            version: 1,
            name: "linear".into(),
            is_non_terminating: false,
            nodes: vec![
                SnapshotNode {
                    transitive_successors: vec![2],
                    ..node(1, true, vec![task(10, &["DONE"])])
                },
                node(2, false, vec![task(20, &["FINISH"])]),
            ],
            gates: vec![Gate {
                source_node_id: 1,
                outcome_name: "DONE".into(),
                target_node_id: Some(2),
            }],
        }
    }

    #[test]
    fn actionable_respects_activation_and_outcome() {
        let snapshot = linear_snapshot();
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
        let actionable = compute_actionable_tasks(1, &snapshot, &truth, &siblings);
        assert_eq!(actionable.len(), 1);
        assert_eq!(actionable[0].task_id, 10);
    }

    #[test]
    fn invalid_outcome_reopens_task() {
        let snapshot = linear_snapshot();
        let activations = vec![NodeActivation {
            flow_id: 1,
            node_id: 1,
            iteration: 1,
            activated_at: Utc::now(),
        }];
        let executions = vec![TaskExecution {
            id: 100,
            flow_id: 1,
            task_id: 10,
            iteration: 1,
            started_at: Some(Utc::now()),
            started_by: Some("alice".into()),
            outcome: Some("DONE".into()),
            outcome_at: Some(Utc::now()),
            outcome_by: Some("alice".into()),
            detour_id: None,
        }];
        let validity_events = vec![ValidityEvent {
            id: 1,
            task_execution_id: 100,
            state: ValidityState::Invalid,
            created_at: Utc::now(),
        }];
        let truth = FlowTruth {
            activations: &activations,
            executions: &executions,
            validity_events: &validity_events,
            detours: &[],
        };
        let siblings = SiblingOutcomes::new();
        let actionable = compute_actionable_tasks(1, &snapshot, &truth, &siblings);
        assert_eq!(actionable.len(), 1, "invalid outcome must reopen the task");
    }

    #[test]
    fn blocking_detour_suppresses_scope() {
        let snapshot = linear_snapshot();
        let activations = vec![
            NodeActivation { flow_id: 1, node_id: 1, iteration: 1, activated_at: Utc::now() },
        ];
        let executions = vec![TaskExecution {
            id: 1,
            flow_id: 1,
            task_id: 10,
            iteration: 1,
            started_at: Some(Utc::now()),
            started_by: Some("a".into()),
            outcome: Some("DONE".into()),
            outcome_at: Some(Utc::now()),
            outcome_by: Some("a".into()),
            detour_id: None,
        }];
        let detours = vec![DetourRecord {
            id: 1,
            flow_id: 1,
            checkpoint_node_id: 2,
            resume_target_node_id: 2,
            checkpoint_task_execution_id: 1,
            detour_type: DetourType::Blocking,
            status: DetourStatus::Active,
            change_request_id: None,
        }];
        let truth = FlowTruth {
            activations: &activations,
            executions: &executions,
            validity_events: &[],
            detours: &detours,
        };
        let siblings = SiblingOutcomes::new();
        // Node 2 isn't activated yet, so nothing is actionable regardless;
        // but flow completion must observe the active detour and refuse to
        // close even once node 1's task is done.
        assert!(!compute_flow_complete(1, &snapshot, &truth, &siblings));
    }

    #[test]
    fn blocked_scope_drops_checkpoint_inside_resume_successors() {
        // Cycle 1 -> 2 -> 3 -> 1. A detour checkpointed at 3 resuming at 1
        // puts the checkpoint itself inside succ(resume), so the formula
        // `{checkpoint} U succ(checkpoint) \ succ(resume)` removes it.
        let snapshot = WorkflowVersion {
            workflow_id: 1,
            version: 1,
            name: "cycle".into(),
            is_non_terminating: true,
            nodes: vec![
                SnapshotNode {
                    transitive_successors: vec![2, 3, 1],
                    ..node(1, true, vec![])
                },
                SnapshotNode {
                    transitive_successors: vec![3, 1, 2],
                    ..node(2, false, vec![])
                },
                SnapshotNode {
                    transitive_successors: vec![1, 2, 3],
                    ..node(3, false, vec![])
                },
            ],
            gates: vec![],
        };
        let detour = DetourRecord {
            id: 1,
            flow_id: 1,
            checkpoint_node_id: 3,
            resume_target_node_id: 1,
            checkpoint_task_execution_id: 1,
            detour_type: DetourType::Blocking,
            status: DetourStatus::Active,
            change_request_id: None,
        };
        let scope = blocked_scope(&snapshot, &detour);
        assert!(!scope.contains(&3), "checkpoint is in succ(resume) and must be subtracted");
        assert!(!scope.contains(&1));
        assert!(!scope.contains(&2));
    }
}
