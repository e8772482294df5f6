//! Snapshot construction (spec §4.B): turning a live Draft graph into the
//! immutable [`WorkflowVersion`] value shape, and back. Pure — callers in
//! `flowspec-engine` do the persistence around this.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{Gate, NodeId, SnapshotNode, WorkflowVersion};

/// The editable in-memory graph of a Draft workflow, as read from storage.
/// Shaped identically to [`WorkflowVersion`] minus `transitive_successors`,
/// which is only ever a snapshot-time derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftGraph {
    pub workflow_id: crate::models::WorkflowId,
    pub name: String,
    pub is_non_terminating: bool,
    pub nodes: Vec<DraftNode>,
    pub gates: Vec<Gate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftNode {
    pub id: NodeId,
    pub name: String,
    pub is_entry: bool,
    pub node_kind: crate::models::NodeKind,
    pub completion_rule: crate::models::CompletionRule,
    pub specific_tasks: Vec<crate::models::TaskId>,
    pub tasks: Vec<crate::models::SnapshotTask>,
}

/// Reachable set from `node_id`, excluding itself, via BFS over `gates`.
/// Stable-sorted for byte reproducibility (§4.B).
fn transitive_successors(node_id: NodeId, gates: &[Gate]) -> Vec<NodeId> {
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for gate in gates {
        if let Some(target) = gate.target_node_id {
            adjacency.entry(gate.source_node_id).or_default().push(target);
        }
    }

    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    if let Some(next) = adjacency.get(&node_id) {
        queue.extend(next.iter().copied());
    }
    while let Some(current) = queue.pop_front() {
        if current == node_id || !seen.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(&current) {
            queue.extend(next.iter().copied());
        }
    }

    let mut result: Vec<NodeId> = seen.into_iter().collect();
    result.sort_unstable();
    result
}

/// `createWorkflowSnapshot`: serializes the live Draft graph into the frozen
/// [`WorkflowVersion`] shape, computing `transitive_successors` for every
/// node. Node/task ordering is canonical by `display_order` then name.
pub fn create_workflow_snapshot(draft: &DraftGraph, version: i32) -> WorkflowVersion {
    let mut nodes: Vec<SnapshotNode> = draft
        .nodes
        .iter()
        .map(|n| {
            let mut tasks = n.tasks.clone();
            tasks.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.name.cmp(&b.name)));
            SnapshotNode {
                id: n.id,
                name: n.name.clone(),
                is_entry: n.is_entry,
                node_kind: n.node_kind,
                completion_rule: n.completion_rule,
                specific_tasks: n.specific_tasks.clone(),
                transitive_successors: transitive_successors(n.id, &draft.gates),
                tasks,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    let mut gates = draft.gates.clone();
    gates.sort_by(|a, b| {
        a.source_node_id
            .cmp(&b.source_node_id)
            .then(a.outcome_name.cmp(&b.outcome_name))
    });

    WorkflowVersion {
        workflow_id: draft.workflow_id,
        version,
        name: draft.name.clone(),
        is_non_terminating: draft.is_non_terminating,
        nodes,
        gates,
    }
}

/// The relational shape `hydrateSnapshotToWorkflow` rebuilds a snapshot into,
/// with id remapping for the branch-from-version path (§4.B, §4.D).
pub struct HydratedGraph {
    pub draft: DraftGraph,
    pub node_id_map: HashMap<NodeId, NodeId>,
    pub task_id_map: HashMap<crate::models::TaskId, crate::models::TaskId>,
}

/// Rebuilds a [`WorkflowVersion`] snapshot into a [`DraftGraph`], idempotently
/// remapping node/task ids via `next_id`. When `next_id` always returns its
/// input (identity), this is an in-place rehydration with no remapping —
/// used by the equivalence property (§8): `hydrate(S)` normalized equals
/// `hydrate(snapshot(hydrate(S)))` normalized.
pub fn hydrate_snapshot_to_workflow(
    snapshot: &WorkflowVersion,
    workflow_id: crate::models::WorkflowId,
    mut next_id: impl FnMut() -> i64,
    remap: bool,
) -> HydratedGraph {
    let mut node_id_map = HashMap::new();
    let mut task_id_map = HashMap::new();

    if remap {
        for node in &snapshot.nodes {
            node_id_map.insert(node.id, next_id());
            for task in &node.tasks {
                task_id_map.insert(task.id, next_id());
            }
        }
    } else {
        for node in &snapshot.nodes {
            node_id_map.insert(node.id, node.id);
            for task in &node.tasks {
                task_id_map.insert(task.id, task.id);
            }
        }
    }

    let remap_node = |id: NodeId| *node_id_map.get(&id).unwrap_or(&id);
    let remap_task = |id: crate::models::TaskId| *task_id_map.get(&id).unwrap_or(&id);

    let nodes = snapshot
        .nodes
        .iter()
        .map(|n| DraftNode {
            id: remap_node(n.id),
            name: n.name.clone(),
            is_entry: n.is_entry,
            node_kind: n.node_kind,
            completion_rule: n.completion_rule,
            specific_tasks: n.specific_tasks.iter().map(|&t| remap_task(t)).collect(),
            tasks: n
                .tasks
                .iter()
                .map(|t| {
                    let mut t = t.clone();
                    t.id = remap_task(t.id);
                    t
                })
                .collect(),
        })
        .collect();

    let gates = snapshot
        .gates
        .iter()
        .map(|g| Gate {
            source_node_id: remap_node(g.source_node_id),
            outcome_name: g.outcome_name.clone(),
            target_node_id: g.target_node_id.map(remap_node),
        })
        .collect();

    HydratedGraph {
        draft: DraftGraph {
            workflow_id,
            name: snapshot.name.clone(),
            is_non_terminating: snapshot.is_non_terminating,
            nodes,
            gates,
        },
        node_id_map,
        task_id_map,
    }
}

/// Normalizes a draft graph for the hydration-equivalence property (§8):
/// nodes sorted by name, tasks within a node sorted by name, ids erased
/// (replaced with their position) so the comparison is structural, not
/// id-dependent.
pub fn normalize(draft: &DraftGraph) -> Vec<(String, Vec<String>)> {
    let mut nodes: Vec<(String, Vec<String>)> = draft
        .nodes
        .iter()
        .map(|n| {
            let mut task_names: Vec<String> = n.tasks.iter().map(|t| t.name.clone()).collect();
            task_names.sort();
            (n.name.clone(), task_names)
        })
        .collect();
    nodes.sort();
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    fn sample_task(id: TaskId, name: &str, order: i32) -> SnapshotTask {
        SnapshotTask {
            id,
            name: name.into(),
            instructions: None,
            display_order: order,
            evidence_required: false,
            evidence_schema: None,
            default_sla_hours: None,
            metadata: None,
            outcomes: vec![Outcome { name: "DONE".into() }],
            cross_flow_dependencies: vec![],
        }
    }

    fn sample_draft() -> DraftGraph {
        DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![
                DraftNode {
                    id: 1,
                    name: "Start".into(),
                    is_entry: true,
                    node_kind: NodeKind::Mainline,
                    completion_rule: CompletionRule::AllTasksDone,
                    specific_tasks: vec![],
                    tasks: vec![sample_task(10, "T1", 1)],
                },
                DraftNode {
                    id: 2,
                    name: "End".into(),
                    is_entry: false,
                    node_kind: NodeKind::Mainline,
                    completion_rule: CompletionRule::AllTasksDone,
                    specific_tasks: vec![],
                    tasks: vec![sample_task(20, "T2", 1)],
                },
            ],
            gates: vec![Gate {
                source_node_id: 1,
                outcome_name: "DONE".into(),
                target_node_id: Some(2),
            }],
        }
    }

    #[test]
    fn transitive_successors_reach_across_gates() {
        let draft = sample_draft();
        let snapshot = create_workflow_snapshot(&draft, 1);
        let start = snapshot.node(1).unwrap();
        assert_eq!(start.transitive_successors, vec![2]);
        let end = snapshot.node(2).unwrap();
        assert!(end.transitive_successors.is_empty());
    }

    #[test]
    fn hydration_equivalence_round_trips() {
        let draft = sample_draft();
        let snapshot = create_workflow_snapshot(&draft, 1);

        let hydrated = hydrate_snapshot_to_workflow(&snapshot, 1, || 0, false);
        let resnapshot = create_workflow_snapshot(&hydrated.draft, 1);
        let rehydrated = hydrate_snapshot_to_workflow(&resnapshot, 1, || 0, false);

        assert_eq!(normalize(&hydrated.draft), normalize(&rehydrated.draft));
    }

    #[test]
    fn branch_remaps_ids_but_preserves_structure() {
        let draft = sample_draft();
        let snapshot = create_workflow_snapshot(&draft, 1);

        let mut counter = 100i64;
        let hydrated =
            hydrate_snapshot_to_workflow(&snapshot, 1, || { counter += 1; counter }, true);

        assert_ne!(hydrated.draft.nodes[0].id, 1);
        assert_eq!(normalize(&hydrated.draft), normalize(&draft));
    }
}
