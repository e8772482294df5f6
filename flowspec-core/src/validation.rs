//! Structural validation (spec §4.J): the checks a Draft workflow must pass
//! before it can move to Validated or be re-published. Each finding carries
//! a stable code and a path pointing at the offending node/task/gate.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::snapshot::DraftGraph;

/// One structural validation failure, with a stable code (§4.J, §7) and a
/// human-oriented path for UI display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub code: &'static str,
    pub path: String,
}

impl ValidationIssue {
    fn new(code: &'static str, path: impl Into<String>) -> Self {
        Self { code, path: path.into() }
    }
}

/// Runs the full §4.J suite over a Draft graph. Returns every issue found;
/// an empty vector means the graph may move to Validated.
pub fn validate_workflow_graph(draft: &DraftGraph) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    no_entry_node(draft, &mut issues);
    unreachable_nodes(draft, &mut issues);
    orphaned_outcomes(draft, &mut issues);
    duplicate_outcome_names(draft, &mut issues);
    missing_evidence_schema(draft, &mut issues);
    invalid_gate_targets(draft, &mut issues);
    self_loop_without_exit(draft, &mut issues);
    task_name_clash(draft, &mut issues);

    issues
}

fn no_entry_node(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    if !draft.nodes.iter().any(|n| n.is_entry) {
        issues.push(ValidationIssue::new("NO_ENTRY_NODE", "workflow"));
    }
}

fn unreachable_nodes(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    for gate in &draft.gates {
        if let Some(target) = gate.target_node_id {
            adjacency.entry(gate.source_node_id).or_default().push(target);
        }
    }

    let mut reachable: HashSet<i64> = HashSet::new();
    let mut queue: VecDeque<i64> = draft.nodes.iter().filter(|n| n.is_entry).map(|n| n.id).collect();
    reachable.extend(queue.iter().copied());
    while let Some(current) = queue.pop_front() {
        if let Some(next) = adjacency.get(&current) {
            for &n in next {
                if reachable.insert(n) {
                    queue.push_back(n);
                }
            }
        }
    }

    for node in &draft.nodes {
        if !node.is_entry && !reachable.contains(&node.id) {
            issues.push(ValidationIssue::new("UNREACHABLE_NODE", format!("nodes/{}", node.id)));
        }
    }
}

fn orphaned_outcomes(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    for node in &draft.nodes {
        for task in &node.tasks {
            for outcome in &task.outcomes {
                let has_gate = draft
                    .gates
                    .iter()
                    .any(|g| g.source_node_id == node.id && g.outcome_name == outcome.name);
                if !has_gate {
                    issues.push(ValidationIssue::new(
                        "ORPHANED_OUTCOME",
                        format!("nodes/{}/tasks/{}/outcomes/{}", node.id, task.id, outcome.name),
                    ));
                }
            }
        }
    }
}

fn duplicate_outcome_names(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    for node in &draft.nodes {
        for task in &node.tasks {
            let mut seen = HashSet::new();
            for outcome in &task.outcomes {
                if !seen.insert(outcome.name.as_str()) {
                    issues.push(ValidationIssue::new(
                        "DUPLICATE_OUTCOME_NAME",
                        format!("nodes/{}/tasks/{}/outcomes/{}", node.id, task.id, outcome.name),
                    ));
                }
            }
        }
    }
}

fn missing_evidence_schema(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    for node in &draft.nodes {
        for task in &node.tasks {
            if task.evidence_required && task.evidence_schema.is_none() {
                issues.push(ValidationIssue::new(
                    "MISSING_EVIDENCE_SCHEMA",
                    format!("nodes/{}/tasks/{}", node.id, task.id),
                ));
            }
        }
    }
}

fn invalid_gate_targets(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    let node_ids: HashSet<i64> = draft.nodes.iter().map(|n| n.id).collect();
    for (i, gate) in draft.gates.iter().enumerate() {
        if !node_ids.contains(&gate.source_node_id) {
            issues.push(ValidationIssue::new("INVALID_GATE_TARGET", format!("gates/{i}/sourceNodeId")));
        }
        if let Some(target) = gate.target_node_id {
            if !node_ids.contains(&target) {
                issues.push(ValidationIssue::new("INVALID_GATE_TARGET", format!("gates/{i}/targetNodeId")));
            }
        }
    }
}

fn self_loop_without_exit(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    for node in &draft.nodes {
        let outgoing: Vec<&crate::models::Gate> =
            draft.gates.iter().filter(|g| g.source_node_id == node.id).collect();
        if !outgoing.is_empty() && outgoing.iter().all(|g| g.target_node_id == Some(node.id)) {
            issues.push(ValidationIssue::new("SELF_LOOP_WITHOUT_EXIT", format!("nodes/{}", node.id)));
        }
    }
}

fn task_name_clash(draft: &DraftGraph, issues: &mut Vec<ValidationIssue>) {
    for node in &draft.nodes {
        let mut seen = HashSet::new();
        for task in &node.tasks {
            if !seen.insert(task.name.as_str()) {
                issues.push(ValidationIssue::new(
                    "TASK_NAME_CLASH",
                    format!("nodes/{}/tasks/{}", node.id, task.name),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use crate::snapshot::DraftNode;

    fn task(id: TaskId, name: &str, outcomes: &[&str], evidence_required: bool) -> SnapshotTask {
        SnapshotTask {
            id,
            name: name.into(),
            instructions: None,
            display_order: id as i32,
            evidence_required,
            evidence_schema: None,
            default_sla_hours: None,
            metadata: None,
            outcomes: outcomes.iter().map(|o| Outcome { name: o.to_string() }).collect(),
            cross_flow_dependencies: vec![],
        }
    }

    fn node(id: NodeId, is_entry: bool, tasks: Vec<SnapshotTask>) -> DraftNode {
        DraftNode {
            id,
            name: format!("node-{id}"),
            is_entry,
            node_kind: NodeKind::Mainline,
            completion_rule: CompletionRule::AllTasksDone,
            specific_tasks: vec![],
            tasks,
        }
    }

    #[test]
    fn detects_missing_entry_node() {
        let draft = DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![node(1, false, vec![])],
            gates: vec![],
        };
        let issues = validate_workflow_graph(&draft);
        assert!(issues.iter().any(|i| i.code == "NO_ENTRY_NODE"));
    }

    #[test]
    fn detects_orphaned_outcome_and_missing_schema() {
        let draft = DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![node(1, true, vec![task(10, "T1", &["DONE"], true)])],
            gates: vec![],
        };
        let issues = validate_workflow_graph(&draft);
        assert!(issues.iter().any(|i| i.code == "ORPHANED_OUTCOME"));
        assert!(issues.iter().any(|i| i.code == "MISSING_EVIDENCE_SCHEMA"));
    }

    #[test]
    fn detects_unreachable_node() {
        let draft = DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![
                node(1, true, vec![task(10, "T1", &["DONE"], false)]),
                node(2, false, vec![task(20, "T2", &["DONE"], false)]),
            ],
            gates: vec![Gate { source_node_id: 1, outcome_name: "DONE".into(), target_node_id: None }],
        };
        let issues = validate_workflow_graph(&draft);
        assert!(issues.iter().any(|i| i.code == "UNREACHABLE_NODE" && i.path == "nodes/2"));
    }

    #[test]
    fn detects_duplicate_outcome_and_task_name_clash() {
        let draft = DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![node(
                1,
                true,
                vec![
                    task(10, "T1", &["DONE", "DONE"], false),
                    task(11, "T1", &["DONE"], false),
                ],
            )],
            gates: vec![Gate { source_node_id: 1, outcome_name: "DONE".into(), target_node_id: None }],
        };
        let issues = validate_workflow_graph(&draft);
        assert!(issues.iter().any(|i| i.code == "DUPLICATE_OUTCOME_NAME"));
        assert!(issues.iter().any(|i| i.code == "TASK_NAME_CLASH"));
    }

    #[test]
    fn detects_self_loop_without_exit() {
        let draft = DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![node(1, true, vec![task(10, "T1", &["RETRY"], false)])],
            gates: vec![Gate { source_node_id: 1, outcome_name: "RETRY".into(), target_node_id: Some(1) }],
        };
        let issues = validate_workflow_graph(&draft);
        assert!(issues.iter().any(|i| i.code == "SELF_LOOP_WITHOUT_EXIT"));
    }

    #[test]
    fn valid_graph_has_no_issues() {
        let draft = DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![
                node(1, true, vec![task(10, "T1", &["DONE"], false)]),
                node(2, false, vec![task(20, "T2", &["FINISH"], false)]),
            ],
            gates: vec![
                Gate { source_node_id: 1, outcome_name: "DONE".into(), target_node_id: Some(2) },
                Gate { source_node_id: 2, outcome_name: "FINISH".into(), target_node_id: None },
            ],
        };
        assert!(validate_workflow_graph(&draft).is_empty());
    }
}
