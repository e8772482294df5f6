//! Validation & impact analysis (spec §4.J, second half): diff a Draft
//! snapshot against the currently Published one and classify the fallout
//! for every live flow still running on the old version.

use std::time::Duration;

use flowspec_core::error::Result;
use flowspec_core::models::*;
use flowspec_core::repository::EngineRepository;

/// One structural change between the Published snapshot and the candidate
/// Draft that can break a flow already running on the old version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakingChange {
    RemovedNode(NodeId),
    RemovedOutcome { task_id: TaskId, outcome: String },
    ChangedEvidenceSchema(TaskId),
}

/// The structural diff itself, independent of which flows it touches.
#[derive(Debug, Clone, Default)]
pub struct StructuralDiff {
    pub changes: Vec<BreakingChange>,
}

fn diff_snapshots(old: &WorkflowVersion, new: &WorkflowVersion) -> StructuralDiff {
    let mut changes = Vec::new();

    for old_node in &old.nodes {
        if new.node(old_node.id).is_none() {
            changes.push(BreakingChange::RemovedNode(old_node.id));
            continue;
        }
        for old_task in &old_node.tasks {
            let Some(new_task) = new.task(old_task.id).map(|(_, t)| t) else {
                continue;
            };
            for old_outcome in &old_task.outcomes {
                if !new_task.outcomes.iter().any(|o| o.name == old_outcome.name) {
                    changes.push(BreakingChange::RemovedOutcome {
                        task_id: old_task.id,
                        outcome: old_outcome.name.clone(),
                    });
                }
            }
            if old_task.evidence_schema != new_task.evidence_schema {
                changes.push(BreakingChange::ChangedEvidenceSchema(old_task.id));
            }
        }
    }

    StructuralDiff { changes }
}

/// Per-flow fallout of [`StructuralDiff`]: the subset of changes that
/// actually touch something the flow has activated.
#[derive(Debug, Clone)]
pub struct FlowImpact {
    pub flow_id: FlowId,
    pub changes: Vec<BreakingChange>,
}

#[derive(Debug, Clone)]
pub struct ImpactReport {
    pub diff: StructuralDiff,
    pub affected_flows: Vec<FlowImpact>,
    /// False when the 5-second deadline expired before every live flow on
    /// the old version was classified (§4.J) — publish MAY proceed anyway.
    pub is_analysis_complete: bool,
}

fn flow_touches(change: &BreakingChange, activated_node_ids: &[NodeId], old: &WorkflowVersion) -> bool {
    match change {
        BreakingChange::RemovedNode(node_id) => activated_node_ids.contains(node_id),
        BreakingChange::RemovedOutcome { task_id, .. } | BreakingChange::ChangedEvidenceSchema(task_id) => old
            .node_of_task(*task_id)
            .is_some_and(|node| activated_node_ids.contains(&node.id)),
    }
}

async fn classify_flows<R: EngineRepository + ?Sized>(
    repo: &R,
    old: &WorkflowVersion,
    diff: &StructuralDiff,
    flows: &[Flow],
) -> Result<Vec<FlowImpact>> {
    let mut affected = Vec::new();
    for flow in flows {
        let activations = repo.activations_for_flow(flow.id).await?;
        let activated_node_ids: Vec<NodeId> = activations.iter().map(|a| a.node_id).collect();
        let changes: Vec<BreakingChange> = diff
            .changes
            .iter()
            .filter(|c| flow_touches(c, &activated_node_ids, old))
            .cloned()
            .collect();
        if !changes.is_empty() {
            affected.push(FlowImpact { flow_id: flow.id, changes });
        }
    }
    Ok(affected)
}

/// `analyzeImpact(workflowId)` (§4.J): the Draft's pending snapshot against
/// the currently Published snapshot, classified per live flow still on the
/// old version. Budgeted at 5 seconds; on expiry returns a partial report.
pub async fn analyze_impact<R: EngineRepository + ?Sized>(
    repo: &R,
    company_id: &CompanyId,
    workflow_id: WorkflowId,
) -> Result<ImpactReport> {
    let workflow = repo.get(company_id, workflow_id).await?;
    let draft = repo.get_draft(workflow_id).await?;
    let new_snapshot = flowspec_core::snapshot::create_workflow_snapshot(&draft, workflow.version.max(1) + 1);
    let old_snapshot = repo.get_version(workflow_id, workflow.version).await?;

    let diff = diff_snapshots(&old_snapshot, &new_snapshot);
    let flows = repo.flows_on_version(workflow_id, workflow.version).await?;

    match tokio::time::timeout(Duration::from_secs(5), classify_flows(repo, &old_snapshot, &diff, &flows)).await {
        Ok(result) => Ok(ImpactReport {
            diff,
            affected_flows: result?,
            is_analysis_complete: true,
        }),
        Err(_) => Ok(ImpactReport {
            diff,
            affected_flows: Vec::new(),
            is_analysis_complete: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiation::{create_flow, CreateFlowRequest};
    use crate::lifecycle::{publish, validate};
    use crate::tests_support::test_store;
    use flowspec_core::repository::WorkflowRepository;
    use flowspec_core::snapshot::{DraftGraph, DraftNode};

    fn task(id: TaskId, name: &str, outcomes: &[&str]) -> SnapshotTask {
        SnapshotTask {
            id,
            name: name.into(),
            instructions: None,
            display_order: 1,
            evidence_required: false,
            evidence_schema: None,
            default_sla_hours: None,
            metadata: None,
            outcomes: outcomes.iter().map(|o| Outcome { name: o.to_string() }).collect(),
            cross_flow_dependencies: vec![],
        }
    }

    fn draft_with_nodes(workflow_id: WorkflowId, nodes: Vec<DraftNode>, gates: Vec<Gate>) -> DraftGraph {
        DraftGraph {
            workflow_id,
            name: "Linear".into(),
            is_non_terminating: false,
            nodes,
            gates,
        }
    }

    #[tokio::test]
    async fn removing_a_node_flags_flows_activated_on_it() {
        let store = test_store().await;
        let workflow = store.create(&"acme".to_string(), "Linear").await.unwrap();

        let two_node = draft_with_nodes(
            workflow.id,
            vec![
                DraftNode {
                    id: 1,
                    name: "N1".into(),
                    is_entry: true,
                    node_kind: NodeKind::Mainline,
                    completion_rule: CompletionRule::AllTasksDone,
                    specific_tasks: vec![],
                    tasks: vec![task(10, "T1", &["DONE"])],
                },
                DraftNode {
                    id: 2,
                    name: "N2".into(),
                    is_entry: false,
                    node_kind: NodeKind::Mainline,
                    completion_rule: CompletionRule::AllTasksDone,
                    specific_tasks: vec![],
                    tasks: vec![task(20, "T2", &["FINISH"])],
                },
            ],
            vec![
                Gate {
                    source_node_id: 1,
                    outcome_name: "DONE".into(),
                    target_node_id: Some(2),
                },
                Gate {
                    source_node_id: 2,
                    outcome_name: "FINISH".into(),
                    target_node_id: None,
                },
            ],
        );
        store.put_draft(&two_node).await.unwrap();
        validate(&store, &"acme".to_string(), workflow.id).await.unwrap();
        publish(&store, &"acme".to_string(), workflow.id, &"alice".to_string())
            .await
            .unwrap();

        let flow = create_flow(
            &store,
            CreateFlowRequest {
                company_id: "acme".into(),
                workflow_id: workflow.id,
                scope_type: "job".into(),
                scope_id: "job_1".into(),
                actor_id: "alice".into(),
                initial_evidence: None,
            },
        )
        .await
        .unwrap();

        // Branch, drop N2, re-publish as v2 candidate would normally go
        // through the Draft cycle again; here we directly overwrite the
        // draft to model "N2 was removed in the next edit".
        let one_node = draft_with_nodes(
            workflow.id,
            vec![DraftNode {
                id: 1,
                name: "N1".into(),
                is_entry: true,
                node_kind: NodeKind::Mainline,
                completion_rule: CompletionRule::AllTasksDone,
                specific_tasks: vec![],
                tasks: vec![task(10, "T1", &["DONE"])],
            }],
            vec![],
        );
        store.put_draft(&one_node).await.unwrap();

        let report = analyze_impact(&store, &"acme".to_string(), workflow.id).await.unwrap();
        assert!(report.is_analysis_complete);
        assert!(report.diff.changes.contains(&BreakingChange::RemovedNode(2)));
        // The flow is only activated on N1 so far, so it is not yet impacted.
        assert!(report.affected_flows.iter().all(|f| f.flow_id != flow.id));
    }
}
