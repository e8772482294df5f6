//! Fan-out triggering and job provisioning (spec §4.G), computed from Truth
//! read before `recordOutcome`'s transaction opens and folded into its
//! [`CommitOutcomePlan`] by `execution::record_outcome`.

use std::collections::HashSet;

use flowspec_core::error::Result;
use flowspec_core::models::*;
use flowspec_core::repository::{FanOutRepository, NewJob, PlannedChildFlow, WorkflowRepository};

use crate::instantiation::anchor_task;

/// One [`PlannedChildFlow`] per distinct target workflow a [`FanOutRule`]
/// names for `(source_node_id, outcome)` — duplicate rules targeting the
/// same workflow collapse to a single child (acceptance scenario 3).
pub async fn plan_child_flows<R>(
    repo: &R,
    company_id: &CompanyId,
    flow_group_id: FlowGroupId,
    workflow_id: WorkflowId,
    source_node_id: NodeId,
    outcome: &str,
) -> Result<Vec<PlannedChildFlow>>
where
    R: FanOutRepository + WorkflowRepository + ?Sized,
{
    let rules = repo.rules_for(workflow_id, source_node_id).await?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for rule in rules.iter().filter(|r| r.trigger_outcome == outcome) {
        if !seen.insert(rule.target_workflow_id) {
            continue;
        }
        let target_workflow = repo.get(company_id, rule.target_workflow_id).await?;
        if target_workflow.status != WorkflowStatus::Published {
            continue;
        }
        let target_version = repo.latest_version(rule.target_workflow_id).await?;
        out.push(PlannedChildFlow {
            flow_group_id,
            target_workflow_id: rule.target_workflow_id,
            target_version: target_version.version,
            entry_activations: target_version.entry_nodes().iter().map(|n| n.id).collect(),
        });
    }
    Ok(out)
}

/// The outcome that triggers job provisioning. Acceptance scenario 3 only
/// ever exercises this one name; "the designated SALE_CLOSED family" in the
/// spec's prose names no others.
pub const PROVISIONING_OUTCOME: &str = "SALE_CLOSED";

fn structured_field<'a>(evidence: &'a EvidenceAttachment, field: &str) -> Option<&'a str> {
    match &evidence.data {
        EvidenceData::Structured { content } => content.get(field).and_then(|v| v.as_str()),
        _ => None,
    }
}

/// Provisioning decision for a SALE_CLOSED outcome: either a [`NewJob`] to
/// create, or `block = true` when the evidence's `customerId` disagrees with
/// the flow's anchor identity (§4.G, §7 — surfaced as BLOCKED, not an error).
pub struct ProvisioningDecision {
    pub job: Option<NewJob>,
    pub block: bool,
}

pub fn plan_job_provisioning(
    company_id: &CompanyId,
    flow_group_id: FlowGroupId,
    version: &WorkflowVersion,
    task_id: TaskId,
    evidence: &[EvidenceAttachment],
    existing_job: Option<&Job>,
) -> ProvisioningDecision {
    let Some(sale_evidence) = evidence
        .iter()
        .filter(|e| e.task_id == task_id)
        .max_by_key(|e| e.id)
    else {
        return ProvisioningDecision { job: None, block: false };
    };

    let (Some(customer_id), Some(address)) = (
        structured_field(sale_evidence, "customerId"),
        structured_field(sale_evidence, "serviceAddress")
            .or_else(|| structured_field(sale_evidence, "address")),
    ) else {
        return ProvisioningDecision { job: None, block: false };
    };

    let anchor_customer_id = anchor_task(version).and_then(|(_, anchor)| {
        evidence
            .iter()
            .filter(|e| e.task_id == anchor.id)
            .min_by_key(|e| e.id)
            .and_then(|e| structured_field(e, "customerId"))
    });

    if let Some(anchor_customer_id) = anchor_customer_id {
        if anchor_customer_id != customer_id {
            return ProvisioningDecision { job: None, block: true };
        }
    }

    if existing_job.is_some() {
        return ProvisioningDecision { job: None, block: false };
    }

    ProvisioningDecision {
        job: Some(NewJob {
            company_id: company_id.clone(),
            flow_group_id,
            customer_id: customer_id.to_string(),
            address: address.to_string(),
        }),
        block: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structured(task_id: TaskId, id: EvidenceId, content: serde_json::Value) -> EvidenceAttachment {
        EvidenceAttachment {
            id,
            flow_id: 1,
            task_id,
            data: EvidenceData::Structured { content },
            attached_by: "alice".into(),
            attached_at: chrono::Utc::now(),
            idempotency_key: None,
        }
    }

    fn single_node_version(task_id: TaskId) -> WorkflowVersion {
        WorkflowVersion {
            workflow_id: 1,
            version: 1,
            name: "sales".into(),
            is_non_terminating: false,
            nodes: vec![SnapshotNode {
                id: 1,
                name: "N1".into(),
                is_entry: true,
                node_kind: NodeKind::Mainline,
                completion_rule: CompletionRule::AllTasksDone,
                specific_tasks: vec![],
                transitive_successors: vec![],
                tasks: vec![SnapshotTask {
                    id: task_id,
                    name: "close".into(),
                    instructions: None,
                    display_order: 1,
                    evidence_required: true,
                    evidence_schema: None,
                    default_sla_hours: None,
                    metadata: None,
                    outcomes: vec![Outcome { name: "SALE_CLOSED".into() }],
                    cross_flow_dependencies: vec![],
                }],
            }],
            gates: vec![],
        }
    }

    #[test]
    fn mismatched_customer_blocks_instead_of_provisioning() {
        let version = single_node_version(10);
        let evidence = vec![
            structured(10, 1, serde_json::json!({"customerId": "C1", "serviceAddress": "1 Main St"})),
        ];
        // anchor task is the same task here; simulate a distinct prior
        // evidence row recorded under a different customer id.
        let mut evidence_with_anchor = vec![structured(
            10,
            0,
            serde_json::json!({"customerId": "C2"}),
        )];
        evidence_with_anchor.extend(evidence);

        let decision = plan_job_provisioning(
            &"acme".to_string(),
            1,
            &version,
            10,
            &evidence_with_anchor,
            None,
        );
        assert!(decision.block);
        assert!(decision.job.is_none());
    }

    #[test]
    fn matching_customer_provisions_a_job() {
        let version = single_node_version(10);
        let evidence = vec![structured(
            10,
            1,
            serde_json::json!({"customerId": "C1", "serviceAddress": "1 Main St"}),
        )];
        let decision = plan_job_provisioning(&"acme".to_string(), 1, &version, 10, &evidence, None);
        assert!(!decision.block);
        let job = decision.job.unwrap();
        assert_eq!(job.customer_id, "C1");
        assert_eq!(job.address, "1 Main St");
    }
}
