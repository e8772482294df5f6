//! Instantiation service (spec §4.E): create a FlowGroup + Flow + anchor
//! evidence atomically from a Published workflow.

use chrono::Utc;
use flowspec_core::error::{FlowError, Result};
use flowspec_core::models::*;
use flowspec_core::repository::EngineRepository;

/// Evidence supplied at `createFlow` time, attached to the anchor task if
/// its `evidenceRequired` is satisfied (§4.E step 5).
#[derive(Debug, Clone)]
pub struct InitialEvidence {
    pub data: EvidenceData,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateFlowRequest {
    pub company_id: CompanyId,
    pub workflow_id: WorkflowId,
    pub scope_type: String,
    pub scope_id: String,
    pub actor_id: ActorId,
    pub initial_evidence: Option<InitialEvidence>,
}

/// The first task of the first entry node, ordered by `displayOrder` then,
/// on ties, node name ASC then task name ASC (§9 open question).
pub fn anchor_task(version: &WorkflowVersion) -> Option<(&SnapshotNode, &SnapshotTask)> {
    let mut entries: Vec<&SnapshotNode> = version.entry_nodes();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for node in entries {
        let mut tasks: Vec<&SnapshotTask> = node.tasks.iter().collect();
        tasks.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.name.cmp(&b.name)));
        if let Some(task) = tasks.into_iter().next() {
            return Some((node, task));
        }
    }
    None
}

/// `createFlow` (§4.E). Idempotent at two levels: the FlowGroup upsert
/// (same scope returns the existing group) and the C1 duplicate policy
/// (same `(group, workflow)` returns the existing flow).
pub async fn create_flow<R: EngineRepository + ?Sized>(
    repo: &R,
    req: CreateFlowRequest,
) -> Result<Flow> {
    let workflow = repo.get(&req.company_id, req.workflow_id).await?;
    if workflow.status != WorkflowStatus::Published {
        return Err(FlowError::WorkflowNotPublished(workflow.name));
    }

    let group = repo
        .upsert_flow_group(&req.company_id, &req.scope_type, &req.scope_id)
        .await?;

    // C1: at most one Flow per (flow_group, workflow); duplicate start
    // returns the existing flow rather than erroring.
    if let Some(existing) = repo.find_flow_for_workflow(group.id, req.workflow_id).await? {
        return Ok(existing);
    }

    let version = repo.latest_version(req.workflow_id).await?;
    let flow = repo.create_flow(group.id, req.workflow_id, version.version).await?;

    if let Some(evidence) = req.initial_evidence {
        let (_, anchor) = anchor_task(&version)
            .ok_or_else(|| FlowError::AnchorTaskMissing(workflow.name.clone()))?;
        repo.attach_evidence(
            flow.id,
            anchor.id,
            evidence.data,
            &req.actor_id,
            Utc::now(),
            evidence.idempotency_key.as_deref(),
        )
        .await?;
    }

    for node in version.entry_nodes() {
        repo.activate_node(flow.id, node.id, 1).await?;
    }

    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{published_linear_workflow, test_store};
    use flowspec_core::repository::{TruthRepository, WorkflowRepository};

    #[tokio::test]
    async fn duplicate_scope_returns_existing_flow_group_and_flow() {
        let store = test_store().await;
        let workflow_id = published_linear_workflow(&store, "acme").await;

        let req = || CreateFlowRequest {
            company_id: "acme".into(),
            workflow_id,
            scope_type: "job".into(),
            scope_id: "job_x".into(),
            actor_id: "alice".into(),
            initial_evidence: None,
        };
        let first = create_flow(&store, req()).await.unwrap();
        let second = create_flow(&store, req()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn rejects_unpublished_workflow() {
        let store = test_store().await;
        let workflow = store.create(&"acme".to_string(), "Draft WF").await.unwrap();
        let err = create_flow(
            &store,
            CreateFlowRequest {
                company_id: "acme".into(),
                workflow_id: workflow.id,
                scope_type: "job".into(),
                scope_id: "job_y".into(),
                actor_id: "alice".into(),
                initial_evidence: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_NOT_PUBLISHED");
    }

    #[tokio::test]
    async fn entry_nodes_are_activated_at_iteration_one() {
        let store = test_store().await;
        let workflow_id = published_linear_workflow(&store, "acme").await;
        let flow = create_flow(
            &store,
            CreateFlowRequest {
                company_id: "acme".into(),
                workflow_id,
                scope_type: "job".into(),
                scope_id: "job_z".into(),
                actor_id: "alice".into(),
                initial_evidence: None,
            },
        )
        .await
        .unwrap();

        let activations = store.activations_for_flow(flow.id).await.unwrap();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].iteration, 1);
    }
}
