//! Lifecycle controller (spec §4.D): Draft → Validated → Published, branch
//! cloning from a published snapshot, and delete guards.

use chrono::Utc;
use flowspec_core::error::{FlowError, Result};
use flowspec_core::models::*;
use flowspec_core::repository::EngineRepository;
use flowspec_core::snapshot::{create_workflow_snapshot, hydrate_snapshot_to_workflow};
use flowspec_core::validation::{validate_workflow_graph, ValidationIssue};

/// `validate` (§4.D): Draft → Validated, gated on an empty §4.J issue list.
pub async fn validate<R: EngineRepository + ?Sized>(
    repo: &R,
    company_id: &CompanyId,
    workflow_id: WorkflowId,
) -> Result<Workflow> {
    let workflow = repo.get(company_id, workflow_id).await?;
    if workflow.status != WorkflowStatus::Draft {
        return Err(FlowError::InvalidState(format!(
            "workflow {} is not Draft",
            workflow.id
        )));
    }

    let draft = repo.get_draft(workflow_id).await?;
    let issues = validate_workflow_graph(&draft);
    if !issues.is_empty() {
        return Err(FlowError::ValidationFailed(issues.into_iter().map(format_issue).collect()));
    }

    repo.set_status(workflow_id, WorkflowStatus::Validated).await
}

fn format_issue(issue: ValidationIssue) -> String {
    format!("{}: {}", issue.code, issue.path)
}

/// `edit` (§4.D): Validated → Draft, dropping the Validated status so the
/// graph can be changed again before the next `validate`.
pub async fn edit<R: EngineRepository + ?Sized>(
    repo: &R,
    company_id: &CompanyId,
    workflow_id: WorkflowId,
) -> Result<Workflow> {
    let workflow = repo.get(company_id, workflow_id).await?;
    if workflow.status != WorkflowStatus::Validated {
        return Err(FlowError::InvalidState(format!(
            "workflow {} is not Validated",
            workflow.id
        )));
    }
    repo.set_status(workflow_id, WorkflowStatus::Draft).await
}

/// `publish` (§4.D): Validated (or Draft — publish re-runs validation even
/// from Validated, to catch post-validation drift) → Published. Writes a new
/// WorkflowVersion snapshot and bumps `workflow.version`.
pub async fn publish<R: EngineRepository + ?Sized>(
    repo: &R,
    company_id: &CompanyId,
    workflow_id: WorkflowId,
    actor_id: &ActorId,
) -> Result<Workflow> {
    let workflow = repo.get(company_id, workflow_id).await?;
    if workflow.status != WorkflowStatus::Draft && workflow.status != WorkflowStatus::Validated {
        return Err(FlowError::InvalidState(format!(
            "workflow {} is not Draft or Validated",
            workflow.id
        )));
    }

    let draft = repo.get_draft(workflow_id).await?;
    let issues = validate_workflow_graph(&draft);
    if !issues.is_empty() {
        return Err(FlowError::ValidationFailed(issues.into_iter().map(format_issue).collect()));
    }

    let next_version = workflow.version + 1;
    let snapshot = create_workflow_snapshot(&draft, next_version);
    repo.put_version(&snapshot).await?;
    repo.set_published(workflow_id, next_version, Utc::now(), actor_id).await
}

/// `branchFromVersion` (§4.D): Published → new Draft, deep id-remapping
/// clone of the chosen snapshot (property §8: byte-equivalent structure).
pub async fn branch_from_version<R: EngineRepository + ?Sized>(
    repo: &R,
    company_id: &CompanyId,
    workflow_id: WorkflowId,
    version: i32,
    name: &str,
) -> Result<Workflow> {
    let source = repo.get(company_id, workflow_id).await?;
    if source.status != WorkflowStatus::Published {
        return Err(FlowError::InvalidState(format!(
            "workflow {} is not Published",
            source.id
        )));
    }
    let snapshot = repo.get_version(workflow_id, version).await?;

    let branch = repo.create(company_id, name).await?;
    let max_existing_id = snapshot
        .nodes
        .iter()
        .map(|n| n.id)
        .chain(snapshot.nodes.iter().flat_map(|n| n.tasks.iter().map(|t| t.id)))
        .max()
        .unwrap_or(0);
    let mut next_id: i64 = max_existing_id + 1;
    let hydrated = hydrate_snapshot_to_workflow(
        &snapshot,
        branch.id,
        || {
            let id = next_id;
            next_id += 1;
            id
        },
        true,
    );
    repo.put_draft(&hydrated.draft).await?;
    Ok(branch)
}

/// `delete` (§4.D): a Draft with no versions is removed outright; any
/// workflow that has ever been published (or carries any version) is
/// immutable (INV-011, `PUBLISHED_IMMUTABLE`).
pub async fn delete<R: EngineRepository + ?Sized>(
    repo: &R,
    company_id: &CompanyId,
    workflow_id: WorkflowId,
) -> Result<()> {
    let workflow = repo.get(company_id, workflow_id).await?;
    if workflow.status == WorkflowStatus::Published {
        return Err(FlowError::PublishedImmutable);
    }
    if repo.get_version(workflow_id, 1).await.is_ok() {
        return Err(FlowError::PublishedImmutable);
    }
    repo.delete(company_id, workflow_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn linear_draft(workflow_id: WorkflowId) -> DraftGraph {
        DraftGraph {
            workflow_id,
            name: "Linear".into(),
            is_non_terminating: false,
            nodes: vec![
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
            gates: vec![
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
        }
    }

    #[tokio::test]
    async fn validate_then_publish_bumps_version() {
        let store = test_store().await;
        let workflow = store.create(&"acme".to_string(), "Linear").await.unwrap();
        store.put_draft(&linear_draft(workflow.id)).await.unwrap();

        let validated = validate(&store, &"acme".to_string(), workflow.id).await.unwrap();
        assert_eq!(validated.status, WorkflowStatus::Validated);

        let published = publish(&store, &"acme".to_string(), workflow.id, &"alice".to_string())
            .await
            .unwrap();
        assert_eq!(published.status, WorkflowStatus::Published);
        assert_eq!(published.version, 1);
    }

    #[tokio::test]
    async fn validate_rejects_graph_with_no_entry_node() {
        let store = test_store().await;
        let workflow = store.create(&"acme".to_string(), "Broken").await.unwrap();
        let mut draft = linear_draft(workflow.id);
        draft.nodes[0].is_entry = false;
        store.put_draft(&draft).await.unwrap();

        let err = validate(&store, &"acme".to_string(), workflow.id).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn published_workflow_cannot_be_deleted() {
        let store = test_store().await;
        let workflow = store.create(&"acme".to_string(), "Linear").await.unwrap();
        store.put_draft(&linear_draft(workflow.id)).await.unwrap();
        validate(&store, &"acme".to_string(), workflow.id).await.unwrap();
        publish(&store, &"acme".to_string(), workflow.id, &"alice".to_string())
            .await
            .unwrap();

        let err = delete(&store, &"acme".to_string(), workflow.id).await.unwrap_err();
        assert_eq!(err.code(), "PUBLISHED_IMMUTABLE");
    }

    #[tokio::test]
    async fn branch_from_version_clones_structure_with_new_ids() {
        let store = test_store().await;
        let workflow = store.create(&"acme".to_string(), "Linear").await.unwrap();
        store.put_draft(&linear_draft(workflow.id)).await.unwrap();
        validate(&store, &"acme".to_string(), workflow.id).await.unwrap();
        publish(&store, &"acme".to_string(), workflow.id, &"alice".to_string())
            .await
            .unwrap();

        let branch = branch_from_version(&store, &"acme".to_string(), workflow.id, 1, "Linear v2")
            .await
            .unwrap();
        assert_eq!(branch.status, WorkflowStatus::Draft);

        let branch_draft = store.get_draft(branch.id).await.unwrap();
        assert_eq!(branch_draft.nodes.len(), 2);
        assert_ne!(branch_draft.nodes[0].id, 1);
    }
}
