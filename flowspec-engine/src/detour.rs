//! Detour & scheduling subsystem (spec §4.H): `createChangeRequest` and
//! `reviewRequest`. Commit-via-outcome itself lives in [`crate::execution`] —
//! it is one more write folded into `recordOutcome`'s transaction, not a
//! standalone call.

use flowspec_core::error::{FlowError, Result};
use flowspec_core::models::*;
use flowspec_core::repository::{NewScheduleChangeRequest, SchedulingRepository};

#[derive(Debug, Clone)]
pub struct CreateChangeRequestParams {
    pub company_id: CompanyId,
    pub flow_id: Option<FlowId>,
    pub task_id: Option<TaskId>,
    pub detour_record_id: Option<DetourId>,
    pub time_class: TimeClass,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub requested_by: ActorId,
}

/// `createChangeRequest` (§4.H): a PENDING row, never touches ScheduleBlocks.
pub async fn create_change_request<R: SchedulingRepository + ?Sized>(
    repo: &R,
    params: CreateChangeRequestParams,
) -> Result<ScheduleChangeRequest> {
    repo.create_change_request(NewScheduleChangeRequest {
        company_id: params.company_id,
        flow_id: params.flow_id,
        task_id: params.task_id,
        detour_record_id: params.detour_record_id,
        time_class: params.time_class,
        reason: params.reason,
        metadata: params.metadata,
        requested_by: params.requested_by,
    })
    .await
}

/// The checkpoint a `reviewRequest(accept)` opens a [`DetourRecord`] from;
/// the scheduling overlay carries no node coordinates on
/// [`ScheduleChangeRequest`] itself, so the caller supplies them.
#[derive(Debug, Clone)]
pub struct DetourCheckpoint {
    pub flow_id: FlowId,
    pub checkpoint_node_id: NodeId,
    pub resume_target_node_id: NodeId,
    pub checkpoint_task_execution_id: TaskExecutionId,
    pub detour_type: DetourType,
}

#[derive(Debug, Clone)]
pub enum ReviewAction {
    StartReview,
    Accept(DetourCheckpoint),
    Reject,
    Cancel,
}

fn require_transition(current: ChangeRequestStatus, allowed: &[ChangeRequestStatus]) -> Result<()> {
    if allowed.contains(&current) {
        Ok(())
    } else {
        Err(FlowError::InvalidState(format!(
            "change request in status {current:?} cannot take this action"
        )))
    }
}

/// `reviewRequest(action)` (§4.H).
pub async fn review_request<R>(
    repo: &R,
    request_id: ScheduleChangeRequestId,
    actor_id: ActorId,
    action: ReviewAction,
) -> Result<ScheduleChangeRequest>
where
    R: SchedulingRepository + flowspec_core::repository::DetourRepository + ?Sized,
{
    let request = repo.get_change_request(request_id).await?;

    match action {
        ReviewAction::StartReview => {
            require_transition(
                request.status,
                &[ChangeRequestStatus::Pending, ChangeRequestStatus::InReview],
            )?;
            repo.set_change_request_status(request_id, ChangeRequestStatus::InReview, Some(&actor_id))
                .await
        }
        ReviewAction::Accept(checkpoint) => {
            require_transition(
                request.status,
                &[ChangeRequestStatus::Pending, ChangeRequestStatus::InReview],
            )?;
            let accepted = repo
                .set_change_request_status(request_id, ChangeRequestStatus::Accepted, Some(&actor_id))
                .await?;
            let detour = repo
                .open_detour(
                    checkpoint.flow_id,
                    checkpoint.checkpoint_node_id,
                    checkpoint.resume_target_node_id,
                    checkpoint.checkpoint_task_execution_id,
                    checkpoint.detour_type,
                )
                .await?;
            repo.link_change_request(detour.id, accepted.id).await?;
            Ok(accepted)
        }
        ReviewAction::Reject => {
            require_transition(
                request.status,
                &[ChangeRequestStatus::Pending, ChangeRequestStatus::InReview],
            )?;
            repo.set_change_request_status(request_id, ChangeRequestStatus::Rejected, Some(&actor_id))
                .await
        }
        ReviewAction::Cancel => {
            require_transition(
                request.status,
                &[
                    ChangeRequestStatus::Pending,
                    ChangeRequestStatus::InReview,
                    ChangeRequestStatus::Accepted,
                ],
            )?;
            repo.set_change_request_status(request_id, ChangeRequestStatus::Cancelled, Some(&actor_id))
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiation::{create_flow, CreateFlowRequest};
    use crate::tests_support::{published_linear_workflow, test_store};
    use flowspec_core::repository::{DetourRepository, TruthRepository};

    async fn open_execution(store: &flowspec_db::SqliteStore, flow_id: FlowId, task_id: TaskId) -> TaskExecutionId {
        store
            .start_execution(flow_id, task_id, 1, &"alice".to_string(), chrono::Utc::now())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn accept_creates_detour_and_links_request() {
        let store = test_store().await;
        let workflow_id = published_linear_workflow(&store, "acme").await;
        let flow = create_flow(
            &store,
            CreateFlowRequest {
                company_id: "acme".into(),
                workflow_id,
                scope_type: "job".into(),
                scope_id: "job_a".into(),
                actor_id: "alice".into(),
                initial_evidence: None,
            },
        )
        .await
        .unwrap();
        let checkpoint_execution_id = open_execution(&store, flow.id, 10).await;

        let request = create_change_request(
            &store,
            CreateChangeRequestParams {
                company_id: "acme".into(),
                flow_id: Some(flow.id),
                task_id: Some(10),
                detour_record_id: None,
                time_class: TimeClass::Tentative,
                reason: "customer asked to move the slot".into(),
                metadata: serde_json::json!({"requestedStartAt": "2026-01-01T13:00:00Z", "requestedEndAt": "2026-01-01T15:00:00Z"}),
                requested_by: "alice".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(request.status, ChangeRequestStatus::Pending);

        let accepted = review_request(
            &store,
            request.id,
            "bob".into(),
            ReviewAction::Accept(DetourCheckpoint {
                flow_id: flow.id,
                checkpoint_node_id: 1,
                resume_target_node_id: 2,
                checkpoint_task_execution_id: checkpoint_execution_id,
                detour_type: DetourType::Blocking,
            }),
        )
        .await
        .unwrap();
        assert_eq!(accepted.status, ChangeRequestStatus::Accepted);

        let detours = store.detours_for_flow(flow.id).await.unwrap();
        assert_eq!(detours.len(), 1);
        assert_eq!(detours[0].change_request_id, Some(request.id));
        assert_eq!(detours[0].status, DetourStatus::Active);
    }

    #[tokio::test]
    async fn reject_is_terminal() {
        let store = test_store().await;
        let request = create_change_request(
            &store,
            CreateChangeRequestParams {
                company_id: "acme".into(),
                flow_id: None,
                task_id: None,
                detour_record_id: None,
                time_class: TimeClass::Tentative,
                reason: "test".into(),
                metadata: serde_json::json!({}),
                requested_by: "alice".into(),
            },
        )
        .await
        .unwrap();

        let rejected = review_request(&store, request.id, "bob".into(), ReviewAction::Reject)
            .await
            .unwrap();
        assert_eq!(rejected.status, ChangeRequestStatus::Rejected);

        let err = review_request(&store, request.id, "bob".into(), ReviewAction::StartReview)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }
}
