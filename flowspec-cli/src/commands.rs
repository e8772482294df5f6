//! Command handlers: each returns a `serde_json::Value` shaped as the
//! `{success, data?, error?}` envelope the engine's call sites are
//! specified against (§6).

use flowspec_core::error::FlowError;
use flowspec_core::models::*;
use flowspec_db::{SqliteStore, StatsRepository, WorkflowRepository};
use flowspec_engine::detour::{
    create_change_request, review_request, CreateChangeRequestParams, DetourCheckpoint, ReviewAction,
};
use flowspec_engine::execution::{record_outcome, start_task, RecordOutcomeRequest};
use flowspec_engine::hooks::HookRegistry;
use flowspec_engine::impact::analyze_impact;
use flowspec_engine::instantiation::{create_flow, CreateFlowRequest};
use flowspec_engine::lifecycle::{branch_from_version, delete, edit, publish, validate};
use serde::Serialize;
use serde_json::{json, Value};

fn ok(data: impl Serialize) -> Value {
    json!({ "success": true, "data": data })
}

fn err(e: FlowError) -> Value {
    json!({
        "success": false,
        "error": { "code": e.code(), "message": e.to_string() },
    })
}

pub async fn workflow_create(store: &SqliteStore, company_id: &str, name: &str) -> Value {
    match store.create(&company_id.to_string(), name).await {
        Ok(w) => ok(w),
        Err(e) => err(e),
    }
}

pub async fn workflow_put_draft(store: &SqliteStore, workflow_id: WorkflowId, draft_json: &str) -> Value {
    let draft: flowspec_core::snapshot::DraftGraph = match serde_json::from_str(draft_json) {
        Ok(d) => d,
        Err(e) => {
            return json!({
                "success": false,
                "error": { "code": "VALIDATION_FAILED", "message": format!("malformed draft: {e}") },
            })
        }
    };
    match store.put_draft(&draft).await {
        Ok(()) => ok(json!({ "workflowId": workflow_id })),
        Err(e) => err(e),
    }
}

pub async fn workflow_validate(store: &SqliteStore, company_id: &str, workflow_id: WorkflowId) -> Value {
    match validate(store, &company_id.to_string(), workflow_id).await {
        Ok(w) => ok(w),
        Err(e) => err(e),
    }
}

pub async fn workflow_edit(store: &SqliteStore, company_id: &str, workflow_id: WorkflowId) -> Value {
    match edit(store, &company_id.to_string(), workflow_id).await {
        Ok(w) => ok(w),
        Err(e) => err(e),
    }
}

pub async fn workflow_publish(
    store: &SqliteStore,
    company_id: &str,
    workflow_id: WorkflowId,
    actor_id: &str,
) -> Value {
    match publish(store, &company_id.to_string(), workflow_id, &actor_id.to_string()).await {
        Ok(w) => ok(w),
        Err(e) => err(e),
    }
}

pub async fn workflow_branch(
    store: &SqliteStore,
    company_id: &str,
    workflow_id: WorkflowId,
    version: i32,
    name: &str,
) -> Value {
    match branch_from_version(store, &company_id.to_string(), workflow_id, version, name).await {
        Ok(w) => ok(w),
        Err(e) => err(e),
    }
}

pub async fn workflow_delete(store: &SqliteStore, company_id: &str, workflow_id: WorkflowId) -> Value {
    match delete(store, &company_id.to_string(), workflow_id).await {
        Ok(()) => ok(json!({ "workflowId": workflow_id, "deleted": true })),
        Err(e) => err(e),
    }
}

pub async fn workflow_impact(store: &SqliteStore, company_id: &str, workflow_id: WorkflowId) -> Value {
    match analyze_impact(store, &company_id.to_string(), workflow_id).await {
        Ok(report) => ok(json!({
            "removedNodes": report.diff.changes.len(),
            "isAnalysisComplete": report.is_analysis_complete,
            "affectedFlows": report.affected_flows.iter().map(|f| f.flow_id).collect::<Vec<_>>(),
        })),
        Err(e) => err(e),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn flow_create(
    store: &SqliteStore,
    company_id: &str,
    workflow_id: WorkflowId,
    scope_type: &str,
    scope_id: &str,
    actor_id: &str,
) -> Value {
    let req = CreateFlowRequest {
        company_id: company_id.to_string(),
        workflow_id,
        scope_type: scope_type.to_string(),
        scope_id: scope_id.to_string(),
        actor_id: actor_id.to_string(),
        initial_evidence: None,
    };
    match create_flow(store, req).await {
        Ok(flow) => ok(flow),
        Err(e) => err(e),
    }
}

pub async fn flow_start_task(store: &SqliteStore, flow_id: FlowId, task_id: TaskId, actor_id: &str) -> Value {
    let hooks = HookRegistry::new();
    match start_task(store, flow_id, task_id, actor_id.to_string(), &hooks).await {
        Ok(outcome) => ok(json!({ "execution": outcome.execution, "iteration": outcome.iteration })),
        Err(e) => err(e),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn flow_record_outcome(
    store: &SqliteStore,
    company_id: &str,
    flow_id: FlowId,
    task_id: TaskId,
    outcome: &str,
    actor_id: &str,
    detour_id: Option<DetourId>,
    metadata: Option<Value>,
) -> Value {
    let hooks = HookRegistry::new();
    let req = RecordOutcomeRequest {
        company_id: company_id.to_string(),
        flow_id,
        task_id,
        outcome: outcome.to_string(),
        actor_id: actor_id.to_string(),
        detour_id,
        metadata,
    };
    match record_outcome(store, req, &hooks).await {
        Ok(result) => ok(json!({
            "execution": result.execution,
            "activations": result.activations,
            "flowCompleted": result.flow_completed,
            "flowBlocked": result.flow_blocked,
        })),
        Err(e) => err(e),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn detour_create_change_request(
    store: &SqliteStore,
    company_id: &str,
    flow_id: Option<FlowId>,
    task_id: Option<TaskId>,
    reason: &str,
    requested_by: &str,
    metadata: Value,
) -> Value {
    let params = CreateChangeRequestParams {
        company_id: company_id.to_string(),
        flow_id,
        task_id,
        detour_record_id: None,
        time_class: TimeClass::Tentative,
        reason: reason.to_string(),
        metadata,
        requested_by: requested_by.to_string(),
    };
    match create_change_request(store, params).await {
        Ok(request) => ok(request),
        Err(e) => err(e),
    }
}

pub async fn detour_start_review(
    store: &SqliteStore,
    request_id: ScheduleChangeRequestId,
    actor_id: &str,
) -> Value {
    match review_request(store, request_id, actor_id.to_string(), ReviewAction::StartReview).await {
        Ok(r) => ok(r),
        Err(e) => err(e),
    }
}

pub async fn detour_reject(store: &SqliteStore, request_id: ScheduleChangeRequestId, actor_id: &str) -> Value {
    match review_request(store, request_id, actor_id.to_string(), ReviewAction::Reject).await {
        Ok(r) => ok(r),
        Err(e) => err(e),
    }
}

pub async fn detour_cancel(store: &SqliteStore, request_id: ScheduleChangeRequestId, actor_id: &str) -> Value {
    match review_request(store, request_id, actor_id.to_string(), ReviewAction::Cancel).await {
        Ok(r) => ok(r),
        Err(e) => err(e),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn detour_accept(
    store: &SqliteStore,
    request_id: ScheduleChangeRequestId,
    actor_id: &str,
    flow_id: FlowId,
    checkpoint_node_id: NodeId,
    resume_target_node_id: NodeId,
    checkpoint_task_execution_id: TaskExecutionId,
) -> Value {
    let checkpoint = DetourCheckpoint {
        flow_id,
        checkpoint_node_id,
        resume_target_node_id,
        checkpoint_task_execution_id,
        detour_type: DetourType::Blocking,
    };
    match review_request(
        store,
        request_id,
        actor_id.to_string(),
        ReviewAction::Accept(checkpoint),
    )
    .await
    {
        Ok(r) => ok(r),
        Err(e) => err(e),
    }
}

pub async fn flow_diagnose(store: &SqliteStore, flow_id: FlowId) -> Value {
    use flowspec_core::diagnosis::diagnose;
    use flowspec_core::kernel::FlowTruth;
    use flowspec_core::repository::{DetourRepository, FlowRepository, TruthRepository, WorkflowRepository};

    let flow = match store.get_flow(flow_id).await {
        Ok(f) => f,
        Err(e) => return err(e),
    };
    let snapshot = match store.get_version(flow.workflow_id, flow.workflow_version).await {
        Ok(s) => s,
        Err(e) => return err(e),
    };
    let activations = match store.activations_for_flow(flow_id).await {
        Ok(a) => a,
        Err(e) => return err(e),
    };
    let executions = match store.executions_for_flow(flow_id).await {
        Ok(e) => e,
        Err(e) => return err(e),
    };
    let validity_events = match store.validity_events_for_flow(flow_id).await {
        Ok(v) => v,
        Err(e) => return err(e),
    };
    let detours = match store.detours_for_flow(flow_id).await {
        Ok(d) => d,
        Err(e) => return err(e),
    };

    let truth = FlowTruth {
        activations: &activations,
        executions: &executions,
        validity_events: &validity_events,
        detours: &detours,
    };
    let siblings = flowspec_core::kernel::SiblingOutcomes::new();
    let reason = diagnose(&snapshot, flow_id, &truth, &siblings).map(stall_reason_to_json);
    ok(json!({ "flowId": flow_id, "stallReason": reason }))
}

fn stall_reason_to_json(reason: flowspec_core::diagnosis::StallReason) -> Value {
    use flowspec_core::diagnosis::StallReason;
    match reason {
        StallReason::CrossFlowDependency {
            task_id,
            source_workflow_id,
            required_outcome,
        } => json!({
            "kind": "CROSS_FLOW_DEPENDENCY",
            "taskId": task_id,
            "sourceWorkflowId": source_workflow_id,
            "requiredOutcome": required_outcome,
        }),
        StallReason::BlockingDetour { detour } => json!({
            "kind": "BLOCKING_DETOUR",
            "detour": detour,
        }),
        StallReason::JoinBarrier {
            node_id,
            blocking_ancestor_id,
        } => json!({
            "kind": "JOIN_BARRIER",
            "nodeId": node_id,
            "blockingAncestorId": blocking_ancestor_id,
        }),
    }
}

pub async fn stats(store: &SqliteStore, company_id: &str) -> Value {
    match store.stats(&company_id.to_string()).await {
        Ok(s) => ok(json!({
            "workflowCount": s.workflow_count,
            "publishedWorkflowCount": s.published_workflow_count,
            "flowCount": s.flow_count,
            "activeFlowCount": s.active_flow_count,
        })),
        Err(e) => err(e),
    }
}
