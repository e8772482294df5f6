//! The execution engine (spec §4.F): `startTask` and `recordOutcome`.
//!
//! Both are read-mostly: every decision (gate routing, flow completion,
//! schedule commit, fan-out, job provisioning) is computed from Truth read
//! before any write, then handed to [`EngineRepository::commit_outcome`] as
//! one [`CommitOutcomePlan`] so the whole thing lands in a single physical
//! transaction (§5, §8 atomicity).

use chrono::{DateTime, Utc};

use flowspec_core::error::{FlowError, Result};
use flowspec_core::kernel::{self, FlowTruth};
use flowspec_core::models::*;
use flowspec_core::repository::{
    CommitOutcomePlan, EngineRepository, NewScheduleBlock, PlannedActivation, PlannedScheduleCommit,
};

use crate::hooks::{EngineEvent, HookRegistry};
use crate::sibling::{referenced_workflow_ids, resolve_sibling_outcomes};

pub struct StartTaskOutcome {
    pub execution: TaskExecution,
    pub iteration: i32,
}

/// `startTask(flowId, taskId, actorId)` (§4.F). Idempotent: replaying against
/// an already-open execution for the node's current iteration returns it
/// as-is without a new write or hook dispatch.
pub async fn start_task<R: EngineRepository + ?Sized>(
    repo: &R,
    flow_id: FlowId,
    task_id: TaskId,
    actor_id: ActorId,
    hooks: &HookRegistry,
) -> Result<StartTaskOutcome> {
    let flow = repo.get_flow(flow_id).await?;
    if flow.status != FlowStatus::Active {
        return Err(FlowError::InvalidState(format!(
            "flow {} is not ACTIVE",
            flow.id
        )));
    }

    let version = repo
        .get_version(flow.workflow_id, flow.workflow_version)
        .await?;
    let (node, _task) = version
        .task(task_id)
        .ok_or_else(|| FlowError::not_found("Task", task_id))?;

    let activations = repo.activations_for_flow(flow_id).await?;
    let iteration = kernel::node_current_iteration(&activations, node.id)
        .ok_or_else(|| FlowError::InvalidState(format!("node {} is not activated", node.id)))?;

    if let Some(existing) = repo
        .find_open_execution(flow_id, task_id, iteration)
        .await?
    {
        return Ok(StartTaskOutcome {
            execution: existing,
            iteration,
        });
    }

    let started_at = Utc::now();
    let execution = repo
        .start_execution(flow_id, task_id, iteration, &actor_id, started_at)
        .await?;

    hooks.dispatch(&[EngineEvent::TaskStarted {
        flow_id,
        task_id,
        iteration,
        at: started_at,
    }]);

    Ok(StartTaskOutcome {
        execution,
        iteration,
    })
}

/// `recordOutcome(flowId, taskId, outcome, actorId, detourId?, metadata?)`.
#[derive(Debug, Clone)]
pub struct RecordOutcomeRequest {
    pub company_id: CompanyId,
    pub flow_id: FlowId,
    pub task_id: TaskId,
    pub outcome: String,
    pub actor_id: ActorId,
    pub detour_id: Option<DetourId>,
    /// `{schedule: {startAt, endAt}}` when the task's scheduling gate fires.
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RecordOutcomeResult {
    pub execution: TaskExecution,
    pub activations: Vec<NodeActivation>,
    pub flow_completed: bool,
    pub flow_blocked: bool,
    pub schedule_block: Option<ScheduleBlock>,
    pub child_flows: Vec<Flow>,
    pub job: Option<Job>,
}

fn parse_schedule_window(metadata: &serde_json::Value) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let schedule = metadata
        .get("schedule")
        .ok_or_else(|| FlowError::SchedulingDataMissing("metadata.schedule".into()))?;
    let start_at = schedule
        .get("startAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| FlowError::SchedulingDataMissing("metadata.schedule.startAt".into()))?;
    let end_at = schedule
        .get("endAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| FlowError::SchedulingDataMissing("metadata.schedule.endAt".into()))?;
    if end_at <= start_at {
        return Err(FlowError::InvalidTimeRange(
            start_at.to_rfc3339(),
            end_at.to_rfc3339(),
        ));
    }
    Ok((start_at, end_at))
}

/// Whether `gate`'s target is a loopback (self-loop, or a target that can
/// itself reach back to the source) rather than a forward edge. Loopbacks
/// re-activate the target at `k + 1`; forward edges activate it fresh at 1.
fn is_loopback(snapshot: &WorkflowVersion, source_node_id: NodeId, target_node_id: NodeId) -> bool {
    if target_node_id == source_node_id {
        return true;
    }
    snapshot
        .node(target_node_id)
        .is_some_and(|target| target.transitive_successors.contains(&source_node_id))
}

pub async fn record_outcome<R: EngineRepository + ?Sized>(
    repo: &R,
    req: RecordOutcomeRequest,
    hooks: &HookRegistry,
) -> Result<RecordOutcomeResult> {
    let flow = repo.get_flow(req.flow_id).await?;
    if flow.status != FlowStatus::Active {
        return Err(FlowError::InvalidState(format!(
            "flow {} is not ACTIVE",
            flow.id
        )));
    }

    let workflow = repo.get(&req.company_id, flow.workflow_id).await?;
    let version = repo
        .get_version(flow.workflow_id, flow.workflow_version)
        .await?;
    let (node, task) = version
        .task(req.task_id)
        .ok_or_else(|| FlowError::not_found("Task", req.task_id))?;

    let activations = repo.activations_for_flow(req.flow_id).await?;
    let iteration = kernel::node_current_iteration(&activations, node.id)
        .ok_or_else(|| FlowError::InvalidState(format!("node {} is not activated", node.id)))?;

    let execution = repo
        .find_open_execution(req.flow_id, req.task_id, iteration)
        .await?
        .ok_or_else(|| {
            FlowError::InvalidState(format!(
                "task {} has not been started at iteration {}",
                req.task_id, iteration
            ))
        })?;
    if execution.has_outcome() {
        return Err(FlowError::InvalidState(format!(
            "task execution {} already has an outcome",
            execution.id
        )));
    }

    if !task.outcomes.iter().any(|o| o.name == req.outcome) {
        return Err(FlowError::ValidationFailed(vec![format!(
            "{} is not a declared outcome of task {}",
            req.outcome, task.id
        )]));
    }

    if task.evidence_required {
        let evidence = repo.evidence_for_flow(req.flow_id).await?;
        if !evidence.iter().any(|e| e.task_id == task.id) {
            return Err(FlowError::EvidenceRequired(task.name.clone()));
        }
    }

    let mut schedule_window = None;
    if task.scheduling_enabled() {
        let metadata = req
            .metadata
            .as_ref()
            .ok_or_else(|| FlowError::SchedulingDataMissing("metadata.schedule".into()))?;
        schedule_window = Some(parse_schedule_window(metadata)?);
    }

    // Step 6/7: gate routing. Terminal branches (target None) produce no
    // activation; loopbacks re-activate the target at k + 1, forward edges
    // activate it fresh at iteration 1.
    let gates = version.gates_from(node.id, &req.outcome);
    let mut activation_plan = Vec::new();
    for gate in &gates {
        let Some(target_id) = gate.target_node_id else {
            continue;
        };
        let target_iteration = if is_loopback(&version, node.id, target_id) {
            iteration + 1
        } else {
            1
        };
        activation_plan.push(PlannedActivation {
            flow_id: req.flow_id,
            node_id: target_id,
            iteration: target_iteration,
        });
    }

    let outcome_at = Utc::now();

    // Detour commit-via-outcome (§4.H): resolve the detour this outcome
    // closes, and — if it links an ACCEPTED change request owned by this
    // tenant — commit the requested schedule.
    let detours = repo.detours_for_flow(req.flow_id).await?;
    let mut resolved_detour_id = None;
    let mut schedule_commit = None;
    let mut committed_change_request_id = None;
    if let Some(detour_id) = req.detour_id {
        if let Some(detour) = detours.iter().find(|d| d.id == detour_id) {
            if detour.status == DetourStatus::Active {
                resolved_detour_id = Some(detour.id);
                if let Some(cr_id) = detour.change_request_id {
                    let change_request = repo.get_change_request(cr_id).await?;
                    if change_request.company_id == req.company_id
                        && change_request.status == ChangeRequestStatus::Accepted
                    {
                        let start_at = change_request.requested_start_at().ok_or_else(|| {
                            FlowError::SchedulingDataMissing("requestedStartAt".into())
                        })?;
                        let end_at = change_request.requested_end_at().ok_or_else(|| {
                            FlowError::SchedulingDataMissing("requestedEndAt".into())
                        })?;
                        schedule_commit = Some(PlannedScheduleCommit {
                            task_id: req.task_id,
                            flow_id: Some(req.flow_id),
                            new_block: NewScheduleBlock {
                                company_id: req.company_id.clone(),
                                task_id: req.task_id,
                                flow_id: Some(req.flow_id),
                                time_class: change_request.time_class,
                                start_at,
                                end_at,
                                metadata: Some(change_request.metadata.clone()),
                                created_by: req.actor_id.clone(),
                                change_request_id: Some(change_request.id),
                            },
                            change_request_id: Some(change_request.id),
                        });
                        committed_change_request_id = Some(change_request.id);
                    }
                    // else: no commit, request remains ACCEPTED (§4.H).
                }
            }
        }
    } else if let Some((start_at, end_at)) = schedule_window {
        schedule_commit = Some(PlannedScheduleCommit {
            task_id: req.task_id,
            flow_id: Some(req.flow_id),
            new_block: NewScheduleBlock {
                company_id: req.company_id.clone(),
                task_id: req.task_id,
                flow_id: Some(req.flow_id),
                time_class: TimeClass::Committed,
                start_at,
                end_at,
                metadata: req.metadata.clone(),
                created_by: req.actor_id.clone(),
                change_request_id: None,
            },
            change_request_id: None,
        });
    }

    // Fan-out (§4.G): one child flow per distinct target workflow id, even
    // when more than one rule names the same target.
    let child_flows = crate::fanout::plan_child_flows(
        repo,
        &req.company_id,
        flow.flow_group_id,
        flow.workflow_id,
        node.id,
        &req.outcome,
    )
    .await?;

    // Job provisioning (§4.G): validate the SALE_CLOSED evidence's customer
    // against the flow's anchor identity; a mismatch blocks the flow instead
    // of surfacing an error (§7 propagation policy).
    let mut provision_job = None;
    let mut block_flow = false;
    if req.outcome == crate::fanout::PROVISIONING_OUTCOME {
        let evidence = repo.evidence_for_flow(req.flow_id).await?;
        let existing_job = repo.find_job_for_group(flow.flow_group_id).await?;
        let decision = crate::fanout::plan_job_provisioning(
            &req.company_id,
            flow.flow_group_id,
            &version,
            task.id,
            &evidence,
            existing_job.as_ref(),
        );
        provision_job = decision.job;
        block_flow = decision.block;
    }

    // Flow completion: simulate the Truth this write produces (post-outcome,
    // post-activation, post-detour-resolution) and ask the kernel.
    let mut post_executions = repo.executions_for_flow(req.flow_id).await?;
    if let Some(e) = post_executions.iter_mut().find(|e| e.id == execution.id) {
        e.outcome = Some(req.outcome.clone());
        e.outcome_at = Some(outcome_at);
        e.outcome_by = Some(req.actor_id.clone());
        e.detour_id = req.detour_id;
    }
    let mut post_activations = activations.clone();
    for a in &activation_plan {
        post_activations.push(NodeActivation {
            flow_id: a.flow_id,
            node_id: a.node_id,
            iteration: a.iteration,
            activated_at: outcome_at,
        });
    }
    let mut post_detours = detours.clone();
    if let Some(detour_id) = resolved_detour_id {
        if let Some(d) = post_detours.iter_mut().find(|d| d.id == detour_id) {
            d.status = DetourStatus::Resolved;
        }
    }
    let validity_events = repo.validity_events_for_flow(req.flow_id).await?;

    let truth = FlowTruth {
        activations: &post_activations,
        executions: &post_executions,
        validity_events: &validity_events,
        detours: &post_detours,
    };
    let sibling_ids = referenced_workflow_ids(&version);
    let sibling_outcomes =
        resolve_sibling_outcomes(repo, flow.flow_group_id, &sibling_ids).await?;
    let complete_flow =
        !block_flow && kernel::compute_flow_complete(req.flow_id, &version, &truth, &sibling_outcomes);

    let _ = &workflow; // ownership checked above via repo.get; no further use.

    let plan = CommitOutcomePlan {
        execution_id: execution.id,
        outcome: req.outcome.clone(),
        actor_id: req.actor_id.clone(),
        outcome_at,
        detour_id: req.detour_id,
        activations: activation_plan,
        flow_id: req.flow_id,
        complete_flow,
        schedule_commit,
        committed_change_request_id,
        child_flows,
        provision_job,
        block_flow,
        resolved_detour_id,
    };

    let output = repo.commit_outcome(plan).await?;

    let mut events = vec![EngineEvent::TaskDone {
        flow_id: req.flow_id,
        task_execution_id: execution.id,
        outcome: req.outcome.clone(),
        at: outcome_at,
    }];
    for activation in &output.activations {
        events.push(EngineEvent::NodeActivated {
            flow_id: req.flow_id,
            node_id: activation.node_id,
            iteration: activation.iteration,
            at: activation.activated_at,
        });
    }
    if output.flow_completed {
        events.push(EngineEvent::FlowCompleted {
            flow_id: req.flow_id,
            at: outcome_at,
        });
    }
    hooks.dispatch(&events);

    Ok(RecordOutcomeResult {
        execution: output.execution.unwrap_or(execution),
        activations: output.activations,
        flow_completed: output.flow_completed,
        flow_blocked: output.flow_blocked,
        schedule_block: output.schedule_block,
        child_flows: output.child_flows,
        job: output.job,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiation::{create_flow, CreateFlowRequest};
    use crate::tests_support::{published_linear_workflow, test_store};
    use flowspec_core::repository::{FlowRepository, TruthRepository, WorkflowRepository};

    #[tokio::test]
    async fn linear_flow_completes_after_both_outcomes() {
        let store = test_store().await;
        let hooks = HookRegistry::new();
        let workflow_id = published_linear_workflow(&store, "acme").await;
        let flow = create_flow(
            &store,
            CreateFlowRequest {
                company_id: "acme".into(),
                workflow_id,
                scope_type: "job".into(),
                scope_id: "job_1".into(),
                actor_id: "alice".into(),
                initial_evidence: None,
            },
        )
        .await
        .unwrap();

        let version = store.latest_version(workflow_id).await.unwrap();
        let n1 = version.node(version.entry_nodes()[0].id).unwrap();
        let t1 = n1.tasks[0].id;

        start_task(&store, flow.id, t1, "alice".into(), &hooks)
            .await
            .unwrap();
        let result = record_outcome(
            &store,
            RecordOutcomeRequest {
                company_id: "acme".into(),
                flow_id: flow.id,
                task_id: t1,
                outcome: "DONE".into(),
                actor_id: "alice".into(),
                detour_id: None,
                metadata: None,
            },
            &hooks,
        )
        .await
        .unwrap();
        assert!(!result.flow_completed);
        assert_eq!(result.activations.len(), 1);

        let n2 = version
            .nodes
            .iter()
            .find(|n| n.id == result.activations[0].node_id)
            .unwrap();
        let t2 = n2.tasks[0].id;
        start_task(&store, flow.id, t2, "alice".into(), &hooks)
            .await
            .unwrap();
        let result = record_outcome(
            &store,
            RecordOutcomeRequest {
                company_id: "acme".into(),
                flow_id: flow.id,
                task_id: t2,
                outcome: "FINISH".into(),
                actor_id: "alice".into(),
                detour_id: None,
                metadata: None,
            },
            &hooks,
        )
        .await
        .unwrap();
        assert!(result.flow_completed);

        let reloaded = store.get_flow(flow.id).await.unwrap();
        assert_eq!(reloaded.status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn evidence_required_blocks_outcome_until_attached() {
        let store = test_store().await;
        let hooks = HookRegistry::new();
        let workflow_id = crate::tests_support::published_workflow_with_evidence_gate(&store, "acme").await;
        let flow = create_flow(
            &store,
            CreateFlowRequest {
                company_id: "acme".into(),
                workflow_id,
                scope_type: "job".into(),
                scope_id: "job_2".into(),
                actor_id: "alice".into(),
                initial_evidence: None,
            },
        )
        .await
        .unwrap();

        let version = store.latest_version(workflow_id).await.unwrap();
        let task_id = version.entry_nodes()[0].tasks[0].id;
        start_task(&store, flow.id, task_id, "alice".into(), &hooks)
            .await
            .unwrap();

        let err = record_outcome(
            &store,
            RecordOutcomeRequest {
                company_id: "acme".into(),
                flow_id: flow.id,
                task_id,
                outcome: "DONE".into(),
                actor_id: "alice".into(),
                detour_id: None,
                metadata: None,
            },
            &hooks,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "EVIDENCE_REQUIRED");

        store
            .attach_evidence(
                flow.id,
                task_id,
                EvidenceData::Text {
                    content: "inspected".into(),
                },
                &"alice".to_string(),
                Utc::now(),
                None,
            )
            .await
            .unwrap();

        let result = record_outcome(
            &store,
            RecordOutcomeRequest {
                company_id: "acme".into(),
                flow_id: flow.id,
                task_id,
                outcome: "DONE".into(),
                actor_id: "alice".into(),
                detour_id: None,
                metadata: None,
            },
            &hooks,
        )
        .await
        .unwrap();
        assert!(result.flow_completed);
    }
}
