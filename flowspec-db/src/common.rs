//! Row mapping and error translation shared by every repository impl.

use chrono::{DateTime, Utc};
use flowspec_core::error::FlowError;
use flowspec_core::models::*;
use sqlx::{sqlite::SqliteRow, Row};

/// Maps a raw `sqlx::Error` into the domain error taxonomy. Unique
/// constraint violations on an idempotency/dedup key surface through the
/// caller's own find-then-insert logic, not here — this only handles
/// connection/driver failures.
pub fn sqlx_error_to_flow_error(err: sqlx::Error) -> FlowError {
    match &err {
        sqlx::Error::RowNotFound => FlowError::NotFound("row not found".into()),
        _ => FlowError::Database(err.to_string()),
    }
}

pub fn workflow_status_to_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Draft => "DRAFT",
        WorkflowStatus::Validated => "VALIDATED",
        WorkflowStatus::Published => "PUBLISHED",
    }
}

pub fn str_to_workflow_status(s: &str) -> Result<WorkflowStatus, FlowError> {
    match s {
        "DRAFT" => Ok(WorkflowStatus::Draft),
        "VALIDATED" => Ok(WorkflowStatus::Validated),
        "PUBLISHED" => Ok(WorkflowStatus::Published),
        other => Err(FlowError::Internal(format!("invalid workflow status in database: {other}"))),
    }
}

pub fn flow_status_to_str(status: FlowStatus) -> &'static str {
    match status {
        FlowStatus::Active => "ACTIVE",
        FlowStatus::Completed => "COMPLETED",
        FlowStatus::Blocked => "BLOCKED",
    }
}

pub fn str_to_flow_status(s: &str) -> Result<FlowStatus, FlowError> {
    match s {
        "ACTIVE" => Ok(FlowStatus::Active),
        "COMPLETED" => Ok(FlowStatus::Completed),
        "BLOCKED" => Ok(FlowStatus::Blocked),
        other => Err(FlowError::Internal(format!("invalid flow status in database: {other}"))),
    }
}

pub fn validity_state_to_str(state: ValidityState) -> &'static str {
    match state {
        ValidityState::Valid => "VALID",
        ValidityState::Provisional => "PROVISIONAL",
        ValidityState::Invalid => "INVALID",
    }
}

pub fn str_to_validity_state(s: &str) -> Result<ValidityState, FlowError> {
    match s {
        "VALID" => Ok(ValidityState::Valid),
        "PROVISIONAL" => Ok(ValidityState::Provisional),
        "INVALID" => Ok(ValidityState::Invalid),
        other => Err(FlowError::Internal(format!("invalid validity state in database: {other}"))),
    }
}

pub fn detour_type_to_str(kind: DetourType) -> &'static str {
    match kind {
        DetourType::Blocking => "BLOCKING",
        DetourType::Advisory => "ADVISORY",
    }
}

pub fn str_to_detour_type(s: &str) -> Result<DetourType, FlowError> {
    match s {
        "BLOCKING" => Ok(DetourType::Blocking),
        "ADVISORY" => Ok(DetourType::Advisory),
        other => Err(FlowError::Internal(format!("invalid detour type in database: {other}"))),
    }
}

pub fn detour_status_to_str(status: DetourStatus) -> &'static str {
    match status {
        DetourStatus::Active => "ACTIVE",
        DetourStatus::Resolved => "RESOLVED",
        DetourStatus::Cancelled => "CANCELLED",
    }
}

pub fn str_to_detour_status(s: &str) -> Result<DetourStatus, FlowError> {
    match s {
        "ACTIVE" => Ok(DetourStatus::Active),
        "RESOLVED" => Ok(DetourStatus::Resolved),
        "CANCELLED" => Ok(DetourStatus::Cancelled),
        other => Err(FlowError::Internal(format!("invalid detour status in database: {other}"))),
    }
}

pub fn time_class_to_str(class: TimeClass) -> &'static str {
    match class {
        TimeClass::Tentative => "TENTATIVE",
        TimeClass::Planned => "PLANNED",
        TimeClass::Committed => "COMMITTED",
    }
}

pub fn str_to_time_class(s: &str) -> Result<TimeClass, FlowError> {
    match s {
        "TENTATIVE" => Ok(TimeClass::Tentative),
        "PLANNED" => Ok(TimeClass::Planned),
        "COMMITTED" => Ok(TimeClass::Committed),
        other => Err(FlowError::Internal(format!("invalid time class in database: {other}"))),
    }
}

pub fn change_request_status_to_str(status: ChangeRequestStatus) -> &'static str {
    match status {
        ChangeRequestStatus::Pending => "PENDING",
        ChangeRequestStatus::InReview => "IN_REVIEW",
        ChangeRequestStatus::Accepted => "ACCEPTED",
        ChangeRequestStatus::Committed => "COMMITTED",
        ChangeRequestStatus::Rejected => "REJECTED",
        ChangeRequestStatus::Cancelled => "CANCELLED",
    }
}

pub fn str_to_change_request_status(s: &str) -> Result<ChangeRequestStatus, FlowError> {
    match s {
        "PENDING" => Ok(ChangeRequestStatus::Pending),
        "IN_REVIEW" => Ok(ChangeRequestStatus::InReview),
        "ACCEPTED" => Ok(ChangeRequestStatus::Accepted),
        "COMMITTED" => Ok(ChangeRequestStatus::Committed),
        "REJECTED" => Ok(ChangeRequestStatus::Rejected),
        "CANCELLED" => Ok(ChangeRequestStatus::Cancelled),
        other => Err(FlowError::Internal(format!("invalid change request status in database: {other}"))),
    }
}

pub fn job_priority_to_str(priority: JobPriority) -> &'static str {
    match priority {
        JobPriority::Low => "LOW",
        JobPriority::Normal => "NORMAL",
        JobPriority::High => "HIGH",
        JobPriority::Urgent => "URGENT",
    }
}

pub fn str_to_job_priority(s: &str) -> Result<JobPriority, FlowError> {
    match s {
        "LOW" => Ok(JobPriority::Low),
        "NORMAL" => Ok(JobPriority::Normal),
        "HIGH" => Ok(JobPriority::High),
        "URGENT" => Ok(JobPriority::Urgent),
        other => Err(FlowError::Internal(format!("invalid job priority in database: {other}"))),
    }
}

pub fn row_to_workflow(row: &SqliteRow) -> Result<Workflow, FlowError> {
    Ok(Workflow {
        id: row.get("id"),
        company_id: row.get("company_id"),
        name: row.get("name"),
        status: str_to_workflow_status(row.get("status"))?,
        version: row.get("version"),
        is_non_terminating: row.get::<i64, _>("is_non_terminating") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        published_at: row.get("published_at"),
        published_by: row.get("published_by"),
    })
}

pub fn row_to_flow(row: &SqliteRow) -> Result<Flow, FlowError> {
    Ok(Flow {
        id: row.get("id"),
        flow_group_id: row.get("flow_group_id"),
        workflow_id: row.get("workflow_id"),
        workflow_version: row.get("workflow_version"),
        status: str_to_flow_status(row.get("status"))?,
        created_at: row.get("created_at"),
    })
}

pub fn row_to_flow_group(row: &SqliteRow) -> FlowGroup {
    FlowGroup {
        id: row.get("id"),
        company_id: row.get("company_id"),
        scope_type: row.get("scope_type"),
        scope_id: row.get("scope_id"),
    }
}

pub fn row_to_task_execution(row: &SqliteRow) -> TaskExecution {
    TaskExecution {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        task_id: row.get("task_id"),
        iteration: row.get("iteration"),
        started_at: row.get::<Option<DateTime<Utc>>, _>("started_at"),
        started_by: row.get("started_by"),
        outcome: row.get("outcome"),
        outcome_at: row.get::<Option<DateTime<Utc>>, _>("outcome_at"),
        outcome_by: row.get("outcome_by"),
        detour_id: row.get("detour_id"),
    }
}

pub fn row_to_node_activation(row: &SqliteRow) -> NodeActivation {
    NodeActivation {
        flow_id: row.get("flow_id"),
        node_id: row.get("node_id"),
        iteration: row.get("iteration"),
        activated_at: row.get("activated_at"),
    }
}

pub fn row_to_evidence(row: &SqliteRow) -> Result<EvidenceAttachment, FlowError> {
    let data_json: String = row.get("data_json");
    let data: EvidenceData =
        serde_json::from_str(&data_json).map_err(|e| FlowError::Internal(format!("corrupt evidence row: {e}")))?;
    Ok(EvidenceAttachment {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        task_id: row.get("task_id"),
        data,
        attached_by: row.get("attached_by"),
        attached_at: row.get("attached_at"),
        idempotency_key: row.get("idempotency_key"),
    })
}

pub fn row_to_validity_event(row: &SqliteRow) -> Result<ValidityEvent, FlowError> {
    Ok(ValidityEvent {
        id: row.get("id"),
        task_execution_id: row.get("task_execution_id"),
        state: str_to_validity_state(row.get("state"))?,
        created_at: row.get("created_at"),
    })
}

pub fn row_to_detour(row: &SqliteRow) -> Result<DetourRecord, FlowError> {
    Ok(DetourRecord {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        checkpoint_node_id: row.get("checkpoint_node_id"),
        resume_target_node_id: row.get("resume_target_node_id"),
        checkpoint_task_execution_id: row.get("checkpoint_task_execution_id"),
        detour_type: str_to_detour_type(row.get("detour_type"))?,
        status: str_to_detour_status(row.get("status"))?,
        change_request_id: row.get("change_request_id"),
    })
}

pub fn row_to_schedule_block(row: &SqliteRow) -> Result<ScheduleBlock, FlowError> {
    let metadata_json: Option<String> = row.get("metadata_json");
    let metadata = metadata_json
        .map(|j| serde_json::from_str(&j))
        .transpose()
        .map_err(|e| FlowError::Internal(format!("corrupt schedule block metadata: {e}")))?;
    Ok(ScheduleBlock {
        id: row.get("id"),
        company_id: row.get("company_id"),
        task_id: row.get("task_id"),
        flow_id: row.get("flow_id"),
        time_class: str_to_time_class(row.get("time_class"))?,
        start_at: row.get("start_at"),
        end_at: row.get("end_at"),
        metadata,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        superseded_at: row.get("superseded_at"),
        superseded_by: row.get("superseded_by"),
        change_request_id: row.get("change_request_id"),
    })
}

pub fn row_to_change_request(row: &SqliteRow) -> Result<ScheduleChangeRequest, FlowError> {
    let metadata_json: String = row.get("metadata_json");
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| FlowError::Internal(format!("corrupt change request metadata: {e}")))?;
    Ok(ScheduleChangeRequest {
        id: row.get("id"),
        company_id: row.get("company_id"),
        flow_id: row.get("flow_id"),
        task_id: row.get("task_id"),
        detour_record_id: row.get("detour_record_id"),
        time_class: str_to_time_class(row.get("time_class"))?,
        reason: row.get("reason"),
        metadata,
        status: str_to_change_request_status(row.get("status"))?,
        requested_by: row.get("requested_by"),
        reviewed_by: row.get("reviewed_by"),
    })
}

pub fn row_to_policy(row: &SqliteRow) -> Result<FlowGroupPolicy, FlowError> {
    let overrides_json: String = row.get("task_overrides_json");
    let task_overrides = serde_json::from_str(&overrides_json)
        .map_err(|e| FlowError::Internal(format!("corrupt policy overrides: {e}")))?;
    Ok(FlowGroupPolicy {
        flow_group_id: row.get("flow_group_id"),
        job_priority: str_to_job_priority(row.get("job_priority"))?,
        group_due_at: row.get("group_due_at"),
        task_overrides,
    })
}

pub fn row_to_fan_out_rule(row: &SqliteRow) -> FanOutRule {
    FanOutRule {
        workflow_id: row.get("workflow_id"),
        source_node_id: row.get("source_node_id"),
        trigger_outcome: row.get("trigger_outcome"),
        target_workflow_id: row.get("target_workflow_id"),
    }
}

pub fn row_to_job(row: &SqliteRow) -> Job {
    Job {
        id: row.get("id"),
        company_id: row.get("company_id"),
        flow_group_id: row.get("flow_group_id"),
        customer_id: row.get("customer_id"),
        address: row.get("address"),
    }
}
