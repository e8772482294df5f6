use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant identifier. Every entity carries one; every read enforces equality
/// against the caller's [`crate::tenant::TenantContext`].
pub type CompanyId = String;
pub type ActorId = String;

pub type WorkflowId = i64;
pub type NodeId = i64;
pub type TaskId = i64;
pub type FlowGroupId = i64;
pub type FlowId = i64;
pub type TaskExecutionId = i64;
pub type EvidenceId = i64;
pub type ValidityEventId = i64;
pub type DetourId = i64;
pub type ScheduleBlockId = i64;
pub type ScheduleChangeRequestId = i64;
pub type JobId = i64;

/// Lifecycle state of an editable [`Workflow`] (spec §4.D).
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Draft,
    Validated,
    Published,
}

/// A named, versioned workflow spec. Only the lifecycle controller (§4.D)
/// may mutate `status` or append a [`WorkflowVersion`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub company_id: CompanyId,
    pub name: String,
    pub status: WorkflowStatus,
    /// Current published version number; 0 while never published.
    pub version: i32,
    pub is_non_terminating: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub published_by: Option<ActorId>,
}

/// Whether a node belongs to the mainline graph or a detour subgraph.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Mainline,
    Detour,
}

/// Governs when a node is considered complete, over the tasks activated at
/// its current iteration (§4.C `computeNodeComplete`).
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionRule {
    AllTasksDone,
    AnyTaskDone,
    SpecificTasksDone,
}

/// A named branch out of a task execution (§3 Outcome).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outcome {
    pub name: String,
}

/// A dependency on a task in a sibling flow bound to `source_workflow_id`.
/// Resolved via the owning [`FlowGroup`] (§4.C point 3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrossFlowDependency {
    pub source_workflow_id: WorkflowId,
    pub source_task_path: String,
    pub required_outcome: String,
}

/// A unit of work inside a node, frozen into a [`WorkflowVersion`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotTask {
    pub id: TaskId,
    pub name: String,
    pub instructions: Option<String>,
    pub display_order: i32,
    pub evidence_required: bool,
    pub evidence_schema: Option<serde_json::Value>,
    pub default_sla_hours: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub outcomes: Vec<Outcome>,
    pub cross_flow_dependencies: Vec<CrossFlowDependency>,
}

impl SnapshotTask {
    /// `task.metadata.scheduling.enabled` per §4.F step 4.
    pub fn scheduling_enabled(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("scheduling"))
            .and_then(|s| s.get("enabled"))
            .and_then(|e| e.as_bool())
            .unwrap_or(false)
    }
}

/// A node in the workflow graph, frozen into a [`WorkflowVersion`] snapshot.
/// `transitive_successors` is precomputed at snapshot time by BFS over gates
/// (§4.B) and never recomputed at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotNode {
    pub id: NodeId,
    pub name: String,
    pub is_entry: bool,
    pub node_kind: NodeKind,
    pub completion_rule: CompletionRule,
    pub specific_tasks: Vec<TaskId>,
    pub transitive_successors: Vec<NodeId>,
    pub tasks: Vec<SnapshotTask>,
}

/// An edge routing a task outcome to a successor node, or to `None` for a
/// terminal branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gate {
    pub source_node_id: NodeId,
    pub outcome_name: String,
    pub target_node_id: Option<NodeId>,
}

/// Immutable frozen snapshot of a workflow at publish time (§3, INV-011).
/// Once written, its bytes never change — see [`crate::snapshot`] for the
/// canonicalization that makes this byte-reproducible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowVersion {
    pub workflow_id: WorkflowId,
    pub version: i32,
    pub name: String,
    pub is_non_terminating: bool,
    pub nodes: Vec<SnapshotNode>,
    pub gates: Vec<Gate>,
}

impl WorkflowVersion {
    pub fn node(&self, id: NodeId) -> Option<&SnapshotNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn task(&self, id: TaskId) -> Option<(&SnapshotNode, &SnapshotTask)> {
        self.nodes
            .iter()
            .find_map(|n| n.tasks.iter().find(|t| t.id == id).map(|t| (n, t)))
    }

    pub fn node_of_task(&self, id: TaskId) -> Option<&SnapshotNode> {
        self.task(id).map(|(n, _)| n)
    }

    pub fn entry_nodes(&self) -> Vec<&SnapshotNode> {
        self.nodes.iter().filter(|n| n.is_entry).collect()
    }

    pub fn gates_from(&self, node_id: NodeId, outcome: &str) -> Vec<&Gate> {
        self.gates
            .iter()
            .filter(|g| g.source_node_id == node_id && g.outcome_name == outcome)
            .collect()
    }

    /// Gates with more than one edge into the same target indicate a join
    /// barrier (§4.C point 5).
    pub fn inbound_gates(&self, node_id: NodeId) -> Vec<&Gate> {
        self.gates
            .iter()
            .filter(|g| g.target_node_id == Some(node_id))
            .collect()
    }
}

/// Execution scope grouping sibling flows that share identity (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowGroup {
    pub id: FlowGroupId,
    pub company_id: CompanyId,
    pub scope_type: String,
    pub scope_id: String,
}

/// Runtime status of a live [`Flow`] (§4.F state machine summary).
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Active,
    Completed,
    Blocked,
}

/// A live workflow instance, permanently bound to one [`WorkflowVersion`]
/// (INV-010).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: FlowId,
    pub flow_group_id: FlowGroupId,
    pub workflow_id: WorkflowId,
    pub workflow_version: i32,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
}

/// An append-only record that a node became live at a given iteration (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeActivation {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub iteration: i32,
    pub activated_at: DateTime<Utc>,
}

/// One row per `(flow, task, iteration)`. Outcome fields are set at most
/// once — INV-007 forbids update or delete after an outcome is recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub id: TaskExecutionId,
    pub flow_id: FlowId,
    pub task_id: TaskId,
    pub iteration: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub started_by: Option<ActorId>,
    pub outcome: Option<String>,
    pub outcome_at: Option<DateTime<Utc>>,
    pub outcome_by: Option<ActorId>,
    pub detour_id: Option<DetourId>,
}

impl TaskExecution {
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }
}

/// A pointer to content stored in the external evidence object store (§6).
/// No base64, no unknown keys — any extra field is rejected at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilePointer {
    pub storage_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
    pub bucket: String,
}

/// The tagged payload carried by an [`EvidenceAttachment`] (§6, §9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub enum EvidenceData {
    Structured { content: serde_json::Value },
    Text { content: String },
    File { pointer: FilePointer },
}

/// Append-only evidence attached to a task execution. Never removed or
/// modified (Evidence Immutability, §8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceAttachment {
    pub id: EvidenceId,
    pub flow_id: FlowId,
    pub task_id: TaskId,
    pub data: EvidenceData,
    pub attached_by: ActorId,
    pub attached_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

/// Validity of a recorded outcome. Absence of any event for a task execution
/// implies `Valid` (§3, §4.C).
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidityState {
    Valid,
    Provisional,
    Invalid,
}

/// A validity ruling on a task execution's outcome; latest-wins by
/// `(created_at DESC, id DESC)` (§3, §4.C `computeValidityMap`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidityEvent {
    pub id: ValidityEventId,
    pub task_execution_id: TaskExecutionId,
    pub state: ValidityState,
    pub created_at: DateTime<Utc>,
}

/// Whether a detour suppresses actionability in its blocked scope (§4.C
/// point 4) or is purely advisory.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetourType {
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetourStatus {
    Active,
    Resolved,
    Cancelled,
}

/// A compensation subgraph entered from a checkpoint and resuming at a
/// designated target (§3, §4.H).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetourRecord {
    pub id: DetourId,
    pub flow_id: FlowId,
    pub checkpoint_node_id: NodeId,
    pub resume_target_node_id: NodeId,
    pub checkpoint_task_execution_id: TaskExecutionId,
    pub detour_type: DetourType,
    pub status: DetourStatus,
    pub change_request_id: Option<ScheduleChangeRequestId>,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeClass {
    Tentative,
    Planned,
    Committed,
}

/// A supersedable time slot linked to a task/flow (§3, §9 "rich union").
/// At most one block per `(task_id, flow_id)` has `superseded_at = None`
/// (§8 Scheduling supersession).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleBlock {
    pub id: ScheduleBlockId,
    pub company_id: CompanyId,
    pub task_id: TaskId,
    pub flow_id: Option<FlowId>,
    pub time_class: TimeClass,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<ScheduleBlockId>,
    pub change_request_id: Option<ScheduleChangeRequestId>,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestStatus {
    Pending,
    InReview,
    Accepted,
    Committed,
    Rejected,
    Cancelled,
}

/// A request to change a task's schedule, reviewed then committed via an
/// outcome (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleChangeRequest {
    pub id: ScheduleChangeRequestId,
    pub company_id: CompanyId,
    pub flow_id: Option<FlowId>,
    pub task_id: Option<TaskId>,
    pub detour_record_id: Option<DetourId>,
    pub time_class: TimeClass,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub status: ChangeRequestStatus,
    pub requested_by: ActorId,
    pub reviewed_by: Option<ActorId>,
}

impl ScheduleChangeRequest {
    pub fn requested_start_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get("requestedStartAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn requested_end_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get("requestedEndAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// A rule triggering instantiation of a child workflow on a given outcome
/// (§3, §4.G).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanOutRule {
    pub workflow_id: WorkflowId,
    pub source_node_id: NodeId,
    pub trigger_outcome: String,
    pub target_workflow_id: WorkflowId,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Per-task SLA override inside a [`FlowGroupPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOverride {
    pub task_id: TaskId,
    pub sla_hours: Option<i64>,
}

/// Policy layer for a [`FlowGroup`] that influences signals (priority, SLA)
/// without changing structure (§3, §4.I).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowGroupPolicy {
    pub flow_group_id: FlowGroupId,
    pub job_priority: JobPriority,
    pub group_due_at: Option<DateTime<Utc>>,
    pub task_overrides: Vec<TaskOverride>,
}

/// Provisioned job metadata, created by `provisionJob` (§4.G) from the
/// anchor identity and SALE_CLOSED evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub company_id: CompanyId,
    pub flow_group_id: FlowGroupId,
    pub customer_id: String,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_pointer_rejects_stray_field() {
        let json = serde_json::json!({
            "storage_key": "k", "file_name": "f", "mime_type": "m",
            "size": 1, "bucket": "b", "extra": "nope",
        });
        assert!(serde_json::from_value::<FilePointer>(json).is_err());
    }

    #[test]
    fn evidence_data_file_rejects_stray_field() {
        let json = serde_json::json!({
            "kind": "FILE",
            "pointer": { "storage_key": "k", "file_name": "f", "mime_type": "m", "size": 1, "bucket": "b" },
            "extra": "nope",
        });
        assert!(serde_json::from_value::<EvidenceData>(json).is_err());
    }

    #[test]
    fn evidence_data_structured_rejects_stray_field() {
        let json = serde_json::json!({
            "kind": "STRUCTURED",
            "content": { "a": 1 },
            "extra": "nope",
        });
        assert!(serde_json::from_value::<EvidenceData>(json).is_err());
    }

    #[test]
    fn evidence_data_text_rejects_stray_field() {
        let json = serde_json::json!({
            "kind": "TEXT",
            "content": "hello",
            "extra": "nope",
        });
        assert!(serde_json::from_value::<EvidenceData>(json).is_err());
    }
}
