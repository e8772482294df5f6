//! Repository traits (spec §6 "Scheduling guards"): the only permitted route
//! to mutate Truth tables. `flowspec-db` provides the SQLite implementation;
//! `flowspec-engine` depends on these traits, never on a concrete backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::*;

/// CRUD + lifecycle access for [`Workflow`] and its [`WorkflowVersion`]
/// snapshots. Only the lifecycle controller (§4.D) may call the mutators.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create(&self, company_id: &CompanyId, name: &str) -> Result<Workflow>;
    async fn get(&self, company_id: &CompanyId, id: WorkflowId) -> Result<Workflow>;
    async fn set_status(&self, id: WorkflowId, status: WorkflowStatus) -> Result<Workflow>;
    async fn set_published(
        &self,
        id: WorkflowId,
        version: i32,
        published_at: DateTime<Utc>,
        published_by: &ActorId,
    ) -> Result<Workflow>;
    async fn delete(&self, company_id: &CompanyId, id: WorkflowId) -> Result<()>;

    async fn put_version(&self, snapshot: &WorkflowVersion) -> Result<()>;
    async fn get_version(&self, workflow_id: WorkflowId, version: i32) -> Result<WorkflowVersion>;
    async fn latest_version(&self, workflow_id: WorkflowId) -> Result<WorkflowVersion>;

    /// The editable graph backing a Draft workflow (§4.D). Replaced wholesale
    /// on every edit; there is exactly one per workflow.
    async fn get_draft(&self, workflow_id: WorkflowId) -> Result<crate::snapshot::DraftGraph>;
    async fn put_draft(&self, draft: &crate::snapshot::DraftGraph) -> Result<()>;
}

/// [`FlowGroup`] and [`Flow`] persistence, including the §4.E duplicate-start
/// idempotency upserts.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn upsert_flow_group(
        &self,
        company_id: &CompanyId,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<FlowGroup>;
    async fn get_flow_group(&self, company_id: &CompanyId, id: FlowGroupId) -> Result<FlowGroup>;

    /// Returns the existing Flow for `(flow_group_id, workflow_id)` if one
    /// already exists — duplicate-start idempotency (§4.E C1).
    async fn find_flow_for_workflow(
        &self,
        flow_group_id: FlowGroupId,
        workflow_id: WorkflowId,
    ) -> Result<Option<Flow>>;
    async fn create_flow(
        &self,
        flow_group_id: FlowGroupId,
        workflow_id: WorkflowId,
        workflow_version: i32,
    ) -> Result<Flow>;
    async fn get_flow(&self, id: FlowId) -> Result<Flow>;
    async fn set_flow_status(&self, id: FlowId, status: FlowStatus) -> Result<Flow>;
    async fn flows_on_version(&self, workflow_id: WorkflowId, version: i32) -> Result<Vec<Flow>>;
}

/// Append-only Truth tables: [`NodeActivation`], [`TaskExecution`],
/// [`EvidenceAttachment`], [`ValidityEvent`]. Only the execution engine
/// (§4.F) may call the mutators; every other consumer reads.
#[async_trait]
pub trait TruthRepository: Send + Sync {
    async fn activations_for_flow(&self, flow_id: FlowId) -> Result<Vec<NodeActivation>>;
    async fn activate_node(&self, flow_id: FlowId, node_id: NodeId, iteration: i32) -> Result<NodeActivation>;

    async fn executions_for_flow(&self, flow_id: FlowId) -> Result<Vec<TaskExecution>>;
    async fn find_open_execution(
        &self,
        flow_id: FlowId,
        task_id: TaskId,
        iteration: i32,
    ) -> Result<Option<TaskExecution>>;
    async fn start_execution(
        &self,
        flow_id: FlowId,
        task_id: TaskId,
        iteration: i32,
        actor_id: &ActorId,
        started_at: DateTime<Utc>,
    ) -> Result<TaskExecution>;
    async fn record_outcome(
        &self,
        execution_id: TaskExecutionId,
        outcome: &str,
        actor_id: &ActorId,
        outcome_at: DateTime<Utc>,
        detour_id: Option<DetourId>,
    ) -> Result<TaskExecution>;

    async fn evidence_for_flow(&self, flow_id: FlowId) -> Result<Vec<EvidenceAttachment>>;
    async fn attach_evidence(
        &self,
        flow_id: FlowId,
        task_id: TaskId,
        data: EvidenceData,
        actor_id: &ActorId,
        attached_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<EvidenceAttachment>;
    async fn find_evidence_by_idempotency_key(
        &self,
        flow_id: FlowId,
        key: &str,
    ) -> Result<Option<EvidenceAttachment>>;

    async fn validity_events_for_flow(&self, flow_id: FlowId) -> Result<Vec<ValidityEvent>>;
    async fn record_validity_event(
        &self,
        task_execution_id: TaskExecutionId,
        state: ValidityState,
        created_at: DateTime<Utc>,
    ) -> Result<ValidityEvent>;
}

/// Detour lifecycle (§3, §4.H).
#[async_trait]
pub trait DetourRepository: Send + Sync {
    async fn detours_for_flow(&self, flow_id: FlowId) -> Result<Vec<DetourRecord>>;
    async fn open_detour(
        &self,
        flow_id: FlowId,
        checkpoint_node_id: NodeId,
        resume_target_node_id: NodeId,
        checkpoint_task_execution_id: TaskExecutionId,
        detour_type: DetourType,
    ) -> Result<DetourRecord>;
    async fn set_detour_status(&self, id: DetourId, status: DetourStatus) -> Result<DetourRecord>;
    async fn link_change_request(
        &self,
        id: DetourId,
        change_request_id: ScheduleChangeRequestId,
    ) -> Result<DetourRecord>;
}

/// Scheduling overlay: [`ScheduleBlock`] supersession chains and
/// [`ScheduleChangeRequest`] review/commit lifecycle (§4.H, §5 atomic unit c).
#[async_trait]
pub trait SchedulingRepository: Send + Sync {
    async fn current_block(&self, task_id: TaskId, flow_id: Option<FlowId>) -> Result<Option<ScheduleBlock>>;
    /// Supersedes any current block for `(task_id, flow_id)` and inserts the
    /// replacement in one atomic step; fails if another transaction already
    /// superseded the same block (§5).
    async fn supersede_and_insert(
        &self,
        task_id: TaskId,
        flow_id: Option<FlowId>,
        new_block: NewScheduleBlock,
    ) -> Result<ScheduleBlock>;

    async fn get_change_request(&self, id: ScheduleChangeRequestId) -> Result<ScheduleChangeRequest>;
    async fn create_change_request(&self, request: NewScheduleChangeRequest) -> Result<ScheduleChangeRequest>;
    async fn set_change_request_status(
        &self,
        id: ScheduleChangeRequestId,
        status: ChangeRequestStatus,
        reviewed_by: Option<&ActorId>,
    ) -> Result<ScheduleChangeRequest>;
}

/// Fields needed to insert a new [`ScheduleBlock`]; `id`/`created_at`/
/// supersession fields are assigned by the repository.
#[derive(Debug, Clone)]
pub struct NewScheduleBlock {
    pub company_id: CompanyId,
    pub task_id: TaskId,
    pub flow_id: Option<FlowId>,
    pub time_class: TimeClass,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub created_by: ActorId,
    pub change_request_id: Option<ScheduleChangeRequestId>,
}

#[derive(Debug, Clone)]
pub struct NewScheduleChangeRequest {
    pub company_id: CompanyId,
    pub flow_id: Option<FlowId>,
    pub task_id: Option<TaskId>,
    pub detour_record_id: Option<DetourId>,
    pub time_class: TimeClass,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub requested_by: ActorId,
}

/// Per-flow-group policy overrides (§4.I).
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn get_policy(&self, flow_group_id: FlowGroupId) -> Result<Option<FlowGroupPolicy>>;
    async fn put_policy(&self, policy: FlowGroupPolicy) -> Result<FlowGroupPolicy>;
}

/// Fan-out rules and provisioned jobs (§4.G).
#[async_trait]
pub trait FanOutRepository: Send + Sync {
    async fn rules_for(&self, workflow_id: WorkflowId, source_node_id: NodeId) -> Result<Vec<FanOutRule>>;
    async fn put_rule(&self, rule: FanOutRule) -> Result<FanOutRule>;

    async fn find_job_for_group(&self, flow_group_id: FlowGroupId) -> Result<Option<Job>>;
    async fn create_job(&self, job: NewJob) -> Result<Job>;
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub company_id: CompanyId,
    pub flow_group_id: FlowGroupId,
    pub customer_id: String,
    pub address: String,
}

/// One newly routed activation to write as part of a [`CommitOutcomePlan`].
#[derive(Debug, Clone)]
pub struct PlannedActivation {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub iteration: i32,
}

/// A child flow to instantiate as part of fan-out (§4.F step 10, §4.G),
/// inside the same transaction as the triggering outcome.
#[derive(Debug, Clone)]
pub struct PlannedChildFlow {
    pub flow_group_id: FlowGroupId,
    pub target_workflow_id: WorkflowId,
    pub target_version: i32,
    pub entry_activations: Vec<NodeId>,
}

/// A schedule commit to perform as part of `recordOutcome` (§4.F step 9,
/// §4.H commit-via-outcome).
#[derive(Debug, Clone)]
pub struct PlannedScheduleCommit {
    pub task_id: TaskId,
    pub flow_id: Option<FlowId>,
    pub new_block: NewScheduleBlock,
    pub change_request_id: Option<ScheduleChangeRequestId>,
}

/// Everything `recordOutcome` (§4.F) decides to write, computed from reads
/// taken before the transaction opens. Handed to [`EngineRepository::commit_outcome`]
/// so every write lands inside one physical transaction — the atomicity
/// property of §8.
#[derive(Debug, Clone)]
pub struct CommitOutcomePlan {
    pub execution_id: TaskExecutionId,
    pub outcome: String,
    pub actor_id: ActorId,
    pub outcome_at: DateTime<Utc>,
    pub detour_id: Option<DetourId>,
    pub activations: Vec<PlannedActivation>,
    pub flow_id: FlowId,
    pub complete_flow: bool,
    pub schedule_commit: Option<PlannedScheduleCommit>,
    pub committed_change_request_id: Option<ScheduleChangeRequestId>,
    pub child_flows: Vec<PlannedChildFlow>,
    pub provision_job: Option<NewJob>,
    /// Set when `provisionJob` fails its customer-identity check — the flow
    /// is flipped to BLOCKED inside the same transaction instead of erroring
    /// (§4.F step 10, §7).
    pub block_flow: bool,
    /// A detour resolved by this outcome (commit-via-outcome, §4.H).
    pub resolved_detour_id: Option<DetourId>,
}

#[derive(Debug, Clone, Default)]
pub struct CommitOutcomeOutput {
    pub execution: Option<TaskExecution>,
    pub activations: Vec<NodeActivation>,
    pub flow_completed: bool,
    pub flow_blocked: bool,
    pub schedule_block: Option<ScheduleBlock>,
    pub child_flows: Vec<Flow>,
    pub job: Option<Job>,
}

/// The single write path for `recordOutcome`'s multi-table commit (§4.A
/// `withTx`, §5, §8 atomicity). Implemented once, against a real
/// transaction, by the SQLite store; every other repository method may keep
/// committing its own narrow invariant (unique keys, conditional updates)
/// because only this path needs to span tables.
#[async_trait]
pub trait EngineRepository:
    WorkflowRepository
    + FlowRepository
    + TruthRepository
    + DetourRepository
    + SchedulingRepository
    + PolicyRepository
    + FanOutRepository
    + StatsRepository
{
    async fn commit_outcome(&self, plan: CommitOutcomePlan) -> Result<CommitOutcomeOutput>;
}

/// Aggregate counts surfaced for operational dashboards, scoped to a tenant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryStats {
    pub workflow_count: i64,
    pub published_workflow_count: i64,
    pub flow_count: i64,
    pub active_flow_count: i64,
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn stats(&self, company_id: &CompanyId) -> Result<RepositoryStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_stats_default_is_zeroed() {
        let stats = RepositoryStats::default();
        assert_eq!(stats.workflow_count, 0);
        assert_eq!(stats.active_flow_count, 0);
    }
}
