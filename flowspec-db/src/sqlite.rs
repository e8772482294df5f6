//! SQLite-backed implementation of every repository trait in
//! `flowspec_core::repository`, built on a single shared `SqlitePool`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowspec_core::error::{FlowError, Result};
use flowspec_core::models::*;
use flowspec_core::repository::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

use crate::common::*;

/// Shared connection pool plus every repository trait impl.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let is_memory = database_url.contains(":memory:");

        if !is_memory {
            use sqlx::migrate::MigrateDatabase;
            if !sqlx::Sqlite::database_exists(database_url).await.unwrap_or(false) {
                sqlx::Sqlite::create_database(database_url)
                    .await
                    .map_err(sqlx_error_to_flow_error)?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| FlowError::Internal(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        options = if is_memory {
            options.journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
        } else {
            options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 10 })
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_flow_error)?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| FlowError::Internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowRepository for SqliteStore {
    async fn create(&self, company_id: &CompanyId, name: &str) -> Result<Workflow> {
        let now = Utc::now();
        let status = workflow_status_to_str(WorkflowStatus::Draft);
        let id = sqlx::query(
            "INSERT INTO workflows (company_id, name, status, version, is_non_terminating, created_at, updated_at)
             VALUES (?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(company_id)
        .bind(name)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .last_insert_rowid();

        self.get(company_id, id).await
    }

    async fn get(&self, company_id: &CompanyId, id: WorkflowId) -> Result<Workflow> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ? AND company_id = ?")
            .bind(id)
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("Workflow", id.to_string()))?;
        row_to_workflow(&row)
    }

    async fn set_status(&self, id: WorkflowId, status: WorkflowStatus) -> Result<Workflow> {
        let now = Utc::now();
        let rows = sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(workflow_status_to_str(status))
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("Workflow", id.to_string()));
        }
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_workflow(&row)
    }

    async fn set_published(
        &self,
        id: WorkflowId,
        version: i32,
        published_at: DateTime<Utc>,
        published_by: &ActorId,
    ) -> Result<Workflow> {
        let rows = sqlx::query(
            "UPDATE workflows SET status = ?, version = ?, published_at = ?, published_by = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(workflow_status_to_str(WorkflowStatus::Published))
        .bind(version)
        .bind(published_at)
        .bind(published_by)
        .bind(published_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("Workflow", id.to_string()));
        }
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_workflow(&row)
    }

    async fn delete(&self, company_id: &CompanyId, id: WorkflowId) -> Result<()> {
        let rows = sqlx::query("DELETE FROM workflows WHERE id = ? AND company_id = ?")
            .bind(id)
            .bind(company_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("Workflow", id.to_string()));
        }
        Ok(())
    }

    async fn put_version(&self, snapshot: &WorkflowVersion) -> Result<()> {
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|e| FlowError::Internal(format!("failed to serialize snapshot: {e}")))?;
        sqlx::query(
            "INSERT INTO workflow_versions (workflow_id, version, name, is_non_terminating, snapshot_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot.workflow_id)
        .bind(snapshot.version)
        .bind(&snapshot.name)
        .bind(snapshot.is_non_terminating as i64)
        .bind(snapshot_json)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;
        Ok(())
    }

    async fn get_version(&self, workflow_id: WorkflowId, version: i32) -> Result<WorkflowVersion> {
        let row = sqlx::query("SELECT snapshot_json FROM workflow_versions WHERE workflow_id = ? AND version = ?")
            .bind(workflow_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("WorkflowVersion", format!("{workflow_id}@{version}")))?;
        let json: String = row.get("snapshot_json");
        serde_json::from_str(&json).map_err(|e| FlowError::Internal(format!("corrupt snapshot row: {e}")))
    }

    async fn latest_version(&self, workflow_id: WorkflowId) -> Result<WorkflowVersion> {
        let row = sqlx::query(
            "SELECT snapshot_json FROM workflow_versions WHERE workflow_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .ok_or_else(|| FlowError::not_found("WorkflowVersion", workflow_id.to_string()))?;
        let json: String = row.get("snapshot_json");
        serde_json::from_str(&json).map_err(|e| FlowError::Internal(format!("corrupt snapshot row: {e}")))
    }

    async fn get_draft(&self, workflow_id: WorkflowId) -> Result<flowspec_core::snapshot::DraftGraph> {
        let row = sqlx::query("SELECT draft_json FROM workflow_drafts WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("DraftGraph", workflow_id.to_string()))?;
        let json: String = row.get("draft_json");
        serde_json::from_str(&json).map_err(|e| FlowError::Internal(format!("corrupt draft row: {e}")))
    }

    async fn put_draft(&self, draft: &flowspec_core::snapshot::DraftGraph) -> Result<()> {
        let draft_json = serde_json::to_string(draft)
            .map_err(|e| FlowError::Internal(format!("failed to serialize draft: {e}")))?;
        sqlx::query(
            "INSERT INTO workflow_drafts (workflow_id, draft_json) VALUES (?, ?)
             ON CONFLICT (workflow_id) DO UPDATE SET draft_json = excluded.draft_json",
        )
        .bind(draft.workflow_id)
        .bind(draft_json)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;
        Ok(())
    }
}

#[async_trait]
impl FlowRepository for SqliteStore {
    async fn upsert_flow_group(
        &self,
        company_id: &CompanyId,
        scope_type: &str,
        scope_id: &str,
    ) -> Result<FlowGroup> {
        sqlx::query(
            "INSERT INTO flow_groups (company_id, scope_type, scope_id) VALUES (?, ?, ?)
             ON CONFLICT (company_id, scope_type, scope_id) DO NOTHING",
        )
        .bind(company_id)
        .bind(scope_type)
        .bind(scope_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;

        let row = sqlx::query("SELECT * FROM flow_groups WHERE company_id = ? AND scope_type = ? AND scope_id = ?")
            .bind(company_id)
            .bind(scope_type)
            .bind(scope_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(row_to_flow_group(&row))
    }

    async fn get_flow_group(&self, company_id: &CompanyId, id: FlowGroupId) -> Result<FlowGroup> {
        let row = sqlx::query("SELECT * FROM flow_groups WHERE id = ? AND company_id = ?")
            .bind(id)
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("FlowGroup", id.to_string()))?;
        Ok(row_to_flow_group(&row))
    }

    async fn find_flow_for_workflow(
        &self,
        flow_group_id: FlowGroupId,
        workflow_id: WorkflowId,
    ) -> Result<Option<Flow>> {
        let row = sqlx::query("SELECT * FROM flows WHERE flow_group_id = ? AND workflow_id = ?")
            .bind(flow_group_id)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row.map(|r| row_to_flow(&r)).transpose()
    }

    async fn create_flow(
        &self,
        flow_group_id: FlowGroupId,
        workflow_id: WorkflowId,
        workflow_version: i32,
    ) -> Result<Flow> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_flow_error)?;

        // §4.E C1: concurrent createFlow for the same (group, workflow) must
        // not produce two flows. The UNIQUE index makes a racing insert a
        // no-op; we then fetch and return the winner instead of erroring.
        let inserted = sqlx::query(
            "INSERT INTO flows (flow_group_id, workflow_id, workflow_version, status, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (flow_group_id, workflow_id) DO NOTHING",
        )
        .bind(flow_group_id)
        .bind(workflow_id)
        .bind(workflow_version)
        .bind(flow_status_to_str(FlowStatus::Active))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .rows_affected();

        let row = sqlx::query("SELECT * FROM flows WHERE flow_group_id = ? AND workflow_id = ?")
            .bind(flow_group_id)
            .bind(workflow_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        tx.commit().await.map_err(sqlx_error_to_flow_error)?;

        if inserted == 0 {
            tracing::debug!(flow_group_id, workflow_id, "createFlow idempotent replay");
        }
        row_to_flow(&row)
    }

    async fn get_flow(&self, id: FlowId) -> Result<Flow> {
        let row = sqlx::query("SELECT * FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("Flow", id.to_string()))?;
        row_to_flow(&row)
    }

    async fn set_flow_status(&self, id: FlowId, status: FlowStatus) -> Result<Flow> {
        let rows = sqlx::query("UPDATE flows SET status = ? WHERE id = ?")
            .bind(flow_status_to_str(status))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("Flow", id.to_string()));
        }
        self.get_flow(id).await
    }

    async fn flows_on_version(&self, workflow_id: WorkflowId, version: i32) -> Result<Vec<Flow>> {
        let rows = sqlx::query("SELECT * FROM flows WHERE workflow_id = ? AND workflow_version = ?")
            .bind(workflow_id)
            .bind(version)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        rows.iter().map(row_to_flow).collect()
    }
}

#[async_trait]
impl TruthRepository for SqliteStore {
    async fn activations_for_flow(&self, flow_id: FlowId) -> Result<Vec<NodeActivation>> {
        let rows = sqlx::query("SELECT * FROM node_activations WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(rows.iter().map(row_to_node_activation).collect())
    }

    async fn activate_node(&self, flow_id: FlowId, node_id: NodeId, iteration: i32) -> Result<NodeActivation> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO node_activations (flow_id, node_id, iteration, activated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (flow_id, node_id, iteration) DO NOTHING",
        )
        .bind(flow_id)
        .bind(node_id)
        .bind(iteration)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;

        let row = sqlx::query("SELECT * FROM node_activations WHERE flow_id = ? AND node_id = ? AND iteration = ?")
            .bind(flow_id)
            .bind(node_id)
            .bind(iteration)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(row_to_node_activation(&row))
    }

    async fn executions_for_flow(&self, flow_id: FlowId) -> Result<Vec<TaskExecution>> {
        let rows = sqlx::query("SELECT * FROM task_executions WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(rows.iter().map(row_to_task_execution).collect())
    }

    async fn find_open_execution(
        &self,
        flow_id: FlowId,
        task_id: TaskId,
        iteration: i32,
    ) -> Result<Option<TaskExecution>> {
        let row = sqlx::query("SELECT * FROM task_executions WHERE flow_id = ? AND task_id = ? AND iteration = ?")
            .bind(flow_id)
            .bind(task_id)
            .bind(iteration)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(row.map(|r| row_to_task_execution(&r)))
    }

    async fn start_execution(
        &self,
        flow_id: FlowId,
        task_id: TaskId,
        iteration: i32,
        actor_id: &ActorId,
        started_at: DateTime<Utc>,
    ) -> Result<TaskExecution> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_flow_error)?;

        // §4.F startTask is idempotent: replaying against an already-started
        // execution returns it unchanged rather than erroring.
        let existing = sqlx::query("SELECT * FROM task_executions WHERE flow_id = ? AND task_id = ? AND iteration = ?")
            .bind(flow_id)
            .bind(task_id)
            .bind(iteration)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        if let Some(row) = existing {
            tx.commit().await.map_err(sqlx_error_to_flow_error)?;
            return Ok(row_to_task_execution(&row));
        }

        let id = sqlx::query(
            "INSERT INTO task_executions (flow_id, task_id, iteration, started_at, started_by)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(flow_id)
        .bind(task_id)
        .bind(iteration)
        .bind(started_at)
        .bind(actor_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .last_insert_rowid();

        let row = sqlx::query("SELECT * FROM task_executions WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        tx.commit().await.map_err(sqlx_error_to_flow_error)?;
        Ok(row_to_task_execution(&row))
    }

    async fn record_outcome(
        &self,
        execution_id: TaskExecutionId,
        outcome: &str,
        actor_id: &ActorId,
        outcome_at: DateTime<Utc>,
        detour_id: Option<DetourId>,
    ) -> Result<TaskExecution> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_flow_error)?;

        // INV-007: an outcome is write-once. The WHERE clause makes the
        // write race-safe against a concurrent recordOutcome on the same
        // execution — only the first writer's UPDATE affects a row.
        let rows = sqlx::query(
            "UPDATE task_executions SET outcome = ?, outcome_at = ?, outcome_by = ?, detour_id = ?
             WHERE id = ? AND outcome IS NULL",
        )
        .bind(outcome)
        .bind(outcome_at)
        .bind(actor_id)
        .bind(detour_id)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .rows_affected();

        let row = sqlx::query("SELECT * FROM task_executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("TaskExecution", execution_id.to_string()))?;
        tx.commit().await.map_err(sqlx_error_to_flow_error)?;

        if rows == 0 {
            let existing = row_to_task_execution(&row);
            if existing.has_outcome() && existing.outcome.as_deref() != Some(outcome) {
                return Err(FlowError::InvalidState("task execution already has a different outcome".into()));
            }
        }
        Ok(row_to_task_execution(&row))
    }

    async fn evidence_for_flow(&self, flow_id: FlowId) -> Result<Vec<EvidenceAttachment>> {
        let rows = sqlx::query("SELECT * FROM evidence_attachments WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        rows.iter().map(row_to_evidence).collect()
    }

    async fn attach_evidence(
        &self,
        flow_id: FlowId,
        task_id: TaskId,
        data: EvidenceData,
        actor_id: &ActorId,
        attached_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<EvidenceAttachment> {
        if let Some(key) = idempotency_key {
            if let Some(existing) = self.find_evidence_by_idempotency_key(flow_id, key).await? {
                return Ok(existing);
            }
        }

        let data_json = serde_json::to_string(&data)
            .map_err(|e| FlowError::Internal(format!("failed to serialize evidence: {e}")))?;
        let id = sqlx::query(
            "INSERT INTO evidence_attachments (flow_id, task_id, data_json, attached_by, attached_at, idempotency_key)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(flow_id)
        .bind(task_id)
        .bind(data_json)
        .bind(actor_id)
        .bind(attached_at)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .last_insert_rowid();

        let row = sqlx::query("SELECT * FROM evidence_attachments WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_evidence(&row)
    }

    async fn find_evidence_by_idempotency_key(&self, flow_id: FlowId, key: &str) -> Result<Option<EvidenceAttachment>> {
        let row = sqlx::query("SELECT * FROM evidence_attachments WHERE flow_id = ? AND idempotency_key = ?")
            .bind(flow_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row.map(|r| row_to_evidence(&r)).transpose()
    }

    async fn validity_events_for_flow(&self, flow_id: FlowId) -> Result<Vec<ValidityEvent>> {
        let rows = sqlx::query(
            "SELECT ve.* FROM validity_events ve
             JOIN task_executions te ON te.id = ve.task_execution_id
             WHERE te.flow_id = ?",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;
        rows.iter().map(row_to_validity_event).collect()
    }

    async fn record_validity_event(
        &self,
        task_execution_id: TaskExecutionId,
        state: ValidityState,
        created_at: DateTime<Utc>,
    ) -> Result<ValidityEvent> {
        let id = sqlx::query("INSERT INTO validity_events (task_execution_id, state, created_at) VALUES (?, ?, ?)")
            .bind(task_execution_id)
            .bind(validity_state_to_str(state))
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .last_insert_rowid();

        let row = sqlx::query("SELECT * FROM validity_events WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_validity_event(&row)
    }
}

#[async_trait]
impl DetourRepository for SqliteStore {
    async fn detours_for_flow(&self, flow_id: FlowId) -> Result<Vec<DetourRecord>> {
        let rows = sqlx::query("SELECT * FROM detour_records WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        rows.iter().map(row_to_detour).collect()
    }

    async fn open_detour(
        &self,
        flow_id: FlowId,
        checkpoint_node_id: NodeId,
        resume_target_node_id: NodeId,
        checkpoint_task_execution_id: TaskExecutionId,
        detour_type: DetourType,
    ) -> Result<DetourRecord> {
        let id = sqlx::query(
            "INSERT INTO detour_records
                (flow_id, checkpoint_node_id, resume_target_node_id, checkpoint_task_execution_id, detour_type, status)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(flow_id)
        .bind(checkpoint_node_id)
        .bind(resume_target_node_id)
        .bind(checkpoint_task_execution_id)
        .bind(detour_type_to_str(detour_type))
        .bind(detour_status_to_str(DetourStatus::Active))
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .last_insert_rowid();

        let row = sqlx::query("SELECT * FROM detour_records WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_detour(&row)
    }

    async fn set_detour_status(&self, id: DetourId, status: DetourStatus) -> Result<DetourRecord> {
        let rows = sqlx::query("UPDATE detour_records SET status = ? WHERE id = ?")
            .bind(detour_status_to_str(status))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("DetourRecord", id.to_string()));
        }
        let row = sqlx::query("SELECT * FROM detour_records WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_detour(&row)
    }

    async fn link_change_request(
        &self,
        id: DetourId,
        change_request_id: ScheduleChangeRequestId,
    ) -> Result<DetourRecord> {
        let rows = sqlx::query("UPDATE detour_records SET change_request_id = ? WHERE id = ?")
            .bind(change_request_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("DetourRecord", id.to_string()));
        }
        let row = sqlx::query("SELECT * FROM detour_records WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row_to_detour(&row)
    }
}

#[async_trait]
impl SchedulingRepository for SqliteStore {
    async fn current_block(&self, task_id: TaskId, flow_id: Option<FlowId>) -> Result<Option<ScheduleBlock>> {
        let row = sqlx::query(
            "SELECT * FROM schedule_blocks
             WHERE task_id = ? AND flow_id IS ? AND superseded_at IS NULL",
        )
        .bind(task_id)
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;
        row.map(|r| row_to_schedule_block(&r)).transpose()
    }

    async fn supersede_and_insert(
        &self,
        task_id: TaskId,
        flow_id: Option<FlowId>,
        new_block: NewScheduleBlock,
    ) -> Result<ScheduleBlock> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_flow_error)?;

        let current = sqlx::query(
            "SELECT id FROM schedule_blocks WHERE task_id = ? AND flow_id IS ? AND superseded_at IS NULL",
        )
        .bind(task_id)
        .bind(flow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error_to_flow_error)?;
        let current_id: Option<ScheduleBlockId> = current.map(|r| r.get("id"));

        let metadata_json = new_block
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| FlowError::Internal(format!("failed to serialize schedule block metadata: {e}")))?;
        let new_id = sqlx::query(
            "INSERT INTO schedule_blocks
                (company_id, task_id, flow_id, time_class, start_at, end_at, metadata_json, created_by, created_at, change_request_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_block.company_id)
        .bind(new_block.task_id)
        .bind(new_block.flow_id)
        .bind(time_class_to_str(new_block.time_class))
        .bind(new_block.start_at)
        .bind(new_block.end_at)
        .bind(metadata_json)
        .bind(&new_block.created_by)
        .bind(now)
        .bind(new_block.change_request_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .last_insert_rowid();

        if let Some(current_id) = current_id {
            // Race-safe: only supersede if it's still un-superseded — a
            // concurrent supersede_and_insert targeting the same block would
            // have already cleared this row, and rows_affected would be 0.
            let rows = sqlx::query(
                "UPDATE schedule_blocks SET superseded_at = ?, superseded_by = ? WHERE id = ? AND superseded_at IS NULL",
            )
            .bind(now)
            .bind(new_id)
            .bind(current_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
            if rows == 0 {
                return Err(FlowError::InvalidState(
                    "schedule block was superseded by a concurrent change".into(),
                ));
            }
        }

        let row = sqlx::query("SELECT * FROM schedule_blocks WHERE id = ?")
            .bind(new_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        tx.commit().await.map_err(sqlx_error_to_flow_error)?;
        row_to_schedule_block(&row)
    }

    async fn get_change_request(&self, id: ScheduleChangeRequestId) -> Result<ScheduleChangeRequest> {
        let row = sqlx::query("SELECT * FROM schedule_change_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("ScheduleChangeRequest", id.to_string()))?;
        row_to_change_request(&row)
    }

    async fn create_change_request(&self, request: NewScheduleChangeRequest) -> Result<ScheduleChangeRequest> {
        let metadata_json = serde_json::to_string(&request.metadata)
            .map_err(|e| FlowError::Internal(format!("failed to serialize change request metadata: {e}")))?;
        let id = sqlx::query(
            "INSERT INTO schedule_change_requests
                (company_id, flow_id, task_id, detour_record_id, time_class, reason, metadata_json, status, requested_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.company_id)
        .bind(request.flow_id)
        .bind(request.task_id)
        .bind(request.detour_record_id)
        .bind(time_class_to_str(request.time_class))
        .bind(&request.reason)
        .bind(metadata_json)
        .bind(change_request_status_to_str(ChangeRequestStatus::Pending))
        .bind(&request.requested_by)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .last_insert_rowid();

        self.get_change_request(id).await
    }

    async fn set_change_request_status(
        &self,
        id: ScheduleChangeRequestId,
        status: ChangeRequestStatus,
        reviewed_by: Option<&ActorId>,
    ) -> Result<ScheduleChangeRequest> {
        let rows = sqlx::query("UPDATE schedule_change_requests SET status = ?, reviewed_by = ? WHERE id = ?")
            .bind(change_request_status_to_str(status))
            .bind(reviewed_by)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .rows_affected();
        if rows == 0 {
            return Err(FlowError::not_found("ScheduleChangeRequest", id.to_string()));
        }
        self.get_change_request(id).await
    }
}

#[async_trait]
impl PolicyRepository for SqliteStore {
    async fn get_policy(&self, flow_group_id: FlowGroupId) -> Result<Option<FlowGroupPolicy>> {
        let row = sqlx::query("SELECT * FROM flow_group_policies WHERE flow_group_id = ?")
            .bind(flow_group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        row.map(|r| row_to_policy(&r)).transpose()
    }

    async fn put_policy(&self, policy: FlowGroupPolicy) -> Result<FlowGroupPolicy> {
        let overrides_json = serde_json::to_string(&policy.task_overrides)
            .map_err(|e| FlowError::Internal(format!("failed to serialize task overrides: {e}")))?;
        sqlx::query(
            "INSERT INTO flow_group_policies (flow_group_id, job_priority, group_due_at, task_overrides_json)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (flow_group_id) DO UPDATE SET
                job_priority = excluded.job_priority,
                group_due_at = excluded.group_due_at,
                task_overrides_json = excluded.task_overrides_json",
        )
        .bind(policy.flow_group_id)
        .bind(job_priority_to_str(policy.job_priority))
        .bind(policy.group_due_at)
        .bind(overrides_json)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;

        self.get_policy(policy.flow_group_id)
            .await?
            .ok_or_else(|| FlowError::Internal("policy vanished immediately after upsert".into()))
    }
}

#[async_trait]
impl FanOutRepository for SqliteStore {
    async fn rules_for(&self, workflow_id: WorkflowId, source_node_id: NodeId) -> Result<Vec<FanOutRule>> {
        let rows = sqlx::query("SELECT * FROM fan_out_rules WHERE workflow_id = ? AND source_node_id = ?")
            .bind(workflow_id)
            .bind(source_node_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(rows.iter().map(row_to_fan_out_rule).collect())
    }

    async fn put_rule(&self, rule: FanOutRule) -> Result<FanOutRule> {
        sqlx::query(
            "INSERT INTO fan_out_rules (workflow_id, source_node_id, trigger_outcome, target_workflow_id)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (workflow_id, source_node_id, trigger_outcome) DO UPDATE SET
                target_workflow_id = excluded.target_workflow_id",
        )
        .bind(rule.workflow_id)
        .bind(rule.source_node_id)
        .bind(&rule.trigger_outcome)
        .bind(rule.target_workflow_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;
        Ok(rule)
    }

    async fn find_job_for_group(&self, flow_group_id: FlowGroupId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE flow_group_id = ?")
            .bind(flow_group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(row.map(|r| row_to_job(&r)))
    }

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        sqlx::query(
            "INSERT INTO jobs (company_id, flow_group_id, customer_id, address) VALUES (?, ?, ?, ?)
             ON CONFLICT (flow_group_id) DO NOTHING",
        )
        .bind(&job.company_id)
        .bind(job.flow_group_id)
        .bind(&job.customer_id)
        .bind(&job.address)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?;

        let row = sqlx::query("SELECT * FROM jobs WHERE flow_group_id = ?")
            .bind(job.flow_group_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?;
        Ok(row_to_job(&row))
    }
}

#[async_trait]
impl StatsRepository for SqliteStore {
    async fn stats(&self, company_id: &CompanyId) -> Result<RepositoryStats> {
        let workflow_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM workflows WHERE company_id = ?")
            .bind(company_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .get("c");
        let published_workflow_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS c FROM workflows WHERE company_id = ? AND status = ?",
        )
        .bind(company_id)
        .bind(workflow_status_to_str(WorkflowStatus::Published))
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .get("c");
        let flow_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS c FROM flows f JOIN flow_groups g ON g.id = f.flow_group_id WHERE g.company_id = ?",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .get("c");
        let active_flow_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS c FROM flows f JOIN flow_groups g ON g.id = f.flow_group_id
             WHERE g.company_id = ? AND f.status = ?",
        )
        .bind(company_id)
        .bind(flow_status_to_str(FlowStatus::Active))
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_flow_error)?
        .get("c");

        Ok(RepositoryStats {
            workflow_count,
            published_workflow_count,
            flow_count,
            active_flow_count,
        })
    }
}

#[async_trait]
impl EngineRepository for SqliteStore {
    /// The sole multi-table write path in the engine (§4.A `withTx`, §5, §8
    /// atomicity). Every write `recordOutcome` decides on — the outcome
    /// itself, routed activations, flow completion/blocking, schedule
    /// supersession, fan-out children, job provisioning — lands inside this
    /// one physical transaction. A failure anywhere rolls every write back.
    async fn commit_outcome(&self, plan: CommitOutcomePlan) -> Result<CommitOutcomeOutput> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error_to_flow_error)?;
        let now = plan.outcome_at;

        // Step 5: outcome write, write-once (INV-007).
        sqlx::query(
            "UPDATE task_executions SET outcome = ?, outcome_at = ?, outcome_by = ?, detour_id = ?
             WHERE id = ? AND outcome IS NULL",
        )
        .bind(&plan.outcome)
        .bind(now)
        .bind(&plan.actor_id)
        .bind(plan.detour_id)
        .bind(plan.execution_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_flow_error)?;

        let execution_row = sqlx::query("SELECT * FROM task_executions WHERE id = ?")
            .bind(plan.execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .ok_or_else(|| FlowError::not_found("TaskExecution", plan.execution_id.to_string()))?;
        let execution = row_to_task_execution(&execution_row);

        // Step 7: newly routed node activations, idempotent on retry.
        let mut activations = Vec::new();
        for a in &plan.activations {
            sqlx::query(
                "INSERT INTO node_activations (flow_id, node_id, iteration, activated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT (flow_id, node_id, iteration) DO NOTHING",
            )
            .bind(a.flow_id)
            .bind(a.node_id)
            .bind(a.iteration)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
            let row = sqlx::query(
                "SELECT * FROM node_activations WHERE flow_id = ? AND node_id = ? AND iteration = ?",
            )
            .bind(a.flow_id)
            .bind(a.node_id)
            .bind(a.iteration)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
            activations.push(row_to_node_activation(&row));
        }

        // Step 8/10: flow completion or block, mutually exclusive.
        let mut flow_completed = false;
        let flow_blocked = plan.block_flow;
        if plan.block_flow {
            sqlx::query("UPDATE flows SET status = ? WHERE id = ?")
                .bind(flow_status_to_str(FlowStatus::Blocked))
                .bind(plan.flow_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
        } else if plan.complete_flow {
            sqlx::query("UPDATE flows SET status = ? WHERE id = ?")
                .bind(flow_status_to_str(FlowStatus::Completed))
                .bind(plan.flow_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
            flow_completed = true;
        }

        // Step 9: scheduling commit — supersede then insert.
        let mut schedule_block = None;
        if let Some(commit) = &plan.schedule_commit {
            let current = sqlx::query(
                "SELECT id FROM schedule_blocks WHERE task_id = ? AND flow_id IS ? AND superseded_at IS NULL",
            )
            .bind(commit.task_id)
            .bind(commit.flow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
            let current_id: Option<ScheduleBlockId> = current.map(|r| r.get("id"));

            let metadata_json = commit
                .new_block
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| FlowError::Internal(format!("failed to serialize schedule block metadata: {e}")))?;
            let new_id = sqlx::query(
                "INSERT INTO schedule_blocks
                    (company_id, task_id, flow_id, time_class, start_at, end_at, metadata_json, created_by, created_at, change_request_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&commit.new_block.company_id)
            .bind(commit.new_block.task_id)
            .bind(commit.new_block.flow_id)
            .bind(time_class_to_str(commit.new_block.time_class))
            .bind(commit.new_block.start_at)
            .bind(commit.new_block.end_at)
            .bind(metadata_json)
            .bind(&commit.new_block.created_by)
            .bind(now)
            .bind(commit.new_block.change_request_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?
            .last_insert_rowid();

            if let Some(current_id) = current_id {
                let rows = sqlx::query(
                    "UPDATE schedule_blocks SET superseded_at = ?, superseded_by = ? WHERE id = ? AND superseded_at IS NULL",
                )
                .bind(now)
                .bind(new_id)
                .bind(current_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?
                .rows_affected();
                if rows == 0 {
                    return Err(FlowError::InvalidState(
                        "schedule block was superseded by a concurrent change".into(),
                    ));
                }
            }

            let row = sqlx::query("SELECT * FROM schedule_blocks WHERE id = ?")
                .bind(new_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
            schedule_block = Some(row_to_schedule_block(&row)?);
        }
        if let Some(cr_id) = plan.committed_change_request_id {
            sqlx::query("UPDATE schedule_change_requests SET status = ? WHERE id = ?")
                .bind(change_request_status_to_str(ChangeRequestStatus::Committed))
                .bind(cr_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
        }

        // Step 10: fan-out children, each idempotent via the (group, workflow) unique key.
        let mut child_flows = Vec::new();
        for child in &plan.child_flows {
            sqlx::query(
                "INSERT INTO flows (flow_group_id, workflow_id, workflow_version, status, created_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (flow_group_id, workflow_id) DO NOTHING",
            )
            .bind(child.flow_group_id)
            .bind(child.target_workflow_id)
            .bind(child.target_version)
            .bind(flow_status_to_str(FlowStatus::Active))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
            let row = sqlx::query("SELECT * FROM flows WHERE flow_group_id = ? AND workflow_id = ?")
                .bind(child.flow_group_id)
                .bind(child.target_workflow_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
            let child_flow = row_to_flow(&row)?;
            for node_id in &child.entry_activations {
                sqlx::query(
                    "INSERT INTO node_activations (flow_id, node_id, iteration, activated_at) VALUES (?, ?, 1, ?)
                     ON CONFLICT (flow_id, node_id, iteration) DO NOTHING",
                )
                .bind(child_flow.id)
                .bind(node_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
            }
            child_flows.push(child_flow);
        }

        // Job provisioning (§4.G), unique per flow group.
        let mut job = None;
        if let Some(new_job) = &plan.provision_job {
            sqlx::query(
                "INSERT INTO jobs (company_id, flow_group_id, customer_id, address) VALUES (?, ?, ?, ?)
                 ON CONFLICT (flow_group_id) DO NOTHING",
            )
            .bind(&new_job.company_id)
            .bind(new_job.flow_group_id)
            .bind(&new_job.customer_id)
            .bind(&new_job.address)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_flow_error)?;
            let row = sqlx::query("SELECT * FROM jobs WHERE flow_group_id = ?")
                .bind(new_job.flow_group_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
            job = Some(row_to_job(&row));
        }

        // Commit-via-outcome (§4.H): the detour this outcome resolves.
        if let Some(detour_id) = plan.resolved_detour_id {
            sqlx::query("UPDATE detour_records SET status = ? WHERE id = ?")
                .bind(detour_status_to_str(DetourStatus::Resolved))
                .bind(detour_id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_flow_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_flow_error)?;

        Ok(CommitOutcomeOutput {
            execution: Some(execution),
            activations,
            flow_completed,
            flow_blocked,
            schedule_block,
            child_flows,
            job,
        })
    }
}
