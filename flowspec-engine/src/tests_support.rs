//! Shared fixtures for engine test modules: a fresh in-memory store and a
//! couple of minimal published workflows.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use flowspec_core::models::*;
use flowspec_core::repository::WorkflowRepository;
use flowspec_core::snapshot::{create_workflow_snapshot, DraftGraph, DraftNode};
use flowspec_db::SqliteStore;

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub async fn test_store() -> SqliteStore {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let store = SqliteStore::new(&format!("sqlite::memory:test_{n}"))
        .await
        .unwrap();
    store.migrate().await.unwrap();
    store
}

fn task(id: TaskId, name: &str, outcomes: &[&str], evidence_required: bool) -> SnapshotTask {
    SnapshotTask {
        id,
        name: name.into(),
        instructions: None,
        display_order: 1,
        evidence_required,
        evidence_schema: if evidence_required {
            Some(serde_json::json!({"type": "object"}))
        } else {
            None
        },
        default_sla_hours: None,
        metadata: None,
        outcomes: outcomes.iter().map(|o| Outcome { name: o.to_string() }).collect(),
        cross_flow_dependencies: vec![],
    }
}

/// `N1(T1 --DONE--> N2) ; N2(T2 --FINISH--> terminal)`, a two-node linear
/// acceptance scenario.
pub async fn published_linear_workflow(store: &SqliteStore, company_id: &str) -> WorkflowId {
    let workflow = store.create(&company_id.to_string(), "Linear").await.unwrap();

    let draft = DraftGraph {
        workflow_id: workflow.id,
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
                tasks: vec![task(10, "T1", &["DONE"], false)],
            },
            DraftNode {
                id: 2,
                name: "N2".into(),
                is_entry: false,
                node_kind: NodeKind::Mainline,
                completion_rule: CompletionRule::AllTasksDone,
                specific_tasks: vec![],
                tasks: vec![task(20, "T2", &["FINISH"], false)],
            },
        ],
        gates: vec![Gate {
            source_node_id: 1,
            outcome_name: "DONE".into(),
            target_node_id: Some(2),
        }],
    };

    store.put_draft(&draft).await.unwrap();
    let snapshot = create_workflow_snapshot(&draft, 1);
    store.put_version(&snapshot).await.unwrap();
    store
        .set_published(workflow.id, 1, Utc::now(), &"system".to_string())
        .await
        .unwrap();
    workflow.id
}

/// A single-node workflow whose one task requires evidence before `DONE`.
pub async fn published_workflow_with_evidence_gate(store: &SqliteStore, company_id: &str) -> WorkflowId {
    let workflow = store
        .create(&company_id.to_string(), "EvidenceGated")
        .await
        .unwrap();

    let draft = DraftGraph {
        workflow_id: workflow.id,
        name: "EvidenceGated".into(),
        is_non_terminating: false,
        nodes: vec![DraftNode {
            id: 1,
            name: "N1".into(),
            is_entry: true,
            node_kind: NodeKind::Mainline,
            completion_rule: CompletionRule::AllTasksDone,
            specific_tasks: vec![],
            tasks: vec![task(10, "T1", &["DONE"], true)],
        }],
        gates: vec![],
    };

    store.put_draft(&draft).await.unwrap();
    let snapshot = create_workflow_snapshot(&draft, 1);
    store.put_version(&snapshot).await.unwrap();
    store
        .set_published(workflow.id, 1, Utc::now(), &"system".to_string())
        .await
        .unwrap();
    workflow.id
}
