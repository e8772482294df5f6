//! Policy & signals (spec §4.I): per-flow-group overrides on priority and SLA,
//! and the read-only enrichment derived from them. Pure — never reorders
//! actionable output, only annotates it.

use chrono::{DateTime, Utc};

use crate::error::{FlowError, Result};
use crate::models::{FlowGroupPolicy, JobPriority, TaskId, WorkflowVersion};

/// `computeEffectivePolicy`: validates that every `taskOverrides[].taskId`
/// names a real task in the snapshot before the policy is trusted anywhere
/// downstream.
pub fn compute_effective_policy<'a>(
    policy: &'a FlowGroupPolicy,
    snapshot: &WorkflowVersion,
) -> Result<&'a FlowGroupPolicy> {
    let unknown: Vec<String> = policy
        .task_overrides
        .iter()
        .filter(|o| snapshot.task(o.task_id).is_none())
        .map(|o| o.task_id.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(FlowError::InvalidTaskOverrides(unknown));
    }
    Ok(policy)
}

/// Read-only enrichment for one actionable task, derived from policy plus
/// the clock. Never influences the ordering or membership of the actionable
/// set itself (§4.C, §4.I).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSignals {
    pub effective_sla_hours: Option<i64>,
    pub effective_due_at: Option<DateTime<Utc>>,
    pub is_overdue: bool,
    pub is_due_soon: bool,
    pub job_priority: JobPriority,
}

/// `computeTaskSignals`: SLA/priority derived from `policy` for `task_id`,
/// anchored at `activated_at` and evaluated `as_of` now.
pub fn compute_task_signals(
    policy: &FlowGroupPolicy,
    task_id: TaskId,
    default_sla_hours: Option<i64>,
    activated_at: DateTime<Utc>,
    as_of: DateTime<Utc>,
) -> TaskSignals {
    let override_hours = policy
        .task_overrides
        .iter()
        .find(|o| o.task_id == task_id)
        .and_then(|o| o.sla_hours);
    let effective_sla_hours = override_hours.or(default_sla_hours);

    let mut effective_due_at = effective_sla_hours.map(|h| activated_at + chrono::Duration::hours(h));
    if let (Some(due), Some(group_due)) = (effective_due_at, policy.group_due_at) {
        if group_due < due {
            effective_due_at = Some(group_due);
        }
    }

    let is_overdue = effective_due_at.is_some_and(|due| as_of > due);
    let is_due_soon = effective_due_at.is_some_and(|due| {
        crate::kernel::is_within(as_of, due, chrono::Duration::hours(24))
    });

    TaskSignals {
        effective_sla_hours,
        effective_due_at,
        is_overdue,
        is_due_soon,
        job_priority: policy.job_priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskOverride;
    use chrono::Duration;

    fn base_policy() -> FlowGroupPolicy {
        FlowGroupPolicy {
            flow_group_id: 1,
            job_priority: JobPriority::High,
            group_due_at: None,
            task_overrides: vec![TaskOverride { task_id: 10, sla_hours: Some(4) }],
        }
    }

    #[test]
    fn override_wins_over_default_sla() {
        let policy = base_policy();
        let now = Utc::now();
        let signals = compute_task_signals(&policy, 10, Some(100), now, now);
        assert_eq!(signals.effective_sla_hours, Some(4));
        assert_eq!(signals.effective_due_at, Some(now + Duration::hours(4)));
    }

    #[test]
    fn group_due_at_caps_effective_due() {
        let mut policy = base_policy();
        let now = Utc::now();
        policy.group_due_at = Some(now + Duration::hours(1));
        let signals = compute_task_signals(&policy, 10, None, now, now);
        assert_eq!(signals.effective_due_at, Some(now + Duration::hours(1)));
    }

    #[test]
    fn overdue_and_due_soon_flags() {
        let policy = base_policy();
        let activated_at = Utc::now() - Duration::hours(5);
        let as_of = Utc::now();
        let signals = compute_task_signals(&policy, 10, None, activated_at, as_of);
        assert!(signals.is_overdue);
        assert!(!signals.is_due_soon);
    }

    #[test]
    fn unknown_task_override_is_rejected() {
        let draft = crate::snapshot::DraftGraph {
            workflow_id: 1,
            name: "wf".into(),
            is_non_terminating: false,
            nodes: vec![],
            gates: vec![],
        };
        let snapshot = crate::snapshot::create_workflow_snapshot(&draft, 1);
        let policy = base_policy();
        let err = compute_effective_policy(&policy, &snapshot).unwrap_err();
        assert_eq!(err.code(), "INVALID_TASK_OVERRIDES");
    }
}
