use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Stable error taxonomy for the FlowSpec engine (spec §7).
///
/// Each variant surfaces through [`FlowError::code`] as the `error.code` of
/// the `{success, data?, error:{code, message, details?}}` envelope (§6).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    #[error("workflow is not published: {0}")]
    WorkflowNotPublished(String),

    #[error("workflow is not editable in its current state: {0}")]
    WorkflowNotEditable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0:?}")]
    ValidationFailed(Vec<String>),

    #[error("task {0} requires an evidence schema")]
    MissingEvidenceSchema(String),

    #[error("task {0} requires evidence before an outcome can be recorded")]
    EvidenceRequired(String),

    #[error("scheduling data missing for task {0}")]
    SchedulingDataMissing(String),

    #[error("invalid time range: start {0} is not before end {1}")]
    InvalidTimeRange(String, String),

    #[error("workflow {0} has no anchor task")]
    AnchorTaskMissing(String),

    #[error("customer mismatch: expected {0}, got {1}")]
    CustomerMismatch(String, String),

    #[error("flow group not found: {0}")]
    FlowGroupNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists for flow group {0}")]
    JobAlreadyExists(String),

    #[error("forbidden")]
    Forbidden,

    #[error("no membership for company {0}")]
    NoMembership(String),

    #[error("published workflow version is immutable")]
    PublishedImmutable,

    #[error("invalid task overrides: {0:?}")]
    InvalidTaskOverrides(Vec<String>),

    #[error("invalid job priority: {0}")]
    InvalidJobPriority(String),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} {id} not found"))
    }

    pub fn empty_field(field: &str) -> Self {
        Self::ValidationFailed(vec![format!("field '{field}' cannot be empty")])
    }

    /// Stable error code surfaced in the `{error:{code,...}}` envelope (§6, §7).
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowNotPublished(_) => "WORKFLOW_NOT_PUBLISHED",
            Self::WorkflowNotEditable(_) => "WORKFLOW_NOT_EDITABLE",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::MissingEvidenceSchema(_) => "MISSING_EVIDENCE_SCHEMA",
            Self::EvidenceRequired(_) => "EVIDENCE_REQUIRED",
            Self::SchedulingDataMissing(_) => "SCHEDULING_DATA_MISSING",
            Self::InvalidTimeRange(_, _) => "INVALID_TIME_RANGE",
            Self::AnchorTaskMissing(_) => "ANCHOR_TASK_MISSING",
            Self::CustomerMismatch(_, _) => "CUSTOMER_MISMATCH",
            Self::FlowGroupNotFound(_) => "FLOW_GROUP_NOT_FOUND",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::JobAlreadyExists(_) => "JOB_ALREADY_EXISTS",
            Self::Forbidden => "FORBIDDEN",
            Self::NoMembership(_) => "NO_MEMBERSHIP",
            Self::PublishedImmutable => "PUBLISHED_IMMUTABLE",
            Self::InvalidTaskOverrides(_) => "INVALID_TASK_OVERRIDES",
            Self::InvalidJobPriority(_) => "INVALID_JOB_PRIORITY",
            Self::EventNotFound(_) => "EVENT_NOT_FOUND",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Tenant-ownership failures are uniformly reported as FORBIDDEN (§7).
    pub fn is_tenant_violation(&self) -> bool {
        matches!(self, Self::Forbidden | Self::NoMembership(_))
    }

    /// Recoverable errors (validation/permission) are caller's to handle;
    /// fatal ones (invariant violations) crash the transaction (§7).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Database(_) | Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(FlowError::not_found("Flow", 7).code(), "NOT_FOUND");
        assert_eq!(FlowError::Forbidden.code(), "FORBIDDEN");
        assert_eq!(FlowError::PublishedImmutable.code(), "PUBLISHED_IMMUTABLE");
    }

    #[test]
    fn tenant_violations_are_flagged() {
        assert!(FlowError::Forbidden.is_tenant_violation());
        assert!(FlowError::NoMembership("acme".into()).is_tenant_violation());
        assert!(!FlowError::NotFound("x".into()).is_tenant_violation());
    }

    #[test]
    fn database_errors_are_not_recoverable() {
        assert!(!FlowError::Database("down".into()).is_recoverable());
        assert!(FlowError::Forbidden.is_recoverable());
    }
}
