//! The caller identity every engine mutator checks against (§6 "Tenant context").

use flowspec_core::models::{ActorId, CompanyId};

/// Resolved per-request identity. The engine never authenticates this itself —
/// it is handed one by the caller and asserts `row.companyId == companyId` on
/// every read and write (§5 "Tenant isolation").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub company_id: CompanyId,
    pub actor_id: ActorId,
    pub member_id: String,
    pub authority: String,
}

impl TenantContext {
    pub fn new(company_id: impl Into<CompanyId>, actor_id: impl Into<ActorId>) -> Self {
        Self {
            company_id: company_id.into(),
            actor_id: actor_id.into(),
            member_id: String::new(),
            authority: String::new(),
        }
    }
}
