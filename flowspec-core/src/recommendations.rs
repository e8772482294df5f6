//! Recommendations (spec §4.L): a pure function turning one actionable task's
//! context into a short, deduplicated list of next-step hints for a UI.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub kind: String,
    pub href: Option<String>,
    pub severity: Severity,
    pub reason: Option<String>,
}

/// Context a caller assembles for one actionable task before calling
/// [`recommend`]. Each field independently contributes at most one
/// recommendation; the result is capped at 4 and deduplicated by `kind`.
#[derive(Debug, Clone, Default)]
pub struct RecommendationContext {
    pub evidence_missing: bool,
    pub job_id: Option<String>,
    pub customer_id: Option<String>,
    pub is_overdue: bool,
}

/// Pure function over an actionable task's context (§4.L). Rule order also
/// fixes output order when multiple rules fire.
pub fn recommend(ctx: &RecommendationContext) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if ctx.evidence_missing {
        out.push(Recommendation {
            kind: "open_task".into(),
            href: None,
            severity: Severity::Block,
            reason: Some("evidence is required before an outcome can be recorded".into()),
        });
    }
    if let Some(job_id) = &ctx.job_id {
        out.push(Recommendation {
            kind: "open_job".into(),
            href: Some(format!("/jobs/{job_id}")),
            severity: Severity::Info,
            reason: None,
        });
    }
    if let Some(customer_id) = &ctx.customer_id {
        out.push(Recommendation {
            kind: "open_customer".into(),
            href: Some(format!("/customers/{customer_id}")),
            severity: Severity::Info,
            reason: None,
        });
    }
    if ctx.is_overdue {
        out.push(Recommendation {
            kind: "open_settings".into(),
            href: None,
            severity: Severity::Warn,
            reason: Some("task is overdue".into()),
        });
    }

    let mut seen = std::collections::HashSet::new();
    out.retain(|r| seen.insert(r.kind.clone()));
    out.truncate(4);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_missing_blocks() {
        let recs = recommend(&RecommendationContext {
            evidence_missing: true,
            ..Default::default()
        });
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, "open_task");
        assert_eq!(recs[0].severity, Severity::Block);
    }

    #[test]
    fn caps_at_four_and_dedupes() {
        let recs = recommend(&RecommendationContext {
            evidence_missing: true,
            job_id: Some("j1".into()),
            customer_id: Some("c1".into()),
            is_overdue: true,
        });
        assert_eq!(recs.len(), 4);
        let kinds: Vec<&str> = recs.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["open_task", "open_job", "open_customer", "open_settings"]);
    }

    #[test]
    fn empty_context_yields_no_recommendations() {
        assert!(recommend(&RecommendationContext::default()).is_empty());
    }
}
