//! Safety layer. Critical.
//!
//! Blocked patterns are checked against the realized content, the node's own
//! request and every ancestor request, so editing the content never clears a
//! block. Budgets are only peeked here; they are charged at execution time.

use crate::core::patterns::{blocked_match, sensitive_matches, warning_matches};
use crate::core::tree::AtomicOperation;
use crate::core::types::VerificationLayer;
use crate::verify::{LayerVerdict, VerificationContext, Verifier};

const WARNING_COST: f64 = 0.15;
const MIN_CONFIDENCE: f64 = 0.4;

pub struct SafetyLayer;

impl Verifier for SafetyLayer {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Safety
    }

    fn verify(&self, op: &AtomicOperation, ctx: &VerificationContext<'_>) -> LayerVerdict {
        let blocked = blocked_issues(
            std::iter::once(op.content.as_str())
                .chain(std::iter::once(op.request.as_str()))
                .chain(ctx.lineage.iter().map(String::as_str)),
        );
        if !blocked.is_empty() {
            return LayerVerdict::fail(blocked);
        }

        let issues: Vec<String> = warning_matches(&op.content)
            .into_iter()
            .chain(sensitive_matches(&op.content))
            .map(|rule| rule.issue.to_string())
            .collect();
        let confidence = (1.0 - WARNING_COST * issues.len() as f64).max(MIN_CONFIDENCE);
        let mut verdict = LayerVerdict::pass(confidence);
        verdict.issues = issues;

        if let Err(exhausted) = ctx.governor.check(ctx.session, &op.content, ctx.now) {
            verdict.issues.push(exhausted.to_string());
            verdict.exhausted = Some(exhausted);
        }
        verdict
    }
}

/// Distinct blocked-rule issues across `texts`, in first-seen order.
pub fn blocked_issues<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut issues: Vec<String> = Vec::new();
    for text in texts {
        if let Some(rule) = blocked_match(text)
            && !issues.iter().any(|i| i == rule.issue)
        {
            issues.push(rule.issue.to_string());
        }
    }
    issues
}
