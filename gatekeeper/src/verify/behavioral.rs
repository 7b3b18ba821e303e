//! Behavioral layer: scope, cost and a non-mutating dry run.

use std::time::Duration;

use crate::core::patterns::{
    broad_matches, rate_categories, resource_heavy_matches, system_wide_matches,
};
use crate::core::tree::AtomicOperation;
use crate::core::types::{Axes, Destination, RateCategory, Semantics, VerificationLayer};
use crate::io::dry_run::DryRunOutcome;
use crate::verify::{LayerVerdict, VerificationContext, Verifier, is_shell_like};

pub struct BehavioralLayer;

impl Verifier for BehavioralLayer {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Behavioral
    }

    fn verify(&self, op: &AtomicOperation, ctx: &VerificationContext<'_>) -> LayerVerdict {
        let content = op.content.as_str();
        let axes = op.axes();
        let mut issues: Vec<String> = broad_matches(content)
            .into_iter()
            .map(|r| format!("broad scope: {}", r.issue))
            .chain(
                system_wide_matches(content)
                    .into_iter()
                    .map(|r| format!("system-wide: {}", r.issue)),
            )
            .chain(
                resource_heavy_matches(content)
                    .into_iter()
                    .map(|r| format!("resource-intensive: {}", r.issue)),
            )
            .collect();

        let estimate = estimate_duration(content, axes);
        if estimate > ctx.remaining {
            issues.push(format!(
                "estimated {}s exceeds remaining session budget of {}s",
                estimate.as_secs(),
                ctx.remaining.as_secs()
            ));
        }

        let mut details = format!("estimated duration {}s", estimate.as_secs());
        if is_shell_like(content)
            && (axes.destination == Destination::Process || axes.semantics == Semantics::Execute)
        {
            match ctx.dry_runner.dry_run(content, ctx.dry_run_timeout) {
                DryRunOutcome::Clean => details.push_str("; dry run clean"),
                DryRunOutcome::Problems(msg) => issues.push(format!("dry run: {msg}")),
                DryRunOutcome::TimedOut => issues.push("dry run timed out".to_string()),
                DryRunOutcome::Unsupported => details.push_str("; dry run unsupported"),
            }
        }

        let confidence = (1.0 - 0.1 * issues.len() as f64).max(0.3);
        LayerVerdict::advisory(confidence, issues).with_details(details)
    }
}

/// Rough wall-clock cost of running `content`.
pub fn estimate_duration(content: &str, axes: Axes) -> Duration {
    let by_category = rate_categories(content)
        .into_iter()
        .map(|category| match category {
            RateCategory::Package => 300,
            RateCategory::Container => 60,
            RateCategory::Service => 30,
            RateCategory::Sudo | RateCategory::Approval => 10,
        })
        .max();
    let baseline = if axes.semantics == Semantics::Execute {
        10
    } else {
        5
    };
    Duration::from_secs(by_category.unwrap_or(0).max(baseline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Consumer;

    #[test]
    fn estimates_follow_category() {
        let exec = Axes::new(Destination::Process, Consumer::Machine, Semantics::Execute);
        assert_eq!(
            estimate_duration("apt-get install nginx", exec),
            Duration::from_secs(300)
        );
        assert_eq!(
            estimate_duration("docker restart web", exec),
            Duration::from_secs(60)
        );
        assert_eq!(
            estimate_duration("systemctl restart nginx", exec),
            Duration::from_secs(30)
        );
        assert_eq!(estimate_duration("touch /tmp/x", exec), Duration::from_secs(10));
        assert_eq!(
            estimate_duration("show memory usage", Axes::CONSERVATIVE),
            Duration::from_secs(5)
        );
    }
}
