//! Five-layer verification pipeline.
//!
//! Layers run in a fixed order: syntax, semantic, behavioral, safety, intent.
//! Syntax and safety are critical: a failure there stops the pipeline and the
//! operation can only be rejected. The other three are advisory and only move
//! confidence. The safety layer also peeks at the execution budgets; an
//! exhausted budget stops the pipeline with a hold instead of a rejection.

pub mod behavioral;
pub mod intent;
pub mod safety;
pub mod semantic;
pub mod syntax;

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use crate::core::confidence::aggregate;
use crate::core::examples::FewShotExample;
use crate::core::patterns::{self, blocked_match};
use crate::core::sanitize::{SanitizeError, sanitize_request};
use crate::core::tree::AtomicOperation;
use crate::core::types::{VerificationLayer, VerificationResult};
use crate::io::dry_run::DryRunner;
use crate::io::environment::Environment;
use crate::io::memory::MemoryProvider;
use crate::safety::{Exhausted, SafetyGovernor};
use crate::session::CancelToken;

/// Advisory layers report failure below this confidence.
pub const ADVISORY_PASS: f64 = 0.5;

/// One layer's finding before it is stamped with attempt and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerVerdict {
    pub passed: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub details: String,
    /// Set only by the safety layer when a budget refuses the operation.
    pub exhausted: Option<Exhausted>,
}

impl LayerVerdict {
    pub fn pass(confidence: f64) -> Self {
        Self {
            passed: true,
            confidence,
            issues: Vec::new(),
            details: String::new(),
            exhausted: None,
        }
    }

    pub fn fail(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            confidence: 0.0,
            issues,
            details: String::new(),
            exhausted: None,
        }
    }

    /// Advisory verdict: passes while confidence stays at or above [`ADVISORY_PASS`].
    pub fn advisory(confidence: f64, issues: Vec<String>) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            passed: confidence >= ADVISORY_PASS,
            confidence,
            issues,
            details: String::new(),
            exhausted: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Collaborators and budgets visible to every layer.
pub struct VerificationContext<'a> {
    pub session: &'a str,
    pub governor: &'a SafetyGovernor,
    pub environment: &'a dyn Environment,
    pub dry_runner: &'a dyn DryRunner,
    pub memory: Option<&'a dyn MemoryProvider>,
    /// Correction examples from the feedback history.
    pub corrections: &'a [FewShotExample],
    /// Requests of every ancestor, nearest first.
    pub lineage: Vec<String>,
    /// Wall-clock budget left in the session.
    pub remaining: Duration,
    pub dry_run_timeout: Duration,
    pub max_bytes: usize,
    pub now: Instant,
}

pub trait Verifier: Send + Sync {
    fn layer(&self) -> VerificationLayer;
    fn verify(&self, op: &AtomicOperation, ctx: &VerificationContext<'_>) -> LayerVerdict;
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub results: Vec<VerificationResult>,
    /// First critical layer that failed, with its issues.
    pub blocking: Option<(VerificationLayer, Vec<String>)>,
    pub exhausted: Option<Exhausted>,
    /// Aggregate over `results`; zero when blocked.
    pub confidence: f64,
    pub cancelled: bool,
}

impl PipelineOutcome {
    /// Issues from every layer, in layer order.
    pub fn issues(&self) -> Vec<String> {
        self.results
            .iter()
            .flat_map(|r| r.issues.iter().cloned())
            .collect()
    }
}

pub struct Pipeline {
    layers: Vec<Box<dyn Verifier>>,
}

impl Pipeline {
    pub fn standard() -> Self {
        Self {
            layers: vec![
                Box::new(syntax::SyntaxLayer),
                Box::new(semantic::SemanticLayer),
                Box::new(behavioral::BehavioralLayer),
                Box::new(safety::SafetyLayer),
                Box::new(intent::IntentLayer),
            ],
        }
    }

    #[instrument(skip_all, fields(op = %op.id, attempt))]
    pub fn run(
        &self,
        op: &AtomicOperation,
        ctx: &VerificationContext<'_>,
        attempt: u32,
        cancel: &CancelToken,
    ) -> PipelineOutcome {
        let mut outcome = PipelineOutcome {
            results: Vec::with_capacity(self.layers.len()),
            blocking: None,
            exhausted: None,
            confidence: 0.0,
            cancelled: false,
        };
        for layer in &self.layers {
            if cancel.is_cancelled() {
                debug!(layer = layer.layer().as_str(), "cancelled before layer");
                outcome.cancelled = true;
                return outcome;
            }
            let started = Instant::now();
            let verdict = layer.verify(op, ctx);
            let result = VerificationResult {
                layer: layer.layer(),
                attempt,
                passed: verdict.passed,
                confidence: verdict.confidence,
                issues: verdict.issues,
                details: verdict.details,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            debug!(
                layer = result.layer.as_str(),
                passed = result.passed,
                confidence = result.confidence,
                "layer verdict"
            );
            let critical_failure = result.layer.is_critical() && !result.passed;
            if critical_failure {
                info!(layer = result.layer.as_str(), issues = ?result.issues, "operation blocked");
                outcome.blocking = Some((result.layer, result.issues.clone()));
            }
            outcome.results.push(result);
            if critical_failure {
                break;
            }
            if let Some(exhausted) = verdict.exhausted {
                info!(reason = %exhausted, "execution budget exhausted");
                outcome.exhausted = Some(exhausted);
                break;
            }
        }
        outcome.confidence = aggregate(&outcome.results);
        outcome
    }
}

/// Result of [`screen`]: a verdict without oracle, environment or budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenVerdict {
    Clear { warnings: Vec<String> },
    Blocked { layer: VerificationLayer, issues: Vec<String> },
}

/// Offline screen: sanitizer, syntax layer and the safety pattern tables.
pub fn screen(text: &str, max_bytes: usize) -> Result<ScreenVerdict, SanitizeError> {
    let sanitized = sanitize_request(text, max_bytes)?;
    let syntax = syntax::check_syntax(&sanitized.text, max_bytes);
    if !syntax.passed {
        return Ok(ScreenVerdict::Blocked {
            layer: VerificationLayer::Syntax,
            issues: syntax.issues,
        });
    }
    if let Some(rule) = blocked_match(&sanitized.text) {
        return Ok(ScreenVerdict::Blocked {
            layer: VerificationLayer::Safety,
            issues: vec![rule.issue.to_string()],
        });
    }
    let mut warnings = syntax.issues;
    warnings.extend(
        patterns::warning_matches(&sanitized.text)
            .into_iter()
            .chain(patterns::sensitive_matches(&sanitized.text))
            .map(|rule| rule.issue.to_string()),
    );
    warnings.extend(
        sanitized
            .injection_signatures
            .iter()
            .map(|sig| format!("prompt injection signature: {sig}")),
    );
    Ok(ScreenVerdict::Clear { warnings })
}

/// Commands look like shell when they start with a non-English tool or carry shell syntax.
pub(crate) fn is_shell_like(content: &str) -> bool {
    let first = content.split_whitespace().next().unwrap_or_default();
    if first.is_empty() {
        return false;
    }
    let has_syntax = content.contains(['|', ';', '>', '<', '&', '$', '`'])
        || content.split_whitespace().any(|t| t.starts_with('-') && t.len() > 1);
    has_syntax || !crate::core::compound::is_action_verb(first) || first.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_blocks_root_deletion_at_safety() {
        let verdict = screen("sudo rm -rf /", 4096).expect("sanitized");
        assert_eq!(
            verdict,
            ScreenVerdict::Blocked {
                layer: VerificationLayer::Safety,
                issues: vec!["recursive deletion of root".to_string()],
            }
        );
    }

    #[test]
    fn screen_blocks_injection_at_syntax() {
        let verdict = screen("ls $(cat /tmp/x)", 4096).expect("sanitized");
        assert!(matches!(
            verdict,
            ScreenVerdict::Blocked {
                layer: VerificationLayer::Syntax,
                ..
            }
        ));
    }

    #[test]
    fn screen_reports_warnings_for_clear_requests() {
        let ScreenVerdict::Clear { warnings } =
            screen("sudo systemctl stop nginx", 4096).expect("sanitized")
        else {
            panic!("expected clear verdict");
        };
        assert!(warnings.contains(&"service stop or disable".to_string()));
    }

    #[test]
    fn screen_rejects_empty_input() {
        assert_eq!(screen("   ", 4096), Err(SanitizeError::Empty));
    }

    #[test]
    fn shell_like_detection() {
        assert!(is_shell_like("ls -la /tmp"));
        assert!(is_shell_like("systemctl restart nginx"));
        assert!(!is_shell_like("show memory usage"));
        assert!(is_shell_like("cat /etc/hosts | wc -l"));
    }
}
