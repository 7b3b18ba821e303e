//! Aggregate confidence and execution tiers.

use serde::{Deserialize, Serialize};

use crate::core::types::{VerificationLayer, VerificationResult};

/// Equal weight per layer.
pub const LAYER_WEIGHT: f64 = 0.2;

/// Tier boundaries (TOML `[thresholds]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Strictly above: eligible for auto-execution.
    pub auto_execute: f64,
    /// At or above: execute with notification.
    pub notify: f64,
    /// At or above: require explicit confirmation. Below: reject.
    pub confirm: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_execute: 0.9,
            notify: 0.7,
            confirm: 0.5,
        }
    }
}

impl Thresholds {
    pub fn is_ordered(&self) -> bool {
        0.0 < self.confirm
            && self.confirm < self.notify
            && self.notify < self.auto_execute
            && self.auto_execute <= 1.0
    }
}

/// What the gate does with a verified leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    AutoExecute,
    ExecuteWithNotice,
    RequireConfirmation,
    Reject,
}

impl ExecutionTier {
    pub fn executes_immediately(self) -> bool {
        matches!(
            self,
            ExecutionTier::AutoExecute | ExecutionTier::ExecuteWithNotice
        )
    }
}

/// Zero on any critical failure, otherwise the weighted sum of layer confidences.
///
/// A missing layer contributes nothing, so partial pipelines never score high.
pub fn aggregate(results: &[VerificationResult]) -> f64 {
    if results
        .iter()
        .any(|r| r.layer.is_critical() && !r.passed)
    {
        return 0.0;
    }
    VerificationLayer::ORDER
        .iter()
        .filter_map(|layer| results.iter().find(|r| r.layer == *layer))
        .map(|r| LAYER_WEIGHT * r.confidence.clamp(0.0, 1.0))
        .sum()
}

pub fn tier_for(confidence: f64, thresholds: &Thresholds, allow_auto: bool) -> ExecutionTier {
    if confidence > thresholds.auto_execute {
        if allow_auto {
            ExecutionTier::AutoExecute
        } else {
            ExecutionTier::RequireConfirmation
        }
    } else if confidence >= thresholds.notify {
        ExecutionTier::ExecuteWithNotice
    } else if confidence >= thresholds.confirm {
        ExecutionTier::RequireConfirmation
    } else {
        ExecutionTier::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(layer: VerificationLayer, passed: bool, confidence: f64) -> VerificationResult {
        VerificationResult {
            layer,
            attempt: 1,
            passed,
            confidence,
            issues: Vec::new(),
            details: String::new(),
            duration_ms: 0,
        }
    }

    fn all_layers(confidences: [f64; 5]) -> Vec<VerificationResult> {
        VerificationLayer::ORDER
            .iter()
            .zip(confidences)
            .map(|(layer, c)| result(*layer, true, c))
            .collect()
    }

    #[test]
    fn aggregate_is_equal_weighted_mean() {
        let results = all_layers([1.0, 0.5, 0.8, 1.0, 0.7]);
        assert!((aggregate(&results) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn critical_failure_zeroes_aggregate() {
        let mut results = all_layers([1.0; 5]);
        results[3].passed = false;
        assert_eq!(aggregate(&results), 0.0);

        let syntax_only = vec![result(VerificationLayer::Syntax, false, 0.0)];
        assert_eq!(aggregate(&syntax_only), 0.0);
    }

    #[test]
    fn advisory_failure_only_lowers_confidence() {
        let mut results = all_layers([1.0; 5]);
        results[1].passed = false;
        results[1].confidence = 0.4;
        assert!((aggregate(&results) - 0.88).abs() < 1e-9);
    }

    #[test]
    fn tiers_follow_thresholds() {
        let t = Thresholds::default();
        assert_eq!(tier_for(0.95, &t, true), ExecutionTier::AutoExecute);
        assert_eq!(tier_for(0.95, &t, false), ExecutionTier::RequireConfirmation);
        assert_eq!(tier_for(0.9, &t, true), ExecutionTier::ExecuteWithNotice);
        assert_eq!(tier_for(0.7, &t, true), ExecutionTier::ExecuteWithNotice);
        assert_eq!(tier_for(0.69, &t, true), ExecutionTier::RequireConfirmation);
        assert_eq!(tier_for(0.5, &t, true), ExecutionTier::RequireConfirmation);
        assert_eq!(tier_for(0.49, &t, true), ExecutionTier::Reject);
        assert!(t.is_ordered());
    }
}
