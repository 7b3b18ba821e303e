//! Typed errors on the gatekeeper's public surface.

use std::time::Duration;

use thiserror::Error;

use crate::core::sanitize::SanitizeError;
use crate::core::tree::TreeError;
use crate::core::types::{Ceiling, OperationId, OperationStatus, RateCategory, VerificationLayer};
use crate::io::store::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateError {
    /// The oracle could not be used; the conservative default was applied.
    #[error("classification unavailable for {operation_id}: {reason}")]
    ClassificationUnavailable {
        operation_id: OperationId,
        reason: String,
    },
    /// Depth or node bounds reached; the operation was forced to a leaf.
    #[error(
        "decomposition bounds exceeded at {operation_id} (depth {depth}, {nodes} nodes): {reason}"
    )]
    DecompositionBoundsExceeded {
        operation_id: OperationId,
        depth: u32,
        nodes: usize,
        reason: String,
    },
    #[error("operation {operation_id} rejected by {layer} layer: {}", .issues.join("; "))]
    VerificationRejected {
        operation_id: OperationId,
        layer: VerificationLayer,
        issues: Vec<String>,
    },
    #[error(
        "operation {operation_id} held: rate limit for {category} exhausted; retry after {}s",
        .retry_after.as_secs().max(1)
    )]
    RateLimitExceeded {
        operation_id: OperationId,
        category: RateCategory,
        retry_after: Duration,
    },
    #[error("session {session} paused: {ceiling} ceiling reached; explicit continuation required")]
    CircuitBreakerTripped { session: String, ceiling: Ceiling },
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] SanitizeError),
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
    #[error("operation {id} is {status}; cannot {action}")]
    InvalidState {
        id: OperationId,
        status: OperationStatus,
        action: &'static str,
    },
    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("configuration: {0}")]
    Config(String),
}

impl GateError {
    /// Conditions a caller can resolve by waiting or continuing.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            GateError::RateLimitExceeded { .. } | GateError::CircuitBreakerTripped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_names_layer_and_issue() {
        let id = OperationId::new();
        let err = GateError::VerificationRejected {
            operation_id: id,
            layer: VerificationLayer::Safety,
            issues: vec!["fork bomb".to_string()],
        };
        assert_eq!(
            err.to_string(),
            format!("operation {id} rejected by safety layer: fork bomb")
        );
        assert!(!err.is_resumable());
    }

    #[test]
    fn rate_limit_reports_retry_after() {
        let err = GateError::RateLimitExceeded {
            operation_id: OperationId::new(),
            category: RateCategory::Package,
            retry_after: Duration::from_secs(42),
        };
        assert!(err.to_string().ends_with("rate limit for package exhausted; retry after 42s"));
        assert!(err.is_resumable());
    }
}
