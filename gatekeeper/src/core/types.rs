//! Shared deterministic types for gatekeeper core logic.
//!
//! The three classification axes are closed enums. Anything the oracle says
//! that does not parse into one of them is rejected, never passed through.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Where the result of an operation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Stream,
    File,
    Process,
}

/// Who consumes the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consumer {
    Human,
    Machine,
}

/// What the operation does with its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    Read,
    Interpret,
    Execute,
}

/// An axis value outside the closed taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {axis} value '{value}'")]
pub struct UnknownAxisValue {
    pub axis: &'static str,
    pub value: String,
}

macro_rules! axis_enum {
    ($ty:ident, $axis:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownAxisValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(UnknownAxisValue {
                        axis: $axis,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

axis_enum!(Destination, "destination", { Stream => "stream", File => "file", Process => "process" });
axis_enum!(Consumer, "consumer", { Human => "human", Machine => "machine" });
axis_enum!(Semantics, "semantics", { Read => "read", Interpret => "interpret", Execute => "execute" });

/// A complete three-axis classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Axes {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
}

impl Axes {
    /// Fallback used whenever the oracle cannot be trusted.
    pub const CONSERVATIVE: Axes = Axes {
        destination: Destination::Stream,
        consumer: Consumer::Human,
        semantics: Semantics::Read,
    };

    pub fn new(destination: Destination, consumer: Consumer, semantics: Semantics) -> Self {
        Self {
            destination,
            consumer,
            semantics,
        }
    }

    /// True for operations that spawn or mutate something.
    pub fn is_privileged(&self) -> bool {
        self.semantics == Semantics::Execute || self.destination != Destination::Stream
    }
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.destination, self.consumer, self.semantics)
    }
}

/// Stable operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Classifying,
    /// Parent waiting on its children.
    Decomposed,
    AwaitingApproval,
    /// Rate limit or paused session; resumable.
    Held,
    Executing,
    Complete,
    Failed,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Classifying => "classifying",
            OperationStatus::Decomposed => "decomposed",
            OperationStatus::AwaitingApproval => "awaiting_approval",
            OperationStatus::Held => "held",
            OperationStatus::Executing => "executing",
            OperationStatus::Complete => "complete",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Complete | OperationStatus::Failed)
    }

    /// Allowed lifecycle edges. Terminal states have none.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus as S;
        match self {
            S::Classifying => matches!(
                next,
                S::Decomposed | S::AwaitingApproval | S::Held | S::Executing | S::Failed
            ),
            S::Decomposed => matches!(next, S::Complete | S::Failed),
            S::AwaitingApproval | S::Held => matches!(
                next,
                S::AwaitingApproval | S::Held | S::Executing | S::Failed
            ),
            S::Executing => matches!(next, S::Complete | S::Failed),
            S::Complete | S::Failed => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification layers in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLayer {
    Syntax,
    Semantic,
    Behavioral,
    Safety,
    Intent,
}

impl VerificationLayer {
    pub const ORDER: [VerificationLayer; 5] = [
        VerificationLayer::Syntax,
        VerificationLayer::Semantic,
        VerificationLayer::Behavioral,
        VerificationLayer::Safety,
        VerificationLayer::Intent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationLayer::Syntax => "syntax",
            VerificationLayer::Semantic => "semantic",
            VerificationLayer::Behavioral => "behavioral",
            VerificationLayer::Safety => "safety",
            VerificationLayer::Intent => "intent",
        }
    }

    /// Early-exit layers: failure aborts the pipeline.
    pub fn is_critical(self) -> bool {
        matches!(self, VerificationLayer::Syntax | VerificationLayer::Safety)
    }
}

impl fmt::Display for VerificationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One layer's verdict for one attempt. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub layer: VerificationLayer,
    pub attempt: u32,
    pub passed: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    pub duration_ms: u64,
}

/// Why a classification pass was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Initial,
    /// Marker appended to a parent after a successful decomposition.
    Decomposed,
    /// Conservative default forced by decomposition bounds.
    ForcedLeaf,
}

/// One classification attempt. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationPass {
    pub pass_number: u32,
    pub kind: PassKind,
    pub indicators: Vec<String>,
    pub axes: Axes,
    pub confident: bool,
    pub rationale: String,
    /// Set when the oracle could not be used and the conservative default applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// Category of a sliding rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateCategory {
    Sudo,
    Service,
    Container,
    Package,
    Approval,
}

impl RateCategory {
    pub const ALL: [RateCategory; 5] = [
        RateCategory::Sudo,
        RateCategory::Service,
        RateCategory::Container,
        RateCategory::Package,
        RateCategory::Approval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateCategory::Sudo => "sudo",
            RateCategory::Service => "service",
            RateCategory::Container => "container",
            RateCategory::Package => "package",
            RateCategory::Approval => "approval",
        }
    }
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit-breaker ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    Operations,
    WallClock,
    Escalations,
}

impl Ceiling {
    pub fn as_str(self) -> &'static str {
        match self {
            Ceiling::Operations => "operations",
            Ceiling::WallClock => "wall_clock",
            Ceiling::Escalations => "escalations",
        }
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation is held instead of failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldReason {
    RateLimited {
        category: RateCategory,
        #[serde(with = "duration_ms")]
        retry_after: Duration,
    },
    SessionPaused {
        ceiling: Ceiling,
    },
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::RateLimited {
                category,
                retry_after,
            } => write!(
                f,
                "rate limit for {category} exhausted; retry after {}s",
                retry_after.as_secs().max(1)
            ),
            HoldReason::SessionPaused { ceiling } => write!(
                f,
                "session paused: {ceiling} ceiling reached; explicit continuation required"
            ),
        }
    }
}

/// Why an operation ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Rejected {
        layer: VerificationLayer,
        issues: Vec<String>,
    },
    LowConfidence {
        confidence: f64,
        issues: Vec<String>,
    },
    ExecutionFailed {
        detail: String,
    },
    Cancelled,
    UserRejected,
    ChildFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected { layer, issues } => {
                write!(f, "rejected by {layer} layer: {}", issues.join("; "))
            }
            FailureReason::LowConfidence { confidence, issues } => {
                write!(f, "confidence {confidence:.2} below execution threshold")?;
                if !issues.is_empty() {
                    write!(f, ": {}", issues.join("; "))?;
                }
                Ok(())
            }
            FailureReason::ExecutionFailed { detail } => write!(f, "execution failed: {detail}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::UserRejected => f.write_str("rejected by user"),
            FailureReason::ChildFailed => f.write_str("child failed"),
        }
    }
}

/// Outcome reported by the execution sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
}

/// Post-execution human judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Approval,
    Correction,
    Rejection,
}

impl fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeedbackKind::Approval => "approval",
            FeedbackKind::Correction => "correction",
            FeedbackKind::Rejection => "rejection",
        })
    }
}

/// Append-only feedback record. Never mutates the operation it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub id: Uuid,
    pub operation_id: OperationId,
    pub request: String,
    pub kind: FeedbackKind,
    pub original: Axes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected: Option<Axes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Milliseconds from the operation's creation to its approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_decision_ms: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

/// Executor success or failure, fed back as a behavioral signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSignal {
    pub operation_id: OperationId,
    pub attempt: u32,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_parse_is_case_insensitive_and_closed() {
        assert_eq!("  Process ".parse::<Destination>(), Ok(Destination::Process));
        assert_eq!("MACHINE".parse::<Consumer>(), Ok(Consumer::Machine));
        let err = "delete".parse::<Semantics>().expect_err("outside enum");
        assert_eq!(err.axis, "semantics");
        assert_eq!(err.to_string(), "unknown semantics value 'delete'");
    }

    #[test]
    fn conservative_default_is_stream_human_read() {
        assert_eq!(Axes::CONSERVATIVE.to_string(), "stream/human/read");
        assert!(!Axes::CONSERVATIVE.is_privileged());
    }

    /// Terminal statuses never transition; parents only resolve to terminal.
    #[test]
    fn status_transitions_follow_lifecycle() {
        use OperationStatus as S;
        assert!(S::Classifying.can_transition_to(S::Executing));
        assert!(S::Held.can_transition_to(S::Executing));
        assert!(S::Decomposed.can_transition_to(S::Complete));
        assert!(!S::Decomposed.can_transition_to(S::Executing));
        assert!(!S::Failed.can_transition_to(S::AwaitingApproval));
        assert!(!S::Complete.can_transition_to(S::Failed));
    }

    #[test]
    fn only_syntax_and_safety_are_critical() {
        let critical: Vec<_> = VerificationLayer::ORDER
            .iter()
            .filter(|l| l.is_critical())
            .copied()
            .collect();
        assert_eq!(
            critical,
            vec![VerificationLayer::Syntax, VerificationLayer::Safety]
        );
    }

    #[test]
    fn failure_reason_names_layer_and_issue() {
        let reason = FailureReason::Rejected {
            layer: VerificationLayer::Safety,
            issues: vec!["recursive deletion of root".to_string()],
        };
        assert_eq!(
            reason.to_string(),
            "rejected by safety layer: recursive deletion of root"
        );
    }

    #[test]
    fn hold_reason_serializes_retry_after_in_millis() {
        let hold = HoldReason::RateLimited {
            category: RateCategory::Package,
            retry_after: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&hold).expect("serialize");
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["retry_after"], 1500);
        let back: HoldReason = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, hold);
    }
}
