//! Feedback collector: user judgments and execution outcomes.
//!
//! Feedback is appended as its own record and never rewrites the operation it
//! refers to. Few-shot examples and metrics are recomputed from the store on
//! every call.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::examples::{
    ExampleSource, FewShotExample, PassRecord, effective_pass, select_examples,
};
use crate::core::types::{Axes, ExecutionSignal, FeedbackKind, OperationId, UserFeedback};
use crate::error::GateError;
use crate::io::audit::{AuditEvent, AuditLog};
use crate::io::store::{Record, RecordFilter, RecordKind, Store};

/// How often users agreed with the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationMetrics {
    pub total_operations: usize,
    pub feedback_count: usize,
    pub approvals: usize,
    pub corrections: usize,
    pub rejections: usize,
    /// Approvals over all feedback; 0 without feedback.
    pub accuracy: f64,
    pub correction_rate: f64,
    pub mean_time_to_decision_ms: Option<u64>,
}

pub struct FeedbackCollector {
    store: Arc<dyn Store>,
    audit: Arc<AuditLog>,
}

impl FeedbackCollector {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Record an approval, correction or rejection of a classified operation.
    #[instrument(skip_all, fields(op = %operation_id, kind = %kind))]
    pub fn record(
        &self,
        operation_id: OperationId,
        kind: FeedbackKind,
        corrected: Option<Axes>,
        rationale: Option<String>,
    ) -> Result<UserFeedback, GateError> {
        let records = self.store.query(&RecordFilter::operation(operation_id))?;
        let (request, created_at) = records
            .iter()
            .find_map(|r| match r {
                Record::Operation {
                    request,
                    created_at,
                    ..
                } => Some((request.clone(), *created_at)),
                _ => None,
            })
            .ok_or(GateError::UnknownOperation(operation_id))?;
        let passes: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                Record::Pass { pass, .. } => Some(pass),
                _ => None,
            })
            .collect();
        let original = effective_pass(passes.iter().copied())
            .ok_or_else(|| {
                GateError::InvalidFeedback(format!("operation {operation_id} was never classified"))
            })?
            .axes;

        match (kind, corrected) {
            (FeedbackKind::Correction, None) => {
                return Err(GateError::InvalidFeedback(
                    "a correction must carry the corrected axes".to_string(),
                ));
            }
            (FeedbackKind::Correction, Some(axes)) if axes == original => {
                return Err(GateError::InvalidFeedback(format!(
                    "correction repeats the original classification {original}"
                )));
            }
            (FeedbackKind::Approval | FeedbackKind::Rejection, Some(_)) => {
                return Err(GateError::InvalidFeedback(format!(
                    "{kind} feedback must not carry axes"
                )));
            }
            _ => {}
        }

        let recorded_at = Utc::now();
        let time_to_decision_ms = (kind == FeedbackKind::Approval).then(|| {
            u64::try_from((recorded_at - created_at).num_milliseconds()).unwrap_or(0)
        });
        let feedback = UserFeedback {
            id: Uuid::new_v4(),
            operation_id,
            request,
            kind,
            original,
            corrected,
            rationale,
            time_to_decision_ms,
            recorded_at,
        };
        self.store.insert(Record::Feedback(feedback.clone()))?;
        self.audit
            .record(None, Some(operation_id), AuditEvent::Feedback { kind });
        info!("feedback recorded");
        Ok(feedback)
    }

    /// Store the executor's outcome as a behavioral signal.
    pub fn record_execution(
        &self,
        operation_id: OperationId,
        attempt: u32,
        success: bool,
    ) -> Result<ExecutionSignal, GateError> {
        let signal = ExecutionSignal {
            operation_id,
            attempt,
            success,
            recorded_at: Utc::now(),
        };
        self.store.insert(Record::ExecutionSignal(signal.clone()))?;
        Ok(signal)
    }

    /// Few-shot examples for the next classifier call.
    pub fn examples(&self, limit: usize) -> Result<Vec<FewShotExample>, GateError> {
        let passes: Vec<PassRecord> = self
            .store
            .query(&RecordFilter::kind(RecordKind::Pass))?
            .into_iter()
            .filter_map(|r| match r {
                Record::Pass {
                    operation_id,
                    request,
                    pass,
                    recorded_at,
                } => Some(PassRecord {
                    operation_id,
                    request,
                    pass,
                    recorded_at,
                }),
                _ => None,
            })
            .collect();
        let feedback = self.feedback()?;
        let signals: Vec<ExecutionSignal> = self
            .store
            .query(&RecordFilter::kind(RecordKind::ExecutionSignal))?
            .into_iter()
            .filter_map(|r| match r {
                Record::ExecutionSignal(signal) => Some(signal),
                _ => None,
            })
            .collect();
        Ok(select_examples(&passes, &feedback, &signals, limit))
    }

    /// Every correction on record, newest first.
    pub fn corrections(&self) -> Result<Vec<FewShotExample>, GateError> {
        let mut out: Vec<FewShotExample> = self
            .feedback()?
            .into_iter()
            .filter(|fb| fb.kind == FeedbackKind::Correction)
            .filter_map(|fb| {
                fb.corrected.map(|axes| FewShotExample {
                    request: fb.request,
                    axes,
                    source: ExampleSource::Correction,
                    recorded_at: fb.recorded_at,
                })
            })
            .collect();
        out.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(out)
    }

    /// Classification metrics over every operation and feedback record.
    pub fn metrics(&self) -> Result<ClassificationMetrics, GateError> {
        let total_operations = self
            .store
            .query(&RecordFilter::kind(RecordKind::Operation))?
            .len();
        let feedback = self.feedback()?;
        let count = |kind: FeedbackKind| feedback.iter().filter(|fb| fb.kind == kind).count();
        let approvals = count(FeedbackKind::Approval);
        let corrections = count(FeedbackKind::Correction);
        let rejections = count(FeedbackKind::Rejection);
        let ratio = |n: usize| {
            if feedback.is_empty() {
                0.0
            } else {
                n as f64 / feedback.len() as f64
            }
        };
        let decisions: Vec<u64> = feedback
            .iter()
            .filter_map(|fb| fb.time_to_decision_ms)
            .collect();
        let mean_time_to_decision_ms = (!decisions.is_empty())
            .then(|| decisions.iter().sum::<u64>() / decisions.len() as u64);
        Ok(ClassificationMetrics {
            total_operations,
            feedback_count: feedback.len(),
            approvals,
            corrections,
            rejections,
            accuracy: ratio(approvals),
            correction_rate: ratio(corrections),
            mean_time_to_decision_ms,
        })
    }

    fn feedback(&self) -> Result<Vec<UserFeedback>, GateError> {
        Ok(self
            .store
            .query(&RecordFilter::kind(RecordKind::Feedback))?
            .into_iter()
            .filter_map(|r| match r {
                Record::Feedback(fb) => Some(fb),
                _ => None,
            })
            .collect())
    }
}
