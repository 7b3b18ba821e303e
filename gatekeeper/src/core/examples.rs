//! Few-shot example selection.
//!
//! Selection is a pure function of recorded passes, feedback and execution
//! signals. It is recomputed for every classifier call; nothing here caches.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::similarity::normalize;
use crate::core::types::{
    Axes, ClassificationPass, ExecutionSignal, FeedbackKind, OperationId, PassKind, UserFeedback,
};

/// Hard cap on examples in a classifier prompt.
pub const MAX_EXAMPLES: usize = 10;

/// A stored classification pass with the request it classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub operation_id: OperationId,
    pub request: String,
    pub pass: ClassificationPass,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExampleSource {
    Correction,
    Approval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub request: String,
    pub axes: Axes,
    pub source: ExampleSource,
    pub recorded_at: DateTime<Utc>,
}

/// The pass an operation was acted on: latest pass that is not a decomposition marker.
pub fn effective_pass<'a>(
    passes: impl IntoIterator<Item = &'a ClassificationPass>,
) -> Option<&'a ClassificationPass> {
    passes
        .into_iter()
        .filter(|p| p.kind != PassKind::Decomposed)
        .max_by_key(|p| p.pass_number)
}

/// Select up to `limit` examples, most recent first.
///
/// Corrections replace the example they correct. Approvals count only for
/// confident passes whose execution did not fail. Rejected operations never
/// contribute.
pub fn select_examples(
    passes: &[PassRecord],
    feedback: &[UserFeedback],
    signals: &[ExecutionSignal],
    limit: usize,
) -> Vec<FewShotExample> {
    let limit = limit.min(MAX_EXAMPLES);

    let mut by_operation: BTreeMap<OperationId, Vec<&PassRecord>> = BTreeMap::new();
    for record in passes {
        by_operation
            .entry(record.operation_id)
            .or_default()
            .push(record);
    }
    let failed: HashSet<OperationId> = signals
        .iter()
        .filter(|s| !s.success)
        .map(|s| s.operation_id)
        .collect();
    let ops_with = |kind: FeedbackKind| -> BTreeSet<OperationId> {
        feedback
            .iter()
            .filter(|f| f.kind == kind)
            .map(|f| f.operation_id)
            .collect()
    };
    let corrected = ops_with(FeedbackKind::Correction);
    let rejected = ops_with(FeedbackKind::Rejection);

    let mut candidates = Vec::new();
    for fb in feedback {
        match fb.kind {
            FeedbackKind::Correction => {
                if let Some(axes) = fb.corrected {
                    candidates.push(FewShotExample {
                        request: fb.request.clone(),
                        axes,
                        source: ExampleSource::Correction,
                        recorded_at: fb.recorded_at,
                    });
                }
            }
            FeedbackKind::Approval => {
                let id = fb.operation_id;
                if corrected.contains(&id) || rejected.contains(&id) || failed.contains(&id) {
                    continue;
                }
                let Some(records) = by_operation.get(&id) else {
                    continue;
                };
                let Some(pass) = effective_pass(records.iter().map(|r| &r.pass)) else {
                    continue;
                };
                if pass.confident && pass.degraded.is_none() {
                    candidates.push(FewShotExample {
                        request: fb.request.clone(),
                        axes: pass.axes,
                        source: ExampleSource::Approval,
                        recorded_at: fb.recorded_at,
                    });
                }
            }
            FeedbackKind::Rejection => {}
        }
    }

    candidates.sort_by(|a, b| {
        b.recorded_at
            .cmp(&a.recorded_at)
            .then_with(|| source_rank(a.source).cmp(&source_rank(b.source)))
            .then_with(|| a.request.cmp(&b.request))
    });

    let mut seen = HashSet::new();
    candidates.retain(|ex| seen.insert(normalize(&ex.request)));
    candidates.truncate(limit);
    candidates
}

fn source_rank(source: ExampleSource) -> u8 {
    match source {
        ExampleSource::Correction => 0,
        ExampleSource::Approval => 1,
    }
}
