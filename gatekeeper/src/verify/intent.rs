//! Intent layer: does the realized content still do what the user asked?

use crate::core::similarity::{jaccard, tokens};
use crate::core::tree::AtomicOperation;
use crate::core::types::{Semantics, VerificationLayer};
use crate::verify::{LayerVerdict, VerificationContext, Verifier, is_shell_like};

const DRIFT_THRESHOLD: f64 = 0.5;
const CORRECTION_SIMILARITY: f64 = 0.6;
const MEMORY_CONSULT_BELOW: f64 = 0.7;
const MEMORY_BOOST: f64 = 0.1;
const MEMORY_MATCH: f64 = 0.3;

const QUESTION_WORDS: &[&str] = &[
    "what", "how", "why", "which", "where", "when", "who", "is", "are", "can", "does", "do",
];
const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete", "remove", "rm", "kill", "stop", "uninstall", "purge", "wipe", "format", "drop",
    "destroy", "erase", "truncate", "shutdown", "reboot",
];
const READ_VERBS: &[&str] = &[
    "show", "list", "display", "view", "print", "get", "check", "read", "tail", "cat", "find",
    "search",
];

pub struct IntentLayer;

impl Verifier for IntentLayer {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Intent
    }

    fn verify(&self, op: &AtomicOperation, ctx: &VerificationContext<'_>) -> LayerVerdict {
        let axes = op.axes();
        let mut issues = Vec::new();
        let mut confidence: f64 = 1.0;

        let similarity = jaccard(&op.content, &op.request);
        if similarity < DRIFT_THRESHOLD {
            issues.push(format!(
                "content drifted from request (similarity {similarity:.2})"
            ));
            confidence *= 0.5 + similarity;
        }

        let words = tokens(&op.request);
        let first = words.first().map(String::as_str).unwrap_or_default();
        let is_question =
            op.request.trim_end().ends_with('?') || QUESTION_WORDS.contains(&first);
        if is_question && axes.semantics == Semantics::Execute {
            issues.push("question classified as execute".to_string());
            confidence *= 0.7;
        }
        if axes.semantics == Semantics::Read
            && words.iter().any(|w| DESTRUCTIVE_VERBS.contains(&w.as_str()))
        {
            issues.push("destructive verb classified as read".to_string());
            confidence *= 0.6;
        }
        if axes.semantics == Semantics::Execute
            && READ_VERBS.contains(&first)
            && !is_shell_like(&op.content)
        {
            issues.push("read verb classified as execute".to_string());
            confidence *= 0.8;
        }

        if !op.is_confident() {
            issues.push("classification not confident".to_string());
            confidence *= 0.8;
        }
        if !op.injection_signatures.is_empty() {
            issues.push(format!(
                "prompt injection signatures: {}",
                op.injection_signatures.join(", ")
            ));
            confidence *= 0.6;
        }

        if let Some(correction) = ctx.corrections.iter().find(|ex| {
            ex.axes != axes && jaccard(&ex.request, &op.request) >= CORRECTION_SIMILARITY
        }) {
            issues.push(format!(
                "a similar request was corrected to {}",
                correction.axes
            ));
            confidence *= 0.6;
        }

        let mut details = format!("similarity {similarity:.2}");
        if confidence < MEMORY_CONSULT_BELOW
            && let Some(memory) = ctx.memory
            && let Some(evidence) = memory.alignment_evidence(&op.request)
            && jaccard(&evidence, &op.content) >= MEMORY_MATCH
        {
            confidence += MEMORY_BOOST;
            details.push_str("; memory evidence supports intent");
        }

        LayerVerdict::advisory(confidence, issues).with_details(details)
    }
}
