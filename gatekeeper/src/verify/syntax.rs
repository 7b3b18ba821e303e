//! Syntax layer: well-formedness of the realized content. Critical.

use crate::core::patterns::shell_injection_matches;
use crate::core::sanitize::{extract_identifiers, validate_identifier};
use crate::core::tree::AtomicOperation;
use crate::core::types::VerificationLayer;
use crate::verify::{LayerVerdict, VerificationContext, Verifier, is_shell_like};

/// Longest run of one repeated character that still looks like text.
const MAX_CHAR_RUN: usize = 10;
const MAX_TRAVERSALS: usize = 2;

pub struct SyntaxLayer;

impl Verifier for SyntaxLayer {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Syntax
    }

    fn verify(&self, op: &AtomicOperation, ctx: &VerificationContext<'_>) -> LayerVerdict {
        check_syntax(&op.content, ctx.max_bytes)
    }
}

pub fn check_syntax(content: &str, max_bytes: usize) -> LayerVerdict {
    let mut failures = Vec::new();
    if content.trim().is_empty() {
        return LayerVerdict::fail(vec!["empty content".to_string()]);
    }
    if content.len() > max_bytes {
        failures.push(format!("content is {} bytes; maximum is {max_bytes}", content.len()));
    }
    if content
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\t' | '\0'))
    {
        failures.push("control characters in content".to_string());
    }
    if !content.chars().any(char::is_alphanumeric) {
        failures.push("no word characters".to_string());
    }
    if longest_run(content) > MAX_CHAR_RUN {
        failures.push("excessive character repetition".to_string());
    }
    for (quote, name) in [('"', "double quotes"), ('`', "backticks")] {
        if content.matches(quote).count() % 2 != 0 {
            failures.push(format!("unbalanced {name}"));
        }
    }
    if is_shell_like(content) && content.matches('\'').count() % 2 != 0 {
        failures.push("unbalanced single quotes".to_string());
    }
    failures.extend(
        shell_injection_matches(content)
            .into_iter()
            .map(|rule| rule.issue.to_string()),
    );
    for (kind, value) in extract_identifiers(content) {
        if let Err(e) = validate_identifier(kind, &value) {
            failures.push(e.to_string());
        }
    }
    if !failures.is_empty() {
        return LayerVerdict::fail(failures);
    }

    let mut warnings = Vec::new();
    if content.matches("../").count() > MAX_TRAVERSALS {
        warnings.push("path traversal chain".to_string());
    }
    if content.replace("://", "").contains("//") {
        warnings.push("doubled path separator".to_string());
    }
    if content.contains('\0') {
        warnings.push("NUL byte in content".to_string());
    }
    let confidence = 1.0 - 0.1 * warnings.len() as f64;
    let mut verdict = LayerVerdict::pass(confidence);
    verdict.issues = warnings;
    verdict
}

fn longest_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for c in text.chars() {
        if c.is_whitespace() {
            current = 0;
            previous = None;
            continue;
        }
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }
    longest
}
