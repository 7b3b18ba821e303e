//! Semantic layer: do the axes fit the content, and does what it names exist?

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::patterns::changes_system_state;
use crate::core::sanitize::strip_unsafe;
use crate::core::similarity::tokens;
use crate::core::tree::AtomicOperation;
use crate::core::types::{Axes, Consumer, Destination, Semantics, VerificationLayer};
use crate::io::environment::Environment;
use crate::verify::{LayerVerdict, VerificationContext, Verifier, is_shell_like};

static ABS_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s=])(/[^\s;|&<>'"]*)"#).expect("path pattern should compile")
});

static WRITE_TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:>>?|\btee\s+(?:-a\s+)?)\s*([^\s;|&<>'"]+)"#)
        .expect("write target pattern should compile")
});

static WRITE_CUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)>|\btee\b|\b(?:save|write|export|dump|append)\b[^.]*\b(?:to|into)\b|\binto\s+(?:a\s+)?file\b")
        .expect("write cue pattern should compile")
});

static MACHINE_CUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\|\s*\w|\b(?:json|csv|yaml|parse|parseable|machine[- ]readable)\b")
        .expect("machine cue pattern should compile")
});

const INTERPRET_VERBS: &[&str] = &[
    "explain", "summarize", "analyze", "describe", "compare", "interpret",
];
const WRAPPERS: &[&str] = &["sudo", "doas", "env", "nohup", "time", "nice"];

pub struct SemanticLayer;

impl Verifier for SemanticLayer {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Semantic
    }

    fn verify(&self, op: &AtomicOperation, ctx: &VerificationContext<'_>) -> LayerVerdict {
        let axes = op.axes();
        let mut issues = coherence_issues(&op.content, axes);
        if is_shell_like(&op.content)
            && let Some(tool) = first_tool(&op.content)
            && ctx.environment.resolve_tool(&tool).is_none()
        {
            issues.push(format!("tool '{tool}' not found"));
        }
        issues.extend(path_issues(&op.content, axes, ctx.environment));

        let mut confidence: f64 = if op.is_confident() { 1.0 } else { 0.6 };
        for _ in &issues {
            confidence *= 0.85;
        }
        LayerVerdict::advisory(confidence.max(0.2), issues)
    }
}

/// Mismatches between what the content says and the classified axes.
pub fn coherence_issues(content: &str, axes: Axes) -> Vec<String> {
    let mut issues = Vec::new();
    let words = tokens(content);
    if axes.destination == Destination::Process && axes.semantics != Semantics::Execute {
        issues.push("process destination without execute semantics".to_string());
    }
    let writes = WRITE_CUE_RE.is_match(content);
    if writes && axes.destination != Destination::File {
        issues.push(format!(
            "content writes a file but destination is {}",
            axes.destination
        ));
    }
    if !writes && axes.destination == Destination::File && !ABS_PATH_RE.is_match(content) {
        issues.push("file destination without a target".to_string());
    }
    if MACHINE_CUE_RE.is_match(content) && axes.consumer == Consumer::Human {
        issues.push("output feeds a program but consumer is human".to_string());
    }
    if axes.semantics == Semantics::Read
        && words.iter().any(|w| INTERPRET_VERBS.contains(&w.as_str()))
    {
        issues.push("interpretation requested but semantics is read".to_string());
    }
    if axes.semantics == Semantics::Read && changes_system_state(content) {
        issues.push("content changes system state but semantics is read".to_string());
    }
    issues
}

/// First program the content would run, skipping wrappers and `VAR=value`.
pub fn first_tool(content: &str) -> Option<String> {
    content
        .split_whitespace()
        .find(|token| {
            !WRAPPERS.contains(token) && !token.starts_with('-') && !token.contains('=')
        })
        .map(strip_unsafe)
        .filter(|tool| !tool.is_empty())
}

fn path_issues(content: &str, axes: Axes, env: &dyn Environment) -> Vec<String> {
    let mut issues = Vec::new();
    let targets: Vec<&str> = WRITE_TARGET_RE
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    for target in &targets {
        let path = Path::new(target);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
            && !env.path_exists(parent)
        {
            issues.push(format!("parent directory {} does not exist", parent.display()));
        }
    }
    if axes.semantics == Semantics::Read {
        for caps in ABS_PATH_RE.captures_iter(content) {
            let Some(m) = caps.get(1) else { continue };
            let path = m.as_str().trim_end_matches([',', '.', ')']);
            if path.len() < 2 || path.contains('*') || targets.contains(&path) {
                continue;
            }
            if !env.path_exists(Path::new(path)) {
                issues.push(format!("path {path} does not exist"));
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LayerFixture, StaticEnvironment, leaf};

    fn axes(d: Destination, c: Consumer, s: Semantics) -> Axes {
        Axes::new(d, c, s)
    }

    #[test]
    fn coherent_axes_raise_no_issues() {
        let issues = coherence_issues(
            "show memory usage",
            axes(Destination::Stream, Consumer::Human, Semantics::Read),
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn redirect_requires_file_destination() {
        let issues = coherence_issues(
            "df -h > /tmp/disk.txt",
            axes(Destination::Stream, Consumer::Human, Semantics::Execute),
        );
        assert_eq!(
            issues,
            vec!["content writes a file but destination is stream".to_string()]
        );
    }

    #[test]
    fn process_destination_needs_execute() {
        let issues = coherence_issues(
            "restart nginx",
            axes(Destination::Process, Consumer::Machine, Semantics::Read),
        );
        assert!(issues.contains(&"process destination without execute semantics".to_string()));
    }

    #[test]
    fn unconfident_classification_starts_lower() {
        let fixture = LayerFixture::new();
        let read = axes(Destination::Stream, Consumer::Human, Semantics::Read);
        let sure = SemanticLayer.verify(
            &leaf("show memory usage", "show memory usage", read, true),
            &fixture.context(),
        );
        let unsure = SemanticLayer.verify(
            &leaf("show memory usage", "show memory usage", read, false),
            &fixture.context(),
        );
        assert!((sure.confidence - 1.0).abs() < 1e-9);
        assert!((unsure.confidence - 0.6).abs() < 1e-9);
        assert!(unsure.issues.is_empty());
    }

    #[test]
    fn privileged_command_read_as_read_is_incoherent() {
        let issues = coherence_issues("sudo shutdown -h now", Axes::CONSERVATIVE);
        assert_eq!(
            issues,
            vec!["content changes system state but semantics is read".to_string()]
        );
        let exec = axes(Destination::Stream, Consumer::Human, Semantics::Execute);
        assert!(coherence_issues("sudo shutdown -h now", exec).is_empty());
    }

    #[test]
    fn first_tool_skips_wrappers() {
        assert_eq!(first_tool("sudo env LANG=C apt-get update").as_deref(), Some("apt-get"));
        assert_eq!(first_tool("ls -la").as_deref(), Some("ls"));
    }

    #[test]
    fn missing_read_paths_and_write_parents_are_reported() {
        let env = StaticEnvironment::new().with_paths(&["/var/log/syslog", "/tmp"]);
        let read = axes(Destination::Stream, Consumer::Human, Semantics::Read);
        assert!(path_issues("tail /var/log/syslog", read, &env).is_empty());
        assert_eq!(
            path_issues("tail /var/log/missing.log", read, &env),
            vec!["path /var/log/missing.log does not exist".to_string()]
        );
        let write = axes(Destination::File, Consumer::Human, Semantics::Execute);
        assert!(path_issues("echo hi > /tmp/out.txt", write, &env).is_empty());
        assert_eq!(
            path_issues("echo hi > /nope/out.txt", write, &env),
            vec!["parent directory /nope does not exist".to_string()]
        );
    }
}
