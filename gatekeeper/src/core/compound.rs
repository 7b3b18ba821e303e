//! Compound-intent detection and the heuristic request splitter.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::similarity::tokens;

/// Verbs that start an independent instruction.
pub const ACTION_VERBS: &[&str] = &[
    "add", "analyze", "archive", "backup", "build", "cat", "check", "clean", "compare",
    "compress", "copy", "count", "create", "delete", "deploy", "describe", "disable",
    "display", "download", "edit", "enable", "execute", "explain", "extract", "fetch", "find",
    "get", "grep", "install", "kill", "launch", "list", "make", "modify", "mount", "move",
    "open", "print", "read", "reboot", "reload", "remove", "rename", "restart", "restore",
    "run", "save", "schedule", "search", "send", "show", "start", "stop", "summarize", "tail",
    "uninstall", "unmount", "update", "upgrade", "upload", "view", "write",
];

static CONJUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:;|&&|,?\s*\band\s+then\b|,?\s*\bthen\b|,?\s*\band\b|,?\s*\balso\b)\s*")
        .expect("conjunction pattern should compile")
});

pub fn is_action_verb(word: &str) -> bool {
    ACTION_VERBS.contains(&word.to_lowercase().as_str())
}

/// Lexical cues that suggest a request bundles several instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundSignals {
    pub conjunctions: usize,
    pub action_verbs: Vec<String>,
    pub word_count: usize,
    pub long: bool,
}

impl CompoundSignals {
    pub fn is_compound(&self) -> bool {
        self.long || (self.conjunctions > 0 && self.action_verbs.len() >= 2)
    }

    /// Human-readable cues for classification passes.
    pub fn indicators(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .action_verbs
            .iter()
            .map(|v| format!("verb:{v}"))
            .collect();
        if self.conjunctions > 0 {
            out.push(format!("conjunctions:{}", self.conjunctions));
        }
        if self.long {
            out.push(format!("long:{}", self.word_count));
        }
        out
    }
}

pub fn detect(text: &str, long_request_words: usize) -> CompoundSignals {
    let words = tokens(text);
    let action_verbs = words
        .iter()
        .filter(|w| is_action_verb(w))
        .cloned()
        .collect();
    CompoundSignals {
        conjunctions: CONJUNCTION_RE.find_iter(text).count(),
        action_verbs,
        word_count: words.len(),
        long: words.len() > long_request_words,
    }
}

/// Split at conjunctions that introduce a new action verb.
///
/// "show cpu and memory" stays whole; "check logs and restart nginx" splits.
pub fn heuristic_split(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    for m in CONJUNCTION_RE.find_iter(text) {
        let next_word = text[m.end()..].split_whitespace().next().unwrap_or_default();
        if m.start() == 0 || !is_action_verb(next_word) {
            continue;
        }
        parts.push(text[start..m.start()].trim().to_string());
        start = m.end();
    }
    parts.push(text[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjunction_with_two_verbs_is_compound() {
        let signals = detect("check logs and restart the service", 40);
        assert_eq!(signals.action_verbs, vec!["check", "restart"]);
        assert_eq!(signals.conjunctions, 1);
        assert!(signals.is_compound());
    }

    #[test]
    fn single_instruction_is_not_compound() {
        assert!(!detect("show memory usage", 40).is_compound());
        assert!(!detect("show cpu and memory usage", 40).is_compound());
    }

    #[test]
    fn long_requests_are_compound() {
        let text = vec!["word"; 41].join(" ");
        let signals = detect(&text, 40);
        assert!(signals.long);
        assert!(signals.is_compound());
        assert_eq!(signals.indicators(), vec!["long:41".to_string()]);
    }

    #[test]
    fn split_only_at_verb_boundaries() {
        assert_eq!(
            heuristic_split("check logs and restart the service"),
            vec!["check logs", "restart the service"]
        );
        assert_eq!(
            heuristic_split("show cpu and memory usage"),
            vec!["show cpu and memory usage"]
        );
        assert_eq!(
            heuristic_split("stop nginx; update packages && start nginx"),
            vec!["stop nginx", "update packages", "start nginx"]
        );
    }
}
