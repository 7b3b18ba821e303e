//! Classifier agent: maps a request onto the three taxonomy axes.
//!
//! The oracle is consulted exactly once per call. Anything other than a
//! schema-valid reply with in-taxonomy values yields the conservative default
//! with `confident = false`; the call itself never fails.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::compound;
use crate::core::examples::FewShotExample;
use crate::core::types::{Axes, ClassificationPass, PassKind};
use crate::io::config::GateConfig;
use crate::io::oracle::{Oracle, OracleRequest, OracleTask};
use crate::io::prompt::{ClassifyInputs, PromptBuilder};
use crate::io::reply::parse_classification;

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(~?/[^\s;|&<>]*)").expect("path pattern should compile")
});

static METACHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[|;&<>`$]").expect("metachar pattern should compile"));

/// Classifier output for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub axes: Axes,
    pub confident: bool,
    pub rationale: String,
    pub indicators: Vec<String>,
    /// Why the conservative default was used, when it was.
    pub degraded: Option<String>,
}

impl Classification {
    pub fn into_pass(self, kind: PassKind) -> ClassificationPass {
        ClassificationPass {
            pass_number: 0,
            kind,
            indicators: self.indicators,
            axes: self.axes,
            confident: self.confident,
            rationale: self.rationale,
            degraded: self.degraded,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyInput<'a> {
    pub request: &'a str,
    pub hints: &'a [String],
    pub examples: &'a [FewShotExample],
    /// The sanitizer found prompt-injection signatures in the request.
    pub injection_flagged: bool,
}

pub struct Classifier {
    oracle: Arc<dyn Oracle>,
    prompts: PromptBuilder,
    timeout: Duration,
    long_request_words: usize,
}

impl Classifier {
    pub fn new(oracle: Arc<dyn Oracle>, config: &GateConfig) -> Self {
        Self {
            oracle,
            prompts: PromptBuilder::new(config.classifier.prompt_budget_bytes),
            timeout: config.oracle.timeout(),
            long_request_words: config.decomposition.long_request_words,
        }
    }

    #[instrument(
        skip_all,
        fields(request_len = input.request.len(), examples = input.examples.len())
    )]
    pub fn classify(&self, input: &ClassifyInput<'_>) -> Classification {
        let local = local_indicators(input.request, self.long_request_words);
        let prompt = match self.prompts.classify(&ClassifyInputs {
            request: input.request,
            examples: input.examples,
            hints: input.hints,
            indicators: &local,
        }) {
            Ok(prompt) => prompt,
            Err(e) => return degraded(local, format!("prompt render failed: {e:#}")),
        };

        let reply = match self.oracle.complete(&OracleRequest {
            task: OracleTask::Classify,
            subject: input.request.to_string(),
            prompt,
            timeout: self.timeout,
        }) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(err = %e, "classifier oracle failed; using conservative default");
                return degraded(local, e.to_string());
            }
        };

        let parsed = match parse_classification(&reply) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(err = %e, "malformed classifier reply; using conservative default");
                return degraded(local, format!("malformed reply: {e}"));
            }
        };

        let mut indicators = parsed.indicators;
        for cue in local {
            if !indicators.contains(&cue) {
                indicators.push(cue);
            }
        }
        let confident = parsed.confident && !input.injection_flagged;
        if parsed.confident && input.injection_flagged {
            debug!("confidence withheld: request carries injection signatures");
        }
        Classification {
            axes: parsed.axes,
            confident,
            rationale: parsed.rationale,
            indicators,
            degraded: None,
        }
    }
}

fn degraded(indicators: Vec<String>, reason: String) -> Classification {
    Classification {
        axes: Axes::CONSERVATIVE,
        confident: false,
        rationale: "conservative default".to_string(),
        indicators,
        degraded: Some(reason),
    }
}

/// Lexical cues found without the oracle: verbs, conjunctions, paths, metacharacters.
pub fn local_indicators(request: &str, long_request_words: usize) -> Vec<String> {
    let mut out = compound::detect(request, long_request_words).indicators();
    for caps in PATH_RE.captures_iter(request) {
        if let Some(path) = caps.get(1) {
            out.push(format!("path:{}", path.as_str()));
        }
    }
    if METACHAR_RE.is_match(request) {
        out.push("shell_metacharacters".to_string());
    }
    out
}
