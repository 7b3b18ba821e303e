//! Decomposer agent: splits compound or ambiguous requests into 2-5 narrower ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::compound::heuristic_split;
use crate::core::similarity::{normalize, tokens};
use crate::core::tree::{MAX_CHILDREN, MIN_CHILDREN};
use crate::io::config::GateConfig;
use crate::io::oracle::{Oracle, OracleRequest, OracleTask};
use crate::io::prompt::PromptBuilder;
use crate::io::reply::parse_decomposition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalSource {
    Oracle,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub sub_requests: Vec<String>,
    pub source: ProposalSource,
    pub rationale: String,
}

/// Why a proposed split was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompositionRejected {
    #[error("proposal has {0} usable children; at least 2 required")]
    TooFew(usize),
    #[error("proposal has {0} children; at most 5 allowed")]
    TooMany(usize),
    #[error("child '{0}' is not more specific than its parent")]
    NotMoreSpecific(String),
}

pub struct Decomposer {
    oracle: Arc<dyn Oracle>,
    prompts: PromptBuilder,
    timeout: Duration,
}

impl Decomposer {
    pub fn new(oracle: Arc<dyn Oracle>, config: &GateConfig) -> Self {
        Self {
            oracle,
            prompts: PromptBuilder::new(config.classifier.prompt_budget_bytes),
            timeout: config.oracle.timeout(),
        }
    }

    /// Ask the oracle for a split; fall back to conjunction splitting.
    #[instrument(skip_all, fields(request_len = request.len()))]
    pub fn propose(&self, request: &str, prior_rationale: Option<&str>) -> Proposal {
        match self.ask_oracle(request, prior_rationale) {
            Ok(proposal) => proposal,
            Err(reason) => {
                warn!(reason = %reason, "decomposer oracle unusable; splitting heuristically");
                Proposal {
                    sub_requests: heuristic_split(request),
                    source: ProposalSource::Heuristic,
                    rationale: format!("heuristic split ({reason})"),
                }
            }
        }
    }

    fn ask_oracle(&self, request: &str, prior_rationale: Option<&str>) -> Result<Proposal, String> {
        let prompt = self
            .prompts
            .decompose(request, prior_rationale)
            .map_err(|e| format!("prompt render failed: {e:#}"))?;
        let reply = self
            .oracle
            .complete(&OracleRequest {
                task: OracleTask::Decompose,
                subject: request.to_string(),
                prompt,
                timeout: self.timeout,
            })
            .map_err(|e| e.to_string())?;
        let parsed = parse_decomposition(&reply).map_err(|e| format!("malformed reply: {e}"))?;
        let sub_requests = if parsed.needs_decomposition {
            parsed.sub_requests
        } else {
            debug!("oracle declined to decompose");
            Vec::new()
        };
        Ok(Proposal {
            sub_requests,
            source: ProposalSource::Oracle,
            rationale: parsed.rationale,
        })
    }
}

/// Trim, drop blanks, dedupe, then enforce 2-5 strictly narrower children.
pub fn validate_children(
    parent: &str,
    proposed: &[String],
) -> Result<Vec<String>, DecompositionRejected> {
    let mut seen = HashSet::new();
    let children: Vec<String> = proposed
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(normalize(c)))
        .collect();
    if children.len() < MIN_CHILDREN {
        return Err(DecompositionRejected::TooFew(children.len()));
    }
    if children.len() > MAX_CHILDREN {
        return Err(DecompositionRejected::TooMany(children.len()));
    }
    let parent_norm = normalize(parent);
    let parent_tokens = tokens(parent).len();
    for child in &children {
        if normalize(child) == parent_norm || tokens(child).len() >= parent_tokens {
            return Err(DecompositionRejected::NotMoreSpecific(child.clone()));
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::oracle::OracleError;
    use crate::test_support::{FnOracle, ScriptedOracle};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn oracle_split_is_preferred() {
        let oracle = ScriptedOracle::new().with_fallback(
            r#"{"needs_decomposition":true,"sub_requests":["check logs","restart nginx"],"rationale":"two steps"}"#,
        );
        let decomposer = Decomposer::new(Arc::new(oracle), &GateConfig::default());
        let proposal = decomposer.propose("check logs and restart nginx", None);
        assert_eq!(proposal.source, ProposalSource::Oracle);
        assert_eq!(proposal.sub_requests, strings(&["check logs", "restart nginx"]));
    }

    #[test]
    fn unavailable_oracle_falls_back_to_heuristic() {
        let oracle = FnOracle::new(|_| Err(OracleError::Unavailable("down".to_string())));
        let decomposer = Decomposer::new(Arc::new(oracle), &GateConfig::default());
        let proposal = decomposer.propose("check logs and restart nginx", None);
        assert_eq!(proposal.source, ProposalSource::Heuristic);
        assert_eq!(proposal.sub_requests, strings(&["check logs", "restart nginx"]));
    }

    #[test]
    fn validation_dedupes_and_trims() {
        let children = validate_children(
            "check logs and restart nginx",
            &strings(&[" check logs ", "", "Check logs", "restart nginx"]),
        )
        .expect("valid");
        assert_eq!(children, strings(&["check logs", "restart nginx"]));
    }

    #[test]
    fn validation_enforces_bounds() {
        let parent = "a b c d e f g h i j k l";
        assert_eq!(
            validate_children(parent, &strings(&["a b"])),
            Err(DecompositionRejected::TooFew(1))
        );
        assert_eq!(
            validate_children(parent, &strings(&["a", "b", "c", "d", "e", "f"])),
            Err(DecompositionRejected::TooMany(6))
        );
    }

    #[test]
    fn children_must_narrow_the_parent() {
        let err = validate_children(
            "show memory usage",
            &strings(&["show memory usage", "show cpu"]),
        )
        .expect_err("restates parent");
        assert!(matches!(err, DecompositionRejected::NotMoreSpecific(_)));
    }
}
