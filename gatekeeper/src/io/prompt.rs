//! Oracle prompt rendering within a byte budget.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::examples::{ExampleSource, FewShotExample};
use crate::core::tree::MAX_CHILDREN;

const CLASSIFY_TEMPLATE: &str = include_str!("prompts/classify.md");
const DECOMPOSE_TEMPLATE: &str = include_str!("prompts/decompose.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern should compile")
});

#[derive(Debug, Clone, Serialize)]
struct ExampleContext<'a> {
    request: &'a str,
    destination: &'static str,
    consumer: &'static str,
    semantics: &'static str,
    corrected: bool,
}

impl<'a> ExampleContext<'a> {
    fn from_example(example: &'a FewShotExample) -> Self {
        Self {
            request: &example.request,
            destination: example.axes.destination.as_str(),
            consumer: example.axes.consumer.as_str(),
            semantics: example.axes.semantics.as_str(),
            corrected: example.source == ExampleSource::Correction,
        }
    }
}

fn engine() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("classify", CLASSIFY_TEMPLATE)
        .expect("classify template should be valid");
    env.add_template("decompose", DECOMPOSE_TEMPLATE)
        .expect("decompose template should be valid");
    env
}

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(engine);

/// Inputs for a classification prompt.
#[derive(Debug, Clone, Default)]
pub struct ClassifyInputs<'a> {
    pub request: &'a str,
    pub examples: &'a [FewShotExample],
    pub hints: &'a [String],
    pub indicators: &'a [String],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output at `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in `drop_order` until the prompt fits.
///
/// Required sections are never dropped; if they alone exceed the budget the
/// prompt is sent over budget rather than losing the request text.
fn fit_to_budget(sections: &mut Vec<Section>, budget: usize, drop_order: &[&str]) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in drop_order {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds oracle prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Drop order: indicators, hints, then examples.
    pub fn classify(&self, input: &ClassifyInputs<'_>) -> Result<String> {
        let examples: Vec<ExampleContext<'_>> = input
            .examples
            .iter()
            .map(ExampleContext::from_example)
            .collect();
        let hints: Vec<&str> = input
            .hints
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .collect();
        let rendered = ENGINE.get_template("classify")?.render(context! {
            request => input.request.trim(),
            examples => examples,
            hints => hints,
            indicators => input.indicators,
        })?;
        let mut sections = parse_sections(&rendered);
        fit_to_budget(
            &mut sections,
            self.budget_bytes,
            &["indicators", "hints", "examples"],
        );
        Ok(join_sections(&sections))
    }

    pub fn decompose(&self, request: &str, prior_rationale: Option<&str>) -> Result<String> {
        let rendered = ENGINE.get_template("decompose")?.render(context! {
            request => request.trim(),
            rationale => prior_rationale.map(str::trim).filter(|s| !s.is_empty()),
            max_children => MAX_CHILDREN,
        })?;
        let mut sections = parse_sections(&rendered);
        fit_to_budget(&mut sections, self.budget_bytes, &["classification"]);
        Ok(join_sections(&sections))
    }
}
