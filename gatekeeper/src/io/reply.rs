//! Parsing untrusted oracle replies into closed types.

use jsonschema::validator_for;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::{Axes, Consumer, Destination, Semantics, UnknownAxisValue};

const CLASSIFICATION_SCHEMA: &str = include_str!("../../schemas/classification.schema.json");
const DECOMPOSITION_SCHEMA: &str = include_str!("../../schemas/decomposition.schema.json");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("reply contains no JSON object")]
    NoJson,
    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("reply failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error(transparent)]
    UnknownAxis(#[from] UnknownAxisValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationReply {
    pub axes: Axes,
    pub confident: bool,
    pub rationale: String,
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompositionReply {
    pub needs_decomposition: bool,
    pub sub_requests: Vec<String>,
    pub rationale: String,
}

pub fn parse_classification(raw: &str) -> Result<ClassificationReply, ReplyError> {
    let value = parse_object(raw, CLASSIFICATION_SCHEMA)?;
    let axis = |key: &str| value[key].as_str().unwrap_or_default().to_string();
    let axes = Axes::new(
        axis("destination").parse::<Destination>()?,
        axis("consumer").parse::<Consumer>()?,
        axis("semantics").parse::<Semantics>()?,
    );
    let rationale = value["rationale"]
        .as_str()
        .or_else(|| value["reasoning"].as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    let indicators = value["indicators"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(ClassificationReply {
        axes,
        confident: value["confident"].as_bool().unwrap_or(false),
        rationale,
        indicators,
    })
}

pub fn parse_decomposition(raw: &str) -> Result<DecompositionReply, ReplyError> {
    let value = parse_object(raw, DECOMPOSITION_SCHEMA)?;
    let sub_requests = value["sub_requests"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(DecompositionReply {
        needs_decomposition: value["needs_decomposition"].as_bool().unwrap_or(true),
        sub_requests,
        rationale: value["rationale"].as_str().unwrap_or_default().to_string(),
    })
}

fn parse_object(raw: &str, schema_src: &str) -> Result<Value, ReplyError> {
    let body = extract_json_object(raw).ok_or(ReplyError::NoJson)?;
    let value: Value =
        serde_json::from_str(body).map_err(|e| ReplyError::InvalidJson(e.to_string()))?;
    validate_schema(&value, schema_src)?;
    Ok(value)
}

fn validate_schema(instance: &Value, schema_src: &str) -> Result<(), ReplyError> {
    let schema: Value = serde_json::from_str(schema_src)
        .map_err(|e| ReplyError::Schema(vec![format!("embedded schema: {e}")]))?;
    let compiled = validator_for(&schema)
        .map_err(|e| ReplyError::Schema(vec![format!("embedded schema: {e}")]))?;
    if compiled.is_valid(instance) {
        return Ok(());
    }
    let messages = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    Err(ReplyError::Schema(messages))
}

/// First balanced `{...}` in `raw`, ignoring braces inside JSON strings.
///
/// Models often wrap JSON in prose or code fences.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_reply_with_prose() {
        let raw = "Sure.\n```json\n{\"destination\": \"Stream\", \"consumer\": \"human\", \"semantics\": \"read\", \"confident\": true, \"rationale\": \"shows {usage}\"}\n```";
        let reply = parse_classification(raw).expect("parse");
        assert_eq!(reply.axes, Axes::CONSERVATIVE);
        assert!(reply.confident);
        assert_eq!(reply.rationale, "shows {usage}");
    }

    #[test]
    fn out_of_enum_axis_is_rejected() {
        let raw = r#"{"destination": "network", "consumer": "human", "semantics": "read", "confident": true}"#;
        assert!(matches!(
            parse_classification(raw),
            Err(ReplyError::UnknownAxis(UnknownAxisValue { axis: "destination", .. }))
        ));
    }

    #[test]
    fn schema_violations_are_reported() {
        let raw = r#"{"destination": "stream", "consumer": "human", "semantics": "read", "confident": "yes"}"#;
        assert!(matches!(parse_classification(raw), Err(ReplyError::Schema(_))));
        assert_eq!(parse_classification("no json here"), Err(ReplyError::NoJson));
        assert!(matches!(
            parse_classification("{not json}"),
            Err(ReplyError::InvalidJson(_))
        ));
    }

    #[test]
    fn parses_decomposition_reply() {
        let raw = r#"{"needs_decomposition": true, "sub_requests": ["check logs", "restart the service"], "rationale": "two steps"}"#;
        let reply = parse_decomposition(raw).expect("parse");
        assert_eq!(reply.sub_requests, vec!["check logs", "restart the service"]);
        assert!(reply.needs_decomposition);
    }
}
