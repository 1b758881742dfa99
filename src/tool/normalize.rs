//! Turning remote tool results into model-facing narratives
//!
//! Capability providers answer `tools/call` with a loose envelope: a list of
//! content items, an `isError` flag, and sometimes a top-level `error`
//! object. The loop needs one string back for the model plus an optional
//! structured payload for the client. [`RULES`] is tried in order and the
//! first rule whose predicate matches produces the result.

use crate::mcp::{CallToolResult, ToolContent};
use serde_json::{Map, Value};

/// Textual marker that precedes an embedded JSON payload in a text item.
pub const JSON_MARKER: &str = "```json";

/// Serialized payloads longer than this are summarized by their keys.
pub const SUMMARY_THRESHOLD: usize = 3000;

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub narrative: String,
    pub is_error: bool,
    pub data: Option<Value>,
}

impl Normalized {
    fn ok(narrative: String) -> Self {
        Self {
            narrative,
            is_error: false,
            data: None,
        }
    }

    fn err(narrative: String) -> Self {
        Self {
            narrative,
            is_error: true,
            data: None,
        }
    }

    pub fn into_tool_result(self) -> super::ToolResult {
        let result = if self.is_error {
            super::ToolResult::error(self.narrative)
        } else {
            super::ToolResult::success(self.narrative)
        };
        match self.data {
            Some(data) => result.with_data(data),
            None => result,
        }
    }
}

pub struct Rule {
    pub name: &'static str,
    pub applies: fn(&CallToolResult) -> bool,
    pub narrate: fn(&str, &CallToolResult) -> Normalized,
}

pub static RULES: &[Rule] = &[
    Rule {
        name: "top-level-error",
        applies: |r| r.error.is_some() || r.is_error,
        narrate: narrate_error,
    },
    Rule {
        name: "embedded-json",
        applies: |r| first_text(r).and_then(embedded_json).is_some(),
        narrate: narrate_embedded_json,
    },
    Rule {
        name: "raw-text",
        applies: |r| first_text(r).is_some(),
        narrate: |_, r| Normalized::ok(first_text(r).unwrap_or_default().to_string()),
    },
    Rule {
        name: "non-text",
        applies: |r| !r.content.is_empty(),
        narrate: |tool, _| Normalized::ok(format!("Tool '{tool}' returned non-text content.")),
    },
    Rule {
        name: "empty",
        applies: |_| true,
        narrate: |tool, _| Normalized::ok(format!("Tool '{tool}' executed successfully.")),
    },
];

/// Normalize a `tools/call` result for the tool named `tool`.
pub fn normalize(tool: &str, result: &CallToolResult) -> Normalized {
    for rule in RULES {
        if (rule.applies)(result) {
            tracing::trace!(tool, rule = rule.name, "Normalizing tool result");
            return (rule.narrate)(tool, result);
        }
    }
    Normalized::ok(format!("Tool '{tool}' executed successfully."))
}

/// Narrative for a call that never produced a result.
pub fn connection_failure(tool: &str, error: &anyhow::Error) -> Normalized {
    Normalized::err(format!("Tool '{tool}' could not be reached: {error:#}"))
}

/// The first content item, if it is non-empty text.
fn first_text(result: &CallToolResult) -> Option<&str> {
    match result.content.first()? {
        ToolContent::Text { text } if !text.trim().is_empty() => Some(text.as_str()),
        _ => None,
    }
}

/// Object following the marker, spanning to the last closing brace.
fn embedded_json(text: &str) -> Option<Map<String, Value>> {
    let after = &text[text.find(JSON_MARKER)? + JSON_MARKER.len()..];
    let start = after.find('{')?;
    let end = after.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&after[start..=end]).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}

fn narrate_error(tool: &str, result: &CallToolResult) -> Normalized {
    let message = match &result.error {
        Some(error) => error_message(error),
        None => first_text(result)
            .map(str::to_string)
            .unwrap_or_else(|| "unknown error".to_string()),
    };
    Normalized::err(format!("Tool '{tool}' failed: {message}"))
}

fn narrate_embedded_json(tool: &str, result: &CallToolResult) -> Normalized {
    let Some(payload) = first_text(result).and_then(embedded_json) else {
        return Normalized::ok(format!("Tool '{tool}' executed successfully."));
    };

    if let Some(error) = payload.get("error") {
        let mut normalized = Normalized::err(format!(
            "Tool '{tool}' returned an error: {}",
            error_message(error)
        ));
        normalized.data = Some(Value::Object(payload));
        return normalized;
    }

    let compact = Value::Object(payload.clone()).to_string();
    let length = compact.chars().count();
    let rendered = if length > SUMMARY_THRESHOLD {
        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        format!(
            "large structured result ({length} characters) with fields: {}",
            keys.join(", ")
        )
    } else {
        compact
    };

    Normalized {
        narrative: format!("Tool '{tool}' executed successfully. Result: {rendered}"),
        is_error: false,
        data: Some(Value::Object(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn texts(items: &[&str]) -> CallToolResult {
        CallToolResult {
            content: items.iter().map(|t| ToolContent::text(*t)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn top_level_error_wins_over_content() {
        let result = CallToolResult {
            content: vec![ToolContent::text("```json {\"ok\": true}")],
            error: Some(json!({"message": "quota exhausted"})),
            ..Default::default()
        };
        let n = normalize("lookup", &result);
        assert!(n.is_error);
        assert!(n.narrative.contains("quota exhausted"));
        assert!(!n.narrative.contains("executed successfully"));
    }

    #[test]
    fn error_without_message_is_serialized() {
        let result = CallToolResult {
            error: Some(json!({"code": 7})),
            ..Default::default()
        };
        assert_eq!(
            normalize("lookup", &result).narrative,
            "Tool 'lookup' failed: {\"code\":7}"
        );
    }

    #[test]
    fn is_error_flag_uses_text_content() {
        let result = CallToolResult {
            content: vec![ToolContent::text("city not found")],
            is_error: true,
            ..Default::default()
        };
        let n = normalize("lookup", &result);
        assert_eq!(n.narrative, "Tool 'lookup' failed: city not found");
    }

    #[test]
    fn embedded_json_success_is_compact() {
        let n = normalize(
            "lookup",
            &texts(&["Here you go:\n```json\n{\"city\": \"Rome\", \"temp\": 21}\n```"]),
        );
        assert!(!n.is_error);
        assert_eq!(
            n.narrative,
            "Tool 'lookup' executed successfully. Result: {\"city\":\"Rome\",\"temp\":21}"
        );
        assert_eq!(n.data, Some(json!({"city": "Rome", "temp": 21})));
    }

    #[test]
    fn embedded_json_error_field_is_narrated() {
        let n = normalize(
            "lookup",
            &texts(&["```json {\"error\": {\"message\": \"no such city\"}} ```"]),
        );
        assert!(n.is_error);
        assert_eq!(n.narrative, "Tool 'lookup' returned an error: no such city");
    }

    #[test]
    fn large_payloads_are_summarized_by_keys() {
        let big = "x".repeat(SUMMARY_THRESHOLD + 10);
        let text = format!("```json {{\"alpha\": \"{big}\", \"beta\": 1}}");
        let n = normalize("lookup", &texts(&[&text]));
        assert!(n.narrative.contains("fields: alpha, beta"));
        assert!(n.narrative.len() < SUMMARY_THRESHOLD);
        assert!(n.data.is_some());
    }

    #[test]
    fn summary_length_counts_characters() {
        let big = "é".repeat(SUMMARY_THRESHOLD + 10);
        let text = format!("```json {{\"alpha\": \"{big}\", \"beta\": 1}}");
        let n = normalize("lookup", &texts(&[&text]));
        // {"alpha":"<big>","beta":1}
        let expected = SUMMARY_THRESHOLD + 10 + 21;
        assert!(n.narrative.contains(&format!("({expected} characters)")));
    }

    #[test]
    fn unparseable_marker_falls_back_to_raw_text() {
        let text = "```json not json at all";
        assert_eq!(normalize("lookup", &texts(&[text])).narrative, text);
        assert_eq!(normalize("lookup", &texts(&["sunny"])).narrative, "sunny");
    }

    #[test]
    fn non_text_and_empty_results() {
        let image = CallToolResult {
            content: vec![ToolContent::Image {
                data: "AAAA".to_string(),
                mime_type: "image/png".to_string(),
            }],
            ..Default::default()
        };
        assert_eq!(
            normalize("draw", &image).narrative,
            "Tool 'draw' returned non-text content."
        );
        assert_eq!(
            normalize("draw", &texts(&[""])).narrative,
            "Tool 'draw' returned non-text content."
        );
        assert_eq!(
            normalize("draw", &CallToolResult::default()).narrative,
            "Tool 'draw' executed successfully."
        );
    }

    #[test]
    fn rules_are_ordered() {
        let names: Vec<&str> = RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec!["top-level-error", "embedded-json", "raw-text", "non-text", "empty"]
        );
    }
}
