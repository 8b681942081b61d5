//! Planner output parsing with a deterministic fallback.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, warn};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

/// Longest plan kept from the Planner.
pub const MAX_PLAN_STEPS: usize = 5;

static PLAN_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).expect("plan schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("plan schema compiles")
});

/// Why raw Planner output could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanParseError {
    NotJson(String),
    Schema(Vec<String>),
}

/// Deterministic three-step plan used when the Planner output is unusable.
pub fn stub_plan(goal: &str) -> Vec<String> {
    vec![
        format!("Explore {goal}"),
        "Execute".to_string(),
        "Validate".to_string(),
    ]
}

/// Strip surrounding whitespace and unwrap a fenced code block if present.
///
/// Prefers a ```` ```json ```` fence, then any ```` ``` ```` fence; otherwise
/// the trimmed input is returned unchanged.
pub fn extract_json_payload(raw: &str) -> &str {
    let content = raw.trim();
    for opener in ["```json", "```JSON", "```"] {
        if let Some(start) = content.find(opener) {
            let body = &content[start + opener.len()..];
            let end = body.find("```").unwrap_or(body.len());
            return body[..end].trim();
        }
    }
    content
}

/// Parse raw Planner text into plan steps.
pub fn parse_plan(raw: &str) -> Result<Vec<String>, PlanParseError> {
    let payload = extract_json_payload(raw);
    let value: Value =
        serde_json::from_str(payload).map_err(|err| PlanParseError::NotJson(err.to_string()))?;

    let errors: Vec<String> = PLAN_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(PlanParseError::Schema(errors));
    }

    let steps: Vec<String> = value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|step| step.trim().to_string())
                .take(MAX_PLAN_STEPS)
                .collect()
        })
        .unwrap_or_default();
    Ok(steps)
}

/// Parse Planner output, substituting [`stub_plan`] on any parse failure.
///
/// Never fails and never returns an empty plan.
pub fn plan_or_stub(goal: &str, raw: &str) -> Vec<String> {
    match parse_plan(raw) {
        Ok(steps) if !steps.is_empty() => {
            debug!(steps = steps.len(), "parsed planner output");
            steps
        }
        Ok(_) => {
            warn!("planner output parsed to an empty plan, using stub plan");
            stub_plan(goal)
        }
        Err(err) => {
            warn!(error = ?err, "planner output unparseable, using stub plan");
            stub_plan(goal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_array() {
        let plan = parse_plan(r#"["Research members", "Design tiers", "Launch"]"#).expect("plan");
        assert_eq!(plan, vec!["Research members", "Design tiers", "Launch"]);
    }

    #[test]
    fn parses_fenced_json_block() {
        let raw = "Here is the plan:\n```json\n[\"a\", \"b\", \"c\"]\n```\nGood luck.";
        assert_eq!(parse_plan(raw).expect("plan"), vec!["a", "b", "c"]);
    }

    #[test]
    fn parses_unlabelled_fence() {
        let raw = "```\n[\"one\", \"two\", \"three\"]\n```";
        assert_eq!(parse_plan(raw).expect("plan"), vec!["one", "two", "three"]);
    }

    #[test]
    fn trims_steps_and_caps_length() {
        let raw = r#"[" 1 ", "2", "3", "4", "5", "6", "7"]"#;
        let plan = parse_plan(raw).expect("plan");
        assert_eq!(plan.len(), MAX_PLAN_STEPS);
        assert_eq!(plan[0], "1");
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            parse_plan("1. Research\n2. Build"),
            Err(PlanParseError::NotJson(_))
        ));
    }

    #[test]
    fn rejects_wrong_shapes() {
        for raw in [
            r#"{"steps": ["a"]}"#,
            "[]",
            "[1, 2, 3]",
            r#"["ok", "   "]"#,
        ] {
            assert!(
                matches!(parse_plan(raw), Err(PlanParseError::Schema(_))),
                "expected schema error for {raw}"
            );
        }
    }

    #[test]
    fn unparseable_output_falls_back_to_stub() {
        let plan = plan_or_stub("Launch a loyalty program", "not json at all");
        assert_eq!(
            plan,
            vec!["Explore Launch a loyalty program", "Execute", "Validate"]
        );
    }

    #[test]
    fn extract_payload_without_fence_is_trimmed_input() {
        assert_eq!(extract_json_payload("  [\"a\"]\n"), "[\"a\"]");
    }
}
