//! Strict output contracts for the LLM roles. Non-conforming output is an
//! LLM-side retryable error; the caller re-prompts up to a fixed bound and
//! keeps paying for every attempt.

use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::{json, Value};
use tracing::debug;

use relay_types::StepUsage;

use crate::provider::{ChatMessage, ProviderRegistry};
use crate::AgentError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub fn plan_validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        compile(json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string", "minLength": 1},
                            "tool": {"type": "string", "minLength": 1},
                            "args": {"type": "object"}
                        },
                        "required": ["name", "tool", "args"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["steps"],
            "additionalProperties": false
        }))
    })
}

pub fn tool_call_validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        compile(json!({
            "type": "object",
            "properties": {
                "tool": {"type": "string", "minLength": 1},
                "args": {"type": "object"},
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "rationale": {"type": "string"}
            },
            "required": ["tool", "args", "confidence", "rationale"],
            "additionalProperties": false
        }))
    })
}

pub fn review_validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        compile(json!({
            "type": "object",
            "properties": {
                "decision": {"enum": ["allow", "block", "require_approval"]},
                "reasons": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["decision", "reasons"],
            "additionalProperties": false
        }))
    })
}

fn compile(schema: Value) -> Validator {
    jsonschema::validator_for(&schema).unwrap_or_else(|err| {
        // The schemas above are constants; failing to compile them is a bug.
        panic!("agent output schema failed to compile: {err}")
    })
}

/// Pull the first JSON object out of a completion, tolerating code fences
/// and prose around it.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = without_fence {
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Some(value);
        }
    }
    // Last resort: first balanced object in the text.
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in trimmed[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Run one LLM role call: prompt, extract, validate, re-prompt on mismatch.
/// Usage accumulates across attempts, including the failed ones.
pub(crate) async fn complete_json(
    providers: &ProviderRegistry,
    provider_id: Option<&str>,
    model: Option<&str>,
    system: &str,
    user: &str,
    validator: &Validator,
    max_attempts: u32,
) -> Result<(Value, StepUsage), AgentError> {
    let mut usage = StepUsage::default();
    let mut last_detail = String::new();
    for attempt in 1..=max_attempts {
        let mut messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: user.to_string(),
            },
        ];
        if attempt > 1 {
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: format!(
                    "Your previous reply was rejected: {last_detail}. \
                     Reply with exactly one JSON object conforming to the schema, nothing else."
                ),
            });
        }
        let completion = providers
            .complete(provider_id, messages, model)
            .await
            .map_err(|err| AgentError::Provider(err.to_string()))?;
        usage.merge(&completion.step_usage());

        let Some(value) = extract_json(&completion.text) else {
            last_detail = "no JSON object found".to_string();
            debug!(attempt, "agent output had no JSON");
            continue;
        };
        if let Err(err) = validator.validate(&value) {
            last_detail = format!("schema mismatch at `{}`", err.instance_path);
            debug!(attempt, detail = %last_detail, "agent output rejected");
            continue;
        }
        return Ok((value, usage));
    }
    Err(AgentError::Malformed {
        attempts: max_attempts,
        detail: last_detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_and_embedded_json() {
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```").expect("fenced"),
            json!({"a": 1})
        );
        assert_eq!(
            extract_json("Sure! Here is the plan: {\"steps\": []} Hope it helps.")
                .expect("embedded"),
            json!({"steps": []})
        );
        assert_eq!(
            extract_json("{\"msg\": \"braces } in { strings\"}").expect("strings"),
            json!({"msg": "braces } in { strings"})
        );
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn plan_schema_is_strict() {
        assert!(plan_validator()
            .validate(&json!({"steps": [{"name": "a", "tool": "x.y", "args": {}}]}))
            .is_ok());
        assert!(plan_validator()
            .validate(&json!({"steps": [{"name": "a"}]}))
            .is_err());
        assert!(plan_validator().validate(&json!({"extra": 1, "steps": []})).is_err());
    }

    #[test]
    fn review_schema_pins_decisions() {
        assert!(review_validator()
            .validate(&json!({"decision": "allow", "reasons": []}))
            .is_ok());
        assert!(review_validator()
            .validate(&json!({"decision": "maybe", "reasons": []}))
            .is_err());
    }
}
