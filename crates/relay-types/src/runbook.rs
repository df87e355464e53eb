use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// A versioned runbook document: an ordered list of step templates.
/// Immutable once committed at a version; new versions are new documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Hint narrowing the tool catalog offered to the planner. Advisory; the
    /// policy allowlist is what actually gates invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_hint: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensates: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RunbookDoc {
    /// Parse a YAML or JSON runbook document and validate its shape.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let doc: RunbookDoc = serde_yaml::from_str(raw)
            .map_err(|err| EngineError::Validation(format!("malformed runbook: {err}")))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("runbook name is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(EngineError::Validation("step name is empty".to_string()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step name `{}`",
                    step.name
                )));
            }
            if step.tool.is_none() && step.prompt.is_none() {
                return Err(EngineError::Validation(format!(
                    "step `{}` has neither tool nor prompt",
                    step.name
                )));
            }
            if let Some(tool) = &step.tool {
                if !is_valid_tool_id(tool) {
                    return Err(EngineError::Validation(format!(
                        "step `{}` references malformed tool id `{tool}`",
                        step.name
                    )));
                }
            }
            if step.timeout_ms == Some(0) {
                return Err(EngineError::Validation(format!(
                    "step `{}` has a zero timeout",
                    step.name
                )));
            }
            if let Some(target) = &step.compensates {
                if !seen.contains(target.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step `{}` compensates unknown step `{target}`",
                        step.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Tool ids are dotted, lower-case, stable: `tracker.create_issue`.
/// Wildcards are allowlist syntax, never tool ids.
pub fn is_valid_tool_id(tool: &str) -> bool {
    let segments: Vec<&str> = tool.split('.').collect();
    if segments.len() < 2 {
        return false;
    }
    segments.iter().all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_document() {
        let raw = r#"
name: restart-checkout
version: "3"
steps:
  - name: file-ticket
    tool: tracker.create_issue
    args: {title: "X", body: "Y"}
  - name: restart
    prompt: restart the checkout service in staging
    continue_on_error: true
"#;
        let doc = RunbookDoc::parse(raw).expect("valid runbook");
        assert_eq!(doc.name, "restart-checkout");
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[0].tool.as_deref(), Some("tracker.create_issue"));
        assert!(doc.steps[1].continue_on_error);
    }

    #[test]
    fn parses_json_document() {
        let raw = r#"{"name":"noop","steps":[{"name":"a","tool":"tracker.read_issue","args":{}}]}"#;
        let doc = RunbookDoc::parse(raw).expect("json is yaml");
        assert_eq!(doc.steps.len(), 1);
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let raw = r#"
name: dup
steps:
  - {name: a, tool: tracker.read_issue}
  - {name: a, tool: tracker.read_issue}
"#;
        let err = RunbookDoc::parse(raw).expect_err("duplicate names");
        assert!(err.to_string().contains("duplicate step name"));
    }

    #[test]
    fn rejects_step_without_tool_or_prompt() {
        let raw = "name: bad\nsteps:\n  - {name: a}\n";
        assert!(RunbookDoc::parse(raw).is_err());
    }

    #[test]
    fn tool_id_shape() {
        assert!(is_valid_tool_id("tracker.create_issue"));
        assert!(is_valid_tool_id("cluster.node.cordon"));
        assert!(!is_valid_tool_id("tracker"));
        assert!(!is_valid_tool_id("tracker.*"));
        assert!(!is_valid_tool_id("Tracker.Create"));
        assert!(!is_valid_tool_id("tracker..create"));
    }
}
