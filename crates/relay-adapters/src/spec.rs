use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ADAPTER_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Read,
    Write,
    Destructive,
}

impl ToolClass {
    /// Classes whose successful steps participate in compensation.
    pub fn is_effectful(self) -> bool {
        matches!(self, ToolClass::Write | ToolClass::Destructive)
    }
}

/// Registration record for one effector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub tool_id: String,
    pub description: String,
    /// JSON Schema for the argument mapping. Properties carrying
    /// `"secret": true` are redacted before audit and logging.
    pub args_schema: Value,
    pub classification: ToolClass,
    /// Safe to retry on transport failure without a dedup bracket.
    pub idempotent: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_tool: Option<String>,
    /// Only read-class adapters that opt in may be force-terminated.
    #[serde(default)]
    pub safe_to_interrupt: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_ADAPTER_TIMEOUT_MS
}

impl AdapterSpec {
    pub fn new(tool_id: &str, description: &str, args_schema: Value) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            description: description.to_string(),
            args_schema,
            classification: ToolClass::Read,
            idempotent: true,
            timeout_ms: DEFAULT_ADAPTER_TIMEOUT_MS,
            compensation_tool: None,
            safe_to_interrupt: false,
        }
    }

    pub fn classified(mut self, class: ToolClass) -> Self {
        self.classification = class;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn compensated_by(mut self, tool_id: &str) -> Self {
        self.compensation_tool = Some(tool_id.to_string());
        self
    }

    pub fn interruptible(mut self) -> Self {
        self.safe_to_interrupt = true;
        self
    }

    /// Argument names flagged `"secret": true` in the schema.
    pub fn secret_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(props) = self.args_schema.get("properties").and_then(|v| v.as_object()) {
            for (name, prop) in props {
                if prop.get("secret").and_then(|v| v.as_bool()) == Some(true) {
                    out.push(name.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_args_come_from_schema_markers() {
        let spec = AdapterSpec::new(
            "pager.page",
            "page an on-call rotation",
            json!({
                "type": "object",
                "properties": {
                    "routing_key": {"type": "string", "secret": true},
                    "summary": {"type": "string"}
                }
            }),
        );
        assert_eq!(spec.secret_args(), vec!["routing_key".to_string()]);
    }
}
