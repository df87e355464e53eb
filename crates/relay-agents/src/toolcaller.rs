use async_trait::async_trait;
use serde_json::{json, Value};

use relay_adapters::AdapterSpec;
use relay_types::{is_valid_tool_id, PlannedStep};

use crate::provider::ProviderRegistry;
use crate::schema::{complete_json, tool_call_validator, DEFAULT_MAX_ATTEMPTS};
use crate::{AgentError, AgentOutcome};

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
    pub confidence: f64,
    pub rationale: String,
}

/// One pending step (possibly missing or loose args) -> a concrete tool+args.
#[async_trait]
pub trait Toolcaller: Send + Sync {
    async fn refine(
        &self,
        step: &PlannedStep,
        context: &Value,
        catalog: &[AdapterSpec],
    ) -> Result<AgentOutcome<ToolCall>, AgentError>;
}

/// Pass-through mode: the step must already carry a concrete tool.
pub struct StubToolcaller;

#[async_trait]
impl Toolcaller for StubToolcaller {
    async fn refine(
        &self,
        step: &PlannedStep,
        _context: &Value,
        _catalog: &[AdapterSpec],
    ) -> Result<AgentOutcome<ToolCall>, AgentError> {
        let Some(tool) = &step.tool else {
            return Err(AgentError::Unresolvable(step.name.clone()));
        };
        Ok(AgentOutcome::free(ToolCall {
            tool: tool.clone(),
            args: step.args.clone(),
            confidence: 1.0,
            rationale: "declared in runbook".to_string(),
        }))
    }
}

pub struct LlmToolcaller {
    providers: ProviderRegistry,
    provider_id: Option<String>,
    model: Option<String>,
    max_attempts: u32,
}

impl LlmToolcaller {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            providers,
            provider_id: None,
            model: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_provider(mut self, provider_id: Option<String>, model: Option<String>) -> Self {
        self.provider_id = provider_id;
        self.model = model;
        self
    }
}

#[async_trait]
impl Toolcaller for LlmToolcaller {
    async fn refine(
        &self,
        step: &PlannedStep,
        context: &Value,
        catalog: &[AdapterSpec],
    ) -> Result<AgentOutcome<ToolCall>, AgentError> {
        let tools = catalog
            .iter()
            .map(|spec| {
                json!({
                    "tool": spec.tool_id,
                    "description": spec.description,
                    "args_schema": spec.args_schema,
                })
            })
            .collect::<Vec<_>>();
        let system = "You resolve one runbook step into a single concrete tool call. \
                      Reply with exactly one JSON object of the form \
                      {\"tool\":...,\"args\":{...},\"confidence\":0..1,\"rationale\":...}. \
                      Pick only tools from the catalog and fill args to satisfy their schema.";
        let user = serde_json::to_string_pretty(&json!({
            "step": step,
            "context": context,
            "tool_catalog": tools,
        }))
        .unwrap_or_default();

        let (value, usage) = complete_json(
            &self.providers,
            self.provider_id.as_deref(),
            self.model.as_deref(),
            system,
            &user,
            tool_call_validator(),
            self.max_attempts,
        )
        .await?;

        let tool = value["tool"].as_str().unwrap_or_default().to_string();
        if !is_valid_tool_id(&tool) {
            return Err(AgentError::Malformed {
                attempts: self.max_attempts,
                detail: format!("toolcaller produced malformed tool id `{tool}`"),
            });
        }
        Ok(AgentOutcome {
            value: ToolCall {
                tool,
                args: value["args"].clone(),
                confidence: value["confidence"].as_f64().unwrap_or(0.0),
                rationale: value["rationale"].as_str().unwrap_or_default().to_string(),
            },
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(tool: Option<&str>) -> PlannedStep {
        PlannedStep {
            name: "a".to_string(),
            tool: tool.map(ToString::to_string),
            args: json!({"title": "X"}),
            prompt: Some("file a ticket".to_string()),
            continue_on_error: false,
            compensates: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn stub_passes_through_declared_tools() {
        let outcome = StubToolcaller
            .refine(&step(Some("tracker.create_issue")), &json!({}), &[])
            .await
            .expect("refine");
        assert_eq!(outcome.value.tool, "tracker.create_issue");
        assert_eq!(outcome.value.args, json!({"title": "X"}));
        assert_eq!(outcome.value.confidence, 1.0);
    }

    #[tokio::test]
    async fn stub_rejects_prompt_only_steps() {
        let err = StubToolcaller
            .refine(&step(None), &json!({}), &[])
            .await
            .expect_err("no tool to pass through");
        assert!(matches!(err, AgentError::Unresolvable(_)));
    }
}
