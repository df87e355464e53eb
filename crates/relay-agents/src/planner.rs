use async_trait::async_trait;
use serde_json::{json, Value};

use relay_adapters::AdapterSpec;
use relay_types::{PlannedStep, RunbookDoc};

use crate::provider::ProviderRegistry;
use crate::schema::{complete_json, plan_validator, DEFAULT_MAX_ATTEMPTS};
use crate::{AgentError, AgentOutcome};

/// Runbook document + context + tool catalog -> ordered candidate steps.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        runbook: &RunbookDoc,
        context: &Value,
        catalog: &[AdapterSpec],
    ) -> Result<AgentOutcome<Vec<PlannedStep>>, AgentError>;
}

/// Deterministic mode: reads explicit `tool`+`args` pairs verbatim. Prompt
/// steps keep their prompt for the toolcaller to refine later.
pub struct StubPlanner;

#[async_trait]
impl Planner for StubPlanner {
    async fn plan(
        &self,
        runbook: &RunbookDoc,
        _context: &Value,
        _catalog: &[AdapterSpec],
    ) -> Result<AgentOutcome<Vec<PlannedStep>>, AgentError> {
        let steps = runbook
            .steps
            .iter()
            .map(|template| PlannedStep {
                name: template.name.clone(),
                tool: template.tool.clone(),
                args: template.args.clone().unwrap_or_else(|| json!({})),
                prompt: template.prompt.clone(),
                continue_on_error: template.continue_on_error,
                compensates: template.compensates.clone(),
                timeout_ms: template.timeout_ms,
            })
            .collect();
        Ok(AgentOutcome::free(steps))
    }
}

/// LLM mode: the model materializes `{steps:[{name,tool,args}]}` from the
/// runbook text; non-conforming output is re-prompted up to the bound.
pub struct LlmPlanner {
    providers: ProviderRegistry,
    provider_id: Option<String>,
    model: Option<String>,
    max_attempts: u32,
}

impl LlmPlanner {
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
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        runbook: &RunbookDoc,
        context: &Value,
        catalog: &[AdapterSpec],
    ) -> Result<AgentOutcome<Vec<PlannedStep>>, AgentError> {
        let tools = catalog
            .iter()
            .filter(|spec| {
                runbook.tool_hint.is_empty() || runbook.tool_hint.contains(&spec.tool_id)
            })
            .map(|spec| {
                json!({
                    "tool": spec.tool_id,
                    "description": spec.description,
                    "args_schema": spec.args_schema,
                })
            })
            .collect::<Vec<_>>();
        let system = "You turn an operational runbook into an ordered list of tool invocations. \
                      Reply with exactly one JSON object of the form \
                      {\"steps\":[{\"name\":...,\"tool\":...,\"args\":{...}}]}. \
                      Use only tools from the catalog. Do not invent steps the runbook \
                      does not ask for.";
        let user = serde_json::to_string_pretty(&json!({
            "runbook": runbook,
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
            plan_validator(),
            self.max_attempts,
        )
        .await?;

        let mut steps = Vec::new();
        let by_name = |name: &str| runbook.steps.iter().find(|t| t.name == name);
        for entry in value["steps"].as_array().into_iter().flatten() {
            let name = entry["name"].as_str().unwrap_or_default().to_string();
            // Carry runbook flags across for steps the model kept by name.
            let template = by_name(&name);
            steps.push(PlannedStep {
                name,
                tool: entry["tool"].as_str().map(ToString::to_string),
                args: entry["args"].clone(),
                prompt: None,
                continue_on_error: template.map(|t| t.continue_on_error).unwrap_or(false),
                compensates: template.and_then(|t| t.compensates.clone()),
                timeout_ms: template.and_then(|t| t.timeout_ms),
            });
        }
        Ok(AgentOutcome { value: steps, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, Completion, Provider, ProviderInfo, TokenUsage};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    pub(crate) struct FakeProvider {
        replies: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        pub(crate) fn registry(replies: &[&str]) -> ProviderRegistry {
            let provider: Arc<dyn Provider> = Arc::new(FakeProvider {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
            });
            ProviderRegistry::with_providers(vec![provider], None)
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "fake".to_string(),
                name: "Fake".to_string(),
                default_model: "gpt-4o-mini".to_string(),
            }
        }

        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _model_override: Option<&str>,
        ) -> anyhow::Result<Completion> {
            let text = self
                .replies
                .lock()
                .await
                .pop()
                .unwrap_or_else(|| "out of replies".to_string());
            Ok(Completion {
                text,
                model: "gpt-4o-mini".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 40,
                },
            })
        }
    }

    #[tokio::test]
    async fn llm_planner_retries_malformed_output_and_pays_for_it() {
        let registry = FakeProvider::registry(&[
            "not json at all",
            r#"{"steps":[{"name":"file-ticket","tool":"tracker.create_issue","args":{"title":"X"}}]}"#,
        ]);
        let planner = LlmPlanner::new(registry);
        let doc = RunbookDoc::parse("name: rb\nsteps:\n  - {name: file-ticket, prompt: file it}\n")
            .expect("valid runbook");
        let outcome = planner
            .plan(&doc, &json!({}), &[])
            .await
            .expect("plan on second attempt");
        assert_eq!(outcome.value.len(), 1);
        assert_eq!(outcome.value[0].tool.as_deref(), Some("tracker.create_issue"));
        // Both attempts accrue: 2 x (100 in, 40 out).
        assert_eq!(outcome.usage.tokens_in, 200);
        assert_eq!(outcome.usage.tokens_out, 80);
        assert!(outcome.usage.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn llm_planner_surfaces_malformed_after_bounded_retries() {
        let registry = FakeProvider::registry(&["nope", "still nope", "{\"wrong\": 1}"]);
        let planner = LlmPlanner::new(registry);
        let doc = RunbookDoc::parse("name: rb\nsteps:\n  - {name: a, prompt: do it}\n")
            .expect("valid runbook");
        let err = planner
            .plan(&doc, &json!({}), &[])
            .await
            .expect_err("exhausted retries");
        assert!(matches!(err, AgentError::Malformed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn stub_planner_reads_document_verbatim() {
        let doc = RunbookDoc::parse(
            r#"
name: rb
steps:
  - {name: a, tool: tracker.create_issue, args: {title: X}}
  - {name: b, prompt: "page the on-call", continue_on_error: true}
"#,
        )
        .expect("valid runbook");
        let outcome = StubPlanner
            .plan(&doc, &json!({}), &[])
            .await
            .expect("stub plan");
        assert_eq!(outcome.value.len(), 2);
        assert_eq!(outcome.value[0].tool.as_deref(), Some("tracker.create_issue"));
        assert_eq!(outcome.value[0].args, json!({"title": "X"}));
        assert!(outcome.value[1].tool.is_none());
        assert_eq!(outcome.value[1].prompt.as_deref(), Some("page the on-call"));
        assert!(outcome.value[1].continue_on_error);
        assert_eq!(outcome.usage, Default::default());
    }
}
