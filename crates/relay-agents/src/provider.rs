use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use relay_types::StepUsage;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub default_model: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

impl Completion {
    /// Tokens and dollars this completion cost, as step usage.
    pub fn step_usage(&self) -> StepUsage {
        StepUsage {
            tokens_in: self.usage.prompt_tokens,
            tokens_out: self.usage.completion_tokens,
            cost_usd: completion_cost_usd(&self.model, &self.usage),
            wall_ms: 0,
        }
    }
}

/// Per-1k-token prices keyed by model prefix. Unknown models cost zero and
/// log a warning so budget caps stay honest.
const MODEL_PRICES_PER_1K: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.000_15, 0.000_6),
    ("gpt-4o", 0.002_5, 0.01),
    ("claude-3-5-haiku", 0.000_8, 0.004),
    ("claude-3-5-sonnet", 0.003, 0.015),
    ("llama", 0.000_05, 0.000_08),
];

pub fn completion_cost_usd(model: &str, usage: &TokenUsage) -> f64 {
    let Some((_, input, output)) = MODEL_PRICES_PER_1K
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
    else {
        warn!(model, "no price configured for model; counting zero cost");
        return 0.0;
    };
    (usage.prompt_tokens as f64 / 1000.0) * input
        + (usage.completion_tokens as f64 / 1000.0) * output
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
    ) -> anyhow::Result<Completion>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn Provider>>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: AgentsConfig) -> Self {
        Self {
            providers: Arc::new(build_providers(&config)),
            default_provider: config.default_provider,
        }
    }

    /// A registry backed by explicit provider instances; tests use this to
    /// inject deterministic fakes.
    pub fn with_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(providers),
            default_provider,
        }
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub async fn complete(
        &self,
        provider_id: Option<&str>,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
    ) -> anyhow::Result<Completion> {
        let provider = self.select(provider_id)?;
        provider.complete(messages, model_override).await
    }

    fn select(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        if let Some(id) = provider_id {
            if let Some(provider) = self.providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            let available = self
                .providers
                .iter()
                .map(|p| p.info().id)
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::bail!("provider `{id}` is not configured. configured providers: {available}");
        }
        if let Some(default_id) = &self.default_provider {
            if let Some(provider) = self.providers.iter().find(|p| &p.info().id == default_id) {
                return Ok(provider.clone());
            }
        }
        let Some(provider) = self.providers.first() else {
            anyhow::bail!("no provider configured");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &AgentsConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_compat(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_compat(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_compat(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );

    if let Some(anthropic) = config.providers.get("anthropic") {
        providers.push(Arc::new(AnthropicProvider {
            api_key: anthropic
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(ToString::to_string)
                .or_else(|| {
                    std::env::var("ANTHROPIC_API_KEY")
                        .ok()
                        .filter(|v| !v.trim().is_empty())
                }),
            default_model: anthropic
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            client: Client::new(),
        }));
    }

    providers
}

fn add_openai_compat(
    config: &AgentsConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    requires_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    let api_key = entry
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(ToString::to_string);
    if requires_key && api_key.is_none() {
        return;
    }
    providers.push(Arc::new(OpenAiCompatProvider {
        id: id.to_string(),
        name: name.to_string(),
        api_key,
        url: entry.url.clone().unwrap_or_else(|| default_url.to_string()),
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(key: &str) -> bool {
    let key = key.trim();
    key.is_empty() || key.eq_ignore_ascii_case("changeme") || key.starts_with("<")
}

struct OpenAiCompatProvider {
    id: String,
    name: String,
    api_key: Option<String>,
    url: String,
    default_model: String,
    client: Client,
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            default_model: self.default_model.clone(),
        }
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
    ) -> anyhow::Result<Completion> {
        let model = model_override.unwrap_or(&self.default_model).to_string();
        let body = json!({
            "model": model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
        });
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "provider `{}` returned {}: {}",
                self.id,
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        let value: serde_json::Value = response.json().await?;
        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(Completion {
            text,
            model,
            usage: TokenUsage {
                prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            },
        })
    }
}

struct AnthropicProvider {
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            default_model: self.default_model.clone(),
        }
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
    ) -> anyhow::Result<Completion> {
        let Some(key) = &self.api_key else {
            anyhow::bail!("anthropic api key not configured");
        };
        let model = model_override.unwrap_or(&self.default_model).to_string();
        let system = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        let body = json!({
            "model": model,
            "max_tokens": 4096,
            "system": system,
            "messages": messages
                .iter()
                .filter(|m| m.role != "system")
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "anthropic returned {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        let value: serde_json::Value = response.json().await?;
        let text = value["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(Completion {
            text,
            model,
            usage: TokenUsage {
                prompt_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
                completion_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_prices_accrue() {
        let usage = TokenUsage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
        };
        let cost = completion_cost_usd("gpt-4o-mini-2024", &usage);
        assert!((cost - 0.000_75).abs() < 1e-9);
        assert_eq!(completion_cost_usd("mystery-model", &usage), 0.0);
    }

    #[test]
    fn placeholder_keys_are_filtered() {
        assert!(is_placeholder_api_key(""));
        assert!(is_placeholder_api_key("  "));
        assert!(is_placeholder_api_key("<your-key-here>"));
        assert!(!is_placeholder_api_key("sk-real"));
    }
}
