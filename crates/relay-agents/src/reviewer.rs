use async_trait::async_trait;
use serde_json::{json, Value};

use relay_policy::{PolicyAction, PolicyDecision, PolicyDocument};
use relay_types::Subject;

use crate::provider::ProviderRegistry;
use crate::schema::{complete_json, review_validator, DEFAULT_MAX_ATTEMPTS};
use crate::{AgentError, AgentOutcome};

/// The reviewer's verdict is the only thing that authorises an adapter
/// invocation. The policy evaluator's decision is always computed first and
/// handed in; an LLM reviewer may only tighten it.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub decision: PolicyDecision,
    /// Set when an LLM reviewer disagreed with the evaluator; the executor
    /// audits it.
    pub disagreement: Option<Disagreement>,
}

#[derive(Debug, Clone)]
pub struct Disagreement {
    pub llm: PolicyDecision,
    pub evaluator: PolicyDecision,
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        tool: &str,
        args: &Value,
        subject: &Subject,
        policy: &PolicyDocument,
        evaluated: &PolicyDecision,
    ) -> Result<AgentOutcome<ReviewOutcome>, AgentError>;
}

/// Delegates to the policy evaluator verbatim.
pub struct StubReviewer;

#[async_trait]
impl Reviewer for StubReviewer {
    async fn review(
        &self,
        _tool: &str,
        _args: &Value,
        _subject: &Subject,
        _policy: &PolicyDocument,
        evaluated: &PolicyDecision,
    ) -> Result<AgentOutcome<ReviewOutcome>, AgentError> {
        Ok(AgentOutcome::free(ReviewOutcome {
            decision: evaluated.clone(),
            disagreement: None,
        }))
    }
}

pub struct LlmReviewer {
    providers: ProviderRegistry,
    provider_id: Option<String>,
    model: Option<String>,
    max_attempts: u32,
}

impl LlmReviewer {
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
impl Reviewer for LlmReviewer {
    async fn review(
        &self,
        tool: &str,
        args: &Value,
        subject: &Subject,
        policy: &PolicyDocument,
        evaluated: &PolicyDecision,
    ) -> Result<AgentOutcome<ReviewOutcome>, AgentError> {
        let system = "You review one proposed tool invocation against an operations policy. \
                      Reply with exactly one JSON object of the form \
                      {\"decision\":\"allow|block|require_approval\",\"reasons\":[...]}. \
                      Be conservative: block anything the policy does not clearly permit.";
        let user = serde_json::to_string_pretty(&json!({
            "tool": tool,
            "args": args,
            "subject": subject,
            "policy": policy,
        }))
        .unwrap_or_default();

        let (value, usage) = complete_json(
            &self.providers,
            self.provider_id.as_deref(),
            self.model.as_deref(),
            system,
            &user,
            review_validator(),
            self.max_attempts,
        )
        .await?;

        let llm = PolicyDecision {
            action: match value["decision"].as_str().unwrap_or("block") {
                "allow" => PolicyAction::Allow,
                "require_approval" => PolicyAction::RequireApproval,
                _ => PolicyAction::Block,
            },
            reasons: value["reasons"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|r| r.as_str().map(ToString::to_string))
                .collect(),
        };

        Ok(AgentOutcome {
            value: intersect(evaluated, &llm),
            usage,
        })
    }
}

/// Stricter verdict wins; reasons keep evaluator order then append the LLM's.
fn intersect(evaluator: &PolicyDecision, llm: &PolicyDecision) -> ReviewOutcome {
    let action = evaluator.action.strictest(llm.action);
    let mut reasons = evaluator.reasons.clone();
    for reason in &llm.reasons {
        if !reasons.contains(reason) {
            reasons.push(reason.clone());
        }
    }
    let disagreement = (llm.action != evaluator.action).then(|| Disagreement {
        llm: llm.clone(),
        evaluator: evaluator.clone(),
    });
    ReviewOutcome {
        decision: PolicyDecision { action, reasons },
        disagreement,
    }
}
