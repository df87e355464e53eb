use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{timeout, Duration};

use relay_types::{is_valid_tool_id, EngineError, RunMode};

use crate::error::{AdapterError, AdapterErrorKind};
use crate::spec::AdapterSpec;

/// Per-invocation context handed to an adapter. Adapters may have external
/// side effects but must not consult other adapters or the run store.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub tenant: String,
    pub run_id: String,
    pub step_index: usize,
    pub mode: RunMode,
    pub context: Value,
    /// Present when the executor brackets a non-idempotent call.
    pub dedup_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeUsage {
    pub wall_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOutcome {
    pub output: Value,
    #[serde(default)]
    pub usage: InvokeUsage,
}

impl InvokeOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: InvokeUsage::default(),
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn spec(&self) -> AdapterSpec;
    async fn invoke(&self, args: Value, ctx: &InvokeContext) -> Result<InvokeOutcome, AdapterError>;

    /// Idempotency reconcile API: the recorded outcome for a dedup token, if
    /// this effector tracks one. `None` means the outcome is unknown.
    async fn lookup(&self, _token: &str) -> Option<InvokeOutcome> {
        None
    }
}

struct Entry {
    adapter: Arc<dyn Adapter>,
    spec: AdapterSpec,
    validator: Validator,
}

/// Immutable after `build()`; the executor never mutates it mid-flight.
#[derive(Clone)]
pub struct AdapterRegistry {
    entries: Arc<HashMap<String, Entry>>,
}

#[derive(Default)]
pub struct AdapterRegistryBuilder {
    entries: HashMap<String, Entry>,
}

impl AdapterRegistryBuilder {
    pub fn register(mut self, adapter: Arc<dyn Adapter>) -> Result<Self, EngineError> {
        let spec = adapter.spec();
        if !is_valid_tool_id(&spec.tool_id) {
            return Err(EngineError::Validation(format!(
                "malformed tool id `{}`",
                spec.tool_id
            )));
        }
        if self.entries.contains_key(&spec.tool_id) {
            return Err(EngineError::Validation(format!(
                "tool `{}` registered twice",
                spec.tool_id
            )));
        }
        let validator = jsonschema::validator_for(&spec.args_schema).map_err(|err| {
            EngineError::Validation(format!(
                "tool `{}` has an invalid args schema: {err}",
                spec.tool_id
            ))
        })?;
        self.entries.insert(
            spec.tool_id.clone(),
            Entry {
                adapter,
                spec,
                validator,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> AdapterRegistry {
        AdapterRegistry {
            entries: Arc::new(self.entries),
        }
    }
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::default()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.entries.contains_key(tool_id)
    }

    pub fn spec(&self, tool_id: &str) -> Option<&AdapterSpec> {
        self.entries.get(tool_id).map(|entry| &entry.spec)
    }

    /// All registered specs, sorted by tool id.
    pub fn catalog(&self) -> Vec<AdapterSpec> {
        let mut specs = self
            .entries
            .values()
            .map(|entry| entry.spec.clone())
            .collect::<Vec<_>>();
        specs.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        specs
    }

    /// JSON pointer of the first schema violation, if any. Unknown tools
    /// report no violation; the allowlist gate rejects those earlier.
    pub fn first_schema_violation(&self, tool_id: &str, args: &Value) -> Option<String> {
        let entry = self.entries.get(tool_id)?;
        entry
            .validator
            .validate(args)
            .err()
            .map(|err| err.instance_path.to_string())
    }

    /// Check args against the adapter's schema. The error message carries the
    /// JSON pointer of the first failing location.
    pub fn validate_args(&self, tool_id: &str, args: &Value) -> Result<(), AdapterError> {
        if !self.entries.contains_key(tool_id) {
            return Err(AdapterError::validation(format!("unknown tool `{tool_id}`")));
        }
        if let Some(pointer) = self.first_schema_violation(tool_id, args) {
            return Err(AdapterError::validation(format!(
                "schema violation at `{}`",
                if pointer.is_empty() { "/" } else { &pointer }
            )));
        }
        Ok(())
    }

    /// Invoke an effector with the adapter's wall-clock budget (or the
    /// per-step override) enforced. The measured wall time always wins over
    /// whatever the adapter self-reported, so `wall_ms` is never zero for a
    /// real call.
    pub async fn invoke(
        &self,
        tool_id: &str,
        args: Value,
        ctx: &InvokeContext,
        timeout_override_ms: Option<u64>,
    ) -> Result<InvokeOutcome, AdapterError> {
        let Some(entry) = self.entries.get(tool_id) else {
            return Err(AdapterError::validation(format!("unknown tool `{tool_id}`")));
        };
        let budget_ms = timeout_override_ms.unwrap_or(entry.spec.timeout_ms);
        let started = Instant::now();
        let result = timeout(
            Duration::from_millis(budget_ms),
            entry.adapter.invoke(args, ctx),
        )
        .await;
        let wall_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(mut outcome)) => {
                outcome.usage.wall_ms = outcome.usage.wall_ms.max(wall_ms);
                Ok(outcome)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AdapterError::new(
                AdapterErrorKind::Timeout,
                format!("tool `{tool_id}` exceeded its {budget_ms}ms budget"),
            )),
        }
    }

    pub async fn lookup(&self, tool_id: &str, token: &str) -> Option<InvokeOutcome> {
        self.entries.get(tool_id)?.adapter.lookup(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ToolClass;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Adapter for Echo {
        fn spec(&self) -> AdapterSpec {
            AdapterSpec::new(
                "test.echo",
                "echo args back",
                json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"]
                }),
            )
            .classified(ToolClass::Read)
        }

        async fn invoke(
            &self,
            args: Value,
            _ctx: &InvokeContext,
        ) -> Result<InvokeOutcome, AdapterError> {
            Ok(InvokeOutcome::new(args))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Adapter for Sleeper {
        fn spec(&self) -> AdapterSpec {
            AdapterSpec::new("test.sleep", "sleep forever", json!({"type": "object"}))
                .timeout_ms(20)
        }

        async fn invoke(
            &self,
            _args: Value,
            _ctx: &InvokeContext,
        ) -> Result<InvokeOutcome, AdapterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(InvokeOutcome::new(Value::Null))
        }
    }

    fn ctx() -> InvokeContext {
        InvokeContext {
            tenant: "acme".to_string(),
            run_id: "run-1".to_string(),
            step_index: 0,
            mode: RunMode::Execute,
            context: json!({}),
            dedup_token: None,
        }
    }

    #[tokio::test]
    async fn validates_args_with_pointer() {
        let registry = AdapterRegistry::builder()
            .register(Arc::new(Echo))
            .expect("register")
            .build();
        let err = registry
            .validate_args("test.echo", &json!({"msg": 7}))
            .expect_err("wrong type");
        assert_eq!(err.kind, AdapterErrorKind::ValidationFailed);
        assert!(err.message.contains("/msg"), "pointer missing: {}", err.message);
        registry
            .validate_args("test.echo", &json!({"msg": "hello"}))
            .expect("valid args");
    }

    #[tokio::test]
    async fn enforces_wall_clock_budget() {
        let registry = AdapterRegistry::builder()
            .register(Arc::new(Sleeper))
            .expect("register")
            .build();
        let err = registry
            .invoke("test.sleep", json!({}), &ctx(), None)
            .await
            .expect_err("must time out");
        assert_eq!(err.kind, AdapterErrorKind::Timeout);
    }

    #[tokio::test]
    async fn rejects_duplicate_registration() {
        let builder = AdapterRegistry::builder()
            .register(Arc::new(Echo))
            .expect("first");
        assert!(builder.register(Arc::new(Echo)).is_err());
    }
}
