use std::sync::Arc;

use serde_json::json;

use relay_adapters::sim::{register_sim_adapters, SimWorld};
use relay_adapters::{AdapterRegistry, AdapterRegistryBuilder};
use relay_audit::{AuditLog, MemorySink, Redactor};
use relay_core::{
    AgentSet, Engine, EnvOverrides, ExecutorConfig, MemoryRunStore, SubmitRunRequest,
};
use relay_observability::default_telemetry;
use relay_policy::{PolicyDocument, PolicyStore};
use relay_types::{Run, RunMode, RunbookDoc, Subject};

pub const TENANT: &str = "acme";

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryRunStore>,
    pub audit: Arc<AuditLog>,
    pub world: Arc<SimWorld>,
}

pub fn default_policy() -> PolicyDocument {
    PolicyDocument::parse(
        r#"
name: base
version: "1"
roles: [Admin, Viewer, Approver]
tool_allowlist:
  Admin: ["tracker.*", "cluster.*", "pager.*", "test.*"]
  Viewer: ["tracker.read_issue"]
"#,
    )
    .expect("default test policy")
}

pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 4,
        ..ExecutorConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(|b| b, fast_config(), default_policy(), AgentSet::stub()).await
}

pub async fn harness_with(
    extra_adapters: impl FnOnce(AdapterRegistryBuilder) -> AdapterRegistryBuilder,
    config: ExecutorConfig,
    policy: PolicyDocument,
    agents: AgentSet,
) -> Harness {
    let world = SimWorld::new();
    let builder =
        register_sim_adapters(AdapterRegistry::builder(), world.clone()).expect("sim adapters");
    let registry = extra_adapters(builder).build();

    let store = Arc::new(MemoryRunStore::new());
    let audit = Arc::new(AuditLog::new(
        Arc::new(MemorySink::new()),
        Redactor::new("test-salt"),
    ));
    let policy_store = PolicyStore::new();
    policy_store
        .activate(TENANT, policy)
        .await
        .expect("activate policy");

    let engine = Engine::new(
        store.clone(),
        audit.clone(),
        Redactor::new("test-salt"),
        registry,
        policy_store,
        agents,
        default_telemetry(),
        config,
        EnvOverrides::default(),
    );
    Harness {
        engine,
        store,
        audit,
        world,
    }
}

pub fn admin() -> Subject {
    Subject::new("ada", &["Admin"])
}

pub fn request(runbook_yaml: &str, mode: RunMode, caller: Subject) -> SubmitRunRequest {
    SubmitRunRequest {
        tenant: TENANT.to_string(),
        runbook: RunbookDoc::parse(runbook_yaml).expect("test runbook"),
        mode,
        context: json!({}),
        caller,
        idempotency_key: None,
    }
}

pub async fn submit_and_run(harness: &Harness, req: SubmitRunRequest) -> Run {
    let run_id = harness.engine.submit_run(req).await.expect("submit");
    harness
        .engine
        .run_to_completion(&run_id)
        .await
        .expect("execute")
}
