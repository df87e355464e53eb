//! Simulated effectors: an in-memory issue tracker, cluster controller, and
//! paging system. They behave like the real integrations (state, inverses,
//! failure kinds) without leaving the process, which is what the executor
//! test suites run against.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use relay_types::EngineError;

use crate::error::AdapterError;
use crate::registry::{
    Adapter, AdapterRegistry, AdapterRegistryBuilder, InvokeContext, InvokeOutcome,
};
use crate::spec::{AdapterSpec, ToolClass};

#[derive(Debug, Clone)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub body: String,
    pub open: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceState {
    pub replicas: u64,
    pub cordoned_nodes: Vec<String>,
}

/// Shared state behind every simulated adapter, plus a counter of external
/// calls so tests can assert "adapter called exactly once" / "zero calls".
pub struct SimWorld {
    issues: RwLock<HashMap<String, Issue>>,
    services: RwLock<HashMap<String, ServiceState>>,
    pages: RwLock<Vec<Value>>,
    dedup: RwLock<HashMap<String, InvokeOutcome>>,
    issue_seq: AtomicU64,
    calls: AtomicU64,
}

impl SimWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            issues: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            pages: RwLock::new(Vec::new()),
            dedup: RwLock::new(HashMap::new()),
            issue_seq: AtomicU64::new(1),
            calls: AtomicU64::new(0),
        })
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn issue(&self, id: &str) -> Option<Issue> {
        self.issues.read().await.get(id).cloned()
    }

    pub async fn service(&self, name: &str) -> Option<ServiceState> {
        self.services.read().await.get(name).cloned()
    }

    pub async fn page_count(&self) -> usize {
        self.pages.read().await.len()
    }
}

/// Register the full simulated effector set on a builder.
pub fn register_sim_adapters(
    builder: AdapterRegistryBuilder,
    world: Arc<SimWorld>,
) -> Result<AdapterRegistryBuilder, EngineError> {
    builder
        .register(Arc::new(TrackerCreateIssue(world.clone())))?
        .register(Arc::new(TrackerCloseIssue(world.clone())))?
        .register(Arc::new(TrackerReadIssue(world.clone())))?
        .register(Arc::new(ClusterScale(world.clone())))?
        .register(Arc::new(ClusterRestart(world.clone())))?
        .register(Arc::new(ClusterCordon(world.clone())))?
        .register(Arc::new(ClusterUncordon(world.clone())))?
        .register(Arc::new(PagerPage(world.clone())))?
        .register(Arc::new(PagerAck(world)))
}

/// Convenience for tests: a registry with only the simulated set.
pub fn sim_registry(world: Arc<SimWorld>) -> Result<AdapterRegistry, EngineError> {
    Ok(register_sim_adapters(AdapterRegistry::builder(), world)?.build())
}

fn arg_str(args: &Value, key: &str) -> Result<String, AdapterError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| AdapterError::validation(format!("missing `{key}`")))
}

/// Compensation calls arrive as `{original_args, original_output}`; first-class
/// calls carry the field directly.
fn direct_or_compensated<'a>(args: &'a Value, key: &str) -> Option<&'a Value> {
    args.get(key)
        .or_else(|| args.get("original_output")?.get(key))
}

struct TrackerCreateIssue(Arc<SimWorld>);

#[async_trait]
impl Adapter for TrackerCreateIssue {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "tracker.create_issue",
            "file an issue in the tracker",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "body": {"type": "string"}
                },
                "required": ["title"]
            }),
        )
        .classified(ToolClass::Write)
        .idempotent(false)
        .compensated_by("tracker.close_issue")
    }

    async fn invoke(&self, args: Value, ctx: &InvokeContext) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let title = arg_str(&args, "title")?;
        let body = args
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let id = format!("ISS-{}", self.0.issue_seq.fetch_add(1, Ordering::SeqCst));
        self.0.issues.write().await.insert(
            id.clone(),
            Issue {
                id: id.clone(),
                title: title.clone(),
                body,
                open: true,
            },
        );
        let outcome = InvokeOutcome::new(json!({"id": id, "title": title}));
        if let Some(token) = &ctx.dedup_token {
            self.0
                .dedup
                .write()
                .await
                .insert(token.clone(), outcome.clone());
        }
        Ok(outcome)
    }

    async fn lookup(&self, token: &str) -> Option<InvokeOutcome> {
        self.0.dedup.read().await.get(token).cloned()
    }
}

struct TrackerCloseIssue(Arc<SimWorld>);

#[async_trait]
impl Adapter for TrackerCloseIssue {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "tracker.close_issue",
            "close an issue by id",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "original_args": {"type": "object"},
                    "original_output": {"type": "object"}
                }
            }),
        )
        .classified(ToolClass::Write)
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let id = direct_or_compensated(&args, "id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::validation("missing `id`"))?
            .to_string();
        let mut issues = self.0.issues.write().await;
        let Some(issue) = issues.get_mut(&id) else {
            return Err(AdapterError::permanent(format!("no such issue `{id}`")));
        };
        issue.open = false;
        Ok(InvokeOutcome::new(json!({"id": id, "open": false})))
    }
}

struct TrackerReadIssue(Arc<SimWorld>);

#[async_trait]
impl Adapter for TrackerReadIssue {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "tracker.read_issue",
            "read an issue by id",
            json!({
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"]
            }),
        )
        .classified(ToolClass::Read)
        .interruptible()
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let id = arg_str(&args, "id")?;
        match self.0.issues.read().await.get(&id) {
            Some(issue) => Ok(InvokeOutcome::new(json!({
                "id": issue.id,
                "title": issue.title,
                "body": issue.body,
                "open": issue.open
            }))),
            None => Err(AdapterError::permanent(format!("no such issue `{id}`"))),
        }
    }
}

struct ClusterScale(Arc<SimWorld>);

#[async_trait]
impl Adapter for ClusterScale {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "cluster.scale",
            "set the replica count of a service",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string"},
                    "replicas": {"type": "integer", "minimum": 0},
                    "original_args": {"type": "object"},
                    "original_output": {"type": "object"}
                }
            }),
        )
        .classified(ToolClass::Write)
        .compensated_by("cluster.scale")
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        // A compensation call restores the previous replica count.
        let (service, replicas) = if let Some(original) = args.get("original_output") {
            let service = original
                .get("service")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AdapterError::validation("missing `service`"))?;
            let previous = original
                .get("previous_replicas")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| AdapterError::validation("missing `previous_replicas`"))?;
            (service.to_string(), previous)
        } else {
            let service = arg_str(&args, "service")?;
            let replicas = args
                .get("replicas")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| AdapterError::validation("missing `replicas`"))?;
            (service, replicas)
        };
        let mut services = self.0.services.write().await;
        let state = services.entry(service.clone()).or_default();
        let previous = state.replicas;
        state.replicas = replicas;
        Ok(InvokeOutcome::new(json!({
            "service": service,
            "previous_replicas": previous,
            "replicas": replicas
        })))
    }
}

struct ClusterRestart(Arc<SimWorld>);

#[async_trait]
impl Adapter for ClusterRestart {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "cluster.restart_service",
            "rolling-restart a service",
            json!({
                "type": "object",
                "properties": {"service": {"type": "string"}},
                "required": ["service"]
            }),
        )
        .classified(ToolClass::Destructive)
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let service = arg_str(&args, "service")?;
        if self.0.services.read().await.get(&service).is_none() {
            self.0
                .services
                .write()
                .await
                .entry(service.clone())
                .or_default();
        }
        Ok(InvokeOutcome::new(json!({"service": service, "restarted": true})))
    }
}

struct ClusterCordon(Arc<SimWorld>);

#[async_trait]
impl Adapter for ClusterCordon {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "cluster.cordon",
            "mark a node unschedulable",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string"},
                    "node": {"type": "string"},
                    "original_args": {"type": "object"},
                    "original_output": {"type": "object"}
                }
            }),
        )
        .classified(ToolClass::Write)
        .compensated_by("cluster.uncordon")
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let service = arg_str(&args, "service")?;
        let node = arg_str(&args, "node")?;
        let mut services = self.0.services.write().await;
        let state = services.entry(service.clone()).or_default();
        if !state.cordoned_nodes.contains(&node) {
            state.cordoned_nodes.push(node.clone());
        }
        Ok(InvokeOutcome::new(json!({"service": service, "node": node})))
    }
}

struct ClusterUncordon(Arc<SimWorld>);

#[async_trait]
impl Adapter for ClusterUncordon {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "cluster.uncordon",
            "mark a node schedulable again",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string"},
                    "node": {"type": "string"},
                    "original_args": {"type": "object"},
                    "original_output": {"type": "object"}
                }
            }),
        )
        .classified(ToolClass::Write)
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let service = direct_or_compensated(&args, "service")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::validation("missing `service`"))?
            .to_string();
        let node = direct_or_compensated(&args, "node")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::validation("missing `node`"))?
            .to_string();
        let mut services = self.0.services.write().await;
        let state = services.entry(service.clone()).or_default();
        state.cordoned_nodes.retain(|n| n != &node);
        Ok(InvokeOutcome::new(json!({"service": service, "node": node})))
    }
}

struct PagerPage(Arc<SimWorld>);

#[async_trait]
impl Adapter for PagerPage {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "pager.page",
            "page an on-call rotation",
            json!({
                "type": "object",
                "properties": {
                    "routing_key": {"type": "string", "secret": true},
                    "summary": {"type": "string"}
                },
                "required": ["summary"]
            }),
        )
        .classified(ToolClass::Write)
        .idempotent(false)
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let summary = arg_str(&args, "summary")?;
        let mut pages = self.0.pages.write().await;
        let id = format!("PG-{}", pages.len() + 1);
        pages.push(json!({"id": id, "summary": summary}));
        Ok(InvokeOutcome::new(json!({"id": id})))
    }
}

struct PagerAck(Arc<SimWorld>);

#[async_trait]
impl Adapter for PagerAck {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new(
            "pager.ack",
            "acknowledge a page",
            json!({
                "type": "object",
                "properties": {"page_id": {"type": "string"}},
                "required": ["page_id"]
            }),
        )
        .classified(ToolClass::Write)
    }

    async fn invoke(
        &self,
        args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.0.record_call();
        let page_id = arg_str(&args, "page_id")?;
        Ok(InvokeOutcome::new(json!({"page_id": page_id, "acked": true})))
    }
}

/// Test double that replays a scripted sequence of outcomes, one per call.
/// Once the script runs dry, further calls fail permanently.
pub struct ScriptedAdapter {
    spec: AdapterSpec,
    script: Mutex<VecDeque<Result<Value, AdapterError>>>,
    calls: AtomicU64,
}

impl ScriptedAdapter {
    pub fn new(spec: AdapterSpec, script: Vec<Result<Value, AdapterError>>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            script: Mutex::new(script.into()),
            calls: AtomicU64::new(0),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn spec(&self) -> AdapterSpec {
        self.spec.clone()
    }

    async fn invoke(
        &self,
        _args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Ok(output)) => Ok(InvokeOutcome::new(output)),
            Some(Err(err)) => Err(err),
            None => Err(AdapterError::permanent("script exhausted")),
        }
    }
}
