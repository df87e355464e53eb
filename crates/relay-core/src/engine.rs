use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use relay_adapters::AdapterRegistry;
use relay_audit::{verify_export, AuditDraft, AuditEvent, AuditLog, Redactor};
use relay_observability::TelemetrySink;
use relay_policy::PolicyStore;
use relay_types::{
    Approval, ApprovalVerdict, EngineError, Run, RunEvent, RunEventKind, RunMode, RunMetrics,
    RunStatus, RunbookDoc, Step, Subject,
};

use crate::approvals::ApprovalService;
use crate::cancellation::CancellationRegistry;
use crate::config::{EnvOverrides, ExecutorConfig};
use crate::event_bus::EventBus;
use crate::executor::{AgentSet, RunExecutor};
use crate::lease::LeaseRegistry;
use crate::store::RunStore;

#[derive(Debug, Clone)]
pub struct SubmitRunRequest {
    pub tenant: String,
    pub runbook: RunbookDoc,
    pub mode: RunMode,
    pub context: Value,
    pub caller: Subject,
    pub idempotency_key: Option<String>,
}

/// Caller-facing projection of one run: terminal status, stable error code,
/// and redacted step data. Internal exception text never crosses this
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub run: Run,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExport {
    pub run: Run,
    pub steps: Vec<Step>,
    pub approvals: Vec<Approval>,
    pub audit_events: Vec<AuditEvent>,
}

/// The core's invocation surface. All API layers (spool files, future RPC
/// frontends) call through here.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn RunStore>,
    audit: Arc<AuditLog>,
    redactor: Redactor,
    policy_store: PolicyStore,
    approvals: ApprovalService,
    executor: Arc<RunExecutor>,
    bus: EventBus,
    cancellations: CancellationRegistry,
    env: EnvOverrides,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RunStore>,
        audit: Arc<AuditLog>,
        redactor: Redactor,
        adapters: AdapterRegistry,
        policy_store: PolicyStore,
        agents: AgentSet,
        telemetry: Arc<dyn TelemetrySink>,
        config: ExecutorConfig,
        env: EnvOverrides,
    ) -> Self {
        let bus = EventBus::new();
        let approvals = ApprovalService::new(store.clone(), audit.clone(), bus.clone());
        let leases = LeaseRegistry::new(Duration::from_millis(config.lease_ttl_ms));
        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            audit.clone(),
            adapters,
            agents,
            approvals.clone(),
            bus.clone(),
            leases,
            telemetry,
            config,
            env,
        ));
        Self {
            store,
            audit,
            redactor,
            policy_store,
            approvals,
            executor,
            bus,
            cancellations: CancellationRegistry::new(),
            env,
        }
    }

    pub fn policy_store(&self) -> &PolicyStore {
        &self.policy_store
    }

    /// Create a run in `pending`. A duplicate idempotency key returns the
    /// existing run id without side effects.
    pub async fn submit_run(&self, req: SubmitRunRequest) -> Result<String, EngineError> {
        req.runbook.validate()?;
        if let Some(key) = &req.idempotency_key {
            if let Some(existing) = self
                .store
                .find_run_by_idempotency_key(&req.tenant, key)
                .await?
            {
                return Ok(existing.id);
            }
        }

        let policy = self
            .policy_store
            .active(&req.tenant)
            .await
            .ok_or_else(|| {
                EngineError::Validation(format!("no active policy for tenant `{}`", req.tenant))
            })?;

        let mut mode = req.mode;
        let downgraded = self.env.dry_run_forced && mode == RunMode::Execute;
        if downgraded {
            mode = RunMode::DryRun;
        }

        let run = Run {
            id: Run::new_id(),
            tenant: req.tenant.clone(),
            caller: req.caller.clone(),
            runbook: req.runbook.clone(),
            mode,
            status: RunStatus::Pending,
            context: req.context.clone(),
            created_at: Utc::now(),
            completed_at: None,
            metrics: RunMetrics::default(),
            policy_name: policy.name.clone(),
            policy_version: policy.version.clone(),
            policy_snapshot: policy.snapshot(),
            plan: None,
            shadow: None,
            error: None,
            idempotency_key: req.idempotency_key.clone(),
        };
        self.store.create_run(&run).await?;
        self.cancellations.create(&run.id).await;

        self.audit
            .append(
                &req.tenant,
                AuditDraft::user(
                    &req.caller.id,
                    "run.submitted",
                    "run",
                    &run.id,
                    json!({
                        "runbook": req.runbook.name,
                        "version": req.runbook.version,
                        "mode": mode,
                        "policy": format!("{}@{}", policy.name, policy.version),
                    }),
                ),
            )
            .await?;
        if downgraded {
            self.audit
                .append(
                    &req.tenant,
                    AuditDraft::system(
                        "run.mode_downgraded",
                        "run",
                        &run.id,
                        json!({"from": RunMode::Execute, "to": RunMode::DryRun, "cause": "DRY_RUN_FORCED"}),
                    ),
                )
                .await?;
        }
        info!(run_id = %run.id, tenant = %req.tenant, ?mode, "run submitted");
        Ok(run.id)
    }

    /// Drive a run to its terminal status on this task.
    pub async fn run_to_completion(&self, run_id: &str) -> Result<Run, EngineError> {
        let cancel = match self.cancellations.get(run_id).await {
            Some(token) => token,
            None => self.cancellations.create(run_id).await,
        };
        let result = self.executor.execute(run_id, cancel).await;
        self.cancellations.remove(run_id).await;
        result
    }

    /// Detached execution for the long-lived engine process.
    pub fn spawn_run(&self, run_id: &str) -> tokio::task::JoinHandle<Result<Run, EngineError>> {
        let engine = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move { engine.run_to_completion(&run_id).await })
    }

    /// Request cooperative cancellation; the executor observes it at the
    /// next safe point.
    pub async fn cancel_run(&self, run_id: &str, caller: &Subject) -> Result<(), EngineError> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        self.audit
            .append(
                &run.tenant,
                AuditDraft::user(
                    &caller.id,
                    "run.cancel_requested",
                    "run",
                    run_id,
                    json!({"status": run.status}),
                ),
            )
            .await?;
        self.cancellations.cancel(run_id).await;
        Ok(())
    }

    pub async fn decide_approval(
        &self,
        approval_id: &str,
        decider: &Subject,
        verdict: ApprovalVerdict,
        comment: Option<String>,
    ) -> Result<Approval, EngineError> {
        self.approvals
            .decide(approval_id, decider, verdict, comment)
            .await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunView, EngineError> {
        let mut run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        run.context = self.redactor.redact(&run.context, &[]);
        let steps = self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .map(|mut step| {
                step.args = self.redactor.redact(&step.args, &[]);
                if let Some(output) = &step.output {
                    step.output = Some(self.redactor.redact(output, &[]));
                }
                step
            })
            .collect();
        Ok(RunView { run, steps })
    }

    /// Ordered event feed for one run, lazily following live events, and
    /// restartable from a cursor. Ends after the terminal event.
    pub fn stream_run_events(
        &self,
        run_id: &str,
        cursor: u64,
    ) -> impl Stream<Item = RunEvent> + Send {
        let store = self.store.clone();
        let mut rx = self.bus.subscribe();
        let run_id = run_id.to_string();
        async_stream::stream! {
            let mut next = cursor;
            loop {
                let stored = match store.list_run_events(&run_id, next).await {
                    Ok(events) => events,
                    Err(_) => break,
                };
                for event in stored {
                    next = event.seq + 1;
                    let terminal = event.kind == RunEventKind::RunTerminated;
                    yield event;
                    if terminal {
                        return;
                    }
                }
                // Park until something new lands on the bus, then drain the
                // store again; lag just forces an extra drain.
                match rx.recv().await {
                    Ok(event) => {
                        if event.kind != "run.event" {
                            continue;
                        }
                        if event.payload.get("run_id").and_then(Value::as_str)
                            != Some(run_id.as_str())
                        {
                            continue;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Export a run with its steps, approvals, and audit slice; the slice
    /// re-verifies on import.
    pub async fn export_run(&self, run_id: &str) -> Result<RunExport, EngineError> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let steps = self.store.list_steps(run_id).await?;
        let approvals = self.store.list_approvals(run_id).await?;
        let audit_events = self.audit.events_for_run(&run.tenant, run_id).await?;
        Ok(RunExport {
            run,
            steps,
            approvals,
            audit_events,
        })
    }

    /// Verify an export's audit slice and load its records into this store.
    pub async fn import_run(&self, export: RunExport) -> Result<(), EngineError> {
        verify_export(&export.audit_events)
            .map_err(|divergence| EngineError::Validation(divergence.to_string()))?;
        self.store.create_run(&export.run).await?;
        for step in &export.steps {
            self.store.save_step(step).await?;
        }
        for approval in &export.approvals {
            self.store.save_approval(approval).await?;
        }
        Ok(())
    }
}
