use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument};

use relay_adapters::{
    AdapterError, AdapterRegistry, AdapterSpec, InvokeContext, InvokeOutcome, ShadowShim,
};
use relay_agents::{comparator, AgentError, Planner, Reviewer, StubPlanner, StubReviewer,
    StubToolcaller, Toolcaller};
use relay_audit::{AuditDraft, AuditLog};
use relay_policy::{
    evaluate, BlockBehavior, EvalRequest, PolicyAction, PolicyDocument, StepEstimate,
};
use relay_observability::{step_span, TelemetrySink};
use relay_types::{
    EngineError, EngineEvent, PlannedStep, Run, RunError, RunEventKind, RunMode, RunStatus, Step,
    StepError, StepStatus, StepUsage,
};

use crate::approvals::ApprovalService;
use crate::config::{EnvOverrides, ExecutorConfig};
use crate::event_bus::EventBus;
use crate::lease::LeaseRegistry;
use crate::store::{DedupRecord, RunStore};

/// The three agent roles wired into the executor.
#[derive(Clone)]
pub struct AgentSet {
    pub planner: Arc<dyn Planner>,
    pub toolcaller: Arc<dyn Toolcaller>,
    pub reviewer: Arc<dyn Reviewer>,
}

impl AgentSet {
    pub fn stub() -> Self {
        Self {
            planner: Arc::new(StubPlanner),
            toolcaller: Arc::new(StubToolcaller),
            reviewer: Arc::new(StubReviewer),
        }
    }
}

enum StepVerdict {
    Advance,
    /// `step_failed` is true only when the step itself reached `failed`;
    /// blocked steps never invoked anything and must not trigger
    /// compensation.
    RunFailed { error: RunError, step_failed: bool },
}

/// Drives a run from creation to a terminal status: durable, idempotent on
/// resume, and observable. One executor instance holds the run's lease for
/// the duration; a lost lease aborts without further mutation.
pub struct RunExecutor {
    store: Arc<dyn RunStore>,
    audit: Arc<AuditLog>,
    adapters: AdapterRegistry,
    agents: AgentSet,
    approvals: ApprovalService,
    bus: EventBus,
    leases: LeaseRegistry,
    telemetry: Arc<dyn TelemetrySink>,
    config: ExecutorConfig,
    env: EnvOverrides,
}

impl RunExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RunStore>,
        audit: Arc<AuditLog>,
        adapters: AdapterRegistry,
        agents: AgentSet,
        approvals: ApprovalService,
        bus: EventBus,
        leases: LeaseRegistry,
        telemetry: Arc<dyn TelemetrySink>,
        config: ExecutorConfig,
        env: EnvOverrides,
    ) -> Self {
        Self {
            store,
            audit,
            adapters,
            agents,
            approvals,
            bus,
            leases,
            telemetry,
            config,
            env,
        }
    }

    pub async fn execute(
        &self,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<Run, EngineError> {
        let lease = self.leases.acquire(run_id)?;
        let mut run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let policy = PolicyDocument::from_snapshot(&run.policy_snapshot)?;
        let span = relay_observability::run_span(&run.tenant, &run.id);

        let result = async {
            if run.status == RunStatus::Pending {
                self.transition(&mut run, RunStatus::Running).await?;
                self.audit
                    .append(
                        &run.tenant,
                        AuditDraft::system(
                            "run.started",
                            "run",
                            &run.id,
                            json!({"mode": run.mode, "runbook": run.runbook.name}),
                        ),
                    )
                    .await?;
                self.telemetry.counter("runs_started", 1);
            }

            let plan = self.materialize_plan(&mut run).await?;
            let shim = ShadowShim::new();
            let deadline = run
                .runbook
                .deadline_ms
                .map(|ms| run.created_at + ChronoDuration::milliseconds(ms as i64));

            for (index, planned) in plan.iter().enumerate() {
                if cancel.is_cancelled() {
                    self.finish(&mut run, RunStatus::Cancelled, None).await?;
                    return Ok(run.clone());
                }
                if let Some(deadline) = deadline {
                    if Utc::now() > deadline {
                        let error = RunError {
                            code: "timeout".to_string(),
                            reason: "run deadline exceeded".to_string(),
                            step_index: Some(index),
                        };
                        self.finish(&mut run, RunStatus::Failed, Some(error)).await?;
                        return Ok(run.clone());
                    }
                }
                lease.renew()?;

                // Idempotent resume: terminal steps are never re-run.
                let existing = self
                    .store
                    .list_steps(&run.id)
                    .await?
                    .into_iter()
                    .find(|s| s.index == index && s.compensates_step_index.is_none());
                if existing.as_ref().is_some_and(|s| s.status.is_terminal()) {
                    continue;
                }

                let verdict = self
                    .run_step(&mut run, &policy, planned, index, existing, &shim, &cancel, &lease)
                    .await?;
                match verdict {
                    StepVerdict::Advance => {}
                    StepVerdict::RunFailed { error, step_failed } => {
                        if step_failed && run.mode == RunMode::Execute {
                            self.compensate(&mut run, error.step_index.unwrap_or(index))
                                .await?;
                        }
                        self.finish(&mut run, RunStatus::Failed, Some(error)).await?;
                        return Ok(run.clone());
                    }
                }
                // Cancellation during an approval wait or retry backoff ends
                // the run inside run_step.
                if run.status.is_terminal() {
                    return Ok(run.clone());
                }
                if cancel.is_cancelled() {
                    self.finish(&mut run, RunStatus::Cancelled, None).await?;
                    return Ok(run.clone());
                }
            }

            if run.mode == RunMode::Shadow {
                let reference = reference_steps(&run);
                let report = comparator::score(&plan, &reference);
                let hallucinated =
                    (report.hallucination_rate * report.agent_steps as f64).round() as u64;
                self.telemetry.counter("hallucinations", hallucinated);
                run.shadow = Some(report.clone());
                self.audit
                    .append(
                        &run.tenant,
                        AuditDraft::system(
                            "run.shadow_scored",
                            "run",
                            &run.id,
                            serde_json::to_value(&report).unwrap_or_default(),
                        ),
                    )
                    .await?;
            }

            self.finish(&mut run, RunStatus::Succeeded, None).await?;
            Ok(run.clone())
        }
        .instrument(span)
        .await;

        if let Err(err) = &result {
            self.record_abort(&mut run, err).await;
        }
        result
    }

    /// Best-effort last writes when the executor itself fails. A lost lease
    /// means another owner has the run, so nothing is touched; everything
    /// else fails the run with a stable code. Internal detail is audited as
    /// a hash, never as text.
    async fn record_abort(&self, run: &mut Run, err: &EngineError) {
        if matches!(err, EngineError::LeaseLost(_) | EngineError::LeaseHeld(_)) {
            return;
        }
        let reason = match err {
            EngineError::Internal(detail) => {
                format!("internal:{}", relay_audit::sha256_hex(detail.as_bytes()))
            }
            other => other.to_string(),
        };
        let error = RunError {
            code: err.code().to_string(),
            reason,
            step_index: None,
        };
        if run.status.can_transition_to(RunStatus::Failed) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(Utc::now());
            run.error = Some(error.clone());
            let _ = self.store.save_run(run).await;
        }
        let _ = self
            .audit
            .append(
                &run.tenant,
                AuditDraft::system("run.aborted", "run", &run.id, json!({"error": error})),
            )
            .await;
    }

    /// The plan is produced once and persisted so resume replays the same
    /// step list even in LLM mode.
    async fn materialize_plan(&self, run: &mut Run) -> Result<Vec<PlannedStep>, EngineError> {
        if let Some(plan) = &run.plan {
            return Ok(plan.clone());
        }
        let catalog = self.adapters.catalog();
        let outcome = self
            .agents
            .planner
            .plan(&run.runbook, &run.context, &catalog)
            .await
            .map_err(|err| match err {
                AgentError::Malformed { attempts, detail } => {
                    EngineError::AgentMalformed { attempts, detail }
                }
                other => EngineError::Validation(other.to_string()),
            })?;
        run.metrics.absorb(&outcome.usage);
        run.plan = Some(outcome.value.clone());
        self.save_run(run).await?;
        self.audit
            .append(
                &run.tenant,
                AuditDraft::system(
                    "run.planned",
                    "run",
                    &run.id,
                    json!({"steps": outcome.value.len()}),
                ),
            )
            .await?;
        Ok(outcome.value)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        run: &mut Run,
        policy: &PolicyDocument,
        planned: &PlannedStep,
        index: usize,
        existing: Option<Step>,
        shim: &ShadowShim,
        cancel: &CancellationToken,
        lease: &crate::lease::LeaseGuard,
    ) -> Result<StepVerdict, EngineError> {
        // 1. Materialize.
        let mut step = existing.unwrap_or_else(|| Step::new(&run.id, index, &planned.name));
        step.tool = planned.tool.clone();
        step.args = planned.args.clone();
        self.save_step(&step).await?;

        // 2. Plan-or-pass: refine steps that lack a concrete tool.
        if step.tool.is_none() {
            let catalog = self.adapters.catalog();
            match self
                .agents
                .toolcaller
                .refine(planned, &run.context, &catalog)
                .await
            {
                Ok(outcome) => {
                    step.usage.merge(&outcome.usage);
                    step.tool = Some(outcome.value.tool);
                    step.args = outcome.value.args;
                    self.save_step(&step).await?;
                }
                Err(err) => {
                    let code = match &err {
                        AgentError::Unresolvable(_) => "validation_error",
                        AgentError::Malformed { .. } => "agent_malformed",
                        AgentError::Provider(_) => "internal",
                    };
                    return self
                        .fail_step(run, planned, &mut step, code, &err.to_string())
                        .await;
                }
            }
        }
        let tool = step.tool.clone().unwrap_or_default();
        let span = step_span(&run.id, index, &tool);

        // 3+4. Review and gate.
        let estimate = StepEstimate {
            tokens: self.config.step_token_estimate,
            cost_usd: self.config.step_cost_estimate_usd,
            wall_ms: effective_timeout_ms(planned, self.adapters.spec(&tool)),
        };
        let evaluated = evaluate(
            policy,
            &self.adapters,
            &EvalRequest {
                subject: &run.caller,
                tool: &tool,
                args: &step.args,
                run_context: &run.context,
                totals: &run.metrics,
                estimate: &estimate,
            },
            self.env.default_action,
        );
        let review = match self
            .agents
            .reviewer
            .review(&tool, &step.args, &run.caller, policy, &evaluated)
            .await
        {
            Ok(outcome) => {
                step.usage.merge(&outcome.usage);
                outcome.value
            }
            Err(err) => {
                let code = match &err {
                    AgentError::Malformed { .. } => "agent_malformed",
                    _ => "internal",
                };
                return self
                    .fail_step(run, planned, &mut step, code, &err.to_string())
                    .await;
            }
        };
        if let Some(disagreement) = &review.disagreement {
            self.audit
                .append(
                    &run.tenant,
                    AuditDraft::system(
                        "review.disagreement",
                        "step",
                        &step.id,
                        json!({
                            "run_id": run.id,
                            "step_index": index,
                            "tool": tool,
                            "llm": disagreement.llm,
                            "evaluator": disagreement.evaluator,
                        }),
                    ),
                )
                .await?;
        }

        let reasons = review.decision.reasons.clone();
        match review.decision.action {
            PolicyAction::Block => {
                self.telemetry.counter("policy_blocks", 1);
                let reason = reasons.join("; ");
                step.error = Some(StepError {
                    code: "policy_error".to_string(),
                    reason: reason.clone(),
                });
                match policy.block_behavior {
                    BlockBehavior::FailFast => {
                        step.status = StepStatus::Blocked;
                        self.finalize_step(run, &mut step, "step.blocked", &[]).await?;
                        lease.renew()?;
                        return Ok(StepVerdict::RunFailed {
                            error: RunError {
                                code: "policy_error".to_string(),
                                reason,
                                step_index: Some(index),
                            },
                            step_failed: false,
                        });
                    }
                    BlockBehavior::SkipStep => {
                        step.status = StepStatus::Skipped;
                        self.finalize_step(run, &mut step, "step.skipped", &[]).await?;
                        lease.renew()?;
                        return Ok(StepVerdict::Advance);
                    }
                }
            }
            PolicyAction::RequireApproval => {
                let expiry_seconds = policy
                    .approval_rule_for(&tool)
                    .map(|rule| rule.expiry_seconds)
                    .unwrap_or(policy.approval.default_expiry_seconds);
                let approval = self
                    .approvals
                    .request(
                        run,
                        &step,
                        reasons.join("; "),
                        ChronoDuration::seconds(expiry_seconds as i64),
                    )
                    .await?;
                self.telemetry.counter("approvals_requested", 1);
                if run.status != RunStatus::AwaitingApproval {
                    self.transition(run, RunStatus::AwaitingApproval).await?;
                }
                let state = tokio::select! {
                    _ = cancel.cancelled() => {
                        self.finish(run, RunStatus::Cancelled, None).await?;
                        return Ok(StepVerdict::Advance);
                    }
                    state = self.approvals.wait(&approval.id) => state?,
                };
                match state {
                    relay_types::ApprovalState::Approved => {
                        self.transition(run, RunStatus::Running).await?;
                    }
                    denied => {
                        step.status = StepStatus::Blocked;
                        let reason = format!("approval {denied:?}").to_lowercase();
                        step.error = Some(StepError {
                            code: "policy_error".to_string(),
                            reason: reason.clone(),
                        });
                        self.finalize_step(run, &mut step, "step.blocked", &[]).await?;
                        // Denied or expired approvals fail the run regardless
                        // of continue_on_error; finish() performs the
                        // awaiting_approval -> failed transition. The step is
                        // blocked, not failed, so nothing is compensated.
                        return Ok(StepVerdict::RunFailed {
                            error: RunError {
                                code: "policy_error".to_string(),
                                reason,
                                step_index: Some(index),
                            },
                            step_failed: false,
                        });
                    }
                }
            }
            PolicyAction::Allow => {}
        }

        // 5. Mode check.
        match run.mode {
            RunMode::DryRun => {
                self.audit
                    .append(
                        &run.tenant,
                        AuditDraft::system(
                            "step.would_invoke",
                            "step",
                            &step.id,
                            json!({"run_id": run.id, "step_index": index, "tool": tool, "args": step.args}),
                        ),
                    )
                    .await?;
                step.status = StepStatus::Succeeded;
                step.output = Some(json!({"would_invoke": tool, "args": step.args}));
                self.finalize_step(run, &mut step, "step.succeeded", &[]).await?;
                lease.renew()?;
                return Ok(StepVerdict::Advance);
            }
            RunMode::Shadow => {
                let outcome = shim.record(index, &tool, &step.args).await;
                step.status = StepStatus::Succeeded;
                step.output = Some(outcome.output);
                self.finalize_step(run, &mut step, "step.succeeded", &[]).await?;
                lease.renew()?;
                return Ok(StepVerdict::Advance);
            }
            RunMode::Execute => {}
        }

        // 6+7. Invoke with retries, then record.
        let verdict = self
            .invoke_step(run, policy, planned, &mut step, &tool, cancel)
            .instrument(span)
            .await?;
        lease.renew()?;
        Ok(verdict)
    }

    async fn invoke_step(
        &self,
        run: &mut Run,
        policy: &PolicyDocument,
        planned: &PlannedStep,
        step: &mut Step,
        tool: &str,
        cancel: &CancellationToken,
    ) -> Result<StepVerdict, EngineError> {
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        self.save_step(step).await?;
        self.publish_event(&run.id, RunEventKind::StepStarted, json!({
            "step_index": step.index,
            "tool": tool,
        }))
        .await?;

        let spec = self.adapters.spec(tool).cloned();
        let needs_dedup = spec.as_ref().is_some_and(|s| !s.idempotent);
        let dedup_token = needs_dedup.then(|| format!("dedup-{}-{}", run.id, step.index));

        // Reconcile a bracket left behind by a crash before calling again.
        if let Some(token) = &dedup_token {
            if let Some(prior) = self.store.get_dedup(token).await? {
                match self.adapters.lookup(tool, token).await {
                    Some(outcome) => {
                        self.confirm_dedup(&prior).await?;
                        return self.succeed_step(run, step, outcome, spec.as_ref()).await;
                    }
                    None if !policy.retry_unknown_outcomes => {
                        return self
                            .fail_step(
                                run,
                                planned,
                                step,
                                "concurrency_error",
                                "prior invocation outcome unknown; refusing to retry",
                            )
                            .await;
                    }
                    None => {}
                }
            }
            self.store
                .put_dedup(&DedupRecord {
                    token: token.clone(),
                    run_id: run.id.clone(),
                    step_index: step.index,
                    tool: tool.to_string(),
                    confirmed: false,
                    created_at: Utc::now(),
                })
                .await?;
        }

        let ctx = InvokeContext {
            tenant: run.tenant.clone(),
            run_id: run.id.clone(),
            step_index: step.index,
            mode: run.mode,
            context: run.context.clone(),
            dedup_token: dedup_token.clone(),
        };
        let timeout_override = planned.timeout_ms;

        let mut last_error: Option<AdapterError> = None;
        for attempt in 1..=self.config.max_attempts {
            step.attempt_count += 1;
            self.save_step(step).await?;
            self.telemetry.counter("adapter_calls", 1);

            match self
                .adapters
                .invoke(tool, step.args.clone(), &ctx, timeout_override)
                .await
            {
                Ok(outcome) => {
                    if let Some(token) = &dedup_token {
                        self.confirm_dedup(&DedupRecord {
                            token: token.clone(),
                            run_id: run.id.clone(),
                            step_index: step.index,
                            tool: tool.to_string(),
                            confirmed: true,
                            created_at: Utc::now(),
                        })
                        .await?;
                    }
                    return self.succeed_step(run, step, outcome, spec.as_ref()).await;
                }
                Err(err) => {
                    let retry = err.kind.is_retryable() && attempt < self.config.max_attempts;
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                    let delay = self.backoff_delay(attempt);
                    self.telemetry
                        .histogram("retry_backoff_ms", delay.as_millis() as f64);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| AdapterError::permanent("adapter produced no outcome"));
        if cancel.is_cancelled() {
            // Cancellation between retry attempts: the last attempt's result
            // is recorded, then the run terminates as cancelled.
            step.status = StepStatus::Failed;
            step.error = Some(StepError {
                code: err.kind.code().to_string(),
                reason: err.message.clone(),
            });
            self.finalize_step(run, step, "step.failed", &[]).await?;
            self.finish(run, RunStatus::Cancelled, None).await?;
            return Ok(StepVerdict::Advance);
        }
        self.fail_step(run, planned, step, err.kind.code(), &err.message)
            .await
    }

    async fn succeed_step(
        &self,
        run: &mut Run,
        step: &mut Step,
        outcome: InvokeOutcome,
        spec: Option<&AdapterSpec>,
    ) -> Result<StepVerdict, EngineError> {
        step.usage.merge(&StepUsage {
            tokens_in: outcome.usage.tokens_in,
            tokens_out: outcome.usage.tokens_out,
            cost_usd: outcome.usage.cost_usd,
            wall_ms: outcome.usage.wall_ms,
        });
        step.status = StepStatus::Succeeded;
        step.output = Some(outcome.output);
        let secret_keys = spec.map(AdapterSpec::secret_args).unwrap_or_default();
        self.finalize_step(run, step, "step.succeeded", &secret_keys)
            .await?;
        Ok(StepVerdict::Advance)
    }

    /// A step failure tolerated by `continue_on_error` terminates as
    /// `skipped` (error retained) so a succeeded run never carries a
    /// `failed` step; otherwise the step fails and takes the run with it.
    async fn fail_step(
        &self,
        run: &mut Run,
        planned: &PlannedStep,
        step: &mut Step,
        code: &str,
        reason: &str,
    ) -> Result<StepVerdict, EngineError> {
        step.error = Some(StepError {
            code: code.to_string(),
            reason: reason.to_string(),
        });
        let secret_keys = step
            .tool
            .as_deref()
            .and_then(|tool| self.adapters.spec(tool))
            .map(AdapterSpec::secret_args)
            .unwrap_or_default();
        if planned.continue_on_error {
            step.status = StepStatus::Skipped;
            self.finalize_step(run, step, "step.skipped", &secret_keys)
                .await?;
            return Ok(StepVerdict::Advance);
        }
        step.status = StepStatus::Failed;
        self.finalize_step(run, step, "step.failed", &secret_keys)
            .await?;
        Ok(StepVerdict::RunFailed {
            error: RunError {
                code: code.to_string(),
                reason: reason.to_string(),
                step_index: Some(step.index),
            },
            step_failed: true,
        })
    }

    /// Single exit for every terminal step: persist, audit, stream, meter,
    /// and fold the step's usage into the run totals exactly once.
    async fn finalize_step(
        &self,
        run: &mut Run,
        step: &mut Step,
        action: &str,
        secret_keys: &[String],
    ) -> Result<(), EngineError> {
        step.finished_at = Some(Utc::now());
        self.save_step(step).await?;
        self.audit
            .append_with_secret_keys(
                &run.tenant,
                AuditDraft::system(
                    action,
                    "step",
                    &step.id,
                    json!({
                        "run_id": run.id,
                        "step_index": step.index,
                        "tool": step.tool,
                        "args": step.args,
                        "status": step.status,
                        "output": step.output,
                        "error": step.error,
                        "usage": step.usage,
                        "attempts": step.attempt_count,
                    }),
                ),
                secret_keys,
            )
            .await?;
        self.publish_event(&run.id, RunEventKind::StepFinished, json!({
            "step_index": step.index,
            "status": step.status,
        }))
        .await?;
        self.telemetry.counter("steps_executed", 1);
        if let (Some(started), Some(finished)) = (step.started_at, step.finished_at) {
            let latency = (finished - started).num_milliseconds().max(0) as f64;
            self.telemetry.histogram("step_latency_ms", latency);
        }
        run.metrics.absorb(&step.usage);
        self.save_run(run).await?;
        Ok(())
    }

    /// Reverse-walk succeeded effectful steps and invoke their declared
    /// inverses. Best-effort: a failed compensation is recorded and logged
    /// but never compensated itself.
    async fn compensate(&self, run: &mut Run, failing_index: usize) -> Result<(), EngineError> {
        let steps = self.store.list_steps(&run.id).await?;
        let mut next_index = steps.iter().map(|s| s.index + 1).max().unwrap_or(0);

        let mut targets: Vec<&Step> = steps
            .iter()
            .filter(|s| {
                s.index < failing_index
                    && s.status == StepStatus::Succeeded
                    && s.compensates_step_index.is_none()
            })
            .collect();
        targets.sort_by(|a, b| b.index.cmp(&a.index));

        for prior in targets {
            let Some(tool) = prior.tool.as_deref() else {
                continue;
            };
            let Some(spec) = self.adapters.spec(tool).cloned() else {
                continue;
            };
            if !spec.classification.is_effectful() {
                continue;
            }
            let Some(comp_tool) = spec.compensation_tool.clone() else {
                continue;
            };

            let mut comp = Step::new(&run.id, next_index, &format!("compensate-{}", prior.name));
            next_index += 1;
            comp.tool = Some(comp_tool.clone());
            comp.compensates_step_index = Some(prior.index);
            comp.args = json!({
                "original_args": prior.args,
                "original_output": prior.output,
            });
            comp.status = StepStatus::Running;
            comp.started_at = Some(Utc::now());
            comp.attempt_count = 1;
            self.save_step(&comp).await?;

            let ctx = InvokeContext {
                tenant: run.tenant.clone(),
                run_id: run.id.clone(),
                step_index: comp.index,
                mode: run.mode,
                context: run.context.clone(),
                dedup_token: None,
            };
            match self
                .adapters
                .invoke(&comp_tool, comp.args.clone(), &ctx, None)
                .await
            {
                Ok(outcome) => {
                    comp.status = StepStatus::Compensated;
                    comp.output = Some(outcome.output);
                    comp.usage.merge(&StepUsage {
                        tokens_in: outcome.usage.tokens_in,
                        tokens_out: outcome.usage.tokens_out,
                        cost_usd: outcome.usage.cost_usd,
                        wall_ms: outcome.usage.wall_ms,
                    });
                    self.finalize_step(run, &mut comp, "step.compensated", &[])
                        .await?;
                }
                Err(err) => {
                    warn!(
                        run_id = %run.id,
                        step_index = prior.index,
                        tool = comp_tool,
                        "compensation failed: {err}"
                    );
                    comp.status = StepStatus::Failed;
                    comp.error = Some(StepError {
                        code: err.kind.code().to_string(),
                        reason: err.message.clone(),
                    });
                    self.finalize_step(run, &mut comp, "step.compensation_failed", &[])
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        run: &mut Run,
        status: RunStatus,
        error: Option<RunError>,
    ) -> Result<(), EngineError> {
        if run.status != status {
            self.transition(run, status).await?;
        }
        run.completed_at = Some(Utc::now());
        run.error = error;
        self.save_run(run).await?;

        let action = match status {
            RunStatus::Succeeded => "run.succeeded",
            RunStatus::Cancelled => "run.cancelled",
            _ => "run.failed",
        };
        self.audit
            .append(
                &run.tenant,
                AuditDraft::system(
                    action,
                    "run",
                    &run.id,
                    json!({"metrics": run.metrics, "error": run.error}),
                ),
            )
            .await?;
        self.publish_event(&run.id, RunEventKind::RunTerminated, json!({
            "status": run.status,
            "error": run.error,
        }))
        .await?;

        let latency = (run.completed_at.unwrap_or_else(Utc::now) - run.created_at)
            .num_milliseconds()
            .max(0) as f64;
        self.telemetry.histogram("run_latency_ms", latency);
        self.telemetry
            .histogram("token_cost_usd", run.metrics.cost_usd);
        Ok(())
    }

    async fn transition(&self, run: &mut Run, next: RunStatus) -> Result<(), EngineError> {
        if !run.status.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "illegal run transition {:?} -> {next:?}",
                run.status
            )));
        }
        run.status = next;
        self.save_run(run).await
    }

    async fn publish_event(
        &self,
        run_id: &str,
        kind: RunEventKind,
        payload: Value,
    ) -> Result<(), EngineError> {
        let event = self.store.append_run_event(run_id, kind, payload).await?;
        self.bus.publish(EngineEvent::new(
            "run.event",
            serde_json::to_value(&event).unwrap_or_default(),
        ));
        Ok(())
    }

    async fn confirm_dedup(&self, record: &DedupRecord) -> Result<(), EngineError> {
        let mut confirmed = record.clone();
        confirmed.confirmed = true;
        self.store.put_dedup(&confirmed).await
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let capped = base.min(self.config.backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }

    /// Store writes pause-and-retry before giving up; already-appended audit
    /// events stay valid either way.
    async fn save_run(&self, run: &Run) -> Result<(), EngineError> {
        let mut delay = Duration::from_millis(50);
        let mut last = None;
        for _ in 0..3 {
            match self.store.save_run(run).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last = Some(err);
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last.unwrap_or_else(|| EngineError::Store("run save failed".to_string())))
    }

    async fn save_step(&self, step: &Step) -> Result<(), EngineError> {
        let mut delay = Duration::from_millis(50);
        let mut last = None;
        for _ in 0..3 {
            match self.store.save_step(step).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last = Some(err);
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last.unwrap_or_else(|| EngineError::Store("step save failed".to_string())))
    }
}

fn effective_timeout_ms(planned: &PlannedStep, spec: Option<&AdapterSpec>) -> u64 {
    planned
        .timeout_ms
        .or_else(|| spec.map(|s| s.timeout_ms))
        .unwrap_or(relay_adapters::DEFAULT_ADAPTER_TIMEOUT_MS)
}

/// Reference list for shadow scoring: the runbook's explicit tool steps.
fn reference_steps(run: &Run) -> Vec<PlannedStep> {
    run.runbook
        .steps
        .iter()
        .filter(|t| t.tool.is_some())
        .map(|t| PlannedStep {
            name: t.name.clone(),
            tool: t.tool.clone(),
            args: t.args.clone().unwrap_or_else(|| json!({})),
            prompt: None,
            continue_on_error: t.continue_on_error,
            compensates: t.compensates.clone(),
            timeout_ms: t.timeout_ms,
        })
        .collect()
}
