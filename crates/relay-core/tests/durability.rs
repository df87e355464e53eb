mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};

use common::*;
use relay_adapters::{
    Adapter, AdapterError, AdapterSpec, InvokeContext, InvokeOutcome, InvokeUsage, ToolClass,
};
use relay_audit::verify_export;
use relay_core::{AgentSet, DedupRecord, RunStore};
use relay_policy::PolicyDocument;
use relay_types::{
    PlannedStep, RunEventKind, RunMode, RunStatus, Step, StepStatus, Subject,
};

const TWO_STEP: &str = r#"
name: ticket-then-page
steps:
  - {name: file-ticket, tool: tracker.create_issue, args: {title: "X"}}
  - {name: page, tool: pager.page, args: {summary: "S"}}
"#;

fn planned(name: &str, tool: &str, args: Value) -> PlannedStep {
    PlannedStep {
        name: name.to_string(),
        tool: Some(tool.to_string()),
        args,
        prompt: None,
        continue_on_error: false,
        compensates: None,
        timeout_ms: None,
    }
}

#[tokio::test]
async fn restart_resumes_at_the_next_non_terminal_step() {
    let h = harness().await;
    let run_id = h
        .engine
        .submit_run(request(TWO_STEP, RunMode::Execute, admin()))
        .await
        .expect("submit");

    // Manufacture the state a crash leaves behind: the run was planned and
    // step 0 completed, but the process died before step 1.
    let mut run = h.store.load_run(&run_id).await.expect("load").expect("run");
    run.status = RunStatus::Running;
    run.plan = Some(vec![
        planned("file-ticket", "tracker.create_issue", json!({"title": "X"})),
        planned("page", "pager.page", json!({"summary": "S"})),
    ]);
    h.store.save_run(&run).await.expect("save run");
    let mut step0 = Step::new(&run_id, 0, "file-ticket");
    step0.tool = Some("tracker.create_issue".to_string());
    step0.args = json!({"title": "X"});
    step0.status = StepStatus::Succeeded;
    step0.output = Some(json!({"id": "ISS-PRIOR"}));
    h.store.save_step(&step0).await.expect("save step");

    let run = h.engine.run_to_completion(&run_id).await.expect("resume");
    assert_eq!(run.status, RunStatus::Succeeded);

    // Only step 1 executed: one page went out, no new issue was filed.
    assert_eq!(h.world.call_count(), 1);
    assert_eq!(h.world.page_count().await, 1);

    let events = h.audit.events(TENANT).await.expect("audit");
    let step_events: Vec<_> = events
        .iter()
        .filter(|e| e.action == "step.succeeded")
        .collect();
    assert_eq!(step_events.len(), 1);
    assert_eq!(step_events[0].payload["step_index"], 1);
    // The run was already `running`, so no second run.started appears.
    assert!(!events.iter().any(|e| e.action == "run.started"));
}

#[tokio::test]
async fn replaying_a_terminal_run_adds_no_history() {
    let h = harness().await;
    let run = submit_and_run(
        &h,
        request(
            "name: one\nsteps:\n  - {name: a, tool: tracker.create_issue, args: {title: X}}\n",
            RunMode::Execute,
            admin(),
        ),
    )
    .await;
    assert_eq!(run.status, RunStatus::Succeeded);

    let before = h.audit.events(TENANT).await.expect("audit").len();
    let replayed = h.engine.run_to_completion(&run.id).await.expect("replay");
    assert_eq!(replayed.status, RunStatus::Succeeded);
    assert_eq!(h.audit.events(TENANT).await.expect("audit").len(), before);
    assert_eq!(h.world.call_count(), 1);
}

#[tokio::test]
async fn duplicate_submit_returns_the_existing_run() {
    let h = harness().await;
    let mut req = request(TWO_STEP, RunMode::DryRun, admin());
    req.idempotency_key = Some("deploy-2024-07".to_string());

    let first = h.engine.submit_run(req.clone()).await.expect("submit");
    let second = h.engine.submit_run(req).await.expect("resubmit");
    assert_eq!(first, second);
}

#[tokio::test]
async fn export_import_round_trip_preserves_verifiability() {
    let h = harness().await;
    let run = submit_and_run(
        &h,
        request(
            "name: one\nsteps:\n  - {name: a, tool: tracker.create_issue, args: {title: X}}\n",
            RunMode::Execute,
            admin(),
        ),
    )
    .await;

    let export = h.engine.export_run(&run.id).await.expect("export");
    assert!(!export.audit_events.is_empty());
    verify_export(&export.audit_events).expect("export verifies");

    let fresh = harness().await;
    fresh
        .engine
        .import_run(export.clone())
        .await
        .expect("import");
    let view = fresh.engine.get_run(&run.id).await.expect("view");
    assert_eq!(view.run.status, RunStatus::Succeeded);
    assert_eq!(view.steps.len(), export.steps.len());
}

#[tokio::test]
async fn unknown_prior_outcome_refuses_to_retry() {
    let h = harness().await;
    let run_id = h
        .engine
        .submit_run(request(
            "name: page\nsteps:\n  - {name: page, tool: pager.page, args: {summary: S}}\n",
            RunMode::Execute,
            admin(),
        ))
        .await
        .expect("submit");

    // A crash left an unconfirmed bracket and the pager has no idempotency
    // API to reconcile against.
    h.store
        .put_dedup(&DedupRecord {
            token: format!("dedup-{run_id}-0"),
            run_id: run_id.clone(),
            step_index: 0,
            tool: "pager.page".to_string(),
            confirmed: false,
            created_at: Utc::now(),
        })
        .await
        .expect("seed dedup");

    let run = h.engine.run_to_completion(&run_id).await.expect("execute");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error.as_ref().expect("error").code,
        "concurrency_error"
    );
    assert_eq!(h.world.page_count().await, 0);
}

#[tokio::test]
async fn policy_may_permit_retrying_unknown_outcomes() {
    let policy = PolicyDocument::parse(
        r#"
name: base
version: "1"
roles: [Admin]
tool_allowlist:
  Admin: ["pager.*"]
retry_unknown_outcomes: true
"#,
    )
    .expect("policy");
    let h = harness_with(|b| b, fast_config(), policy, AgentSet::stub()).await;
    let run_id = h
        .engine
        .submit_run(request(
            "name: page\nsteps:\n  - {name: page, tool: pager.page, args: {summary: S}}\n",
            RunMode::Execute,
            admin(),
        ))
        .await
        .expect("submit");
    h.store
        .put_dedup(&DedupRecord {
            token: format!("dedup-{run_id}-0"),
            run_id: run_id.clone(),
            step_index: 0,
            tool: "pager.page".to_string(),
            confirmed: false,
            created_at: Utc::now(),
        })
        .await
        .expect("seed dedup");

    let run = h.engine.run_to_completion(&run_id).await.expect("execute");
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.world.page_count().await, 1);
}

struct MeteredAdapter;

#[async_trait]
impl Adapter for MeteredAdapter {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new("test.metered", "reports usage", json!({"type": "object"}))
            .classified(ToolClass::Write)
    }

    async fn invoke(
        &self,
        _args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        Ok(InvokeOutcome {
            output: json!({"ok": true}),
            usage: InvokeUsage {
                wall_ms: 2,
                tokens_in: 11,
                tokens_out: 7,
                cost_usd: 0.25,
            },
        })
    }
}

#[tokio::test]
async fn run_totals_equal_the_sum_of_step_usage() {
    let h = harness_with(
        |b| b.register(Arc::new(MeteredAdapter)).expect("register"),
        fast_config(),
        default_policy(),
        AgentSet::stub(),
    )
    .await;
    let run = submit_and_run(
        &h,
        request(
            r#"
name: metered
steps:
  - {name: one, tool: test.metered, args: {}}
  - {name: two, tool: test.metered, args: {}}
"#,
            RunMode::Execute,
            admin(),
        ),
    )
    .await;

    assert_eq!(run.status, RunStatus::Succeeded);
    let steps = h.store.list_steps(&run.id).await.expect("steps");
    let tokens_in: u64 = steps.iter().map(|s| s.usage.tokens_in).sum();
    let tokens_out: u64 = steps.iter().map(|s| s.usage.tokens_out).sum();
    let cost: f64 = steps.iter().map(|s| s.usage.cost_usd).sum();
    assert_eq!(run.metrics.tokens_in, tokens_in);
    assert_eq!(run.metrics.tokens_out, tokens_out);
    assert!((run.metrics.cost_usd - cost).abs() < 1e-9);
}

struct SlowAdapter;

#[async_trait]
impl Adapter for SlowAdapter {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec::new("test.slow", "slow read", json!({"type": "object"}))
            .classified(ToolClass::Read)
            .interruptible()
    }

    async fn invoke(
        &self,
        _args: Value,
        _ctx: &InvokeContext,
    ) -> Result<InvokeOutcome, AdapterError> {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        Ok(InvokeOutcome::new(json!({"ok": true})))
    }
}

#[tokio::test]
async fn second_executor_cannot_take_a_leased_run() {
    let h = harness_with(
        |b| b.register(Arc::new(SlowAdapter)).expect("register"),
        fast_config(),
        default_policy(),
        AgentSet::stub(),
    )
    .await;
    let run_id = h
        .engine
        .submit_run(request(
            "name: slow\nsteps:\n  - {name: wait, tool: test.slow, args: {}}\n",
            RunMode::Execute,
            admin(),
        ))
        .await
        .expect("submit");

    let handle = h.engine.spawn_run(&run_id);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let contender = h.engine.run_to_completion(&run_id).await;
    assert!(matches!(
        contender,
        Err(relay_types::EngineError::LeaseHeld(_))
    ));

    let run = handle.await.expect("join").expect("run");
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn cancellation_lets_the_inflight_call_finish_then_cancels() {
    let h = harness_with(
        |b| b.register(Arc::new(SlowAdapter)).expect("register"),
        fast_config(),
        default_policy(),
        AgentSet::stub(),
    )
    .await;
    let run_id = h
        .engine
        .submit_run(request(
            "name: slow\nsteps:\n  - {name: wait, tool: test.slow, args: {}}\n",
            RunMode::Execute,
            admin(),
        ))
        .await
        .expect("submit");

    let handle = h.engine.spawn_run(&run_id);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.engine
        .cancel_run(&run_id, &Subject::new("ops", &["Admin"]))
        .await
        .expect("cancel");

    let run = handle.await.expect("join").expect("run");
    assert_eq!(run.status, RunStatus::Cancelled);
    // The in-flight call completed and its result was recorded first.
    let steps = h.store.list_steps(&run_id).await.expect("steps");
    assert_eq!(steps[0].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn event_stream_replays_and_restarts_from_a_cursor() {
    let h = harness().await;
    let run = submit_and_run(
        &h,
        request(
            "name: one\nsteps:\n  - {name: a, tool: tracker.create_issue, args: {title: X}}\n",
            RunMode::Execute,
            admin(),
        ),
    )
    .await;

    let events: Vec<_> = h.engine.stream_run_events(&run.id, 0).collect().await;
    let kinds: Vec<RunEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            RunEventKind::StepStarted,
            RunEventKind::StepFinished,
            RunEventKind::RunTerminated,
        ]
    );
    assert_eq!(
        events.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let resumed: Vec<_> = h.engine.stream_run_events(&run.id, 1).collect().await;
    assert_eq!(resumed[0].kind, RunEventKind::StepFinished);
    assert_eq!(resumed[0].seq, 1);
}
