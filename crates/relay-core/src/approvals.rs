use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::info;

use relay_audit::{AuditDraft, AuditLog};
use relay_policy::PolicyDocument;
use relay_types::{
    Approval, ApprovalState, ApprovalVerdict, EngineError, EngineEvent, Run, RunEventKind, Step,
    Subject,
};

use crate::event_bus::EventBus;
use crate::store::RunStore;

/// Approval rendezvous: creates pending approvals, lets the executor park on
/// them, and records every decision into the audit chain. Decisions are
/// serialized so exactly one of two concurrent deciders wins.
#[derive(Clone)]
pub struct ApprovalService {
    store: Arc<dyn RunStore>,
    audit: Arc<AuditLog>,
    bus: EventBus,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<ApprovalState>>>>>,
    decide_lock: Arc<Mutex<()>>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn RunStore>, audit: Arc<AuditLog>, bus: EventBus) -> Self {
        Self {
            store,
            audit,
            bus,
            waiters: Arc::new(RwLock::new(HashMap::new())),
            decide_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create (or re-attach to) the pending approval for a step. At most one
    /// non-terminal approval exists per (run, step).
    pub async fn request(
        &self,
        run: &Run,
        step: &Step,
        reason: String,
        expiry: ChronoDuration,
    ) -> Result<Approval, EngineError> {
        if let Some(existing) = self
            .store
            .list_approvals(&run.id)
            .await?
            .into_iter()
            .find(|a| a.step_index == step.index && a.state == ApprovalState::Pending)
        {
            self.ensure_waiter(&existing.id).await;
            return Ok(existing);
        }

        let expires_at = Utc::now() + expiry;
        let approval = Approval::new(&run.id, step.index, &run.caller.id, reason, expires_at);
        self.store.save_approval(&approval).await?;
        self.ensure_waiter(&approval.id).await;

        self.audit
            .append(
                &run.tenant,
                AuditDraft::system(
                    "approval.requested",
                    "approval",
                    &approval.id,
                    json!({
                        "run_id": run.id,
                        "step_index": step.index,
                        "tool": step.tool,
                        "reason": approval.reason,
                        "expires_at": approval.expires_at,
                    }),
                ),
            )
            .await?;
        let event = self
            .store
            .append_run_event(
                &run.id,
                RunEventKind::ApprovalRequested,
                json!({"approval_id": approval.id, "step_index": step.index}),
            )
            .await?;
        self.bus.publish(EngineEvent::new(
            "run.event",
            serde_json::to_value(&event).unwrap_or_default(),
        ));
        info!(run_id = %run.id, approval_id = %approval.id, "approval requested");
        Ok(approval)
    }

    /// Resolve a pending approval. The four-eyes rule and any approver-role
    /// requirement come from the run's captured policy, so later policy edits
    /// do not change who may decide.
    pub async fn decide(
        &self,
        approval_id: &str,
        decider: &Subject,
        verdict: ApprovalVerdict,
        comment: Option<String>,
    ) -> Result<Approval, EngineError> {
        let _serialized = self.decide_lock.lock().await;

        let mut approval = self
            .store
            .load_approval(approval_id)
            .await?
            .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?;
        if approval.state != ApprovalState::Pending {
            return Err(EngineError::ApprovalConflict(approval_id.to_string()));
        }

        let run = self
            .store
            .load_run(&approval.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(approval.run_id.clone()))?;
        let policy = PolicyDocument::from_snapshot(&run.policy_snapshot)?;

        if Utc::now() >= approval.expires_at {
            self.expire_locked(&run, &mut approval).await?;
            return Err(EngineError::ApprovalConflict(approval_id.to_string()));
        }

        if policy.approval.four_eyes && decider.id == run.caller.id {
            return Err(EngineError::SelfApproval);
        }
        if let Some(rule) = self.approver_rule(&run, &policy, approval.step_index).await? {
            if !rule.is_empty() && !decider.roles.iter().any(|role| rule.contains(role)) {
                return Err(EngineError::Validation(format!(
                    "decider `{}` lacks a required approver role",
                    decider.id
                )));
            }
        }

        approval.state = match verdict {
            ApprovalVerdict::Approved => ApprovalState::Approved,
            ApprovalVerdict::Denied => ApprovalState::Denied,
        };
        approval.decider = Some(decider.id.clone());
        approval.decided_at = Some(Utc::now());
        approval.comment = comment;
        self.store.save_approval(&approval).await?;

        self.audit
            .append(
                &run.tenant,
                AuditDraft::user(
                    &decider.id,
                    "approval.resolved",
                    "approval",
                    &approval.id,
                    json!({
                        "run_id": approval.run_id,
                        "step_index": approval.step_index,
                        "state": approval.state,
                        "comment": approval.comment,
                    }),
                ),
            )
            .await?;
        let event = self
            .store
            .append_run_event(
                &approval.run_id,
                RunEventKind::ApprovalResolved,
                json!({"approval_id": approval.id, "state": approval.state}),
            )
            .await?;
        self.bus.publish(EngineEvent::new(
            "run.event",
            serde_json::to_value(&event).unwrap_or_default(),
        ));
        self.notify(&approval.id, approval.state).await;
        Ok(approval)
    }

    /// Park until the approval resolves or its expiry passes. Expiry at the
    /// deadline observes denied semantics (`Expired`).
    pub async fn wait(&self, approval_id: &str) -> Result<ApprovalState, EngineError> {
        loop {
            let approval = self
                .store
                .load_approval(approval_id)
                .await?
                .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?;
            if approval.state.is_terminal() {
                return Ok(approval.state);
            }

            let mut rx = {
                let sender = self.ensure_waiter(approval_id).await;
                sender.subscribe()
            };
            // Re-check after subscribing so a decision landing in between is
            // not missed.
            let latest = self
                .store
                .load_approval(approval_id)
                .await?
                .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?;
            if latest.state.is_terminal() {
                return Ok(latest.state);
            }

            let until_expiry = (latest.expires_at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_ok() {
                        if let Some(state) = *rx.borrow() {
                            return Ok(state);
                        }
                    }
                    // Sender dropped or spurious wake: loop re-reads the store.
                }
                _ = sleep(Duration::from_millis(until_expiry.as_millis() as u64)) => {
                    let _serialized = self.decide_lock.lock().await;
                    let mut approval = self
                        .store
                        .load_approval(approval_id)
                        .await?
                        .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?;
                    if approval.state.is_terminal() {
                        return Ok(approval.state);
                    }
                    if Utc::now() >= approval.expires_at {
                        let run = self
                            .store
                            .load_run(&approval.run_id)
                            .await?
                            .ok_or_else(|| EngineError::RunNotFound(approval.run_id.clone()))?;
                        self.expire_locked(&run, &mut approval).await?;
                        return Ok(ApprovalState::Expired);
                    }
                }
            }
        }
    }

    async fn expire_locked(&self, run: &Run, approval: &mut Approval) -> Result<(), EngineError> {
        approval.state = ApprovalState::Expired;
        approval.decided_at = Some(Utc::now());
        self.store.save_approval(approval).await?;
        self.audit
            .append(
                &run.tenant,
                AuditDraft::system(
                    "approval.expired",
                    "approval",
                    &approval.id,
                    json!({"run_id": approval.run_id, "step_index": approval.step_index}),
                ),
            )
            .await?;
        let event = self
            .store
            .append_run_event(
                &approval.run_id,
                RunEventKind::ApprovalResolved,
                json!({"approval_id": approval.id, "state": approval.state}),
            )
            .await?;
        self.bus.publish(EngineEvent::new(
            "run.event",
            serde_json::to_value(&event).unwrap_or_default(),
        ));
        self.notify(&approval.id, ApprovalState::Expired).await;
        Ok(())
    }

    async fn approver_rule(
        &self,
        run: &Run,
        policy: &PolicyDocument,
        step_index: usize,
    ) -> Result<Option<Vec<String>>, EngineError> {
        let steps = self.store.list_steps(&run.id).await?;
        let Some(tool) = steps
            .iter()
            .find(|s| s.index == step_index)
            .and_then(|s| s.tool.clone())
        else {
            return Ok(None);
        };
        Ok(policy
            .approval_rule_for(&tool)
            .map(|rule| rule.requires_roles.clone()))
    }

    async fn ensure_waiter(&self, approval_id: &str) -> watch::Sender<Option<ApprovalState>> {
        if let Some(sender) = self.waiters.read().await.get(approval_id) {
            return sender.clone();
        }
        let mut waiters = self.waiters.write().await;
        waiters
            .entry(approval_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    async fn notify(&self, approval_id: &str, state: ApprovalState) {
        if let Some(sender) = self.waiters.write().await.remove(approval_id) {
            let _ = sender.send(Some(state));
        }
    }
}
