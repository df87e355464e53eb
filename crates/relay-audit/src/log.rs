use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::error;

use relay_types::EngineError;

use crate::event::{hash_event, AuditDraft, AuditEvent, GENESIS_HASH};
use crate::redact::Redactor;
use crate::sink::AuditSink;

/// First point where a verified chain diverges from its recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDivergence {
    pub seq: u64,
    pub detail: String,
}

impl fmt::Display for ChainDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain diverges at seq {}: {}", self.seq, self.detail)
    }
}

struct ChainState {
    next_seq: u64,
    head: String,
    hydrated: bool,
}

/// Tenant-scoped append-only audit chain. Appends are serialized per tenant
/// by a chain mutex; concurrent callers observe a total order. A failed
/// durable append fails the requesting operation and leaves the chain head
/// unchanged.
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    redactor: Redactor,
    chains: RwLock<HashMap<String, Arc<Mutex<ChainState>>>>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, redactor: Redactor) -> Self {
        Self {
            sink,
            redactor,
            chains: RwLock::new(HashMap::new()),
        }
    }

    pub async fn append(
        &self,
        tenant: &str,
        draft: AuditDraft,
    ) -> Result<AuditEvent, EngineError> {
        self.append_with_secret_keys(tenant, draft, &[]).await
    }

    /// `extra_secret_keys` carries adapter-schema `secret` arg names so the
    /// payload is scrubbed before it is hashed into the chain.
    pub async fn append_with_secret_keys(
        &self,
        tenant: &str,
        draft: AuditDraft,
        extra_secret_keys: &[String],
    ) -> Result<AuditEvent, EngineError> {
        let chain = self.chain_for(tenant).await;
        let mut state = chain.lock().await;
        if !state.hydrated {
            let existing = self.sink.load(tenant).await?;
            if let Some(last) = existing.last() {
                state.next_seq = last.seq + 1;
                state.head = last.this_hash.clone();
            }
            state.hydrated = true;
        }

        let payload = self.redactor.redact(&draft.payload, extra_secret_keys);
        let mut event = AuditEvent {
            seq: state.next_seq,
            ts: Utc::now(),
            tenant: tenant.to_string(),
            actor: draft.actor,
            actor_kind: draft.actor_kind,
            action: draft.action,
            resource_kind: draft.resource_kind,
            resource_id: draft.resource_id,
            payload,
            prev_hash: state.head.clone(),
            this_hash: String::new(),
        };
        event.this_hash = hash_event(&event);

        if let Err(err) = self.sink.append(&event).await {
            error!(tenant, action = %event.action, "audit append failed: {err}");
            return Err(err);
        }
        state.next_seq += 1;
        state.head = event.this_hash.clone();
        Ok(event)
    }

    pub async fn events(&self, tenant: &str) -> Result<Vec<AuditEvent>, EngineError> {
        self.sink.load(tenant).await
    }

    /// Events tagged to one run: either the run resource itself or a payload
    /// carrying its id.
    pub async fn events_for_run(
        &self,
        tenant: &str,
        run_id: &str,
    ) -> Result<Vec<AuditEvent>, EngineError> {
        Ok(self
            .events(tenant)
            .await?
            .into_iter()
            .filter(|event| {
                event.resource_id == run_id
                    || event.payload.get("run_id").and_then(Value::as_str) == Some(run_id)
            })
            .collect())
    }

    async fn chain_for(&self, tenant: &str) -> Arc<Mutex<ChainState>> {
        if let Some(chain) = self.chains.read().await.get(tenant) {
            return chain.clone();
        }
        let mut chains = self.chains.write().await;
        chains
            .entry(tenant.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChainState {
                    next_seq: 0,
                    head: GENESIS_HASH.to_string(),
                    hydrated: false,
                }))
            })
            .clone()
    }
}

/// Verify a contiguous range of a tenant chain. A range starting at seq 0
/// must link from genesis; later ranges link from their first stored
/// prev-hash. Returns the first divergence found.
pub fn verify(events: &[AuditEvent]) -> Result<(), ChainDivergence> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    if first.seq == 0 && first.prev_hash != GENESIS_HASH {
        return Err(ChainDivergence {
            seq: 0,
            detail: "first event does not link from genesis".to_string(),
        });
    }
    let mut expected_seq = first.seq;
    let mut expected_prev = first.prev_hash.clone();
    for event in events {
        if event.seq != expected_seq {
            return Err(ChainDivergence {
                seq: event.seq,
                detail: format!("expected seq {expected_seq}"),
            });
        }
        if event.prev_hash != expected_prev {
            return Err(ChainDivergence {
                seq: event.seq,
                detail: "prev_hash does not match preceding event".to_string(),
            });
        }
        let recomputed = hash_event(event);
        if event.this_hash != recomputed {
            return Err(ChainDivergence {
                seq: event.seq,
                detail: "this_hash does not match recomputation".to_string(),
            });
        }
        expected_seq += 1;
        expected_prev = event.this_hash.clone();
    }
    Ok(())
}

/// Verify an exported, possibly non-contiguous slice (e.g. one run's events
/// interleaved with other runs in the tenant chain). Every hash must
/// recompute; linkage is checked wherever two exported events are adjacent
/// in the original chain.
pub fn verify_export(events: &[AuditEvent]) -> Result<(), ChainDivergence> {
    let mut prev: Option<&AuditEvent> = None;
    for event in events {
        if let Some(prev) = prev {
            if event.seq <= prev.seq {
                return Err(ChainDivergence {
                    seq: event.seq,
                    detail: "export is not in chain order".to_string(),
                });
            }
            if event.seq == prev.seq + 1 && event.prev_hash != prev.this_hash {
                return Err(ChainDivergence {
                    seq: event.seq,
                    detail: "adjacent events do not link".to_string(),
                });
            }
        }
        if event.this_hash != hash_event(event) {
            return Err(ChainDivergence {
                seq: event.seq,
                detail: "this_hash does not match recomputation".to_string(),
            });
        }
        prev = Some(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActorKind;
    use crate::sink::{FileSink, MemorySink};
    use serde_json::json;

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(MemorySink::new()), Redactor::new("test-salt"))
    }

    fn draft(action: &str) -> AuditDraft {
        AuditDraft::system(action, "run", "run-1", json!({"run_id": "run-1"}))
    }

    #[tokio::test]
    async fn chain_verifies_end_to_end() {
        let log = log();
        for action in ["run.started", "step.succeeded", "run.succeeded"] {
            log.append("acme", draft(action)).await.expect("append");
        }
        let events = log.events("acme").await.expect("load");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].prev_hash, GENESIS_HASH);
        verify(&events).expect("chain verifies");
    }

    #[tokio::test]
    async fn tamper_is_detected_at_first_divergence() {
        let log = log();
        for action in ["run.started", "step.succeeded", "run.succeeded"] {
            log.append("acme", draft(action)).await.expect("append");
        }
        let mut events = log.events("acme").await.expect("load");
        events[1].payload = json!({"run_id": "run-1", "forged": true});
        let divergence = verify(&events).expect_err("tamper detected");
        assert_eq!(divergence.seq, 1);
    }

    #[tokio::test]
    async fn tenants_have_independent_dense_sequences() {
        let log = log();
        log.append("acme", draft("run.started")).await.expect("append");
        log.append("umbrella", draft("run.started"))
            .await
            .expect("append");
        log.append("acme", draft("run.succeeded"))
            .await
            .expect("append");

        let acme = log.events("acme").await.expect("load");
        assert_eq!(acme.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1]);
        let umbrella = log.events("umbrella").await.expect("load");
        assert_eq!(umbrella[0].seq, 0);
    }

    #[tokio::test]
    async fn concurrent_appends_produce_a_total_order() {
        let log = Arc::new(log());
        let mut handles = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append("acme", draft(&format!("step.{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("append");
        }
        let events = log.events("acme").await.expect("load");
        assert_eq!(events.len(), 16);
        verify(&events).expect("total order verifies");
    }

    #[tokio::test]
    async fn secret_payload_fields_are_hashed_not_stored() {
        let log = log();
        let event = log
            .append(
                "acme",
                AuditDraft::system(
                    "step.succeeded",
                    "step",
                    "step-1",
                    json!({"args": {"password": "hunter2", "title": "X"}}),
                ),
            )
            .await
            .expect("append");
        assert!(event.payload["args"]["password"]["redacted"].is_string());
        assert_eq!(event.payload["args"]["title"], "X");
        verify(&[event]).expect("redacted event still verifies");
    }

    #[tokio::test]
    async fn file_sink_resumes_chain_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let log = AuditLog::new(
                Arc::new(FileSink::new(dir.path())),
                Redactor::new("test-salt"),
            );
            log.append("acme", draft("run.started")).await.expect("append");
        }
        let log = AuditLog::new(
            Arc::new(FileSink::new(dir.path())),
            Redactor::new("test-salt"),
        );
        log.append("acme", draft("run.succeeded"))
            .await
            .expect("append after restart");
        let events = log.events("acme").await.expect("load");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 1);
        verify(&events).expect("resumed chain verifies");
    }

    #[tokio::test]
    async fn export_slice_verifies_with_gaps() {
        let log = log();
        for i in 0..6 {
            let resource = if i % 2 == 0 { "run-1" } else { "run-2" };
            log.append(
                "acme",
                AuditDraft::system("step.succeeded", "run", resource, json!({})),
            )
            .await
            .expect("append");
        }
        let exported = log.events_for_run("acme", "run-1").await.expect("export");
        assert_eq!(exported.len(), 3);
        verify_export(&exported).expect("export verifies");
    }
}
