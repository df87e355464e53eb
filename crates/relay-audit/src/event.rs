use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonical_string, sha256_hex};

/// Sentinel prev-hash for the first event of every tenant chain: 64 hex
/// zeros, a value SHA-256 can never produce for real data.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    System,
    Api,
}

/// One entry in a tenant's append-only chain.
///
/// `this_hash = sha256(prev_hash || canonical_json(event without this_hash))`.
/// Changing any field, including the redacted payload, invalidates the hash
/// and every later prev-hash link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub tenant: String,
    pub actor: String,
    pub actor_kind: ActorKind,
    /// Dotted verb, e.g. `run.started`, `step.succeeded`.
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub payload: Value,
    pub prev_hash: String,
    pub this_hash: String,
}

/// The caller-facing portion of an event; the log assigns seq, ts and hashes.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub actor: String,
    pub actor_kind: ActorKind,
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub payload: Value,
}

impl AuditDraft {
    pub fn system(action: &str, resource_kind: &str, resource_id: &str, payload: Value) -> Self {
        Self {
            actor: "relay".to_string(),
            actor_kind: ActorKind::System,
            action: action.to_string(),
            resource_kind: resource_kind.to_string(),
            resource_id: resource_id.to_string(),
            payload,
        }
    }

    pub fn user(
        actor: &str,
        action: &str,
        resource_kind: &str,
        resource_id: &str,
        payload: Value,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            actor_kind: ActorKind::User,
            action: action.to_string(),
            resource_kind: resource_kind.to_string(),
            resource_id: resource_id.to_string(),
            payload,
        }
    }
}

/// Hash input: the event with `this_hash` absent, keys canonicalized, and the
/// timestamp rendered as RFC 3339 UTC.
pub fn hash_event(event: &AuditEvent) -> String {
    let without_hash = json!({
        "seq": event.seq,
        "ts": event.ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        "tenant": event.tenant,
        "actor": event.actor,
        "actor_kind": event.actor_kind,
        "action": event.action,
        "resource_kind": event.resource_kind,
        "resource_id": event.resource_id,
        "payload": event.payload,
        "prev_hash": event.prev_hash,
    });
    let mut input = Vec::with_capacity(128);
    input.extend_from_slice(event.prev_hash.as_bytes());
    input.extend_from_slice(canonical_string(&without_hash).as_bytes());
    sha256_hex(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuditEvent {
        let mut event = AuditEvent {
            seq: 0,
            ts: Utc::now(),
            tenant: "acme".to_string(),
            actor: "relay".to_string(),
            actor_kind: ActorKind::System,
            action: "run.started".to_string(),
            resource_kind: "run".to_string(),
            resource_id: "run-1".to_string(),
            payload: json!({"mode": "execute"}),
            prev_hash: GENESIS_HASH.to_string(),
            this_hash: String::new(),
        };
        event.this_hash = hash_event(&event);
        event
    }

    #[test]
    fn hash_is_stable_for_identical_events() {
        let event = sample();
        assert_eq!(event.this_hash, hash_event(&event));
        assert_eq!(event.this_hash.len(), 64);
    }

    #[test]
    fn payload_tamper_changes_hash() {
        let mut event = sample();
        let original = event.this_hash.clone();
        event.payload = json!({"mode": "dry_run"});
        assert_ne!(hash_event(&event), original);
    }
}
