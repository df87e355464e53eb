use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Loosely typed engine bus event. Consumers match on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    StepStarted,
    StepFinished,
    ApprovalRequested,
    ApprovalResolved,
    RunTerminated,
}

/// One entry of the per-run event feed behind `stream_run_events`.
/// `seq` is the restart cursor: dense, 0-based, per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub seq: u64,
    pub kind: RunEventKind,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}
