use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalState {
    pub fn is_terminal(self) -> bool {
        self != ApprovalState::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approved,
    Denied,
}

/// At most one non-terminal approval exists per (run, step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub step_index: usize,
    pub requested_by: String,
    pub reason: String,
    pub state: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(
        run_id: &str,
        step_index: usize,
        requested_by: &str,
        reason: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("appr-{}", Uuid::new_v4()),
            run_id: run_id.to_string(),
            step_index,
            requested_by: requested_by.to_string(),
            reason,
            state: ApprovalState::Pending,
            decider: None,
            decided_at: None,
            comment: None,
            expires_at,
        }
    }
}
