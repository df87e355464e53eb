use thiserror::Error;

/// Errors that cross component boundaries. Reviewer decisions and adapter
/// failures travel as values; this type is for failures of the machinery
/// itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("blocked by policy: {}", reasons.join("; "))]
    PolicyBlocked { reasons: Vec<String> },
    #[error("store failure: {0}")]
    Store(String),
    #[error("lease lost for run {0}")]
    LeaseLost(String),
    #[error("run {0} is owned by another executor")]
    LeaseHeld(String),
    #[error("run {0} already exists")]
    DuplicateRun(String),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("approval {0} not found")]
    ApprovalNotFound(String),
    #[error("approval {0} already decided")]
    ApprovalConflict(String),
    #[error("approval decider must be distinct from the run caller")]
    SelfApproval,
    #[error("agent output malformed after {attempts} attempts: {detail}")]
    AgentMalformed { attempts: u32, detail: String },
    #[error("audit append failed: {0}")]
    Audit(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code surfaced at the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::PolicyBlocked { .. } => "policy_error",
            EngineError::Store(_) | EngineError::Audit(_) => "store_error",
            EngineError::LeaseLost(_)
            | EngineError::LeaseHeld(_)
            | EngineError::DuplicateRun(_)
            | EngineError::ApprovalConflict(_) => "concurrency_error",
            EngineError::RunNotFound(_) | EngineError::ApprovalNotFound(_) => "not_found",
            EngineError::SelfApproval => "validation_error",
            EngineError::AgentMalformed { .. } => "agent_malformed",
            EngineError::Internal(_) => "internal",
        }
    }
}
