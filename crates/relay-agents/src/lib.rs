pub mod comparator;
pub mod planner;
pub mod provider;
pub mod reviewer;
pub mod schema;
pub mod toolcaller;

pub use comparator::*;
pub use planner::*;
pub use provider::*;
pub use reviewer::*;
pub use toolcaller::*;

use thiserror::Error;

use relay_types::StepUsage;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The LLM returned non-conforming output on every attempt.
    #[error("malformed agent output after {attempts} attempts: {detail}")]
    Malformed { attempts: u32, detail: String },
    /// The step cannot be refined without an LLM (stub mode, prompt-only).
    #[error("step `{0}` has no concrete tool")]
    Unresolvable(String),
    #[error("provider failure: {0}")]
    Provider(String),
}

/// Agent result plus the tokens and cost it burned, including failed
/// attempts; the executor accrues this into the owning step.
#[derive(Debug, Clone)]
pub struct AgentOutcome<T> {
    pub value: T,
    pub usage: StepUsage,
}

impl<T> AgentOutcome<T> {
    pub fn free(value: T) -> Self {
        Self {
            value,
            usage: StepUsage::default(),
        }
    }
}
