use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure discriminant for an effector call. Only `Transient` and `Timeout`
/// are retried by the executor; everything else surfaces immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    ValidationFailed,
    PreconditionFailed,
    Transient,
    Permanent,
    Timeout,
    Unauthorized,
}

impl AdapterErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, AdapterErrorKind::Transient | AdapterErrorKind::Timeout)
    }

    pub fn code(self) -> &'static str {
        match self {
            AdapterErrorKind::ValidationFailed => "validation_failed",
            AdapterErrorKind::PreconditionFailed => "precondition_failed",
            AdapterErrorKind::Transient => "adapter_transient",
            AdapterErrorKind::Permanent => "adapter_permanent",
            AdapterErrorKind::Timeout => "adapter_timeout",
            AdapterErrorKind::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::ValidationFailed, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }
}
