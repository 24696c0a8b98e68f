use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetentionError {
    /// Malformed policy or hold, rejected before persistence
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient failure talking to the tiered storage backend
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Race or programming guard, e.g. deleting held data
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A custom rule and a legal hold disagree on disposition
    #[error("Compliance conflict: {0}")]
    ComplianceConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classification used in execution results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Backend,
    InvariantViolation,
    ComplianceConflict,
    Other,
}

impl RetentionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetentionError::Validation(_) => ErrorKind::Validation,
            RetentionError::Backend(_) => ErrorKind::Backend,
            RetentionError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            RetentionError::ComplianceConflict(_) => ErrorKind::ComplianceConflict,
            _ => ErrorKind::Other,
        }
    }

    /// Backend and persistence failures are retried by the executor
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RetentionError::Backend(_) | RetentionError::Persistence(_))
    }
}

pub type RetentionResult<T> = Result<T, RetentionError>;
