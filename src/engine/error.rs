use ulid::Ulid;

use crate::model::{RangeError, ResourceConflict};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid range: {0}")]
    InvalidRange(#[from] RangeError),
    #[error("conflict: {}", describe(.0))]
    Conflict(Vec<ResourceConflict>),
    #[error("consistency check failed: {0}")]
    Consistency(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("amount must be positive and within limits")]
    InvalidAmount,
    #[error("{id} is {from}, cannot {action}")]
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        action: &'static str,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn describe(conflicts: &[ResourceConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

impl EngineError {
    /// Status code the HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(_) | EngineError::AlreadyExists(_) => 409,
            EngineError::InvalidRange(_)
            | EngineError::InvalidAmount
            | EngineError::InvalidTransition { .. }
            | EngineError::LimitExceeded(_) => 400,
            EngineError::Timeout(_) => 503,
            EngineError::Consistency(_) | EngineError::WalError(_) => 500,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::Conflict(_) => "conflict",
            EngineError::Consistency(_) => "consistency",
            EngineError::Timeout(_) => "timeout",
            EngineError::InvalidAmount => "invalid_amount",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }

    /// The conflicting sets, if this is a conflict.
    pub fn conflicts(&self) -> Option<&[ResourceConflict]> {
        match self {
            EngineError::Conflict(c) => Some(c),
            _ => None,
        }
    }
}
