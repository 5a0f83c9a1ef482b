use crate::model::{Ms, format_instant};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No manager with a slot on the requested date matches the criteria.
    #[error("no sales manager matches the requested criteria")]
    NotFound,
    /// Matching managers exist, but none is free at the requested instant.
    #[error("no available slot starts at {}", format_instant(*desired_start))]
    Conflict { desired_start: Ms },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound => "not_found",
            EngineError::Conflict { .. } => "conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Persistence(_) => "persistence",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Persistence(e) if e.is_transient())
    }
}
