//! Shared error taxonomy (spec.md §7).
//!
//! One closed enum, not one per subsystem: the spec's taxonomy is shared
//! across the Store, the Lifecycle Service, and the State Machine Runtime,
//! so a single type lets `amelia-api` map every failure to an HTTP status
//! without re-deriving the mapping per crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("worktree {worktree_path} already has an active workflow")]
    Conflict { worktree_path: String },

    #[error("global concurrency cap reached")]
    Capacity,

    #[error("workflow {0} not found")]
    NotFound(Uuid),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Error kind name as surfaced in the `{error: <kind>}` response body
    /// (spec.md §6.1).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation",
            Self::Conflict { .. } => "Conflict",
            Self::Capacity => "Capacity",
            Self::NotFound(_) => "NotFound",
            Self::InvalidState(_) => "InvalidState",
            Self::Transient(_) => "Transient",
            Self::Terminal(_) => "Terminal",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether retry policy should retry this error (Transient) or fail
    /// fast (everything else).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(OrchestratorError::Transient("timeout".into()).is_retryable());
        assert!(!OrchestratorError::Terminal("bad schema".into()).is_retryable());
        assert!(!OrchestratorError::Validation("bad path".into()).is_retryable());
    }

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(OrchestratorError::Capacity.kind(), "Capacity");
        assert_eq!(
            OrchestratorError::Conflict {
                worktree_path: "/w/a".into()
            }
            .kind(),
            "Conflict"
        );
    }
}
