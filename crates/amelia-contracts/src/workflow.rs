//! Workflow DTO and status DFA (spec.md §3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a workflow.
///
/// Legal transitions (enforced by the Lifecycle Service, not by this type):
/// `pending -> running`, `running -> blocked`, `blocked -> running`,
/// `running -> completed | failed`, `running | blocked -> cancelled`,
/// `pending -> cancelled`. All other states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// A workflow is "active" iff it holds the worktree lease and counts
    /// against `max_concurrent`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Blocked)
    }

    /// Terminal states are sinks: no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if `self -> to` is a legal transition under the DFA.
    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Blocked)
                | (Blocked, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Blocked, Cancelled)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A single execution of the state machine against one issue and one
/// worktree (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Workflow {
    pub id: Uuid,
    pub issue_id: String,
    pub worktree_path: String,
    pub profile_id: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Opaque, versioned snapshot owned by the Checkpointer (C4). Never
    /// interpreted by API consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_snapshot: Option<serde_json::Value>,
}

/// Summary view returned by `GET /workflows` (omits the checkpoint blob).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub issue_id: String,
    pub worktree_path: String,
    pub profile_id: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl From<Workflow> for WorkflowSummary {
    fn from(w: Workflow) -> Self {
        Self {
            id: w.id,
            issue_id: w.issue_id,
            worktree_path: w.worktree_path,
            profile_id: w.profile_id,
            status: w.status,
            created_at: w.created_at,
            started_at: w.started_at,
            completed_at: w.completed_at,
            failure_reason: w.failure_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowStatus::*;

    #[test]
    fn legal_transitions_are_accepted() {
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Blocked.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Cancelled));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Blocked));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Pending, Running, Blocked, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn active_states_are_running_and_blocked_only() {
        assert!(Running.is_active());
        assert!(Blocked.is_active());
        assert!(!Pending.is_active());
        assert!(!Completed.is_active());
    }
}
