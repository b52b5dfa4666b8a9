//! State snapshot shape driven through the node graph (spec.md §4.3).
//!
//! No mutable field is written by more than one node. Append-only fields
//! (`agent_history`, `tool_calls`, `tool_results`) use a concatenation
//! reducer so partial snapshots produced during streaming execution never
//! lose entries.

use serde::{Deserialize, Serialize};

/// Schema tag checked by the Checkpointer on deserialize (spec.md §4.6).
/// Bump whenever a breaking change is made to `StateSnapshot`'s shape.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgenticStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub output: serde_json::Value,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub verdict: ReviewVerdict,
    pub feedback: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Frozen record passed between nodes. Serialized verbatim by the
/// Checkpointer and persisted on `workflows.state_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    pub issue_id: String,
    pub profile_id: String,

    pub agent_history: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,

    pub plan_text: Option<String>,
    pub goal: Option<String>,
    pub key_files: Vec<String>,

    pub pending_approval_correlation_id: Option<uuid::Uuid>,
    pub approval_decision: Option<ApprovalDecision>,
    pub approval_feedback: Option<String>,

    pub final_response: Option<String>,
    pub last_review: Option<ReviewResult>,
    pub review_iteration: u32,
    pub task_review_iteration: u32,

    pub agentic_status: AgenticStatus,
    pub driver_session_id: Option<String>,
}

fn default_schema_version() -> u32 {
    SNAPSHOT_SCHEMA_VERSION
}

impl StateSnapshot {
    pub fn new(issue_id: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            issue_id: issue_id.into(),
            profile_id: profile_id.into(),
            agent_history: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            plan_text: None,
            goal: None,
            key_files: Vec::new(),
            pending_approval_correlation_id: None,
            approval_decision: None,
            approval_feedback: None,
            final_response: None,
            last_review: None,
            review_iteration: 0,
            task_review_iteration: 0,
            agentic_status: AgenticStatus::Running,
            driver_session_id: None,
        }
    }

    /// Rebinds the profile at resume time without disturbing anything
    /// else, per the determinism-on-resume rule (spec.md §4.3): the
    /// profile is never part of what gets replayed from a checkpoint.
    pub fn rebind_profile(&mut self, profile_id: impl Into<String>) {
        self.profile_id = profile_id.into();
    }

    /// Append-only merge used when a streaming `execute` node produces a
    /// partial snapshot mid-run: concatenates logs instead of overwriting.
    pub fn merge_streamed(&mut self, partial: StreamedDelta) {
        self.agent_history.extend(partial.agent_history);
        self.tool_calls.extend(partial.tool_calls);
        self.tool_results.extend(partial.tool_results);
        if partial.final_response.is_some() {
            self.final_response = partial.final_response;
        }
    }
}

/// Output of a single streaming step inside `execute`; merged into the
/// owning snapshot via [`StateSnapshot::merge_streamed`].
#[derive(Debug, Clone, Default)]
pub struct StreamedDelta {
    pub agent_history: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub final_response: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_streamed_concatenates_without_losing_entries() {
        let mut snapshot = StateSnapshot::new("I-1", "P");
        snapshot.merge_streamed(StreamedDelta {
            agent_history: vec!["call tool a".into()],
            tool_calls: vec![ToolCall {
                name: "a".into(),
                arguments: serde_json::json!({}),
            }],
            tool_results: vec![],
            final_response: None,
        });
        snapshot.merge_streamed(StreamedDelta {
            agent_history: vec!["call tool b".into()],
            tool_calls: vec![ToolCall {
                name: "b".into(),
                arguments: serde_json::json!({}),
            }],
            tool_results: vec![],
            final_response: Some("done".into()),
        });

        assert_eq!(snapshot.agent_history.len(), 2);
        assert_eq!(snapshot.tool_calls.len(), 2);
        assert_eq!(snapshot.final_response.as_deref(), Some("done"));
    }

    #[test]
    fn rebind_profile_only_touches_profile_id() {
        let mut snapshot = StateSnapshot::new("I-1", "old-profile");
        snapshot.plan_text = Some("plan".into());
        snapshot.rebind_profile("new-profile");
        assert_eq!(snapshot.profile_id, "new-profile");
        assert_eq!(snapshot.plan_text.as_deref(), Some("plan"));
    }

    #[test]
    fn round_trips_through_json() {
        let snapshot = StateSnapshot::new("I-1", "P");
        let json = serde_json::to_value(&snapshot).unwrap();
        let back: StateSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(back.issue_id, "I-1");
    }
}
