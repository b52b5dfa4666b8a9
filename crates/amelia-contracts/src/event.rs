//! Event DTO and the closed event-type set (spec.md §3, §6.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Agent tag attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Architect,
    Developer,
    Reviewer,
    System,
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Architect => "architect",
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

/// The closed set of event types (spec.md §6.3). Kept as a string newtype
/// rather than an enum with serde tagging because `data` payloads vary by
/// type and are validated by the producing node, not by this DTO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    StageStarted,
    StageCompleted,
    ApprovalRequired,
    ApprovalGranted,
    ApprovalRejected,
    FileCreated,
    FileModified,
    FileDeleted,
    ReviewRequested,
    ReviewCompleted,
    RevisionRequested,
    SystemError,
    SystemWarning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", json.as_str().unwrap_or("UNKNOWN"))
    }
}

/// An append-only record in a workflow's event log (spec.md §3).
///
/// `sequence` is assigned by the Store (C2) under its serialized write path;
/// nothing else is permitted to generate sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub agent: Agent,
    pub event_type: EventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

/// Fields needed to append a new event; `id`, `sequence`, and `timestamp`
/// are assigned by the Store.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub workflow_id: Uuid,
    pub agent: Agent,
    pub event_type: EventType,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub correlation_id: Option<Uuid>,
}

impl NewEvent {
    pub fn new(
        workflow_id: Uuid,
        agent: Agent,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            agent,
            event_type,
            message: message.into(),
            data: None,
            correlation_id: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&EventType::ApprovalRequired).unwrap();
        assert_eq!(json, "\"APPROVAL_REQUIRED\"");
    }

    #[test]
    fn event_type_roundtrips() {
        for et in [
            EventType::WorkflowStarted,
            EventType::StageCompleted,
            EventType::SystemWarning,
        ] {
            let json = serde_json::to_string(&et).unwrap();
            let back: EventType = serde_json::from_str(&json).unwrap();
            assert_eq!(et, back);
        }
    }
}
