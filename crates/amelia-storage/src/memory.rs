//! In-memory `Store` implementation, primarily for tests.
//!
//! Provides the same semantics as [`crate::postgres::PostgresStore`];
//! exercised by the shared conformance suite so behavior cannot drift
//! between backends.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use amelia_contracts::{
    event::{Event, NewEvent},
    ids::new_id,
    token_usage::{NewTokenUsage, TokenUsage},
    workflow::{Workflow, WorkflowStatus},
    OrchestratorError,
};

use crate::store::{PruneOutcome, Store, WorkflowFilter};

struct WorkflowRow {
    workflow: Workflow,
    events: Vec<Event>,
    next_sequence: i64,
}

/// In-memory implementation of [`Store`]. Stores all data behind a single
/// mutex; fine for tests and small single-process deployments, never used
/// for the Postgres-backed production path.
pub struct InMemoryStore {
    workflows: Mutex<HashMap<Uuid, WorkflowRow>>,
    tokens: Mutex<Vec<TokenUsage>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_workflow(
        &self,
        issue_id: String,
        worktree_path: String,
        profile_id: String,
        max_concurrent: usize,
    ) -> Result<Workflow, OrchestratorError> {
        let mut workflows = self.workflows.lock();

        let active_count = workflows
            .values()
            .filter(|row| row.workflow.status.is_active())
            .count();
        if active_count >= max_concurrent {
            return Err(OrchestratorError::Capacity);
        }

        let conflict = workflows.values().any(|row| {
            row.workflow.worktree_path == worktree_path && row.workflow.status.is_active()
        });
        if conflict {
            return Err(OrchestratorError::Conflict { worktree_path });
        }

        let workflow = Workflow {
            id: new_id(),
            issue_id,
            worktree_path,
            profile_id,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            state_snapshot: None,
        };
        workflows.insert(
            workflow.id,
            WorkflowRow {
                workflow: workflow.clone(),
                events: Vec::new(),
                next_sequence: 1,
            },
        );
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, OrchestratorError> {
        Ok(self
            .workflows
            .lock()
            .get(&id)
            .map(|row| row.workflow.clone()))
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<Workflow>, OrchestratorError> {
        let workflows = self.workflows.lock();
        let mut result: Vec<Workflow> = workflows
            .values()
            .map(|row| row.workflow.clone())
            .filter(|w| filter.status.map_or(true, |s| s == w.status))
            .filter(|w| {
                filter
                    .worktree_path
                    .as_deref()
                    .map_or(true, |p| p == w.worktree_path)
            })
            .collect();
        result.sort_by_key(|w| w.created_at);
        Ok(result)
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<Workflow, OrchestratorError> {
        let mut workflows = self.workflows.lock();
        let row = workflows
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;

        if row.workflow.status != from {
            return Err(OrchestratorError::InvalidState(format!(
                "expected status {from}, found {}",
                row.workflow.status
            )));
        }
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidState(format!(
                "illegal transition {from} -> {to}"
            )));
        }
        row.workflow.status = to;
        Ok(row.workflow.clone())
    }

    async fn mark_started(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let mut workflows = self.workflows.lock();
        let row = workflows
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if row.workflow.started_at.is_none() {
            row.workflow.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        failure_reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        if !status.is_terminal() {
            return Err(OrchestratorError::Internal(format!(
                "{status} is not a terminal status"
            )));
        }
        let mut workflows = self.workflows.lock();
        let row = workflows
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if !row.workflow.status.can_transition_to(status) {
            return Err(OrchestratorError::InvalidState(format!(
                "illegal transition {} -> {status}",
                row.workflow.status
            )));
        }
        row.workflow.status = status;
        row.workflow.completed_at = Some(Utc::now());
        row.workflow.failure_reason = failure_reason;
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        id: Uuid,
        snapshot: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let mut workflows = self.workflows.lock();
        let row = workflows
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        row.workflow.state_snapshot = Some(snapshot);
        Ok(())
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, OrchestratorError> {
        let mut workflows = self.workflows.lock();
        let row = workflows
            .get_mut(&event.workflow_id)
            .ok_or(OrchestratorError::NotFound(event.workflow_id))?;

        let sequence = row.next_sequence;
        row.next_sequence += 1;

        let persisted = Event {
            id: new_id(),
            workflow_id: event.workflow_id,
            sequence,
            timestamp: Utc::now(),
            agent: event.agent,
            event_type: event.event_type,
            message: event.message,
            data: event.data,
            correlation_id: event.correlation_id,
        };
        row.events.push(persisted.clone());
        Ok(persisted)
    }

    async fn list_events(
        &self,
        workflow_id: Uuid,
        since_sequence: Option<i64>,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let workflows = self.workflows.lock();
        let row = workflows
            .get(&workflow_id)
            .ok_or(OrchestratorError::NotFound(workflow_id))?;
        let since = since_sequence.unwrap_or(0);
        Ok(row
            .events
            .iter()
            .filter(|e| e.sequence > since)
            .cloned()
            .collect())
    }

    async fn commit_step(
        &self,
        workflow_id: Uuid,
        events: Vec<NewEvent>,
        checkpoint: serde_json::Value,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let mut workflows = self.workflows.lock();
        let row = workflows
            .get_mut(&workflow_id)
            .ok_or(OrchestratorError::NotFound(workflow_id))?;

        let mut persisted = Vec::with_capacity(events.len());
        for event in events {
            let sequence = row.next_sequence;
            row.next_sequence += 1;
            let event = Event {
                id: new_id(),
                workflow_id: event.workflow_id,
                sequence,
                timestamp: Utc::now(),
                agent: event.agent,
                event_type: event.event_type,
                message: event.message,
                data: event.data,
                correlation_id: event.correlation_id,
            };
            row.events.push(event.clone());
            persisted.push(event);
        }
        row.workflow.state_snapshot = Some(checkpoint);
        Ok(persisted)
    }

    async fn record_tokens(&self, usage: NewTokenUsage) -> Result<TokenUsage, OrchestratorError> {
        let recorded = TokenUsage {
            id: new_id(),
            workflow_id: usage.workflow_id,
            agent: usage.agent,
            model: usage.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cost: usage.cost,
            timestamp: Utc::now(),
        };
        self.tokens.lock().push(recorded.clone());
        Ok(recorded)
    }

    async fn prune_events(
        &self,
        before_age: Duration,
        max_per_workflow: usize,
    ) -> Result<PruneOutcome, OrchestratorError> {
        let now = Utc::now();
        let grace = chrono::Duration::seconds(60);
        let mut deleted = 0u64;
        let mut workflows = self.workflows.lock();

        for row in workflows.values_mut() {
            let protect_recent = row.workflow.status.is_active()
                && row
                    .events
                    .last()
                    .map(|e| now.signed_duration_since(e.timestamp) < grace)
                    .unwrap_or(false);
            if protect_recent {
                continue;
            }

            let before = row.events.len();
            row.events
                .retain(|e| !crate::store::is_older_than(e.timestamp, before_age, now));

            if row.events.len() > max_per_workflow {
                let drop_count = row.events.len() - max_per_workflow;
                row.events.drain(0..drop_count);
            }
            deleted += (before - row.events.len()) as u64;
        }

        Ok(PruneOutcome {
            events_deleted: deleted,
        })
    }

    async fn active_count(&self) -> Result<usize, OrchestratorError> {
        Ok(self
            .workflows
            .lock()
            .values()
            .filter(|row| row.workflow.status.is_active())
            .count())
    }

    async fn list_resumable(&self) -> Result<Vec<Workflow>, OrchestratorError> {
        Ok(self
            .workflows
            .lock()
            .values()
            .map(|row| row.workflow.clone())
            .filter(|w| w.status.is_active())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_are_dense_and_monotonic() {
        let store = InMemoryStore::new();
        let wf = store
            .create_workflow("I-1".into(), "/w/a".into(), "P".into(), 5)
            .await
            .unwrap();

        for i in 0..5 {
            let e = store
                .append_event(NewEvent::new(
                    wf.id,
                    amelia_contracts::event::Agent::System,
                    amelia_contracts::event::EventType::StageStarted,
                    format!("step {i}"),
                ))
                .await
                .unwrap();
            assert_eq!(e.sequence, i as i64 + 1);
        }
    }

    #[tokio::test]
    async fn worktree_conflict_is_rejected() {
        let store = InMemoryStore::new();
        let _first = store
            .create_workflow("I-1".into(), "/w/a".into(), "P".into(), 5)
            .await
            .unwrap();
        store
            .update_status(_first.id, WorkflowStatus::Pending, WorkflowStatus::Running)
            .await
            .unwrap();

        let result = store
            .create_workflow("I-2".into(), "/w/a".into(), "P".into(), 5)
            .await;
        assert!(matches!(result, Err(OrchestratorError::Conflict { .. })));
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        let store = InMemoryStore::new();
        for i in 0..2 {
            let wf = store
                .create_workflow(format!("I-{i}"), format!("/w/{i}"), "P".into(), 2)
                .await
                .unwrap();
            store
                .update_status(wf.id, WorkflowStatus::Pending, WorkflowStatus::Running)
                .await
                .unwrap();
        }
        let result = store
            .create_workflow("I-3".into(), "/w/3".into(), "P".into(), 2)
            .await;
        assert!(matches!(result, Err(OrchestratorError::Capacity)));
    }

    #[tokio::test]
    async fn illegal_status_transition_is_rejected() {
        let store = InMemoryStore::new();
        let wf = store
            .create_workflow("I-1".into(), "/w/a".into(), "P".into(), 5)
            .await
            .unwrap();
        let result = store
            .update_status(wf.id, WorkflowStatus::Pending, WorkflowStatus::Blocked)
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
    }

    #[tokio::test]
    async fn since_sequence_returns_exact_suffix() {
        let store = InMemoryStore::new();
        let wf = store
            .create_workflow("I-1".into(), "/w/a".into(), "P".into(), 5)
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_event(NewEvent::new(
                    wf.id,
                    amelia_contracts::event::Agent::System,
                    amelia_contracts::event::EventType::StageStarted,
                    format!("step {i}"),
                ))
                .await
                .unwrap();
        }
        let suffix = store.list_events(wf.id, Some(3)).await.unwrap();
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix[0].sequence, 4);
        assert_eq!(suffix[1].sequence, 5);
    }
}
