//! The `Store` trait (component C2, spec.md §4.1).
//!
//! Implementations must uphold the invariants of spec.md §3: one active
//! lease per worktree, an admission-time capacity check, and dense
//! monotonic per-workflow event sequences. Both `PostgresStore` and
//! `InMemoryStore` are exercised by the shared conformance suite in
//! `tests/store_conformance.rs` so the invariants cannot drift between
//! backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use amelia_contracts::{
    event::{Event, NewEvent},
    token_usage::{NewTokenUsage, TokenUsage},
    workflow::{Workflow, WorkflowStatus},
    OrchestratorError,
};

/// Filter for `GET /workflows` (spec.md §6.1).
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub worktree_path: Option<String>,
}

/// Outcome of `prune_events` (spec.md §4.1, §4.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub events_deleted: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically checks the worktree-conflict and capacity invariants and
    /// inserts a new `pending` workflow row.
    ///
    /// Fails with `Conflict` if an active workflow already holds
    /// `worktree_path`, or `Capacity` if the global active count is already
    /// at `max_concurrent`.
    async fn create_workflow(
        &self,
        issue_id: String,
        worktree_path: String,
        profile_id: String,
        max_concurrent: usize,
    ) -> Result<Workflow, OrchestratorError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, OrchestratorError>;

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<Workflow>, OrchestratorError>;

    /// Optimistic status transition: fails with `InvalidState` if the
    /// current status is not `from`, preventing races in the approval path
    /// (spec.md §4.1).
    async fn update_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<Workflow, OrchestratorError>;

    /// Records `started_at` the first time a workflow leaves `pending`.
    async fn mark_started(&self, id: Uuid) -> Result<(), OrchestratorError>;

    /// Transitions to a terminal status and records `completed_at` /
    /// `failure_reason` in a single transaction.
    async fn finalize(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        failure_reason: Option<String>,
    ) -> Result<(), OrchestratorError>;

    /// Persists the opaque checkpoint blob owned by the Checkpointer (C4).
    /// Used on its own only where no event accompanies the checkpoint (the
    /// cooperative-cancellation path); a node step that also produces
    /// events must go through [`Store::commit_step`] instead so the two
    /// are never observed independently.
    async fn save_checkpoint(
        &self,
        id: Uuid,
        snapshot: serde_json::Value,
    ) -> Result<(), OrchestratorError>;

    /// Assigns the next per-workflow sequence number and persists the
    /// event. Sequences are dense and strictly increasing starting at 1.
    async fn append_event(&self, event: NewEvent) -> Result<Event, OrchestratorError>;

    /// Persists the event(s) produced by one node step and the checkpoint
    /// that followed them in a single atomic operation (spec.md §4.6): a
    /// reader — including a crash-recovery scan — never observes the
    /// checkpoint without the events that produced it, or vice versa.
    /// `events` may be empty (a node that only advances state silently).
    async fn commit_step(
        &self,
        workflow_id: Uuid,
        events: Vec<NewEvent>,
        checkpoint: serde_json::Value,
    ) -> Result<Vec<Event>, OrchestratorError>;

    /// Ordered events for backfill; `since_sequence` excludes anything at
    /// or before that sequence.
    async fn list_events(
        &self,
        workflow_id: Uuid,
        since_sequence: Option<i64>,
    ) -> Result<Vec<Event>, OrchestratorError>;

    async fn record_tokens(&self, usage: NewTokenUsage) -> Result<TokenUsage, OrchestratorError>;

    /// Deletes events older than `before_age`, then caps each workflow's
    /// remaining events at `max_per_workflow`. Never touches events from
    /// the last 60 seconds of an active workflow's activity.
    async fn prune_events(
        &self,
        before_age: Duration,
        max_per_workflow: usize,
    ) -> Result<PruneOutcome, OrchestratorError>;

    /// Number of workflows currently in `running` or `blocked`.
    async fn active_count(&self) -> Result<usize, OrchestratorError>;

    /// Workflows left in `running` or `blocked` from a prior process
    /// lifetime, for crash-recovery scanning at startup (spec.md §4.2).
    async fn list_resumable(&self) -> Result<Vec<Workflow>, OrchestratorError>;
}

/// Helper shared by both backends: is `now - timestamp >= age`?
pub fn is_older_than(timestamp: DateTime<Utc>, age: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(age) {
        Ok(age) => now.signed_duration_since(timestamp) >= age,
        Err(_) => false,
    }
}
