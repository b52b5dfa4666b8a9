//! PostgreSQL-backed `Store` implementation (component C2, spec.md §4.1).
//!
//! Every multi-table write is wrapped in a single `sqlx::Transaction` so
//! observers never see half-applied state, matching the teacher's
//! `Database` repository pattern (one `PgPool`, plain `sqlx::query_as`
//! rather than the compile-time `query!` macro, since this crate must
//! build without a live database).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use amelia_contracts::{
    event::{Agent, Event, EventType, NewEvent},
    ids::new_id,
    token_usage::{NewTokenUsage, TokenUsage},
    workflow::{Workflow, WorkflowStatus},
    OrchestratorError,
};

use crate::store::{PruneOutcome, Store, WorkflowFilter};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_to_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "pending",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Blocked => "blocked",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> Result<WorkflowStatus, OrchestratorError> {
    Ok(match s {
        "pending" => WorkflowStatus::Pending,
        "running" => WorkflowStatus::Running,
        "blocked" => WorkflowStatus::Blocked,
        "completed" => WorkflowStatus::Completed,
        "failed" => WorkflowStatus::Failed,
        "cancelled" => WorkflowStatus::Cancelled,
        other => {
            return Err(OrchestratorError::Internal(format!(
                "unknown workflow status in database: {other}"
            )))
        }
    })
}

fn agent_to_str(agent: Agent) -> &'static str {
    match agent {
        Agent::Architect => "architect",
        Agent::Developer => "developer",
        Agent::Reviewer => "reviewer",
        Agent::System => "system",
    }
}

fn agent_from_str(s: &str) -> Result<Agent, OrchestratorError> {
    Ok(match s {
        "architect" => Agent::Architect,
        "developer" => Agent::Developer,
        "reviewer" => Agent::Reviewer,
        "system" => Agent::System,
        other => {
            return Err(OrchestratorError::Internal(format!(
                "unknown agent in database: {other}"
            )))
        }
    })
}

fn event_type_to_str(event_type: EventType) -> &'static str {
    match event_type {
        EventType::WorkflowStarted => "WORKFLOW_STARTED",
        EventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
        EventType::WorkflowFailed => "WORKFLOW_FAILED",
        EventType::WorkflowCancelled => "WORKFLOW_CANCELLED",
        EventType::StageStarted => "STAGE_STARTED",
        EventType::StageCompleted => "STAGE_COMPLETED",
        EventType::ApprovalRequired => "APPROVAL_REQUIRED",
        EventType::ApprovalGranted => "APPROVAL_GRANTED",
        EventType::ApprovalRejected => "APPROVAL_REJECTED",
        EventType::FileCreated => "FILE_CREATED",
        EventType::FileModified => "FILE_MODIFIED",
        EventType::FileDeleted => "FILE_DELETED",
        EventType::ReviewRequested => "REVIEW_REQUESTED",
        EventType::ReviewCompleted => "REVIEW_COMPLETED",
        EventType::RevisionRequested => "REVISION_REQUESTED",
        EventType::SystemError => "SYSTEM_ERROR",
        EventType::SystemWarning => "SYSTEM_WARNING",
    }
}

fn event_type_from_str(s: &str) -> Result<EventType, OrchestratorError> {
    Ok(match s {
        "WORKFLOW_STARTED" => EventType::WorkflowStarted,
        "WORKFLOW_COMPLETED" => EventType::WorkflowCompleted,
        "WORKFLOW_FAILED" => EventType::WorkflowFailed,
        "WORKFLOW_CANCELLED" => EventType::WorkflowCancelled,
        "STAGE_STARTED" => EventType::StageStarted,
        "STAGE_COMPLETED" => EventType::StageCompleted,
        "APPROVAL_REQUIRED" => EventType::ApprovalRequired,
        "APPROVAL_GRANTED" => EventType::ApprovalGranted,
        "APPROVAL_REJECTED" => EventType::ApprovalRejected,
        "FILE_CREATED" => EventType::FileCreated,
        "FILE_MODIFIED" => EventType::FileModified,
        "FILE_DELETED" => EventType::FileDeleted,
        "REVIEW_REQUESTED" => EventType::ReviewRequested,
        "REVIEW_COMPLETED" => EventType::ReviewCompleted,
        "REVISION_REQUESTED" => EventType::RevisionRequested,
        "SYSTEM_ERROR" => EventType::SystemError,
        "SYSTEM_WARNING" => EventType::SystemWarning,
        other => {
            return Err(OrchestratorError::Internal(format!(
                "unknown event type in database: {other}"
            )))
        }
    })
}

fn map_sqlx_err(err: sqlx::Error) -> OrchestratorError {
    error!("database error: {err}");
    OrchestratorError::Internal(format!("database error: {err}"))
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow, OrchestratorError> {
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    Ok(Workflow {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        issue_id: row.try_get("issue_id").map_err(map_sqlx_err)?,
        worktree_path: row.try_get("worktree_path").map_err(map_sqlx_err)?,
        profile_id: row.try_get("profile_id").map_err(map_sqlx_err)?,
        status: status_from_str(&status)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
        started_at: row.try_get("started_at").map_err(map_sqlx_err)?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx_err)?,
        failure_reason: row.try_get("failure_reason").map_err(map_sqlx_err)?,
        state_snapshot: row.try_get("state_snapshot").map_err(map_sqlx_err)?,
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, OrchestratorError> {
    let agent: String = row.try_get("agent").map_err(map_sqlx_err)?;
    let event_type: String = row.try_get("event_type").map_err(map_sqlx_err)?;
    Ok(Event {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        workflow_id: row.try_get("workflow_id").map_err(map_sqlx_err)?,
        sequence: row.try_get("sequence").map_err(map_sqlx_err)?,
        timestamp: row.try_get("timestamp").map_err(map_sqlx_err)?,
        agent: agent_from_str(&agent)?,
        event_type: event_type_from_str(&event_type)?,
        message: row.try_get("message").map_err(map_sqlx_err)?,
        data: row.try_get("data").map_err(map_sqlx_err)?,
        correlation_id: row.try_get("correlation_id").map_err(map_sqlx_err)?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self))]
    async fn create_workflow(
        &self,
        issue_id: String,
        worktree_path: String,
        profile_id: String,
        max_concurrent: usize,
    ) -> Result<Workflow, OrchestratorError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let active_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflows WHERE status IN ('running', 'blocked')",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if active_count as usize >= max_concurrent {
            return Err(OrchestratorError::Capacity);
        }

        let conflict: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflows WHERE worktree_path = $1 AND status IN ('running', 'blocked')",
        )
        .bind(&worktree_path)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if conflict > 0 {
            return Err(OrchestratorError::Conflict { worktree_path });
        }

        let id = new_id();
        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workflows (id, issue_id, worktree_path, profile_id, status, created_at, next_sequence)
            VALUES ($1, $2, $3, $4, 'pending', $5, 1)
            "#,
        )
        .bind(id)
        .bind(&issue_id)
        .bind(&worktree_path)
        .bind(&profile_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(Workflow {
            id,
            issue_id,
            worktree_path,
            profile_id,
            status: WorkflowStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            state_snapshot: None,
        })
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, OrchestratorError> {
        let row = sqlx::query(
            "SELECT id, issue_id, worktree_path, profile_id, status, created_at, started_at, completed_at, failure_reason, state_snapshot FROM workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<Workflow>, OrchestratorError> {
        let status = filter.status.map(status_to_str);
        let rows = sqlx::query(
            r#"
            SELECT id, issue_id, worktree_path, profile_id, status, created_at, started_at, completed_at, failure_reason, state_snapshot
            FROM workflows
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR worktree_path = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(status)
        .bind(&filter.worktree_path)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_workflow).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<Workflow, OrchestratorError> {
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidState(format!(
                "illegal transition {from} -> {to}"
            )));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let updated = sqlx::query(
            "UPDATE workflows SET status = $1 WHERE id = $2 AND status = $3 RETURNING id",
        )
        .bind(status_to_str(to))
        .bind(id)
        .bind(status_to_str(from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if updated.is_none() {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM workflows WHERE id = $1)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            return Err(if exists {
                OrchestratorError::InvalidState(format!("expected status {from}"))
            } else {
                OrchestratorError::NotFound(id)
            });
        }
        tx.commit().await.map_err(map_sqlx_err)?;

        self.get_workflow(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    async fn mark_started(&self, id: Uuid) -> Result<(), OrchestratorError> {
        sqlx::query("UPDATE workflows SET started_at = COALESCE(started_at, $2) WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
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
        let result = sqlx::query(
            "UPDATE workflows SET status = $1, completed_at = $2, failure_reason = $3 WHERE id = $4",
        )
        .bind(status_to_str(status))
        .bind(Utc::now())
        .bind(&failure_reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id));
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        id: Uuid,
        snapshot: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let result = sqlx::query("UPDATE workflows SET state_snapshot = $1 WHERE id = $2")
            .bind(snapshot)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, event))]
    async fn append_event(&self, event: NewEvent) -> Result<Event, OrchestratorError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let sequence: i64 = sqlx::query_scalar(
            "UPDATE workflows SET next_sequence = next_sequence + 1 WHERE id = $1 RETURNING next_sequence - 1",
        )
        .bind(event.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(OrchestratorError::NotFound(event.workflow_id))?;

        let id = new_id();
        let timestamp = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO events (id, workflow_id, sequence, timestamp, agent, event_type, message, data, correlation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(event.workflow_id)
        .bind(sequence)
        .bind(timestamp)
        .bind(agent_to_str(event.agent))
        .bind(event_type_to_str(event.event_type))
        .bind(&event.message)
        .bind(&event.data)
        .bind(event.correlation_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(Event {
            id,
            workflow_id: event.workflow_id,
            sequence,
            timestamp,
            agent: event.agent,
            event_type: event.event_type,
            message: event.message,
            data: event.data,
            correlation_id: event.correlation_id,
        })
    }

    async fn list_events(
        &self,
        workflow_id: Uuid,
        since_sequence: Option<i64>,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, sequence, timestamp, agent, event_type, message, data, correlation_id
            FROM events
            WHERE workflow_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(workflow_id)
        .bind(since_sequence.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self, events, checkpoint))]
    async fn commit_step(
        &self,
        workflow_id: Uuid,
        events: Vec<NewEvent>,
        checkpoint: serde_json::Value,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut persisted = Vec::with_capacity(events.len());

        for event in events {
            let sequence: i64 = sqlx::query_scalar(
                "UPDATE workflows SET next_sequence = next_sequence + 1 WHERE id = $1 RETURNING next_sequence - 1",
            )
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(OrchestratorError::NotFound(workflow_id))?;

            let id = new_id();
            let timestamp = Utc::now();
            sqlx::query(
                r#"
                INSERT INTO events (id, workflow_id, sequence, timestamp, agent, event_type, message, data, correlation_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(id)
            .bind(workflow_id)
            .bind(sequence)
            .bind(timestamp)
            .bind(agent_to_str(event.agent))
            .bind(event_type_to_str(event.event_type))
            .bind(&event.message)
            .bind(&event.data)
            .bind(event.correlation_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            persisted.push(Event {
                id,
                workflow_id,
                sequence,
                timestamp,
                agent: event.agent,
                event_type: event.event_type,
                message: event.message,
                data: event.data,
                correlation_id: event.correlation_id,
            });
        }

        let result = sqlx::query("UPDATE workflows SET state_snapshot = $1 WHERE id = $2")
            .bind(&checkpoint)
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(workflow_id));
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(persisted)
    }

    async fn record_tokens(&self, usage: NewTokenUsage) -> Result<TokenUsage, OrchestratorError> {
        let id = new_id();
        let timestamp = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO token_usage (id, workflow_id, agent, model, input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, cost, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(usage.workflow_id)
        .bind(agent_to_str(usage.agent))
        .bind(&usage.model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cache_read_tokens)
        .bind(usage.cache_creation_tokens)
        .bind(usage.cost)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(TokenUsage {
            id,
            workflow_id: usage.workflow_id,
            agent: usage.agent,
            model: usage.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cost: usage.cost,
            timestamp,
        })
    }

    async fn prune_events(
        &self,
        before_age: Duration,
        max_per_workflow: usize,
    ) -> Result<PruneOutcome, OrchestratorError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(before_age)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let grace_cutoff = Utc::now() - chrono::Duration::seconds(60);

        let result = sqlx::query(
            r#"
            DELETE FROM events e
            USING workflows w
            WHERE e.workflow_id = w.id
              AND e.timestamp < $1
              AND NOT (w.status IN ('running', 'blocked') AND e.timestamp >= $2)
            "#,
        )
        .bind(cutoff)
        .bind(grace_cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let mut deleted = result.rows_affected();

        let capped = sqlx::query(
            r#"
            DELETE FROM events e
            WHERE e.id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY workflow_id ORDER BY sequence DESC
                    ) AS rn
                    FROM events
                ) ranked
                WHERE ranked.rn > $1
            )
            "#,
        )
        .bind(max_per_workflow as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        deleted += capped.rows_affected();

        Ok(PruneOutcome {
            events_deleted: deleted,
        })
    }

    async fn active_count(&self) -> Result<usize, OrchestratorError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflows WHERE status IN ('running', 'blocked')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(count as usize)
    }

    async fn list_resumable(&self) -> Result<Vec<Workflow>, OrchestratorError> {
        let rows = sqlx::query(
            r#"
            SELECT id, issue_id, worktree_path, profile_id, status, created_at, started_at, completed_at, failure_reason, state_snapshot
            FROM workflows
            WHERE status IN ('running', 'blocked')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_workflow).collect()
    }
}
