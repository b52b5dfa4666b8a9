//! Conformance suite shared across `Store` backends.
//!
//! `InMemoryStore` is exercised directly; `PostgresStore` is exercised only
//! when `TEST_DATABASE_URL` is set, since this workspace builds without a
//! live database.

use std::time::Duration;

use amelia_contracts::{
    event::{Agent, EventType, NewEvent},
    workflow::WorkflowStatus,
    OrchestratorError,
};
use amelia_storage::{InMemoryStore, PostgresStore, Store};

async fn conflict_then_capacity_then_events<S: Store>(store: &S) {
    let a = store
        .create_workflow("issue-1".into(), "/repo/a".into(), "default".into(), 2)
        .await
        .expect("first workflow in an unused worktree should succeed");
    assert_eq!(a.status, WorkflowStatus::Pending);

    store
        .update_status(a.id, WorkflowStatus::Pending, WorkflowStatus::Running)
        .await
        .unwrap();

    let conflict = store
        .create_workflow("issue-2".into(), "/repo/a".into(), "default".into(), 2)
        .await;
    assert!(matches!(conflict, Err(OrchestratorError::Conflict { .. })));

    let b = store
        .create_workflow("issue-3".into(), "/repo/b".into(), "default".into(), 2)
        .await
        .expect("second worktree is free");
    store
        .update_status(b.id, WorkflowStatus::Pending, WorkflowStatus::Running)
        .await
        .unwrap();

    let over_capacity = store
        .create_workflow("issue-4".into(), "/repo/c".into(), "default".into(), 2)
        .await;
    assert!(matches!(over_capacity, Err(OrchestratorError::Capacity)));

    for i in 0..3 {
        let event = store
            .append_event(NewEvent::new(
                a.id,
                Agent::System,
                EventType::StageStarted,
                format!("stage {i}"),
            ))
            .await
            .unwrap();
        assert_eq!(event.sequence, i as i64 + 1);
    }

    let all = store.list_events(a.id, None).await.unwrap();
    assert_eq!(all.len(), 3);
    let suffix = store.list_events(a.id, Some(1)).await.unwrap();
    assert_eq!(suffix.len(), 2);

    store
        .finalize(a.id, WorkflowStatus::Completed, None)
        .await
        .unwrap();
    let finalized = store.get_workflow(a.id).await.unwrap().unwrap();
    assert_eq!(finalized.status, WorkflowStatus::Completed);
    assert!(finalized.completed_at.is_some());

    // worktree is free again once the holder reaches a terminal state.
    let reused = store
        .create_workflow("issue-5".into(), "/repo/a".into(), "default".into(), 2)
        .await;
    assert!(reused.is_ok());
}

async fn prune_respects_active_grace_period<S: Store>(store: &S) {
    let wf = store
        .create_workflow("issue-prune".into(), "/repo/prune".into(), "default".into(), 5)
        .await
        .unwrap();
    store
        .update_status(wf.id, WorkflowStatus::Pending, WorkflowStatus::Running)
        .await
        .unwrap();
    store
        .append_event(NewEvent::new(
            wf.id,
            Agent::System,
            EventType::StageStarted,
            "recent",
        ))
        .await
        .unwrap();

    // An active workflow's most recent events survive a prune even with a
    // zero max age, because they fall inside the 60s grace window.
    let outcome = store
        .prune_events(Duration::from_secs(0), 100)
        .await
        .unwrap();
    assert_eq!(outcome.events_deleted, 0);
    let remaining = store.list_events(wf.id, None).await.unwrap();
    assert_eq!(remaining.len(), 1);
}

async fn commit_step_persists_events_and_checkpoint_together<S: Store>(store: &S) {
    let wf = store
        .create_workflow("issue-commit".into(), "/repo/commit".into(), "default".into(), 5)
        .await
        .unwrap();
    store
        .update_status(wf.id, WorkflowStatus::Pending, WorkflowStatus::Running)
        .await
        .unwrap();

    let checkpoint = serde_json::json!({"schema_version": 1, "step": "plan"});
    let persisted = store
        .commit_step(
            wf.id,
            vec![NewEvent::new(wf.id, Agent::System, EventType::StageStarted, "plan")],
            checkpoint.clone(),
        )
        .await
        .unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].sequence, 1);

    let reloaded = store.get_workflow(wf.id).await.unwrap().unwrap();
    assert_eq!(reloaded.state_snapshot, Some(checkpoint));
    let events = store.list_events(wf.id, None).await.unwrap();
    assert_eq!(events.len(), 1);

    // Sequence numbers keep advancing across mixed append_event/commit_step calls.
    store
        .append_event(NewEvent::new(wf.id, Agent::System, EventType::StageCompleted, "plan done"))
        .await
        .unwrap();
    let next_checkpoint = serde_json::json!({"schema_version": 1, "step": "review"});
    let persisted = store
        .commit_step(wf.id, vec![], next_checkpoint.clone())
        .await
        .unwrap();
    assert!(persisted.is_empty());
    let reloaded = store.get_workflow(wf.id).await.unwrap().unwrap();
    assert_eq!(reloaded.state_snapshot, Some(next_checkpoint));
    assert_eq!(store.list_events(wf.id, None).await.unwrap().len(), 2);

    let missing = uuid::Uuid::new_v4();
    let err = store.commit_step(missing, vec![], serde_json::json!({})).await;
    assert!(matches!(err, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn in_memory_store_conforms() {
    let store = InMemoryStore::new();
    conflict_then_capacity_then_events(&store).await;
}

#[tokio::test]
async fn in_memory_store_prune_respects_grace_period() {
    let store = InMemoryStore::new();
    prune_respects_active_grace_period(&store).await;
}

#[tokio::test]
async fn in_memory_store_commit_step_conforms() {
    let store = InMemoryStore::new();
    commit_step_persists_events_and_checkpoint_together(&store).await;
}

#[tokio::test]
async fn postgres_store_conforms() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };
    let store = PostgresStore::connect(&url).await.unwrap();
    store.run_migrations().await.unwrap();
    conflict_then_capacity_then_events(&store).await;
    commit_step_persists_events_and_checkpoint_together(&store).await;
}
