//! Exercises `LifecycleService` directly against an in-memory `Store`,
//! without an HTTP layer, for paths the API-level tests don't reach:
//! cancellation while blocked, and crash-recovery on restart.

use std::sync::Arc;
use std::time::Duration;

use amelia_contracts::workflow::WorkflowStatus;
use amelia_orchestrator::{Config, EventBus, FakeDriver, FakeTracker, LifecycleService};
use amelia_storage::{InMemoryStore, Store};

fn make_worktree() -> String {
    let dir = std::env::temp_dir().join(format!("amelia-orch-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join(".git")).unwrap();
    dir.to_str().unwrap().to_string()
}

fn test_config() -> Config {
    Config::from_env().unwrap_or_else(|_| panic!("from_env should supply defaults"))
}

async fn wait_for_status(store: &Arc<dyn Store>, id: uuid::Uuid, status: WorkflowStatus) {
    for _ in 0..50 {
        if store.get_workflow(id).await.unwrap().unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow {id} never reached {status:?}");
}

#[tokio::test]
async fn cancelling_a_blocked_workflow_finalizes_as_cancelled() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let event_bus = EventBus::new();
    let lifecycle = LifecycleService::new(
        store.clone(),
        event_bus,
        test_config(),
        Arc::new(FakeDriver::default()),
        Arc::new(FakeTracker),
    );

    let workflow = lifecycle
        .start("I-1".into(), make_worktree(), "P".into())
        .await
        .unwrap();

    wait_for_status(&store, workflow.id, WorkflowStatus::Blocked).await;

    lifecycle.cancel(workflow.id).await.unwrap();
    wait_for_status(&store, workflow.id, WorkflowStatus::Cancelled).await;

    let events = store.list_events(workflow.id, None).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == amelia_contracts::event::EventType::WorkflowCancelled));
}

#[tokio::test]
async fn recover_on_startup_resumes_a_blocked_workflow_from_checkpoint() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let event_bus = EventBus::new();
    let lifecycle = LifecycleService::new(
        store.clone(),
        event_bus.clone(),
        test_config(),
        Arc::new(FakeDriver::default()),
        Arc::new(FakeTracker),
    );

    let workflow = lifecycle
        .start("I-1".into(), make_worktree(), "P".into())
        .await
        .unwrap();
    wait_for_status(&store, workflow.id, WorkflowStatus::Blocked).await;

    // Simulate a restart: a fresh LifecycleService has no in-memory runner
    // registry, so the workflow row is all that's left to recover from.
    let recovered_lifecycle = LifecycleService::new(
        store.clone(),
        event_bus,
        test_config(),
        Arc::new(FakeDriver::default()),
        Arc::new(FakeTracker),
    );
    recovered_lifecycle.recover_on_startup().await.unwrap();

    recovered_lifecycle
        .decide(workflow.id, amelia_orchestrator::ApprovalDecision::Approved, None)
        .await
        .unwrap();

    wait_for_status(&store, workflow.id, WorkflowStatus::Completed).await;
}

#[tokio::test]
async fn recover_on_startup_fails_a_mid_node_running_workflow() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let event_bus = EventBus::new();

    // A row stuck in `running` with no live runner models a process that
    // died between node boundaries: recovery cannot assume a safe resume
    // point, so it must fail the workflow rather than guess.
    let workflow = store
        .create_workflow("I-1".into(), make_worktree(), "P".into(), 5)
        .await
        .unwrap();
    store
        .update_status(workflow.id, WorkflowStatus::Pending, WorkflowStatus::Running)
        .await
        .unwrap();

    let lifecycle = LifecycleService::new(
        store.clone(),
        event_bus,
        test_config(),
        Arc::new(FakeDriver::default()),
        Arc::new(FakeTracker),
    );
    lifecycle.recover_on_startup().await.unwrap();

    let reloaded = store.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, WorkflowStatus::Failed);
    assert_eq!(reloaded.failure_reason.as_deref(), Some("crash-recovery"));
}

#[tokio::test]
async fn double_decide_on_the_same_workflow_is_rejected() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let event_bus = EventBus::new();
    let lifecycle = LifecycleService::new(
        store.clone(),
        event_bus,
        test_config(),
        Arc::new(FakeDriver::default()),
        Arc::new(FakeTracker),
    );

    let workflow = lifecycle
        .start("I-1".into(), make_worktree(), "P".into())
        .await
        .unwrap();
    wait_for_status(&store, workflow.id, WorkflowStatus::Blocked).await;

    lifecycle
        .decide(workflow.id, amelia_orchestrator::ApprovalDecision::Approved, None)
        .await
        .unwrap();

    let second = lifecycle
        .decide(workflow.id, amelia_orchestrator::ApprovalDecision::Approved, None)
        .await;
    assert!(second.is_err());
}
