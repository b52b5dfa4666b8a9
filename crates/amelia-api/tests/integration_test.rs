//! End-to-end scenarios against the in-process router, no socket bound.
//! Mirrors the literal scenarios from spec.md §8.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use amelia_api::{router, AppState};
use amelia_contracts::event::EventType;
use amelia_orchestrator::{Config, EventBus, FakeDriver, FakeTracker, LifecycleService};
use amelia_storage::{InMemoryStore, Store};

fn make_worktree() -> String {
    let dir = std::env::temp_dir().join(format!("amelia-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(dir.join(".git")).unwrap();
    dir.to_str().unwrap().to_string()
}

fn test_config(max_concurrent: usize) -> Config {
    let mut config = Config::from_env().unwrap_or_else(|_| panic!("from_env should supply defaults"));
    config.max_concurrent = max_concurrent;
    config
}

fn build_app(max_concurrent: usize) -> (axum::Router, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let event_bus = EventBus::new();
    let config = test_config(max_concurrent);
    let lifecycle = LifecycleService::new(
        store.clone(),
        event_bus.clone(),
        config.clone(),
        Arc::new(FakeDriver::default()),
        Arc::new(FakeTracker),
    );
    let state = AppState {
        store: store.clone(),
        lifecycle,
        event_bus,
        config: Arc::new(config),
    };
    (router(state), store)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn happy_path_reaches_completed_after_approval() {
    let (app, store) = build_app(5);
    let worktree = make_worktree();

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-1", "worktree_path": worktree, "profile_id": "P"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    // Allow the background runner to reach the approval gate.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app.clone().oneshot(get(&format!("/workflows/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await;
    assert_eq!(detail["status"], "blocked");

    let response = app
        .clone()
        .oneshot(post(&format!("/workflows/{id}/approve"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app.clone().oneshot(get(&format!("/workflows/{id}"))).await.unwrap();
    let detail = body_json(response).await;
    assert_eq!(detail["status"], "completed");

    let workflow_id: Uuid = id.parse().unwrap();
    let events = store.list_events(workflow_id, None).await.unwrap();
    let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<i64> = (1..=sequences.len() as i64).collect();
    assert_eq!(sequences, expected, "event sequence must be contiguous");
    assert!(events.iter().any(|e| e.event_type == EventType::ApprovalRequired));
    assert!(events.iter().any(|e| e.event_type == EventType::ApprovalGranted));
    assert!(events.iter().any(|e| e.event_type == EventType::WorkflowCompleted));
}

#[tokio::test]
async fn conflicting_worktree_is_rejected() {
    let (app, _store) = build_app(5);
    let worktree = make_worktree();

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-1", "worktree_path": worktree, "profile_id": "P"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-2", "worktree_path": worktree, "profile_id": "P"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Conflict");
}

#[tokio::test]
async fn capacity_cap_rejects_the_next_admission() {
    let (app, _store) = build_app(1);

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-1", "worktree_path": make_worktree(), "profile_id": "P"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-2", "worktree_path": make_worktree(), "profile_id": "P"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Capacity");
}

#[tokio::test]
async fn rejection_at_the_approval_gate_completes_without_executing() {
    let (app, store) = build_app(5);
    let worktree = make_worktree();

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-1", "worktree_path": worktree, "profile_id": "P"}),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .clone()
        .oneshot(post(&format!("/workflows/{id}/reject"), json!({"reason": "scope-creep"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app.clone().oneshot(get(&format!("/workflows/{id}"))).await.unwrap();
    let detail = body_json(response).await;
    assert_eq!(detail["status"], "completed");

    let workflow_id: Uuid = id.parse().unwrap();
    let events = store.list_events(workflow_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ApprovalRejected));
    assert!(!events.iter().any(|e| e.event_type == EventType::StageStarted
        && e.data.as_ref().and_then(|d| d.get("node")).and_then(|n| n.as_str()) == Some("execute")));
}

#[tokio::test]
async fn approving_a_workflow_twice_is_rejected_the_second_time() {
    let (app, _store) = build_app(5);
    let worktree = make_worktree();

    let response = app
        .clone()
        .oneshot(post(
            "/workflows",
            json!({"issue_id": "I-1", "worktree_path": worktree, "profile_id": "P"}),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let first = app
        .clone()
        .oneshot(post(&format!("/workflows/{id}/approve"), json!({})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(post(&format!("/workflows/{id}/approve"), json!({})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_workflow_returns_not_found() {
    let (app, _store) = build_app(5);
    let response = app.oneshot(get(&format!("/workflows/{}", Uuid::new_v4()))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_checks_report_ready() {
    let (app, _store) = build_app(5);
    let response = app.clone().oneshot(get("/health/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
