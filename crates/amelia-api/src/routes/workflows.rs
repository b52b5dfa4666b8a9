//! REST workflow management surface (spec.md §6.1).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use amelia_contracts::{
    event::Event,
    workflow::{Workflow, WorkflowStatus},
};
use amelia_orchestrator::ApprovalDecision;
use amelia_storage::WorkflowFilter;

use crate::error::ApiErrorResponse;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/approve", post(approve))
        .route("/workflows/:id/reject", post(reject))
        .route("/workflows/:id/cancel", post(cancel))
        .route("/workflows/:id/events", get(list_events))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateWorkflowRequest {
    pub issue_id: String,
    pub worktree_path: String,
    pub profile_id: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateWorkflowResponse {
    pub id: Uuid,
    pub status: WorkflowStatus,
}

#[utoipa::path(
    post,
    path = "/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "workflow admitted", body = CreateWorkflowResponse),
        (status = 400, description = "bad worktree"),
        (status = 409, description = "worktree already active"),
        (status = 429, description = "global capacity reached")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<CreateWorkflowResponse>), ApiErrorResponse> {
    let workflow = state
        .lifecycle
        .start(req.issue_id, req.worktree_path, req.profile_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateWorkflowResponse {
            id: workflow.id,
            status: workflow.status,
        }),
    ))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListWorkflowsParams {
    pub status: Option<WorkflowStatus>,
    pub worktree: Option<String>,
}

#[utoipa::path(
    get,
    path = "/workflows",
    params(ListWorkflowsParams),
    responses((status = 200, description = "matching workflows", body = Vec<Workflow>)),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<Vec<Workflow>>, ApiErrorResponse> {
    let filter = WorkflowFilter {
        status: params.status,
        worktree_path: params.worktree,
    };
    let workflows = state.store.list_workflows(filter).await?;
    Ok(Json(workflows))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}",
    params(("id" = Uuid, Path, description = "workflow id")),
    responses(
        (status = 200, description = "workflow detail", body = Workflow),
        (status = 404, description = "no such workflow")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Workflow>, ApiErrorResponse> {
    let workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or(amelia_contracts::OrchestratorError::NotFound(id))?;
    Ok(Json(workflow))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ApproveRequest {
    pub feedback: Option<String>,
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/approve",
    params(("id" = Uuid, Path, description = "workflow id")),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "decision recorded"),
        (status = 404, description = "no such workflow"),
        (status = 422, description = "workflow not blocked")
    ),
    tag = "workflows"
)]
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> Result<StatusCode, ApiErrorResponse> {
    state
        .lifecycle
        .decide(id, ApprovalDecision::Approved, req.feedback)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RejectRequest {
    pub reason: String,
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/reject",
    params(("id" = Uuid, Path, description = "workflow id")),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "decision recorded"),
        (status = 404, description = "no such workflow"),
        (status = 422, description = "workflow not blocked")
    ),
    tag = "workflows"
)]
pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> Result<StatusCode, ApiErrorResponse> {
    state
        .lifecycle
        .decide(id, ApprovalDecision::Rejected, Some(req.reason))
        .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/cancel",
    params(("id" = Uuid, Path, description = "workflow id")),
    responses(
        (status = 200, description = "workflow cancelled"),
        (status = 404, description = "no such workflow"),
        (status = 422, description = "workflow already terminal")
    ),
    tag = "workflows"
)]
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiErrorResponse> {
    state.lifecycle.cancel(id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListEventsParams {
    pub since: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/workflows/{id}/events",
    params(("id" = Uuid, Path, description = "workflow id"), ListEventsParams),
    responses(
        (status = 200, description = "events since the given sequence", body = Vec<Event>),
        (status = 404, description = "no such workflow")
    ),
    tag = "workflows"
)]
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListEventsParams>,
) -> Result<Json<Vec<Event>>, ApiErrorResponse> {
    state
        .store
        .get_workflow(id)
        .await?
        .ok_or(amelia_contracts::OrchestratorError::NotFound(id))?;
    let events = state.store.list_events(id, params.since).await?;
    Ok(Json(events))
}
