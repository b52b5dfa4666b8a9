//! `GET /health/live`, `GET /health/ready` (spec.md §6.1).

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct LiveResponse {
    status: &'static str,
}

#[utoipa::path(get, path = "/health/live", responses((status = 200, description = "process is alive")), tag = "health")]
pub async fn live() -> Json<LiveResponse> {
    Json(LiveResponse { status: "ok" })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
}

/// Ready iff the Store can answer a trivial query.
#[utoipa::path(
    get,
    path = "/health/ready",
    responses(
        (status = 200, description = "ready to accept workflows"),
        (status = 503, description = "dependency unavailable")
    ),
    tag = "health"
)]
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.store.active_count().await {
        Ok(_) => (StatusCode::OK, Json(ReadyResponse { status: "ok" })),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse { status: "unavailable" }),
        ),
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
}
