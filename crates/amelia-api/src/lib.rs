pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use state::AppState;

/// Builds the full router (REST + WebSocket + health + Swagger UI) over a
/// given [`AppState`]. Split out from `main` so integration tests can drive
/// requests in-process with `tower::ServiceExt::oneshot` against an
/// in-memory `Store`, without binding a socket.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::workflows::routes())
        .merge(routes::ws::routes())
        .merge(routes::health::routes())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", openapi::ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
