//! Maps `OrchestratorError` onto the HTTP error body of spec.md §6.1/§7:
//! `{error: <kind>, message, details?}`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use amelia_contracts::OrchestratorError;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub struct ApiErrorResponse(pub OrchestratorError);

impl From<OrchestratorError> for ApiErrorResponse {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> axum::response::Response {
        let err = self.0;
        let status = match &err {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Conflict { .. } => StatusCode::CONFLICT,
            OrchestratorError::Capacity => StatusCode::TOO_MANY_REQUESTS,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Terminal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        let body = ApiError {
            error: err.kind(),
            message: err.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}
