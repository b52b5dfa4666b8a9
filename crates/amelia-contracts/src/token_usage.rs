//! Token-usage record DTO (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::event::Agent;

/// Cost-accounting record for a single driver call. Append-only; not on the
/// hot path.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub agent: Agent,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Subset of `input_tokens` served from cache.
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTokenUsage {
    pub workflow_id: Uuid,
    pub agent: Agent,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost: Option<f64>,
}
