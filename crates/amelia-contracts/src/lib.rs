//! Shared DTOs and error taxonomy for the Amelia orchestration core.
//!
//! This crate has no async runtime or storage dependency: it defines the
//! wire/API shape that `amelia-storage`, `amelia-orchestrator` and
//! `amelia-api` all agree on, so none of them need to depend on each other
//! for basic type definitions.

pub mod error;
pub mod event;
pub mod ids;
pub mod token_usage;
pub mod workflow;

pub use error::OrchestratorError;
pub use event::{Agent, Event, EventType};
pub use ids::new_id;
pub use token_usage::TokenUsage;
pub use workflow::{Workflow, WorkflowStatus};
