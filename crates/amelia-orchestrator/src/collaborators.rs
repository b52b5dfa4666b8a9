//! External collaborator contracts (spec.md §6.4).
//!
//! These traits describe what the core *consumes*; no concrete HTTP or
//! subprocess transport lives in this crate. Production callers supply
//! their own driver/tracker implementations. [`FakeDriver`] and
//! [`FakeTracker`] below are deterministic stand-ins used by the
//! orchestrator's own tests and by `amelia-api`'s integration tests.

use async_trait::async_trait;
use serde_json::Value;

use amelia_contracts::{event::Agent, OrchestratorError};

/// One step of an `execute` node's agentic stream (spec.md §4.3, §6.4).
#[derive(Debug, Clone)]
pub enum AgenticStreamItem {
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, output: Value, is_error: bool },
    Thinking { text: String },
    Result { final_response: String },
}

/// Per-call token accounting the driver must report (spec.md §3, §6.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost: Option<f64>,
}

/// LLM transport. Failures should be `Transient` (retried by the
/// Lifecycle Service) unless they're unambiguously non-recoverable, in
/// which case return `Terminal`.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn generate(
        &self,
        messages: &[String],
        schema: Option<&Value>,
    ) -> Result<(Value, DriverUsage), OrchestratorError>;

    /// Streams an agentic run; the runtime forwards each item to the
    /// Event Bus and folds it into the snapshot via a reducer. A stream
    /// that ends without a `Result` item is an `AgenticExecutionError`
    /// (spec.md §4.3), surfaced here as `Terminal`.
    async fn stream_agentic(
        &self,
        goal: &str,
        cwd: &str,
        session_id: Option<&str>,
    ) -> Result<Vec<AgenticStreamItem>, OrchestratorError>;
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String,
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn get_issue(&self, id: &str) -> Result<Issue, OrchestratorError>;
}

/// Which driver-facing role produced a given call, for token accounting.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub agent: Agent,
    pub model: String,
}

/// Deterministic in-memory `Driver` for tests: always succeeds, returns
/// canned output, never touches the network.
pub struct FakeDriver {
    pub response: Value,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            response: serde_json::json!({"ok": true}),
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn generate(
        &self,
        _messages: &[String],
        _schema: Option<&Value>,
    ) -> Result<(Value, DriverUsage), OrchestratorError> {
        Ok((
            self.response.clone(),
            DriverUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_read_tokens: 0,
                cache_creation_tokens: 0,
                cost: Some(0.01),
            },
        ))
    }

    async fn stream_agentic(
        &self,
        _goal: &str,
        _cwd: &str,
        _session_id: Option<&str>,
    ) -> Result<Vec<AgenticStreamItem>, OrchestratorError> {
        Ok(vec![
            AgenticStreamItem::ToolCall {
                name: "read_file".into(),
                arguments: serde_json::json!({"path": "src/lib.rs"}),
            },
            AgenticStreamItem::ToolResult {
                name: "read_file".into(),
                output: serde_json::json!({"contents": "..."}),
                is_error: false,
            },
            AgenticStreamItem::Result {
                final_response: "applied the change".into(),
            },
        ])
    }
}

pub struct FakeTracker;

#[async_trait]
impl Tracker for FakeTracker {
    async fn get_issue(&self, id: &str) -> Result<Issue, OrchestratorError> {
        Ok(Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            description: "synthetic issue for testing".into(),
            status: "open".into(),
        })
    }
}
