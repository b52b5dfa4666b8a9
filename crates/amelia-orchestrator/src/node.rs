//! The fixed node graph (component C5, spec.md §4.3).
//!
//! Nodes are async steps: they consume the current snapshot and return
//! either the next node to run, a suspend marker (interrupt), or a
//! terminal outcome. Edges are plain `match` arms inside
//! [`crate::runtime::StateMachineRuntime`], not a separate data
//! structure — the graph is small and fixed, so a table of function
//! pointers would only obscure it.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use amelia_contracts::{
    event::{Agent, EventType, NewEvent},
    OrchestratorError,
};

use crate::collaborators::{AgenticStreamItem, Driver, Tracker};
use crate::snapshot::{
    ApprovalDecision, ReviewResult, ReviewVerdict, StateSnapshot, StreamedDelta, ToolCall,
    ToolResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Plan,
    AwaitApproval,
    ResumeApproval,
    Execute,
    Review,
}

/// Why a workflow reached a terminal state, for the final
/// `WORKFLOW_COMPLETED` / `WORKFLOW_FAILED` event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Completed,
    /// Plan was rejected at the approval gate (spec.md §9 open question:
    /// resolved here as a `completed` outcome carrying a rejection
    /// marker, not a failure or cancellation — see DESIGN.md).
    Rejected,
    MaxIterations,
}

pub enum NodeOutcome {
    Advance {
        snapshot: StateSnapshot,
        next: NodeId,
        events: Vec<NewEvent>,
    },
    Suspend {
        snapshot: StateSnapshot,
        reason: String,
        correlation_id: Uuid,
        events: Vec<NewEvent>,
    },
    Terminate {
        snapshot: StateSnapshot,
        outcome: TerminalOutcome,
        events: Vec<NewEvent>,
    },
}

/// Collaborators and bounds available to every node invocation.
pub struct NodeContext {
    pub workflow_id: Uuid,
    pub driver: Arc<dyn Driver>,
    pub tracker: Arc<dyn Tracker>,
    pub max_review_iterations: u32,
    pub max_task_review_iterations: u32,
}

#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;
    async fn run(
        &self,
        ctx: &NodeContext,
        snapshot: StateSnapshot,
    ) -> Result<NodeOutcome, OrchestratorError>;
}

fn stage_started(workflow_id: Uuid, node: &str) -> NewEvent {
    NewEvent::new(
        workflow_id,
        Agent::System,
        EventType::StageStarted,
        format!("stage started: {node}"),
    )
    .with_data(serde_json::json!({"node": node}))
}

fn stage_completed(workflow_id: Uuid, node: &str) -> NewEvent {
    NewEvent::new(
        workflow_id,
        Agent::System,
        EventType::StageCompleted,
        format!("stage completed: {node}"),
    )
    .with_data(serde_json::json!({"node": node}))
}

/// Maps a tool result onto the artifacts category of the event-type set
/// (`FILE_CREATED`/`FILE_MODIFIED`/`FILE_DELETED`) when the tool name
/// indicates a file mutation. Read-only tools and tool calls that don't
/// touch the worktree produce no event here; they're still folded into
/// the snapshot's `tool_results` for replay. Errored tool calls don't
/// count as a mutation.
fn file_mutation_event(
    workflow_id: Uuid,
    tool_name: &str,
    output: &serde_json::Value,
    is_error: bool,
) -> Option<NewEvent> {
    if is_error {
        return None;
    }
    let event_type = match tool_name {
        "write_file" | "create_file" => EventType::FileCreated,
        "edit_file" | "update_file" | "apply_patch" => EventType::FileModified,
        "delete_file" | "remove_file" => EventType::FileDeleted,
        _ => return None,
    };
    let path = output
        .get("path")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    Some(
        NewEvent::new(workflow_id, Agent::Developer, event_type, format!("{tool_name}: {path}"))
            .with_data(serde_json::json!({"tool": tool_name, "path": path})),
    )
}

/// `plan`: asks the tracker for the issue, asks the driver for a plan,
/// extracts a goal and key files. Always advances to `await_approval`.
pub struct PlanNode;

#[async_trait]
impl Node for PlanNode {
    fn id(&self) -> NodeId {
        NodeId::Plan
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        mut snapshot: StateSnapshot,
    ) -> Result<NodeOutcome, OrchestratorError> {
        let mut events = vec![stage_started(ctx.workflow_id, "plan")];

        let issue = ctx.tracker.get_issue(&snapshot.issue_id).await?;
        let (plan, _usage) = ctx
            .driver
            .generate(
                &[format!("Plan work for issue: {}\n{}", issue.title, issue.description)],
                None,
            )
            .await?;

        let plan_text = plan
            .get("plan_text")
            .and_then(|v| v.as_str())
            .unwrap_or("no plan text returned")
            .to_string();
        let goal = plan
            .get("goal")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let key_files = plan
            .get("key_files")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        snapshot.plan_text = Some(plan_text);
        snapshot.goal = goal;
        snapshot.key_files = key_files;
        snapshot.agent_history.push("plan: produced plan".into());

        events.push(stage_completed(ctx.workflow_id, "plan"));

        Ok(NodeOutcome::Advance {
            snapshot,
            next: NodeId::AwaitApproval,
            events,
        })
    }
}

/// `await_approval`: always interrupts. Persists the correlation id the
/// eventual `approve`/`reject` call must answer.
pub struct AwaitApprovalNode;

#[async_trait]
impl Node for AwaitApprovalNode {
    fn id(&self) -> NodeId {
        NodeId::AwaitApproval
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        mut snapshot: StateSnapshot,
    ) -> Result<NodeOutcome, OrchestratorError> {
        let correlation_id = amelia_contracts::ids::new_id();
        snapshot.pending_approval_correlation_id = Some(correlation_id);
        snapshot.agentic_status = crate::snapshot::AgenticStatus::AwaitingApproval;

        let event = NewEvent::new(
            ctx.workflow_id,
            Agent::System,
            EventType::ApprovalRequired,
            "awaiting human approval of plan",
        )
        .with_data(serde_json::json!({"plan_text": snapshot.plan_text}))
        .with_correlation(correlation_id);

        Ok(NodeOutcome::Suspend {
            snapshot,
            reason: "awaiting plan approval".into(),
            correlation_id,
            events: vec![event],
        })
    }
}

/// `resume_approval`: consumes the decision injected by the Lifecycle
/// Service and routes to `execute` or terminates with `Rejected`.
pub struct ResumeApprovalNode;

#[async_trait]
impl Node for ResumeApprovalNode {
    fn id(&self) -> NodeId {
        NodeId::ResumeApproval
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        mut snapshot: StateSnapshot,
    ) -> Result<NodeOutcome, OrchestratorError> {
        let decision = snapshot.approval_decision.ok_or_else(|| {
            OrchestratorError::Internal("resume_approval entered without a decision".into())
        })?;
        snapshot.pending_approval_correlation_id = None;

        match decision {
            ApprovalDecision::Approved => {
                snapshot.agentic_status = crate::snapshot::AgenticStatus::Running;
                Ok(NodeOutcome::Advance {
                    snapshot,
                    next: NodeId::Execute,
                    events: vec![],
                })
            }
            ApprovalDecision::Rejected => {
                snapshot.agentic_status = crate::snapshot::AgenticStatus::Completed;
                let _ = ctx;
                Ok(NodeOutcome::Terminate {
                    snapshot,
                    outcome: TerminalOutcome::Rejected,
                    events: vec![],
                })
            }
        }
    }
}

/// `execute`: streams an agentic run against the goal, folding each item
/// into the snapshot via the append-only reducer.
pub struct ExecuteNode;

#[async_trait]
impl Node for ExecuteNode {
    fn id(&self) -> NodeId {
        NodeId::Execute
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        mut snapshot: StateSnapshot,
    ) -> Result<NodeOutcome, OrchestratorError> {
        let mut events = vec![stage_started(ctx.workflow_id, "execute")];

        let goal = snapshot
            .goal
            .clone()
            .unwrap_or_else(|| "implement the plan".into());
        let stream = ctx
            .driver
            .stream_agentic(&goal, &snapshot.issue_id, snapshot.driver_session_id.as_deref())
            .await?;

        let mut delta = StreamedDelta::default();
        let mut saw_result = false;
        for item in stream {
            match item {
                AgenticStreamItem::ToolCall { name, arguments } => {
                    delta.agent_history.push(format!("tool_call: {name}"));
                    delta.tool_calls.push(ToolCall {
                        name,
                        arguments,
                    });
                }
                AgenticStreamItem::ToolResult {
                    name,
                    output,
                    is_error,
                } => {
                    delta.agent_history.push(format!("tool_result: {name}"));
                    if let Some(event) = file_mutation_event(ctx.workflow_id, &name, &output, is_error) {
                        events.push(event);
                    }
                    delta.tool_results.push(ToolResult {
                        name,
                        output,
                        is_error,
                    });
                }
                AgenticStreamItem::Thinking { text } => {
                    delta.agent_history.push(format!("thinking: {text}"));
                }
                AgenticStreamItem::Result { final_response } => {
                    delta.final_response = Some(final_response);
                    saw_result = true;
                }
            }
        }

        if !saw_result {
            return Err(OrchestratorError::Transient(
                "agentic stream ended without a result (AgenticExecutionError)".into(),
            ));
        }

        snapshot.merge_streamed(delta);
        events.push(stage_completed(ctx.workflow_id, "execute"));

        Ok(NodeOutcome::Advance {
            snapshot,
            next: NodeId::Review,
            events,
        })
    }
}

/// `review`: asks the driver to review the diff/response. Loops back to
/// `execute` on changes-requested, bounded by `max_review_iterations` and
/// `max_task_review_iterations`.
pub struct ReviewNode;

#[async_trait]
impl Node for ReviewNode {
    fn id(&self) -> NodeId {
        NodeId::Review
    }

    async fn run(
        &self,
        ctx: &NodeContext,
        mut snapshot: StateSnapshot,
    ) -> Result<NodeOutcome, OrchestratorError> {
        let mut events = vec![NewEvent::new(
            ctx.workflow_id,
            Agent::Reviewer,
            EventType::ReviewRequested,
            "requesting review of execute output",
        )];

        let (verdict, _usage) = ctx
            .driver
            .generate(
                &[format!(
                    "Review this output for goal {:?}:\n{:?}",
                    snapshot.goal, snapshot.final_response
                )],
                None,
            )
            .await?;

        let approved = verdict
            .get("approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let feedback = verdict
            .get("feedback")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let review = ReviewResult {
            verdict: if approved {
                ReviewVerdict::Approved
            } else {
                ReviewVerdict::ChangesRequested
            },
            feedback,
        };
        snapshot.last_review = Some(review.clone());

        events.push(
            NewEvent::new(
                ctx.workflow_id,
                Agent::Reviewer,
                EventType::ReviewCompleted,
                "review completed",
            )
            .with_data(serde_json::json!({"approved": approved})),
        );

        if approved {
            snapshot.agentic_status = crate::snapshot::AgenticStatus::Completed;
            return Ok(NodeOutcome::Terminate {
                snapshot,
                outcome: TerminalOutcome::Completed,
                events,
            });
        }

        snapshot.review_iteration += 1;
        snapshot.task_review_iteration += 1;

        if snapshot.review_iteration >= ctx.max_review_iterations
            || snapshot.task_review_iteration >= ctx.max_task_review_iterations
        {
            snapshot.agentic_status = crate::snapshot::AgenticStatus::Failed;
            return Ok(NodeOutcome::Terminate {
                snapshot,
                outcome: TerminalOutcome::MaxIterations,
                events,
            });
        }

        events.push(NewEvent::new(
            ctx.workflow_id,
            Agent::System,
            EventType::RevisionRequested,
            "changes requested, re-entering execute",
        ));

        Ok(NodeOutcome::Advance {
            snapshot,
            next: NodeId::Execute,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FakeDriver, FakeTracker};

    fn ctx() -> NodeContext {
        NodeContext {
            workflow_id: amelia_contracts::ids::new_id(),
            driver: Arc::new(FakeDriver::default()),
            tracker: Arc::new(FakeTracker),
            max_review_iterations: 3,
            max_task_review_iterations: 5,
        }
    }

    #[tokio::test]
    async fn plan_node_advances_to_await_approval() {
        let ctx = ctx();
        let snapshot = StateSnapshot::new("I-1", "P");
        let outcome = PlanNode.run(&ctx, snapshot).await.unwrap();
        match outcome {
            NodeOutcome::Advance { next, .. } => assert_eq!(next, NodeId::AwaitApproval),
            _ => panic!("expected Advance"),
        }
    }

    #[tokio::test]
    async fn await_approval_always_suspends() {
        let ctx = ctx();
        let snapshot = StateSnapshot::new("I-1", "P");
        let outcome = AwaitApprovalNode.run(&ctx, snapshot).await.unwrap();
        assert!(matches!(outcome, NodeOutcome::Suspend { .. }));
    }

    #[tokio::test]
    async fn resume_approval_rejected_terminates() {
        let ctx = ctx();
        let mut snapshot = StateSnapshot::new("I-1", "P");
        snapshot.approval_decision = Some(ApprovalDecision::Rejected);
        let outcome = ResumeApprovalNode.run(&ctx, snapshot).await.unwrap();
        match outcome {
            NodeOutcome::Terminate { outcome, .. } => {
                assert_eq!(outcome, TerminalOutcome::Rejected)
            }
            _ => panic!("expected Terminate"),
        }
    }

    #[tokio::test]
    async fn resume_approval_approved_advances_to_execute() {
        let ctx = ctx();
        let mut snapshot = StateSnapshot::new("I-1", "P");
        snapshot.approval_decision = Some(ApprovalDecision::Approved);
        let outcome = ResumeApprovalNode.run(&ctx, snapshot).await.unwrap();
        match outcome {
            NodeOutcome::Advance { next, .. } => assert_eq!(next, NodeId::Execute),
            _ => panic!("expected Advance"),
        }
    }

    #[tokio::test]
    async fn execute_node_advances_to_review_on_well_formed_stream() {
        let ctx = ctx();
        let snapshot = StateSnapshot::new("I-1", "P");
        let outcome = ExecuteNode.run(&ctx, snapshot).await.unwrap();
        match outcome {
            NodeOutcome::Advance { next, snapshot, .. } => {
                assert_eq!(next, NodeId::Review);
                assert!(snapshot.final_response.is_some());
            }
            _ => panic!("expected Advance"),
        }
    }

    #[tokio::test]
    async fn review_node_terminates_at_max_iterations() {
        let ctx = ctx();
        let mut snapshot = StateSnapshot::new("I-1", "P");
        snapshot.final_response = Some("diff".into());
        let driver = Arc::new(FakeDriver {
            response: serde_json::json!({"approved": false, "feedback": "nope"}),
        });
        let ctx = NodeContext {
            driver,
            ..ctx
        };
        snapshot.review_iteration = ctx.max_review_iterations - 1;
        let outcome = ReviewNode.run(&ctx, snapshot).await.unwrap();
        match outcome {
            NodeOutcome::Terminate { outcome, .. } => {
                assert_eq!(outcome, TerminalOutcome::MaxIterations)
            }
            _ => panic!("expected Terminate"),
        }
    }
}
