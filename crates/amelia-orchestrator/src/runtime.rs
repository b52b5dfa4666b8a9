//! State Machine Runtime (component C5, spec.md §4.3, §5).
//!
//! Drives the fixed node graph for one workflow: runs a node, persists
//! its events and checkpoint in one atomic `Store::commit_step` call so
//! readers never observe one without the other, then either advances,
//! suspends on an interrupt, or terminates. Checks for cancellation at
//! every node boundary, never mid-node (spec.md §5).

use std::sync::Arc;

use amelia_contracts::{event::EventType, OrchestratorError};
use amelia_storage::Store;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::Checkpointer;
use crate::event_bus::EventBus;
use crate::node::{
    AwaitApprovalNode, ExecuteNode, Node, NodeContext, NodeId, NodeOutcome, PlanNode,
    ResumeApprovalNode, ReviewNode, TerminalOutcome,
};
use crate::snapshot::StateSnapshot;

/// A single runtime step, returned to the Lifecycle Service so it can
/// drive the workflow's status DFA and decide whether to keep looping.
pub enum StepOutcome {
    Advanced { snapshot: StateSnapshot, next: NodeId },
    Suspended { snapshot: StateSnapshot },
    Terminated { snapshot: StateSnapshot, outcome: TerminalOutcome },
    Cancelled { snapshot: StateSnapshot },
}

pub struct StateMachineRuntime {
    store: Arc<dyn Store>,
    event_bus: EventBus,
}

impl StateMachineRuntime {
    pub fn new(store: Arc<dyn Store>, event_bus: EventBus) -> Self {
        Self { store, event_bus }
    }

    fn node_for(id: NodeId) -> Box<dyn Node> {
        match id {
            NodeId::Plan => Box::new(PlanNode),
            NodeId::AwaitApproval => Box::new(AwaitApprovalNode),
            NodeId::ResumeApproval => Box::new(ResumeApprovalNode),
            NodeId::Execute => Box::new(ExecuteNode),
            NodeId::Review => Box::new(ReviewNode),
        }
    }

    /// Runs exactly one node and persists its effects. This is the unit
    /// of retry: the Lifecycle Service calls this in a loop so a
    /// transient failure retries only the node that failed, resuming
    /// from the snapshot as of its last successful checkpoint.
    pub async fn step_once(
        &self,
        workflow_id: Uuid,
        ctx: &NodeContext,
        snapshot: StateSnapshot,
        current: NodeId,
        cancellation: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        if cancellation.is_cancelled() {
            Checkpointer::commit(self.store.as_ref(), workflow_id, &snapshot).await?;
            return Ok(StepOutcome::Cancelled { snapshot });
        }

        let node = Self::node_for(current);
        let outcome = node.run(ctx, snapshot).await?;

        match outcome {
            NodeOutcome::Advance {
                snapshot: next_snapshot,
                next,
                events,
            } => {
                self.commit_step(workflow_id, events, &next_snapshot).await?;
                Ok(StepOutcome::Advanced {
                    snapshot: next_snapshot,
                    next,
                })
            }
            NodeOutcome::Suspend {
                snapshot: next_snapshot,
                events,
                ..
            } => {
                self.commit_step(workflow_id, events, &next_snapshot).await?;
                Ok(StepOutcome::Suspended {
                    snapshot: next_snapshot,
                })
            }
            NodeOutcome::Terminate {
                snapshot: next_snapshot,
                outcome,
                events,
            } => {
                self.commit_step(workflow_id, events, &next_snapshot).await?;
                Ok(StepOutcome::Terminated {
                    snapshot: next_snapshot,
                    outcome,
                })
            }
        }
    }

    /// Runs nodes starting at `start` until the graph suspends,
    /// terminates, or cooperative cancellation is observed at a node
    /// boundary. Convenience wrapper over [`Self::step_once`] for
    /// callers (tests, simple embeddings) that don't need per-node
    /// retry; the Lifecycle Service drives `step_once` directly instead.
    pub async fn drive(
        &self,
        workflow_id: Uuid,
        ctx: &NodeContext,
        mut snapshot: StateSnapshot,
        start: NodeId,
        cancellation: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let mut current = start;
        loop {
            match self
                .step_once(workflow_id, ctx, snapshot, current, cancellation)
                .await?
            {
                StepOutcome::Advanced { snapshot: next, next: node } => {
                    snapshot = next;
                    current = node;
                }
                terminal => return Ok(terminal),
            }
        }
    }

    /// After an `approve`/`reject` decision has been injected into the
    /// snapshot by the Lifecycle Service, runs `resume_approval` and
    /// whatever follows.
    pub async fn resume(
        &self,
        workflow_id: Uuid,
        ctx: &NodeContext,
        snapshot: StateSnapshot,
        cancellation: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        self.drive(workflow_id, ctx, snapshot, NodeId::ResumeApproval, cancellation)
            .await
    }

    /// Persists a node step's events and resulting checkpoint together
    /// through [`amelia_storage::Store::commit_step`], then publishes each
    /// persisted event to the bus in sequence order.
    async fn commit_step(
        &self,
        workflow_id: Uuid,
        events: Vec<amelia_contracts::event::NewEvent>,
        snapshot: &StateSnapshot,
    ) -> Result<(), OrchestratorError> {
        for event in &events {
            debug_assert_eq!(event.workflow_id, workflow_id);
        }
        let checkpoint = Checkpointer::encode(snapshot)?;
        let persisted = self.store.commit_step(workflow_id, events, checkpoint).await?;
        for event in persisted {
            self.event_bus.publish(event);
        }
        Ok(())
    }

    /// Emits a lifecycle-boundary event not tied to a specific node (e.g.
    /// `WORKFLOW_STARTED`) and publishes it to the bus.
    pub async fn emit(
        &self,
        workflow_id: Uuid,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let event = amelia_contracts::event::NewEvent::new(
            workflow_id,
            amelia_contracts::event::Agent::System,
            event_type,
            message,
        );
        let persisted = self.store.append_event(event).await?;
        self.event_bus.publish(persisted);
        Ok(())
    }
}
