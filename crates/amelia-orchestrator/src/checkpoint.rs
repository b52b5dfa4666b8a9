//! Checkpointer (component C4, spec.md §4.6).
//!
//! Serializes `StateSnapshot` to the opaque JSON blob stored on
//! `workflows.state_snapshot`. The runtime commits a checkpoint in the
//! same `Store::commit_step` call as the event(s) the producing node
//! emitted (see `crate::runtime::StateMachineRuntime::commit_step`), so a
//! crash can only ever be observed between two node executions, never
//! inside one. [`Checkpointer::commit`] below persists a checkpoint on
//! its own and is used only for the cooperative-cancellation path, which
//! produces no events to commit alongside it.

use amelia_contracts::OrchestratorError;
use amelia_storage::Store;
use uuid::Uuid;

use crate::snapshot::{StateSnapshot, SNAPSHOT_SCHEMA_VERSION};

pub struct Checkpointer;

impl Checkpointer {
    /// Encodes `snapshot` to the opaque JSON value the Store persists.
    pub fn encode(snapshot: &StateSnapshot) -> Result<serde_json::Value, OrchestratorError> {
        serde_json::to_value(snapshot)
            .map_err(|e| OrchestratorError::Internal(format!("checkpoint encode failed: {e}")))
    }

    /// Persists `snapshot` on `workflow_id`'s row on its own, with no
    /// accompanying events. Only the cancellation path (which emits no
    /// events for the step it's checkpointing) calls this directly; every
    /// other node outcome goes through `Store::commit_step` instead.
    pub async fn commit(
        store: &dyn Store,
        workflow_id: Uuid,
        snapshot: &StateSnapshot,
    ) -> Result<(), OrchestratorError> {
        let value = Self::encode(snapshot)?;
        store.save_checkpoint(workflow_id, value).await
    }

    /// Deserializes and schema-checks a persisted snapshot. Corruption or
    /// schema drift is reported as `Terminal`, per spec.md §4.6: the
    /// caller is expected to fail the workflow with
    /// `failure_reason="checkpoint-corrupt"` rather than guess at repair.
    pub fn restore(raw: serde_json::Value) -> Result<StateSnapshot, OrchestratorError> {
        let snapshot: StateSnapshot = serde_json::from_value(raw).map_err(|e| {
            OrchestratorError::Terminal(format!("checkpoint-corrupt: decode failed: {e}"))
        })?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(OrchestratorError::Terminal(format!(
                "checkpoint-corrupt: schema version {} != {}",
                snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION
            )));
        }
        Ok(snapshot)
    }
}
