//! In-process pub/sub event fan-out (component C3, spec.md §4.4).
//!
//! One `broadcast` channel per workflow plus one `subscribe_all` channel.
//! Channels are created lazily on first subscribe or publish and never
//! removed automatically; the Lifecycle Service drops its handle once a
//! workflow reaches a terminal state, and the channel is freed once the
//! last receiver is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use amelia_contracts::event::{Agent, Event, EventType, NewEvent};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Bounded per-subscriber buffer (spec.md §4.4). A subscriber that falls
/// this far behind starts losing events and must backfill via `since`.
pub const CHANNEL_CAPACITY: usize = 256;

struct Channels {
    per_workflow: HashMap<Uuid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

/// Process-local publish/subscribe hub for workflow events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<Channels>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (all_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Channels {
                per_workflow: HashMap::new(),
                all: all_tx,
            })),
        }
    }

    /// Publish an already-persisted event to all interested subscribers.
    /// Never fails: a channel with no subscribers simply drops the send.
    pub fn publish(&self, event: Event) {
        let sender = {
            let mut channels = self.inner.write();
            channels
                .per_workflow
                .entry(event.workflow_id)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        let _ = sender.send(event.clone());
        let _ = self.inner.read().all.send(event);
    }

    /// Emits a `SYSTEM_WARNING` noting that a subscriber fell behind and
    /// lost events (spec.md §4.4). Not routed through the Store: this is a
    /// best-effort live notice, not part of the durable log.
    pub fn publish_lag_warning(&self, workflow_id: Uuid, skipped: u64) {
        let warning = Event {
            id: amelia_contracts::ids::new_id(),
            workflow_id,
            sequence: -1,
            timestamp: chrono::Utc::now(),
            agent: Agent::System,
            event_type: EventType::SystemWarning,
            message: format!("subscriber lagged, skipped {skipped} events"),
            data: Some(serde_json::json!({"subscriber_lag": skipped})),
            correlation_id: None,
        };
        self.publish(warning);
    }

    pub fn subscribe(&self, workflow_id: Uuid) -> broadcast::Receiver<Event> {
        let mut channels = self.inner.write();
        channels
            .per_workflow
            .entry(workflow_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.inner.read().all.subscribe()
    }

    pub fn forget(&self, workflow_id: Uuid) {
        self.inner.write().per_workflow.remove(&workflow_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper used by node implementations to build an event destined for both
/// the Store (for durable sequencing) and, once persisted, the bus.
pub fn system_event(workflow_id: Uuid, event_type: EventType, message: impl Into<String>) -> NewEvent {
    NewEvent::new(workflow_id, Agent::System, event_type, message)
}
