//! Retention Worker (component C7, spec.md §4.5).
//!
//! Runs on its own ticking task so pruning never blocks request-handling
//! or node execution. Ticks hourly and once more on shutdown so a short
//! process lifetime still gets a final sweep.

use std::sync::Arc;
use std::time::Duration;

use amelia_storage::Store;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(3600);

pub struct RetentionWorker {
    store: Arc<dyn Store>,
    retention_age: Duration,
    max_per_workflow: usize,
}

impl RetentionWorker {
    pub fn new(store: Arc<dyn Store>, retention_age: Duration, max_per_workflow: usize) -> Self {
        Self {
            store,
            retention_age,
            max_per_workflow,
        }
    }

    /// Runs until `shutdown` is cancelled, pruning on an hourly tick and
    /// once more before returning.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // first tick fires immediately; skip it, we prune on a timer from here

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.prune_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("retention worker shutting down, running final prune");
                    self.prune_once().await;
                    return;
                }
            }
        }
    }

    async fn prune_once(&self) {
        match self.store.prune_events(self.retention_age, self.max_per_workflow).await {
            Ok(outcome) if outcome.events_deleted > 0 => {
                info!(events_deleted = outcome.events_deleted, "pruned expired events");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "event pruning failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amelia_storage::InMemoryStore;

    #[tokio::test(start_paused = true)]
    async fn shutdown_triggers_a_final_prune() {
        let store = Arc::new(InMemoryStore::new());
        let worker = RetentionWorker::new(store.clone(), Duration::from_secs(1), 100);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            worker.run(token).await;
        });
        shutdown.cancel();
        handle.await.unwrap();
    }
}
