use std::sync::Arc;

use amelia_orchestrator::{Config, EventBus, LifecycleService};
use amelia_storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub lifecycle: Arc<LifecycleService>,
    pub event_bus: EventBus,
    pub config: Arc<Config>,
}
