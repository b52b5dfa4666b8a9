//! Core workflow orchestration: the status DFA, the fixed node graph,
//! the event bus, and the admission/retry/shutdown policy that drives
//! them. `amelia-api` is the only HTTP-facing consumer of this crate.

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod event_bus;
pub mod lifecycle;
pub mod node;
pub mod retention;
pub mod retry;
pub mod runtime;
pub mod snapshot;

pub use checkpoint::Checkpointer;
pub use collaborators::{AgenticStreamItem, Driver, DriverUsage, FakeDriver, FakeTracker, Issue, Tracker};
pub use config::Config;
pub use event_bus::EventBus;
pub use lifecycle::LifecycleService;
pub use node::{NodeContext, NodeId, TerminalOutcome};
pub use retention::RetentionWorker;
pub use retry::RetryPolicy;
pub use runtime::{StateMachineRuntime, StepOutcome};
pub use snapshot::{ApprovalDecision, ReviewVerdict, StateSnapshot};
