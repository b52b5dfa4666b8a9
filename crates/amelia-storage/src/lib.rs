//! Persistence layer (component C2, spec.md §4.1, §6.6).

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{PruneOutcome, Store, WorkflowFilter};
