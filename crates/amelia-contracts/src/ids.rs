//! Clock & ID generation (component C1).
//!
//! IDs are UUIDv7 so they are both globally unique and time-ordered, which
//! keeps Postgres index locality good for the append-heavy `events` table.

use uuid::Uuid;

/// Generate a new time-ordered identifier.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
