//! Persistence implementations
//!
//! Two concrete stores behind the domain repository traits: sqlite (the
//! authoritative production store, via sqlx) and in-memory (tests and
//! ephemeral runs). Both also implement the durable queue port so queue
//! rows live in the same store as entities.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
