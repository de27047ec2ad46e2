//! Sync pipeline composition (C12)
//!
//! The coordinator drives the end-to-end synchronization of a category or
//! batch: fetch pages, extract, clean, validate, dedup, version, upsert,
//! fan out image work, checkpoint after every page. The handlers module
//! registers every symbolic task the workers can execute.

pub mod coordinator;
pub mod handlers;
pub mod source;

pub use coordinator::SyncCoordinator;
pub use source::{SourceConfig, SourceFilter};
