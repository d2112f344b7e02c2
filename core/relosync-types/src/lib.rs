//! Core type definitions for relosync.
//!
//! This crate defines the identifier and time types shared by the cache,
//! the wire protocol and the sync coordinator:
//! - Entity types and entity identifiers (server-assigned or temporary)
//! - Composite `type:id` cache keys
//! - Millisecond timestamps as they appear on the wire
//!
//! Entity payloads and merge rules live in `relosync-model`.

mod ids;
mod timestamp;

pub use ids::{EntityId, EntityKey, EntityType};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
