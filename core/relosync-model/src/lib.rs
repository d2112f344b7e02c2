//! Entity model for relosync.
//!
//! Defines the universal types the cache and the sync coordinator depend on:
//! - [`Payload`]: the JSON object carried by every entity, patch and sync list
//! - [`EntitySchema`]: where an entity type keeps its id, creation time and
//!   version, and which [`MergeStrategy`] applies to updates
//! - [`MergeStrategy`]: how an update patch is folded onto the cached entity
//!
//! The coordinator never inspects entity fields beyond what the schema names.

mod entity;
mod schema;

pub use entity::{Payload, payload_from_value};
pub use schema::{EntitySchema, MergeStrategy};
