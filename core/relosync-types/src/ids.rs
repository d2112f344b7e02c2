//! Identifier types used throughout relosync.
//!
//! Entity ids are owned by the server and arrive as JSON strings or numbers.
//! Ids minted on the client before the server has confirmed an entity are
//! temporary and carry a fixed prefix followed by a UUID v7.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

const TEMPORARY_PREFIX: &str = "temp-";
const PLACEHOLDER: &str = "new";

/// Name of a server-owned entity collection (e.g. `"umzug"`, `"mitarbeiter"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Creates an entity type from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identifier of a single entity within its type.
///
/// Serializes as a string. Deserializes from either a string or a number,
/// since the back office API uses numeric keys for some collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id from a server-assigned value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh client-side id for an entity the server has not seen yet.
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_PREFIX}{}", Uuid::now_v7()))
    }

    /// The `"new"` placeholder used when an offline create carries no id.
    #[must_use]
    pub fn placeholder() -> Self {
        Self(PLACEHOLDER.to_string())
    }

    /// Whether this id was minted by [`EntityId::temporary`].
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }

    /// Whether this is the `"new"` placeholder.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0 == PLACEHOLDER
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id out of a JSON value. Strings and numbers are accepted.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Converts the id into a JSON string value.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::String(self.0.clone())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Composite key `type:id` addressing one cached entity or pending update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// The entity's type.
    pub entity_type: EntityType,
    /// The entity's id within that type.
    pub entity_id: EntityId,
}

impl EntityKey {
    /// Creates a key from its parts.
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}
