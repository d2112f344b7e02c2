use crate::Payload;
use relosync_types::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};

/// How an update patch is reconciled with the cached entity.
///
/// Both strategies are last-writer-wins; they differ in granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Last-writer-wins per top-level field. Keys in the patch overwrite the
    /// cached ones; nested objects are replaced wholesale, never deep-merged.
    #[default]
    LwwPerField,
    /// Last-writer-wins on the whole document. The patch becomes the entity.
    LwwDocument,
}

/// Describes where an entity type keeps the fields the sync layer reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySchema {
    /// Field holding the entity id.
    pub id_field: String,
    /// Field holding the creation time (epoch millis or RFC 3339).
    pub created_at_field: String,
    /// Field holding a monotonically increasing entity version.
    pub version_field: String,
    /// Merge rule for inbound and optimistic updates.
    pub merge_strategy: MergeStrategy,
}

impl Default for EntitySchema {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            created_at_field: "createdAt".to_string(),
            version_field: "version".to_string(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

impl EntitySchema {
    /// Returns a copy with a different merge strategy.
    #[must_use]
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Reads the entity id.
    pub fn entity_id(&self, payload: &Payload) -> Option<EntityId> {
        payload.get(&self.id_field).and_then(EntityId::from_value)
    }

    /// Writes `id` into the id field, replacing any previous value.
    pub fn stamp_id(&self, payload: &mut Payload, id: &EntityId) {
        payload.insert(self.id_field.clone(), id.to_value());
    }

    /// Reads the creation time.
    pub fn created_at(&self, payload: &Payload) -> Option<Timestamp> {
        payload.get(&self.created_at_field).and_then(Timestamp::from_value)
    }

    /// Reads the entity version.
    pub fn version(&self, payload: &Payload) -> Option<u64> {
        payload.get(&self.version_field).and_then(serde_json::Value::as_u64)
    }

    /// A write carrying `incoming` is stale when both sides are versioned and
    /// the incoming version is lower than the cached one.
    pub fn is_stale(&self, cached: Option<u64>, incoming: Option<u64>) -> bool {
        matches!((cached, incoming), (Some(cached), Some(incoming)) if incoming < cached)
    }

    /// Folds `patch` onto `base` according to the merge strategy.
    ///
    /// Under [`MergeStrategy::LwwDocument`] the base id is carried over when
    /// the patch does not name one, so the result stays addressable.
    pub fn merge(&self, base: Option<&Payload>, patch: &Payload) -> Payload {
        match self.merge_strategy {
            MergeStrategy::LwwPerField => {
                let mut merged = base.cloned().unwrap_or_default();
                for (field, value) in patch {
                    merged.insert(field.clone(), value.clone());
                }
                merged
            }
            MergeStrategy::LwwDocument => {
                let mut merged = patch.clone();
                if let Some(id) = base.and_then(|b| b.get(&self.id_field)) {
                    merged
                        .entry(self.id_field.clone())
                        .or_insert_with(|| id.clone());
                }
                merged
            }
        }
    }
}
