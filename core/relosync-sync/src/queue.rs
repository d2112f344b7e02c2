//! Pending-update queue for mutations made while disconnected.
//!
//! Entries are keyed by `type:id`. A later entry for the same key replaces
//! the earlier one and moves to the back, so replay order follows the most
//! recent write to each entity. [`PendingQueue::fold`] and
//! [`PendingQueue::requeue`] combine the two entries with [`coalesce`] instead.

use relosync_model::Payload;
use relosync_types::{EntityId, EntityKey, EntityType, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// A mutation waiting for connectivity. Also the element type of `data:batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub entity_type: EntityType,
    /// Server id, temporary id, or the `"new"` placeholder.
    pub entity_id: EntityId,
    pub operation: Operation,
    /// Full entity for creates, field patch for updates, empty for deletes.
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub enqueued_at: Timestamp,
}

impl PendingUpdate {
    pub fn create(entity_type: EntityType, entity_id: EntityId, entity: Payload) -> Self {
        Self::new(entity_type, entity_id, Operation::Create, entity)
    }

    pub fn update(entity_type: EntityType, entity_id: EntityId, patch: Payload) -> Self {
        Self::new(entity_type, entity_id, Operation::Update, patch)
    }

    pub fn delete(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self::new(entity_type, entity_id, Operation::Delete, Payload::new())
    }

    fn new(entity_type: EntityType, entity_id: EntityId, operation: Operation, payload: Payload) -> Self {
        Self {
            entity_type,
            entity_id,
            operation,
            payload,
            enqueued_at: Timestamp::now(),
        }
    }

    /// The coalescing key.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Combines two queued mutations of one entity, `earlier` first.
///
/// An update after a create becomes a create of the merged entity; an update
/// after an update merges the patches; a delete after a create cancels both
/// (`None`). Any other pair keeps only `later`.
pub fn coalesce<M>(earlier: PendingUpdate, later: PendingUpdate, merge: M) -> Option<PendingUpdate>
where
    M: FnOnce(&EntityType, &Payload, &Payload) -> Payload,
{
    match (earlier.operation, later.operation) {
        (Operation::Create, Operation::Delete) => None,
        (Operation::Create | Operation::Update, Operation::Update) => {
            let payload = merge(&later.entity_type, &earlier.payload, &later.payload);
            Some(PendingUpdate {
                operation: earlier.operation,
                payload,
                ..later
            })
        }
        _ => Some(later),
    }
}

/// Ordered, coalescing queue of [`PendingUpdate`]s.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: HashMap<EntityKey, PendingUpdate>,
    order: Vec<EntityKey>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an update, replacing and returning any earlier one for the same key.
    pub fn enqueue(&mut self, update: PendingUpdate) -> Option<PendingUpdate> {
        let key = update.key();
        let replaced = self.entries.insert(key.clone(), update);
        if replaced.is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push(key);
        replaced
    }

    pub fn get(&self, key: &EntityKey) -> Option<&PendingUpdate> {
        self.entries.get(key)
    }

    /// Drops the entry for `key` without sending it.
    pub fn discard(&mut self, key: &EntityKey) -> Option<PendingUpdate> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    /// Removes and returns every entry in replay order.
    pub fn drain(&mut self) -> Vec<PendingUpdate> {
        let mut entries = std::mem::take(&mut self.entries);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    /// Adds an update, coalescing it with any queued one for the same key.
    /// Returns `false` when the two cancelled out and nothing is queued.
    pub fn fold<M>(&mut self, update: PendingUpdate, merge: M) -> bool
    where
        M: FnOnce(&EntityType, &Payload, &Payload) -> Payload,
    {
        let folded = match self.discard(&update.key()) {
            Some(earlier) => coalesce(earlier, update, merge),
            None => Some(update),
        };
        match folded {
            Some(update) => {
                self.enqueue(update);
                true
            }
            None => false,
        }
    }

    /// Puts a failed batch back in front of anything queued since.
    ///
    /// An entry queued after the batch was drained is newer: it is coalesced
    /// onto the batch's entry for the same key and takes the batch's place.
    pub fn requeue<M>(&mut self, batch: Vec<PendingUpdate>, merge: M)
    where
        M: Fn(&EntityType, &Payload, &Payload) -> Payload,
    {
        let mut front = Vec::with_capacity(batch.len());
        for update in batch {
            let key = update.key();
            let folded = match self.entries.remove(&key) {
                Some(newer) => {
                    self.order.retain(|k| k != &key);
                    coalesce(update, newer, &merge)
                }
                None => Some(update),
            };
            if let Some(update) = folded {
                self.entries.insert(key.clone(), update);
                front.push(key);
            }
        }
        front.append(&mut self.order);
        self.order = front;
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Copies of every entry in replay order.
    pub fn snapshot(&self) -> Vec<PendingUpdate> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key).cloned())
            .collect()
    }
}
