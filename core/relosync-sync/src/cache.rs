//! In-memory entity cache.
//!
//! A plain data structure with no I/O and no merge logic: every write
//! replaces the entry for its `type:id` key. Entries of one type are kept in
//! first-insertion order, which is the order [`EntityCache::get_all_by_type`]
//! reports them in.

use relosync_model::Payload;
use relosync_types::{EntityId, EntityKey, EntityType, Timestamp};
use std::collections::HashMap;

/// Last-known state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: Payload,
    pub last_updated: Timestamp,
    /// Optimistic write not yet confirmed by the server.
    pub pending: bool,
    /// Version read from the payload when the entry was written.
    pub version: Option<u64>,
}

impl CacheEntry {
    pub fn new(entity_type: EntityType, entity_id: EntityId, payload: Payload, pending: bool) -> Self {
        Self {
            entity_type,
            entity_id,
            payload,
            last_updated: Timestamp::now(),
            pending,
            version: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: Option<u64>) -> Self {
        self.version = version;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

#[derive(Debug, Default)]
struct Bucket {
    order: Vec<EntityId>,
    entries: HashMap<EntityId, CacheEntry>,
}

impl Bucket {
    fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let id = entry.entity_id.clone();
        let previous = self.entries.insert(id.clone(), entry);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    fn remove(&mut self, id: &EntityId) -> Option<CacheEntry> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }
}

/// Mapping from `(type, id)` to [`CacheEntry`].
#[derive(Debug, Default)]
pub struct EntityCache {
    buckets: HashMap<EntityType, Bucket>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_type: &EntityType, entity_id: &EntityId) -> Option<&CacheEntry> {
        self.buckets.get(entity_type)?.entries.get(entity_id)
    }

    pub fn get_by_key(&self, key: &EntityKey) -> Option<&CacheEntry> {
        self.get(&key.entity_type, &key.entity_id)
    }

    /// Every entry of a type, in first-insertion order.
    pub fn get_all_by_type(&self, entity_type: &EntityType) -> Vec<&CacheEntry> {
        match self.buckets.get(entity_type) {
            Some(bucket) => bucket
                .order
                .iter()
                .filter_map(|id| bucket.entries.get(id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Writes `payload`, replacing any existing entry. Returns the previous entry.
    pub fn put(
        &mut self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        payload: Payload,
        pending: bool,
    ) -> Option<CacheEntry> {
        self.insert(CacheEntry::new(entity_type.clone(), entity_id.clone(), payload, pending))
    }

    /// Writes a fully built entry, replacing any existing one.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.buckets
            .entry(entry.entity_type.clone())
            .or_default()
            .insert(entry)
    }

    pub fn remove(&mut self, entity_type: &EntityType, entity_id: &EntityId) -> Option<CacheEntry> {
        let bucket = self.buckets.get_mut(entity_type)?;
        let removed = bucket.remove(entity_id);
        if bucket.entries.is_empty() {
            self.buckets.remove(entity_type);
        }
        removed
    }

    /// Clears one type, or everything when `entity_type` is `None`.
    pub fn clear(&mut self, entity_type: Option<&EntityType>) {
        match entity_type {
            Some(entity_type) => {
                self.buckets.remove(entity_type);
            }
            None => self.buckets.clear(),
        }
    }

    /// Replaces every entry of a type with `entries`.
    ///
    /// Entities missing from `entries` are dropped. A repeated id keeps its
    /// first position and its last payload. Returns the number of dropped entries.
    pub fn replace_type(&mut self, entity_type: &EntityType, entries: Vec<CacheEntry>) -> usize {
        let previous = self.buckets.remove(entity_type).unwrap_or_default();
        let mut bucket = Bucket::default();
        for entry in entries {
            bucket.insert(entry);
        }
        let dropped = previous
            .order
            .iter()
            .filter(|id| !bucket.entries.contains_key(*id))
            .count();
        if !bucket.entries.is_empty() {
            self.buckets.insert(entity_type.clone(), bucket);
        }
        dropped
    }

    /// Total number of entries across all types.
    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn count(&self, entity_type: &EntityType) -> usize {
        self.buckets.get(entity_type).map_or(0, |b| b.entries.len())
    }

    /// Types with at least one entry.
    pub fn types(&self) -> Vec<EntityType> {
        self.buckets.keys().cloned().collect()
    }
}
