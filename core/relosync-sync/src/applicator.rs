//! Change applicator: applies server pushes and local optimistic writes to
//! the entity cache.
//!
//! Every function takes the cache by `&mut` and returns the change events to
//! publish, so the caller can release the cache lock before fan-out. Merge
//! and staleness decisions come from the type's [`EntitySchema`].

use crate::cache::{CacheEntry, EntityCache};
use crate::config::SyncConfig;
use crate::protocol::{ServerMessage, SyncResponseMessage};
use crate::queue::{Operation, PendingUpdate};
use crate::registry::ChangeEvent;
use relosync_model::{EntitySchema, Payload};
use relosync_types::{EntityId, EntityKey, EntityType};
use std::sync::Arc;
use tracing::{debug, warn};

/// What one application produced.
#[derive(Debug, Default, PartialEq)]
pub struct Applied {
    /// Events to publish, in order.
    pub events: Vec<(EntityType, ChangeEvent)>,
    /// Pending entries overwritten by the server.
    pub conflicts: Vec<EntityKey>,
    /// Writes dropped because they carried an older version.
    pub stale: usize,
}

impl Applied {
    fn publish(&mut self, entity_type: &EntityType, event: ChangeEvent) {
        self.events.push((entity_type.clone(), event));
    }

    /// Appends another application's results after this one's.
    pub fn absorb(&mut self, other: Applied) {
        self.events.extend(other.events);
        self.conflicts.extend(other.conflicts);
        self.stale += other.stale;
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.conflicts.is_empty()
    }
}

/// Applies changes to an [`EntityCache`] using schema-driven merge.
#[derive(Debug, Clone)]
pub struct ChangeApplicator {
    config: Arc<SyncConfig>,
}

impl ChangeApplicator {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self { config }
    }

    pub fn schema(&self, entity_type: &EntityType) -> &EntitySchema {
        self.config.schema_for(entity_type)
    }

    // ── Server pushes ────────────────────────────────────────────

    /// Applies one server push.
    pub fn apply(&self, cache: &mut EntityCache, message: &ServerMessage) -> Applied {
        let mut applied = Applied::default();
        match message {
            ServerMessage::Create(m) => {
                self.apply_create(cache, &m.entity_type, None, &m.entity, &mut applied);
            }
            ServerMessage::Update(m) => {
                self.apply_update(cache, &m.entity_type, &m.entity_id, &m.updates, &mut applied);
            }
            ServerMessage::Delete(m) => {
                self.apply_delete(cache, &m.entity_type, &m.entity_id, &mut applied);
            }
            ServerMessage::Batch(m) => {
                debug!("Applying batch of {} updates", m.updates.len());
                for update in &m.updates {
                    self.apply_pending(cache, update, &mut applied);
                }
            }
            ServerMessage::SyncResponse(m) => {
                self.apply_sync(cache, m, &mut applied);
            }
            ServerMessage::Error(e) => {
                warn!("Server error {}: {}", e.code, e.message);
            }
        }
        applied
    }

    fn apply_pending(&self, cache: &mut EntityCache, update: &PendingUpdate, applied: &mut Applied) {
        match update.operation {
            Operation::Create => self.apply_create(
                cache,
                &update.entity_type,
                Some(&update.entity_id),
                &update.payload,
                applied,
            ),
            Operation::Update => self.apply_update(
                cache,
                &update.entity_type,
                &update.entity_id,
                &update.payload,
                applied,
            ),
            Operation::Delete => {
                self.apply_delete(cache, &update.entity_type, &update.entity_id, applied);
            }
        }
    }

    fn apply_create(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        fallback_id: Option<&EntityId>,
        entity: &Payload,
        applied: &mut Applied,
    ) {
        let schema = self.schema(entity_type);
        let Some(id) = schema
            .entity_id(entity)
            .or_else(|| fallback_id.filter(|id| !id.is_placeholder()).cloned())
        else {
            warn!("Dropping {} create without an id", entity_type);
            return;
        };
        let mut entity = entity.clone();
        schema.stamp_id(&mut entity, &id);
        let version = schema.version(&entity);

        if let Some(existing) = cache.get(entity_type, &id) {
            if schema.is_stale(existing.version, version) {
                debug!("Ignoring stale create for {}:{}", entity_type, id);
                applied.stale += 1;
                return;
            }
            if existing.pending {
                applied.conflicts.push(existing.key());
            }
        }

        cache.insert(
            CacheEntry::new(entity_type.clone(), id, entity.clone(), false).with_version(version),
        );
        applied.publish(entity_type, ChangeEvent::Create { entity });
    }

    fn apply_update(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
        patch: &Payload,
        applied: &mut Applied,
    ) {
        let schema = self.schema(entity_type);
        let Some(existing) = cache.get(entity_type, id) else {
            debug!("Update for uncached {}:{}", entity_type, id);
            applied.publish(
                entity_type,
                ChangeEvent::Update {
                    entity_id: id.clone(),
                    patch: patch.clone(),
                    entity: None,
                },
            );
            return;
        };

        if schema.is_stale(existing.version, schema.version(patch)) {
            debug!("Ignoring stale update for {}:{}", entity_type, id);
            applied.stale += 1;
            return;
        }
        if existing.pending {
            applied.conflicts.push(existing.key());
        }

        let merged = schema.merge(Some(&existing.payload), patch);
        let version = schema.version(&merged);
        cache.insert(
            CacheEntry::new(entity_type.clone(), id.clone(), merged.clone(), false)
                .with_version(version),
        );
        applied.publish(
            entity_type,
            ChangeEvent::Update {
                entity_id: id.clone(),
                patch: patch.clone(),
                entity: Some(merged),
            },
        );
    }

    fn apply_delete(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
        applied: &mut Applied,
    ) {
        if let Some(removed) = cache.remove(entity_type, id) {
            if removed.pending {
                applied.conflicts.push(removed.key());
            }
        }
        applied.publish(
            entity_type,
            ChangeEvent::Delete {
                entity_id: id.clone(),
            },
        );
    }

    /// Authoritative replace of a type. Unconfirmed local creates (pending
    /// entries with temporary ids) are kept, since the server cannot know them yet.
    fn apply_sync(
        &self,
        cache: &mut EntityCache,
        response: &SyncResponseMessage,
        applied: &mut Applied,
    ) {
        let entity_type = &response.entity_type;
        let schema = self.schema(entity_type);

        let mut entries = Vec::with_capacity(response.entities.len());
        for entity in &response.entities {
            match schema.entity_id(entity) {
                Some(id) => entries.push(
                    CacheEntry::new(entity_type.clone(), id, entity.clone(), false)
                        .with_version(schema.version(entity)),
                ),
                None => warn!("Dropping {} sync entity without an id", entity_type),
            }
        }
        let unconfirmed: Vec<CacheEntry> = cache
            .get_all_by_type(entity_type)
            .into_iter()
            .filter(|e| e.pending && e.entity_id.is_temporary())
            .cloned()
            .collect();
        entries.extend(unconfirmed);

        let dropped = cache.replace_type(entity_type, entries);
        debug!(
            "Synced {}: {} entities, {} dropped",
            entity_type,
            cache.count(entity_type),
            dropped
        );
        let entities = cache
            .get_all_by_type(entity_type)
            .into_iter()
            .map(|e| e.payload.clone())
            .collect();
        applied.publish(entity_type, ChangeEvent::Sync { entities });
    }

    // ── Local optimistic writes ──────────────────────────────────

    /// Writes a new entity as pending. Assigns a temporary id if it has none.
    pub fn stage_create(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        mut entity: Payload,
    ) -> (EntityId, Applied) {
        let schema = self.schema(entity_type);
        let id = schema.entity_id(&entity).unwrap_or_else(EntityId::temporary);
        schema.stamp_id(&mut entity, &id);
        let version = schema.version(&entity);
        cache.insert(
            CacheEntry::new(entity_type.clone(), id.clone(), entity.clone(), true)
                .with_version(version),
        );
        let mut applied = Applied::default();
        applied.publish(entity_type, ChangeEvent::Create { entity });
        (id, applied)
    }

    /// Merges `patch` onto a cached entity and marks it pending.
    /// Returns the pre-mutation entry, or `None` when the entity is not cached.
    pub fn stage_update(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
        patch: &Payload,
    ) -> Option<(CacheEntry, Applied)> {
        let schema = self.schema(entity_type);
        let snapshot = cache.get(entity_type, id)?.clone();
        let merged = schema.merge(Some(&snapshot.payload), patch);
        cache.insert(
            CacheEntry::new(entity_type.clone(), id.clone(), merged.clone(), true)
                .with_version(snapshot.version),
        );
        let mut applied = Applied::default();
        applied.publish(
            entity_type,
            ChangeEvent::Update {
                entity_id: id.clone(),
                patch: patch.clone(),
                entity: Some(merged),
            },
        );
        Some((snapshot, applied))
    }

    /// Removes a cached entity. Returns the removed entry for rollback.
    pub fn stage_delete(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
    ) -> Option<(CacheEntry, Applied)> {
        let snapshot = cache.remove(entity_type, id)?;
        let mut applied = Applied::default();
        applied.publish(
            entity_type,
            ChangeEvent::Delete {
                entity_id: id.clone(),
            },
        );
        Some((snapshot, applied))
    }

    /// Replaces a provisional entry with the server's entity.
    ///
    /// When the server assigned a different id, the provisional entry is
    /// removed and the authoritative one inserted; otherwise it is replaced in
    /// place and its pending flag cleared. A confirmation older than the
    /// cached version is dropped.
    pub fn confirm(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        provisional_id: &EntityId,
        authoritative: Payload,
    ) -> Applied {
        let schema = self.schema(entity_type);
        let mut applied = Applied::default();
        let id = schema
            .entity_id(&authoritative)
            .unwrap_or_else(|| provisional_id.clone());
        let mut entity = authoritative;
        schema.stamp_id(&mut entity, &id);
        let version = schema.version(&entity);

        if id != *provisional_id && cache.remove(entity_type, provisional_id).is_some() {
            applied.publish(
                entity_type,
                ChangeEvent::Delete {
                    entity_id: provisional_id.clone(),
                },
            );
        }

        let existing = cache.get(entity_type, &id).map(|e| (e.version, e.pending));
        if let Some((cached_version, pending)) = existing {
            if schema.is_stale(cached_version, version) {
                debug!("Ignoring stale confirmation for {}:{}", entity_type, id);
                applied.stale += 1;
                if pending {
                    // The newer state is authoritative; only the flag was ours.
                    self.settle(cache, entity_type, &id);
                }
                return applied;
            }
        }
        let event = if existing.is_some() {
            ChangeEvent::Update {
                entity_id: id.clone(),
                patch: entity.clone(),
                entity: Some(entity.clone()),
            }
        } else {
            ChangeEvent::Create {
                entity: entity.clone(),
            }
        };
        cache.insert(CacheEntry::new(entity_type.clone(), id, entity, false).with_version(version));
        applied.publish(entity_type, event);
        applied
    }

    /// Drops an entity the server confirmed as deleted. Publishes only when
    /// it was still cached.
    pub fn confirm_delete(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
    ) -> Applied {
        let mut applied = Applied::default();
        if cache.remove(entity_type, id).is_some() {
            applied.publish(
                entity_type,
                ChangeEvent::Delete {
                    entity_id: id.clone(),
                },
            );
        }
        applied
    }

    /// Folds the server's answer to one sent mutation into the cache.
    ///
    /// A delete removes the entity. A create or update carrying an entity
    /// confirms it under the server's id. Without an entity the entry is only
    /// marked confirmed and the next sync settles its final state.
    pub fn reconcile(
        &self,
        cache: &mut EntityCache,
        update: &PendingUpdate,
        entity: Option<Payload>,
    ) -> Applied {
        let (entity_type, id) = (&update.entity_type, &update.entity_id);
        match (update.operation, entity) {
            (Operation::Delete, _) => self.confirm_delete(cache, entity_type, id),
            (_, Some(entity))
                if id.is_placeholder() && self.schema(entity_type).entity_id(&entity).is_none() =>
            {
                warn!("Dropping {} confirmation without an id", entity_type);
                Applied::default()
            }
            (_, Some(entity)) => self.confirm(cache, entity_type, id, entity),
            (_, None) => {
                self.settle(cache, entity_type, id);
                Applied::default()
            }
        }
    }

    /// Merges `data` onto the cached entity, keeping its pending flag, or
    /// inserts it as confirmed when the entity is not cached.
    pub fn write_through(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
        data: &Payload,
    ) -> Applied {
        let schema = self.schema(entity_type);
        let mut applied = Applied::default();
        match cache.get(entity_type, id) {
            Some(existing) => {
                let pending = existing.pending;
                let merged = schema.merge(Some(&existing.payload), data);
                let version = schema.version(&merged);
                cache.insert(
                    CacheEntry::new(entity_type.clone(), id.clone(), merged.clone(), pending)
                        .with_version(version),
                );
                applied.publish(
                    entity_type,
                    ChangeEvent::Update {
                        entity_id: id.clone(),
                        patch: data.clone(),
                        entity: Some(merged),
                    },
                );
            }
            None => {
                let mut entity = data.clone();
                schema.stamp_id(&mut entity, id);
                let version = schema.version(&entity);
                cache.insert(
                    CacheEntry::new(entity_type.clone(), id.clone(), entity.clone(), false)
                        .with_version(version),
                );
                applied.publish(entity_type, ChangeEvent::Create { entity });
            }
        }
        applied
    }

    /// Clears the pending flag without changing the payload.
    pub fn settle(&self, cache: &mut EntityCache, entity_type: &EntityType, id: &EntityId) -> bool {
        match cache.get(entity_type, id) {
            Some(entry) if entry.pending => {
                let mut entry = entry.clone();
                entry.pending = false;
                cache.insert(entry);
                true
            }
            _ => false,
        }
    }

    /// Puts back a pre-mutation snapshot exactly, or removes the entity when
    /// there was none.
    pub fn restore(
        &self,
        cache: &mut EntityCache,
        entity_type: &EntityType,
        id: &EntityId,
        snapshot: Option<CacheEntry>,
    ) -> Applied {
        let mut applied = Applied::default();
        match snapshot {
            Some(entry) => {
                let payload = entry.payload.clone();
                let event = if cache.get(entity_type, id).is_some() {
                    ChangeEvent::Update {
                        entity_id: id.clone(),
                        patch: payload.clone(),
                        entity: Some(payload),
                    }
                } else {
                    ChangeEvent::Create { entity: payload }
                };
                cache.insert(entry);
                applied.publish(entity_type, event);
            }
            None => {
                cache.remove(entity_type, id);
                applied.publish(
                    entity_type,
                    ChangeEvent::Delete {
                        entity_id: id.clone(),
                    },
                );
            }
        }
        applied
    }
}
