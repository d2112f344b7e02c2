//! Optimistic binding layer: a reactive per-type view over the coordinator.
//!
//! Mutations apply to the cache first (tagged pending), then go to the
//! external REST endpoint. A failed round-trip rolls the cache back: a
//! failed create removes the provisional entity, a failed update restores the
//! exact pre-mutation snapshot, a failed remove reinserts the entity. While
//! offline, mutations go to the coordinator's pending queue instead.
//!
//! The visible list is kept newest-first by creation time and is driven
//! entirely by change events, so pushes from other clients show up too.

use crate::cache::CacheEntry;
use crate::coordinator::{MutationAck, SubscribeOptions, SubscriptionHandle, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::registry::ChangeEvent;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use relosync_model::{EntitySchema, Payload, payload_from_value};
use relosync_types::{EntityId, EntityType, Timestamp};
use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// REST endpoints for one entity type, supplied by the page.
#[async_trait]
pub trait EntityEndpoint: Send + Sync {
    /// Creates an entity and returns the server's version of it.
    async fn create(&self, data: Payload) -> anyhow::Result<Payload>;

    /// Applies a patch and returns the updated entity.
    async fn update(&self, id: &EntityId, data: Payload) -> anyhow::Result<Payload>;

    async fn delete(&self, id: &EntityId) -> anyhow::Result<()>;
}

/// Result of a view mutation. Never an `Err`, so callers branch on `success`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    pub success: bool,
    /// The entity as it now stands.
    pub data: Option<Payload>,
    pub error: Option<String>,
    /// Offline: accepted into the pending queue.
    pub queued: bool,
}

impl MutationOutcome {
    fn confirmed(data: Option<Payload>) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    fn queued(data: Option<Payload>) -> Self {
        Self {
            success: true,
            data,
            queued: true,
            ..Self::default()
        }
    }

    fn failed(error: &SyncError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// What the view currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub data: Vec<Payload>,
    pub loading: bool,
    pub error: Option<String>,
}

/// A live, optimistic view of one entity type.
pub struct OptimisticView {
    coordinator: SyncCoordinator,
    entity_type: EntityType,
    endpoint: Arc<dyn EntityEndpoint>,
    state: Arc<RwLock<ViewState>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl OptimisticView {
    /// Subscribes to `entity_type` and seeds the view from the cache.
    pub async fn attach(
        coordinator: SyncCoordinator,
        entity_type: impl Into<EntityType>,
        endpoint: Arc<dyn EntityEndpoint>,
    ) -> Self {
        let entity_type = entity_type.into();
        let state = Arc::new(RwLock::new(ViewState::default()));

        let schema = coordinator.schema_for(&entity_type).clone();
        let view_state = state.clone();
        let handle = coordinator
            .subscribe(
                entity_type.clone(),
                move |event| apply_event(&schema, &mut view_state.write(), event),
                SubscribeOptions::default(),
            )
            .await;

        // Subscribed first, and the view is locked before the cache is read,
        // so no event lands between the read and the write.
        {
            let mut view = state.write();
            view.data = coordinator.cached_all(&entity_type);
            newest_first(coordinator.schema_for(&entity_type), &mut view.data);
        }

        Self {
            coordinator,
            entity_type,
            endpoint,
            state,
            subscription: Mutex::new(Some(handle)),
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Current visible list.
    pub fn data(&self) -> Vec<Payload> {
        self.state.read().data.clone()
    }

    pub fn loading(&self) -> bool {
        self.state.read().loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn snapshot(&self) -> ViewState {
        self.state.read().clone()
    }

    /// Whether the entity has an unconfirmed optimistic write.
    pub fn is_pending(&self, id: &EntityId) -> bool {
        self.coordinator
            .cached_entry(&self.entity_type, id)
            .is_some_and(|entry| entry.pending)
    }

    fn schema(&self) -> &EntitySchema {
        self.coordinator.schema_for(&self.entity_type)
    }

    fn set_error(&self, error: Option<String>) {
        self.state.write().error = error;
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> SyncResult<T> {
        let limit = self.coordinator.config().mutation_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(limit)),
        }
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Creates an entity optimistically under a temporary id.
    pub async fn create(&self, mut data: Payload) -> MutationOutcome {
        let schema = self.schema().clone();
        let temp_id = EntityId::temporary();
        schema.stamp_id(&mut data, &temp_id);
        if schema.created_at(&data).is_none() {
            let now = Timestamp::now();
            let stamp = now
                .to_rfc3339()
                .map_or_else(|| now.as_millis().into(), serde_json::Value::String);
            data.insert(schema.created_at_field.clone(), stamp);
        }
        self.coordinator.stage_create(&self.entity_type, data.clone());

        if !self.coordinator.is_connected() {
            return self.defer_create(&temp_id, data).await;
        }

        let mut request = data.clone();
        request.remove(&schema.id_field);
        match self.with_timeout(self.endpoint.create(request)).await {
            Ok(entity) => {
                self.coordinator
                    .confirm_entity(&self.entity_type, &temp_id, entity.clone());
                self.set_error(None);
                MutationOutcome::confirmed(Some(entity))
            }
            Err(e) => {
                warn!("Create of {} failed, rolling back: {}", self.entity_type, e);
                self.coordinator.discard(&self.entity_type, &temp_id);
                self.set_error(Some(e.to_string()));
                MutationOutcome::failed(&e)
            }
        }
    }

    async fn defer_create(&self, temp_id: &EntityId, data: Payload) -> MutationOutcome {
        match self
            .coordinator
            .create_entity(self.entity_type.clone(), data.clone(), None)
            .await
        {
            Ok(MutationAck::Queued) => {
                debug!("Queued create of {} {}", self.entity_type, temp_id);
                MutationOutcome::queued(Some(data))
            }
            Ok(MutationAck::Confirmed(ack)) => {
                // Reconnected in between; the coordinator already confirmed it.
                let entity = ack.and_then(payload_from_value).unwrap_or(data);
                MutationOutcome::confirmed(Some(entity))
            }
            Err(e) => {
                self.coordinator.discard(&self.entity_type, temp_id);
                self.set_error(Some(e.to_string()));
                MutationOutcome::failed(&e)
            }
        }
    }

    /// Applies a patch optimistically. Rolls back to the exact snapshot on failure.
    pub async fn update(&self, id: &EntityId, patch: Payload) -> MutationOutcome {
        let online = self.coordinator.is_connected();
        if online && id.is_temporary() {
            let e = SyncError::NotFound(format!("{} {} is not confirmed yet", self.entity_type, id));
            return MutationOutcome::failed(&e);
        }

        let snapshot = match self.coordinator.stage_update(&self.entity_type, id, &patch) {
            Ok(snapshot) => snapshot,
            Err(e) => return MutationOutcome::failed(&e),
        };

        if !online {
            return self.defer_update(id, patch, snapshot).await;
        }

        match self.with_timeout(self.endpoint.update(id, patch)).await {
            Ok(entity) => {
                self.coordinator
                    .confirm_entity(&self.entity_type, id, entity.clone());
                self.set_error(None);
                MutationOutcome::confirmed(self.coordinator.cached(&self.entity_type, id))
            }
            Err(e) => {
                warn!("Update of {} {} failed, rolling back: {}", self.entity_type, id, e);
                self.coordinator
                    .restore(&self.entity_type, id, Some(snapshot));
                self.set_error(Some(e.to_string()));
                MutationOutcome::failed(&e)
            }
        }
    }

    async fn defer_update(&self, id: &EntityId, patch: Payload, snapshot: CacheEntry) -> MutationOutcome {
        match self
            .coordinator
            .update_entity(self.entity_type.clone(), id.clone(), patch, None)
            .await
        {
            Ok(MutationAck::Queued) => {
                MutationOutcome::queued(self.coordinator.cached(&self.entity_type, id))
            }
            Ok(MutationAck::Confirmed(_)) => {
                MutationOutcome::confirmed(self.coordinator.cached(&self.entity_type, id))
            }
            Err(e) => {
                self.coordinator
                    .restore(&self.entity_type, id, Some(snapshot));
                self.set_error(Some(e.to_string()));
                MutationOutcome::failed(&e)
            }
        }
    }

    /// Removes an entity optimistically. Reinserts it on failure.
    pub async fn remove(&self, id: &EntityId) -> MutationOutcome {
        let online = self.coordinator.is_connected();
        if online && id.is_temporary() {
            let e = SyncError::NotFound(format!("{} {} is not confirmed yet", self.entity_type, id));
            return MutationOutcome::failed(&e);
        }

        let snapshot = match self.coordinator.stage_delete(&self.entity_type, id) {
            Ok(snapshot) => snapshot,
            Err(e) => return MutationOutcome::failed(&e),
        };

        let result = if online {
            self.with_timeout(self.endpoint.delete(id)).await.map(|()| false)
        } else {
            self.coordinator
                .delete_entity(self.entity_type.clone(), id.clone(), None)
                .await
                .map(|ack| ack.is_queued())
        };

        match result {
            Ok(queued) => {
                self.set_error(None);
                let outcome = MutationOutcome::confirmed(Some(snapshot.payload));
                MutationOutcome { queued, ..outcome }
            }
            Err(e) => {
                warn!("Remove of {} {} failed, restoring: {}", self.entity_type, id, e);
                self.coordinator
                    .restore(&self.entity_type, id, Some(snapshot));
                self.set_error(Some(e.to_string()));
                MutationOutcome::failed(&e)
            }
        }
    }

    /// Reloads the type from the server. Offline, the view falls back to
    /// the cache without reporting an error.
    pub async fn refresh(&self) -> SyncResult<()> {
        self.state.write().loading = true;
        let result = self.coordinator.sync_entity(self.entity_type.clone()).await;
        let mut state = self.state.write();
        state.loading = false;
        match result {
            Ok(_) => {
                state.error = None;
                Ok(())
            }
            Err(SyncError::NotConnected) => {
                state.data = self.coordinator.cached_all(&self.entity_type);
                newest_first(self.schema(), &mut state.data);
                state.error = None;
                Ok(())
            }
            Err(e) => {
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Stops following changes.
    pub async fn detach(&self) {
        let handle = self.subscription.lock().take();
        if let Some(handle) = handle {
            handle.unsubscribe().await;
        }
    }
}

/// Folds one change event into the visible list.
fn apply_event(schema: &EntitySchema, state: &mut ViewState, event: &ChangeEvent) {
    match event {
        ChangeEvent::Sync { entities } => {
            state.data = entities.clone();
            newest_first(schema, &mut state.data);
        }
        ChangeEvent::Create { entity } => upsert(schema, &mut state.data, entity.clone()),
        ChangeEvent::Update {
            entity_id,
            patch,
            entity,
        } => {
            let position = position_of(schema, &state.data, entity_id);
            match (entity, position) {
                (Some(entity), Some(index)) => state.data[index] = entity.clone(),
                (Some(entity), None) => upsert(schema, &mut state.data, entity.clone()),
                (None, Some(index)) => {
                    let merged = schema.merge(Some(&state.data[index]), patch);
                    state.data[index] = merged;
                }
                (None, None) => {}
            }
        }
        ChangeEvent::Delete { entity_id } => {
            if let Some(index) = position_of(schema, &state.data, entity_id) {
                state.data.remove(index);
            }
        }
    }
}

/// Sorts by creation time, newest first. Entities without one go first.
fn newest_first(schema: &EntitySchema, data: &mut [Payload]) {
    data.sort_by_key(|entity| schema.created_at(entity).map(Reverse));
}

fn position_of(schema: &EntitySchema, data: &[Payload], id: &EntityId) -> Option<usize> {
    data.iter()
        .position(|entity| schema.entity_id(entity).as_ref() == Some(id))
}

/// Replaces in place, or inserts before the first older entity.
/// Entities without a creation time go first.
fn upsert(schema: &EntitySchema, data: &mut Vec<Payload>, entity: Payload) {
    if let Some(id) = schema.entity_id(&entity) {
        if let Some(index) = position_of(schema, data, &id) {
            data[index] = entity;
            return;
        }
    }
    let index = match schema.created_at(&entity) {
        Some(created) => data
            .iter()
            .position(|other| schema.created_at(other).is_some_and(|t| t < created))
            .unwrap_or(data.len()),
        None => 0,
    };
    data.insert(index, entity);
}
