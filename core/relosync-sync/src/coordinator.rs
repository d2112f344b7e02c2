//! Sync coordinator: the central state machine.
//!
//! Consumes channel events, applies server pushes to the entity cache, fans
//! changes out to subscribers, and owns the offline queue and its replay.
//!
//! # Lifecycle
//!
//! `Uninitialized -> Connecting -> Connected <-> Disconnected -> Exhausted`.
//! Every (re)connect re-subscribes the active types, replays the queue as a
//! single `data:batch`, then refreshes subscribed types in the background.
//!
//! All channel events are handled sequentially by one task. Nothing on that
//! task waits for a server push, since pushes arrive through the same task.

use crate::applicator::{Applied, ChangeApplicator};
use crate::cache::{CacheEntry, EntityCache};
use crate::channel::{ChannelAdapter, ChannelEvent};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    Ack, BatchMessage, ClientMessage, CreateMessage, DeleteMessage, ServerMessage,
    SubscribeMessage, SyncRequestMessage, UnsubscribeMessage, UpdateMessage,
};
use crate::queue::{PendingQueue, PendingUpdate};
use crate::registry::{ChangeEvent, Filter, Removal, SubscriptionId, SubscriptionRegistry};
use crate::state::{ChannelStatus, ConnectionState, CoordinatorState, SyncNotice};
use crate::transport::ChannelTransport;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use relosync_model::{EntitySchema, Payload, payload_from_value};
use relosync_types::{EntityId, EntityKey, EntityType, Timestamp};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const NOTICE_CAPACITY: usize = 64;

/// Result of an outbound mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationAck {
    /// Acknowledged by the server, with the acknowledgement's data.
    Confirmed(Option<Value>),
    /// Offline: accepted into the pending queue.
    Queued,
}

impl MutationAck {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Options for [`SyncCoordinator::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Only events the filter accepts reach the callback.
    pub filter: Option<Filter>,
    /// Sent as the server-side `options` of `subscribe` and `sync:request`.
    pub params: Payload,
    /// Request a sync for the type in the background after subscribing.
    pub initial_sync: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: Payload) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_initial_sync(mut self) -> Self {
        self.initial_sync = true;
        self
    }
}

/// Returned by [`SyncCoordinator::subscribe`]; unsubscribes explicitly.
#[derive(Debug)]
pub struct SubscriptionHandle {
    inner: Weak<Inner>,
    entity_type: EntityType,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Removes the subscription. The last one for a type leaves the
    /// server-side update group.
    pub async fn unsubscribe(self) -> Removal {
        match self.inner.upgrade() {
            Some(inner) => {
                SyncCoordinator { inner }
                    .unsubscribe(&self.entity_type, self.id)
                    .await
            }
            None => Removal::NotFound,
        }
    }
}

enum Command {
    Replay,
}

type SyncWaiter = (u64, oneshot::Sender<Vec<Payload>>);

struct Inner {
    config: Arc<SyncConfig>,
    channel: ChannelAdapter,
    applicator: ChangeApplicator,
    cache: RwLock<EntityCache>,
    registry: SubscriptionRegistry,
    queue: Mutex<PendingQueue>,
    state: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<SyncNotice>,
    sync_waiters: Mutex<HashMap<EntityType, Vec<SyncWaiter>>>,
    next_waiter: AtomicU64,
    syncs_in_flight: AtomicUsize,
    subscribe_params: Mutex<HashMap<EntityType, Payload>>,
    replay_lock: tokio::sync::Mutex<()>,
    replay_failures: AtomicU32,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("status", &self.channel.status())
            .field("pending", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

/// The sync coordinator. Cheap to clone; clones share state.
#[derive(Clone, Debug)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Creates an uninitialized coordinator over `transport`.
    pub fn new(config: SyncConfig, transport: Arc<dyn ChannelTransport>) -> SyncResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (state, _) = watch::channel(ConnectionState::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                channel: ChannelAdapter::new(transport, config.channel_config()),
                applicator: ChangeApplicator::new(config.clone()),
                config,
                cache: RwLock::new(EntityCache::new()),
                registry: SubscriptionRegistry::new(),
                queue: Mutex::new(PendingQueue::new()),
                state,
                notices,
                sync_waiters: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(0),
                syncs_in_flight: AtomicUsize::new(0),
                subscribe_params: Mutex::new(HashMap::new()),
                replay_lock: tokio::sync::Mutex::new(()),
                replay_failures: AtomicU32::new(0),
                commands: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts event processing and connects.
    ///
    /// Calling it again while connected or reconnecting is a no-op with a
    /// warning. After reconnection was exhausted, it starts over.
    pub async fn init(&self, endpoint: &str, credential: &str) -> SyncResult<ChannelStatus> {
        if endpoint.is_empty() {
            return Err(SyncError::Config("endpoint must not be empty".into()));
        }

        let needs_loop = self
            .inner
            .event_loop
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished);
        if needs_loop {
            let events = self.inner.channel.on_event();
            let (tx, rx) = mpsc::unbounded_channel();
            *self.inner.commands.lock() = Some(tx);
            let handle = tokio::spawn(run_event_loop(Arc::downgrade(&self.inner), events, rx));
            *self.inner.event_loop.lock() = Some(handle);
        }

        if !matches!(
            self.inner.channel.status(),
            ChannelStatus::Connected | ChannelStatus::Connecting
        ) {
            self.update_state(|s| s.status = CoordinatorState::Connecting);
        }
        Ok(self.inner.channel.connect(endpoint, credential).await)
    }

    /// Disconnects and drops all state: cache, subscriptions, queue.
    pub async fn dispose(&self) {
        let event_loop = self.inner.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            event_loop.abort();
        }
        self.inner.commands.lock().take();
        self.inner.channel.disconnect().await;

        self.inner.registry.clear();
        self.inner.sync_waiters.lock().clear();
        self.inner.subscribe_params.lock().clear();
        self.inner.cache.write().clear(None);
        let dropped = self.inner.queue.lock().drain().len();
        if dropped > 0 {
            warn!("Disposed with {} unsent pending updates", dropped);
        }
        self.inner.replay_failures.store(0, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::default());
        info!("Sync coordinator disposed");
    }

    // ── Channel events ───────────────────────────────────────────

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.on_connected().await,
            ChannelEvent::Disconnected { reason } => {
                info!("Sync offline: {}", reason);
                self.update_state(|s| {
                    s.status = CoordinatorState::Disconnected;
                    s.connected = false;
                });
                // Outstanding sync requests cannot be answered any more.
                self.inner.sync_waiters.lock().clear();
                self.notify(SyncNotice::Offline { reason });
            }
            ChannelEvent::ReconnectFailed { attempt, reason } => {
                debug!("Reconnect attempt {} failed: {}", attempt, reason);
                self.update_state(|s| {
                    s.status = CoordinatorState::Disconnected;
                    s.connected = false;
                    s.reconnect_attempts = attempt;
                });
            }
            ChannelEvent::Exhausted { attempts } => {
                warn!("Reconnection exhausted after {} attempts", attempts);
                self.update_state(|s| {
                    s.status = CoordinatorState::Exhausted;
                    s.connected = false;
                    s.reconnect_attempts = attempts;
                });
                self.notify(SyncNotice::ReconnectExhausted { attempts });
            }
            ChannelEvent::Message(message) => self.handle_server_message(message),
        }
    }

    async fn on_connected(&self) {
        info!("Sync online");
        self.update_state(|s| {
            s.status = CoordinatorState::Connected;
            s.connected = true;
            s.reconnect_attempts = 0;
        });
        self.notify(SyncNotice::Online);

        self.resubscribe().await;
        if let Err(e) = self.replay_pending().await {
            debug!("Replay after connect did not complete: {}", e);
        }

        let subscribed = !self.inner.registry.subscribed_types().is_empty();
        if self.inner.config.sync_on_reconnect && subscribed {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.sync_all().await;
            });
        }
    }

    async fn resubscribe(&self) {
        for entity_type in self.inner.registry.subscribed_types() {
            let options = self.params_for(&entity_type);
            let message = ClientMessage::Subscribe(SubscribeMessage {
                entity_type: entity_type.clone(),
                options,
            });
            if let Err(e) = self.request(message, None).await {
                warn!("Re-subscribe to {} failed: {}", entity_type, e);
            }
        }
    }

    fn handle_server_message(&self, message: ServerMessage) {
        let applied = {
            let mut cache = self.inner.cache.write();
            self.inner.applicator.apply(&mut cache, &message)
        };
        self.dispatch(applied);

        if let ServerMessage::SyncResponse(response) = message {
            self.update_state(|s| s.last_sync_at = Some(Timestamp::now()));
            let waiters = self
                .inner
                .sync_waiters
                .lock()
                .remove(&response.entity_type)
                .unwrap_or_default();
            for (_, waiter) in waiters {
                let _ = waiter.send(response.entities.clone());
            }
        }
    }

    /// Publishes applied changes and reports conflicts. Call without holding the cache lock.
    fn dispatch(&self, applied: Applied) {
        if applied.stale > 0 {
            debug!("Dropped {} stale writes", applied.stale);
        }
        for key in applied.conflicts {
            warn!("Server overwrote unconfirmed write to {}", key);
            self.notify(SyncNotice::ReconciliationConflict { key });
        }
        for (entity_type, event) in applied.events {
            let fan_out = self.inner.registry.publish(&entity_type, event);
            if fan_out.faults > 0 {
                warn!("{} subscriber(s) of {} failed", fan_out.faults, entity_type);
            }
        }
    }

    // ── Outbound mutations ───────────────────────────────────────

    /// Sends `data:create`, or queues it while offline.
    ///
    /// Online failures are returned, never queued.
    pub async fn create_entity(
        &self,
        entity_type: impl Into<EntityType>,
        mut entity: Payload,
        timeout: Option<Duration>,
    ) -> SyncResult<MutationAck> {
        let entity_type = entity_type.into();
        let schema = self.schema_for(&entity_type);
        let id = schema.entity_id(&entity).unwrap_or_else(EntityId::placeholder);
        if id.is_temporary() {
            // Temporary ids stay local; the pending key carries it.
            entity.remove(&schema.id_field);
        }
        let message = ClientMessage::Create(CreateMessage::new(entity_type.clone(), entity.clone()));
        self.send_or_defer(message, timeout, PendingUpdate::create(entity_type, id, entity))
            .await
    }

    /// Sends `data:update`, or queues it while offline.
    pub async fn update_entity(
        &self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        updates: Payload,
        timeout: Option<Duration>,
    ) -> SyncResult<MutationAck> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let message = ClientMessage::Update(UpdateMessage::new(
            entity_type.clone(),
            entity_id.clone(),
            updates.clone(),
        ));
        self.send_or_defer(message, timeout, PendingUpdate::update(entity_type, entity_id, updates))
            .await
    }

    /// Sends `data:delete`, or queues it while offline.
    pub async fn delete_entity(
        &self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        timeout: Option<Duration>,
    ) -> SyncResult<MutationAck> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let message =
            ClientMessage::Delete(DeleteMessage::new(entity_type.clone(), entity_id.clone()));
        self.send_or_defer(message, timeout, PendingUpdate::delete(entity_type, entity_id))
            .await
    }

    /// Sends `message`, or queues `update` while offline. An acknowledgement
    /// is reconciled into the cache before it is returned.
    async fn send_or_defer(
        &self,
        message: ClientMessage,
        timeout: Option<Duration>,
        update: PendingUpdate,
    ) -> SyncResult<MutationAck> {
        if self.inner.state.borrow().status == CoordinatorState::Uninitialized {
            return Err(SyncError::NotInitialized);
        }
        if !self.is_connected() {
            self.defer(update);
            return Ok(MutationAck::Queued);
        }
        match self.request(message, timeout).await {
            Ok(data) => {
                self.reconcile_ack(&update, data.clone());
                Ok(MutationAck::Confirmed(data))
            }
            Err(SyncError::NotConnected) => {
                self.defer(update);
                Ok(MutationAck::Queued)
            }
            Err(e) => Err(e),
        }
    }

    fn reconcile_ack(&self, update: &PendingUpdate, data: Option<Value>) {
        let applied = {
            let mut cache = self.inner.cache.write();
            self.inner
                .applicator
                .reconcile(&mut cache, update, data.and_then(payload_from_value))
        };
        self.dispatch(applied);
    }

    async fn request(
        &self,
        message: ClientMessage,
        timeout: Option<Duration>,
    ) -> SyncResult<Option<Value>> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        self.inner
            .channel
            .send_with_timeout(message, timeout)
            .await
            .and_then(Ack::into_result)
    }

    // ── Pending queue ────────────────────────────────────────────

    /// Queues a mutation, folding it into any queued one for the same entity.
    ///
    /// An update after a queued create becomes a create with the merged
    /// entity; an update after an update merges the patches; a delete after a
    /// queued create cancels both.
    pub fn defer(&self, update: PendingUpdate) {
        let key = update.key();
        let operation = update.operation;
        let (queued, depth) = {
            let mut queue = self.inner.queue.lock();
            let queued = queue.fold(update, |t, earlier, later| {
                self.schema_for(t).merge(Some(earlier), later)
            });
            (queued, queue.len())
        };
        if queued {
            debug!("Queued {} for {}", operation, key);
        } else {
            debug!("Cancelled queued create for {}", key);
        }
        info!("Offline: {} pending updates", depth);
        self.update_state(|_| {});
    }

    fn requeue(&self, batch: Vec<PendingUpdate>) -> usize {
        let mut queue = self.inner.queue.lock();
        queue.requeue(batch, |t, earlier, later| {
            self.schema_for(t).merge(Some(earlier), later)
        });
        queue.len()
    }

    /// Drops a queued mutation without sending it.
    pub fn cancel_pending(&self, key: &EntityKey) -> Option<PendingUpdate> {
        let removed = self.inner.queue.lock().discard(key);
        if removed.is_some() {
            self.update_state(|_| {});
        }
        removed
    }

    /// Sends the whole queue as one `data:batch`.
    ///
    /// On success the queue is cleared and per-update results in the
    /// acknowledgement replace provisional entries. On failure the batch is
    /// re-queued in full and a retry is scheduled; repeated failure raises
    /// [`SyncNotice::ReplayFailed`]. Returns the number of replayed updates.
    pub async fn replay_pending(&self) -> SyncResult<usize> {
        let _replaying = self.inner.replay_lock.lock().await;
        let batch = self.inner.queue.lock().drain();
        if batch.is_empty() {
            return Ok(0);
        }
        if !self.is_connected() {
            self.requeue(batch);
            return Err(SyncError::NotConnected);
        }

        let count = batch.len();
        info!("Replaying {} pending updates", count);
        self.begin_sync();
        let message = ClientMessage::Batch(BatchMessage {
            updates: batch.clone(),
        });
        let result = self.request(message, None).await;
        self.end_sync();

        match result {
            Ok(data) => {
                self.inner.replay_failures.store(0, Ordering::SeqCst);
                self.reconcile_replay(&batch, data);
                self.update_state(|_| {});
                info!("Replayed {} pending updates", count);
                Ok(count)
            }
            Err(e) => {
                let pending = self.requeue(batch);
                let failures = self.inner.replay_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Replay of {} updates failed ({} in a row): {}",
                    count, failures, e
                );
                if failures >= self.inner.config.replay_escalation_threshold {
                    self.notify(SyncNotice::ReplayFailed {
                        failures,
                        pending,
                        error: e.to_string(),
                    });
                }
                self.update_state(|_| {});
                if !e.is_offline() {
                    self.schedule_replay_retry();
                }
                Err(e)
            }
        }
    }

    fn schedule_replay_retry(&self) {
        let Some(commands) = self.inner.commands.lock().clone() else {
            return;
        };
        let delay = self.inner.config.replay_retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Replay);
        });
    }

    /// Applies the per-update results of an accepted batch.
    ///
    /// Result `i` answers update `i` and has the acknowledgement shape; each
    /// accepted result is reconciled like an online acknowledgement.
    fn reconcile_replay(&self, batch: &[PendingUpdate], data: Option<Value>) {
        let results = match data {
            Some(Value::Array(results)) => results,
            _ => Vec::new(),
        };
        let mut applied = Applied::default();
        {
            let mut cache = self.inner.cache.write();
            for (index, update) in batch.iter().enumerate() {
                let result = results
                    .get(index)
                    .and_then(|r| serde_json::from_value::<Ack>(r.clone()).ok());
                if let Some(Ack {
                    success: false,
                    error,
                    ..
                }) = &result
                {
                    warn!(
                        "Server refused replayed {} of {}: {}",
                        update.operation,
                        update.key(),
                        error.as_deref().unwrap_or("no reason given")
                    );
                    continue;
                }
                let entity = result.and_then(|ack| ack.data).and_then(payload_from_value);
                applied.absorb(self.inner.applicator.reconcile(&mut cache, update, entity));
            }
        }
        self.dispatch(applied);
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Requests the complete entity list of a type and waits for the
    /// `sync:response`. Fails fast when offline.
    pub async fn request_sync(
        &self,
        entity_type: impl Into<EntityType>,
        options: Payload,
    ) -> SyncResult<Vec<Payload>> {
        let entity_type = entity_type.into();
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        let waiter = self.inner.next_waiter.fetch_add(1, Ordering::SeqCst);
        self.inner
            .sync_waiters
            .lock()
            .entry(entity_type.clone())
            .or_default()
            .push((waiter, tx));

        self.begin_sync();
        let waited = self.inner.config.sync_timeout();
        let message = ClientMessage::SyncRequest(SyncRequestMessage {
            entity_type: entity_type.clone(),
            options,
        });
        let round_trip = async {
            self.request(message, None).await?;
            rx.await.map_err(|_| SyncError::NotConnected)
        };
        let result = match tokio::time::timeout(waited, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::SyncTimeout {
                entity_type: entity_type.to_string(),
                waited,
            }),
        };
        self.end_sync();

        match &result {
            Ok(entities) => debug!("Synced {} ({} entities)", entity_type, entities.len()),
            Err(e) => {
                warn!("Sync of {} failed: {}", entity_type, e);
                self.drop_waiter(&entity_type, waiter);
            }
        }
        result
    }

    /// Syncs one type with the params it was subscribed with.
    pub async fn sync_entity(
        &self,
        entity_type: impl Into<EntityType>,
    ) -> SyncResult<Vec<Payload>> {
        let entity_type = entity_type.into();
        let options = self.params_for(&entity_type);
        self.request_sync(entity_type, options).await
    }

    /// Syncs every subscribed type concurrently.
    pub async fn sync_all(&self) -> Vec<(EntityType, SyncResult<usize>)> {
        let types = self.inner.registry.subscribed_types();
        let results = join_all(types.into_iter().map(|entity_type| async move {
            let result = self
                .sync_entity(entity_type.clone())
                .await
                .map(|entities| entities.len());
            (entity_type, result)
        }))
        .await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!("Synced {}/{} types", results.len() - failed, results.len());
        results
    }

    fn drop_waiter(&self, entity_type: &EntityType, waiter: u64) {
        let mut waiters = self.inner.sync_waiters.lock();
        if let Some(list) = waiters.get_mut(entity_type) {
            list.retain(|(id, _)| *id != waiter);
            if list.is_empty() {
                waiters.remove(entity_type);
            }
        }
    }

    fn begin_sync(&self) {
        self.inner.syncs_in_flight.fetch_add(1, Ordering::SeqCst);
        self.update_state(|s| s.syncing = true);
    }

    fn end_sync(&self) {
        let remaining = self.inner.syncs_in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.update_state(|s| s.syncing = remaining > 0);
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Registers a change listener for a type. The first listener for a type
    /// joins its server-side update group.
    pub async fn subscribe<F>(
        &self,
        entity_type: impl Into<EntityType>,
        callback: F,
        options: SubscribeOptions,
    ) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let entity_type = entity_type.into();
        let SubscribeOptions {
            filter,
            params,
            initial_sync,
        } = options;
        let subscribed = self
            .inner
            .registry
            .subscribe(&entity_type, Arc::new(callback), filter);
        if subscribed.first_for_type || !params.is_empty() {
            self.inner
                .subscribe_params
                .lock()
                .insert(entity_type.clone(), params);
        }

        if subscribed.first_for_type && self.is_connected() {
            let message = ClientMessage::Subscribe(SubscribeMessage {
                entity_type: entity_type.clone(),
                options: self.params_for(&entity_type),
            });
            if let Err(e) = self.request(message, None).await {
                warn!("Subscribe to {} failed: {}", entity_type, e);
            }
        }

        if initial_sync && self.is_connected() {
            let coordinator = self.clone();
            let sync_type = entity_type.clone();
            tokio::spawn(async move {
                let _ = coordinator.sync_entity(sync_type).await;
            });
        }

        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            entity_type,
            id: subscribed.id,
        }
    }

    /// Removes a listener. Removing the last one for a type sends exactly
    /// one `unsubscribe`.
    pub async fn unsubscribe(&self, entity_type: &EntityType, id: SubscriptionId) -> Removal {
        let removal = self.inner.registry.unsubscribe(entity_type, id);
        if removal == Removal::LastForType {
            self.inner.subscribe_params.lock().remove(entity_type);
            if self.is_connected() {
                let message = ClientMessage::Unsubscribe(UnsubscribeMessage {
                    entity_type: entity_type.clone(),
                });
                if let Err(e) = self.request(message, None).await {
                    warn!("Unsubscribe from {} failed: {}", entity_type, e);
                }
            }
        }
        removal
    }

    fn params_for(&self, entity_type: &EntityType) -> Payload {
        self.inner
            .subscribe_params
            .lock()
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    // ── Cache access ─────────────────────────────────────────────

    /// Cached payload of one entity.
    pub fn cached(&self, entity_type: &EntityType, entity_id: &EntityId) -> Option<Payload> {
        self.inner
            .cache
            .read()
            .get(entity_type, entity_id)
            .map(|e| e.payload.clone())
    }

    pub fn cached_entry(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> Option<CacheEntry> {
        self.inner.cache.read().get(entity_type, entity_id).cloned()
    }

    /// Cached payloads of a type, in cache order.
    pub fn cached_all(&self, entity_type: &EntityType) -> Vec<Payload> {
        self.inner
            .cache
            .read()
            .get_all_by_type(entity_type)
            .into_iter()
            .map(|e| e.payload.clone())
            .collect()
    }

    /// Merges `data` into the cached entity and notifies subscribers.
    pub fn update_cache(&self, entity_type: &EntityType, entity_id: &EntityId, data: &Payload) {
        let applied = {
            let mut cache = self.inner.cache.write();
            self.inner
                .applicator
                .write_through(&mut cache, entity_type, entity_id, data)
        };
        self.dispatch(applied);
    }

    // ── Optimistic staging ───────────────────────────────────────

    /// Writes a new entity as pending and returns its id (temporary when
    /// the entity has none).
    pub fn stage_create(&self, entity_type: &EntityType, entity: Payload) -> EntityId {
        let (id, applied) = {
            let mut cache = self.inner.cache.write();
            self.inner.applicator.stage_create(&mut cache, entity_type, entity)
        };
        self.dispatch(applied);
        id
    }

    /// Applies a patch optimistically. Returns the pre-mutation snapshot.
    pub fn stage_update(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        patch: &Payload,
    ) -> SyncResult<CacheEntry> {
        let staged = {
            let mut cache = self.inner.cache.write();
            self.inner
                .applicator
                .stage_update(&mut cache, entity_type, entity_id, patch)
        };
        let (snapshot, applied) =
            staged.ok_or_else(|| SyncError::NotFound(format!("{entity_type}:{entity_id}")))?;
        self.dispatch(applied);
        Ok(snapshot)
    }

    /// Removes an entity optimistically. Returns the removed entry.
    pub fn stage_delete(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> SyncResult<CacheEntry> {
        let staged = {
            let mut cache = self.inner.cache.write();
            self.inner
                .applicator
                .stage_delete(&mut cache, entity_type, entity_id)
        };
        let (snapshot, applied) =
            staged.ok_or_else(|| SyncError::NotFound(format!("{entity_type}:{entity_id}")))?;
        self.dispatch(applied);
        Ok(snapshot)
    }

    /// Replaces a provisional entry with the server's entity.
    pub fn confirm_entity(
        &self,
        entity_type: &EntityType,
        provisional_id: &EntityId,
        entity: Payload,
    ) {
        let applied = {
            let mut cache = self.inner.cache.write();
            self.inner
                .applicator
                .confirm(&mut cache, entity_type, provisional_id, entity)
        };
        self.dispatch(applied);
    }

    /// Rolls an entity back to `snapshot`, or removes it when `None`.
    pub fn restore(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        snapshot: Option<CacheEntry>,
    ) {
        let applied = {
            let mut cache = self.inner.cache.write();
            self.inner
                .applicator
                .restore(&mut cache, entity_type, entity_id, snapshot)
        };
        self.dispatch(applied);
    }

    /// Drops a provisional entry.
    pub fn discard(&self, entity_type: &EntityType, entity_id: &EntityId) {
        self.restore(entity_type, entity_id, None);
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Watches connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to user-visible notices.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.inner.notices.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.inner.channel.status()
    }

    pub fn pending_updates(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Copies of the queued mutations in replay order.
    pub fn pending_snapshot(&self) -> Vec<PendingUpdate> {
        self.inner.queue.lock().snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn schema_for(&self, entity_type: &EntityType) -> &EntitySchema {
        self.inner.config.schema_for(entity_type)
    }

    pub fn listener_count(&self, entity_type: &EntityType) -> usize {
        self.inner.registry.listener_count(entity_type)
    }

    fn update_state(&self, change: impl FnOnce(&mut ConnectionState)) {
        let pending = self.inner.queue.lock().len();
        self.inner.state.send_modify(|state| {
            change(state);
            state.pending_updates = pending;
        });
    }

    fn notify(&self, notice: SyncNotice) {
        // No receivers is fine.
        let _ = self.inner.notices.send(notice);
    }
}

async fn run_event_loop(
    weak: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                SyncCoordinator { inner }.handle_channel_event(event).await;
            }
            Some(command) = commands.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                let coordinator = SyncCoordinator { inner };
                match command {
                    Command::Replay => {
                        if coordinator.is_connected() && coordinator.pending_updates() > 0 {
                            let _ = coordinator.replay_pending().await;
                        }
                    }
                }
            }
            else => break,
        }
    }
    debug!("Sync event loop stopped");
}
