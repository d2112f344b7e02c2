//! Subscription registry: per-type listener sets and change fan-out.
//!
//! `publish` snapshots the listener list before delivering, so a listener
//! may subscribe or unsubscribe from inside its callback. A publish for a
//! type that is already being fanned out (from a callback, or from another
//! task) is queued and delivered by the running fan-out once it finishes,
//! keeping per-type delivery sequential and in order.
//!
//! A panicking callback is caught and logged; the remaining listeners still
//! receive the event.

use parking_lot::Mutex;
use relosync_model::Payload;
use relosync_types::{EntityId, EntityType};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A change delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Full replace: the complete entity list for the type.
    Sync { entities: Vec<Payload> },
    /// A new entity.
    Create { entity: Payload },
    /// A field patch. `entity` is the merged result when the entity is cached.
    Update {
        entity_id: EntityId,
        patch: Payload,
        entity: Option<Payload>,
    },
    /// An entity was removed.
    Delete { entity_id: EntityId },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Sync { .. } => ChangeKind::Sync,
            Self::Create { .. } => ChangeKind::Create,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// Discriminant of a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Sync,
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync => "sync",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Listener callback.
pub type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Listener filter. Events for which it returns false are skipped.
pub type Filter = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscribed {
    pub id: SubscriptionId,
    /// No other listener for the type existed before this one.
    pub first_for_type: bool,
}

/// Result of [`SubscriptionRegistry::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No such subscription.
    NotFound,
    /// Removed; other listeners for the type remain.
    Removed,
    /// Removed the last listener for the type.
    LastForType,
}

/// Outcome of one [`SubscriptionRegistry::publish`] call.
///
/// Counts cover every event delivered by the call, including queued events
/// it drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Callbacks that ran to completion.
    pub delivered: usize,
    /// Listeners whose filter rejected the event.
    pub skipped: usize,
    /// Callbacks or filters that panicked.
    pub faults: usize,
    /// The event was queued behind a fan-out already running for the type.
    pub deferred: bool,
}

#[derive(Clone)]
struct Listener {
    id: SubscriptionId,
    callback: Callback,
    filter: Option<Filter>,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<EntityType, Vec<Listener>>,
    publishing: HashSet<EntityType>,
    deferred: HashMap<EntityType, VecDeque<ChangeEvent>>,
}

/// Mapping from entity type to its listeners.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `entity_type`.
    pub fn subscribe(
        &self,
        entity_type: &EntityType,
        callback: Callback,
        filter: Option<Filter>,
    ) -> Subscribed {
        let id = SubscriptionId::new();
        let mut inner = self.inner.lock();
        let listeners = inner.listeners.entry(entity_type.clone()).or_default();
        let first_for_type = listeners.is_empty();
        listeners.push(Listener {
            id,
            callback,
            filter,
        });
        debug!("Subscribed {} to {} ({} listeners)", id, entity_type, listeners.len());
        Subscribed { id, first_for_type }
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, entity_type: &EntityType, id: SubscriptionId) -> Removal {
        let mut inner = self.inner.lock();
        let Some(listeners) = inner.listeners.get_mut(entity_type) else {
            return Removal::NotFound;
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        if listeners.len() == before {
            return Removal::NotFound;
        }
        if listeners.is_empty() {
            inner.listeners.remove(entity_type);
            Removal::LastForType
        } else {
            Removal::Removed
        }
    }

    /// Delivers `event` to every listener of `entity_type` whose filter accepts it.
    pub fn publish(&self, entity_type: &EntityType, event: ChangeEvent) -> FanOut {
        let mut outcome = FanOut::default();
        let mut listeners = {
            let mut inner = self.inner.lock();
            if inner.publishing.contains(entity_type) {
                inner
                    .deferred
                    .entry(entity_type.clone())
                    .or_default()
                    .push_back(event);
                outcome.deferred = true;
                return outcome;
            }
            inner.publishing.insert(entity_type.clone());
            Self::snapshot(&inner, entity_type)
        };

        let mut event = event;
        loop {
            Self::deliver(entity_type, &event, &listeners, &mut outcome);

            let mut inner = self.inner.lock();
            let next = inner
                .deferred
                .get_mut(entity_type)
                .and_then(VecDeque::pop_front);
            match next {
                Some(queued) => {
                    listeners = Self::snapshot(&inner, entity_type);
                    event = queued;
                }
                None => {
                    inner.deferred.remove(entity_type);
                    inner.publishing.remove(entity_type);
                    break;
                }
            }
        }
        outcome
    }

    fn snapshot(inner: &Inner, entity_type: &EntityType) -> Vec<Listener> {
        inner.listeners.get(entity_type).cloned().unwrap_or_default()
    }

    fn deliver(
        entity_type: &EntityType,
        event: &ChangeEvent,
        listeners: &[Listener],
        outcome: &mut FanOut,
    ) {
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                if listener.filter.as_ref().is_some_and(|f| !f(event)) {
                    return false;
                }
                (listener.callback)(event);
                true
            }));
            match result {
                Ok(true) => outcome.delivered += 1,
                Ok(false) => outcome.skipped += 1,
                Err(_) => {
                    outcome.faults += 1;
                    warn!(
                        "Subscriber {} panicked handling {} event for {}",
                        listener.id,
                        event.kind(),
                        entity_type
                    );
                }
            }
        }
    }

    pub fn listener_count(&self, entity_type: &EntityType) -> usize {
        self.inner
            .lock()
            .listeners
            .get(entity_type)
            .map_or(0, Vec::len)
    }

    pub fn has_subscribers(&self, entity_type: &EntityType) -> bool {
        self.listener_count(entity_type) > 0
    }

    /// Types with at least one listener.
    pub fn subscribed_types(&self) -> Vec<EntityType> {
        self.inner.lock().listeners.keys().cloned().collect()
    }

    /// Drops every listener and any queued events.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.listeners.clear();
        inner.deferred.clear();
    }
}
