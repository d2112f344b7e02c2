#![allow(dead_code)]

use parking_lot::Mutex;
use relosync_sync::protocol::{ClientMessage, ServerMessage, SyncResponseMessage};
use relosync_sync::transport::mock::MockTransport;
use relosync_sync::{Ack, EntityType, Payload, SyncConfig, SyncCoordinator, Timestamp};
use relosync_sync::{MergeStrategy, SyncNotice};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const ENDPOINT: &str = "wss://sync.test/socket";
pub const TOKEN: &str = "test-token";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// Short timings, heartbeat off.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        reconnect_delay_ms: 100,
        max_reconnect_attempts: 100,
        heartbeat_interval_ms: 0,
        request_timeout_ms: 1_000,
        sync_timeout_ms: 2_000,
        mutation_timeout_ms: 1_000,
        replay_retry_delay_ms: 500,
        replay_escalation_threshold: 2,
        sync_on_reconnect: false,
        ..SyncConfig::default()
    }
}

pub fn document_config() -> SyncConfig {
    let mut config = test_config();
    config.default_schema = config
        .default_schema
        .with_merge_strategy(MergeStrategy::LwwDocument);
    config
}

/// Polls `condition` on the paused clock until it holds or a few seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Lets spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// A coordinator connected over a fresh mock, with the connect event handled.
pub async fn connected(config: SyncConfig) -> (SyncCoordinator, MockTransport) {
    init_tracing();
    let transport = MockTransport::new();
    let coordinator = SyncCoordinator::new(config, Arc::new(transport.clone())).unwrap();
    coordinator.init(ENDPOINT, TOKEN).await.unwrap();
    assert!(eventually(|| coordinator.state().connected).await);
    (coordinator, transport)
}

/// Takes the connection down and waits until the coordinator has noticed.
pub async fn go_offline(coordinator: &SyncCoordinator, transport: &MockTransport) {
    transport.set_reachable(false);
    transport.drop_connection("network lost");
    assert!(eventually(|| !coordinator.state().connected).await);
}

/// Brings the connection back and waits for the reconnect to be handled.
pub async fn go_online(coordinator: &SyncCoordinator, transport: &MockTransport) {
    transport.set_reachable(true);
    assert!(eventually(|| coordinator.state().connected).await);
    settle().await;
}

pub fn drain_notices(rx: &mut broadcast::Receiver<SyncNotice>) -> Vec<SyncNotice> {
    let mut notices = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        notices.push(notice);
    }
    notices
}

/// An in-memory server: answers `sync:request` with its entity table and
/// confirms creates by assigning ids. Idempotent by id.
#[derive(Clone, Default)]
pub struct FakeServer {
    tables: Arc<Mutex<HashMap<EntityType, Vec<Payload>>>>,
    next_id: Arc<Mutex<u64>>,
}

impl FakeServer {
    pub fn seed(&self, entity_type: &str, entities: Vec<Payload>) {
        self.tables.lock().insert(entity_type.into(), entities);
    }

    pub fn table(&self, entity_type: &str) -> Vec<Payload> {
        self.tables
            .lock()
            .get(&EntityType::from(entity_type))
            .cloned()
            .unwrap_or_default()
    }

    /// Installs this server as the transport's responder.
    pub fn serve(&self, transport: &MockTransport) {
        let server = self.clone();
        transport.respond_with(move |message, pusher| Ok(server.handle(message, pusher)));
    }

    fn assign_id(&self, entity: &mut Payload) -> Value {
        let id = match entity.get("id").and_then(Value::as_str) {
            Some(id) if !id.starts_with("temp-") && id != "new" => id.to_string(),
            _ => {
                let mut next = self.next_id.lock();
                *next += 1;
                format!("srv-{}", *next)
            }
        };
        entity.insert("id".into(), Value::String(id.clone()));
        Value::String(id)
    }

    fn upsert(&self, entity_type: &EntityType, entity: Payload) {
        let mut tables = self.tables.lock();
        let table = tables.entry(entity_type.clone()).or_default();
        match table.iter_mut().find(|e| e.get("id") == entity.get("id")) {
            Some(existing) => *existing = entity,
            None => table.push(entity),
        }
    }

    /// Same client id, same server id.
    fn create(&self, entity_type: &EntityType, client_id: Option<Value>, mut entity: Payload) -> Payload {
        if let Some(existing) = client_id.as_ref().and_then(|k| self.created_from(entity_type, k)) {
            return existing;
        }
        self.assign_id(&mut entity);
        entity.insert("clientId".into(), client_id.unwrap_or(Value::Null));
        self.upsert(entity_type, entity.clone());
        entity
    }

    fn created_from(&self, entity_type: &EntityType, client_id: &Value) -> Option<Payload> {
        self.tables
            .lock()
            .get(entity_type)?
            .iter()
            .find(|e| e.get("clientId") == Some(client_id))
            .cloned()
    }

    fn handle(&self, message: &ClientMessage, pusher: &relosync_sync::transport::mock::MockPusher) -> Ack {
        match message {
            ClientMessage::SyncRequest(request) => {
                let entities = self
                    .tables
                    .lock()
                    .get(&request.entity_type)
                    .cloned()
                    .unwrap_or_default();
                pusher.push(ServerMessage::SyncResponse(SyncResponseMessage {
                    entity_type: request.entity_type.clone(),
                    entities,
                    timestamp: Timestamp::now(),
                }));
                Ack::ok(None)
            }
            ClientMessage::Create(m) => {
                let client_id = m.entity.get("id").cloned();
                let entity = self.create(&m.entity_type, client_id, m.entity.clone());
                Ack::ok(Some(Value::Object(entity)))
            }
            ClientMessage::Batch(batch) => {
                let results: Vec<Value> = batch
                    .updates
                    .iter()
                    .map(|update| {
                        let data = match update.operation {
                            relosync_sync::Operation::Create => Some(Value::Object(self.create(
                                &update.entity_type,
                                (!update.entity_id.is_placeholder())
                                    .then(|| Value::String(update.entity_id.to_string())),
                                update.payload.clone(),
                            ))),
                            relosync_sync::Operation::Update => {
                                let mut tables = self.tables.lock();
                                let table = tables.entry(update.entity_type.clone()).or_default();
                                let id = Value::String(update.entity_id.to_string());
                                table
                                    .iter_mut()
                                    .find(|e| e.get("id") == Some(&id))
                                    .map(|existing| {
                                        for (k, v) in &update.payload {
                                            existing.insert(k.clone(), v.clone());
                                        }
                                        Value::Object(existing.clone())
                                    })
                            }
                            relosync_sync::Operation::Delete => {
                                let id = Value::String(update.entity_id.to_string());
                                if let Some(table) = self.tables.lock().get_mut(&update.entity_type) {
                                    table.retain(|e| e.get("id") != Some(&id));
                                }
                                None
                            }
                        };
                        serde_json::to_value(Ack::ok(data)).unwrap()
                    })
                    .collect();
                Ack::ok(Some(Value::Array(results)))
            }
            _ => Ack::ok(None),
        }
    }
}
