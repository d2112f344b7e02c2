use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use relosync_sync::protocol::{CreateMessage, UpdateMessage};
use relosync_sync::transport::mock::MockTransport;
use relosync_sync::{
    Ack, ChangeEvent, ChangeKind, ClientMessage, CoordinatorState, EntityId, EntityKey,
    EntityType, MutationAck, Operation, Removal, ServerMessage, SubscribeOptions, SyncConfig,
    SyncCoordinator, SyncError, SyncNotice,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

mod common;
use common::{
    ENDPOINT, FakeServer, TOKEN, connected, drain_notices, eventually, go_offline, go_online,
    payload, settle, test_config,
};

fn umzug() -> EntityType {
    EntityType::from("umzug")
}

fn count_events(transport: &MockTransport, name: &str) -> usize {
    transport.sent_events().iter().filter(|e| **e == name).count()
}

fn noop(_: &ChangeEvent) {}

async fn wait_for_notice(
    rx: &mut broadcast::Receiver<SyncNotice>,
    matches: impl Fn(&SyncNotice) -> bool,
) -> SyncNotice {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(notice) if matches(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("notices closed"),
            }
        }
    })
    .await
    .expect("notice not raised")
}

// ── Lifecycle ────────────────────────────────────────────────────

#[test]
fn new_rejects_invalid_config() {
    let config = SyncConfig {
        sync_timeout_ms: 0,
        ..SyncConfig::default()
    };
    let result = SyncCoordinator::new(config, Arc::new(MockTransport::new()));
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn init_rejects_empty_endpoint() {
    let transport = MockTransport::new();
    let coordinator = SyncCoordinator::new(test_config(), Arc::new(transport.clone())).unwrap();
    assert!(matches!(coordinator.init("", TOKEN).await, Err(SyncError::Config(_))));
    assert_eq!(transport.open_calls(), 0);
    assert_eq!(coordinator.state().status, CoordinatorState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn init_connects_and_announces() {
    let transport = MockTransport::new();
    let coordinator = SyncCoordinator::new(test_config(), Arc::new(transport.clone())).unwrap();
    let mut notices = coordinator.notices();

    coordinator.init(ENDPOINT, TOKEN).await.unwrap();

    assert!(eventually(|| coordinator.state().connected).await);
    let state = coordinator.state();
    assert_eq!(state.status, CoordinatorState::Connected);
    assert_eq!(state.reconnect_attempts, 0);
    assert!(coordinator.is_connected());
    assert_eq!(drain_notices(&mut notices), vec![SyncNotice::Online]);
}

#[tokio::test(start_paused = true)]
async fn init_twice_is_a_no_op() {
    let (coordinator, transport) = connected(test_config()).await;
    coordinator.init(ENDPOINT, TOKEN).await.unwrap();
    settle().await;
    assert_eq!(transport.open_calls(), 1);
    assert!(coordinator.state().connected);
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_reports_offline_then_exhausted() {
    let transport = MockTransport::new();
    transport.set_reachable(false);
    let config = SyncConfig {
        max_reconnect_attempts: 2,
        ..test_config()
    };
    let coordinator = SyncCoordinator::new(config, Arc::new(transport.clone())).unwrap();
    let mut notices = coordinator.notices();

    coordinator.init(ENDPOINT, TOKEN).await.unwrap();

    let notice = wait_for_notice(&mut notices, |n| {
        matches!(n, SyncNotice::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(notice, SyncNotice::ReconnectExhausted { attempts: 2 });
    let state = coordinator.state();
    assert_eq!(state.status, CoordinatorState::Exhausted);
    assert_eq!(state.reconnect_attempts, 2);

    // A new init starts over.
    transport.set_reachable(true);
    coordinator.init(ENDPOINT, TOKEN).await.unwrap();
    assert!(eventually(|| coordinator.state().connected).await);
}

#[tokio::test(start_paused = true)]
async fn connection_loss_and_recovery_are_announced() {
    let (coordinator, transport) = connected(test_config()).await;
    let mut notices = coordinator.notices();

    go_offline(&coordinator, &transport).await;
    assert_eq!(coordinator.state().status, CoordinatorState::Disconnected);
    go_online(&coordinator, &transport).await;

    let notices = drain_notices(&mut notices);
    assert_eq!(
        notices,
        vec![
            SyncNotice::Offline {
                reason: "network lost".into()
            },
            SyncNotice::Online
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn dispose_drops_all_state() {
    let (coordinator, transport) = connected(test_config()).await;
    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;
    coordinator.update_cache(&umzug(), &EntityId::new("1"), &payload(json!({"a": 1})));
    go_offline(&coordinator, &transport).await;
    coordinator
        .delete_entity(umzug(), "1", None)
        .await
        .unwrap();

    coordinator.dispose().await;

    assert!(coordinator.cached_all(&umzug()).is_empty());
    assert_eq!(coordinator.pending_updates(), 0);
    assert_eq!(coordinator.listener_count(&umzug()), 0);
    assert_eq!(coordinator.state().status, CoordinatorState::Uninitialized);
    assert!(!transport.is_open());
}

// ── Subscriptions ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn first_subscriber_joins_the_group() {
    let (coordinator, transport) = connected(test_config()).await;

    coordinator
        .subscribe(
            umzug(),
            noop,
            SubscribeOptions::new().with_params(payload(json!({"office": "HH"}))),
        )
        .await;
    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;

    assert_eq!(count_events(&transport, "subscribe"), 1);
    match &transport.sent()[0] {
        ClientMessage::Subscribe(m) => {
            assert_eq!(m.entity_type, umzug());
            assert_eq!(m.options, payload(json!({"office": "HH"})));
        }
        other => panic!("expected subscribe, got {other:?}"),
    }
    assert_eq!(coordinator.listener_count(&umzug()), 2);
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_both_sends_one_unsubscribe() {
    let (coordinator, transport) = connected(test_config()).await;
    let first = coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;
    let second = coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;

    assert_eq!(first.unsubscribe().await, Removal::Removed);
    assert_eq!(count_events(&transport, "unsubscribe"), 0);
    assert_eq!(second.unsubscribe().await, Removal::LastForType);

    let unsubscribes: Vec<_> = transport
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Unsubscribe(u) => Some(u.entity_type),
            _ => None,
        })
        .collect();
    assert_eq!(unsubscribes, vec![umzug()]);
}

#[tokio::test(start_paused = true)]
async fn subscribing_offline_defers_the_join() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;

    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;
    assert_eq!(count_events(&transport, "subscribe"), 0);

    go_online(&coordinator, &transport).await;
    assert_eq!(count_events(&transport, "subscribe"), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_active_types() {
    let (coordinator, transport) = connected(test_config()).await;
    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;
    coordinator
        .subscribe("employee", noop, SubscribeOptions::default())
        .await;
    transport.clear_sent();

    go_offline(&coordinator, &transport).await;
    go_online(&coordinator, &transport).await;

    let mut resubscribed: Vec<String> = transport
        .sent()
        .iter()
        .filter_map(|m| match m {
            ClientMessage::Subscribe(s) => Some(s.entity_type.to_string()),
            _ => None,
        })
        .collect();
    resubscribed.sort();
    assert_eq!(resubscribed, vec!["employee", "umzug"]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_refreshes_subscribed_types() {
    let config = SyncConfig {
        sync_on_reconnect: true,
        ..test_config()
    };
    let (coordinator, transport) = connected(config).await;
    let server = FakeServer::default();
    server.serve(&transport);
    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;

    go_offline(&coordinator, &transport).await;
    server.seed("umzug", vec![payload(json!({"id": "u1"}))]);
    go_online(&coordinator, &transport).await;

    assert!(eventually(|| coordinator.cached(&umzug(), &EntityId::new("u1")).is_some()).await);
    assert!(coordinator.state().last_sync_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn initial_sync_option_loads_the_type() {
    let (coordinator, transport) = connected(test_config()).await;
    let server = FakeServer::default();
    server.seed("umzug", vec![payload(json!({"id": "u1"})), payload(json!({"id": "u2"}))]);
    server.serve(&transport);

    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::new().with_initial_sync())
        .await;

    assert!(eventually(|| coordinator.cached_all(&umzug()).len() == 2).await);
}

// ── Server pushes ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pushes_update_cache_and_reach_subscribers() {
    let (coordinator, transport) = connected(test_config()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    coordinator
        .subscribe(
            umzug(),
            move |event: &ChangeEvent| log.lock().push(event.kind()),
            SubscribeOptions::default(),
        )
        .await;

    transport.push(ServerMessage::Create(CreateMessage::new(
        umzug(),
        payload(json!({"id": "u1", "city": "Hamburg"})),
    )));
    transport.push(ServerMessage::Update(UpdateMessage::new(
        umzug(),
        EntityId::new("u1"),
        payload(json!({"city": "Bremen"})),
    )));

    assert!(eventually(|| seen.lock().len() == 2).await);
    assert_eq!(*seen.lock(), vec![ChangeKind::Create, ChangeKind::Update]);
    assert_eq!(
        coordinator.cached(&umzug(), &EntityId::new("u1")).unwrap()["city"],
        "Bremen"
    );
}

#[tokio::test(start_paused = true)]
async fn filters_limit_what_a_subscriber_sees() {
    let (coordinator, transport) = connected(test_config()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    coordinator
        .subscribe(
            umzug(),
            move |event: &ChangeEvent| log.lock().push(event.kind()),
            SubscribeOptions::new().with_filter(|e| e.kind() == ChangeKind::Update),
        )
        .await;

    transport.push(ServerMessage::Create(CreateMessage::new(
        umzug(),
        payload(json!({"id": "u1"})),
    )));
    transport.push(ServerMessage::Update(UpdateMessage::new(
        umzug(),
        EntityId::new("u1"),
        payload(json!({"x": 1})),
    )));

    assert!(eventually(|| !seen.lock().is_empty()).await);
    settle().await;
    assert_eq!(*seen.lock(), vec![ChangeKind::Update]);
}

#[tokio::test(start_paused = true)]
async fn overwriting_an_optimistic_write_raises_a_conflict() {
    let (coordinator, transport) = connected(test_config()).await;
    let mut notices = coordinator.notices();
    let id = EntityId::new("u1");
    coordinator.update_cache(&umzug(), &id, &payload(json!({"status": "open"})));
    coordinator
        .stage_update(&umzug(), &id, &payload(json!({"status": "A"})))
        .unwrap();

    transport.push(ServerMessage::Update(UpdateMessage::new(
        umzug(),
        id.clone(),
        payload(json!({"status": "B"})),
    )));

    let notice = wait_for_notice(&mut notices, |n| {
        matches!(n, SyncNotice::ReconciliationConflict { .. })
    })
    .await;
    assert_eq!(
        notice,
        SyncNotice::ReconciliationConflict {
            key: EntityKey::new("umzug", "u1")
        }
    );
    let entry = coordinator.cached_entry(&umzug(), &id).unwrap();
    assert_eq!(entry.payload["status"], "B");
    assert!(!entry.pending);
}

#[tokio::test(start_paused = true)]
async fn server_wins_a_race_with_a_late_confirmation() {
    let (coordinator, transport) = connected(test_config()).await;
    let id = EntityId::new("u1");
    coordinator.update_cache(&umzug(), &id, &payload(json!({"status": "open", "version": 1})));

    coordinator
        .stage_update(&umzug(), &id, &payload(json!({"status": "A"})))
        .unwrap();
    transport.push(ServerMessage::Update(UpdateMessage::new(
        umzug(),
        id.clone(),
        payload(json!({"status": "B", "version": 3})),
    )));
    assert!(eventually(|| coordinator.cached(&umzug(), &id).unwrap()["status"] == "B").await);

    // The ack for "A" carries the version it was written at.
    coordinator.confirm_entity(
        &umzug(),
        &id,
        payload(json!({"id": "u1", "status": "A", "version": 2})),
    );

    let entry = coordinator.cached_entry(&umzug(), &id).unwrap();
    assert_eq!(entry.payload["status"], "B");
    assert_eq!(entry.version, Some(3));
    assert!(!entry.pending);
}

// ── Outbound mutations ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn online_mutation_is_acknowledged() {
    let (coordinator, transport) = connected(test_config()).await;
    transport.respond_with(|_, _| Ok(Ack::ok(Some(json!({"id": "u9", "city": "Kiel"})))));

    let ack = coordinator
        .create_entity(umzug(), payload(json!({"city": "Kiel"})), None)
        .await
        .unwrap();

    assert_eq!(ack, MutationAck::Confirmed(Some(json!({"id": "u9", "city": "Kiel"}))));
    assert_eq!(transport.sent_events(), vec!["data:create"]);
    assert_eq!(coordinator.pending_updates(), 0);
    let entry = coordinator.cached_entry(&umzug(), &EntityId::new("u9")).unwrap();
    assert_eq!(entry.payload, payload(json!({"id": "u9", "city": "Kiel"})));
    assert!(!entry.pending);
}

#[tokio::test(start_paused = true)]
async fn online_create_replaces_the_temporary_entry() {
    let (coordinator, transport) = connected(test_config()).await;
    let server = FakeServer::default();
    server.serve(&transport);
    let temp = coordinator.stage_create(&umzug(), payload(json!({"city": "Kiel"})));
    let draft = coordinator.cached(&umzug(), &temp).unwrap();

    coordinator.create_entity(umzug(), draft, None).await.unwrap();

    assert!(coordinator.cached(&umzug(), &temp).is_none());
    let entry = coordinator.cached_entry(&umzug(), &EntityId::new("srv-1")).unwrap();
    assert_eq!(entry.payload["city"], "Kiel");
    assert!(!entry.pending);
    let sent = transport.sent().into_iter().find_map(|m| match m {
        ClientMessage::Create(m) => Some(m),
        _ => None,
    });
    assert!(!sent.unwrap().entity.contains_key("id"));
}

#[tokio::test(start_paused = true)]
async fn online_delete_removes_the_cached_entity() {
    let (coordinator, _transport) = connected(test_config()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    coordinator
        .subscribe(
            umzug(),
            move |e: &ChangeEvent| sink.lock().push(e.kind()),
            SubscribeOptions::default(),
        )
        .await;
    coordinator.update_cache(&umzug(), &EntityId::new("u1"), &payload(json!({"city": "Kiel"})));

    let ack = coordinator.delete_entity(umzug(), "u1", None).await.unwrap();

    assert_eq!(ack, MutationAck::Confirmed(None));
    assert!(coordinator.cached(&umzug(), &EntityId::new("u1")).is_none());
    assert_eq!(*seen.lock(), vec![ChangeKind::Create, ChangeKind::Delete]);
}

#[tokio::test(start_paused = true)]
async fn mutation_before_init_is_refused() {
    let transport = MockTransport::new();
    let coordinator = SyncCoordinator::new(test_config(), Arc::new(transport.clone())).unwrap();

    let result = coordinator
        .update_entity(umzug(), "u1", payload(json!({"city": "Kiel"})), None)
        .await;

    assert!(matches!(result, Err(SyncError::NotInitialized)));
    assert_eq!(coordinator.pending_updates(), 0);
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn online_rejection_is_returned_not_queued() {
    let (coordinator, transport) = connected(test_config()).await;
    transport.respond_with(|_, _| Ok(Ack::failed("validation failed")));

    let result = coordinator
        .update_entity(umzug(), "u1", payload(json!({"city": ""})), None)
        .await;

    assert!(matches!(result, Err(SyncError::Rejected(_))));
    assert_eq!(coordinator.pending_updates(), 0);
}

#[tokio::test(start_paused = true)]
async fn mutation_timeout_is_honored() {
    let (coordinator, transport) = connected(test_config()).await;
    transport.set_request_delay(Some(Duration::from_secs(60)));

    let result = coordinator
        .delete_entity(umzug(), "u1", Some(Duration::from_millis(50)))
        .await;

    assert!(matches!(result, Err(SyncError::Timeout(d)) if d == Duration::from_millis(50)));
}

#[tokio::test(start_paused = true)]
async fn offline_mutations_are_queued() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;
    transport.clear_sent();

    let ack = coordinator
        .update_entity(umzug(), "u1", payload(json!({"city": "Kiel"})), None)
        .await
        .unwrap();

    assert!(ack.is_queued());
    assert_eq!(coordinator.pending_updates(), 1);
    assert_eq!(coordinator.state().pending_updates, 1);
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_racing_a_drop_is_queued() {
    let (coordinator, transport) = connected(test_config()).await;

    // The transport is gone but the adapter has not noticed yet.
    transport.drop_connection("reset");
    let ack = coordinator
        .delete_entity(umzug(), "u1", None)
        .await
        .unwrap();

    assert_eq!(ack, MutationAck::Queued);
    assert_eq!(coordinator.pending_updates(), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_writes_to_one_entity_coalesce() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;

    coordinator
        .update_entity(umzug(), "u1", payload(json!({"city": "Kiel"})), None)
        .await
        .unwrap();
    coordinator
        .update_entity(umzug(), "u1", payload(json!({"floor": 3})), None)
        .await
        .unwrap();

    let pending = coordinator.pending_snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Update);
    assert_eq!(pending[0].payload, payload(json!({"city": "Kiel", "floor": 3})));
}

#[tokio::test(start_paused = true)]
async fn queued_create_absorbs_updates_and_is_cancelled_by_delete() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;
    let temp = EntityId::temporary();

    coordinator
        .create_entity(umzug(), payload(json!({"id": temp.as_str(), "city": "Kiel"})), None)
        .await
        .unwrap();
    coordinator
        .update_entity(umzug(), temp.clone(), payload(json!({"floor": 2})), None)
        .await
        .unwrap();

    let pending = coordinator.pending_snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Create);
    assert_eq!(pending[0].payload["floor"], 2);
    assert_eq!(pending[0].payload["city"], "Kiel");

    coordinator
        .delete_entity(umzug(), temp, None)
        .await
        .unwrap();
    assert_eq!(coordinator.pending_updates(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_pending_drops_one_entry() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;
    coordinator.delete_entity(umzug(), "u1", None).await.unwrap();
    coordinator.delete_entity(umzug(), "u2", None).await.unwrap();

    let removed = coordinator.cancel_pending(&EntityKey::new("umzug", "u1"));

    assert!(removed.is_some());
    assert_eq!(coordinator.pending_updates(), 1);
    assert_eq!(coordinator.state().pending_updates, 1);
}

// ── Replay ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn offline_create_is_replayed_and_confirmed() {
    let (coordinator, transport) = connected(test_config()).await;
    let server = FakeServer::default();
    server.serve(&transport);
    go_offline(&coordinator, &transport).await;

    let temp = coordinator.stage_create(&umzug(), payload(json!({"name": "X"})));
    let entity = coordinator.cached(&umzug(), &temp).unwrap();
    let ack = coordinator.create_entity(umzug(), entity, None).await.unwrap();
    assert!(ack.is_queued());
    assert!(coordinator.cached_entry(&umzug(), &temp).unwrap().pending);
    let queued = coordinator.pending_snapshot();
    assert_eq!(queued[0].entity_id, temp);
    assert_eq!(queued[0].payload, payload(json!({"name": "X"})));

    go_online(&coordinator, &transport).await;

    let batches: Vec<_> = transport
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Batch(b) => Some(b),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].updates.len(), 1);
    assert_eq!(batches[0].updates[0].operation, Operation::Create);

    assert_eq!(coordinator.pending_updates(), 0);
    assert!(coordinator.cached(&umzug(), &temp).is_none());
    let confirmed = coordinator.cached_entry(&umzug(), &EntityId::new("srv-1")).unwrap();
    assert!(!confirmed.pending);
    assert_eq!(confirmed.payload["name"], "X");
}

#[tokio::test(start_paused = true)]
async fn replay_sends_queue_in_order_as_one_batch() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;
    coordinator.delete_entity(umzug(), "a", None).await.unwrap();
    coordinator
        .update_entity("employee", "e", payload(json!({"x": 1})), None)
        .await
        .unwrap();
    coordinator.delete_entity(umzug(), "b", None).await.unwrap();

    go_online(&coordinator, &transport).await;

    assert_eq!(count_events(&transport, "data:batch"), 1);
    let batch = transport
        .sent()
        .into_iter()
        .find_map(|m| match m {
            ClientMessage::Batch(b) => Some(b),
            _ => None,
        })
        .unwrap();
    let keys: Vec<String> = batch.updates.iter().map(|u| u.key().to_string()).collect();
    assert_eq!(keys, vec!["umzug:a", "employee:e", "umzug:b"]);
}

#[tokio::test(start_paused = true)]
async fn failed_replay_is_requeued_retried_and_escalated() {
    let (coordinator, transport) = connected(test_config()).await;
    let mut notices = coordinator.notices();
    transport.respond_with(|message, _| match message {
        ClientMessage::Batch(_) => Ok(Ack::failed("database busy")),
        _ => Ok(Ack::ok(None)),
    });
    go_offline(&coordinator, &transport).await;
    coordinator.delete_entity(umzug(), "a", None).await.unwrap();

    go_online(&coordinator, &transport).await;
    assert_eq!(coordinator.pending_updates(), 1);

    let notice = wait_for_notice(&mut notices, |n| matches!(n, SyncNotice::ReplayFailed { .. })).await;
    match notice {
        SyncNotice::ReplayFailed {
            failures,
            pending,
            error,
        } => {
            assert_eq!(failures, 2);
            assert_eq!(pending, 1);
            assert!(error.contains("database busy"));
        }
        other => panic!("unexpected notice {other:?}"),
    }

    // The server recovers; the next scheduled retry drains the queue.
    transport.respond_with(|_, _| Ok(Ack::ok(None)));
    assert!(eventually(|| coordinator.pending_updates() == 0).await);
}

#[tokio::test(start_paused = true)]
async fn edit_made_while_a_failing_replay_is_in_flight_keeps_the_create() {
    let (coordinator, transport) = connected(test_config()).await;
    transport.respond_with(|message, _| match message {
        ClientMessage::Batch(_) => Ok(Ack::failed("database busy")),
        _ => Ok(Ack::ok(None)),
    });
    go_offline(&coordinator, &transport).await;
    let temp = coordinator.stage_create(&umzug(), payload(json!({"name": "X"})));
    let draft = coordinator.cached(&umzug(), &temp).unwrap();
    coordinator.create_entity(umzug(), draft, None).await.unwrap();

    // Reconnect with a slow server, then lose the link while the batch is out.
    transport.set_request_delay(Some(Duration::from_millis(500)));
    transport.set_reachable(true);
    assert!(eventually(|| count_events(&transport, "data:batch") == 1).await);
    transport.set_reachable(false);
    transport.drop_connection("network lost");
    assert!(eventually(|| !coordinator.is_connected()).await);

    let ack = coordinator
        .update_entity(umzug(), temp.clone(), payload(json!({"name": "Y"})), None)
        .await
        .unwrap();
    assert!(ack.is_queued());

    assert!(eventually(|| {
        coordinator
            .pending_snapshot()
            .iter()
            .any(|u| u.operation == Operation::Create)
    })
    .await);
    let pending = coordinator.pending_snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Create);
    assert_eq!(pending[0].entity_id, temp);
    assert_eq!(pending[0].payload, payload(json!({"name": "Y"})));
}

#[tokio::test(start_paused = true)]
async fn replay_offline_keeps_the_queue() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;
    coordinator.delete_entity(umzug(), "a", None).await.unwrap();

    let result = coordinator.replay_pending().await;

    assert!(matches!(result, Err(SyncError::NotConnected)));
    assert_eq!(coordinator.pending_updates(), 1);
}

#[tokio::test(start_paused = true)]
async fn replay_of_empty_queue_sends_nothing() {
    let (coordinator, transport) = connected(test_config()).await;
    assert_eq!(coordinator.replay_pending().await.unwrap(), 0);
    assert_eq!(count_events(&transport, "data:batch"), 0);
}

// ── Sync ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn request_sync_replaces_the_cache() {
    let (coordinator, transport) = connected(test_config()).await;
    let server = FakeServer::default();
    server.serve(&transport);
    coordinator.update_cache(&umzug(), &EntityId::new("gone"), &payload(json!({})));
    server.seed("umzug", vec![payload(json!({"id": "a"})), payload(json!({"id": "b"}))]);

    let entities = coordinator
        .request_sync(umzug(), Default::default())
        .await
        .unwrap();

    assert_eq!(entities.len(), 2);
    assert_eq!(coordinator.cached_all(&umzug()), entities);
    let state = coordinator.state();
    assert!(state.last_sync_at.is_some());
    assert!(!state.syncing);
}

#[tokio::test(start_paused = true)]
async fn request_sync_offline_fails_fast() {
    let (coordinator, transport) = connected(test_config()).await;
    go_offline(&coordinator, &transport).await;

    let result = coordinator.sync_entity(umzug()).await;
    assert!(matches!(result, Err(SyncError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn request_sync_times_out_without_response() {
    let (coordinator, _transport) = connected(test_config()).await;

    let result = coordinator.request_sync(umzug(), Default::default()).await;

    match result {
        Err(SyncError::SyncTimeout {
            entity_type,
            waited,
        }) => {
            assert_eq!(entity_type, "umzug");
            assert_eq!(waited, Duration::from_secs(2));
        }
        other => panic!("expected sync timeout, got {other:?}"),
    }
    assert!(!coordinator.state().syncing);
}

#[tokio::test(start_paused = true)]
async fn request_sync_rejection_is_returned() {
    let (coordinator, transport) = connected(test_config()).await;
    transport.respond_with(|_, _| Ok(Ack::failed("unknown type")));

    let result = coordinator.request_sync(umzug(), Default::default()).await;
    assert!(matches!(result, Err(SyncError::Rejected(_))));
}

#[tokio::test(start_paused = true)]
async fn sync_all_covers_every_subscribed_type() {
    let (coordinator, transport) = connected(test_config()).await;
    let server = FakeServer::default();
    server.seed("umzug", vec![payload(json!({"id": "u"}))]);
    server.seed("employee", vec![payload(json!({"id": "e1"})), payload(json!({"id": "e2"}))]);
    server.serve(&transport);
    coordinator
        .subscribe(umzug(), noop, SubscribeOptions::default())
        .await;
    coordinator
        .subscribe("employee", noop, SubscribeOptions::default())
        .await;

    let mut results: Vec<(String, usize)> = coordinator
        .sync_all()
        .await
        .into_iter()
        .map(|(t, r)| (t.to_string(), r.unwrap()))
        .collect();
    results.sort();

    assert_eq!(results, vec![("employee".to_string(), 2), ("umzug".to_string(), 1)]);
}

// ── Cache access ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn update_cache_writes_through_and_notifies() {
    let (coordinator, _transport) = connected(test_config()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    coordinator
        .subscribe(
            umzug(),
            move |event: &ChangeEvent| log.lock().push(event.kind()),
            SubscribeOptions::default(),
        )
        .await;
    let id = EntityId::new("u1");

    coordinator.update_cache(&umzug(), &id, &payload(json!({"a": 1})));
    coordinator.update_cache(&umzug(), &id, &payload(json!({"b": 2})));

    assert_eq!(
        coordinator.cached(&umzug(), &id).unwrap(),
        payload(json!({"id": "u1", "a": 1, "b": 2}))
    );
    assert_eq!(*seen.lock(), vec![ChangeKind::Create, ChangeKind::Update]);
}

#[tokio::test(start_paused = true)]
async fn stage_update_of_unknown_entity_is_not_found() {
    let (coordinator, _transport) = connected(test_config()).await;
    let result = coordinator.stage_update(&umzug(), &EntityId::new("nope"), &payload(json!({})));
    assert!(matches!(result, Err(SyncError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn state_is_observable() {
    let (coordinator, transport) = connected(test_config()).await;
    let mut watch = coordinator.watch_state();
    watch.mark_unchanged();

    go_offline(&coordinator, &transport).await;

    assert!(watch.has_changed().unwrap());
    assert!(!watch.borrow_and_update().connected);
}
