//! End-to-end behavior of the sync engine across devices, driven through
//! in-memory transports.

use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use marksync::auth::{TokenEntry, TokenStore};
use marksync::bus::LocalBus;
use marksync::db::{init_db, DeltaStore, DeviceRegistry, OfflineQueue};
use marksync::error::ErrorCode;
use marksync::models::{apply_operation, DeviceIdentity, EntityType, Operation};
use marksync::sync::{
    ChangeRequest, ChannelPeer, ChannelTransport, ClientMessage, ConflictResolver, ServerMessage,
    SyncEngine, SyncSession,
};

fn alice_tokens() -> TokenStore {
    TokenStore::from_entries([TokenEntry {
        token: "alice-token".into(),
        user_id: "alice".into(),
        device_id: None,
        expires_at: None,
    }])
}

fn engine_on(pool: &sqlx::SqlitePool, instance_id: &str, registry: DeviceRegistry) -> SyncEngine {
    SyncEngine::new(
        DeltaStore::new(pool.clone(), instance_id, 50),
        registry,
        OfflineQueue::new(pool.clone()),
        Arc::new(LocalBus::new(256)),
        Arc::new(alice_tokens()),
    )
}

async fn setup() -> (Arc<SyncEngine>, TempDir) {
    let temp = TempDir::new().unwrap();
    let pool = init_db(&temp.path().join("sync.db")).await.unwrap();
    let engine = engine_on(&pool, "node-a", DeviceRegistry::new(pool.clone()));
    (Arc::new(engine), temp)
}

fn device(name: &str) -> DeviceIdentity {
    DeviceIdentity {
        user_id: "alice".into(),
        device_id: name.into(),
    }
}

fn change(id: &str, operation: Operation, payload: Value, base: i64) -> ChangeRequest {
    ChangeRequest {
        change_id: None,
        entity_type: EntityType::Bookmark,
        entity_id: id.into(),
        operation,
        payload,
        client_timestamp: None,
        base_cursor: base,
    }
}

/// Registers a device and leaves it offline.
async fn register_offline(engine: &SyncEngine, identity: &DeviceIdentity) {
    engine.open_device(identity).await.unwrap();
    engine.close_device(identity).await;
}

async fn next(peer: &mut ChannelPeer) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), peer.incoming.recv())
        .await
        .expect("no frame from server")
        .expect("server hung up")
}

async fn connect(engine: &Arc<SyncEngine>, name: &str) -> ChannelPeer {
    let (transport, mut peer) = ChannelTransport::pair(256);
    tokio::spawn(SyncSession::new(engine.clone(), transport).run());

    peer.outgoing
        .send(ClientMessage::Auth {
            token: "alice-token".into(),
        })
        .await
        .unwrap();
    peer.outgoing
        .send(ClientMessage::Hello {
            device_id: name.into(),
            last_cursor: 0,
        })
        .await
        .unwrap();
    assert!(matches!(next(&mut peer).await, ServerMessage::Welcome { .. }));
    peer
}

type EntityState = BTreeMap<(EntityType, String), Value>;

fn apply(state: &mut EntityState, entity_type: EntityType, id: &str, op: Operation, payload: &Value) {
    let key = (entity_type, id.to_string());
    if let Some(snapshot) = apply_operation(state.remove(&key), op, payload) {
        state.insert(key, snapshot);
    }
}

async fn persisted_state(engine: &SyncEngine) -> EntityState {
    engine
        .store()
        .entity_heads("alice")
        .await
        .unwrap()
        .into_iter()
        .filter_map(|head| head.snapshot.map(|s| ((head.entity_type, head.entity_id), s)))
        .collect()
}

#[tokio::test]
async fn test_offline_device_receives_create_after_reconnect() {
    let (engine, _temp) = setup().await;
    let laptop = device("laptop");
    let phone = device("phone");

    register_offline(&engine, &phone).await;
    engine.open_device(&laptop).await.unwrap();

    let created = engine
        .submit_change(
            &laptop,
            change("42", Operation::Create, json!({"url": "https://rust-lang.org"}), 0),
        )
        .await
        .unwrap();

    let drained = engine.queue().drain(&phone).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].event_id, created.event_id);
    assert_eq!(drained[0].entity_id, "42");
    assert_eq!(drained[0].operation, Operation::Create);

    assert!(engine
        .queue()
        .acknowledge(&phone, created.event_id)
        .await
        .unwrap());
    assert!(engine.queue().drain(&phone).await.unwrap().is_empty());
}

fn leased_engine(pool: &sqlx::SqlitePool, instance_id: &str, lease: ChronoDuration) -> SyncEngine {
    engine_on(
        pool,
        instance_id,
        DeviceRegistry::new(pool.clone()).with_lease(lease),
    )
}

#[tokio::test]
async fn test_device_left_connected_by_crashed_instance_gets_queued_events() {
    let temp = TempDir::new().unwrap();
    let pool = init_db(&temp.path().join("crash.db")).await.unwrap();
    let lease = ChronoDuration::milliseconds(100);
    let laptop = device("laptop");
    let phone = device("phone");

    // The phone's session dies with its instance; close_device never runs.
    let crashed = leased_engine(&pool, "random-id-1", lease);
    crashed.open_device(&phone).await.unwrap();
    drop(crashed);

    let engine = leased_engine(&pool, "random-id-2", lease);
    assert_eq!(
        engine.registry().release_instance("random-id-2").await.unwrap(),
        0
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    engine.open_device(&laptop).await.unwrap();
    let created = engine
        .submit_change(
            &laptop,
            change("42", Operation::Create, json!({"url": "https://rust-lang.org"}), 0),
        )
        .await
        .unwrap();

    let drained = engine.queue().drain(&phone).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].event_id, created.event_id);
    assert_eq!(drained[0].entity_id, "42");
}

#[tokio::test]
async fn test_streaming_session_keeps_device_lease() {
    let temp = TempDir::new().unwrap();
    let pool = init_db(&temp.path().join("lease.db")).await.unwrap();
    let engine = Arc::new(leased_engine(
        &pool,
        "node-a",
        ChronoDuration::milliseconds(150),
    ));
    let laptop = device("laptop");
    let phone = device("phone");

    let mut phone_peer = connect(&engine, "phone").await;
    // Several lease periods pass while the phone stays connected.
    tokio::time::sleep(Duration::from_millis(450)).await;

    engine.open_device(&laptop).await.unwrap();
    let created = engine
        .submit_change(&laptop, change("9", Operation::Create, json!({"url": "u"}), 0))
        .await
        .unwrap();

    match next(&mut phone_peer).await {
        ServerMessage::Delta { event_id, .. } => assert_eq!(event_id, created.event_id),
        other => panic!("expected DELTA, got {:?}", other),
    }
    assert!(engine.queue().drain(&phone).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_later_concurrent_update_wins() {
    let (engine, _temp) = setup().await;
    let a = device("a");
    let b = device("b");

    engine
        .submit_change(&a, change("7", Operation::Create, json!({"title": "Old", "url": "u"}), 0))
        .await
        .unwrap();

    // Both devices saw event 1 and edit concurrently; B's edit lands later.
    let first = engine
        .submit_change(&a, change("7", Operation::Update, json!({"title": "From A"}), 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = engine
        .submit_change(&b, change("7", Operation::Update, json!({"title": "From B"}), 1))
        .await
        .unwrap();
    assert!(first.server_timestamp < second.server_timestamp);

    let head = engine
        .store()
        .entity_head("alice", EntityType::Bookmark, "7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.snapshot, Some(json!({"title": "From B", "url": "u"})));

    let log = engine.store().collect_since("alice", 0).await.unwrap();
    let ids: Vec<i64> = log.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(log[1].originating_device_id, "a");
    assert_eq!(log[2].originating_device_id, "b");
}

#[tokio::test]
async fn test_far_behind_update_is_stale() {
    let (engine, _temp) = setup().await;
    let a = device("a");
    let b = device("b");

    engine
        .submit_change(&a, change("7", Operation::Create, json!({"title": "Old"}), 0))
        .await
        .unwrap();
    engine
        .submit_change(&a, change("7", Operation::Update, json!({"title": "A"}), 1))
        .await
        .unwrap();

    // No tolerated lag: any overlapping update must resync first.
    let strict = SyncEngine::new(
        engine.store().clone(),
        engine.registry().clone(),
        engine.queue().clone(),
        Arc::new(LocalBus::new(16)),
        Arc::new(TokenStore::default()),
    )
    .with_resolver(ConflictResolver::new(0));

    let err = strict
        .submit_change(&b, change("7", Operation::Update, json!({"title": "B"}), 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StaleCursor);
    assert_eq!(engine.store().max_cursor("alice").await.unwrap(), 2);
}

#[tokio::test]
async fn test_delete_beats_concurrent_update() {
    let (engine, _temp) = setup().await;
    let a = device("a");
    let b = device("b");

    for id in ["x", "y"] {
        engine
            .submit_change(&a, change(id, Operation::Create, json!({"title": id}), 0))
            .await
            .unwrap();
    }
    let base = 2;

    // Delete first, then the concurrent update.
    engine
        .submit_change(&a, change("x", Operation::Delete, Value::Null, base))
        .await
        .unwrap();
    let err = engine
        .submit_change(&b, change("x", Operation::Update, json!({"title": "late"}), base))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConflictDeleteWins);

    // Update first, then the concurrent delete.
    engine
        .submit_change(&b, change("y", Operation::Update, json!({"title": "edit"}), base))
        .await
        .unwrap();
    engine
        .submit_change(&a, change("y", Operation::Delete, Value::Null, base))
        .await
        .unwrap();

    for id in ["x", "y"] {
        let head = engine
            .store()
            .entity_head("alice", EntityType::Bookmark, id)
            .await
            .unwrap()
            .unwrap();
        assert!(head.deleted, "{} should be deleted", id);
        assert!(head.snapshot.is_none());
    }
}

#[tokio::test]
async fn test_concurrent_submits_never_share_an_id() {
    let (engine, _temp) = setup().await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let identity = device(&format!("d{}", i % 4));
            engine
                .submit_change(
                    &identity,
                    change(&format!("b{}", i), Operation::Create, json!({"n": i}), 0),
                )
                .await
                .unwrap()
                .event_id
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<i64>>());
    assert_eq!(engine.store().max_cursor("alice").await.unwrap(), 20);
}

#[tokio::test]
async fn test_log_replay_reproduces_entity_state() {
    let (engine, _temp) = setup().await;
    let a = device("a");

    let steps = [
        ("1", Operation::Create, json!({"url": "a", "title": "A", "tags": ["x"]})),
        ("2", Operation::Create, json!({"url": "b"})),
        ("1", Operation::Update, json!({"title": null, "tags": ["x", "y"]})),
        ("2", Operation::Delete, Value::Null),
        ("3", Operation::Create, json!({"url": "c"})),
        ("2", Operation::Create, json!({"url": "b2"})),
    ];
    for (cursor, (id, op, payload)) in steps.into_iter().enumerate() {
        engine
            .submit_change(&a, change(id, op, payload, cursor as i64))
            .await
            .unwrap();
    }

    let mut replayed = EntityState::new();
    for event in engine.store().collect_since("alice", 0).await.unwrap() {
        apply(
            &mut replayed,
            event.entity_type,
            &event.entity_id,
            event.operation,
            &event.payload,
        );
    }

    assert_eq!(replayed, persisted_state(&engine).await);
    assert_eq!(
        replayed.get(&(EntityType::Bookmark, "1".to_string())),
        Some(&json!({"url": "a", "tags": ["x", "y"]}))
    );
}

#[tokio::test]
async fn test_connected_devices_converge() {
    let (engine, _temp) = setup().await;
    let names = ["laptop", "phone", "tablet"];

    let mut peers = Vec::new();
    for name in names {
        peers.push(connect(&engine, name).await);
    }

    // Every device creates its own bookmarks; ids never collide.
    for (d, peer) in peers.iter().enumerate() {
        for n in 0..4 {
            let id = format!("{}-{}", names[d], n);
            peer.outgoing
                .send(ClientMessage::Change(change(
                    &id,
                    Operation::Create,
                    json!({"url": format!("https://example.com/{}", id)}),
                    0,
                )))
                .await
                .unwrap();
        }
    }
    let total = (names.len() * 4) as i64;

    let mut states = Vec::new();
    for peer in peers.iter_mut() {
        let mut state = EntityState::new();
        let mut last = 0;
        while last < total {
            if let ServerMessage::Delta {
                event_id,
                entity_type,
                entity_id,
                operation,
                payload,
                ..
            } = next(peer).await
            {
                assert_eq!(event_id, last + 1, "deltas must arrive in order");
                apply(&mut state, entity_type, &entity_id, operation, &payload);
                last = event_id;
            }
        }
        states.push(state);
    }

    let persisted = persisted_state(&engine).await;
    assert_eq!(persisted.len(), total as usize);
    for state in states {
        assert_eq!(state, persisted);
    }
}

#[tokio::test]
async fn test_reconnect_resumes_from_cursor() {
    let (engine, _temp) = setup().await;
    let writer = device("writer");

    for i in 0..5 {
        engine
            .submit_change(&writer, change(&i.to_string(), Operation::Create, json!({}), i))
            .await
            .unwrap();
    }

    let (transport, mut peer) = ChannelTransport::pair(64);
    let session = tokio::spawn(SyncSession::new(engine.clone(), transport).run());
    peer.outgoing
        .send(ClientMessage::Auth {
            token: "alice-token".into(),
        })
        .await
        .unwrap();
    peer.outgoing
        .send(ClientMessage::Hello {
            device_id: "reader".into(),
            last_cursor: 3,
        })
        .await
        .unwrap();

    assert_eq!(next(&mut peer).await, ServerMessage::Welcome { max_cursor: 5 });
    let mut ids = Vec::new();
    for _ in 0..2 {
        if let ServerMessage::Delta { event_id, .. } = next(&mut peer).await {
            ids.push(event_id);
        }
    }
    assert_eq!(ids, vec![4, 5]);

    drop(peer);
    let outcome = session.await.unwrap();
    assert_eq!(outcome.last_sent, 5);

    let reader = engine.registry().get(&device("reader")).await.unwrap().unwrap();
    // Nothing was acknowledged beyond the presented cursor.
    assert_eq!(reader.last_cursor, 3);
    assert!(reader.last_seen_at > chrono::Utc::now() - ChronoDuration::minutes(1));
}
