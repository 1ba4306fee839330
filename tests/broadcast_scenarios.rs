use std::{sync::Arc, time::Duration};

use shawazi::{
    broadcast::{BroadcastEngine, LocalRelay},
    rooms::{ConnectionHandle, ConnectionSession, InboundFrame, Outbound, OutboundFrame, RoomEvent, RoomName, RoomRegistry},
    store::{MemoryStore, MessageStore, RoomStore, SqliteStore, Store},
    ChatError,
};
use tokio::sync::mpsc;

fn general() -> RoomName {
    RoomName::parse("general").unwrap()
}

fn engine(store: Arc<dyn Store>) -> Arc<BroadcastEngine> {
    Arc::new(BroadcastEngine::new(store, Arc::new(RoomRegistry::new()), Arc::new(LocalRelay::default())))
}

async fn connect(engine: &Arc<BroadcastEngine>, user: &str) -> (ConnectionSession, mpsc::Receiver<RoomEvent>) {
    let (handle, rx) = ConnectionHandle::new(user, 64);
    let mut session = ConnectionSession::new(engine.clone(), handle);
    session.connect("general").await.unwrap();
    (session, rx)
}

fn say(text: &str) -> InboundFrame {
    InboundFrame {
        message: text.into(),
        user: None,
        room: Some("general".into()),
    }
}

fn drain(rx: &mut mpsc::Receiver<RoomEvent>) -> Vec<i64> {
    let mut ids = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RoomEvent::Message(message) = event {
            ids.push(message.id);
        }
    }
    ids
}

#[tokio::test]
async fn general_room_fan_out_and_late_joiner() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = engine(store.clone());

    let (mut a, mut rx_a) = connect(&engine, "A").await;
    let (mut b, mut rx_b) = connect(&engine, "B").await;

    let sent = a.receive(say("hi")).await.unwrap();

    let stored = store.list(&general(), None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!((stored[0].user.as_str(), stored[0].content.as_str()), ("A", "hi"));

    let expected = Some(Outbound::Send(OutboundFrame::Chat { message: "hi".into(), user: "A".into() }));
    let event = rx_a.recv().await.unwrap();
    assert_eq!(a.on_event(event), expected);
    let event = rx_b.recv().await.unwrap();
    assert_eq!(b.on_event(event), expected);

    let (_c, mut rx_c) = connect(&engine, "C").await;
    assert!(rx_c.try_recv().is_err());
    assert_eq!(store.list(&general(), None).await.unwrap(), vec![sent]);
}

#[tokio::test]
async fn repeated_submits_are_monotonic() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = engine(store.clone());
    let (mut a, _rx) = connect(&engine, "A").await;

    let mut previous = None;
    for i in 0..20 {
        let message = a.receive(say(&format!("message {i}"))).await.unwrap();
        if let Some((id, timestamp)) = previous {
            assert!(message.id > id);
            assert!(message.timestamp >= timestamp);
        }
        previous = Some((message.id, message.timestamp));
    }

    let listed = store.list(&general(), None).await.unwrap();
    assert_eq!(listed.len(), 20);
    assert_eq!(listed, store.list(&general(), None).await.unwrap());
}

#[tokio::test]
async fn empty_message_has_zero_side_effects() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let (mut a, mut rx_a) = connect(&engine, "A").await;

    let err = a.receive(say("")).await.unwrap_err();
    assert!(matches!(err, ChatError::EmptyMessage));
    assert_eq!(store.message_count().await, 0);
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn storage_outage_delivers_to_nobody() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let (mut a, mut rx_a) = connect(&engine, "A").await;
    let (_b, mut rx_b) = connect(&engine, "B").await;

    store.set_available(false);
    let err = a.receive(say("hi")).await.unwrap_err();
    assert!(matches!(err, ChatError::StorageUnavailable(_)));
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn disconnected_connections_get_nothing() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store);
    let (mut a, _rx_a) = connect(&engine, "A").await;
    let (mut b, mut rx_b) = connect(&engine, "B").await;

    b.disconnect().await;
    assert_eq!(engine.registry().members(&general()).await, vec![a.handle().clone()]);

    a.receive(say("anyone?")).await.unwrap();
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_submits_arrive_in_persisted_order() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = engine(store.clone());
    let (_a, mut rx_a) = connect(&engine, "A").await;
    let (_b, mut rx_b) = connect(&engine, "B").await;

    let mut tasks = Vec::new();
    for i in 0..24 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.submit(&general(), &format!("user{}", i % 3), &format!("m{i}")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let persisted: Vec<i64> = store.list(&general(), None).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(persisted.len(), 24);
    assert_eq!(drain(&mut rx_a), persisted);
    assert_eq!(drain(&mut rx_b), persisted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joins_racing_a_broadcast_get_each_message_once() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.ensure_room(&general()).await.unwrap();
    let engine = engine(store.clone());

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..40 {
                engine.submit(&general(), "writer", &format!("m{i}")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let joiners: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..i {
                    tokio::task::yield_now().await;
                }
                connect(&engine, &format!("reader{i}")).await
            })
        })
        .collect();

    writer.await.unwrap();
    let mut readers = Vec::new();
    for joiner in joiners {
        readers.push(joiner.await.unwrap());
    }

    let persisted: Vec<i64> = store.list(&general(), None).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(persisted.len(), 40);

    for (_session, rx) in &mut readers {
        let seen = drain(rx);
        let Some(first) = seen.first() else { continue };
        let start = persisted.iter().position(|id| id == first).unwrap();
        // everything from the first delivery onwards, once each and in order
        assert_eq!(seen, persisted[start..].to_vec());
    }
}

#[tokio::test]
async fn rooms_spanning_two_instances() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let bus = LocalRelay::default();
    let east = Arc::new(BroadcastEngine::new(store.clone(), Arc::new(RoomRegistry::new()), Arc::new(bus.clone())));
    let west = Arc::new(BroadcastEngine::new(store.clone(), Arc::new(RoomRegistry::new()), Arc::new(bus)));
    east.spawn_relay_listener();
    west.spawn_relay_listener();

    let (mut a, mut rx_a) = connect(&east, "A").await;
    let (mut b, mut rx_b) = connect(&west, "B").await;

    let sent = a.receive(say("hello west")).await.unwrap();

    let local = rx_a.recv().await.unwrap();
    assert!(matches!(a.on_event(local), Some(Outbound::Send(_))));

    let remote = tokio::time::timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
    assert_eq!(remote, RoomEvent::Message(sent));
    assert_eq!(
        b.on_event(remote),
        Some(Outbound::Send(OutboundFrame::Chat { message: "hello west".into(), user: "A".into() }))
    );
}
