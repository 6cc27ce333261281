use std::sync::Arc;
use std::time::Duration;

use muster::core::MusterError;
use muster::core::events::{
    AllowAll, CatalogOp, DenyAll, EventPayload, EventPublisher, SubState, Topic,
};
use muster::core::fsm::Fsm;
use muster::core::store::Store;
use muster::core::types::{Node, NodeStatus, Request, Service};

fn wired() -> (Arc<Store>, Arc<EventPublisher>, Fsm) {
    let store = Arc::new(Store::new());
    let publisher = Arc::new(EventPublisher::new());
    store.set_commit_sink(publisher.clone());
    let fsm = Fsm::new(store.clone());
    (store, publisher, fsm)
}

fn register_web(node: &str, addr: &str) -> Request {
    Request::RegisterNode {
        node: Node {
            id: node.to_string(),
            name: node.to_string(),
            address: addr.to_string(),
            datacenter: "dc1".to_string(),
            status: NodeStatus::Alive,
            ..Default::default()
        },
        service: Some(Service {
            id: "svc-web".to_string(),
            name: "svc-web".to_string(),
            address: addr.to_string(),
            port: 80,
            ..Default::default()
        }),
        checks: Vec::new(),
    }
}

#[tokio::test]
async fn test_fresh_subscription_gets_snapshot_then_end_of_snapshot() {
    let (store, publisher, fsm) = wired();
    fsm.apply(1, &register_web("node-a", "10.0.0.1")).unwrap();

    let read = store.read_txn();
    let mut sub = publisher.subscribe(
        Topic::ServiceHealth,
        "svc-web",
        0,
        read.tables(),
        Arc::new(AllowAll::default()),
    );
    drop(read);

    let first = sub.next().await.unwrap();
    match &first.payload {
        EventPayload::ServiceHealth { op, value } => {
            assert_eq!(*op, CatalogOp::Register);
            assert_eq!(value.node.name, "node-a");
            assert_eq!(value.service.id, "svc-web");
        }
        other => panic!("expected service health payload, got {other:?}"),
    }

    let second = sub.next().await.unwrap();
    assert!(second.is_end_of_snapshot());
    assert_eq!(sub.state(), SubState::Live);

    // Exactly one EndOfSnapshot: the stream then blocks for live events.
    let timeout = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
    assert!(timeout.is_err(), "no further events expected");
}

#[tokio::test]
async fn test_deregistration_is_delivered_live() {
    let (store, publisher, fsm) = wired();
    fsm.apply(1, &register_web("node-a", "10.0.0.1")).unwrap();

    let read = store.read_txn();
    let mut sub = publisher.subscribe(
        Topic::ServiceHealth,
        "svc-web",
        0,
        read.tables(),
        Arc::new(AllowAll::default()),
    );
    drop(read);
    sub.next().await.unwrap();
    assert!(sub.next().await.unwrap().is_end_of_snapshot());

    fsm.apply(
        2,
        &Request::DeregisterService {
            node_id: "node-a".to_string(),
            service_id: "svc-web".to_string(),
        },
    )
    .unwrap();

    let event = sub.next().await.unwrap();
    assert_eq!(event.index, 2);
    match &event.payload {
        EventPayload::ServiceHealth { op, value } => {
            assert_eq!(*op, CatalogOp::Deregister);
            assert_eq!(value.service.id, "svc-web");
        }
        other => panic!("expected deregister payload, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delivery_is_strictly_index_ordered() {
    let (store, publisher, fsm) = wired();
    fsm.apply(1, &register_web("node-a", "10.0.0.1")).unwrap();

    let read = store.read_txn();
    let mut sub = publisher.subscribe(
        Topic::ServiceHealth,
        "svc-web",
        0,
        read.tables(),
        Arc::new(AllowAll::default()),
    );
    drop(read);
    sub.next().await.unwrap();
    sub.next().await.unwrap(); // EndOfSnapshot

    for i in 2..=6u64 {
        let mut node = register_web("node-a", "10.0.0.1");
        if let Request::RegisterNode { service, .. } = &mut node {
            // Vary the port so every write is a real change.
            service.as_mut().unwrap().port = 8000 + i as u16;
        }
        fsm.apply(i, &node).unwrap();
    }

    let mut last = 1u64;
    for _ in 0..5 {
        let event = sub.next().await.unwrap();
        assert!(event.index > last, "indexes must strictly increase");
        last = event.index;
    }
    assert_eq!(last, 6);
}

#[tokio::test]
async fn test_replay_from_known_index_skips_snapshot() {
    let (store, publisher, fsm) = wired();
    fsm.apply(1, &register_web("node-a", "10.0.0.1")).unwrap();
    fsm.apply(2, &register_web("node-b", "10.0.0.2")).unwrap();

    let read = store.read_txn();
    let mut sub = publisher.subscribe(
        Topic::ServiceHealth,
        "svc-web",
        1,
        read.tables(),
        Arc::new(AllowAll::default()),
    );
    drop(read);
    assert_eq!(sub.state(), SubState::Live);

    let event = sub.next().await.unwrap();
    assert_eq!(event.index, 2);
    assert!(!event.is_end_of_snapshot());
}

#[tokio::test]
async fn test_token_invalidation_force_closes() {
    let (store, publisher, fsm) = wired();
    fsm.apply(1, &register_web("node-a", "10.0.0.1")).unwrap();

    let read = store.read_txn();
    let mut sub = publisher.subscribe(
        Topic::ServiceHealth,
        "svc-web",
        0,
        read.tables(),
        Arc::new(AllowAll::with_token("token-t")),
    );
    drop(read);
    sub.next().await.unwrap();
    sub.next().await.unwrap();

    publisher.invalidate_token("token-t");
    let err = sub.next().await.unwrap_err();
    assert_eq!(err, MusterError::SubscriptionReset);
    assert_eq!(sub.state(), SubState::ForceClosed);

    // Re-subscribing with a now-denied token yields an empty snapshot followed
    // by exactly one EndOfSnapshot.
    let read = store.read_txn();
    let mut resub = publisher.subscribe(
        Topic::ServiceHealth,
        "svc-web",
        0,
        read.tables(),
        Arc::new(DenyAll::with_token("token-t")),
    );
    drop(read);
    let first = resub.next().await.unwrap();
    assert!(first.is_end_of_snapshot(), "denied events are filtered out");
}

#[tokio::test]
async fn test_config_entry_changes_reach_their_topic() {
    let (store, publisher, fsm) = wired();

    let read = store.read_txn();
    let mut sub = publisher.subscribe(
        Topic::ServiceResolver,
        "web",
        0,
        read.tables(),
        Arc::new(AllowAll::default()),
    );
    drop(read);
    assert!(sub.next().await.unwrap().is_end_of_snapshot(), "empty snapshot");

    fsm.apply(
        1,
        &Request::ConfigEntryApply {
            entry: muster::core::types::ConfigEntry {
                kind: "service-resolver".to_string(),
                name: "web".to_string(),
                content: serde_json::json!({"default_subset": "v2"}),
                create_idx: 0,
                modify_idx: 0,
            },
        },
    )
    .unwrap();

    let event = sub.next().await.unwrap();
    assert_eq!(event.topic, Topic::ServiceResolver);
    assert_eq!(event.key, "web");
    match &event.payload {
        EventPayload::ConfigEntry { op, entry } => {
            assert_eq!(*op, CatalogOp::Register);
            assert_eq!(entry.content["default_subset"], "v2");
        }
        other => panic!("expected config entry payload, got {other:?}"),
    }

    // Deleting the entry produces a deregister event on the same topic.
    fsm.apply(
        2,
        &Request::ConfigEntryDelete {
            kind: "service-resolver".to_string(),
            name: "web".to_string(),
        },
    )
    .unwrap();
    let event = sub.next().await.unwrap();
    assert!(matches!(
        event.payload,
        EventPayload::ConfigEntry {
            op: CatalogOp::Deregister,
            ..
        }
    ));
}

#[tokio::test]
async fn test_snapshot_build_is_single_flighted() {
    let (store, publisher, fsm) = wired();
    fsm.apply(1, &register_web("node-a", "10.0.0.1")).unwrap();

    // Many concurrent subscribers for the same key share one snapshot build
    // and all observe the same initial sequence.
    let mut subs = Vec::new();
    let read = store.read_txn();
    for _ in 0..16 {
        subs.push(publisher.subscribe(
            Topic::ServiceHealth,
            "svc-web",
            0,
            read.tables(),
            Arc::new(AllowAll::default()),
        ));
    }
    drop(read);

    for sub in &mut subs {
        let first = sub.next().await.unwrap();
        assert!(matches!(first.payload, EventPayload::ServiceHealth { .. }));
        assert!(sub.next().await.unwrap().is_end_of_snapshot());
    }
}
