use std::sync::Arc;

use muster::core::MusterError;
use muster::core::fsm::Fsm;
use muster::core::store::{Store, snapshot};
use muster::core::types::{Intention, IntentionAction, Node, Request, Service, Session};

fn populated_fsm() -> Fsm {
    let fsm = Fsm::new(Arc::new(Store::new()));
    fsm.apply(
        3,
        &Request::RegisterNode {
            node: Node {
                id: "n1".to_string(),
                name: "node-1".to_string(),
                address: "10.0.0.1".to_string(),
                datacenter: "dc1".to_string(),
                ..Default::default()
            },
            service: Some(Service {
                id: "web-1".to_string(),
                name: "web".to_string(),
                port: 8080,
                ..Default::default()
            }),
            checks: Vec::new(),
        },
    )
    .unwrap();
    fsm.apply(
        5,
        &Request::SessionCreate {
            session: Session {
                id: "s1".to_string(),
                node_id: "n1".to_string(),
                name: "locker".to_string(),
                ttl: Some(std::time::Duration::from_secs(15)),
                ..Default::default()
            },
        },
    )
    .unwrap();
    fsm.apply(
        9,
        &Request::IntentionApply {
            intention: Intention {
                id: "i1".to_string(),
                source: "web".to_string(),
                destination: "db".to_string(),
                action: IntentionAction::Allow,
                precedence: 9,
                description: String::new(),
                create_idx: 0,
                modify_idx: 0,
            },
        },
    )
    .unwrap();
    fsm
}

#[test]
fn test_snapshot_restore_round_trip() {
    let fsm = populated_fsm();
    let bytes = fsm.snapshot().unwrap();

    let restored = Fsm::new(Arc::new(Store::new()));
    restored.restore(&bytes).unwrap();

    // Byte-identical after a second snapshot: the round trip lost nothing.
    assert_eq!(restored.snapshot().unwrap(), bytes);
    assert_eq!(restored.last_applied(), fsm.last_applied());

    // Per-table max_index values are reproduced exactly, gaps included.
    let original = fsm.store().read_txn();
    let round_tripped = restored.store().read_txn();
    assert_eq!(
        original.tables().sessions.max_index(),
        round_tripped.tables().sessions.max_index()
    );
    assert_eq!(round_tripped.tables().sessions.max_index(), 5);
    assert_eq!(round_tripped.tables().intentions.max_index(), 9);
    assert_eq!(round_tripped.last_index(), 9);
}

#[test]
fn test_restore_continues_accepting_writes() {
    let fsm = populated_fsm();
    let bytes = fsm.snapshot().unwrap();

    let restored = Fsm::new(Arc::new(Store::new()));
    restored.restore(&bytes).unwrap();

    // Indexes below the snapshot are replay duplicates; above it applies.
    restored
        .apply(
            9,
            &Request::KvDelete {
                key: "ignored".to_string(),
            },
        )
        .unwrap();
    assert_eq!(restored.store().read_txn().tables().kv.max_index(), 0);
    restored
        .apply(
            10,
            &Request::KvSet {
                key: "after/restore".to_string(),
                value: bytes::Bytes::from_static(b"1"),
                flags: 0,
                acquire_session: None,
                release_session: None,
            },
        )
        .unwrap();
    assert_eq!(restored.store().last_index(), 10);
}

#[test]
fn test_corrupt_snapshot_is_rejected() {
    let fsm = populated_fsm();
    let mut bytes = fsm.snapshot().unwrap();

    // Flip one payload byte; the checksum must catch it.
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    let err = snapshot::deserialize(&bytes).unwrap_err();
    assert!(matches!(err, MusterError::SnapshotCorrupt(_)));
}

#[test]
fn test_truncated_snapshot_is_rejected() {
    let fsm = populated_fsm();
    let bytes = fsm.snapshot().unwrap();
    let err = snapshot::deserialize(&bytes[..bytes.len() / 2]).unwrap_err();
    assert!(matches!(err, MusterError::SnapshotCorrupt(_)));
}

#[test]
fn test_empty_store_round_trips() {
    let store = Store::new();
    let bytes = snapshot::serialize(store.read_txn().tables()).unwrap();
    let tables = snapshot::deserialize(&bytes).unwrap();
    assert_eq!(tables.last_index, 0);
    assert!(tables.nodes.is_empty());
}
