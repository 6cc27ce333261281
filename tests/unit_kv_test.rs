use bytes::Bytes;
use muster::core::MusterError;
use muster::core::store::Store;
use muster::core::types::{Node, Session, SessionBehavior};

fn store_with_node() -> Store {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(Node {
        id: "n1".to_string(),
        name: "node-1".to_string(),
        address: "10.0.0.1".to_string(),
        datacenter: "dc1".to_string(),
        ..Default::default()
    })
    .unwrap();
    txn.commit();
    store
}

#[test]
fn test_kv_set_and_get() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    txn.kv_set("app/config".to_string(), Bytes::from_static(b"v1"), 0, None, None)
        .unwrap();
    txn.commit();

    let read = store.read_txn();
    let (idx, entry) = read.kv_get("app/config", None);
    assert_eq!(idx, 2);
    assert_eq!(entry.unwrap().value, Bytes::from_static(b"v1"));
}

#[test]
fn test_kv_cas_succeeds_only_at_expected_index() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    txn.kv_set("lock".to_string(), Bytes::from_static(b"a"), 0, None, None)
        .unwrap();
    txn.commit();

    // Wrong expected index: conflict.
    let mut txn = store.write_txn(3).unwrap();
    let err = txn
        .kv_cas("lock".to_string(), Bytes::from_static(b"b"), 0, 99)
        .unwrap_err();
    assert!(matches!(err, MusterError::Conflict(_)));
    drop(txn);

    // Matching expected index: applies.
    let mut txn = store.write_txn(3).unwrap();
    txn.kv_cas("lock".to_string(), Bytes::from_static(b"b"), 0, 2)
        .unwrap();
    txn.commit();
    let (_, entry) = store.read_txn().kv_get("lock", None);
    assert_eq!(entry.unwrap().value, Bytes::from_static(b"b"));
}

#[test]
fn test_kv_cas_zero_means_must_not_exist() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    txn.kv_cas("fresh".to_string(), Bytes::from_static(b"x"), 0, 0)
        .unwrap();
    txn.commit();

    let mut txn = store.write_txn(3).unwrap();
    let err = txn
        .kv_cas("fresh".to_string(), Bytes::from_static(b"y"), 0, 0)
        .unwrap_err();
    assert!(matches!(err, MusterError::Conflict(_)));
}

#[test]
fn test_kv_lock_requires_live_session() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    let err = txn
        .kv_set(
            "locked".to_string(),
            Bytes::from_static(b"x"),
            0,
            Some("ghost-session".to_string()),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, MusterError::SessionInvalid(_)));
}

#[test]
fn test_kv_lock_held_by_other_session_conflicts() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    for id in ["s1", "s2"] {
        txn.create_session(Session {
            id: id.to_string(),
            node_id: "n1".to_string(),
            name: format!("lock-{id}"),
            ..Default::default()
        })
        .unwrap();
    }
    txn.kv_set(
        "leader".to_string(),
        Bytes::from_static(b"n1"),
        0,
        Some("s1".to_string()),
        None,
    )
    .unwrap();
    txn.commit();

    let mut txn = store.write_txn(3).unwrap();
    let err = txn
        .kv_set(
            "leader".to_string(),
            Bytes::from_static(b"n2"),
            0,
            Some("s2".to_string()),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, MusterError::Conflict(_)));
}

#[test]
fn test_session_destroy_release_unbinds_lock() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    txn.create_session(Session {
        id: "s1".to_string(),
        node_id: "n1".to_string(),
        name: "locker".to_string(),
        behavior: SessionBehavior::Release,
        ..Default::default()
    })
    .unwrap();
    txn.kv_set(
        "leader".to_string(),
        Bytes::from_static(b"n1"),
        0,
        Some("s1".to_string()),
        None,
    )
    .unwrap();
    txn.commit();

    let mut txn = store.write_txn(3).unwrap();
    txn.destroy_session(&"s1".to_string()).unwrap();
    txn.commit();

    let read = store.read_txn();
    let (_, entry) = read.kv_get("leader", None);
    let entry = entry.unwrap();
    assert!(entry.session.is_none(), "release must unbind the lock");
    assert_eq!(entry.value, Bytes::from_static(b"n1"), "value survives");
}

#[test]
fn test_session_destroy_delete_removes_entry() {
    let store = store_with_node();
    let mut txn = store.write_txn(2).unwrap();
    txn.create_session(Session {
        id: "s1".to_string(),
        node_id: "n1".to_string(),
        name: "locker".to_string(),
        behavior: SessionBehavior::Delete,
        ..Default::default()
    })
    .unwrap();
    txn.kv_set(
        "ephemeral".to_string(),
        Bytes::from_static(b"x"),
        0,
        Some("s1".to_string()),
        None,
    )
    .unwrap();
    txn.commit();

    let mut txn = store.write_txn(3).unwrap();
    txn.destroy_session(&"s1".to_string()).unwrap();
    txn.commit();

    let (_, entry) = store.read_txn().kv_get("ephemeral", None);
    assert!(entry.is_none(), "delete behavior removes locked entries");
}
