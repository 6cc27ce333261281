use muster::core::MusterError;
use muster::core::store::schema::tables;
use muster::core::store::{Store, ikey};
use muster::core::types::{Node, NodeStatus, Service};

fn node(id: &str, name: &str) -> Node {
    Node {
        id: id.to_string(),
        name: name.to_string(),
        address: "10.0.0.1".to_string(),
        datacenter: "dc1".to_string(),
        status: NodeStatus::Alive,
        ..Default::default()
    }
}

fn service(id: &str, name: &str) -> Service {
    Service {
        id: id.to_string(),
        name: name.to_string(),
        address: "10.0.0.1".to_string(),
        port: 8080,
        ..Default::default()
    }
}

#[test]
fn test_write_tags_rows_with_commit_index() {
    let store = Store::new();
    let mut txn = store.write_txn(5).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.commit();

    let read = store.read_txn();
    let (idx, row) = read.get_node(&"n1".to_string(), None);
    assert_eq!(idx, 5);
    let row = row.unwrap();
    assert_eq!(row.create_idx, 5);
    assert_eq!(row.modify_idx, 5);
}

#[test]
fn test_non_increasing_index_is_stale() {
    let store = Store::new();
    let mut txn = store.write_txn(5).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.commit();

    let err = store.write_txn(5).unwrap_err();
    assert_eq!(
        err,
        MusterError::StaleIndex {
            attempted: 5,
            current: 5
        }
    );
    assert!(store.write_txn(4).is_err());
    assert!(store.write_txn(6).is_ok());
}

#[test]
fn test_identical_payload_does_not_bump_modify_idx() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.ensure_service(&"n1".to_string(), service("web-1", "web"))
        .unwrap();
    txn.commit();

    let mut txn = store.write_txn(2).unwrap();
    txn.ensure_service(&"n1".to_string(), service("web-1", "web"))
        .unwrap();
    txn.commit();

    let read = store.read_txn();
    let svc = read.tables().services.get(&ikey(&["n1", "web-1"])).unwrap();
    assert_eq!(svc.modify_idx, 1, "identical re-register must not bump modify_idx");
    // The services table did not move either.
    assert_eq!(read.tables().services.max_index(), 1);
}

#[test]
fn test_table_max_index_dominates_row_modify_idx() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.commit();
    let mut txn = store.write_txn(7).unwrap();
    txn.ensure_node(node("n2", "node-2")).unwrap();
    txn.commit();

    let read = store.read_txn();
    let max = read.tables().nodes.max_index();
    for row in read.tables().nodes.iter() {
        assert!(max >= row.modify_idx);
    }
    assert_eq!(max, 7);
}

#[test]
fn test_delete_missing_row_still_advances_max_index() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.commit();
    assert_eq!(store.read_txn().tables().kv.max_index(), 0);

    let mut txn = store.write_txn(2).unwrap();
    txn.kv_delete("no/such/key").unwrap();
    txn.commit();

    let read = store.read_txn();
    assert_eq!(read.tables().kv.max_index(), 2);
    assert!(read.tables().kv.is_empty());
}

#[test]
fn test_node_name_unique_per_datacenter() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.commit();

    let mut txn = store.write_txn(2).unwrap();
    let err = txn.ensure_node(node("n2", "node-1")).unwrap_err();
    assert!(matches!(err, MusterError::Conflict(_)));
}

#[test]
fn test_service_requires_node() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    let err = txn
        .ensure_service(&"ghost".to_string(), service("web-1", "web"))
        .unwrap_err();
    assert!(matches!(err, MusterError::NotFound(_)));
}

#[test]
fn test_deregister_node_cascades() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.ensure_service(&"n1".to_string(), service("web-1", "web"))
        .unwrap();
    txn.ensure_check(muster::core::types::HealthCheck {
        id: "check-web".to_string(),
        node_id: "n1".to_string(),
        service_id: Some("web-1".to_string()),
        name: "web alive".to_string(),
        ..Default::default()
    })
    .unwrap();
    txn.commit();

    let mut txn = store.write_txn(2).unwrap();
    txn.delete_node(&"n1".to_string()).unwrap();
    txn.commit();

    let read = store.read_txn();
    assert!(read.tables().nodes.is_empty());
    assert!(read.tables().services.is_empty());
    assert!(read.tables().checks.is_empty());
    assert_eq!(read.tables().table_max_index(tables::SERVICES), 2);
}

#[test]
fn test_reader_snapshot_is_stable() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.commit();

    let before = store.read_txn();
    let mut txn = store.write_txn(2).unwrap();
    txn.delete_node(&"n1".to_string()).unwrap();
    txn.commit();

    // The earlier snapshot still sees the node; a fresh one does not.
    assert!(before.tables().nodes.get(&ikey(&["n1"])).is_some());
    assert!(store.read_txn().tables().nodes.get(&ikey(&["n1"])).is_none());
}

#[test]
fn test_connect_filter_restricts_to_mesh_instances() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.ensure_service(&"n1".to_string(), service("web-plain", "web"))
        .unwrap();
    txn.ensure_service(
        &"n1".to_string(),
        Service {
            kind: muster::core::types::ServiceKind::ConnectProxy,
            ..service("web-proxy", "web")
        },
    )
    .unwrap();
    txn.commit();

    let read = store.read_txn();
    let (_, all) = read.service_health("web", false, None);
    assert_eq!(all.len(), 2);
    let (_, connect) = read.service_health("web", true, None);
    assert_eq!(connect.len(), 1);
    assert_eq!(connect[0].service.id, "web-proxy");
}

#[test]
fn test_peering_lifecycle() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_peering(muster::core::types::Peering {
        name: "dc2".to_string(),
        id: "p-1".to_string(),
        state: muster::core::types::PeeringState::Pending,
        ..Default::default()
    })
    .unwrap();
    txn.commit();

    let mut txn = store.write_txn(2).unwrap();
    txn.ensure_peering(muster::core::types::Peering {
        name: "dc2".to_string(),
        id: "p-1".to_string(),
        state: muster::core::types::PeeringState::Active,
        ..Default::default()
    })
    .unwrap();
    txn.commit();

    let read = store.read_txn();
    let (idx, peering) = read.get_peering("dc2", None);
    assert_eq!(idx, 2);
    let peering = peering.unwrap();
    assert_eq!(peering.state, muster::core::types::PeeringState::Active);
    assert_eq!(peering.create_idx, 1);
    assert_eq!(peering.modify_idx, 2);

    let mut txn = store.write_txn(3).unwrap();
    txn.delete_peering("dc2").unwrap();
    txn.commit();
    let (idx, peering) = store.read_txn().get_peering("dc2", None);
    assert_eq!(idx, 3);
    assert!(peering.is_none());
}

#[test]
fn test_secondary_index_lookup() {
    let store = Store::new();
    let mut txn = store.write_txn(1).unwrap();
    txn.ensure_node(node("n1", "node-1")).unwrap();
    txn.ensure_node(node("n2", "node-2")).unwrap();
    txn.ensure_service(&"n1".to_string(), service("web-1", "web"))
        .unwrap();
    txn.ensure_service(&"n2".to_string(), service("web-2", "web"))
        .unwrap();
    txn.ensure_service(&"n2".to_string(), service("db-1", "db"))
        .unwrap();
    txn.commit();

    let read = store.read_txn();
    let (_, health) = read.service_health("web", false, None);
    assert_eq!(health.len(), 2);
    let (_, on_n2) = read.node_services(&"n2".to_string(), None);
    assert_eq!(on_n2.len(), 2);
}
