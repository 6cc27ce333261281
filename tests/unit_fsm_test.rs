use std::sync::Arc;

use muster::core::MusterError;
use muster::core::fsm::{Fsm, decode_request, encode_request};
use muster::core::store::Store;
use muster::core::types::{
    CaRoot, ConfigEntry, HealthCheck, Node, NodeStatus, Request, Service,
};

fn register_node(id: &str, name: &str) -> Request {
    Request::RegisterNode {
        node: Node {
            id: id.to_string(),
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            datacenter: "dc1".to_string(),
            status: NodeStatus::Alive,
            ..Default::default()
        },
        service: None,
        checks: Vec::new(),
    }
}

fn register_web(node_id: &str) -> Request {
    Request::RegisterService {
        node_id: node_id.to_string(),
        service: Service {
            id: "web-1".to_string(),
            name: "web".to_string(),
            address: "10.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        },
    }
}

#[test]
fn test_apply_register_and_deregister() {
    let fsm = Fsm::new(Arc::new(Store::new()));
    fsm.apply(1, &register_node("n1", "node-1")).unwrap();
    fsm.apply(2, &register_web("n1")).unwrap();

    let read = fsm.store().read_txn();
    let (_, health) = read.service_health("web", false, None);
    assert_eq!(health.len(), 1);
    drop(read);

    fsm.apply(
        3,
        &Request::DeregisterService {
            node_id: "n1".to_string(),
            service_id: "web-1".to_string(),
        },
    )
    .unwrap();
    let read = fsm.store().read_txn();
    let (idx, health) = read.service_health("web", false, None);
    assert!(health.is_empty());
    assert_eq!(idx, 3);
}

#[test]
fn test_duplicate_apply_is_skipped() {
    let fsm = Fsm::new(Arc::new(Store::new()));
    fsm.apply(1, &register_node("n1", "node-1")).unwrap();
    fsm.apply(2, &register_web("n1")).unwrap();

    // Replaying an already-applied index is a no-op, not an error.
    fsm.apply(2, &register_web("n1")).unwrap();
    fsm.apply(1, &register_node("n1", "node-1")).unwrap();
    assert_eq!(fsm.last_applied(), 2);
    assert_eq!(fsm.store().last_index(), 2);
}

#[test]
fn test_rejected_apply_leaves_store_untouched_but_consumes_index() {
    let fsm = Fsm::new(Arc::new(Store::new()));
    fsm.apply(1, &register_node("n1", "node-1")).unwrap();

    let err = fsm.apply(2, &register_web("no-such-node")).unwrap_err();
    assert!(matches!(err, MusterError::NotFound(_)));
    assert_eq!(fsm.last_applied(), 2);
    assert!(fsm.store().read_txn().tables().services.is_empty());

    // The next entry applies normally.
    fsm.apply(3, &register_web("n1")).unwrap();
}

#[test]
fn test_request_encoding_round_trips() {
    let request = Request::UpdateCheck {
        check: HealthCheck {
            id: "check-1".to_string(),
            node_id: "n1".to_string(),
            service_id: Some("web-1".to_string()),
            name: "web alive".to_string(),
            output: "ok".to_string(),
            ..Default::default()
        },
    };
    let bytes = encode_request(&request).unwrap();
    assert_eq!(decode_request(&bytes).unwrap(), request);
}

#[test]
fn test_ca_rotation_keeps_one_active_root() {
    let fsm = Fsm::new(Arc::new(Store::new()));
    for (i, id) in ["root-a", "root-b", "root-c"].iter().enumerate() {
        fsm.apply(
            (i + 1) as u64,
            &Request::CaRootRotate {
                root: CaRoot {
                    id: id.to_string(),
                    serial: i as u64,
                    cert_pem: format!("PEM {id}"),
                    ..Default::default()
                },
            },
        )
        .unwrap();
    }

    let read = fsm.store().read_txn();
    let (_, roots) = read.list_ca_roots(None);
    assert_eq!(roots.len(), 3);
    assert_eq!(roots.iter().filter(|r| r.active).count(), 1);
    let (_, active) = read.active_ca_root(None);
    assert_eq!(active.unwrap().id, "root-c");
}

#[test]
fn test_fsm_determinism_same_log_same_snapshot() {
    let log: Vec<Request> = vec![
        register_node("n1", "node-1"),
        register_node("n2", "node-2"),
        register_web("n1"),
        Request::ConfigEntryApply {
            entry: ConfigEntry {
                kind: "service-defaults".to_string(),
                name: "web".to_string(),
                content: serde_json::json!({"protocol": "http"}),
                create_idx: 0,
                modify_idx: 0,
            },
        },
        Request::KvSet {
            key: "app/x".to_string(),
            value: bytes::Bytes::from_static(b"1"),
            flags: 7,
            acquire_session: None,
            release_session: None,
        },
        Request::DeregisterService {
            node_id: "n1".to_string(),
            service_id: "web-1".to_string(),
        },
    ];

    let fsm_a = Fsm::new(Arc::new(Store::new()));
    let fsm_b = Fsm::new(Arc::new(Store::new()));
    for (i, request) in log.iter().enumerate() {
        fsm_a.apply((i + 1) as u64, request).unwrap();
        fsm_b.apply((i + 1) as u64, request).unwrap();
    }

    let snap_a = fsm_a.snapshot().unwrap();
    let snap_b = fsm_b.snapshot().unwrap();
    assert_eq!(snap_a, snap_b, "same log prefix must produce byte-identical snapshots");
}
