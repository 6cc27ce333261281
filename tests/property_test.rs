//! Property-based tests for the store's versioning invariants.

use std::sync::Arc;

use muster::core::fsm::Fsm;
use muster::core::store::{Store, snapshot};
use muster::core::types::{Node, Request, Service};
use proptest::prelude::*;

/// A reduced op alphabet: enough to exercise create/update/delete across two
/// tables plus KV.
#[derive(Debug, Clone)]
enum Op {
    RegisterNode(u8),
    RegisterService { node: u8, port: u16 },
    DeregisterService(u8),
    KvSet { key: u8, value: u8 },
    KvDelete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::RegisterNode),
        ((0u8..4), any::<u16>()).prop_map(|(node, port)| Op::RegisterService { node, port }),
        (0u8..4).prop_map(Op::DeregisterService),
        ((0u8..8), any::<u8>()).prop_map(|(key, value)| Op::KvSet { key, value }),
        (0u8..8).prop_map(Op::KvDelete),
    ]
}

fn to_request(op: &Op) -> Request {
    match op {
        Op::RegisterNode(n) => Request::RegisterNode {
            node: Node {
                id: format!("n{n}"),
                name: format!("node-{n}"),
                address: format!("10.0.0.{n}"),
                datacenter: "dc1".to_string(),
                ..Default::default()
            },
            service: None,
            checks: Vec::new(),
        },
        Op::RegisterService { node, port } => Request::RegisterService {
            node_id: format!("n{node}"),
            service: Service {
                id: format!("svc-{node}"),
                name: "svc".to_string(),
                port: *port,
                ..Default::default()
            },
        },
        Op::DeregisterService(n) => Request::DeregisterService {
            node_id: format!("n{n}"),
            service_id: format!("svc-{n}"),
        },
        Op::KvSet { key, value } => Request::KvSet {
            key: format!("k/{key}"),
            value: bytes::Bytes::from(vec![*value]),
            flags: 0,
            acquire_session: None,
            release_session: None,
        },
        Op::KvDelete(key) => Request::KvDelete {
            key: format!("k/{key}"),
        },
    }
}

fn apply_all(ops: &[Op]) -> Fsm {
    let fsm = Fsm::new(Arc::new(Store::new()));
    for (i, op) in ops.iter().enumerate() {
        // Some ops are rejected (missing node); that is fine, the index is
        // still consumed.
        let _ = fsm.apply((i + 1) as u64, &to_request(op));
    }
    fsm
}

proptest! {
    #[test]
    fn prop_modify_idx_is_monotone_per_row(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let fsm = Fsm::new(Arc::new(Store::new()));
        let mut last_seen: std::collections::HashMap<String, u64> = Default::default();
        for (i, op) in ops.iter().enumerate() {
            let _ = fsm.apply((i + 1) as u64, &to_request(op));
            let read = fsm.store().read_txn();
            for entry in read.tables().kv.iter() {
                let prev = last_seen.insert(entry.key.clone(), entry.modify_idx).unwrap_or(0);
                prop_assert!(entry.modify_idx >= prev, "modify_idx regressed for {}", entry.key);
                prop_assert!(entry.create_idx <= entry.modify_idx);
            }
        }
    }

    #[test]
    fn prop_table_max_index_dominates_rows(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let fsm = apply_all(&ops);
        let read = fsm.store().read_txn();
        let tables = read.tables();
        for row in tables.nodes.iter() {
            prop_assert!(tables.nodes.max_index() >= row.modify_idx);
        }
        for row in tables.services.iter() {
            prop_assert!(tables.services.max_index() >= row.modify_idx);
        }
        for row in tables.kv.iter() {
            prop_assert!(tables.kv.max_index() >= row.modify_idx);
        }
    }

    #[test]
    fn prop_snapshot_restore_round_trips(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let fsm = apply_all(&ops);
        let bytes = fsm.snapshot().unwrap();
        let restored = snapshot::deserialize(&bytes).unwrap();
        let resnapshotted = snapshot::serialize(&restored).unwrap();
        prop_assert_eq!(bytes, resnapshotted);
    }

    #[test]
    fn prop_same_log_prefix_is_deterministic(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let a = apply_all(&ops);
        let b = apply_all(&ops);
        prop_assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }
}
