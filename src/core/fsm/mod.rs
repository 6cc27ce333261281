// src/core/fsm/mod.rs

//! The deterministic applier: turns ordered log entries into state-store
//! mutations.
//!
//! Determinism rules: no wall-clock reads, no randomness, no map-iteration
//! dependent output. IDs and timestamps are allocated by the leader and carried
//! inside the log entry. Two fresh stores fed the same log prefix produce
//! byte-identical snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use crate::core::errors::MusterError;
use crate::core::store::{Store, snapshot};
use crate::core::types::{Index, Request};

/// Encodes a request for the log or the wire.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, MusterError> {
    Ok(bincode::serde::encode_to_vec(
        request,
        bincode::config::standard(),
    )?)
}

/// Decodes a log entry back into a request.
pub fn decode_request(bytes: &[u8]) -> Result<Request, MusterError> {
    let (request, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(request)
}

/// The log-applying finite state machine. The sole writer of the state store.
pub struct Fsm {
    store: Arc<Store>,
    /// Highest index ever handed to `apply`, successful or not. Replayed
    /// duplicates below this are skipped.
    last_applied: AtomicU64,
}

impl Fsm {
    pub fn new(store: Arc<Store>) -> Self {
        let last_applied = AtomicU64::new(store.last_index());
        Self {
            store,
            last_applied,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Applies an encoded log entry at `index`.
    pub fn apply_bytes(&self, index: Index, bytes: &[u8]) -> Result<(), MusterError> {
        let request = decode_request(bytes)?;
        self.apply(index, &request)
    }

    /// Applies a request at `index`.
    ///
    /// Re-applying an index at or below `last_applied` is a no-op, which makes
    /// log replay after restart or snapshot install safe. Application-level
    /// failures (`NotFound`, `Conflict`, ...) leave the store untouched and
    /// surface to the submitting caller; they still consume the index.
    pub fn apply(&self, index: Index, request: &Request) -> Result<(), MusterError> {
        if index <= self.last_applied.load(Ordering::Acquire) {
            debug!(index, op = request.op_name(), "skipping already-applied entry");
            return Ok(());
        }
        let result = self.apply_inner(index, request);
        self.last_applied.store(index, Ordering::Release);
        if let Err(err) = &result {
            if matches!(err, MusterError::Invariant(_) | MusterError::StaleIndex { .. }) {
                // These mean the applier and the log disagree about reality.
                error!(index, op = request.op_name(), %err, "fatal apply failure");
            } else {
                debug!(index, op = request.op_name(), %err, "apply rejected");
            }
        }
        result
    }

    fn apply_inner(&self, index: Index, request: &Request) -> Result<(), MusterError> {
        let mut txn = self.store.write_txn(index)?;
        match request {
            Request::RegisterNode {
                node,
                service,
                checks,
            } => {
                txn.ensure_node(node.clone())?;
                if let Some(service) = service {
                    txn.ensure_service(&node.id, service.clone())?;
                }
                for check in checks {
                    txn.ensure_check(check.clone())?;
                }
            }
            Request::DeregisterNode { node_id } => txn.delete_node(node_id)?,
            Request::RegisterService { node_id, service } => {
                txn.ensure_service(node_id, service.clone())?;
            }
            Request::DeregisterService {
                node_id,
                service_id,
            } => txn.delete_service(node_id, service_id)?,
            Request::UpdateCheck { check } => txn.ensure_check(check.clone())?,
            Request::DeregisterCheck { node_id, check_id } => {
                txn.delete_check(node_id, check_id)?;
            }
            Request::KvSet {
                key,
                value,
                flags,
                acquire_session,
                release_session,
            } => txn.kv_set(
                key.clone(),
                value.clone(),
                *flags,
                acquire_session.clone(),
                release_session.clone(),
            )?,
            Request::KvDelete { key } => txn.kv_delete(key)?,
            Request::KvCas {
                key,
                value,
                flags,
                expected_idx,
            } => txn.kv_cas(key.clone(), value.clone(), *flags, *expected_idx)?,
            Request::SessionCreate { session } => txn.create_session(session.clone())?,
            Request::SessionRenew { session_id } => txn.renew_session(session_id)?,
            Request::SessionDestroy { session_id } => txn.destroy_session(session_id)?,
            Request::IntentionApply { intention } => txn.ensure_intention(intention.clone())?,
            Request::IntentionDelete { id } => txn.delete_intention(id)?,
            Request::ConfigEntryApply { entry } => txn.ensure_config_entry(entry.clone())?,
            Request::ConfigEntryDelete { kind, name } => txn.delete_config_entry(kind, name)?,
            Request::CaRootRotate { root } => txn.rotate_ca_root(root.clone())?,
            Request::PeeringWrite { peering } => txn.ensure_peering(peering.clone())?,
            Request::PeeringDelete { name } => txn.delete_peering(name)?,
        }
        txn.commit();
        Ok(())
    }

    /// Streams the state store to the log collaborator.
    pub fn snapshot(&self) -> Result<Vec<u8>, MusterError> {
        let read = self.store.read_txn();
        snapshot::serialize(read.tables())
    }

    /// Replaces the state store atomically from a snapshot, preserving table
    /// `max_index` values exactly.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), MusterError> {
        let tables = snapshot::deserialize(bytes)?;
        let restored_index = tables.last_index;
        self.store.restore(tables);
        self.last_applied.store(restored_index, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("last_applied", &self.last_applied())
            .finish()
    }
}
