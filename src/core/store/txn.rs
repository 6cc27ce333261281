// src/core/store/txn.rs

//! Write transactions: typed catalog mutations staged against a copy-on-write
//! generation, committed with a single pointer swap.

use std::sync::Arc;

use parking_lot::MutexGuard;

use super::schema::{index, tables};
use super::table::{Row, ikey};
use super::{Store, Tables};
use crate::core::errors::MusterError;
use crate::core::types::{
    CaRoot, CheckId, ConfigEntry, HealthCheck, Index, Intention, KvEntry, Node, NodeId, Peering,
    Service, ServiceId, Session, SessionBehavior, SessionId,
};

/// What happened to a row, as seen by the event-publisher extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// One row-change in a committed transaction. Extractors resolve the row payload
/// through the old/new generations.
#[derive(Debug, Clone)]
pub struct Change {
    pub table: &'static str,
    pub key: Vec<u8>,
    pub op: ChangeOp,
}

/// A write transaction. All mutations observe the single `index` the transaction
/// was opened with; nothing is visible to readers until `commit`.
pub struct WriteTxn<'a> {
    store: &'a Store,
    guard: MutexGuard<'a, ()>,
    base: Arc<Tables>,
    next: Tables,
    index: Index,
    changes: Vec<Change>,
    /// Tables whose `max_index` advanced without a surviving row (deletes of
    /// missing rows). Watch channels still fire for these.
    touched_tables: Vec<&'static str>,
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("index", &self.index)
            .field("changes", &self.changes)
            .field("touched_tables", &self.touched_tables)
            .finish()
    }
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(
        store: &'a Store,
        guard: MutexGuard<'a, ()>,
        base: Arc<Tables>,
        index: Index,
    ) -> Self {
        let next = (*base).clone();
        Self {
            store,
            guard,
            base,
            next,
            index,
            changes: Vec::new(),
            touched_tables: Vec::new(),
        }
    }

    pub fn index(&self) -> Index {
        self.index
    }

    /// The staged state, observed by validations within this transaction.
    pub fn tables(&self) -> &Tables {
        &self.next
    }

    /// Atomically publishes the staged generation, runs the publisher extractors,
    /// and fires watch channels. Returns the commit index.
    pub fn commit(mut self) -> Index {
        self.next.last_index = self.index;
        let mut touched: Vec<(&'static str, Vec<u8>)> = self
            .changes
            .iter()
            .map(|c| (c.table, c.key.clone()))
            .collect();
        for table in &self.touched_tables {
            touched.push((table, Vec::new()));
        }
        self.store.commit_locked(
            &self.guard,
            self.base,
            self.next,
            self.index,
            &self.changes,
            &touched,
        );
        self.index
    }

    fn record(&mut self, table: &'static str, key: Vec<u8>, op: ChangeOp) {
        self.changes.push(Change { table, key, op });
    }

    // --- Nodes ---

    /// Registers or updates a node. Node names are unique per datacenter.
    pub fn ensure_node(&mut self, node: Node) -> Result<(), MusterError> {
        if node.id.is_empty() || node.name.is_empty() {
            return Err(MusterError::InvalidRequest(
                "node id and name must be non-empty".into(),
            ));
        }
        if let Some(existing) = self.next.nodes.get_by(index::BY_NAME, &ikey(&[&node.name])) {
            if existing.id != node.id {
                return Err(MusterError::Conflict(format!(
                    "node name '{}' is already registered with id '{}'",
                    node.name, existing.id
                )));
            }
        }
        let key = node.primary_key();
        let outcome = Arc::make_mut(&mut self.next.nodes).insert(node, self.index);
        if outcome.changed() {
            self.record(tables::NODES, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    /// Removes a node and cascades to its services, checks and sessions.
    pub fn delete_node(&mut self, node_id: &NodeId) -> Result<(), MusterError> {
        let node_key = ikey(&[node_id]);

        for service in self.next.services.list_by(index::BY_NODE, &node_key) {
            self.delete_service(node_id, &service.id)?;
        }
        for check in self.next.checks.list_by(index::BY_NODE, &node_key) {
            self.delete_check(node_id, &check.id)?;
        }
        for session in self.next.sessions.list_by(index::BY_NODE, &node_key) {
            self.destroy_session(&session.id)?;
        }

        let removed = Arc::make_mut(&mut self.next.nodes).delete(&node_key, self.index);
        match removed {
            Some(_) => self.record(tables::NODES, node_key, ChangeOp::Delete),
            None => self.touched_tables.push(tables::NODES),
        }
        Ok(())
    }

    // --- Services ---

    /// Registers or updates a service instance on an existing node.
    pub fn ensure_service(&mut self, node_id: &NodeId, service: Service) -> Result<(), MusterError> {
        if self.next.nodes.get(&ikey(&[node_id])).is_none() {
            return Err(MusterError::NotFound(format!("node '{node_id}'")));
        }
        if service.id.is_empty() || service.name.is_empty() {
            return Err(MusterError::InvalidRequest(
                "service id and name must be non-empty".into(),
            ));
        }
        let mut service = service;
        service.node_id = node_id.clone();
        let key = service.primary_key();
        let outcome = Arc::make_mut(&mut self.next.services).insert(service, self.index);
        if outcome.changed() {
            self.record(tables::SERVICES, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    /// Removes a service and every check bound to it.
    pub fn delete_service(
        &mut self,
        node_id: &NodeId,
        service_id: &ServiceId,
    ) -> Result<(), MusterError> {
        let service_key = ikey(&[node_id, service_id]);

        for check in self
            .next
            .checks
            .list_by(index::BY_SERVICE, &ikey(&[node_id, service_id]))
        {
            self.delete_check(node_id, &check.id)?;
        }

        let removed = Arc::make_mut(&mut self.next.services).delete(&service_key, self.index);
        match removed {
            Some(_) => self.record(tables::SERVICES, service_key, ChangeOp::Delete),
            None => self.touched_tables.push(tables::SERVICES),
        }
        Ok(())
    }

    // --- Checks ---

    /// Writes a health check. A service reference must resolve to a service on
    /// the same node at the moment the check is written.
    pub fn ensure_check(&mut self, check: HealthCheck) -> Result<(), MusterError> {
        if self.next.nodes.get(&ikey(&[&check.node_id])).is_none() {
            return Err(MusterError::NotFound(format!("node '{}'", check.node_id)));
        }
        if let Some(service_id) = &check.service_id {
            if self
                .next
                .services
                .get(&ikey(&[&check.node_id, service_id]))
                .is_none()
            {
                return Err(MusterError::NotFound(format!(
                    "service '{}' on node '{}'",
                    service_id, check.node_id
                )));
            }
        }
        let key = check.primary_key();
        let outcome = Arc::make_mut(&mut self.next.checks).insert(check, self.index);
        if outcome.changed() {
            self.record(tables::CHECKS, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    /// Removes a check and detaches it from any session holding it.
    pub fn delete_check(&mut self, node_id: &NodeId, check_id: &CheckId) -> Result<(), MusterError> {
        let check_key = ikey(&[node_id, check_id]);
        let removed = Arc::make_mut(&mut self.next.checks).delete(&check_key, self.index);
        match removed {
            Some(_) => self.record(tables::CHECKS, check_key, ChangeOp::Delete),
            None => {
                self.touched_tables.push(tables::CHECKS);
                return Ok(());
            }
        }

        let holders: Vec<Arc<Session>> = self
            .next
            .sessions
            .iter()
            .filter(|s| s.attached_check_ids.iter().any(|c| c == check_id))
            .cloned()
            .collect();
        for session in holders {
            let mut updated = (*session).clone();
            updated.attached_check_ids.retain(|c| c != check_id);
            let key = updated.primary_key();
            let outcome = Arc::make_mut(&mut self.next.sessions).insert(updated, self.index);
            if outcome.changed() {
                self.record(tables::SESSIONS, key, ChangeOp::Upsert);
            }
        }
        Ok(())
    }

    // --- KV ---

    /// Sets a key, optionally acquiring or releasing a session lock.
    pub fn kv_set(
        &mut self,
        key: String,
        value: bytes::Bytes,
        flags: u64,
        acquire_session: Option<SessionId>,
        release_session: Option<SessionId>,
    ) -> Result<(), MusterError> {
        let pk = key.as_bytes().to_vec();
        let existing = self.next.kv.get(&pk);

        let session = match (acquire_session, release_session) {
            (Some(session_id), _) => {
                if self.next.sessions.get(&ikey(&[&session_id])).is_none() {
                    return Err(MusterError::SessionInvalid(session_id));
                }
                if let Some(entry) = &existing {
                    if let Some(holder) = &entry.session {
                        if *holder != session_id {
                            return Err(MusterError::Conflict(format!(
                                "key '{key}' is locked by session '{holder}'"
                            )));
                        }
                    }
                }
                Some(session_id)
            }
            (None, Some(session_id)) => {
                match existing.as_ref().and_then(|e| e.session.clone()) {
                    Some(holder) if holder == session_id => None,
                    Some(holder) => {
                        return Err(MusterError::Conflict(format!(
                            "key '{key}' is locked by session '{holder}'"
                        )));
                    }
                    None => None,
                }
            }
            (None, None) => existing.as_ref().and_then(|e| e.session.clone()),
        };

        let entry = KvEntry {
            key,
            value,
            flags,
            session,
            create_idx: 0,
            modify_idx: 0,
        };
        let outcome = Arc::make_mut(&mut self.next.kv).insert(entry, self.index);
        if outcome.changed() {
            self.record(tables::KV, pk, ChangeOp::Upsert);
        }
        Ok(())
    }

    pub fn kv_delete(&mut self, key: &str) -> Result<(), MusterError> {
        let pk = key.as_bytes().to_vec();
        let removed = Arc::make_mut(&mut self.next.kv).delete(&pk, self.index);
        match removed {
            Some(_) => self.record(tables::KV, pk, ChangeOp::Delete),
            None => self.touched_tables.push(tables::KV),
        }
        Ok(())
    }

    /// Compare-and-set. `expected_idx == 0` means the key must not exist.
    pub fn kv_cas(
        &mut self,
        key: String,
        value: bytes::Bytes,
        flags: u64,
        expected_idx: Index,
    ) -> Result<(), MusterError> {
        let pk = key.as_bytes().to_vec();
        let current = self.next.kv.get(&pk);
        match (expected_idx, &current) {
            (0, Some(_)) => {
                return Err(MusterError::Conflict(format!("key '{key}' already exists")));
            }
            (0, None) => {}
            (expected, Some(entry)) if entry.modify_idx == expected => {}
            (expected, Some(entry)) => {
                return Err(MusterError::Conflict(format!(
                    "key '{key}' is at index {} (expected {expected})",
                    entry.modify_idx
                )));
            }
            (_, None) => {
                return Err(MusterError::Conflict(format!("key '{key}' does not exist")));
            }
        }
        self.kv_set(key, value, flags, None, None)
    }

    // --- Sessions ---

    /// Creates a session. The node and every attached check must exist.
    pub fn create_session(&mut self, session: Session) -> Result<(), MusterError> {
        if session.id.is_empty() {
            return Err(MusterError::InvalidRequest("session id must be non-empty".into()));
        }
        if self.next.nodes.get(&ikey(&[&session.node_id])).is_none() {
            return Err(MusterError::NotFound(format!("node '{}'", session.node_id)));
        }
        for check_id in &session.attached_check_ids {
            if self
                .next
                .checks
                .get(&ikey(&[&session.node_id, check_id]))
                .is_none()
            {
                return Err(MusterError::NotFound(format!(
                    "check '{}' on node '{}'",
                    check_id, session.node_id
                )));
            }
        }
        let key = session.primary_key();
        let outcome = Arc::make_mut(&mut self.next.sessions).insert(session, self.index);
        if outcome.changed() {
            self.record(tables::SESSIONS, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    /// Bumps a session's `modify_idx` so the renewal is observable. The TTL timer
    /// itself lives with the leader, not in the store.
    pub fn renew_session(&mut self, session_id: &SessionId) -> Result<(), MusterError> {
        let key = ikey(&[session_id]);
        if !Arc::make_mut(&mut self.next.sessions).touch(&key, self.index) {
            return Err(MusterError::NotFound(format!("session '{session_id}'")));
        }
        self.record(tables::SESSIONS, key, ChangeOp::Upsert);
        Ok(())
    }

    /// Destroys a session and applies its behavior to every KV lock it holds.
    /// Destroying a missing session is a no-op that still advances the table.
    pub fn destroy_session(&mut self, session_id: &SessionId) -> Result<(), MusterError> {
        let key = ikey(&[session_id]);
        let Some(session) = Arc::make_mut(&mut self.next.sessions).delete(&key, self.index) else {
            self.touched_tables.push(tables::SESSIONS);
            return Ok(());
        };
        self.record(tables::SESSIONS, key, ChangeOp::Delete);

        let held: Vec<Arc<KvEntry>> = self
            .next
            .kv
            .iter()
            .filter(|e| e.session.as_deref() == Some(session_id.as_str()))
            .cloned()
            .collect();
        for entry in held {
            match session.behavior {
                SessionBehavior::Release => {
                    let mut released = (*entry).clone();
                    released.session = None;
                    let pk = released.primary_key();
                    let outcome = Arc::make_mut(&mut self.next.kv).insert(released, self.index);
                    if outcome.changed() {
                        self.record(tables::KV, pk, ChangeOp::Upsert);
                    }
                }
                SessionBehavior::Delete => {
                    let pk = entry.primary_key();
                    if Arc::make_mut(&mut self.next.kv).delete(&pk, self.index).is_some() {
                        self.record(tables::KV, pk, ChangeOp::Delete);
                    }
                }
            }
        }
        Ok(())
    }

    // --- Intentions ---

    pub fn ensure_intention(&mut self, intention: Intention) -> Result<(), MusterError> {
        if intention.id.is_empty() || intention.source.is_empty() || intention.destination.is_empty()
        {
            return Err(MusterError::InvalidRequest(
                "intention id, source and destination must be non-empty".into(),
            ));
        }
        let key = intention.primary_key();
        let outcome = Arc::make_mut(&mut self.next.intentions).insert(intention, self.index);
        if outcome.changed() {
            self.record(tables::INTENTIONS, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    pub fn delete_intention(&mut self, id: &str) -> Result<(), MusterError> {
        let key = ikey(&[id]);
        let removed = Arc::make_mut(&mut self.next.intentions).delete(&key, self.index);
        match removed {
            Some(_) => self.record(tables::INTENTIONS, key, ChangeOp::Delete),
            None => self.touched_tables.push(tables::INTENTIONS),
        }
        Ok(())
    }

    // --- Config entries ---

    pub fn ensure_config_entry(&mut self, entry: ConfigEntry) -> Result<(), MusterError> {
        if entry.kind.is_empty() || entry.name.is_empty() {
            return Err(MusterError::InvalidRequest(
                "config entry kind and name must be non-empty".into(),
            ));
        }
        let key = entry.primary_key();
        let outcome = Arc::make_mut(&mut self.next.config_entries).insert(entry, self.index);
        if outcome.changed() {
            self.record(tables::CONFIG_ENTRIES, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    pub fn delete_config_entry(&mut self, kind: &str, name: &str) -> Result<(), MusterError> {
        let key = ikey(&[kind, name]);
        let removed = Arc::make_mut(&mut self.next.config_entries).delete(&key, self.index);
        match removed {
            Some(_) => self.record(tables::CONFIG_ENTRIES, key, ChangeOp::Delete),
            None => self.touched_tables.push(tables::CONFIG_ENTRIES),
        }
        Ok(())
    }

    // --- CA roots ---

    /// Installs a new active root. The previously active root is retained with
    /// `active=false`, keeping the one-active-root invariant.
    pub fn rotate_ca_root(&mut self, root: CaRoot) -> Result<(), MusterError> {
        if root.id.is_empty() || root.cert_pem.is_empty() {
            return Err(MusterError::InvalidRequest(
                "ca root id and certificate must be non-empty".into(),
            ));
        }
        if let Some(active) = self.next.ca_roots.get_by(index::BY_ACTIVE, &ikey(&["active"])) {
            if active.id != root.id {
                let mut demoted = (*active).clone();
                demoted.active = false;
                let key = demoted.primary_key();
                let outcome = Arc::make_mut(&mut self.next.ca_roots).insert(demoted, self.index);
                if outcome.changed() {
                    self.record(tables::CA_ROOTS, key, ChangeOp::Upsert);
                }
            }
        }
        let mut root = root;
        root.active = true;
        let key = root.primary_key();
        let outcome = Arc::make_mut(&mut self.next.ca_roots).insert(root, self.index);
        if outcome.changed() {
            self.record(tables::CA_ROOTS, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    // --- Peerings ---

    pub fn ensure_peering(&mut self, peering: Peering) -> Result<(), MusterError> {
        if peering.name.is_empty() {
            return Err(MusterError::InvalidRequest("peering name must be non-empty".into()));
        }
        let key = peering.primary_key();
        let outcome = Arc::make_mut(&mut self.next.peerings).insert(peering, self.index);
        if outcome.changed() {
            self.record(tables::PEERINGS, key, ChangeOp::Upsert);
        }
        Ok(())
    }

    pub fn delete_peering(&mut self, name: &str) -> Result<(), MusterError> {
        let key = ikey(&[name]);
        let removed = Arc::make_mut(&mut self.next.peerings).delete(&key, self.index);
        match removed {
            Some(_) => self.record(tables::PEERINGS, key, ChangeOp::Delete),
            None => self.touched_tables.push(tables::PEERINGS),
        }
        Ok(())
    }
}
