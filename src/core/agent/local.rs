// src/core/agent/local.rs

//! The agent's authoritative local state: the services and checks this host
//! declares, with per-entry sync status. The server copy is derivative; it is
//! reconciled from this table, never the other way around.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::metrics;
use crate::core::types::{
    CheckDefinition, CheckId, CheckStatus, HealthCheck, Node, Service, ServiceId,
};

/// Bounds check output before it ever leaves the agent. Oversized output is cut
/// and suffixed with an explicit truncation marker; the bound is a hard
/// invariant.
pub fn truncate_check_output(buf_size: usize, output: &str) -> String {
    if output.len() <= buf_size {
        return output.to_string();
    }
    let mut cut = buf_size;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...(captured {} of {} bytes)",
        &output[..cut],
        cut,
        output.len()
    )
}

/// One locally-declared service and its sync status.
#[derive(Debug, Clone)]
pub struct LocalService {
    pub service: Service,
    pub token: String,
    pub in_sync: bool,
    /// Tombstone: deregister remotely, then forget.
    pub deleted: bool,
    /// Set on a permanent sync failure; cleared when the entry is mutated or a
    /// full resync is forced.
    pub sync_error: Option<String>,
}

/// One locally-declared check and its sync status.
#[derive(Debug, Clone)]
pub struct LocalCheck {
    pub check: HealthCheck,
    pub token: String,
    pub in_sync: bool,
    pub deleted: bool,
    pub sync_error: Option<String>,
    /// For TTL checks: the deadline after which the check goes critical.
    pub ttl_deadline: Option<Instant>,
}

/// The agent's local tables plus a change signal for the sync loop.
pub struct LocalState {
    node: Node,
    token: String,
    output_buf_size: usize,
    clock: Clock,
    services: Mutex<HashMap<ServiceId, LocalService>>,
    checks: Mutex<HashMap<CheckId, LocalCheck>>,
    /// Bumped on every mutation; the anti-entropy loop watches this.
    changed: watch::Sender<u64>,
}

impl LocalState {
    pub fn new(node: Node, token: String, output_buf_size: usize, clock: Clock) -> Self {
        Self {
            node,
            token,
            output_buf_size,
            clock,
            services: Mutex::new(HashMap::new()),
            checks: Mutex::new(HashMap::new()),
            changed: watch::channel(0).0,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn bump(&self) {
        self.changed.send_modify(|g| *g += 1);
        self.update_pending_gauge();
    }

    fn update_pending_gauge(&self) {
        let services = self.services.lock();
        let checks = self.checks.lock();
        let pending = services.values().filter(|s| !s.in_sync).count()
            + checks.values().filter(|c| !c.in_sync).count();
        metrics::ANTI_ENTROPY_PENDING.set(pending as f64);
    }

    // --- Services ---

    /// Declares (or redeclares) a service. Repeated declarations coalesce: only
    /// the latest state is synced.
    pub fn add_service(&self, mut service: Service, token: Option<String>) {
        service.node_id = self.node.id.clone();
        let mut services = self.services.lock();
        services.insert(
            service.id.clone(),
            LocalService {
                service,
                token: token.unwrap_or_else(|| self.token.clone()),
                in_sync: false,
                deleted: false,
                sync_error: None,
            },
        );
        drop(services);
        self.bump();
    }

    /// Marks a service for removal. The tombstone survives until the
    /// deregistration reaches the catalog.
    pub fn remove_service(&self, service_id: &ServiceId) {
        let mut services = self.services.lock();
        if let Some(entry) = services.get_mut(service_id) {
            entry.deleted = true;
            entry.in_sync = false;
            entry.sync_error = None;
        }
        drop(services);
        // Checks bound to the service die with it.
        let mut checks = self.checks.lock();
        for entry in checks.values_mut() {
            if entry.check.service_id.as_ref() == Some(service_id) {
                entry.deleted = true;
                entry.in_sync = false;
            }
        }
        drop(checks);
        self.bump();
    }

    pub fn services(&self) -> Vec<LocalService> {
        self.services.lock().values().cloned().collect()
    }

    // --- Checks ---

    pub fn add_check(&self, mut check: HealthCheck, token: Option<String>) {
        check.node_id = self.node.id.clone();
        check.output = truncate_check_output(self.output_buf_size, &check.output);
        let ttl_deadline = match &check.definition {
            CheckDefinition::Ttl { ttl } => Some(self.clock.now() + *ttl),
            _ => None,
        };
        let mut checks = self.checks.lock();
        checks.insert(
            check.id.clone(),
            LocalCheck {
                check,
                token: token.unwrap_or_else(|| self.token.clone()),
                in_sync: false,
                deleted: false,
                sync_error: None,
                ttl_deadline,
            },
        );
        drop(checks);
        self.bump();
    }

    pub fn remove_check(&self, check_id: &CheckId) {
        let mut checks = self.checks.lock();
        if let Some(entry) = checks.get_mut(check_id) {
            entry.deleted = true;
            entry.in_sync = false;
            entry.sync_error = None;
        }
        drop(checks);
        self.bump();
    }

    pub fn checks(&self) -> Vec<LocalCheck> {
        self.checks.lock().values().cloned().collect()
    }

    /// Applies a TTL heartbeat: refreshes the deadline and records the probe's
    /// status and (bounded) output.
    pub fn update_ttl_check(
        &self,
        check_id: &CheckId,
        status: CheckStatus,
        output: &str,
    ) -> bool {
        let mut checks = self.checks.lock();
        let Some(entry) = checks.get_mut(check_id) else {
            return false;
        };
        let CheckDefinition::Ttl { ttl } = &entry.check.definition else {
            warn!(check = %check_id, "TTL update for a non-TTL check ignored");
            return false;
        };
        entry.ttl_deadline = Some(self.clock.now() + *ttl);
        let output = truncate_check_output(self.output_buf_size, output);
        if entry.check.status != status || entry.check.output != output {
            entry.check.status = status;
            entry.check.output = output;
            entry.in_sync = false;
            entry.sync_error = None;
            drop(checks);
            self.bump();
        }
        true
    }

    /// Flips an expired TTL check to critical. Local decision, independent of
    /// any server.
    pub fn expire_ttl_check(&self, check_id: &CheckId) {
        let mut checks = self.checks.lock();
        let Some(entry) = checks.get_mut(check_id) else {
            return;
        };
        if entry.deleted || entry.check.status == CheckStatus::Critical {
            return;
        }
        debug!(check = %check_id, "TTL expired; marking check critical");
        entry.check.status = CheckStatus::Critical;
        entry.check.output = "TTL expired without an update".to_string();
        entry.in_sync = false;
        entry.ttl_deadline = None;
        drop(checks);
        self.bump();
    }

    /// TTL deadlines currently armed, for the keeper loop.
    pub fn ttl_deadlines(&self) -> Vec<(CheckId, Instant)> {
        self.checks
            .lock()
            .iter()
            .filter(|(_, c)| !c.deleted)
            .filter_map(|(id, c)| c.ttl_deadline.map(|d| (id.clone(), d)))
            .collect()
    }

    // --- Sync bookkeeping, called by the anti-entropy loop ---

    pub(crate) fn mark_service_synced(&self, service_id: &ServiceId) {
        let mut services = self.services.lock();
        if let Some(entry) = services.get_mut(service_id) {
            entry.in_sync = true;
        }
        drop(services);
        self.update_pending_gauge();
    }

    pub(crate) fn mark_service_failed(&self, service_id: &ServiceId, error: String) {
        let mut services = self.services.lock();
        if let Some(entry) = services.get_mut(service_id) {
            entry.in_sync = false;
            entry.sync_error = Some(error);
        }
    }

    pub(crate) fn forget_service(&self, service_id: &ServiceId) {
        self.services.lock().remove(service_id);
        self.update_pending_gauge();
    }

    pub(crate) fn mark_check_synced(&self, check_id: &CheckId) {
        let mut checks = self.checks.lock();
        if let Some(entry) = checks.get_mut(check_id) {
            entry.in_sync = true;
        }
        drop(checks);
        self.update_pending_gauge();
    }

    pub(crate) fn mark_check_failed(&self, check_id: &CheckId, error: String) {
        let mut checks = self.checks.lock();
        if let Some(entry) = checks.get_mut(check_id) {
            entry.in_sync = false;
            entry.sync_error = Some(error);
        }
    }

    pub(crate) fn forget_check(&self, check_id: &CheckId) {
        self.checks.lock().remove(check_id);
        self.update_pending_gauge();
    }

    /// Forces a full resync: every live entry goes back to `in_sync=false` and
    /// parked errors are cleared.
    pub fn force_resync(&self) {
        let mut services = self.services.lock();
        for entry in services.values_mut() {
            entry.in_sync = false;
            entry.sync_error = None;
        }
        drop(services);
        let mut checks = self.checks.lock();
        for entry in checks.values_mut() {
            entry.in_sync = false;
            entry.sync_error = None;
        }
        drop(checks);
        self.bump();
    }
}

impl std::fmt::Debug for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalState")
            .field("node", &self.node.name)
            .field("services", &self.services.lock().len())
            .field("checks", &self.checks.lock().len())
            .finish()
    }
}
