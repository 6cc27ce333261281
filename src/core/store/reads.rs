// src/core/store/reads.rs

//! Read transactions: stable snapshots with typed catalog queries and optional
//! watch-set registration for blocking reads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::schema::{index, tables};
use super::table::{ikey, ikey_prefix};
use super::watch::{WatchRegistry, WatchSet};
use super::Tables;
use crate::core::types::{
    CaRoot, CheckServiceNode, CheckStatus, ConfigEntry, HealthCheck, Index, Intention, KvEntry,
    Node, NodeId, Peering, Service, Session, SessionId,
};

/// The outcome of an intention match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IntentionDecision {
    pub allowed: bool,
    /// The winning intention, when one matched.
    pub matched: Option<Intention>,
}

/// A service's effective configuration: proxy defaults merged with the
/// service-specific entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResolvedServiceConfig {
    pub service_name: String,
    #[serde(with = "crate::core::types::json_value")]
    pub config: serde_json::Value,
}

/// Joins one service instance with its node and relevant checks. Returns `None`
/// when the owning node is gone (mid-cascade views never escape a commit, so
/// this is only hit for rows resolved against an older generation).
pub fn check_service_node(tables: &Tables, service: &Service) -> Option<CheckServiceNode> {
    let node = tables.nodes.get(&ikey(&[&service.node_id]))?;
    let node_key = ikey(&[&service.node_id]);
    let mut checks: Vec<HealthCheck> = tables
        .checks
        .list_by(index::BY_NODE, &node_key)
        .into_iter()
        .filter(|c| c.service_id.is_none())
        .map(|c| (*c).clone())
        .collect();
    checks.extend(
        tables
            .checks
            .list_by(index::BY_SERVICE, &ikey(&[&service.node_id, &service.id]))
            .into_iter()
            .map(|c| (*c).clone()),
    );
    Some(CheckServiceNode {
        node: (*node).clone(),
        service: service.clone(),
        checks,
    })
}

/// The join behind health queries and the service-health topics, computed
/// against an arbitrary generation.
pub fn service_health_of(
    tables: &Tables,
    service_name: &str,
    connect_only: bool,
) -> Vec<CheckServiceNode> {
    let mut out: Vec<CheckServiceNode> = tables
        .services
        .list_by(index::BY_NAME, &ikey(&[service_name]))
        .into_iter()
        .filter(|s| !connect_only || s.is_connect_enabled())
        .filter_map(|s| check_service_node(tables, &s))
        .collect();
    // Deterministic output order regardless of index layout.
    out.sort_by(|a, b| {
        (a.node.name.as_str(), a.service.id.as_str())
            .cmp(&(b.node.name.as_str(), b.service.id.as_str()))
    });
    out
}

/// A stable view of the catalog. Reads never fail and never block; a snapshot
/// taken at time T is unaffected by concurrent writers.
pub struct ReadTxn<'a> {
    tables: Arc<Tables>,
    watches: &'a WatchRegistry,
}

impl<'a> ReadTxn<'a> {
    pub(crate) fn new(tables: Arc<Tables>, watches: &'a WatchRegistry) -> Self {
        Self { tables, watches }
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn last_index(&self) -> Index {
        self.tables.last_index
    }

    fn watch_table(&self, ws: Option<&mut WatchSet>, table: &'static str) {
        if let Some(ws) = ws {
            ws.add(self.watches.table(table));
        }
    }

    fn watch_tables(&self, ws: Option<&mut WatchSet>, names: &[&'static str]) {
        if let Some(ws) = ws {
            for name in names {
                ws.add(self.watches.table(name));
            }
        }
    }

    fn watch_key(&self, ws: Option<&mut WatchSet>, table: &'static str, key: Vec<u8>) {
        if let Some(ws) = ws {
            // A point read watches both the precise key and the table, so a
            // delete-of-missing (which only advances the table) still wakes it.
            ws.add(self.watches.key(table, key));
            ws.add(self.watches.table(table));
        }
    }

    // --- Nodes ---

    pub fn get_node(
        &self,
        node_id: &NodeId,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Option<Arc<Node>>) {
        let key = ikey(&[node_id]);
        self.watch_key(ws, tables::NODES, key.clone());
        (self.tables.nodes.max_index(), self.tables.nodes.get(&key))
    }

    pub fn list_nodes(&self, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<Node>>) {
        self.watch_table(ws, tables::NODES);
        (
            self.tables.nodes.max_index(),
            self.tables.nodes.iter().cloned().collect(),
        )
    }

    // --- Services ---

    pub fn list_services(&self, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<Service>>) {
        self.watch_table(ws, tables::SERVICES);
        (
            self.tables.services.max_index(),
            self.tables.services.iter().cloned().collect(),
        )
    }

    pub fn node_services(
        &self,
        node_id: &NodeId,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Vec<Arc<Service>>) {
        self.watch_tables(ws, &[tables::NODES, tables::SERVICES]);
        (
            self.tables.max_index_of(&[tables::NODES, tables::SERVICES]),
            self.tables.services.list_by(index::BY_NODE, &ikey(&[node_id])),
        )
    }

    /// All instances of a service name joined with their nodes and the checks
    /// relevant to each instance. The unit behind health queries and the
    /// service-health topics.
    pub fn service_health(
        &self,
        service_name: &str,
        connect_only: bool,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Vec<CheckServiceNode>) {
        self.watch_tables(ws, &[tables::NODES, tables::SERVICES, tables::CHECKS]);
        let idx = self
            .tables
            .max_index_of(&[tables::NODES, tables::SERVICES, tables::CHECKS]);
        (idx, service_health_of(&self.tables, service_name, connect_only))
    }

    // --- Checks ---

    pub fn get_check(
        &self,
        node_id: &NodeId,
        check_id: &str,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Option<Arc<HealthCheck>>) {
        let key = ikey(&[node_id, check_id]);
        self.watch_key(ws, tables::CHECKS, key.clone());
        (self.tables.checks.max_index(), self.tables.checks.get(&key))
    }

    pub fn node_checks(
        &self,
        node_id: &NodeId,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Vec<Arc<HealthCheck>>) {
        self.watch_table(ws, tables::CHECKS);
        (
            self.tables.checks.max_index(),
            self.tables.checks.list_by(index::BY_NODE, &ikey(&[node_id])),
        )
    }

    pub fn checks_in_state(
        &self,
        status: CheckStatus,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Vec<Arc<HealthCheck>>) {
        self.watch_table(ws, tables::CHECKS);
        (
            self.tables.checks.max_index(),
            self.tables
                .checks
                .list_by(index::BY_STATUS, &ikey(&[&status.to_string()])),
        )
    }

    // --- KV ---

    pub fn kv_get(&self, key: &str, ws: Option<&mut WatchSet>) -> (Index, Option<Arc<KvEntry>>) {
        let pk = key.as_bytes().to_vec();
        self.watch_key(ws, tables::KV, pk.clone());
        (self.tables.kv.max_index(), self.tables.kv.get(&pk))
    }

    pub fn kv_list(&self, prefix: &str, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<KvEntry>>) {
        self.watch_table(ws, tables::KV);
        (
            self.tables.kv.max_index(),
            self.tables.kv.list_prefix(prefix.as_bytes()),
        )
    }

    // --- Sessions ---

    pub fn get_session(
        &self,
        session_id: &SessionId,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Option<Arc<Session>>) {
        let key = ikey(&[session_id]);
        self.watch_key(ws, tables::SESSIONS, key.clone());
        (self.tables.sessions.max_index(), self.tables.sessions.get(&key))
    }

    pub fn list_sessions(&self, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<Session>>) {
        self.watch_table(ws, tables::SESSIONS);
        (
            self.tables.sessions.max_index(),
            self.tables.sessions.iter().cloned().collect(),
        )
    }

    // --- Intentions ---

    pub fn get_intention(
        &self,
        id: &str,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Option<Arc<Intention>>) {
        let key = ikey(&[id]);
        self.watch_key(ws, tables::INTENTIONS, key.clone());
        (
            self.tables.intentions.max_index(),
            self.tables.intentions.get(&key),
        )
    }

    pub fn list_intentions(&self, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<Intention>>) {
        self.watch_table(ws, tables::INTENTIONS);
        (
            self.tables.intentions.max_index(),
            self.tables.intentions.iter().cloned().collect(),
        )
    }

    /// The effective allow/deny decision between a source and a destination.
    /// Exact names outrank wildcards; among equals the higher `precedence` wins.
    /// With no matching intention the default is allow.
    pub fn intention_match(
        &self,
        source: &str,
        destination: &str,
        ws: Option<&mut WatchSet>,
    ) -> (Index, IntentionDecision) {
        self.watch_table(ws, tables::INTENTIONS);
        let specificity = |intention: &Intention| -> (u32, u32) {
            let exact = |name: &str, target: &str| (name.eq_ignore_ascii_case(target)) as u32;
            (
                exact(&intention.source, source) + exact(&intention.destination, destination),
                intention.precedence,
            )
        };
        let winner = self
            .tables
            .intentions
            .iter()
            .filter(|i| {
                (i.source == "*" || i.source.eq_ignore_ascii_case(source))
                    && (i.destination == "*" || i.destination.eq_ignore_ascii_case(destination))
            })
            .max_by_key(|i| {
                let i: &Intention = i;
                specificity(i)
            })
            .cloned();

        let decision = IntentionDecision {
            allowed: winner
                .as_ref()
                .map(|i| i.action == crate::core::types::IntentionAction::Allow)
                .unwrap_or(true),
            matched: winner.map(|i| (*i).clone()),
        };
        (self.tables.intentions.max_index(), decision)
    }

    // --- Config entries ---

    pub fn get_config_entry(
        &self,
        kind: &str,
        name: &str,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Option<Arc<ConfigEntry>>) {
        let key = ikey(&[kind, name]);
        self.watch_key(ws, tables::CONFIG_ENTRIES, key.clone());
        (
            self.tables.config_entries.max_index(),
            self.tables.config_entries.get(&key),
        )
    }

    pub fn list_config_entries(
        &self,
        kind: &str,
        ws: Option<&mut WatchSet>,
    ) -> (Index, Vec<Arc<ConfigEntry>>) {
        self.watch_table(ws, tables::CONFIG_ENTRIES);
        let rows = if kind.is_empty() {
            self.tables.config_entries.iter().cloned().collect()
        } else {
            self.tables.config_entries.list_prefix(&ikey_prefix(&[kind]))
        };
        (self.tables.config_entries.max_index(), rows)
    }

    /// Merges `proxy-defaults/global` under `service-defaults/<name>`; the
    /// service entry wins key-by-key at the top level.
    pub fn resolve_service_config(
        &self,
        service_name: &str,
        ws: Option<&mut WatchSet>,
    ) -> (Index, ResolvedServiceConfig) {
        self.watch_table(ws, tables::CONFIG_ENTRIES);
        let defaults = self
            .tables
            .config_entries
            .get(&ikey(&["proxy-defaults", "global"]));
        let specific = self
            .tables
            .config_entries
            .get(&ikey(&["service-defaults", service_name]));

        let mut merged = serde_json::Map::new();
        for entry in [defaults, specific].into_iter().flatten() {
            if let serde_json::Value::Object(map) = &entry.content {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        (
            self.tables.config_entries.max_index(),
            ResolvedServiceConfig {
                service_name: service_name.to_string(),
                config: serde_json::Value::Object(merged),
            },
        )
    }

    // --- CA roots ---

    pub fn active_ca_root(&self, ws: Option<&mut WatchSet>) -> (Index, Option<Arc<CaRoot>>) {
        self.watch_table(ws, tables::CA_ROOTS);
        (
            self.tables.ca_roots.max_index(),
            self.tables.ca_roots.get_by(index::BY_ACTIVE, &ikey(&["active"])),
        )
    }

    pub fn list_ca_roots(&self, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<CaRoot>>) {
        self.watch_table(ws, tables::CA_ROOTS);
        (
            self.tables.ca_roots.max_index(),
            self.tables.ca_roots.iter().cloned().collect(),
        )
    }

    // --- Peerings ---

    pub fn get_peering(&self, name: &str, ws: Option<&mut WatchSet>) -> (Index, Option<Arc<Peering>>) {
        let key = ikey(&[name]);
        self.watch_key(ws, tables::PEERINGS, key.clone());
        (self.tables.peerings.max_index(), self.tables.peerings.get(&key))
    }

    pub fn list_peerings(&self, ws: Option<&mut WatchSet>) -> (Index, Vec<Arc<Peering>>) {
        self.watch_table(ws, tables::PEERINGS);
        (
            self.tables.peerings.max_index(),
            self.tables.peerings.iter().cloned().collect(),
        )
    }
}
