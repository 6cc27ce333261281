// src/core/types/mod.rs

//! The catalog data model: nodes, services, health checks, sessions, KV entries,
//! intentions, config entries, CA roots and peerings.
//!
//! Every entity carries `create_idx`/`modify_idx`, both tagged by the log index of
//! the write that produced them. The FSM is the sole writer of these fields.

pub mod requests;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use strum_macros::{Display, EnumString};

pub use requests::{ReadRequest, Request};

/// Serde adapters that carry a `serde_json::Value` as its canonical JSON string.
/// The wire and snapshot encodings are bincode, which cannot deserialize
/// self-describing values directly.
pub mod json_value {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(v: &serde_json::Value, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<serde_json::Value, D::Error> {
        let raw = String::deserialize(d)?;
        serde_json::from_str(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(
            v: &Option<serde_json::Value>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match v {
                Some(value) => s.serialize_some(&value.to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<serde_json::Value>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|s| serde_json::from_str(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// A log index. Monotone non-decreasing over the cluster.
pub type Index = u64;

pub type NodeId = String;
pub type ServiceId = String;
pub type CheckId = String;
pub type SessionId = String;

/// The liveness of a node as reflected in the catalog.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Alive,
    Failed,
    Left,
}

/// A node in the catalog. Unique by `(datacenter, id)`; `name` is unique per
/// datacenter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub datacenter: String,
    #[serde(default)]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// The role a service instance plays in the mesh.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// A plain service instance, directly addressable.
    #[default]
    Typical,
    /// A sidecar proxying traffic for another service.
    ConnectProxy,
    MeshGateway,
    IngressGateway,
}

/// Relative weights applied to an instance when load-balancing across health states.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weights {
    pub passing: u32,
    pub warning: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

/// A service instance registered on a node. Unique by `(node_id, id)`; many
/// instances share a `name`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Service {
    pub id: ServiceId,
    pub node_id: NodeId,
    pub name: String,
    /// Ordered; order is preserved through registration round-trips.
    #[serde(default)]
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub kind: ServiceKind,
    /// Opaque proxy configuration consumed by sidecar generators downstream.
    #[serde(default, with = "json_value::option")]
    pub proxy_config: Option<serde_json::Value>,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub enable_tag_override: bool,
    /// True when the workload itself terminates mesh connections.
    #[serde(default)]
    pub connect_native: bool,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

impl Service {
    /// Whether this instance participates in the mesh (directly or via a proxy).
    pub fn is_connect_enabled(&self) -> bool {
        self.connect_native || self.kind == ServiceKind::ConnectProxy
    }
}

/// The health state of a check.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    #[default]
    Passing,
    Warning,
    Critical,
    Maintenance,
}

/// How a check is executed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CheckDefinition {
    /// The agent must receive an update within `ttl` or the check goes critical.
    Ttl {
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },
    Http {
        url: String,
        #[serde(with = "humantime_serde")]
        interval: Duration,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    Tcp {
        address: String,
        #[serde(with = "humantime_serde")]
        interval: Duration,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
}

impl Default for CheckDefinition {
    fn default() -> Self {
        CheckDefinition::Ttl {
            ttl: Duration::from_secs(30),
        }
    }
}

/// A health check. Unique by `(node_id, id)`. When `service_id` is present the
/// service must exist on the same node at the moment the check is written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HealthCheck {
    pub id: CheckId,
    pub node_id: NodeId,
    #[serde(default)]
    pub service_id: Option<ServiceId>,
    pub name: String,
    #[serde(default)]
    pub status: CheckStatus,
    #[serde(default)]
    pub notes: String,
    /// Probe output, bounded by the agent before it ever reaches the server.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub definition: CheckDefinition,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// What happens to KV locks held by a session when the session is destroyed.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Locks are released; the KV entries stay.
    #[default]
    Release,
    /// Locked KV entries are deleted along with the session.
    Delete,
}

/// A session, the liveness anchor for KV locks. Destroyed when its node is
/// deregistered or its TTL lapses without renewal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Session {
    pub id: SessionId,
    pub node_id: NodeId,
    pub name: String,
    #[serde(default)]
    pub behavior: SessionBehavior,
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
    /// The authoritative attachment set; checks hold no pointer back.
    #[serde(default)]
    pub attached_check_ids: Vec<CheckId>,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// A versioned KV entry. `session` is a foreign key to the lock holder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct KvEntry {
    pub key: String,
    pub value: bytes::Bytes,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub session: Option<SessionId>,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// Whether an intention permits or denies traffic.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IntentionAction {
    Allow,
    Deny,
}

/// An authorization rule between two named services.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Intention {
    pub id: String,
    pub source: String,
    pub destination: String,
    pub action: IntentionAction,
    /// Higher precedence wins during `Match`; exact names outrank wildcards.
    #[serde(default)]
    pub precedence: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// An opaque, ordered configuration record consumed by downstream generators.
/// `content` is a tagged value; the publisher's change extractor is the only
/// place that switches on `kind`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub kind: String,
    pub name: String,
    #[serde(with = "json_value")]
    pub content: serde_json::Value,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// A certificate-authority root. Exactly one root is active at any time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CaRoot {
    pub id: String,
    pub serial: u64,
    pub not_before: u64,
    pub not_after: u64,
    pub cert_pem: String,
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// Lifecycle of a cross-cluster peering.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeeringState {
    #[default]
    Pending,
    Establishing,
    Active,
    Failing,
    Terminated,
    Deleted,
}

/// A peering with a remote cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Peering {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub state: PeeringState,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub remote_server_addrs: Vec<String>,
    #[serde(default)]
    pub create_idx: Index,
    #[serde(default)]
    pub modify_idx: Index,
}

/// Options attached to every read RPC.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct QueryOptions {
    #[serde(default)]
    pub token: String,
    /// Empty means the local datacenter.
    #[serde(default)]
    pub datacenter: String,
    /// Blocking threshold: the read blocks until the table advances past this.
    #[serde(default)]
    pub min_index: Index,
    /// Upper bound on the blocking wait. Zero means a plain non-blocking read.
    #[serde(default, with = "humantime_serde::option")]
    pub max_wait: Option<Duration>,
    #[serde(default)]
    pub require_consistent: bool,
    #[serde(default)]
    pub allow_stale: bool,
}

/// Metadata attached to every read response. `index` is fed back as the next
/// call's `min_index`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct QueryMeta {
    pub index: Index,
    /// How long ago this server last heard from the leader; a staleness marker.
    #[serde(default, with = "humantime_serde::option")]
    pub last_contact: Option<Duration>,
    #[serde(default)]
    pub known_leader: bool,
}

/// A node paired with one of its services and the checks relevant to that pair,
/// the unit served by health queries and the service-health topics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: Service,
    /// Node-level checks followed by checks bound to this service.
    pub checks: Vec<HealthCheck>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_round_trips_through_strings() {
        for status in [
            CheckStatus::Passing,
            CheckStatus::Warning,
            CheckStatus::Critical,
            CheckStatus::Maintenance,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<CheckStatus>().unwrap(), status);
        }
    }

    #[test]
    fn connect_enabled_covers_native_and_proxy() {
        let mut svc = Service {
            kind: ServiceKind::ConnectProxy,
            ..Default::default()
        };
        assert!(svc.is_connect_enabled());
        svc.kind = ServiceKind::Typical;
        assert!(!svc.is_connect_enabled());
        svc.connect_native = true;
        assert!(svc.is_connect_enabled());
    }
}
