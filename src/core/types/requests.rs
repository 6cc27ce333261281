// src/core/types/requests.rs

//! The closed set of write and read operations carried over the wire and through
//! the replicated log.
//!
//! Determinism rule: anything the FSM must not invent (IDs, timestamps) is
//! allocated by the leader and travels inside the `Request` itself.

use super::{
    CaRoot, CheckId, ConfigEntry, HealthCheck, Index, Intention, Node, NodeId, Peering, Service,
    ServiceId, SessionId,
};
use serde::{Deserialize, Serialize};

/// A write operation, applied by the FSM at exactly one log index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Request {
    /// Registers or updates a node, optionally with a service and checks in one
    /// atomic entry (the shape anti-entropy sends).
    RegisterNode {
        node: Node,
        #[serde(default)]
        service: Option<Service>,
        #[serde(default)]
        checks: Vec<HealthCheck>,
    },
    /// Removes a node and cascades to its services, checks and sessions.
    DeregisterNode { node_id: NodeId },
    RegisterService {
        node_id: NodeId,
        service: Service,
    },
    DeregisterService {
        node_id: NodeId,
        service_id: ServiceId,
    },
    UpdateCheck {
        check: HealthCheck,
    },
    DeregisterCheck {
        node_id: NodeId,
        check_id: CheckId,
    },
    KvSet {
        key: String,
        value: bytes::Bytes,
        flags: u64,
        /// When set, acquire the entry's lock for this session.
        #[serde(default)]
        acquire_session: Option<SessionId>,
        /// When set, release the entry's lock held by this session.
        #[serde(default)]
        release_session: Option<SessionId>,
    },
    KvDelete {
        key: String,
    },
    /// Compare-and-set: succeeds iff the current row's `modify_idx == expected_idx`
    /// (0 means "must not exist").
    KvCas {
        key: String,
        value: bytes::Bytes,
        flags: u64,
        expected_idx: Index,
    },
    SessionCreate {
        session: super::Session,
    },
    /// Renewal is a log entry so replicas agree on liveness.
    SessionRenew {
        session_id: SessionId,
    },
    SessionDestroy {
        session_id: SessionId,
    },
    IntentionApply {
        intention: Intention,
    },
    IntentionDelete {
        id: String,
    },
    ConfigEntryApply {
        entry: ConfigEntry,
    },
    ConfigEntryDelete {
        kind: String,
        name: String,
    },
    /// Installs a new root and marks it active; the previous active root is
    /// retained in the chain with `active=false`.
    CaRootRotate {
        root: CaRoot,
    },
    PeeringWrite {
        peering: Peering,
    },
    PeeringDelete {
        name: String,
    },
}

impl Request {
    /// A short operation name for logs and metrics labels.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::RegisterNode { .. } => "register-node",
            Request::DeregisterNode { .. } => "deregister-node",
            Request::RegisterService { .. } => "register-service",
            Request::DeregisterService { .. } => "deregister-service",
            Request::UpdateCheck { .. } => "update-check",
            Request::DeregisterCheck { .. } => "deregister-check",
            Request::KvSet { .. } => "kv-set",
            Request::KvDelete { .. } => "kv-delete",
            Request::KvCas { .. } => "kv-cas",
            Request::SessionCreate { .. } => "session-create",
            Request::SessionRenew { .. } => "session-renew",
            Request::SessionDestroy { .. } => "session-destroy",
            Request::IntentionApply { .. } => "intention-apply",
            Request::IntentionDelete { .. } => "intention-delete",
            Request::ConfigEntryApply { .. } => "config-entry-apply",
            Request::ConfigEntryDelete { .. } => "config-entry-delete",
            Request::CaRootRotate { .. } => "ca-root-rotate",
            Request::PeeringWrite { .. } => "peering-write",
            Request::PeeringDelete { .. } => "peering-delete",
        }
    }
}

/// A read operation, served from a store snapshot (optionally blocking).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ReadRequest {
    GetNode { node_id: NodeId },
    ListNodes,
    /// All instances of a service name, joined with their nodes and checks.
    ServiceHealth { service_name: String },
    /// Like `ServiceHealth` but restricted to mesh-capable instances.
    ServiceHealthConnect { service_name: String },
    ListServices,
    NodeServices { node_id: NodeId },
    GetCheck { node_id: NodeId, check_id: CheckId },
    NodeChecks { node_id: NodeId },
    ChecksInState { status: super::CheckStatus },
    KvGet { key: String },
    KvList { prefix: String },
    GetSession { session_id: SessionId },
    ListSessions,
    GetIntention { id: String },
    ListIntentions,
    /// The effective allow/deny decision between a source and a destination.
    IntentionMatch { source: String, destination: String },
    GetConfigEntry { kind: String, name: String },
    ListConfigEntries { kind: String },
    /// A service's effective config: defaults merged with service-specific entries.
    ResolveServiceConfig { service_name: String },
    ActiveCaRoot,
    ListCaRoots,
    GetPeering { name: String },
    ListPeerings,
    /// Per-server autopilot health, leader-only.
    ServerHealth,
    /// The voter/non-voter configuration as the log collaborator sees it.
    RaftConfiguration,
    ListDatacenters,
}

impl ReadRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            ReadRequest::GetNode { .. } => "get-node",
            ReadRequest::ListNodes => "list-nodes",
            ReadRequest::ServiceHealth { .. } => "service-health",
            ReadRequest::ServiceHealthConnect { .. } => "service-health-connect",
            ReadRequest::ListServices => "list-services",
            ReadRequest::NodeServices { .. } => "node-services",
            ReadRequest::GetCheck { .. } => "get-check",
            ReadRequest::NodeChecks { .. } => "node-checks",
            ReadRequest::ChecksInState { .. } => "checks-in-state",
            ReadRequest::KvGet { .. } => "kv-get",
            ReadRequest::KvList { .. } => "kv-list",
            ReadRequest::GetSession { .. } => "get-session",
            ReadRequest::ListSessions => "list-sessions",
            ReadRequest::GetIntention { .. } => "get-intention",
            ReadRequest::ListIntentions => "list-intentions",
            ReadRequest::IntentionMatch { .. } => "intention-match",
            ReadRequest::GetConfigEntry { .. } => "get-config-entry",
            ReadRequest::ListConfigEntries { .. } => "list-config-entries",
            ReadRequest::ResolveServiceConfig { .. } => "resolve-service-config",
            ReadRequest::ActiveCaRoot => "active-ca-root",
            ReadRequest::ListCaRoots => "list-ca-roots",
            ReadRequest::GetPeering { .. } => "get-peering",
            ReadRequest::ListPeerings => "list-peerings",
            ReadRequest::ServerHealth => "server-health",
            ReadRequest::RaftConfiguration => "raft-configuration",
            ReadRequest::ListDatacenters => "list-datacenters",
        }
    }

    /// Reads that must be answered by the leader unless the caller allows
    /// staleness.
    pub fn requires_leader(&self) -> bool {
        matches!(
            self,
            ReadRequest::ServerHealth | ReadRequest::RaftConfiguration
        )
    }
}
