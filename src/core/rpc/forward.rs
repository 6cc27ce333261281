// src/core/rpc/forward.rs

//! Topology-aware request routing: remote datacenter first, then leader, then
//! serve locally from a read transaction.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::blocking::blocking_query;
use super::pool::ConnectionPool;
use super::{
    ClientFrame, ReadBody, RpcRequest, RpcRequestBody, RpcResponse, ServerFrame,
};
use crate::core::autopilot::ClusterHealth;
use crate::core::clock::Clock;
use crate::core::errors::MusterError;
use crate::core::events::{AuthzResolver, EventPublisher};
use crate::core::log::LogHandle;
use crate::core::membership::{MemberStatus, Membership};
use crate::core::metrics;
use crate::core::store::Store;
use crate::core::subscribe;
use crate::core::types::{QueryMeta, QueryOptions, ReadRequest};

/// Everything needed to route and serve one datacenter's RPC traffic.
pub struct Router {
    datacenter: String,
    store: Arc<Store>,
    publisher: Arc<EventPublisher>,
    log: Arc<dyn LogHandle>,
    membership: Arc<dyn Membership>,
    authz: Arc<dyn AuthzResolver>,
    pool: ConnectionPool,
    clock: Clock,
    /// The latest autopilot summary; `ServerHealth` reads serve from here.
    cluster_health: watch::Receiver<ClusterHealth>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datacenter: String,
        store: Arc<Store>,
        publisher: Arc<EventPublisher>,
        log: Arc<dyn LogHandle>,
        membership: Arc<dyn Membership>,
        authz: Arc<dyn AuthzResolver>,
        clock: Clock,
        cluster_health: watch::Receiver<ClusterHealth>,
    ) -> Self {
        Self {
            datacenter,
            store,
            publisher,
            log,
            membership,
            authz,
            pool: ConnectionPool::new(),
            clock,
            cluster_health,
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    pub fn log(&self) -> &Arc<dyn LogHandle> {
        &self.log
    }

    pub fn authz(&self) -> &Arc<dyn AuthzResolver> {
        &self.authz
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Routes one request to the right server and returns its response.
    ///
    /// Routing order: explicit remote datacenter, then the leader for writes
    /// and consistent reads, then a local read transaction.
    pub async fn dispatch(&self, request: RpcRequest) -> Result<RpcResponse, MusterError> {
        if !request.datacenter.is_empty() && request.datacenter != self.datacenter {
            return self.forward_dc(request).await;
        }

        match &request.body {
            RpcRequestBody::Write(_) => {
                if self.log.is_leader() {
                    self.apply_write(request).await
                } else {
                    self.forward_leader(request).await
                }
            }
            RpcRequestBody::Read { read, options } => {
                let needs_leader = !options.allow_stale
                    && (options.require_consistent || read.requires_leader());
                if needs_leader && !self.log.is_leader() {
                    self.forward_leader(request).await
                } else {
                    let (read, options) = (read.clone(), options.clone());
                    self.serve_read(&read, &options).await
                }
            }
            RpcRequestBody::Subscribe(_) => Err(MusterError::InvalidRequest(
                "subscriptions require a streaming connection".into(),
            )),
        }
    }

    /// Serves a subscription request on a streaming connection, proxying to the
    /// target datacenter transparently when the request names a remote one.
    pub async fn serve_subscription(
        self: &Arc<Self>,
        client: ClientFrame,
        reply_tx: mpsc::Sender<ServerFrame>,
    ) {
        subscribe::serve(self, client, reply_tx).await;
    }

    async fn apply_write(&self, request: RpcRequest) -> Result<RpcResponse, MusterError> {
        let RpcRequestBody::Write(mut write) = request.body else {
            return Err(MusterError::Internal("apply_write on non-write".into()));
        };
        // IDs are allocated here, on the leader, before the entry is appended.
        // The FSM must never invent one.
        match &mut write {
            crate::core::types::Request::SessionCreate { session } if session.id.is_empty() => {
                session.id = uuid::Uuid::new_v4().to_string();
            }
            crate::core::types::Request::IntentionApply { intention }
                if intention.id.is_empty() =>
            {
                intention.id = uuid::Uuid::new_v4().to_string();
            }
            crate::core::types::Request::CaRootRotate { root } if root.id.is_empty() => {
                root.id = uuid::Uuid::new_v4().to_string();
            }
            crate::core::types::Request::PeeringWrite { peering } if peering.id.is_empty() => {
                peering.id = uuid::Uuid::new_v4().to_string();
            }
            _ => {}
        }
        let index = self.log.submit(write).await?;
        Ok(RpcResponse::Write { index })
    }

    async fn forward_leader(&self, request: RpcRequest) -> Result<RpcResponse, MusterError> {
        let addr = self.log.leader_addr().ok_or(MusterError::NoLeader)?;
        metrics::RPC_FORWARDED_TOTAL.with_label_values(&["leader"]).inc();
        debug!(leader = %addr, "forwarding request to leader");
        self.call_with_retry(&addr, request).await
    }

    async fn forward_dc(&self, request: RpcRequest) -> Result<RpcResponse, MusterError> {
        let addr = self.server_in_dc(&request.datacenter)?;
        metrics::RPC_FORWARDED_TOTAL
            .with_label_values(&["datacenter"])
            .inc();
        debug!(datacenter = %request.datacenter, server = %addr, "forwarding request cross-datacenter");
        self.call_with_retry(&addr, request).await
    }

    /// Picks an alive server in the target datacenter from the WAN ring.
    pub(crate) fn server_in_dc(&self, datacenter: &str) -> Result<String, MusterError> {
        self.membership
            .wan_members()
            .iter()
            .find(|m| {
                m.datacenter == datacenter && m.is_server() && m.status == MemberStatus::Alive
            })
            .map(|m| m.address.clone())
            .ok_or_else(|| MusterError::NoDcPath(datacenter.to_string()))
    }

    /// Forwarded requests are retried at most once, and only on a connection
    /// that closed under us; anything else surfaces.
    async fn call_with_retry(
        &self,
        addr: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse, MusterError> {
        match self.pool.call(addr, request.clone()).await {
            Err(MusterError::RpcClosed) => {
                self.pool.discard(addr);
                self.pool.call(addr, request).await
            }
            other => other,
        }
    }

    fn meta(&self, index: u64) -> QueryMeta {
        QueryMeta {
            index,
            last_contact: self.log.last_leader_contact(),
            known_leader: self.log.is_leader() || self.log.leader_addr().is_some(),
        }
    }

    /// Serves a read from the local store under blocking-query semantics.
    pub async fn serve_read(
        &self,
        read: &ReadRequest,
        options: &QueryOptions,
    ) -> Result<RpcResponse, MusterError> {
        let timer = metrics::RPC_LATENCY_SECONDS.start_timer();

        // Reads that don't come out of the state store answer immediately.
        match read {
            ReadRequest::ServerHealth => {
                let health = self.cluster_health.borrow().clone();
                let index = self.store.last_index();
                timer.observe_duration();
                return Ok(RpcResponse::Read {
                    body: ReadBody::ServerHealth(health),
                    meta: self.meta(index),
                });
            }
            ReadRequest::RaftConfiguration => {
                let config = self.log.configuration();
                let index = config.index;
                timer.observe_duration();
                return Ok(RpcResponse::Read {
                    body: ReadBody::RaftConfiguration(config),
                    meta: self.meta(index),
                });
            }
            ReadRequest::ListDatacenters => {
                let index = self.store.last_index();
                timer.observe_duration();
                return Ok(RpcResponse::Read {
                    body: ReadBody::Datacenters(self.membership.datacenters()),
                    meta: self.meta(index),
                });
            }
            _ => {}
        }

        let (index, body) = blocking_query(&self.store, &self.clock, options, |txn, ws| {
            serve_store_read(txn, ws, read)
        })
        .await;
        timer.observe_duration();
        Ok(RpcResponse::Read {
            body,
            meta: self.meta(index),
        })
    }
}

/// One store-backed read, executed against a snapshot with optional watch
/// registration. Shared by the first run and every blocking re-run.
fn serve_store_read(
    txn: &crate::core::store::reads::ReadTxn<'_>,
    ws: Option<&mut crate::core::store::WatchSet>,
    read: &ReadRequest,
) -> (u64, ReadBody) {
    match read {
        ReadRequest::GetNode { node_id } => {
            let (idx, node) = txn.get_node(node_id, ws);
            (idx, ReadBody::Node(node.map(|n| (*n).clone())))
        }
        ReadRequest::ListNodes => {
            let (idx, nodes) = txn.list_nodes(ws);
            (
                idx,
                ReadBody::Nodes(nodes.into_iter().map(|n| (*n).clone()).collect()),
            )
        }
        ReadRequest::ServiceHealth { service_name } => {
            let (idx, entries) = txn.service_health(service_name, false, ws);
            (idx, ReadBody::ServiceHealth(entries))
        }
        ReadRequest::ServiceHealthConnect { service_name } => {
            let (idx, entries) = txn.service_health(service_name, true, ws);
            (idx, ReadBody::ServiceHealth(entries))
        }
        ReadRequest::ListServices => {
            let (idx, services) = txn.list_services(ws);
            (
                idx,
                ReadBody::Services(services.into_iter().map(|s| (*s).clone()).collect()),
            )
        }
        ReadRequest::NodeServices { node_id } => {
            let (idx, services) = txn.node_services(node_id, ws);
            (
                idx,
                ReadBody::Services(services.into_iter().map(|s| (*s).clone()).collect()),
            )
        }
        ReadRequest::GetCheck { node_id, check_id } => {
            let (idx, check) = txn.get_check(node_id, check_id, ws);
            (idx, ReadBody::Check(check.map(|c| (*c).clone())))
        }
        ReadRequest::NodeChecks { node_id } => {
            let (idx, checks) = txn.node_checks(node_id, ws);
            (
                idx,
                ReadBody::Checks(checks.into_iter().map(|c| (*c).clone()).collect()),
            )
        }
        ReadRequest::ChecksInState { status } => {
            let (idx, checks) = txn.checks_in_state(*status, ws);
            (
                idx,
                ReadBody::Checks(checks.into_iter().map(|c| (*c).clone()).collect()),
            )
        }
        ReadRequest::KvGet { key } => {
            let (idx, entry) = txn.kv_get(key, ws);
            (idx, ReadBody::Kv(entry.map(|e| (*e).clone())))
        }
        ReadRequest::KvList { prefix } => {
            let (idx, entries) = txn.kv_list(prefix, ws);
            (
                idx,
                ReadBody::KvList(entries.into_iter().map(|e| (*e).clone()).collect()),
            )
        }
        ReadRequest::GetSession { session_id } => {
            let (idx, session) = txn.get_session(session_id, ws);
            (idx, ReadBody::Session(session.map(|s| (*s).clone())))
        }
        ReadRequest::ListSessions => {
            let (idx, sessions) = txn.list_sessions(ws);
            (
                idx,
                ReadBody::Sessions(sessions.into_iter().map(|s| (*s).clone()).collect()),
            )
        }
        ReadRequest::GetIntention { id } => {
            let (idx, intention) = txn.get_intention(id, ws);
            (idx, ReadBody::Intention(intention.map(|i| (*i).clone())))
        }
        ReadRequest::ListIntentions => {
            let (idx, intentions) = txn.list_intentions(ws);
            (
                idx,
                ReadBody::Intentions(intentions.into_iter().map(|i| (*i).clone()).collect()),
            )
        }
        ReadRequest::IntentionMatch {
            source,
            destination,
        } => {
            let (idx, decision) = txn.intention_match(source, destination, ws);
            (idx, ReadBody::IntentionDecision(decision))
        }
        ReadRequest::GetConfigEntry { kind, name } => {
            let (idx, entry) = txn.get_config_entry(kind, name, ws);
            (idx, ReadBody::ConfigEntry(entry.map(|e| (*e).clone())))
        }
        ReadRequest::ListConfigEntries { kind } => {
            let (idx, entries) = txn.list_config_entries(kind, ws);
            (
                idx,
                ReadBody::ConfigEntries(entries.into_iter().map(|e| (*e).clone()).collect()),
            )
        }
        ReadRequest::ResolveServiceConfig { service_name } => {
            let (idx, resolved) = txn.resolve_service_config(service_name, ws);
            (idx, ReadBody::ResolvedServiceConfig(resolved))
        }
        ReadRequest::ActiveCaRoot => {
            let (idx, root) = txn.active_ca_root(ws);
            (idx, ReadBody::CaRoot(root.map(|r| (*r).clone())))
        }
        ReadRequest::ListCaRoots => {
            let (idx, roots) = txn.list_ca_roots(ws);
            (
                idx,
                ReadBody::CaRoots(roots.into_iter().map(|r| (*r).clone()).collect()),
            )
        }
        ReadRequest::GetPeering { name } => {
            let (idx, peering) = txn.get_peering(name, ws);
            (idx, ReadBody::Peering(peering.map(|p| (*p).clone())))
        }
        ReadRequest::ListPeerings => {
            let (idx, peerings) = txn.list_peerings(ws);
            (
                idx,
                ReadBody::Peerings(peerings.into_iter().map(|p| (*p).clone()).collect()),
            )
        }
        // Handled before the blocking loop.
        ReadRequest::ServerHealth
        | ReadRequest::RaftConfiguration
        | ReadRequest::ListDatacenters => (0, ReadBody::Datacenters(Vec::new())),
    }
}
