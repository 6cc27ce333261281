// src/server/context.rs

//! Builds the fully-wired server context: store, publisher, FSM, log,
//! membership, router and autopilot, all value-owned and passed explicitly.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::Config;
use crate::core::autopilot::{Autopilot, ClusterHealth};
use crate::core::clock::Clock;
use crate::core::events::{AllowAllResolver, EventPublisher};
use crate::core::fsm::Fsm;
use crate::core::keyring::Keyring;
use crate::core::log::{InMemoryLog, LogHandle};
use crate::core::membership::{Member, MemberRole, MemberStatus, Membership, StaticMembership};
use crate::core::rpc::Router;
use crate::core::store::Store;

/// Everything a running server owns. Tests build one per case; nothing is
/// global.
pub struct ServerContext {
    /// A unique id for this process instance, used in peer handshakes and logs.
    pub run_id: String,
    pub config: Config,
    pub clock: Clock,
    pub store: Arc<Store>,
    pub publisher: Arc<EventPublisher>,
    pub fsm: Arc<Fsm>,
    pub log: Arc<InMemoryLog>,
    pub membership: Arc<StaticMembership>,
    pub router: Arc<Router>,
    pub autopilot: Arc<Autopilot>,
    pub cluster_health: watch::Receiver<ClusterHealth>,
    pub keyring: Option<Keyring>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

/// Wires the core components together in dependency order. The in-memory log
/// and static membership stand in for the external consensus and gossip
/// collaborators; swapping in real ones only touches this function.
pub async fn build(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    let mut run_id_bytes = [0u8; 16];
    getrandom::fill(&mut run_id_bytes)
        .map_err(|e| anyhow::anyhow!("generating run id: {e}"))?;
    let run_id = hex::encode(run_id_bytes);

    let clock = Clock::new();
    let store = Arc::new(Store::new());
    let publisher = Arc::new(EventPublisher::new());
    store.set_commit_sink(publisher.clone());

    let fsm = Arc::new(Fsm::new(store.clone()));
    let log = Arc::new(InMemoryLog::new(fsm.clone()));
    log.set_leader(true, Some(config.node.advertise_addr.clone()));

    let membership = Arc::new(StaticMembership::new());
    let this_member = Member {
        name: config.node.name.clone(),
        address: config.node.advertise_addr.clone(),
        status: MemberStatus::Alive,
        role: MemberRole::Server,
        datacenter: config.node.datacenter.clone(),
        protocol_version: 3,
        build: env!("CARGO_PKG_VERSION").to_string(),
        tags: Default::default(),
        status_since: Default::default(),
    };
    membership.set_members(vec![this_member.clone()]);
    membership.set_wan_members(vec![this_member]);

    let (autopilot, cluster_health) = Autopilot::new(
        config.autopilot.clone(),
        log.clone() as Arc<dyn LogHandle>,
        membership.clone() as Arc<dyn Membership>,
        clock.clone(),
    );

    let router = Arc::new(Router::new(
        config.node.datacenter.clone(),
        store.clone(),
        publisher.clone(),
        log.clone() as Arc<dyn LogHandle>,
        membership.clone() as Arc<dyn Membership>,
        Arc::new(AllowAllResolver),
        clock.clone(),
        cluster_health.clone(),
    ));

    let keyring = if config.keyring_file.is_empty() {
        None
    } else {
        Some(Keyring::load(&config.keyring_file).await?)
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    tracing::info!(%run_id, "server context assembled");

    Ok(ServerContext {
        run_id,
        config,
        clock,
        store,
        publisher,
        fsm,
        log,
        membership,
        router,
        autopilot,
        cluster_health,
        keyring,
        shutdown_tx,
        log_reload_handle,
    })
}
