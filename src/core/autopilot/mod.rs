// src/core/autopilot/mod.rs

//! The autopilot control loop: keeps the quorum healthy by promoting stabilized
//! non-voters, cleaning up dead servers, and publishing a cluster-health
//! summary.
//!
//! Leader-only. The loop prefers availability over self-inflicted quorum loss:
//! cleanup is skipped entirely whenever the dead servers form a majority-ish
//! fraction, and retried on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AutopilotConfig;
use crate::core::clock::Clock;
use crate::core::log::LogHandle;
use crate::core::membership::{Member, MemberStatus, Membership};
use crate::core::metrics;

/// Health of one server as autopilot computed it on the last tick.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ServerHealth {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    pub voter: bool,
    /// How long the server has been continuously healthy.
    #[serde(default, with = "humantime_serde")]
    pub stable_for: Duration,
    #[serde(default, with = "humantime_serde::option")]
    pub last_contact: Option<Duration>,
    pub last_index: u64,
    pub last_term: u64,
}

/// The published cluster-health summary.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClusterHealth {
    pub servers: Vec<ServerHealth>,
    /// True when every known server is healthy.
    pub healthy: bool,
    /// Voting servers the cluster can lose while keeping quorum.
    pub failure_tolerance: u64,
    pub voters: u64,
}

/// The reconciliation loop. Construct with [`Autopilot::new`], then spawn
/// [`Autopilot::run`].
pub struct Autopilot {
    config: AutopilotConfig,
    log: Arc<dyn LogHandle>,
    membership: Arc<dyn Membership>,
    clock: Clock,
    health_tx: watch::Sender<ClusterHealth>,
    /// When each server was first observed healthy in its current streak.
    stable_since: Mutex<HashMap<String, Instant>>,
}

impl Autopilot {
    pub fn new(
        config: AutopilotConfig,
        log: Arc<dyn LogHandle>,
        membership: Arc<dyn Membership>,
        clock: Clock,
    ) -> (Arc<Self>, watch::Receiver<ClusterHealth>) {
        let (health_tx, health_rx) = watch::channel(ClusterHealth::default());
        let autopilot = Arc::new(Self {
            config,
            log,
            membership,
            clock,
            health_tx,
            stable_since: Mutex::new(HashMap::new()),
        });
        (autopilot, health_rx)
    }

    /// Spawns the reconciliation and health-polling loops and runs until
    /// shutdown. Mirrors the structure of the main tick loop plus a faster
    /// health poll.
    pub async fn run(self: Arc<Self>, shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval = ?self.config.interval,
            health_interval = ?self.config.health_interval,
            "autopilot started"
        );
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(self.clone().run_reconcile_loop(shutdown_rx.resubscribe()));
        tasks.spawn(self.clone().run_health_loop(shutdown_rx));
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "autopilot sub-task exited abnormally");
            }
        }
    }

    async fn run_reconcile_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = self.clock.interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.log.is_leader() {
                        continue;
                    }
                    // A successful promotion kicks an immediate follow-up tick
                    // so a matching removal doesn't wait a full interval.
                    if self.reconcile().await {
                        self.reconcile().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("autopilot reconcile loop shutting down.");
                    return;
                }
            }
        }
    }

    async fn run_health_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = self.clock.interval(self.config.health_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.log.is_leader() {
                        let health = self.compute_health();
                        self.publish_health(health);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("autopilot health loop shutting down.");
                    return;
                }
            }
        }
    }

    /// One reconciliation pass. Returns true when a promotion happened.
    pub async fn reconcile(&self) -> bool {
        let health = self.compute_health();
        let promoted = self.promote_stabilized(&health).await;
        self.cleanup_dead(&health).await;
        self.publish_health(health);
        promoted
    }

    /// Computes per-server health from the gossip view and the log profiles.
    /// A server is healthy iff it is alive in gossip, its last contact is
    /// within the threshold, and its log is within `max_trailing_logs` of the
    /// leader's.
    pub fn compute_health(&self) -> ClusterHealth {
        let members: HashMap<String, Member> = self
            .membership
            .members()
            .into_iter()
            .filter(|m| m.is_server())
            .map(|m| (m.name.clone(), m))
            .collect();
        let profiles: HashMap<String, _> = self
            .log
            .server_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let config = self.log.configuration();
        let leader_index = self.log.last_index();
        let now = self.clock.now();
        let mut stable_since = self.stable_since.lock();

        let mut servers = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let member = members.get(&server.id);
            let profile = profiles.get(&server.id);

            let alive = member.map(|m| m.status == MemberStatus::Alive).unwrap_or(false);
            let contact_ok = profile
                .and_then(|p| p.last_contact)
                .map(|c| c < self.config.last_contact_threshold)
                // The leader has no last-contact for itself.
                .unwrap_or(alive);
            let last_index = profile.map(|p| p.last_index).unwrap_or(0);
            let caught_up = leader_index.saturating_sub(last_index) <= self.config.max_trailing_logs;
            let healthy = alive && contact_ok && caught_up;

            let stable_for = if healthy {
                let since = stable_since.entry(server.id.clone()).or_insert(now);
                now.duration_since(*since)
            } else {
                stable_since.remove(&server.id);
                Duration::ZERO
            };

            servers.push(ServerHealth {
                id: server.id.clone(),
                address: server.address.clone(),
                healthy,
                voter: server.voter,
                stable_for,
                last_contact: profile.and_then(|p| p.last_contact),
                last_index,
                last_term: profile.map(|p| p.last_term).unwrap_or(0),
            });
        }

        let voters = servers.iter().filter(|s| s.voter).count() as u64;
        let healthy_voters = servers.iter().filter(|s| s.voter && s.healthy).count() as u64;
        let quorum = voters.div_ceil(2);
        ClusterHealth {
            healthy: servers.iter().all(|s| s.healthy),
            failure_tolerance: healthy_voters.saturating_sub(quorum),
            voters,
            servers,
        }
    }

    /// Promotes non-voters that have been healthy past the stabilization
    /// window. Promotions apply immediately rather than waiting for odd voter
    /// parity; dead-server cleanup is conservative enough to compensate.
    async fn promote_stabilized(&self, health: &ClusterHealth) -> bool {
        let min_protocol = self
            .membership
            .members()
            .iter()
            .filter(|m| m.is_server() && m.status == MemberStatus::Alive)
            .map(|m| m.protocol_version)
            .min()
            .unwrap_or(0);
        if min_protocol < self.config.promotion_min_protocol_version {
            debug!(
                min_protocol,
                required = self.config.promotion_min_protocol_version,
                "skipping promotions; protocol version too old"
            );
            return false;
        }

        let mut promoted = false;
        for server in &health.servers {
            if server.voter || !server.healthy {
                continue;
            }
            if server.stable_for < self.config.stabilization_time {
                continue;
            }
            match self.log.promote_voter(&server.id).await {
                Ok(()) => {
                    info!(id = %server.id, stable_for = ?server.stable_for, "promoted server to voter");
                    metrics::AUTOPILOT_PROMOTIONS_TOTAL.inc();
                    promoted = true;
                }
                Err(e) => warn!(id = %server.id, error = %e, "voter promotion failed"),
            }
        }
        promoted
    }

    /// Removes failed and stale servers, but only while they are a strict
    /// minority: removing `dead` servers requires `2 * dead < peers`. When the
    /// rule blocks cleanup, a warning is logged and the pass retries next tick.
    async fn cleanup_dead(&self, health: &ClusterHealth) {
        if !self.config.dead_server_cleanup {
            return;
        }
        let members: HashMap<String, Member> = self
            .membership
            .members()
            .into_iter()
            .filter(|m| m.is_server())
            .map(|m| (m.name.clone(), m))
            .collect();

        let failed: Vec<&Member> = members
            .values()
            .filter(|m| m.status == MemberStatus::Failed)
            .collect();
        // In the log configuration but unknown to gossip entirely.
        let stale: Vec<&ServerHealth> = health
            .servers
            .iter()
            .filter(|s| !members.contains_key(&s.id))
            .collect();

        let dead = failed.len() + stale.len();
        if dead == 0 {
            return;
        }
        let peers = health.servers.len();
        if 2 * dead >= peers {
            warn!(
                dead,
                peers,
                "skipping dead-server cleanup; too many servers are down to remove any safely"
            );
            return;
        }

        for member in failed {
            info!(name = %member.name, "asking failed server to leave gossip");
            if let Err(e) = self.membership.remove_failed(&member.name).await {
                warn!(name = %member.name, error = %e, "failed-member removal failed");
                continue;
            }
            if let Err(e) = self.log.remove_server(&member.name).await {
                warn!(name = %member.name, error = %e, "log configuration removal failed");
            } else {
                metrics::AUTOPILOT_REMOVALS_TOTAL.inc();
            }
        }
        for server in stale {
            info!(id = %server.id, "removing stale server from log configuration");
            if let Err(e) = self.log.remove_server(&server.id).await {
                warn!(id = %server.id, error = %e, "stale server removal failed");
            } else {
                metrics::AUTOPILOT_REMOVALS_TOTAL.inc();
            }
        }
    }

    fn publish_health(&self, health: ClusterHealth) {
        metrics::AUTOPILOT_FAILURE_TOLERANCE.set(health.failure_tolerance as f64);
        metrics::AUTOPILOT_HEALTHY.set(if health.healthy { 1.0 } else { 0.0 });
        self.health_tx.send_replace(health);
    }
}

impl std::fmt::Debug for Autopilot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autopilot")
            .field("interval", &self.config.interval)
            .finish()
    }
}
