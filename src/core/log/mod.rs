// src/core/log/mod.rs

//! The replicated-log collaborator seam.
//!
//! The consensus implementation itself is external; the control plane only
//! needs the narrow surface below: submit an entry, observe leadership and the
//! voter configuration, and adjust membership for autopilot. `InMemoryLog`
//! backs standalone (single-server) mode and the test suite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::errors::MusterError;
use crate::core::fsm::{Fsm, encode_request};
use crate::core::types::{Index, Request};

/// One server as the log configuration sees it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RaftServer {
    pub id: String,
    pub address: String,
    pub voter: bool,
}

/// The voter/non-voter configuration, versioned by the index that produced it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RaftConfiguration {
    pub servers: Vec<RaftServer>,
    pub index: Index,
}

/// Replication progress and contact freshness for one server, as reported by
/// the leader's view of the log.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerProfile {
    pub id: String,
    pub address: String,
    pub voter: bool,
    /// Elapsed time since the leader last heard from this server. `None` for
    /// the leader itself.
    #[serde(default, with = "humantime_serde::option")]
    pub last_contact: Option<Duration>,
    pub last_index: Index,
    pub last_term: u64,
}

/// The narrow log surface the control plane consumes.
#[async_trait]
pub trait LogHandle: Send + Sync {
    /// Appends a request to the log and waits for local application. Returns
    /// the index the entry committed at. Fails fast with `NoLeader` on a
    /// non-leader.
    async fn submit(&self, request: Request) -> Result<Index, MusterError>;

    fn is_leader(&self) -> bool;

    /// The advertised address of the current leader, when known.
    fn leader_addr(&self) -> Option<String>;

    fn last_index(&self) -> Index;

    fn last_term(&self) -> u64;

    /// Elapsed time since this server last heard from the leader. Zero-ish on
    /// the leader itself; used as the staleness marker on stale reads.
    fn last_leader_contact(&self) -> Option<Duration>;

    fn configuration(&self) -> RaftConfiguration;

    /// Per-server replication progress, leader only.
    fn server_profiles(&self) -> Vec<ServerProfile>;

    async fn add_nonvoter(&self, id: &str, address: &str) -> Result<(), MusterError>;

    async fn promote_voter(&self, id: &str) -> Result<(), MusterError>;

    async fn remove_server(&self, id: &str) -> Result<(), MusterError>;
}

/// A single-server log: entries commit immediately into the local FSM.
///
/// Doubles as the test log; tests mutate leadership and per-server profiles
/// directly to drive autopilot and forwarding scenarios.
pub struct InMemoryLog {
    fsm: Arc<Fsm>,
    next_index: AtomicU64,
    term: AtomicU64,
    is_leader: AtomicBool,
    leader_addr: RwLock<Option<String>>,
    configuration: RwLock<RaftConfiguration>,
    profiles: RwLock<Vec<ServerProfile>>,
    /// Retained entries, for inspection and replay in tests.
    entries: RwLock<Vec<(Index, Vec<u8>)>>,
}

impl InMemoryLog {
    pub fn new(fsm: Arc<Fsm>) -> Self {
        let start = fsm.last_applied();
        Self {
            fsm,
            next_index: AtomicU64::new(start + 1),
            term: AtomicU64::new(1),
            is_leader: AtomicBool::new(true),
            leader_addr: RwLock::new(None),
            configuration: RwLock::new(RaftConfiguration::default()),
            profiles: RwLock::new(Vec::new()),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    // --- Test and standalone-mode controls ---

    pub fn set_leader(&self, leader: bool, addr: Option<String>) {
        self.is_leader.store(leader, Ordering::SeqCst);
        *self.leader_addr.write() = addr;
    }

    pub fn set_configuration(&self, configuration: RaftConfiguration) {
        *self.configuration.write() = configuration;
    }

    pub fn set_server_profiles(&self, profiles: Vec<ServerProfile>) {
        *self.profiles.write() = profiles;
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

#[async_trait]
impl LogHandle for InMemoryLog {
    async fn submit(&self, request: Request) -> Result<Index, MusterError> {
        if !self.is_leader() {
            return Err(MusterError::NoLeader);
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let bytes = encode_request(&request)?;
        self.entries.write().push((index, bytes));
        self.fsm.apply(index, &request)?;
        Ok(index)
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn leader_addr(&self) -> Option<String> {
        self.leader_addr.read().clone()
    }

    fn last_index(&self) -> Index {
        self.next_index.load(Ordering::SeqCst).saturating_sub(1)
    }

    fn last_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    fn last_leader_contact(&self) -> Option<Duration> {
        if self.is_leader() {
            None
        } else {
            Some(Duration::from_millis(0))
        }
    }

    fn configuration(&self) -> RaftConfiguration {
        self.configuration.read().clone()
    }

    fn server_profiles(&self) -> Vec<ServerProfile> {
        self.profiles.read().clone()
    }

    async fn add_nonvoter(&self, id: &str, address: &str) -> Result<(), MusterError> {
        let mut config = self.configuration.write();
        if config.servers.iter().any(|s| s.id == id) {
            return Ok(());
        }
        info!(id, address, "adding non-voter to log configuration");
        config.servers.push(RaftServer {
            id: id.to_string(),
            address: address.to_string(),
            voter: false,
        });
        config.index = self.last_index();
        Ok(())
    }

    async fn promote_voter(&self, id: &str) -> Result<(), MusterError> {
        let mut config = self.configuration.write();
        let Some(server) = config.servers.iter_mut().find(|s| s.id == id) else {
            return Err(MusterError::NotFound(format!("server '{id}'")));
        };
        info!(id, "promoting server to voter");
        server.voter = true;
        config.index = self.last_index();
        Ok(())
    }

    async fn remove_server(&self, id: &str) -> Result<(), MusterError> {
        let mut config = self.configuration.write();
        let before = config.servers.len();
        config.servers.retain(|s| s.id != id);
        if config.servers.len() == before {
            return Err(MusterError::NotFound(format!("server '{id}'")));
        }
        info!(id, "removed server from log configuration");
        config.index = self.last_index();
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLog")
            .field("last_index", &self.last_index())
            .field("is_leader", &self.is_leader())
            .finish()
    }
}
