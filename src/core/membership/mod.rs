// src/core/membership/mod.rs

//! The gossip-collaborator seam: the membership view the control plane observes.
//!
//! The failure detector itself is external. The control plane reads member
//! liveness and metadata tags, and may ask a failed member to leave the ring.
//! `StaticMembership` backs standalone mode and the test suite.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::core::errors::MusterError;

/// Liveness as the failure detector reports it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Failed,
    Left,
}

/// The role a member advertises in its tags.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Server,
    Agent,
}

/// One gossip member. The tag set carries at minimum
/// `{role, datacenter, protocol_version, build}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub address: String,
    pub status: MemberStatus,
    pub role: MemberRole,
    pub datacenter: String,
    pub protocol_version: u32,
    pub build: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// How long the member has been in its current status.
    #[serde(default, with = "humantime_serde")]
    pub status_since: Duration,
}

impl Member {
    pub fn is_server(&self) -> bool {
        self.role == MemberRole::Server
    }
}

/// The membership surface the control plane consumes.
#[async_trait]
pub trait Membership: Send + Sync {
    /// The current member view, local datacenter only.
    fn members(&self) -> Vec<Member>;

    /// Members of the WAN ring, across datacenters. Used for cross-datacenter
    /// forwarding and `ListDatacenters`.
    fn wan_members(&self) -> Vec<Member>;

    /// Known datacenters, sorted, local first.
    fn datacenters(&self) -> Vec<String> {
        let mut dcs: Vec<String> = self.wan_members().iter().map(|m| m.datacenter.clone()).collect();
        dcs.sort();
        dcs.dedup();
        dcs
    }

    /// Asks a failed member to leave the ring so it stops being gossiped.
    async fn remove_failed(&self, name: &str) -> Result<(), MusterError>;

    /// Fires whenever the member view changes.
    fn changes(&self) -> watch::Receiver<u64>;
}

/// A fixed membership view, mutated directly by tests and standalone setup.
pub struct StaticMembership {
    members: RwLock<Vec<Member>>,
    wan: RwLock<Vec<Member>>,
    generation: watch::Sender<u64>,
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticMembership {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Vec::new()),
            wan: RwLock::new(Vec::new()),
            generation: watch::channel(0).0,
        }
    }

    pub fn set_members(&self, members: Vec<Member>) {
        *self.members.write() = members;
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn set_wan_members(&self, members: Vec<Member>) {
        *self.wan.write() = members;
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn set_member_status(&self, name: &str, status: MemberStatus) {
        let mut members = self.members.write();
        if let Some(member) = members.iter_mut().find(|m| m.name == name) {
            member.status = status;
            member.status_since = Duration::ZERO;
        }
        drop(members);
        self.generation.send_modify(|g| *g += 1);
    }
}

#[async_trait]
impl Membership for StaticMembership {
    fn members(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    fn wan_members(&self) -> Vec<Member> {
        self.wan.read().clone()
    }

    async fn remove_failed(&self, name: &str) -> Result<(), MusterError> {
        let mut members = self.members.write();
        let Some(member) = members.iter_mut().find(|m| m.name == name) else {
            return Err(MusterError::NotFound(format!("member '{name}'")));
        };
        if member.status != MemberStatus::Failed {
            return Err(MusterError::InvalidRequest(format!(
                "member '{name}' is not failed"
            )));
        }
        info!(name, "asking failed member to leave the ring");
        member.status = MemberStatus::Left;
        drop(members);
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

impl std::fmt::Debug for StaticMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticMembership")
            .field("members", &self.members.read().len())
            .finish()
    }
}
