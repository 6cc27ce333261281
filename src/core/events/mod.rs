// src/core/events/mod.rs

//! The event system: typed topics, events extracted from committed writes, and
//! the per-topic pub/sub machinery that streams them to subscribers.

pub mod extract;
pub mod publisher;
pub mod subscription;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumIter, EnumString};

use crate::core::types::{CheckServiceNode, ConfigEntry, Index, Intention};

pub use publisher::EventPublisher;
pub use subscription::{SubState, Subscription};

/// The closed set of subscription topics.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Health of every instance of a service name.
    ServiceHealth,
    /// Like `ServiceHealth`, restricted to mesh-capable instances.
    ServiceHealthConnect,
    MeshConfig,
    ServiceResolver,
    IngressGateway,
    ServiceIntentions,
    /// Authorization invalidation; consumed internally to force-close
    /// subscriptions whose token lost access.
    AclTokens,
}

/// Whether an event reflects a row appearing/changing or disappearing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogOp {
    Register,
    Deregister,
}

/// The typed body of an event. Downstream of the extractor the payload is
/// opaque; only the extractor switches on entity kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum EventPayload {
    ServiceHealth {
        op: CatalogOp,
        value: CheckServiceNode,
    },
    ConfigEntry {
        op: CatalogOp,
        entry: ConfigEntry,
    },
    Intention {
        op: CatalogOp,
        intention: Intention,
    },
    /// A token whose authorization inputs changed.
    AclInvalidate {
        token: String,
    },
    /// Marks the end of the initial snapshot; everything after is a live delta.
    EndOfSnapshot,
    /// The server is about to replace the subscriber's view wholesale.
    NewSnapshotToFollow,
}

/// One event on a topic stream. Delivery within a subscription is ordered and
/// gap-free by `index`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub key: String,
    pub index: Index,
    pub payload: EventPayload,
}

impl Event {
    pub fn end_of_snapshot(topic: Topic, key: String, index: Index) -> Self {
        Self {
            topic,
            key,
            index,
            payload: EventPayload::EndOfSnapshot,
        }
    }

    pub fn is_end_of_snapshot(&self) -> bool {
        matches!(self.payload, EventPayload::EndOfSnapshot)
    }
}

/// Per-subscription authorization filter. Events failing the filter are dropped
/// before delivery; a token invalidation force-closes instead of dropping.
pub trait Authorizer: Send + Sync {
    fn token(&self) -> &str;
    fn allows(&self, event: &Event) -> bool;
}

/// Allows everything. The default when no ACL collaborator is wired in.
#[derive(Debug, Clone, Default)]
pub struct AllowAll {
    token: String,
}

impl AllowAll {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authorizer for AllowAll {
    fn token(&self) -> &str {
        &self.token
    }

    fn allows(&self, _event: &Event) -> bool {
        true
    }
}

/// Denies everything. A token whose policies were all removed resolves to this.
#[derive(Debug, Clone, Default)]
pub struct DenyAll {
    token: String,
}

impl DenyAll {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authorizer for DenyAll {
    fn token(&self) -> &str {
        &self.token
    }

    fn allows(&self, _event: &Event) -> bool {
        false
    }
}

/// Resolves a request token into its authorization context. The ACL collaborator
/// provides the real implementation; the default allows everything.
pub trait AuthzResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Arc<dyn Authorizer>;
}

/// The no-ACL resolver: every token allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllResolver;

impl AuthzResolver for AllowAllResolver {
    fn resolve(&self, token: &str) -> Arc<dyn Authorizer> {
        Arc::new(AllowAll::with_token(token))
    }
}

/// A mutable token table: the shim the ACL collaborator drives. Removing a
/// token's grant swaps in a deny-all context; pairing the swap with
/// [`EventPublisher::invalidate_token`] force-closes the token's live
/// subscriptions so they re-resolve on re-subscribe.
#[derive(Default)]
pub struct TokenMapResolver {
    grants: dashmap::DashMap<String, std::sync::Arc<dyn Authorizer>>,
}

impl TokenMapResolver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn grant(&self, token: &str, authz: Arc<dyn Authorizer>) {
        self.grants.insert(token.to_string(), authz);
    }

    pub fn revoke(&self, token: &str) {
        self.grants.remove(token);
    }
}

impl AuthzResolver for TokenMapResolver {
    fn resolve(&self, token: &str) -> Arc<dyn Authorizer> {
        match self.grants.get(token) {
            Some(authz) => authz.clone(),
            None => Arc::new(DenyAll::with_token(token)),
        }
    }
}
