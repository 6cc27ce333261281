// src/core/errors.rs

//! Defines the primary error type for the entire control plane.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the control plane.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum MusterError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// A retryable failure: the network hiccupped, the leader moved, or a peer
    /// rate-limited us. The RPC layer and the cache retry these with backoff.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A write transaction was opened at an index that does not advance the store.
    /// Fatal to that write; never retried.
    #[error("Stale index: write at {attempted} but store is at {current}")]
    StaleIndex { attempted: u64, current: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    /// A compare-and-set failed. The caller re-reads and retries with a fresh index.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A broken internal invariant. The process logs and aborts rather than limp on
    /// with corrupt state.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// The publisher force-closed a subscription. The subscriber must re-subscribe
    /// from index 0 and consume a fresh snapshot.
    #[error("Subscription reset")]
    SubscriptionReset,

    #[error("Deadline elapsed")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    /// No known leader in the target datacenter. Writes fail fast with this during
    /// datacenter isolation.
    #[error("No cluster leader")]
    NoLeader,

    #[error("No path to datacenter '{0}'")]
    NoDcPath(String),

    /// The pooled connection closed mid-request. Forwarding retries this at most once.
    #[error("RPC connection closed")]
    RpcClosed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session '{0}' is not live")]
    SessionInvalid(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for MusterError {
    fn clone(&self) -> Self {
        match self {
            MusterError::Io(e) => MusterError::Io(Arc::clone(e)),
            MusterError::Transient(s) => MusterError::Transient(s.clone()),
            MusterError::StaleIndex { attempted, current } => MusterError::StaleIndex {
                attempted: *attempted,
                current: *current,
            },
            MusterError::NotFound(s) => MusterError::NotFound(s.clone()),
            MusterError::PermissionDenied => MusterError::PermissionDenied,
            MusterError::Conflict(s) => MusterError::Conflict(s.clone()),
            MusterError::Invariant(s) => MusterError::Invariant(s.clone()),
            MusterError::SubscriptionReset => MusterError::SubscriptionReset,
            MusterError::Timeout => MusterError::Timeout,
            MusterError::Cancelled => MusterError::Cancelled,
            MusterError::NoLeader => MusterError::NoLeader,
            MusterError::NoDcPath(s) => MusterError::NoDcPath(s.clone()),
            MusterError::RpcClosed => MusterError::RpcClosed,
            MusterError::InvalidRequest(s) => MusterError::InvalidRequest(s.clone()),
            MusterError::SessionInvalid(s) => MusterError::SessionInvalid(s.clone()),
            MusterError::Encoding(s) => MusterError::Encoding(s.clone()),
            MusterError::SnapshotCorrupt(s) => MusterError::SnapshotCorrupt(s.clone()),
            MusterError::Internal(s) => MusterError::Internal(s.clone()),
        }
    }
}

impl PartialEq for MusterError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MusterError::Io(e1), MusterError::Io(e2)) => e1.to_string() == e2.to_string(),
            (MusterError::Transient(s1), MusterError::Transient(s2)) => s1 == s2,
            (
                MusterError::StaleIndex {
                    attempted: a1,
                    current: c1,
                },
                MusterError::StaleIndex {
                    attempted: a2,
                    current: c2,
                },
            ) => a1 == a2 && c1 == c2,
            (MusterError::NotFound(s1), MusterError::NotFound(s2)) => s1 == s2,
            (MusterError::Conflict(s1), MusterError::Conflict(s2)) => s1 == s2,
            (MusterError::Invariant(s1), MusterError::Invariant(s2)) => s1 == s2,
            (MusterError::NoDcPath(s1), MusterError::NoDcPath(s2)) => s1 == s2,
            (MusterError::InvalidRequest(s1), MusterError::InvalidRequest(s2)) => s1 == s2,
            (MusterError::SessionInvalid(s1), MusterError::SessionInvalid(s2)) => s1 == s2,
            (MusterError::Encoding(s1), MusterError::Encoding(s2)) => s1 == s2,
            (MusterError::SnapshotCorrupt(s1), MusterError::SnapshotCorrupt(s2)) => s1 == s2,
            (MusterError::Internal(s1), MusterError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl MusterError {
    /// Returns true when the failure is safe to retry with backoff.
    /// Permanent errors (invalid definitions, permission denials, conflicts)
    /// must surface to the caller instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MusterError::Transient(_)
                | MusterError::NoLeader
                | MusterError::RpcClosed
                | MusterError::Timeout
                | MusterError::Io(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for MusterError {
    fn from(e: std::io::Error) -> Self {
        MusterError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for MusterError {
    fn from(e: uuid::Error) -> Self {
        MusterError::Internal(format!("Failed to parse UUID: {e}"))
    }
}

impl From<bincode::error::EncodeError> for MusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        MusterError::Encoding(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for MusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        MusterError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for MusterError {
    fn from(e: serde_json::Error) -> Self {
        MusterError::Encoding(format!("JSON serialization/deserialization error: {e}"))
    }
}
