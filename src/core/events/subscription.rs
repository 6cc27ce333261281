// src/core/events/subscription.rs

//! One subscriber's ordered, gap-free view of a topic/key stream.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};

use super::publisher::SubHandle;
use super::{Authorizer, Event, Topic};
use crate::core::errors::MusterError;
use crate::core::types::Index;

/// The subscription lifecycle. Terminal states are `Closed` and `ForceClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Initializing,
    StreamingSnapshot,
    Live,
    Closed,
    ForceClosed,
}

/// A subscription to one `(topic, key)`. Events are delivered in strictly
/// increasing index order; a forced close surfaces as `SubscriptionReset` and
/// obliges the caller to re-subscribe from index 0.
pub struct Subscription {
    id: u64,
    topic: Topic,
    key: String,
    state: SubState,
    /// Snapshot or ring-replay backlog, drained before live delivery.
    pending: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    close_rx: watch::Receiver<bool>,
    last_index: Index,
    authz: Arc<dyn Authorizer>,
    handles: Arc<DashMap<u64, SubHandle>>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn snapshotting(
        id: u64,
        topic: Topic,
        key: &str,
        snapshot_index: Index,
        pending: VecDeque<Event>,
        live: broadcast::Receiver<Event>,
        close_rx: watch::Receiver<bool>,
        authz: Arc<dyn Authorizer>,
        handles: Arc<DashMap<u64, SubHandle>>,
    ) -> Self {
        Self {
            id,
            topic,
            key: key.to_string(),
            state: SubState::Initializing,
            pending,
            live,
            close_rx,
            // Live deltas older than the snapshot are already reflected in it.
            last_index: snapshot_index,
            authz,
            handles,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn live(
        id: u64,
        topic: Topic,
        key: &str,
        last_seen_index: Index,
        pending: VecDeque<Event>,
        live: broadcast::Receiver<Event>,
        close_rx: watch::Receiver<bool>,
        authz: Arc<dyn Authorizer>,
        handles: Arc<DashMap<u64, SubHandle>>,
    ) -> Self {
        Self {
            id,
            topic,
            key: key.to_string(),
            state: SubState::Live,
            pending,
            live,
            close_rx,
            last_index: last_seen_index,
            authz,
            handles,
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SubState {
        self.state
    }

    /// The index of the last delivered (or snapshotted) event.
    pub fn last_index(&self) -> Index {
        self.last_index
    }

    fn matches(&self, event: &Event) -> bool {
        self.key.is_empty() || event.key == self.key
    }

    /// Returns the next event, blocking until one is available. Cancel by
    /// dropping the future (e.g. under `tokio::time::timeout`).
    ///
    /// `Err(SubscriptionReset)` is terminal: the publisher evicted or
    /// force-closed this subscription and the caller must re-subscribe.
    pub async fn next(&mut self) -> Result<Event, MusterError> {
        loop {
            if matches!(self.state, SubState::Closed | SubState::ForceClosed) {
                return Err(MusterError::SubscriptionReset);
            }
            if *self.close_rx.borrow() {
                self.state = SubState::ForceClosed;
                return Err(MusterError::SubscriptionReset);
            }

            if let Some(event) = self.pending.pop_front() {
                if event.is_end_of_snapshot() {
                    self.state = SubState::Live;
                    self.last_index = self.last_index.max(event.index);
                    return Ok(event);
                }
                if self.state == SubState::Initializing {
                    self.state = SubState::StreamingSnapshot;
                }
                self.last_index = self.last_index.max(event.index);
                if self.authz.allows(&event) {
                    return Ok(event);
                }
                continue;
            }

            tokio::select! {
                changed = self.close_rx.changed() => {
                    // Either an explicit force-close or the publisher went away.
                    let _ = changed;
                    self.state = SubState::ForceClosed;
                    return Err(MusterError::SubscriptionReset);
                }
                received = self.live.recv() => match received {
                    Ok(event) => {
                        if !self.matches(&event) || event.index <= self.last_index {
                            continue;
                        }
                        self.last_index = event.index;
                        if self.authz.allows(&event) {
                            return Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(
                            topic = %self.topic,
                            key = %self.key,
                            missed,
                            "subscription lagged behind the topic ring; force-closing"
                        );
                        self.state = SubState::ForceClosed;
                        return Err(MusterError::SubscriptionReset);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.state = SubState::Closed;
                        return Err(MusterError::SubscriptionReset);
                    }
                },
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handles.remove(&self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("last_index", &self.last_index)
            .finish()
    }
}
