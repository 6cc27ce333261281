// src/core/events/publisher.rs

//! The per-topic fan-out hub: bounded rings of recent events, broadcast channels
//! for live delivery, single-flighted snapshot materialization, and force-close
//! of subscriptions whose authorization inputs changed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use super::extract;
use super::subscription::Subscription;
use super::{Authorizer, Event, Topic};
use crate::core::metrics;
use crate::core::store::{Change, CommitSink, Tables};
use crate::core::types::Index;

/// How many recent events each topic retains for delta replay. A subscriber
/// whose `last_seen_index` predates the ring gets a fresh snapshot instead.
const TOPIC_RING_CAPACITY: usize = 2048;

/// The capacity of each topic's live broadcast channel. A subscriber that lags
/// past this is force-closed rather than buffered unboundedly.
const TOPIC_BROADCAST_CAPACITY: usize = 4096;

/// The mutable half of one topic: the replay ring and the live channel.
struct TopicBuffer {
    ring: VecDeque<Event>,
    /// The index of the newest event discarded from the ring; a subscriber
    /// needs a snapshot when its `last_seen_index` is older than this.
    trimmed_before: Index,
    tx: broadcast::Sender<Event>,
}

impl TopicBuffer {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(TOPIC_RING_CAPACITY),
            trimmed_before: 0,
            tx: broadcast::channel(TOPIC_BROADCAST_CAPACITY).0,
        }
    }

    fn push(&mut self, event: Event) {
        if self.ring.len() == TOPIC_RING_CAPACITY {
            if let Some(evicted) = self.ring.pop_front() {
                self.trimmed_before = evicted.index;
            }
        }
        self.ring.push_back(event.clone());
        // It's fine if nobody is live-listening; the ring still serves replays.
        let _ = self.tx.send(event);
    }
}

/// A cached snapshot for one `(topic, key)`, valid while the topic hasn't
/// advanced past `index`.
struct SnapshotEntry {
    index: Index,
    events: Arc<Vec<Event>>,
}

/// A handle the publisher keeps per live subscription, for force-close.
pub(crate) struct SubHandle {
    topic: Topic,
    key: String,
    token: String,
    close_tx: watch::Sender<bool>,
}

/// Turns state-store commits into ordered event streams and serves snapshots to
/// late joiners. Registered as the store's commit sink, so extraction runs
/// inside the writer critical section and per-topic streams are gap-free.
pub struct EventPublisher {
    topics: HashMap<Topic, Mutex<TopicBuffer>>,
    /// Single-flight snapshot materialization: the dashmap entry lock makes
    /// concurrent subscribers for the same key share one build.
    snapshots: DashMap<(Topic, String), SnapshotEntry>,
    handles: Arc<DashMap<u64, SubHandle>>,
    next_sub_id: AtomicU64,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        use strum::IntoEnumIterator;
        let topics = Topic::iter()
            .map(|t| (t, Mutex::new(TopicBuffer::new())))
            .collect();
        Self {
            topics,
            snapshots: DashMap::new(),
            handles: Arc::new(DashMap::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    fn buffer(&self, topic: Topic) -> &Mutex<TopicBuffer> {
        self.topics.get(&topic).expect("all topics preallocated")
    }

    /// Publishes extracted events. Called with the store's writer lock held, so
    /// events enter each topic in commit order with no gaps.
    pub(crate) fn publish(&self, events: Vec<Event>) {
        for event in events {
            let topic_label = event.topic.to_string();
            metrics::EVENTS_PUBLISHED_TOTAL
                .with_label_values(&[topic_label.as_str()])
                .inc();
            self.buffer(event.topic).lock().push(event);
        }
    }

    /// Creates a subscription for `(topic, key)`.
    ///
    /// When `last_seen_index` is still covered by the topic ring, the
    /// subscription replays the missed deltas and goes live with no snapshot.
    /// Otherwise it streams a snapshot built from `tables`, then
    /// `EndOfSnapshot`, then live deltas. Snapshot builds for the same
    /// `(topic, key)` are single-flighted.
    pub fn subscribe(
        &self,
        topic: Topic,
        key: &str,
        last_seen_index: Index,
        tables: &Tables,
        authz: Arc<dyn Authorizer>,
    ) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (close_tx, close_rx) = watch::channel(false);
        self.handles.insert(
            id,
            SubHandle {
                topic,
                key: key.to_string(),
                token: authz.token().to_string(),
                close_tx,
            },
        );

        let buffer = self.buffer(topic).lock();
        let live = buffer.tx.subscribe();

        if last_seen_index > 0 && last_seen_index >= buffer.trimmed_before {
            let pending: VecDeque<Event> = buffer
                .ring
                .iter()
                .filter(|e| e.index > last_seen_index && e.key == key)
                .cloned()
                .collect();
            debug!(
                topic = %topic,
                key,
                replayed = pending.len(),
                "subscription attached via ring replay"
            );
            return Subscription::live(
                id,
                topic,
                key,
                last_seen_index,
                pending,
                live,
                close_rx,
                authz,
                self.handles.clone(),
            );
        }
        let snapshot_index = tables.last_index;
        // Events committed after the caller's snapshot but before the live
        // receiver existed would otherwise fall into a gap; replay them from
        // the ring behind the end-of-snapshot marker.
        let missed: Vec<Event> = buffer
            .ring
            .iter()
            .filter(|e| e.index > snapshot_index && e.key == key)
            .cloned()
            .collect();
        drop(buffer);

        let snapshot = self.snapshot_events(topic, key, tables);
        let mut pending: VecDeque<Event> = snapshot.iter().cloned().collect();
        pending.push_back(Event::end_of_snapshot(topic, key.to_string(), snapshot_index));
        pending.extend(missed);
        Subscription::snapshotting(
            id,
            topic,
            key,
            snapshot_index,
            pending,
            live,
            close_rx,
            authz,
            self.handles.clone(),
        )
    }

    fn snapshot_events(&self, topic: Topic, key: &str, tables: &Tables) -> Arc<Vec<Event>> {
        let cache_key = (topic, key.to_string());
        let current = tables.last_index;
        // The entry lock is held while building, so N concurrent subscribers
        // for the same key run exactly one build.
        let entry = self
            .snapshots
            .entry(cache_key)
            .and_modify(|e| {
                if e.index != current {
                    *e = SnapshotEntry {
                        index: current,
                        events: Arc::new(extract::snapshot(topic, key, tables)),
                    };
                }
            })
            .or_insert_with(|| SnapshotEntry {
                index: current,
                events: Arc::new(extract::snapshot(topic, key, tables)),
            });
        entry.events.clone()
    }

    /// Force-closes every subscription using `token`. The subscribers observe
    /// `SubscriptionReset` and must re-subscribe from index 0, picking up a
    /// fresh authorization context.
    pub fn invalidate_token(&self, token: &str) {
        let mut closed = 0usize;
        for handle in self.handles.iter() {
            if handle.token == token {
                let _ = handle.close_tx.send(true);
                closed += 1;
            }
        }
        if closed > 0 {
            metrics::SUBSCRIPTIONS_FORCE_CLOSED_TOTAL.inc_by(closed as f64);
            debug!(token_subscriptions = closed, "force-closed subscriptions after token invalidation");
        }
    }

    /// Force-closes every subscription on a topic/key pair, e.g. when a config
    /// change invalidates derived state wholesale.
    pub fn force_close_key(&self, topic: Topic, key: &str) {
        for handle in self.handles.iter() {
            if handle.topic == topic && handle.key == key {
                let _ = handle.close_tx.send(true);
                metrics::SUBSCRIPTIONS_FORCE_CLOSED_TOTAL.inc();
            }
        }
    }
}

impl CommitSink for EventPublisher {
    fn on_commit(&self, old: &Tables, new: &Tables, index: Index, changes: &[Change]) {
        let events = extract::changes_to_events(old, new, index, changes);

        // Token invalidations force-close affected subscriptions instead of
        // being delivered as ordinary events.
        for event in &events {
            if let super::EventPayload::AclInvalidate { token } = &event.payload {
                self.invalidate_token(token);
            }
        }
        self.publish(events);
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscriptions", &self.handles.len())
            .finish()
    }
}
