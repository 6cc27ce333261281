// src/core/cache/mod.rs

//! The agent-side read-through cache.
//!
//! Keys are `(type, datacenter, token, request_key)`. Concurrent gets for a
//! missing key coalesce onto one upstream fetch; blocking-capable types keep
//! themselves fresh with a background refresh loop; entries idle past their TTL
//! are evicted from a min-heap and their refresh stops.

mod expiry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::errors::MusterError;
use crate::core::metrics;
use crate::core::rpc::ReadBody;
use crate::core::types::Index;

use expiry::ExpiryHeap;

/// One fully-qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub cache_type: &'static str,
    pub datacenter: String,
    pub token: String,
    pub key: String,
}

/// The result of one upstream fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub index: Index,
    pub body: ReadBody,
}

/// A source the cache can read through to. Blocking-capable types are kept
/// fresh by the background refresh loop using blocking queries.
#[async_trait]
pub trait CacheType: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_blocking(&self) -> bool;

    /// Fetches the value for `key`. A non-zero `min_index` asks the upstream to
    /// block (up to `max_wait`) until it has something newer.
    async fn fetch(
        &self,
        datacenter: &str,
        token: &str,
        key: &str,
        min_index: Index,
        max_wait: Option<Duration>,
    ) -> Result<FetchResult, MusterError>;
}

/// Tuning knobs, defaulted to the values the agent ships with.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// An entry unread for this long is evicted and its refresh stops.
    pub entry_ttl: Duration,
    /// The blocking window background refreshes ask the server for.
    pub refresh_blocking_wait: Duration,
    /// Consecutive failures tolerated before backoff kicks in.
    pub backoff_min_failures: u32,
    /// Upper bound on the backoff delay.
    pub backoff_max_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            refresh_blocking_wait: Duration::from_secs(10 * 60),
            backoff_min_failures: 2,
            backoff_max_wait: Duration::from_secs(60),
        }
    }
}

/// Per-entry state. The `error`/`value` pair may coexist; when both are present
/// the error is strictly newer and `min_index` callers see it while any-value
/// callers get the stale-but-valid value.
struct CacheEntryInner {
    value: Option<Arc<ReadBody>>,
    index: Index,
    error: Option<MusterError>,
    fetching: bool,
    consecutive_failures: u32,
    /// Set when a background refresh loses contact with the upstream; cleared
    /// once a fetch holds a full blocking window again.
    refresh_lost_contact_at: Option<Instant>,
    expires_at: Instant,
    /// Bumped after every fetch completion; waiters re-check on change.
    waiter: watch::Sender<u64>,
}

type Entry = Arc<Mutex<CacheEntryInner>>;

/// The read-through cache.
pub struct Cache {
    types: HashMap<&'static str, Arc<dyn CacheType>>,
    entries: RwLock<HashMap<CacheKey, Entry>>,
    expiry: Mutex<ExpiryHeap>,
    /// Bumped whenever a new deadline is scheduled so the eviction loop
    /// re-arms its sleep.
    expiry_signal: watch::Sender<u64>,
    config: CacheConfig,
    clock: Clock,
}

impl Cache {
    pub fn new(config: CacheConfig, clock: Clock) -> Self {
        Self {
            types: HashMap::new(),
            entries: RwLock::new(HashMap::new()),
            expiry: Mutex::new(ExpiryHeap::new()),
            expiry_signal: watch::channel(0).0,
            config,
            clock,
        }
    }

    /// Registers a cache type. Must happen before the first `get` for it.
    pub fn register(&mut self, cache_type: Arc<dyn CacheType>) {
        self.types.insert(cache_type.name(), cache_type);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Seeds an entry directly, bypassing the fetch path. Used to load startup
    /// state before any server is reachable.
    pub fn prepopulate(self: &Arc<Self>, key: CacheKey, index: Index, body: ReadBody) {
        let entry = self.get_or_create(&key);
        let mut inner = entry.lock();
        inner.value = Some(Arc::new(body));
        inner.index = index;
        inner.error = None;
        inner.expires_at = self.clock.now() + self.config.entry_ttl;
        drop(inner);
        self.expiry
            .lock()
            .push(self.clock.now() + self.config.entry_ttl, key);
        self.expiry_signal.send_modify(|g| *g += 1);
    }

    /// Reads through the cache.
    ///
    /// `min_index = 0` returns any cached value immediately (stale is fine);
    /// a non-zero `min_index` waits (up to `timeout`) for a value newer than it
    /// and surfaces a fetch error that is newer than the cached value.
    pub async fn get(
        self: &Arc<Self>,
        key: CacheKey,
        min_index: Index,
        timeout: Duration,
    ) -> Result<(Index, Arc<ReadBody>), MusterError> {
        let cache_type = self
            .types
            .get(key.cache_type)
            .ok_or_else(|| {
                MusterError::InvalidRequest(format!("unknown cache type '{}'", key.cache_type))
            })?
            .clone();
        let deadline = self.clock.now() + timeout;
        let entry = self.get_or_create(&key);

        loop {
            let mut waiter = {
                let mut inner = entry.lock();
                inner.expires_at = self.clock.now() + self.config.entry_ttl;

                if min_index == 0 {
                    if let Some(value) = &inner.value {
                        metrics::CACHE_HITS_TOTAL
                            .with_label_values(&[key.cache_type])
                            .inc();
                        return Ok((inner.index, value.clone()));
                    }
                } else if inner.value.is_some() && inner.index > min_index {
                    if let Some(error) = &inner.error {
                        // The error is strictly newer than the value; min_index
                        // callers see it.
                        return Err(error.clone());
                    }
                    metrics::CACHE_HITS_TOTAL
                        .with_label_values(&[key.cache_type])
                        .inc();
                    let value = inner.value.as_ref().expect("checked above").clone();
                    return Ok((inner.index, value));
                }

                metrics::CACHE_MISSES_TOTAL
                    .with_label_values(&[key.cache_type])
                    .inc();
                // Surface a cached fetch error, but kick a fresh fetch first so
                // a later retry can make progress.
                if let Some(error) = inner.error.clone() {
                    if !inner.fetching {
                        inner.fetching = true;
                        self.spawn_fetch(cache_type.clone(), key.clone(), entry.clone(), min_index);
                    }
                    return Err(error);
                }
                if !inner.fetching {
                    inner.fetching = true;
                    self.spawn_fetch(cache_type.clone(), key.clone(), entry.clone(), min_index);
                }
                inner.waiter.subscribe()
            };

            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero()
                || self
                    .clock
                    .timeout(remaining, waiter.changed())
                    .await
                    .is_none()
            {
                // Deadline: surface whatever we have.
                let inner = entry.lock();
                if let Some(value) = &inner.value {
                    return Ok((inner.index, value.clone()));
                }
                return Err(MusterError::Timeout);
            }
        }
    }

    fn get_or_create(self: &Arc<Self>, key: &CacheKey) -> Entry {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        let mut entries = self.entries.write();
        entries
            .entry(key.clone())
            .or_insert_with(|| {
                let expires_at = self.clock.now() + self.config.entry_ttl;
                self.expiry.lock().push(expires_at, key.clone());
                self.expiry_signal.send_modify(|g| *g += 1);
                Arc::new(Mutex::new(CacheEntryInner {
                    value: None,
                    index: 0,
                    error: None,
                    fetching: false,
                    consecutive_failures: 0,
                    refresh_lost_contact_at: None,
                    expires_at,
                    waiter: watch::channel(0).0,
                }))
            })
            .clone()
    }

    /// Launches the fetch task for an entry. For blocking-capable types the
    /// task becomes the entry's background refresh loop and keeps running until
    /// the entry is evicted.
    fn spawn_fetch(
        self: &Arc<Self>,
        cache_type: Arc<dyn CacheType>,
        key: CacheKey,
        entry: Entry,
        first_min_index: Index,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut min_index = first_min_index;
            loop {
                let (max_wait, fetch_index) = if min_index > 0 && cache_type.supports_blocking() {
                    (Some(cache.config.refresh_blocking_wait), min_index)
                } else {
                    (None, min_index)
                };

                let started = cache.clock.now();
                let result = cache_type
                    .fetch(&key.datacenter, &key.token, &key.key, fetch_index, max_wait)
                    .await;
                let held_full_window = cache.clock.now().duration_since(started)
                    >= cache.config.refresh_blocking_wait;

                let backoff = {
                    let mut inner = entry.lock();
                    match result {
                        Ok(fetched) if fetched.index > 0 => {
                            inner.value = Some(Arc::new(fetched.body));
                            inner.index = fetched.index;
                            inner.error = None;
                            inner.consecutive_failures = 0;
                            inner.refresh_lost_contact_at = None;
                            metrics::CACHE_FETCHES_TOTAL
                                .with_label_values(&["success"])
                                .inc();
                        }
                        Ok(fetched) => {
                            // Index 0 means the upstream had nothing watchable.
                            // The value is kept, but the attempt counts as a
                            // failure so we never hot-loop on it.
                            inner.value = Some(Arc::new(fetched.body));
                            inner.error = None;
                            inner.consecutive_failures =
                                inner.consecutive_failures.saturating_add(1);
                            metrics::CACHE_FETCHES_TOTAL
                                .with_label_values(&["zero-index"])
                                .inc();
                        }
                        Err(err) => {
                            warn!(key = %key.key, error = %err, "cache fetch failed");
                            inner.error = Some(err);
                            inner.consecutive_failures =
                                inner.consecutive_failures.saturating_add(1);
                            if held_full_window {
                                // Outlived a full blocking window: the server
                                // was reachable, so this isn't lost contact.
                                inner.refresh_lost_contact_at = None;
                            } else if inner.refresh_lost_contact_at.is_none() {
                                inner.refresh_lost_contact_at = Some(cache.clock.now());
                            }
                            metrics::CACHE_FETCHES_TOTAL
                                .with_label_values(&["failure"])
                                .inc();
                        }
                    }
                    inner.fetching = cache_type.supports_blocking();
                    inner.waiter.send_modify(|g| *g += 1);
                    min_index = inner.index;
                    cache.backoff_delay(inner.consecutive_failures)
                };

                if !cache_type.supports_blocking() {
                    return;
                }
                // Eviction removed the entry: stop refreshing it.
                if !cache.entries.read().contains_key(&key) {
                    debug!(key = %key.key, "entry evicted; background refresh stopping");
                    return;
                }
                if let Some(delay) = backoff {
                    cache.clock.sleep(delay).await;
                }
            }
        });
    }

    /// `min(2^(n - backoff_min) seconds, max_wait) + jitter` after more than
    /// `backoff_min` consecutive failures.
    fn backoff_delay(&self, failures: u32) -> Option<Duration> {
        if failures <= self.config.backoff_min_failures {
            return None;
        }
        let exp = failures - self.config.backoff_min_failures;
        let base = Duration::from_secs(1)
            .saturating_mul(1u32 << exp.min(16))
            .min(self.config.backoff_max_wait);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        Some(base + jitter)
    }

    /// The eviction loop: pops due deadlines, drops entries idle past their
    /// TTL, and reschedules the rest for their refreshed deadline.
    pub async fn run_eviction(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut scheduled = self.expiry_signal.subscribe();
        loop {
            let next = self.expiry.lock().peek_deadline();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("cache eviction loop shutting down.");
                    return;
                }
                changed = scheduled.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // A new deadline was scheduled; re-arm the sleep.
                }
                _ = self.sleep_until(next) => {
                    let now = self.clock.now();
                    let due = self.expiry.lock().pop_due(now);
                    for key in due {
                        let expired = {
                            let entries = self.entries.read();
                            match entries.get(&key) {
                                Some(entry) => entry.lock().expires_at <= now,
                                None => false,
                            }
                        };
                        if expired {
                            self.entries.write().remove(&key);
                            metrics::CACHE_EVICTIONS_TOTAL.inc();
                            debug!(key = %key.key, "evicted idle cache entry");
                        } else if let Some(entry) = self.entries.read().get(&key) {
                            // Read since scheduling: push out to its new deadline.
                            self.expiry.lock().push(entry.lock().expires_at, key);
                        }
                    }
                }
            }
        }
    }

    async fn sleep_until(&self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => self.clock.sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("types", &self.types.len())
            .field("entries", &self.entries.read().len())
            .field("scheduled_expiries", &self.expiry.lock().len())
            .finish()
    }
}
