// src/core/rpc/blocking.rs

//! The blocking-query protocol: a read that waits until its table advances past
//! the caller's `min_index` or the deadline elapses.

use rand::Rng;
use std::time::Duration;

use crate::core::clock::Clock;
use crate::core::metrics;
use crate::core::store::reads::ReadTxn;
use crate::core::store::{Store, WatchSet};
use crate::core::types::{Index, QueryOptions};

/// The server refuses to hold a blocking query longer than this, whatever the
/// caller asked for.
pub const MAX_BLOCKING_WAIT: Duration = Duration::from_secs(10 * 60);

/// Runs `read` under blocking-query semantics.
///
/// Non-blocking calls (no `min_index` or no `max_wait`) run the read once. A
/// blocking call registers watch channels on precisely what the read touched,
/// re-runs on any fire, and returns the last observation at the deadline. The
/// deadline carries server-side jitter of up to `max_wait/16` so synchronized
/// clients don't stampede; the jitter is added up front, never after a wake, so
/// a woken query returns immediately.
///
/// The returned index is always the observed `max_index`; the caller feeds it
/// back as its next `min_index`.
pub async fn blocking_query<T, F>(
    store: &Store,
    clock: &Clock,
    options: &QueryOptions,
    mut read: F,
) -> (Index, T)
where
    F: FnMut(&ReadTxn<'_>, Option<&mut WatchSet>) -> (Index, T),
{
    let Some(max_wait) = options.max_wait.filter(|w| !w.is_zero() && options.min_index > 0) else {
        let txn = store.read_txn();
        return read(&txn, None);
    };

    let max_wait = max_wait.min(MAX_BLOCKING_WAIT);
    let jitter_ceiling = (max_wait / 16).as_millis() as u64;
    let jitter = if jitter_ceiling > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling))
    } else {
        Duration::ZERO
    };
    let deadline = clock.now() + max_wait + jitter;

    metrics::BLOCKING_QUERIES.inc();
    let result = blocking_loop(store, clock, options.min_index, deadline, &mut read).await;
    metrics::BLOCKING_QUERIES.dec();
    result
}

async fn blocking_loop<T, F>(
    store: &Store,
    clock: &Clock,
    min_index: Index,
    deadline: tokio::time::Instant,
    read: &mut F,
) -> (Index, T)
where
    F: FnMut(&ReadTxn<'_>, Option<&mut WatchSet>) -> (Index, T),
{
    loop {
        let txn = store.read_txn();
        let snapshot_index = txn.last_index();
        let mut watch_set = WatchSet::new();
        let (index, value) = read(&txn, Some(&mut watch_set));
        if index > min_index {
            return (index, value);
        }
        // Snapshot dropped before waiting so the watch wakeup observes a fresh
        // generation.
        drop(txn);

        // A commit that landed between taking the snapshot and registering the
        // watches fired nothing we can see; re-read instead of stalling.
        if store.last_index() != snapshot_index {
            continue;
        }

        let remaining = deadline.saturating_duration_since(clock.now());
        if remaining.is_zero() {
            return (index, value);
        }
        if clock.timeout(remaining, watch_set.changed()).await.is_none() {
            // Deadline elapsed: best-effort last observation, same index.
            return (index, value);
        }
    }
}
