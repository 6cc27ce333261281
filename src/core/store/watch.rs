// src/core/store/watch.rs

//! Watch-channel plumbing for blocking queries.
//!
//! A read registers the table and keys it touched into a [`WatchSet`]; the store
//! fires the matching channels inside the commit critical section. The channels
//! carry the committing log index, so a woken reader re-runs its read at an index
//! at least as fresh as the write that woke it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::select_all;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::core::types::Index;

/// The set of channels whose future mutation must invalidate a blocked reader.
#[derive(Default)]
pub struct WatchSet {
    rxs: Vec<watch::Receiver<Index>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, rx: watch::Receiver<Index>) {
        self.rxs.push(rx);
    }

    pub fn is_empty(&self) -> bool {
        self.rxs.is_empty()
    }

    pub fn clear(&mut self) {
        self.rxs.clear();
    }

    /// Waits until any watched channel fires. Resolves immediately when the set
    /// is empty (nothing to wait on means nothing can change the result).
    pub async fn changed(&mut self) {
        if self.rxs.is_empty() {
            return;
        }
        let futures = self
            .rxs
            .iter_mut()
            .map(|rx| Box::pin(rx.changed()))
            .collect::<Vec<_>>();
        let _ = select_all(futures).await;
    }
}

/// One watch channel per table plus lazily-created per-key channels. Key channels
/// with no remaining receivers are pruned on the next fire.
#[derive(Debug)]
pub struct WatchRegistry {
    tables: HashMap<&'static str, watch::Sender<Index>>,
    keys: Mutex<HashMap<(&'static str, Vec<u8>), Arc<watch::Sender<Index>>>>,
}

impl WatchRegistry {
    pub fn new(table_names: &[&'static str]) -> Self {
        let tables = table_names
            .iter()
            .map(|name| (*name, watch::channel(0).0))
            .collect();
        Self {
            tables,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// A receiver that fires on any write to `table`.
    pub fn table(&self, table: &'static str) -> watch::Receiver<Index> {
        self.tables
            .get(table)
            .expect("watch registry missing table")
            .subscribe()
    }

    /// A receiver that fires when `key` in `table` changes.
    pub fn key(&self, table: &'static str, key: Vec<u8>) -> watch::Receiver<Index> {
        let mut keys = self.keys.lock();
        keys.entry((table, key))
            .or_insert_with(|| Arc::new(watch::channel(0).0))
            .subscribe()
    }

    /// Fires the table channel and every touched key channel. Called with the
    /// writer lock held so watchers and readers agree on ordering.
    pub fn fire(&self, index: Index, touched: &[(&'static str, Vec<u8>)]) {
        for (table, _) in touched {
            if let Some(tx) = self.tables.get(table) {
                tx.send_replace(index);
            }
        }
        let mut keys = self.keys.lock();
        for (table, key) in touched {
            if let Some(tx) = keys.get(&(*table, key.clone())) {
                tx.send_replace(index);
            }
        }
        // Prune key channels nobody listens to anymore.
        keys.retain(|_, tx| tx.receiver_count() > 0);
    }
}
