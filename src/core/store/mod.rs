// src/core/store/mod.rs

//! The authoritative catalog for one datacenter.
//!
//! Copy-on-write at table granularity: `Tables` holds every table behind an
//! `Arc`, a write transaction clones only what it mutates, and commit publishes
//! the new generation with a single pointer swap. Readers grab the current
//! generation in O(1) and are never blocked by writers.
//!
//! Commit runs three things inside the writer critical section, in order: the
//! pointer swap, the event-publisher extractors, and the watch-channel fires.
//! A blocking reader woken by a watch therefore always re-reads at an index at
//! least as fresh as every event already published for that commit.

pub mod reads;
pub mod schema;
pub mod snapshot;
pub mod table;
pub mod txn;
pub mod watch;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::core::errors::MusterError;
use crate::core::types::{
    CaRoot, ConfigEntry, HealthCheck, Index, Intention, KvEntry, Node, Peering, Service, Session,
};

pub use table::{InsertOutcome, Row, Table, ikey, ikey_prefix};
pub use txn::{Change, ChangeOp, WriteTxn};
pub use watch::{WatchRegistry, WatchSet};

/// One immutable generation of the whole catalog.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub nodes: Arc<Table<Node>>,
    pub services: Arc<Table<Service>>,
    pub checks: Arc<Table<HealthCheck>>,
    pub sessions: Arc<Table<Session>>,
    pub kv: Arc<Table<KvEntry>>,
    pub intentions: Arc<Table<Intention>>,
    pub config_entries: Arc<Table<ConfigEntry>>,
    pub ca_roots: Arc<Table<CaRoot>>,
    pub peerings: Arc<Table<Peering>>,
    /// The index of the last committed transaction, no-ops included.
    pub last_index: Index,
}

impl Tables {
    /// The `max_index` of a single table by name.
    pub fn table_max_index(&self, table: &str) -> Index {
        match table {
            schema::tables::NODES => self.nodes.max_index(),
            schema::tables::SERVICES => self.services.max_index(),
            schema::tables::CHECKS => self.checks.max_index(),
            schema::tables::SESSIONS => self.sessions.max_index(),
            schema::tables::KV => self.kv.max_index(),
            schema::tables::INTENTIONS => self.intentions.max_index(),
            schema::tables::CONFIG_ENTRIES => self.config_entries.max_index(),
            schema::tables::CA_ROOTS => self.ca_roots.max_index(),
            schema::tables::PEERINGS => self.peerings.max_index(),
            _ => 0,
        }
    }

    /// The greatest `max_index` across several tables; the index reported by
    /// reads that join them.
    pub fn max_index_of(&self, tables: &[&str]) -> Index {
        tables
            .iter()
            .map(|t| self.table_max_index(t))
            .max()
            .unwrap_or(0)
    }
}

/// Receives committed changes inside the writer critical section. Implemented by
/// the event publisher; a no-op sink is used before the publisher is wired up.
pub trait CommitSink: Send + Sync {
    fn on_commit(&self, old: &Tables, new: &Tables, index: Index, changes: &[Change]);
}

/// The state store: the current generation, the writer lock, and the watch
/// registry.
pub struct Store {
    current: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
    watches: WatchRegistry,
    sink: RwLock<Option<Arc<dyn CommitSink>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Tables::default())),
            writer: Mutex::new(()),
            watches: WatchRegistry::new(schema::tables::ALL),
            sink: RwLock::new(None),
        }
    }

    /// Wires up the event publisher. Must be called before the first write that
    /// should produce events.
    pub fn set_commit_sink(&self, sink: Arc<dyn CommitSink>) {
        *self.sink.write() = Some(sink);
    }

    /// The index of the last committed transaction.
    pub fn last_index(&self) -> Index {
        self.current.read().last_index
    }

    /// Begins a write transaction tagged with `index`. All mutations inside
    /// observe that single index. Fails with `StaleIndex` when `index` does not
    /// advance the store.
    pub fn write_txn(&self, index: Index) -> Result<WriteTxn<'_>, MusterError> {
        let guard = self.writer.lock();
        let base = self.current.read().clone();
        if index <= base.last_index {
            return Err(MusterError::StaleIndex {
                attempted: index,
                current: base.last_index,
            });
        }
        Ok(WriteTxn::new(self, guard, base, index))
    }

    /// Returns a stable snapshot. A reader obtained at time T sees no subsequent
    /// write.
    pub fn read_txn(&self) -> reads::ReadTxn<'_> {
        reads::ReadTxn::new(self.current.read().clone(), &self.watches)
    }

    /// A receiver that fires on any write to `table`. Exposed for subsystems
    /// (e.g. the session TTL sweeper) that watch coarsely.
    pub fn watch_table(&self, table: &'static str) -> tokio::sync::watch::Receiver<Index> {
        self.watches.table(table)
    }

    /// Replaces the entire catalog atomically, preserving per-table `max_index`
    /// values exactly. Used by snapshot restore.
    pub fn restore(&self, tables: Tables) {
        let _guard = self.writer.lock();
        let index = tables.last_index;
        *self.current.write() = Arc::new(tables);
        // Wake every blocked reader; their view of the world just changed wholesale.
        let touched: Vec<(&'static str, Vec<u8>)> = schema::tables::ALL
            .iter()
            .map(|t| (*t, Vec::new()))
            .collect();
        self.watches.fire(index, &touched);
    }

    /// Commit internals, invoked by `WriteTxn::commit` with the writer guard held.
    pub(crate) fn commit_locked(
        &self,
        _guard: &MutexGuard<'_, ()>,
        old: Arc<Tables>,
        new: Tables,
        index: Index,
        changes: &[Change],
        touched: &[(&'static str, Vec<u8>)],
    ) {
        let new = Arc::new(new);
        *self.current.write() = new.clone();
        if let Some(sink) = self.sink.read().as_ref() {
            sink.on_commit(&old, &new, index, changes);
        }
        self.watches.fire(index, touched);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("last_index", &self.last_index())
            .finish()
    }
}
