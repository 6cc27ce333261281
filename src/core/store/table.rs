// src/core/store/table.rs

//! A single versioned table: a primary index plus zero or more secondary indexes
//! built from composite byte keys, and a `max_index` high-water mark.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::core::types::Index;

/// The separator between components of a composite index key. Disallowed inside
/// individual components.
pub const KEY_SEP: u8 = 0x00;

/// Builds a composite index key from string components.
pub fn ikey<S: AsRef<str>>(parts: &[S]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.as_ref().len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(KEY_SEP);
        }
        out.extend_from_slice(part.as_ref().to_lowercase().as_bytes());
    }
    out
}

/// A prefix key that matches every entry whose first components equal `parts`.
pub fn ikey_prefix<S: AsRef<str>>(parts: &[S]) -> Vec<u8> {
    let mut out = ikey(parts);
    out.push(KEY_SEP);
    out
}

/// A row stored in a [`Table`]. Rows know their own primary and secondary keys
/// and carry the create/modify log indexes.
pub trait Row: Clone + Send + Sync + 'static {
    /// The table name, used for watch registration and snapshot records.
    const TABLE: &'static str;

    fn primary_key(&self) -> Vec<u8>;

    /// `(index_name, key)` pairs. Keys need not be unique across rows; the table
    /// disambiguates by appending the primary key.
    fn secondary_keys(&self) -> Vec<(&'static str, Vec<u8>)>;

    fn create_idx(&self) -> Index;
    fn modify_idx(&self) -> Index;
    fn set_create_idx(&mut self, idx: Index);
    fn set_modify_idx(&mut self, idx: Index);

    /// Payload equality, ignoring the index fields. Used to suppress no-op writes
    /// so an identical re-register does not bump `modify_idx`.
    fn same_content(&self, other: &Self) -> bool;
}

/// An in-memory table with copy-on-write semantics: cloning a table shares all
/// row payloads (`Arc`ed) and copies only the index structure.
#[derive(Debug, Clone)]
pub struct Table<R: Row> {
    rows: BTreeMap<Vec<u8>, Arc<R>>,
    /// Secondary index name -> (secondary key ++ SEP ++ primary key) -> primary key.
    secondary: BTreeMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>,
    max_index: Index,
}

impl<R: Row> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            secondary: BTreeMap::new(),
            max_index: 0,
        }
    }
}

impl<R: Row> Table<R> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn max_index(&self) -> Index {
        self.max_index
    }

    /// Used only by snapshot restore, which must reproduce `max_index` exactly.
    pub(crate) fn set_max_index(&mut self, idx: Index) {
        self.max_index = idx;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<R>> {
        self.rows.get(key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<R>> {
        self.rows.values()
    }

    /// Point lookup through a secondary index. Returns the first match; unique
    /// indexes have at most one.
    pub fn get_by(&self, index_name: &str, key: &[u8]) -> Option<Arc<R>> {
        self.list_by(index_name, key).into_iter().next()
    }

    /// All rows whose secondary key equals `key` exactly.
    pub fn list_by(&self, index_name: &str, key: &[u8]) -> Vec<Arc<R>> {
        let Some(idx) = self.secondary.get(index_name) else {
            return Vec::new();
        };
        let mut lower = key.to_vec();
        lower.push(KEY_SEP);
        let mut upper = key.to_vec();
        upper.push(KEY_SEP + 1);
        idx.range((Bound::Included(lower), Bound::Excluded(upper)))
            .filter_map(|(_, pk)| self.rows.get(pk).cloned())
            .collect()
    }

    /// All rows whose primary key starts with `prefix` (empty prefix lists all),
    /// in key order.
    pub fn list_prefix(&self, prefix: &[u8]) -> Vec<Arc<R>> {
        if prefix.is_empty() {
            return self.rows.values().cloned().collect();
        }
        self.rows
            .range((Bound::Included(prefix.to_vec()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Inserts or replaces a row at `idx`. Returns the previous version when the
    /// write changed anything; `None` means the write was an identical no-op.
    ///
    /// An identical payload neither bumps `modify_idx` nor `max_index`.
    pub fn insert(&mut self, mut row: R, idx: Index) -> InsertOutcome<R> {
        let pk = row.primary_key();
        if let Some(existing) = self.rows.get(&pk) {
            if existing.same_content(&row) {
                return InsertOutcome::Unchanged;
            }
            row.set_create_idx(existing.create_idx());
            row.set_modify_idx(idx);
            let old = self.unlink(&pk);
            self.link(Arc::new(row));
            self.max_index = self.max_index.max(idx);
            InsertOutcome::Updated { old }
        } else {
            row.set_create_idx(idx);
            row.set_modify_idx(idx);
            self.link(Arc::new(row));
            self.max_index = self.max_index.max(idx);
            InsertOutcome::Created
        }
    }

    /// Bumps a row's `modify_idx` without altering its payload, bypassing the
    /// identical-content suppression. Used for session renewal, which must be
    /// observable to blocking readers.
    pub fn touch(&mut self, key: &[u8], idx: Index) -> bool {
        let Some(row) = self.rows.get(key) else {
            return false;
        };
        let mut updated = (**row).clone();
        updated.set_modify_idx(idx);
        self.rows.insert(key.to_vec(), Arc::new(updated));
        self.max_index = self.max_index.max(idx);
        true
    }

    /// Deletes a row. A missing row is a no-op that still advances `max_index`,
    /// so blocking readers observe the (attempted) deletion.
    pub fn delete(&mut self, key: &[u8], idx: Index) -> Option<Arc<R>> {
        self.max_index = self.max_index.max(idx);
        self.unlink(key)
    }

    fn link(&mut self, row: Arc<R>) {
        let pk = row.primary_key();
        for (name, sec_key) in row.secondary_keys() {
            let mut full = sec_key;
            full.push(KEY_SEP);
            full.extend_from_slice(&pk);
            self.secondary.entry(name).or_default().insert(full, pk.clone());
        }
        self.rows.insert(pk, row);
    }

    fn unlink(&mut self, key: &[u8]) -> Option<Arc<R>> {
        let row = self.rows.remove(key)?;
        let pk = row.primary_key();
        for (name, sec_key) in row.secondary_keys() {
            let mut full = sec_key;
            full.push(KEY_SEP);
            full.extend_from_slice(&pk);
            if let Some(idx) = self.secondary.get_mut(name) {
                idx.remove(&full);
            }
        }
        Some(row)
    }

    /// Used by snapshot restore: links a row without touching its index fields.
    pub(crate) fn restore_row(&mut self, row: R) {
        self.link(Arc::new(row));
    }
}

/// The result of [`Table::insert`].
#[derive(Debug)]
pub enum InsertOutcome<R> {
    Created,
    Updated { old: Option<Arc<R>> },
    /// Identical payload; nothing written.
    Unchanged,
}

impl<R> InsertOutcome<R> {
    pub fn changed(&self) -> bool {
        !matches!(self, InsertOutcome::Unchanged)
    }
}
