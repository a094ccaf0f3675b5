//! Sharded Record Table
//!
//! A 64-way sharded table of records keyed by id. Reads clone the record
//! out; writes go through [`Table::update`], which applies a closure to a
//! copy under the shard's write lock and only stores the copy when the
//! closure succeeds. That makes status checks inside the closure an atomic
//! compare-and-swap.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Constants
// =============================================================================

/// Number of shards per table
pub const TABLE_SHARD_COUNT: usize = 64;

#[inline]
fn shard_index(id: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % TABLE_SHARD_COUNT
}

// =============================================================================
// Record
// =============================================================================

/// Something that can live in a [`Table`]
pub trait Record: Clone + Send + Sync + 'static {
    /// Resource kind used in error messages
    const KIND: &'static str;

    fn id(&self) -> &str;
}

// =============================================================================
// Table Statistics
// =============================================================================

/// Counters across all shards of a table
#[derive(Debug, Default)]
pub struct TableStats {
    pub records: AtomicU64,
    pub inserts: AtomicU64,
    pub updates: AtomicU64,
    pub removals: AtomicU64,
    /// Updates rejected by their closure
    pub rejected_updates: AtomicU64,
}

/// Snapshot of table statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStatsSnapshot {
    pub records: u64,
    pub inserts: u64,
    pub updates: u64,
    pub removals: u64,
    pub rejected_updates: u64,
}

impl TableStats {
    pub fn snapshot(&self) -> TableStatsSnapshot {
        TableStatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            rejected_updates: self.rejected_updates.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// Sharded in-memory table of records
pub struct Table<T: Record> {
    shards: Vec<RwLock<HashMap<String, T>>>,
    stats: TableStats,
}

impl<T: Record> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("kind", &T::KIND)
            .field("records", &self.stats.records.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Record> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> Table<T> {
    pub fn new() -> Self {
        Self {
            shards: (0..TABLE_SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            stats: TableStats::default(),
        }
    }

    #[inline]
    fn shard(&self, id: &str) -> &RwLock<HashMap<String, T>> {
        &self.shards[shard_index(id)]
    }

    /// Insert a new record; fails if the id is taken
    pub fn insert(&self, record: T) -> Result<()> {
        let mut shard = self.shard(record.id()).write();
        if shard.contains_key(record.id()) {
            return Err(Error::ResourceExists {
                kind: T::KIND.to_string(),
                name: record.id().to_string(),
            });
        }
        shard.insert(record.id().to_string(), record);
        self.stats.records.fetch_add(1, Ordering::Relaxed);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get a copy of a record
    pub fn get(&self, id: &str) -> Option<T> {
        self.shard(id).read().get(id).cloned()
    }

    /// Get a copy of a record or a not-found error
    pub fn require(&self, id: &str) -> Result<T> {
        self.get(id).ok_or_else(|| Error::not_found(T::KIND, id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shard(id).read().contains_key(id)
    }

    /// Atomically modify a record
    ///
    /// The closure runs on a copy under the shard write lock. The copy
    /// replaces the stored record only if the closure returns `Ok`.
    pub fn update<R, F>(&self, id: &str, f: F) -> Result<(T, R)>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let mut shard = self.shard(id).write();
        let current = shard.get(id).ok_or_else(|| Error::not_found(T::KIND, id))?;
        let mut copy = current.clone();
        match f(&mut copy) {
            Ok(out) => {
                shard.insert(id.to_string(), copy.clone());
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
                Ok((copy, out))
            }
            Err(e) => {
                self.stats.rejected_updates.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Modify a record with an infallible closure
    pub fn modify<F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        self.update(id, |record| {
            f(record);
            Ok(())
        })
        .map(|(record, _)| record)
    }

    /// Remove a record
    pub fn remove(&self, id: &str) -> Option<T> {
        let removed = self.shard(id).write().remove(id);
        if removed.is_some() {
            self.stats.records.fetch_sub(1, Ordering::Relaxed);
            self.stats.removals.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Copies of every record matching a predicate
    pub fn filter<P>(&self, mut predicate: P) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().values().filter(|r| predicate(r)).cloned());
        }
        out
    }

    /// First record matching a predicate
    pub fn find<P>(&self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        for shard in &self.shards {
            if let Some(found) = shard.read().values().find(|r| predicate(r)) {
                return Some(found.clone());
            }
        }
        None
    }

    /// Copies of every record
    pub fn list(&self) -> Vec<T> {
        self.filter(|_| true)
    }

    pub fn len(&self) -> usize {
        self.stats.records.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TableStatsSnapshot {
        self.stats.snapshot()
    }
}
