//! In-memory row store
//!
//! DashMap keyed by `EntityKey`, one entry per row.
//!
//! # Design
//!
//! - DashMap: 16-way sharded by default, lock-free reads
//! - Single-row atomicity: every write holds only the target row's shard
//!   entry while it checks the version column and applies the patch
//! - No multi-row transactions: exactly the contract the coordinator assumes
//!
//! Used as the default backend in tests and for embedding the coordinator
//! in front of an ephemeral data set.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{EntityKey, Patch, Row};
use tracing::trace;

use crate::store::{RowStore, StoreError, StoreResult};

/// DashMap-backed row store with a version column
pub struct MemoryStore {
    /// Rows keyed by (table, id)
    rows: DashMap<EntityKey, Row>,
    /// Total successful writes (inserts + updates + deletes), observational
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of rows across all tables
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the store holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Check if a row exists
    pub fn contains(&self, table: &str, id: &str) -> bool {
        self.rows.contains_key(&EntityKey::new(table, id))
    }

    /// Current version of a row, if it exists
    pub fn version(&self, table: &str, id: &str) -> Option<u64> {
        self.rows
            .get(&EntityKey::new(table, id))
            .map(|row| row.version)
    }

    /// All rows of a table, sorted by id
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .rows
            .iter()
            .filter(|entry| entry.key().table == table)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Total successful writes since creation
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("rows", &self.rows.len())
            .field("writes", &self.write_count())
            .finish()
    }
}

impl RowStore for MemoryStore {
    fn get(&self, table: &str, id: &str) -> StoreResult<Row> {
        self.rows
            .get(&EntityKey::new(table, id))
            .map(|row| row.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })
    }

    fn insert(&self, table: &str, mut row: Row) -> StoreResult<Row> {
        let key = EntityKey::new(table, row.id.clone());
        match self.rows.entry(key) {
            Entry::Occupied(_) => Err(StoreError::ConstraintViolation {
                table: table.to_string(),
                id: row.id,
                message: "duplicate id".to_string(),
            }),
            Entry::Vacant(slot) => {
                row.version = row.version.max(1);
                row.updated_at = Utc::now();
                let stored = slot.insert(row).value().clone();
                self.record_write();
                trace!(target: "strata::store", table, id = %stored.id, "row inserted");
                Ok(stored)
            }
        }
    }

    fn update(
        &self,
        table: &str,
        id: &str,
        patch: &Patch,
        expected_version: Option<u64>,
    ) -> StoreResult<Row> {
        // get_mut holds the shard write lock for this row: check + apply is atomic
        let mut row = self
            .rows
            .get_mut(&EntityKey::new(table, id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;

        if let Some(expected) = expected_version {
            if row.version != expected {
                return Err(StoreError::VersionConflict {
                    table: table.to_string(),
                    id: id.to_string(),
                    expected,
                    current: row.version,
                });
            }
        }

        row.apply_patch(patch);
        let updated = row.clone();
        drop(row);
        self.record_write();
        trace!(target: "strata::store", table, id, version = updated.version, "row updated");
        Ok(updated)
    }

    fn delete(&self, table: &str, id: &str) -> StoreResult<Row> {
        let (_, row) = self
            .rows
            .remove(&EntityKey::new(table, id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        self.record_write();
        trace!(target: "strata::store", table, id, "row deleted");
        Ok(row)
    }
}
