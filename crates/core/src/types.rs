//! Core types for transaction coordination
//!
//! This module defines the identifiers and row shapes shared by every layer:
//! - TxnId: Unique identifier for a coordinated transaction
//! - EntityKey: (table, entity id) pair, the unit of contention
//! - LockMode: Advisory lock compatibility classes
//! - Row / Patch: Versioned rows as exchanged with the row store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Field patch applied to a row: top-level field name → new value.
///
/// Patches are shallow. A field present in the patch replaces the stored
/// field wholesale; fields absent from the patch are left untouched.
pub type Patch = Map<String, Value>;

/// Unique identifier for a coordinated transaction
///
/// A TxnId wraps a UUID v4. Identifiers are opaque tokens: the coordinator
/// never derives ordering from them (start time is tracked separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Create a new random TxnId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TxnId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a TxnId from a string representation
    ///
    /// # Errors
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this TxnId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single row addressed by table and entity id
///
/// This is the granularity of both advisory locks and version checks.
/// Format when displayed: "table/entity_id"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Table (collection) name
    pub table: String,
    /// Entity identifier within the table
    pub entity_id: String,
}

impl EntityKey {
    /// Create a new entity key
    pub fn new(table: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.entity_id)
    }
}

/// Advisory lock mode
///
/// Compatibility matrix:
///
/// | held \ requested | Read | Write |
/// |------------------|------|-------|
/// | Read             | ok   | no    |
/// | Write            | no   | no    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock, excludes only writers
    Read,
    /// Exclusive lock, excludes everyone
    Write,
}

impl LockMode {
    /// Whether a lock in `self` mode can coexist with a lock held in `held` mode
    /// by a different transaction.
    pub fn is_compatible_with(self, held: LockMode) -> bool {
        matches!((self, held), (LockMode::Read, LockMode::Read))
    }

    /// Stable lowercase name, used in logs and events
    pub fn name(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored row with its version column
///
/// `version` starts at 1 on insert and increases by exactly 1 on every
/// successful update. `updated_at` is refreshed on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Entity identifier (unique within its table)
    pub id: String,
    /// Version column used for optimistic concurrency
    pub version: u64,
    /// Wall-clock time of the last write
    pub updated_at: DateTime<Utc>,
    /// Row payload
    pub fields: Map<String, Value>,
}

impl Row {
    /// Create a freshly inserted row at version 1
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            updated_at: Utc::now(),
            fields,
        }
    }

    /// Get a single field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Apply a shallow patch, bump the version by one and refresh `updated_at`
    pub fn apply_patch(&mut self, patch: &Patch) {
        for (field, value) in patch {
            self.fields.insert(field.clone(), value.clone());
        }
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Patch that restores every field of this row (used as a pre-image)
    pub fn to_patch(&self) -> Patch {
        self.fields.clone()
    }

    /// Serialize the row as a JSON value (operation results are JSON)
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert("version".to_string(), Value::from(self.version));
        obj.insert(
            "updated_at".to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        obj.insert("fields".to_string(), Value::Object(self.fields.clone()));
        Value::Object(obj)
    }
}

/// Build a patch from a JSON object literal.
///
/// Non-object values produce an empty patch.
pub fn patch_from(value: Value) -> Patch {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
