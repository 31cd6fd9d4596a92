//! Row store contract consumed by the coordinator
//!
//! The coordinator assumes nothing beyond single-row atomicity: each call
//! below is atomic for the row it touches, and `update` may carry an
//! expected version that the store checks against its version column
//! before applying the patch.
//!
//! Every call returns a tagged result:
//! `Ok(row)` | `NotFound` | `VersionConflict(current)` | other errors.

use strata_core::{EntityKey, Patch, Row, StrataError};
use thiserror::Error;

/// Result type for row store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Typed failure from a row store call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No row with this id in this table
    #[error("row {table}/{id} not found")]
    NotFound {
        /// Table name
        table: String,
        /// Row id
        id: String,
    },

    /// Conditional update rejected: stored version differs from expected
    #[error("row {table}/{id} version conflict: expected {expected}, current {current}")]
    VersionConflict {
        /// Table name
        table: String,
        /// Row id
        id: String,
        /// Version supplied by the writer
        expected: u64,
        /// Version currently stored
        current: u64,
    },

    /// Write would violate a store constraint (duplicate id, etc.)
    #[error("row {table}/{id} constraint violation: {message}")]
    ConstraintViolation {
        /// Table name
        table: String,
        /// Row id
        id: String,
        /// What was violated
        message: String,
    },

    /// Any other backend failure
    #[error("storage error: {0}")]
    Other(String),
}

impl StoreError {
    /// Current stored version for version conflicts
    pub fn current_version(&self) -> Option<u64> {
        match self {
            StoreError::VersionConflict { current, .. } => Some(*current),
            _ => None,
        }
    }
}

impl From<StoreError> for StrataError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { table, id } => {
                StrataError::not_found(format!("row {}/{}", table, id))
            }
            StoreError::VersionConflict {
                table,
                id,
                expected,
                current,
            } => StrataError::version_conflict(EntityKey::new(table, id), expected, current),
            StoreError::ConstraintViolation { table, id, message } => {
                StrataError::validation(format!("row {}/{}: {}", table, id, message))
            }
            StoreError::Other(message) => StrataError::internal(message),
        }
    }
}

/// Point-operation row store
///
/// Thread safety: all methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync).
pub trait RowStore: Send + Sync {
    /// Read the current row
    ///
    /// # Errors
    /// `NotFound` if the row does not exist.
    fn get(&self, table: &str, id: &str) -> StoreResult<Row>;

    /// Insert a new row
    ///
    /// The store refreshes `updated_at`; a row supplied with version 0 is
    /// stored at version 1.
    ///
    /// # Errors
    /// `ConstraintViolation` if a row with the same id already exists.
    fn insert(&self, table: &str, row: Row) -> StoreResult<Row>;

    /// Apply a shallow patch, optionally conditioned on the stored version
    ///
    /// On success the stored version increases by exactly 1 and
    /// `updated_at` is refreshed.
    ///
    /// # Errors
    /// `NotFound` if the row does not exist, `VersionConflict` if
    /// `expected_version` is given and differs from the stored version.
    fn update(
        &self,
        table: &str,
        id: &str,
        patch: &Patch,
        expected_version: Option<u64>,
    ) -> StoreResult<Row>;

    /// Delete a row, returning its last state
    ///
    /// # Errors
    /// `NotFound` if the row does not exist.
    fn delete(&self, table: &str, id: &str) -> StoreResult<Row>;
}
