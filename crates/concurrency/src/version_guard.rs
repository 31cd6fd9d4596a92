//! Version guard: a single conditional point-update
//!
//! The guard is the leaf of the optimistic locking stack. It issues one
//! `update` with an expected version and reports a version mismatch as a
//! value (`GuardOutcome::Conflict`), leaving the decision of what to do
//! about it to the caller. All other store failures are returned as errors.

use strata_core::{EntityKey, Patch, Row, StrataError, StrataResult};
use strata_storage::{RowStore, StoreError};

/// Outcome of a guarded call
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// Precondition held. Carries the row after the call.
    Passed(Row),
    /// Stored version differs from the expected one
    Conflict {
        /// Version the caller expected
        expected: u64,
        /// Version currently stored
        current: u64,
    },
}

impl GuardOutcome {
    /// True if the precondition held
    pub fn is_passed(&self) -> bool {
        matches!(self, GuardOutcome::Passed(_))
    }

    /// Convert into a result, turning a conflict into `StrataError::Conflict`
    pub fn into_result(self, key: &EntityKey) -> StrataResult<Row> {
        match self {
            GuardOutcome::Passed(row) => Ok(row),
            GuardOutcome::Conflict { expected, current } => {
                Err(StrataError::version_conflict(key.clone(), expected, current))
            }
        }
    }
}

/// Conditional update wrapper over a row store
pub struct VersionGuard<'a> {
    store: &'a dyn RowStore,
}

impl<'a> VersionGuard<'a> {
    /// Wrap a store
    pub fn new(store: &'a dyn RowStore) -> Self {
        Self { store }
    }

    /// Apply `patch` only if the stored version equals `expected_version`
    ///
    /// On success the stored version is `expected_version + 1`.
    ///
    /// # Errors
    /// Not-found and other store failures. A version mismatch is NOT an
    /// error; it is returned as `GuardOutcome::Conflict`.
    pub fn update(
        &self,
        key: &EntityKey,
        expected_version: u64,
        patch: &Patch,
    ) -> StrataResult<GuardOutcome> {
        match self
            .store
            .update(&key.table, &key.entity_id, patch, Some(expected_version))
        {
            Ok(row) => Ok(GuardOutcome::Passed(row)),
            Err(StoreError::VersionConflict {
                expected, current, ..
            }) => Ok(GuardOutcome::Conflict { expected, current }),
            Err(e) => Err(e.into()),
        }
    }

    /// Check that the stored version equals `expected_version` without writing
    ///
    /// # Errors
    /// Not-found and other store failures.
    pub fn verify(&self, key: &EntityKey, expected_version: u64) -> StrataResult<GuardOutcome> {
        let row = self.store.get(&key.table, &key.entity_id)?;
        if row.version == expected_version {
            Ok(GuardOutcome::Passed(row))
        } else {
            Ok(GuardOutcome::Conflict {
                expected: expected_version,
                current: row.version,
            })
        }
    }

    /// Read the current row
    pub fn current(&self, key: &EntityKey) -> StrataResult<Row> {
        Ok(self.store.get(&key.table, &key.entity_id)?)
    }
}
