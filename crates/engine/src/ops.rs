//! Row operation builders
//!
//! [`RowOps`] turns point writes against the coordinator's store into
//! [`Operation`]s that carry their own undo command and declare a lock on
//! the entity they touch:
//!
//! | Builder  | Lock  | Undo                     |
//! |----------|-------|--------------------------|
//! | `insert` | Write | delete the inserted row  |
//! | `update` | Write | restore the pre-image    |
//! | `delete` | Write | re-insert the deleted row|
//! | `read`   | Read  | none                     |
//!
//! Updates go through the optimistic locking manager, so the conflict
//! strategy decides what happens when the expected version is stale.

use serde_json::{Map, Value};
use std::sync::Arc;
use strata_concurrency::{ConflictStrategy, OptimisticLockManager};
use strata_core::{EntityKey, Patch, Row};
use strata_storage::RowStore;

use crate::context::OperationType;
use crate::operation::{Applied, LockRequirement, Operation, UndoCommand};

/// Builds store-backed operations
#[derive(Clone)]
pub struct RowOps {
    store: Arc<dyn RowStore>,
    optimistic: Arc<OptimisticLockManager>,
}

impl RowOps {
    pub(crate) fn new(store: Arc<dyn RowStore>, optimistic: Arc<OptimisticLockManager>) -> Self {
        Self { store, optimistic }
    }

    /// Insert a row
    pub fn insert(
        &self,
        table: impl Into<String>,
        id: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Operation {
        let (table, id) = (table.into(), id.into());
        let store = Arc::clone(&self.store);
        let data = Value::Object(fields.clone());
        let (t, i) = (table.clone(), id.clone());
        Operation::scoped(move |_| {
            let row = store.insert(&t, Row::new(i.as_str(), fields))?;
            Ok(Applied::with_undo(
                row.to_value(),
                UndoCommand::DeleteRow { table: t, id: i },
            ))
        })
        .targeting(OperationType::Create, table.as_str(), Some(id.clone()))
        .with_data(data)
        .with_lock(LockRequirement::write(table, id))
    }

    /// Update a row conditioned on `expected_version`
    ///
    /// On a version conflict `strategy` decides between failing, retrying
    /// with the refreshed version, or merging. The retry budget is the one
    /// configured for the transaction's mode, and retries stop early once
    /// the transaction is cancelled. The undo restores the row the winning
    /// attempt was applied to.
    pub fn update(
        &self,
        table: impl Into<String>,
        id: impl Into<String>,
        expected_version: u64,
        patch: Patch,
        strategy: ConflictStrategy,
    ) -> Operation {
        let (table, id) = (table.into(), id.into());
        let optimistic = Arc::clone(&self.optimistic);
        let data = Value::Object(patch.clone());
        let key = EntityKey::new(table.as_str(), id.as_str());
        let t = table.clone();
        Operation::scoped(move |scope| {
            let outcome = optimistic.update_with_policy(
                &key,
                expected_version,
                &patch,
                &strategy,
                scope.retry_policy(),
                &|| scope.is_cancelled(),
            )?;
            let retries = outcome.retries();
            let mut applied = Applied::with_undo(
                outcome.row.to_value(),
                UndoCommand::RestoreRow {
                    table: t,
                    previous: outcome.previous,
                },
            );
            applied.retries = retries;
            Ok(applied)
        })
        .targeting(OperationType::Update, table.as_str(), Some(id.clone()))
        .with_data(data)
        .with_lock(LockRequirement::write(table, id))
    }

    /// Delete a row
    pub fn delete(&self, table: impl Into<String>, id: impl Into<String>) -> Operation {
        let (table, id) = (table.into(), id.into());
        let store = Arc::clone(&self.store);
        let (t, i) = (table.clone(), id.clone());
        Operation::scoped(move |_| {
            let row = store.delete(&t, &i)?;
            Ok(Applied::with_undo(
                row.to_value(),
                UndoCommand::ReinsertRow { table: t, row },
            ))
        })
        .targeting(OperationType::Delete, table.as_str(), Some(id.clone()))
        .with_lock(LockRequirement::write(table, id))
    }

    /// Read a row
    pub fn read(&self, table: impl Into<String>, id: impl Into<String>) -> Operation {
        let (table, id) = (table.into(), id.into());
        let store = Arc::clone(&self.store);
        let (t, i) = (table.clone(), id.clone());
        Operation::scoped(move |_| Ok(Applied::value(store.get(&t, &i)?.to_value())))
            .targeting(OperationType::Read, table.as_str(), Some(id.clone()))
            .with_lock(LockRequirement::read(table, id))
    }
}

impl std::fmt::Debug for RowOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowOps").finish_non_exhaustive()
    }
}
