//! Strata Coordinator - transaction coordination for row stores
//!
//! Strata gives multi-step, multi-entity writes transactional behavior on
//! top of a store that only offers single-row operations: advisory locks,
//! optimistic version checks, saga-style compensation, timeouts and
//! deadlock resolution.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_coordinator::{
//!     patch_from, ConflictStrategy, CoordinatorConfig, MemoryStore, TransactionCoordinator,
//!     TransactionOptions,
//! };
//!
//! let coordinator = TransactionCoordinator::start(
//!     Arc::new(MemoryStore::new()),
//!     CoordinatorConfig::default(),
//! )?;
//! let rows = coordinator.row_ops();
//!
//! let txn = coordinator.begin(TransactionOptions::cross_domain())?;
//! coordinator.execute(txn, vec![
//!     rows.insert("cards", "c1", patch_from(serde_json::json!({"title": "Ship it"}))),
//!     rows.update("boards", "b1", 4, patch_from(serde_json::json!({"cards": 12})),
//!                 ConflictStrategy::RetryAutomatic),
//! ])?;
//! coordinator.commit(txn)?;
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: ids, rows, entity keys, the error taxonomy
//! - `strata-storage`: the `RowStore` contract and an in-memory store
//! - `strata-concurrency`: advisory locks, deadlock detection, optimistic
//!   version checks, conflict resolution, retry with backoff
//! - `strata-engine`: the coordinator, transaction contexts, compensation,
//!   events, metrics and background workers

pub use strata_concurrency::{
    ConflictRecord, ConflictStrategy, DeadlockInfo, FieldMergeRule, HeldLock, LockRegistry,
    MergeStrategy, OptimisticLockManager, RetryPolicy, VersionConflict,
};
pub use strata_core::{
    patch_from, Conflict, EntityKey, LockMode, Patch, Row, StrataError, StrataResult, TxnId, Value,
};
pub use strata_engine::*;
pub use strata_storage::{MemoryStore, RowStore, StoreError, StoreResult};
