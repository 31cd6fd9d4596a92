//! Concurrency layer for the Strata transaction coordinator
//!
//! This crate implements the conflict-handling building blocks:
//! - VersionGuard: single conditional point-update
//! - RetryPolicy: bounded exponential backoff with jitter
//! - ConflictResolver: strategy dispatch, field merge rules, conflict history
//! - LockRegistry: advisory Read/Write locks, waiters, active transactions
//! - DeadlockDetector: wait-for graph + DFS cycle detection
//! - OptimisticLockManager: version-checked updates and advisory locks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod deadlock;
pub mod lock;
pub mod optimistic;
pub mod retry;
pub mod version_guard;

pub use conflict::{
    merge_fields, ConflictHandler, ConflictHistory, ConflictRecord, ConflictResolver,
    ConflictStrategy, FieldMergeRule, MergeFn, MergeStrategy, Resolution, VersionConflict,
    CONFLICT_HISTORY_LIMIT,
};
pub use deadlock::{
    find_cycles, DeadlockDetector, DeadlockInfo, DeadlockResolution, DeadlockResource,
};
pub use lock::{
    ActiveTransaction, CancelToken, HeldLock, LockGrant, LockRegistry, LockRequest, WaitEdge,
    WaitRecord,
};
pub use optimistic::{OptimisticLockManager, UpdateOutcome};
pub use retry::{Retried, RetryPolicy};
pub use version_guard::{GuardOutcome, VersionGuard};
