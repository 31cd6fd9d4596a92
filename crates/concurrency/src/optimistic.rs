//! Optimistic locking manager
//!
//! Composes the version guard, the conflict resolver and the retry policy
//! into one "update with version check" operation, and fronts the lock
//! registry for advisory locks.
//!
//! # Update algorithm
//!
//! ```text
//! loop:
//!   read row; version != expected -> conflict
//!   guarded update(expected_version, patch)
//!   passed           -> done (version + 1, pre-image = row read above)
//!   conflict         -> record in history
//!                       budget spent or interrupted -> Conflict
//!                       resolver(strategy, current row, caller patch)
//!                         Fail  -> Conflict
//!                         Retry -> (optional backoff) try again with new patch/version
//! ```
//!
//! Only this manager issues conditional writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{EntityKey, Patch, Row, StrataError, StrataResult, TxnId};
use strata_storage::RowStore;
use tracing::{debug, warn};

use crate::conflict::{
    ConflictHistory, ConflictRecord, ConflictResolver, ConflictStrategy, Resolution,
    VersionConflict,
};
use crate::lock::{HeldLock, LockGrant, LockRegistry, LockRequest};
use crate::retry::RetryPolicy;
use crate::version_guard::{GuardOutcome, VersionGuard};

/// Successful optimistic update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// Row after the update
    pub row: Row,
    /// Row the winning attempt was applied against
    pub previous: Row,
    /// Guarded attempts made, first included
    pub attempts: u32,
    /// Conflicts hit on the way
    pub conflicts: u32,
}

impl UpdateOutcome {
    /// Writes beyond the first one
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Version-checked updates plus advisory locks over one store
pub struct OptimisticLockManager {
    store: Arc<dyn RowStore>,
    registry: Arc<LockRegistry>,
    resolver: ConflictResolver,
    history: ConflictHistory,
    retry: RetryPolicy,
    conflicts: AtomicU64,
}

impl OptimisticLockManager {
    /// Create a manager with the default retry policy
    pub fn new(store: Arc<dyn RowStore>, registry: Arc<LockRegistry>) -> Self {
        Self {
            store,
            registry,
            resolver: ConflictResolver::new(),
            history: ConflictHistory::new(),
            retry: RetryPolicy::default(),
            conflicts: AtomicU64::new(0),
        }
    }

    /// Replace the retry policy used by retrying strategies
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Retry policy in force
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Underlying lock registry
    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// Update a row only if its stored version is `expected_version`,
    /// resolving conflicts with `strategy`
    ///
    /// # Errors
    /// - `Conflict::Version` when the strategy gives up (the error carries
    ///   the stored version at the last attempt)
    /// - `NotFound` if the row does not exist
    pub fn update_with_optimistic_locking(
        &self,
        key: &EntityKey,
        expected_version: u64,
        patch: &Patch,
        strategy: &ConflictStrategy,
    ) -> StrataResult<UpdateOutcome> {
        self.update_interruptible(key, expected_version, patch, strategy, &|| false)
    }

    /// Same as [`update_with_optimistic_locking`](Self::update_with_optimistic_locking),
    /// but stops retrying once `interrupted` returns true
    pub fn update_interruptible(
        &self,
        key: &EntityKey,
        expected_version: u64,
        patch: &Patch,
        strategy: &ConflictStrategy,
        interrupted: &dyn Fn() -> bool,
    ) -> StrataResult<UpdateOutcome> {
        self.update_with_policy(key, expected_version, patch, strategy, &self.retry, interrupted)
    }

    /// Same as [`update_interruptible`](Self::update_interruptible), but
    /// budgets and backs off with `policy` instead of the manager's own
    pub fn update_with_policy(
        &self,
        key: &EntityKey,
        expected_version: u64,
        patch: &Patch,
        strategy: &ConflictStrategy,
        policy: &RetryPolicy,
        interrupted: &dyn Fn() -> bool,
    ) -> StrataResult<UpdateOutcome> {
        let guard = VersionGuard::new(self.store.as_ref());
        let budget = if strategy.single_retry() {
            2
        } else {
            policy.max_attempts.max(1)
        };

        let mut expected = expected_version;
        let mut attempt_patch = patch.clone();
        let mut attempts = 0u32;
        let mut conflicts = 0u32;

        loop {
            attempts += 1;
            // Versions only move forward, so a passing write at `expected`
            // was applied to exactly this row
            let previous = guard.current(key)?;
            let outcome = if previous.version == expected {
                guard.update(key, expected, &attempt_patch)?
            } else {
                GuardOutcome::Conflict {
                    expected,
                    current: previous.version,
                }
            };
            let (stale, current) = match outcome {
                GuardOutcome::Passed(row) => {
                    debug!(
                        target: "strata::txn",
                        table = %key.table,
                        entity_id = %key.entity_id,
                        version = row.version,
                        attempts,
                        "Optimistic update applied"
                    );
                    return Ok(UpdateOutcome {
                        row,
                        previous,
                        attempts,
                        conflicts,
                    });
                }
                GuardOutcome::Conflict { expected, current } => (expected, current),
            };

            conflicts += 1;
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            let conflict = VersionConflict {
                key: key.clone(),
                expected: stale,
                current,
            };
            self.history.record(&conflict, strategy);
            warn!(
                target: "strata::txn",
                table = %key.table,
                entity_id = %key.entity_id,
                expected = stale,
                current,
                strategy = strategy.name(),
                "Version conflict"
            );

            if attempts >= budget || interrupted() {
                return Err(StrataError::version_conflict(key.clone(), stale, current));
            }

            let current_row = guard.current(key)?;
            match self
                .resolver
                .resolve(strategy, &conflict, &current_row, patch)
            {
                Resolution::Fail => {
                    return Err(StrataError::version_conflict(key.clone(), stale, current))
                }
                Resolution::Retry {
                    patch: next,
                    expected_version,
                } => {
                    if strategy.backs_off() {
                        std::thread::sleep(policy.delay_for(attempts));
                    }
                    attempt_patch = next;
                    expected = expected_version;
                }
            }
        }
    }

    /// Acquire an advisory lock for `owner`
    pub fn acquire_lock(&self, owner: TxnId, request: &LockRequest) -> StrataResult<LockGrant> {
        self.registry.acquire(owner, request)
    }

    /// Release `owner`'s advisory lock on `key`
    pub fn release_lock(&self, owner: TxnId, key: &EntityKey) -> Option<HeldLock> {
        self.registry.release(owner, key)
    }

    /// Release every advisory lock of `owner`
    pub fn release_all(&self, owner: TxnId) -> Vec<HeldLock> {
        self.registry.release_all(owner)
    }

    /// Recorded conflicts for `key`, oldest first
    pub fn conflict_history(&self, key: &EntityKey) -> Vec<ConflictRecord> {
        self.history.for_entity(key)
    }

    /// Total conflicts observed since creation
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OptimisticLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticLockManager")
            .field("retry", &self.retry)
            .field("conflicts", &self.conflict_count())
            .finish()
    }
}
