//! Advisory lock registry
//!
//! Tracks, per entity, which live transactions hold which advisory locks,
//! which transactions are currently blocked waiting for a lock, and the
//! table of active transactions (start time + cancellation token) that the
//! deadlock detector needs to pick a victim.
//!
//! # Lock semantics
//!
//! - `Write` excludes every other lock on the entity; `Read` excludes only `Write`
//! - Ownership is transaction-scoped: only the owner can release a lock
//! - Re-acquiring a held lock succeeds; a sole `Read` holder may upgrade to `Write`
//! - Locks carry an optional expiry and are treated as absent once expired
//! - Without a wait budget an incompatible request is rejected at once with
//!   `Conflict::Lock`. With one, the claimant is recorded as a waiter (this
//!   is what produces wait-for edges) and polls until granted, out of time,
//!   or cancelled.
//!
//! # Concurrency
//!
//! Every table is a DashMap; no operation holds entries of two maps at once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{EntityKey, LockMode, StrataError, StrataResult, TxnId};
use tracing::{debug, trace};

/// Default polling interval while waiting for a lock
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Cooperative cancellation flag for one transaction
///
/// The first `cancel` wins; its reason is kept for the rollback record.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    /// Create an un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns false if the token was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(reason.into());
        self.cancelled.store(true, Ordering::Release);
        true
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Reason given by the first `cancel` call
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// A lock held by a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct HeldLock {
    /// Owning transaction
    pub owner: TxnId,
    /// Locked entity
    pub key: EntityKey,
    /// Lock mode
    pub mode: LockMode,
    /// Version the owner expects the row to have, if declared
    pub expected_version: Option<u64>,
    /// Wall-clock acquisition time
    pub locked_at: DateTime<Utc>,
    /// Monotonic acquisition time
    pub acquired: Instant,
    /// Monotonic expiry, if the lock has a timeout
    pub expires_at: Option<Instant>,
}

impl HeldLock {
    /// Whether the lock has expired at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// A lock request
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequest {
    /// Entity to lock
    pub key: EntityKey,
    /// Requested mode
    pub mode: LockMode,
    /// Expected row version to record with the lock
    pub expected_version: Option<u64>,
    /// Lock lifetime; `None` means held until released
    pub ttl: Option<Duration>,
    /// How long to wait for an incompatible lock to go away; `None` = reject at once
    pub wait: Option<Duration>,
}

impl LockRequest {
    /// Request a lock with no expiry and no waiting
    pub fn new(key: EntityKey, mode: LockMode) -> Self {
        Self {
            key,
            mode,
            expected_version: None,
            ttl: None,
            wait: None,
        }
    }

    /// Set the lock lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Allow waiting up to `wait` for the lock
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Record an expected row version with the lock
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// A granted lock plus how long the claimant waited for it
#[derive(Debug, Clone)]
pub struct LockGrant {
    /// The lock now held
    pub lock: HeldLock,
    /// Time spent blocked before the grant
    pub waited: Duration,
}

/// A transaction blocked on a lock
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRecord {
    /// Waiting transaction
    pub txn: TxnId,
    /// Entity it waits for
    pub key: EntityKey,
    /// Mode it requested
    pub mode: LockMode,
    /// When it started waiting
    pub since: Instant,
}

/// Edge of the wait-for graph: `waiter` is blocked by a lock `holder` owns
#[derive(Debug, Clone, PartialEq)]
pub struct WaitEdge {
    /// Blocked transaction
    pub waiter: TxnId,
    /// Transaction holding the blocking lock
    pub holder: TxnId,
    /// Contended entity
    pub key: EntityKey,
    /// Mode the waiter requested
    pub mode: LockMode,
}

/// Live transaction as seen by the lock registry
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    /// Transaction id
    pub txn_id: TxnId,
    /// Monotonic start time (later = younger)
    pub started_at: Instant,
    /// Cancellation token shared with the coordinator
    pub cancel: Arc<CancelToken>,
}

/// Advisory lock table, waiter table and active-transaction table
pub struct LockRegistry {
    /// Locks per entity
    locks: DashMap<EntityKey, Vec<HeldLock>>,
    /// Entities each transaction holds locks on
    owned: DashMap<TxnId, Vec<EntityKey>>,
    /// Transactions currently blocked in `acquire`
    waiting: DashMap<TxnId, WaitRecord>,
    /// Live transactions
    active: DashMap<TxnId, ActiveTransaction>,
    /// Sleep between attempts while waiting
    poll_interval: Duration,
}

impl LockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create an empty registry with a custom wait polling interval
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            owned: DashMap::new(),
            waiting: DashMap::new(),
            active: DashMap::new(),
            poll_interval,
        }
    }

    // ========================================================================
    // Active transactions
    // ========================================================================

    /// Register a live transaction
    pub fn register_transaction(&self, txn_id: TxnId, started_at: Instant) -> Arc<CancelToken> {
        let cancel = Arc::new(CancelToken::new());
        self.active.insert(
            txn_id,
            ActiveTransaction {
                txn_id,
                started_at,
                cancel: Arc::clone(&cancel),
            },
        );
        cancel
    }

    /// Forget a transaction (after it reached a terminal state)
    pub fn unregister_transaction(&self, txn_id: TxnId) {
        self.active.remove(&txn_id);
        self.waiting.remove(&txn_id);
    }

    /// Look up a live transaction
    pub fn transaction(&self, txn_id: TxnId) -> Option<ActiveTransaction> {
        self.active.get(&txn_id).map(|t| t.value().clone())
    }

    /// All live transactions
    pub fn active_transactions(&self) -> Vec<ActiveTransaction> {
        self.active.iter().map(|t| t.value().clone()).collect()
    }

    /// Request cancellation of a transaction. Returns false if unknown or already cancelled.
    pub fn cancel(&self, txn_id: TxnId, reason: &str) -> bool {
        self.active
            .get(&txn_id)
            .map(|t| t.cancel.cancel(reason))
            .unwrap_or(false)
    }

    /// Whether a transaction has been asked to stop
    pub fn is_cancelled(&self, txn_id: TxnId) -> bool {
        self.active
            .get(&txn_id)
            .map(|t| t.cancel.is_cancelled())
            .unwrap_or(false)
    }

    // ========================================================================
    // Acquire / release
    // ========================================================================

    /// Acquire a lock for `owner`
    ///
    /// # Errors
    /// `Conflict::Lock` if an incompatible lock is held by another
    /// transaction and the request has no wait budget, the budget ran out,
    /// or the owner was cancelled while waiting.
    pub fn acquire(&self, owner: TxnId, request: &LockRequest) -> StrataResult<LockGrant> {
        let mut blocker = match self.try_acquire(owner, request) {
            Ok(lock) => {
                return Ok(LockGrant {
                    lock,
                    waited: Duration::ZERO,
                })
            }
            Err(blocker) => blocker,
        };

        let wait = match request.wait {
            Some(wait) if !wait.is_zero() => wait,
            _ => {
                debug!(
                    target: "strata::lock",
                    txn_id = %owner,
                    key = %request.key,
                    mode = %request.mode,
                    "Lock rejected"
                );
                return Err(StrataError::lock_conflict(
                    request.key.clone(),
                    request.mode,
                    blocker,
                ));
            }
        };

        let start = Instant::now();
        self.waiting.insert(
            owner,
            WaitRecord {
                txn: owner,
                key: request.key.clone(),
                mode: request.mode,
                since: start,
            },
        );
        trace!(target: "strata::lock", txn_id = %owner, key = %request.key, "Waiting for lock");

        let result = loop {
            if self.is_cancelled(owner) || start.elapsed() >= wait {
                break Err(StrataError::lock_conflict(
                    request.key.clone(),
                    request.mode,
                    blocker,
                ));
            }
            std::thread::sleep(self.poll_interval);
            match self.try_acquire(owner, request) {
                Ok(lock) => {
                    break Ok(LockGrant {
                        lock,
                        waited: start.elapsed(),
                    })
                }
                Err(b) => blocker = b,
            }
        };

        self.waiting.remove(&owner);
        result
    }

    /// Single non-blocking attempt. On failure returns the blocking holder.
    fn try_acquire(&self, owner: TxnId, request: &LockRequest) -> Result<HeldLock, Option<TxnId>> {
        let now = Instant::now();
        let expires_at = request.ttl.map(|ttl| now + ttl);

        let (granted, newly_owned) = {
            let mut holders = self.locks.entry(request.key.clone()).or_default();
            holders.retain(|lock| !lock.is_expired(now));

            if let Some(pos) = holders.iter().position(|lock| lock.owner == owner) {
                let sole_holder = holders.len() == 1;
                let existing = &mut holders[pos];
                if existing.mode == LockMode::Write || request.mode == LockMode::Read {
                    (existing.clone(), false)
                } else if sole_holder {
                    existing.mode = LockMode::Write;
                    existing.expires_at = expires_at.or(existing.expires_at);
                    (existing.clone(), false)
                } else {
                    let other = holders.iter().find(|lock| lock.owner != owner);
                    return Err(other.map(|lock| lock.owner));
                }
            } else if let Some(conflicting) = holders
                .iter()
                .find(|lock| !request.mode.is_compatible_with(lock.mode))
            {
                return Err(Some(conflicting.owner));
            } else {
                let lock = HeldLock {
                    owner,
                    key: request.key.clone(),
                    mode: request.mode,
                    expected_version: request.expected_version,
                    locked_at: Utc::now(),
                    acquired: now,
                    expires_at,
                };
                holders.push(lock.clone());
                (lock, true)
            }
        };

        if newly_owned {
            self.owned.entry(owner).or_default().push(request.key.clone());
            debug!(
                target: "strata::lock",
                txn_id = %owner,
                key = %request.key,
                mode = %request.mode,
                "Lock acquired"
            );
        }
        Ok(granted)
    }

    /// Release `owner`'s lock on `key`
    ///
    /// Returns the released lock, or `None` if `owner` held no lock there
    /// (including when another transaction holds it).
    pub fn release(&self, owner: TxnId, key: &EntityKey) -> Option<HeldLock> {
        let released = self.remove_lock(owner, key);
        if let Some(mut keys) = self.owned.get_mut(&owner) {
            keys.retain(|k| k != key);
        }
        released
    }

    /// Release every lock `owner` holds. Returns the released (non-expired) locks.
    pub fn release_all(&self, owner: TxnId) -> Vec<HeldLock> {
        let keys = self
            .owned
            .remove(&owner)
            .map(|(_, keys)| keys)
            .unwrap_or_default();
        let released: Vec<HeldLock> = keys
            .iter()
            .filter_map(|key| self.remove_lock(owner, key))
            .collect();
        if !released.is_empty() {
            debug!(target: "strata::lock", txn_id = %owner, count = released.len(), "Locks released");
        }
        released
    }

    fn remove_lock(&self, owner: TxnId, key: &EntityKey) -> Option<HeldLock> {
        let now = Instant::now();
        let mut removed = None;
        let empty = match self.locks.get_mut(key) {
            Some(mut holders) => {
                if let Some(pos) = holders.iter().position(|lock| lock.owner == owner) {
                    let lock = holders.remove(pos);
                    if !lock.is_expired(now) {
                        removed = Some(lock);
                    }
                }
                holders.is_empty()
            }
            None => false,
        };
        if empty {
            self.locks.remove_if(key, |_, holders| holders.is_empty());
        }
        removed
    }

    /// Drop every expired lock. Returns what was dropped.
    pub fn sweep_expired(&self) -> Vec<HeldLock> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for mut entry in self.locks.iter_mut() {
            let holders = entry.value_mut();
            let (gone, kept): (Vec<HeldLock>, Vec<HeldLock>) =
                holders.drain(..).partition(|lock| lock.is_expired(now));
            *holders = kept;
            expired.extend(gone);
        }
        self.locks.retain(|_, holders| !holders.is_empty());
        for lock in &expired {
            if let Some(mut keys) = self.owned.get_mut(&lock.owner) {
                keys.retain(|k| k != &lock.key);
            }
        }
        if !expired.is_empty() {
            debug!(target: "strata::lock", count = expired.len(), "Expired locks swept");
        }
        expired
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Live locks on `key`
    pub fn holders(&self, key: &EntityKey) -> Vec<HeldLock> {
        let now = Instant::now();
        self.locks
            .get(key)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|lock| !lock.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live locks held by `owner`
    pub fn locks_held_by(&self, owner: TxnId) -> Vec<HeldLock> {
        let keys = self
            .owned
            .get(&owner)
            .map(|keys| keys.clone())
            .unwrap_or_default();
        keys.iter()
            .flat_map(|key| self.holders(key))
            .filter(|lock| lock.owner == owner)
            .collect()
    }

    /// Total live locks
    pub fn lock_count(&self) -> usize {
        let now = Instant::now();
        self.locks
            .iter()
            .map(|holders| holders.iter().filter(|l| !l.is_expired(now)).count())
            .sum()
    }

    /// Transactions currently waiting
    pub fn waiters(&self) -> Vec<WaitRecord> {
        self.waiting.iter().map(|w| w.value().clone()).collect()
    }

    /// Current wait-for edges: one per (waiter, incompatible holder) pair
    pub fn wait_for_edges(&self) -> Vec<WaitEdge> {
        let waiters = self.waiters();
        let mut edges = Vec::new();
        for waiter in waiters {
            for lock in self.holders(&waiter.key) {
                if lock.owner != waiter.txn && !waiter.mode.is_compatible_with(lock.mode) {
                    edges.push(WaitEdge {
                        waiter: waiter.txn,
                        holder: lock.owner,
                        key: waiter.key.clone(),
                        mode: waiter.mode,
                    });
                }
            }
        }
        edges
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("locks", &self.lock_count())
            .field("waiting", &self.waiting.len())
            .field("active", &self.active.len())
            .finish()
    }
}
