//! Context store
//!
//! In-memory registry of live transactions. Each context sits behind its own
//! `parking_lot::Mutex` inside a `DashMap` entry, so two transactions never
//! contend on a shared lock. The status and cancellation token of every
//! context are also kept outside the mutex: status queries and rollback
//! requests from other threads never block on a context that is executing.
//!
//! Terminal contexts leave the map (immediately on rollback, after a grace
//! period on commit) and a snapshot of their final state is archived in a
//! bounded FIFO.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strata_concurrency::CancelToken;
use strata_core::{StrataError, StrataResult, TxnId};

use crate::context::{StatusCell, TransactionContext, TransactionMode, TransactionSnapshot};

/// Snapshots of finished transactions kept for queries
pub const ARCHIVE_LIMIT: usize = 1024;

/// One registered context
#[derive(Debug)]
pub struct ContextEntry {
    /// Transaction id
    pub id: TxnId,
    /// Mode
    pub mode: TransactionMode,
    /// Monotonic deadline
    pub deadline: Instant,
    /// Lock-free status mirror
    pub status: Arc<StatusCell>,
    /// Cancellation token shared with the lock registry
    pub cancel: Arc<CancelToken>,
    /// The context itself
    pub context: Mutex<TransactionContext>,
    holds_slot: AtomicBool,
}

impl ContextEntry {
    /// Whether the deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Registry of live transaction contexts
#[derive(Debug)]
pub struct ContextStore {
    contexts: DashMap<TxnId, Arc<ContextEntry>>,
    live: AtomicUsize,
    limit: usize,
    archive: DashMap<TxnId, TransactionSnapshot>,
    archive_order: Mutex<VecDeque<TxnId>>,
}

impl ContextStore {
    /// Create a store admitting at most `limit` live transactions
    pub fn new(limit: usize) -> Self {
        Self {
            contexts: DashMap::new(),
            live: AtomicUsize::new(0),
            limit,
            archive: DashMap::new(),
            archive_order: Mutex::new(VecDeque::new()),
        }
    }

    /// Claim a live-transaction slot
    ///
    /// # Errors
    /// `QuotaExceeded` when the ceiling is reached.
    pub fn reserve(&self) -> StrataResult<()> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|active| StrataError::QuotaExceeded {
                active,
                limit: self.limit,
            })
    }

    /// Register a context for which a slot was reserved
    pub fn insert(&self, context: TransactionContext) -> Arc<ContextEntry> {
        let entry = Arc::new(ContextEntry {
            id: context.id(),
            mode: context.mode(),
            deadline: context.deadline(),
            status: context.status_cell(),
            cancel: Arc::clone(context.cancel_token()),
            context: Mutex::new(context),
            holds_slot: AtomicBool::new(true),
        });
        self.contexts.insert(entry.id, Arc::clone(&entry));
        entry
    }

    /// Give back the slot of a context that reached a terminal status
    ///
    /// Returns false if the slot was already released.
    pub fn release_slot(&self, entry: &ContextEntry) -> bool {
        if entry.holds_slot.swap(false, Ordering::AcqRel) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Live (non-terminal) transactions
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Registered contexts, terminal ones awaiting eviction included
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Look up a context
    pub fn get(&self, id: TxnId) -> Option<Arc<ContextEntry>> {
        self.contexts.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Drop a context from the map
    pub fn remove(&self, id: TxnId) -> Option<Arc<ContextEntry>> {
        self.contexts.remove(&id).map(|(_, entry)| entry)
    }

    /// All registered contexts
    pub fn entries(&self) -> Vec<Arc<ContextEntry>> {
        self.contexts.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Keep the final state of a finished transaction
    pub fn archive(&self, snapshot: TransactionSnapshot) {
        let id = snapshot.id;
        let mut order = self.archive_order.lock();
        if self.archive.insert(id, snapshot).is_none() {
            order.push_back(id);
        }
        while order.len() > ARCHIVE_LIMIT {
            if let Some(oldest) = order.pop_front() {
                self.archive.remove(&oldest);
            }
        }
    }

    /// Final state of a finished transaction
    pub fn archived(&self, id: TxnId) -> Option<TransactionSnapshot> {
        self.archive.get(&id).map(|s| s.value().clone())
    }
}
