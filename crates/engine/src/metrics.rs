//! Transaction metrics
//!
//! Per-transaction counters (retries, lock wait, deadlocks) live in a
//! `DashMap` while the transaction is in flight; aggregate counters are
//! atomics. Everything here is observational, so all atomics use
//! `Ordering::Relaxed`: nothing synchronizes on them.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_core::TxnId;

use crate::context::{TransactionMode, TransactionStatus};

/// Metrics of one finished transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionMetrics {
    /// Transaction
    pub txn_id: TxnId,
    /// Mode
    pub mode: TransactionMode,
    /// Terminal status
    pub status: TransactionStatus,
    /// Time from begin to commit/rollback
    pub duration: Duration,
    /// Operations recorded
    pub operation_count: usize,
    /// Retries across all operations
    pub retry_count: u64,
    /// Total time spent waiting for advisory locks
    pub lock_wait_time: Duration,
    /// Deadlocks the transaction took part in
    pub deadlock_count: u64,
    /// Compensations run during rollback
    pub compensation_count: usize,
    /// Operations per second
    pub throughput: f64,
    /// Failed operations / operations
    pub error_rate: f64,
}

/// Aggregate coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStats {
    /// Live transactions
    pub active: usize,
    /// Transactions begun
    pub started: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions that ended `Aborted`
    pub aborted: u64,
    /// Transactions that ended `Compensated`
    pub compensated: u64,
    /// Transactions that ended `Failed`
    pub failed: u64,
    /// Rollbacks triggered by the timeout watchdog
    pub timeouts: u64,
    /// Deadlock cycles detected
    pub deadlocks: u64,
    /// Operation retries
    pub retries: u64,
    /// Compensations run
    pub compensations: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl CoordinatorStats {
    /// Transactions that reached a terminal status
    pub fn total_completed(&self) -> u64 {
        self.committed + self.aborted + self.compensated + self.failed
    }

    /// Rollback rate (non-committed terminal / started)
    pub fn abort_rate(&self) -> f64 {
        if self.started > 0 {
            (self.aborted + self.compensated + self.failed) as f64 / self.started as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct InFlight {
    mode: TransactionMode,
    retries: u64,
    lock_wait: Duration,
    deadlocks: u64,
}

/// Collects per-transaction and aggregate metrics
#[derive(Debug, Default)]
pub struct MetricsCollector {
    in_flight: DashMap<TxnId, InFlight>,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    compensated: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    deadlocks: AtomicU64,
    retries: AtomicU64,
    compensations: AtomicU64,
}

impl MetricsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a transaction
    pub fn record_start(&self, txn_id: TxnId, mode: TransactionMode) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            txn_id,
            InFlight {
                mode,
                retries: 0,
                lock_wait: Duration::ZERO,
                deadlocks: 0,
            },
        );
    }

    /// Add operation retries
    pub fn record_retries(&self, txn_id: TxnId, retries: u32) {
        if retries == 0 {
            return;
        }
        self.retries.fetch_add(retries as u64, Ordering::Relaxed);
        if let Some(mut entry) = self.in_flight.get_mut(&txn_id) {
            entry.retries += retries as u64;
        }
    }

    /// Add time spent waiting for a lock
    pub fn record_lock_wait(&self, txn_id: TxnId, waited: Duration) {
        if let Some(mut entry) = self.in_flight.get_mut(&txn_id) {
            entry.lock_wait += waited;
        }
    }

    /// Count one detected cycle and charge it to every participant
    pub fn record_deadlock(&self, participants: &[TxnId]) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        for txn_id in participants {
            if let Some(mut entry) = self.in_flight.get_mut(txn_id) {
                entry.deadlocks += 1;
            }
        }
    }

    /// Count a watchdog rollback
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop tracking a transaction and build its metrics
    pub fn finish(
        &self,
        txn_id: TxnId,
        status: TransactionStatus,
        duration: Duration,
        operation_count: usize,
        failed_operations: usize,
        compensation_count: usize,
    ) -> TransactionMetrics {
        match status {
            TransactionStatus::Committed => &self.committed,
            TransactionStatus::Compensated => &self.compensated,
            TransactionStatus::Failed => &self.failed,
            _ => &self.aborted,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.compensations
            .fetch_add(compensation_count as u64, Ordering::Relaxed);

        let (mode, retries, lock_wait, deadlocks) = match self.in_flight.remove(&txn_id) {
            Some((_, f)) => (f.mode, f.retries, f.lock_wait, f.deadlocks),
            None => (TransactionMode::default(), 0, Duration::ZERO, 0),
        };

        let secs = duration.as_secs_f64();
        TransactionMetrics {
            txn_id,
            mode,
            status,
            duration,
            operation_count,
            retry_count: retries,
            lock_wait_time: lock_wait,
            deadlock_count: deadlocks,
            compensation_count,
            throughput: if secs > 0.0 {
                operation_count as f64 / secs
            } else {
                0.0
            },
            error_rate: if operation_count > 0 {
                failed_operations as f64 / operation_count as f64
            } else {
                0.0
            },
        }
    }

    /// Aggregate counters
    pub fn stats(&self, active: usize) -> CoordinatorStats {
        let started = self.started.load(Ordering::Relaxed);
        let committed = self.committed.load(Ordering::Relaxed);
        CoordinatorStats {
            active,
            started,
            committed,
            aborted: self.aborted.load(Ordering::Relaxed),
            compensated: self.compensated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}
