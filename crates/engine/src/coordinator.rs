//! Transaction coordinator
//!
//! Owns the context store, the lock registry and the optimistic locking
//! manager, and drives every transaction through
//! `begin → execute* → commit | rollback`.
//!
//! ## Cancellation
//!
//! A rollback can be requested from another thread (timeout watchdog,
//! deadlock resolution, an explicit `rollback` call) while the owner is
//! inside `execute`. The requester sets the transaction's cancel token; the
//! executing thread notices it before its next operation, while waiting for
//! a lock or between retries, and runs the normal compensation path with
//! the token's reason. When the transaction is idle the requester rolls it
//! back itself.
//!
//! ## Observers
//!
//! Events are emitted while the context is locked. Observers may query
//! `status` (lock-free) but must not call lifecycle methods for the
//! transaction they are being told about.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_concurrency::{
    ConflictRecord, DeadlockDetector, DeadlockInfo, HeldLock, LockRegistry,
    OptimisticLockManager,
};
use strata_core::{EntityKey, StrataError, StrataResult, TxnId};
use strata_storage::RowStore;
use tracing::{debug, info, warn};

use crate::background::BackgroundWorkers;
use crate::config::{CoordinatorConfig, TransactionOptions};
use crate::context::{
    TransactionContext, TransactionMode, TransactionSnapshot, TransactionStatus,
};
use crate::error::ExecuteError;
use crate::events::{EventBus, TransactionEvent};
use crate::executor::{cancellation_error, run_batch, unwind_order, BatchEnv, BatchFailure};
use crate::metrics::{CoordinatorStats, MetricsCollector, TransactionMetrics};
use crate::operation::Operation;
use crate::ops::RowOps;
use crate::registry::{ContextEntry, ContextStore};
use crate::saga::{unwind, CompensationOutcome, CompensationReport, SagaExecutor};

/// Coordinates transactions over a row store
pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn RowStore>,
    contexts: ContextStore,
    locks: Arc<LockRegistry>,
    optimistic: Arc<OptimisticLockManager>,
    detector: DeadlockDetector,
    events: EventBus,
    metrics: MetricsCollector,
    /// Committed transactions awaiting eviction (due time, id)
    evictions: Mutex<Vec<(Instant, TxnId)>>,
    background: Mutex<Option<BackgroundWorkers>>,
}

impl TransactionCoordinator {
    /// Create a coordinator without background workers
    ///
    /// Timeouts and deadlocks are then only handled when
    /// [`sweep_timeouts`](Self::sweep_timeouts) and
    /// [`detect_deadlocks`](Self::detect_deadlocks) are called, or when the
    /// owner next touches an expired transaction.
    ///
    /// # Errors
    /// `ValidationError` if `config` is invalid.
    pub fn new(store: Arc<dyn RowStore>, config: CoordinatorConfig) -> StrataResult<Self> {
        config.validate()?;
        let locks = Arc::new(LockRegistry::new());
        let optimistic = Arc::new(
            OptimisticLockManager::new(Arc::clone(&store), Arc::clone(&locks))
                .with_retry_policy(config.retry.policy()),
        );
        Ok(Self {
            contexts: ContextStore::new(config.max_concurrent_transactions),
            detector: DeadlockDetector::new(Arc::clone(&locks)),
            locks,
            optimistic,
            store,
            events: EventBus::new(),
            metrics: MetricsCollector::new(),
            evictions: Mutex::new(Vec::new()),
            background: Mutex::new(None),
            config,
        })
    }

    /// Create a coordinator and start its timeout watchdog and (if enabled)
    /// deadlock detector
    ///
    /// # Errors
    /// `ValidationError` if `config` is invalid.
    pub fn start(store: Arc<dyn RowStore>, config: CoordinatorConfig) -> StrataResult<Arc<Self>> {
        let coordinator = Arc::new(Self::new(store, config)?);
        coordinator.start_background();
        Ok(coordinator)
    }

    /// Start the background workers. No-op if already running.
    pub fn start_background(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }
        let workers = BackgroundWorkers::new();
        workers.spawn_periodic(
            "strata-txn-watchdog",
            self.config.timeout_sweep_interval(),
            Arc::downgrade(self),
            Self::watchdog_tick,
        );
        if self.config.enable_deadlock_detection {
            workers.spawn_periodic(
                "strata-deadlock",
                self.config.deadlock_check_interval(),
                Arc::downgrade(self),
                Self::deadlock_tick,
            );
        }
        debug!(target: "strata::txn", workers = workers.worker_count(), "Background workers started");
        *background = Some(workers);
    }

    /// Stop the background workers
    pub fn shutdown(&self) {
        if let Some(workers) = self.background.lock().take() {
            workers.shutdown();
        }
    }

    fn watchdog_tick(&self) {
        self.sweep_timeouts();
        self.sweep_expired_locks();
        self.process_evictions();
    }

    fn deadlock_tick(&self) {
        self.detect_deadlocks();
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration in effect
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Event bus (subscribe observers here)
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The row store
    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// The lock registry
    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// The optimistic locking manager
    pub fn optimistic(&self) -> &Arc<OptimisticLockManager> {
        &self.optimistic
    }

    /// Builders for store-backed operations with automatic undo
    pub fn row_ops(&self) -> RowOps {
        RowOps::new(Arc::clone(&self.store), Arc::clone(&self.optimistic))
    }

    /// A standalone saga executor over the same store
    pub fn saga_executor(&self) -> SagaExecutor {
        SagaExecutor::new(Arc::clone(&self.store))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin a transaction
    ///
    /// # Errors
    /// - `QuotaExceeded` if `max_concurrent_transactions` are live
    /// - `ValidationError` for a zero timeout
    pub fn begin(&self, options: TransactionOptions) -> StrataResult<TxnId> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.timeout_for(options.mode));
        if timeout.is_zero() {
            return Err(StrataError::validation("transaction timeout must be positive"));
        }

        self.process_evictions();
        self.contexts.reserve()?;

        let id = TxnId::new();
        let started = Instant::now();
        let cancel = self.locks.register_transaction(id, started);
        let context = TransactionContext::new(id, &options, timeout, started, cancel);
        self.contexts.insert(context);
        self.metrics.record_start(id, options.mode);

        debug!(
            target: "strata::txn",
            txn_id = %id,
            mode = options.mode.name(),
            timeout_ms = timeout.as_millis() as u64,
            "Transaction started"
        );
        self.events.emit(TransactionEvent::Started {
            txn_id: id,
            mode: options.mode,
        });
        Ok(id)
    }

    /// Run a batch of operations
    ///
    /// Operations run in order on the calling thread. On success the
    /// transaction stays `Running` so more batches can follow. On the first
    /// failure every compensation registered so far (this batch and earlier
    /// ones) runs and the transaction is rolled back.
    ///
    /// # Errors
    /// - `NotFound` if the transaction is unknown or already terminal
    /// - `ValidationError` if it is mid-commit or mid-rollback
    /// - the first operation failure, with the compensation report attached
    pub fn execute(&self, id: TxnId, ops: Vec<Operation>) -> Result<Vec<Value>, ExecuteError> {
        let entry = self.live_entry(id)?;
        let mut ctx = entry.context.lock();
        let status = ctx.status();
        if status.is_terminal() {
            return Err(StrataError::txn_not_found(id).into());
        }
        if !status.can_execute() {
            return Err(StrataError::validation(format!(
                "transaction {} is {}, cannot execute",
                id, status
            ))
            .into());
        }

        if let Some(reason) = self.pending_cancellation(&ctx) {
            let error = cancellation_error(&ctx, &reason);
            let compensation = self.abort_locked(&entry, &mut ctx, reason);
            return Err(ExecuteError {
                error,
                failed_index: None,
                compensation,
            });
        }
        if status == TransactionStatus::Pending {
            ctx.transition(TransactionStatus::Running)?;
        }

        let env = BatchEnv {
            store: self.store.as_ref(),
            optimistic: &self.optimistic,
            events: &self.events,
            metrics: &self.metrics,
            config: &self.config,
        };
        match run_batch(&mut ctx, ops, &env) {
            Ok(values) => Ok(values),
            Err(BatchFailure { error, index }) => {
                let reason = ctx
                    .cancel_token()
                    .reason()
                    .unwrap_or_else(|| format!("operation failed: {}", error));
                let compensation = self.abort_locked(&entry, &mut ctx, reason);
                Err(ExecuteError {
                    error,
                    failed_index: Some(index),
                    compensation,
                })
            }
        }
    }

    /// Commit a running transaction
    ///
    /// Releases every lock, moves to `Committed` and keeps the context
    /// queryable for the eviction grace period.
    ///
    /// # Errors
    /// - `NotFound` if unknown or already terminal
    /// - `ValidationError` unless `Running` (a transaction that never
    ///   executed cannot commit)
    /// - `Timeout` if the deadline passed (the transaction is rolled back)
    pub fn commit(&self, id: TxnId) -> StrataResult<TransactionMetrics> {
        let entry = self.live_entry(id)?;
        let mut ctx = entry.context.lock();
        let status = ctx.status();
        if status.is_terminal() {
            return Err(StrataError::txn_not_found(id));
        }
        if status != TransactionStatus::Running {
            return Err(StrataError::validation(format!(
                "transaction {} is {}, commit requires running",
                id, status
            )));
        }
        if let Some(reason) = self.pending_cancellation(&ctx) {
            let error = cancellation_error(&ctx, &reason);
            self.abort_locked(&entry, &mut ctx, reason);
            return Err(error);
        }

        ctx.transition(TransactionStatus::Committing)?;
        self.release_locks(&mut ctx);
        ctx.transition(TransactionStatus::Committed)?;
        self.contexts.release_slot(&entry);
        self.locks.unregister_transaction(id);

        let metrics = self.finish_metrics(&ctx, 0);
        info!(
            target: "strata::txn",
            txn_id = %id,
            mode = ctx.mode().name(),
            operations = metrics.operation_count,
            duration_ms = metrics.duration.as_millis() as u64,
            "Transaction committed"
        );
        self.events.emit(TransactionEvent::Committed {
            txn_id: id,
            duration: metrics.duration,
            operation_count: metrics.operation_count,
        });

        self.contexts.archive(ctx.snapshot());
        self.evictions
            .lock()
            .push((Instant::now() + self.config.eviction_grace(), id));
        Ok(metrics)
    }

    /// Roll back a live transaction
    ///
    /// Runs every pending compensation, releases locks and evicts the
    /// context. If the transaction is executing on another thread, this
    /// waits until that thread has rolled it back with `reason`.
    ///
    /// # Errors
    /// `NotFound` if the transaction is unknown, committed, or was already
    /// rolled back by an earlier request.
    pub fn rollback(&self, id: TxnId, reason: &str) -> StrataResult<CompensationReport> {
        let entry = self.live_entry(id)?;
        let won = entry.cancel.cancel(reason);
        let mut ctx = entry.context.lock();
        if ctx.status().is_terminal() {
            // Our request may have been carried out by the executing thread
            return match ctx.compensation_report() {
                Some(report) if won => Ok(report.clone()),
                _ => Err(StrataError::txn_not_found(id)),
            };
        }
        let reason = entry.cancel.reason().unwrap_or_else(|| reason.to_string());
        Ok(self.abort_locked(&entry, &mut ctx, reason))
    }

    /// Ask for a rollback without blocking
    ///
    /// Sets the cancel token. If the context is idle the rollback happens
    /// now; otherwise the thread executing it will roll back. Returns false
    /// if the transaction is not live.
    pub fn request_rollback(&self, id: TxnId, reason: &str) -> bool {
        let Some(entry) = self.contexts.get(id) else {
            return false;
        };
        if entry.status.load().is_terminal() {
            return false;
        }
        entry.cancel.cancel(reason);
        if let Some(mut ctx) = entry.context.try_lock() {
            if !ctx.status().is_terminal() {
                let reason = entry.cancel.reason().unwrap_or_else(|| reason.to_string());
                self.abort_locked(&entry, &mut ctx, reason);
            }
        }
        true
    }

    fn live_entry(&self, id: TxnId) -> StrataResult<Arc<ContextEntry>> {
        self.contexts
            .get(id)
            .ok_or_else(|| StrataError::txn_not_found(id))
    }

    /// Reason the transaction must stop, if any (cancel token or deadline)
    fn pending_cancellation(&self, ctx: &TransactionContext) -> Option<String> {
        let token = ctx.cancel_token();
        if !token.is_cancelled() && ctx.is_expired(Instant::now()) {
            token.cancel("timeout");
        }
        if token.is_cancelled() {
            Some(token.reason().unwrap_or_else(|| "cancelled".to_string()))
        } else {
            None
        }
    }

    /// Unwind, release and finish a locked, non-terminal context
    fn abort_locked(
        &self,
        entry: &ContextEntry,
        ctx: &mut TransactionContext,
        reason: String,
    ) -> CompensationReport {
        let id = ctx.id();
        let mode = ctx.mode();
        let compensating = mode == TransactionMode::Compensating;
        let unwinding = if compensating {
            TransactionStatus::Compensating
        } else {
            TransactionStatus::Aborting
        };
        if let Err(e) = ctx.transition(unwinding) {
            warn!(target: "strata::txn", txn_id = %id, error = %e, "Unexpected status during rollback");
        }

        let pending = ctx.take_pending();
        let order = unwind_order(mode);
        let events = &self.events;
        let report = unwind(pending, order, self.store.as_ref(), &mut |outcome: &CompensationOutcome<'_>| {
            ctx.record_compensation(outcome.id, outcome.operation_id, outcome.error.is_none());
            events.emit(match outcome.error {
                None => TransactionEvent::CompensationExecuted {
                    txn_id: id,
                    compensation_id: outcome.id,
                    operation_id: outcome.operation_id,
                    description: outcome.description.to_string(),
                },
                Some(e) => TransactionEvent::CompensationFailed {
                    txn_id: id,
                    compensation_id: outcome.id,
                    operation_id: outcome.operation_id,
                    description: outcome.description.to_string(),
                    error: e.to_string(),
                },
            });
        });

        self.release_locks(ctx);
        // A partial unwind is not a compensation; the failures stay on the snapshot
        let terminal = if compensating && report.is_complete() {
            TransactionStatus::Compensated
        } else {
            TransactionStatus::Aborted
        };
        if let Err(e) = ctx.transition(terminal) {
            warn!(target: "strata::txn", txn_id = %id, error = %e, "Unexpected status during rollback");
        }
        ctx.set_rollback(reason.clone(), report.clone());
        self.contexts.release_slot(entry);
        self.locks.unregister_transaction(id);
        if reason == "timeout" {
            self.metrics.record_timeout();
        }

        let metrics = self.finish_metrics(ctx, report.attempted());
        if report.is_partial() {
            warn!(
                target: "strata::txn",
                txn_id = %id,
                %reason,
                failed = report.failures.len(),
                "Transaction rolled back with partial compensation"
            );
        } else {
            info!(
                target: "strata::txn",
                txn_id = %id,
                %reason,
                status = %terminal,
                compensations = report.executed.len(),
                duration_ms = metrics.duration.as_millis() as u64,
                "Transaction rolled back"
            );
        }
        self.events.emit(TransactionEvent::RolledBack {
            txn_id: id,
            reason,
            status: terminal,
            compensation_failures: report.failures.len(),
        });

        self.contexts.archive(ctx.snapshot());
        self.contexts.remove(id);
        report
    }

    fn release_locks(&self, ctx: &mut TransactionContext) {
        let id = ctx.id();
        for lock in self.optimistic.release_all(id) {
            self.events.emit(TransactionEvent::LockReleased {
                txn_id: id,
                key: lock.key,
                mode: lock.mode,
            });
        }
        ctx.clear_locks();
    }

    fn finish_metrics(
        &self,
        ctx: &TransactionContext,
        compensation_count: usize,
    ) -> TransactionMetrics {
        let metrics = self.metrics.finish(
            ctx.id(),
            ctx.status(),
            ctx.elapsed(),
            ctx.operations().len(),
            ctx.failed_operation_count(),
            compensation_count,
        );
        if self.config.enable_metrics {
            self.events.emit(TransactionEvent::Metrics(metrics.clone()));
        }
        metrics
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Roll back every live transaction past its deadline (reason `"timeout"`)
    ///
    /// Also finishes transactions whose cancellation was requested while
    /// they were busy and that are now idle. Returns how many rollbacks
    /// were requested.
    pub fn sweep_timeouts(&self) -> usize {
        let now = Instant::now();
        let mut swept = 0;
        for entry in self.contexts.entries() {
            if entry.status.load().is_terminal() {
                continue;
            }
            let expired = entry.is_expired(now);
            if !expired && !entry.cancel.is_cancelled() {
                continue;
            }
            if expired && !entry.cancel.is_cancelled() {
                warn!(target: "strata::txn", txn_id = %entry.id, mode = entry.mode.name(), "Transaction timed out");
            }
            if self.request_rollback(entry.id, "timeout") {
                swept += 1;
            }
        }
        swept
    }

    /// Run the deadlock detector and roll back each new victim
    ///
    /// Cycles whose victim is already being rolled back are skipped.
    pub fn detect_deadlocks(&self) -> Vec<DeadlockInfo> {
        let mut resolved = Vec::new();
        for info in self.detector.detect() {
            if self.locks.is_cancelled(info.victim) {
                continue;
            }
            self.metrics.record_deadlock(&info.transaction_ids);
            self.events
                .emit(TransactionEvent::DeadlockDetected(info.clone()));
            warn!(
                target: "strata::deadlock",
                victim = %info.victim,
                participants = info.transaction_ids.len(),
                resolution = info.resolution.as_str(),
                "Aborting deadlock victim"
            );
            self.request_rollback(info.victim, "deadlock");
            resolved.push(info);
        }
        resolved
    }

    /// Drop expired advisory locks
    pub fn sweep_expired_locks(&self) -> usize {
        let expired = self.locks.sweep_expired();
        for lock in &expired {
            self.events.emit(TransactionEvent::LockReleased {
                txn_id: lock.owner,
                key: lock.key.clone(),
                mode: lock.mode,
            });
        }
        expired.len()
    }

    /// Evict committed contexts whose grace period is over
    pub fn process_evictions(&self) -> usize {
        let now = Instant::now();
        let due: Vec<TxnId> = {
            let mut evictions = self.evictions.lock();
            let (due, waiting): (Vec<_>, Vec<_>) =
                evictions.drain(..).partition(|(at, _)| *at <= now);
            *evictions = waiting;
            due.into_iter().map(|(_, id)| id).collect()
        };
        for id in &due {
            self.contexts.remove(*id);
        }
        due.len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current status (live or recently finished)
    ///
    /// # Errors
    /// `NotFound` if the transaction is unknown.
    pub fn status(&self, id: TxnId) -> StrataResult<TransactionStatus> {
        if let Some(entry) = self.contexts.get(id) {
            return Ok(entry.status.load());
        }
        self.contexts
            .archived(id)
            .map(|s| s.status)
            .ok_or_else(|| StrataError::txn_not_found(id))
    }

    /// Observable state of a transaction
    ///
    /// Blocks while the transaction is executing.
    ///
    /// # Errors
    /// `NotFound` if the transaction is unknown.
    pub fn snapshot(&self, id: TxnId) -> StrataResult<TransactionSnapshot> {
        if let Some(entry) = self.contexts.get(id) {
            return Ok(entry.context.lock().snapshot());
        }
        self.contexts
            .archived(id)
            .ok_or_else(|| StrataError::txn_not_found(id))
    }

    /// Live (non-terminal) transactions
    pub fn active_count(&self) -> usize {
        self.contexts.live_count()
    }

    /// Aggregate counters
    pub fn stats(&self) -> CoordinatorStats {
        self.metrics.stats(self.active_count())
    }

    /// Recent version conflicts on an entity
    pub fn conflict_history(&self, key: &EntityKey) -> Vec<ConflictRecord> {
        self.optimistic.conflict_history(key)
    }

    /// Advisory locks a transaction holds
    pub fn held_locks(&self, id: TxnId) -> Vec<HeldLock> {
        self.locks.locks_held_by(id)
    }

    /// Advisory locks held across all transactions
    pub fn lock_count(&self) -> usize {
        self.locks.lock_count()
    }

    /// Wait for all live transactions to finish
    ///
    /// Polls with short sleeps until no transaction is live.
    ///
    /// # Returns
    /// * `true` if the coordinator became idle within `timeout`
    /// * `false` if transactions were still live when it expired
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let sleep_duration = Duration::from_millis(1);

        while self.active_count() > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(sleep_duration);
        }
        true
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("active", &self.active_count())
            .field("locks", &self.lock_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
