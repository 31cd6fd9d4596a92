//! Transaction context and state machine
//!
//! A [`TransactionContext`] is the coordinator's record of one live
//! transaction: its mode, deadline, operation log, compensation stack and
//! held locks.
//!
//! ## State machine
//!
//! ```text
//! Pending ──> Running ──> Committing ──> Committed
//!    │           │
//!    ├───────────┼──> Aborting ─────> Aborted
//!    ├───────────┼──> Compensating ─> Compensated
//!    │           │         └────────> Aborted (a compensation failed)
//!    └───────────┴──> Failed
//! ```
//!
//! Transitions are monotonic: a terminal status is never left, and
//! `end_time` is set exactly once, when the first terminal status is
//! reached.
//!
//! The current status is mirrored in a lock-free [`StatusCell`] so status
//! queries never wait on a context that is busy executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_concurrency::{CancelToken, HeldLock};
use strata_core::{EntityKey, LockMode, StrataError, StrataResult, TxnId};

use crate::config::TransactionOptions;
use crate::operation::Compensation;
use crate::saga::{CompensationFailure, CompensationReport, PendingCompensation};

// ============================================================================
// Enums
// ============================================================================

/// Execution algorithm of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Sequential execution, compensation by priority
    #[default]
    SingleDomain,
    /// Saga: compensation in strict LIFO order
    CrossDomain,
    /// Two-phase simulation (no real prepare phase)
    Distributed,
    /// Like single-domain, but ends `Compensated` after a rollback
    Compensating,
}

impl TransactionMode {
    /// Stable lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            TransactionMode::SingleDomain => "single_domain",
            TransactionMode::CrossDomain => "cross_domain",
            TransactionMode::Distributed => "distributed",
            TransactionMode::Compensating => "compensating",
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Advisory isolation level, recorded but not enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted
    ReadUncommitted,
    /// Read committed
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Begun, nothing executed yet
    Pending,
    /// At least one batch executed
    Running,
    /// Commit in progress
    Committing,
    /// Committed (terminal)
    Committed,
    /// Rollback in progress
    Aborting,
    /// Rolled back (terminal)
    Aborted,
    /// Compensating-mode rollback in progress
    Compensating,
    /// Compensating-mode rollback finished (terminal)
    Compensated,
    /// Could not reach a clean terminal state (terminal)
    Failed,
}

impl TransactionStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::Aborted
                | TransactionStatus::Compensated
                | TransactionStatus::Failed
        )
    }

    /// Whether `execute` is accepted in this status
    pub fn can_execute(&self) -> bool {
        matches!(self, TransactionStatus::Pending | TransactionStatus::Running)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Aborting)
                | (Pending, Compensating)
                | (Pending, Failed)
                | (Running, Committing)
                | (Running, Aborting)
                | (Running, Compensating)
                | (Running, Failed)
                | (Committing, Committed)
                | (Committing, Failed)
                | (Aborting, Aborted)
                | (Aborting, Failed)
                | (Compensating, Compensated)
                | (Compensating, Aborted)
                | (Compensating, Failed)
        )
    }

    /// Stable lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Running => "running",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Aborting => "aborting",
            TransactionStatus::Aborted => "aborted",
            TransactionStatus::Compensating => "compensating",
            TransactionStatus::Compensated => "compensated",
            TransactionStatus::Failed => "failed",
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionStatus::Pending,
            1 => TransactionStatus::Running,
            2 => TransactionStatus::Committing,
            3 => TransactionStatus::Committed,
            4 => TransactionStatus::Aborting,
            5 => TransactionStatus::Aborted,
            6 => TransactionStatus::Compensating,
            7 => TransactionStatus::Compensated,
            _ => TransactionStatus::Failed,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-free mirror of a context's status
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: TransactionStatus) -> Self {
        Self(AtomicU8::new(status.to_u8()))
    }

    /// Current status
    pub fn load(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, status: TransactionStatus) {
        self.0.store(status.to_u8(), Ordering::Release);
    }
}

/// Kind of data operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Insert
    Create,
    /// Update (also the default for opaque work)
    Update,
    /// Delete
    Delete,
    /// Read
    Read,
}

/// Status of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Not run yet
    Pending,
    /// Ran successfully
    Executed,
    /// Ran and failed
    Failed,
    /// Its compensation ran successfully
    Compensated,
}

/// Status of one compensation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    /// Registered, not run
    Pending,
    /// Ran successfully
    Executed,
    /// Ran and failed
    Failed,
}

// ============================================================================
// Records
// ============================================================================

/// Operation log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOperation {
    /// Position in the transaction's operation log
    pub id: u64,
    /// Batch (`execute` call) number, starting at 0
    pub batch: u32,
    /// Operation type
    pub op_type: OperationType,
    /// Target table
    pub table: String,
    /// Target entity
    pub entity_id: Option<String>,
    /// Payload
    pub data: Option<Value>,
    /// Description
    pub description: Option<String>,
    /// Status
    pub status: OperationStatus,
    /// Result value once executed
    pub result: Option<Value>,
    /// Error text once failed
    pub error: Option<String>,
    /// Attempts made (retryable operations may take several)
    pub attempts: u32,
}

/// Observable record of a registered compensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationRecord {
    /// Compensation id
    pub id: u64,
    /// Operation it undoes
    pub operation_id: u64,
    /// Description
    pub description: String,
    /// Priority within its batch (higher runs later during rollback)
    pub priority: usize,
    /// Status
    pub status: CompensationStatus,
}

/// A held (or, with locking disabled, declared) advisory lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSummary {
    /// Entity
    pub key: EntityKey,
    /// Mode
    pub mode: LockMode,
    /// Expected version recorded with the lock
    pub expected_version: Option<u64>,
    /// Whether the lock was actually acquired
    pub acquired: bool,
}

/// Point-in-time copy of a context's observable state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSnapshot {
    /// Transaction id
    pub id: TxnId,
    /// Mode
    pub mode: TransactionMode,
    /// Isolation level
    pub isolation_level: IsolationLevel,
    /// Label
    pub label: Option<String>,
    /// Status
    pub status: TransactionStatus,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// End time (terminal only)
    pub end_time: Option<DateTime<Utc>>,
    /// Timeout
    pub timeout: Duration,
    /// Operation log
    pub operations: Vec<TransactionOperation>,
    /// Compensations
    pub compensations: Vec<CompensationRecord>,
    /// Locks
    pub locks: Vec<LockSummary>,
    /// Rollback reason, if rolled back
    pub rollback_reason: Option<String>,
    /// Failed compensations of the rollback
    pub compensation_failures: Vec<CompensationFailure>,
}

// ============================================================================
// Context
// ============================================================================

/// Record of one transaction
#[derive(Debug)]
pub struct TransactionContext {
    id: TxnId,
    mode: TransactionMode,
    isolation_level: IsolationLevel,
    label: Option<String>,
    status: Arc<StatusCell>,
    start_time: DateTime<Utc>,
    started: Instant,
    end_time: Option<DateTime<Utc>>,
    timeout: Duration,
    operations: Vec<TransactionOperation>,
    compensations: Vec<CompensationRecord>,
    pending: Vec<PendingCompensation>,
    locks: Vec<LockSummary>,
    batches: u32,
    rollback_reason: Option<String>,
    report: Option<CompensationReport>,
    cancel: Arc<CancelToken>,
}

impl TransactionContext {
    /// Create a `Pending` context
    pub fn new(
        id: TxnId,
        options: &TransactionOptions,
        timeout: Duration,
        started: Instant,
        cancel: Arc<CancelToken>,
    ) -> Self {
        Self {
            id,
            mode: options.mode,
            isolation_level: options.isolation_level,
            label: options.label.clone(),
            status: Arc::new(StatusCell::new(TransactionStatus::Pending)),
            start_time: Utc::now(),
            started,
            end_time: None,
            timeout,
            operations: Vec::new(),
            compensations: Vec::new(),
            pending: Vec::new(),
            locks: Vec::new(),
            batches: 0,
            rollback_reason: None,
            report: None,
            cancel,
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Mode
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.status.load()
    }

    /// Shared status mirror
    pub fn status_cell(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    /// Cancellation token
    pub fn cancel_token(&self) -> &Arc<CancelToken> {
        &self.cancel
    }

    /// Monotonic start time
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Monotonic deadline
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    /// Time since begin
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Operation log
    pub fn operations(&self) -> &[TransactionOperation] {
        &self.operations
    }

    /// Compensation records
    pub fn compensations(&self) -> &[CompensationRecord] {
        &self.compensations
    }

    /// Rollback reason, once rolled back
    pub fn rollback_reason(&self) -> Option<&str> {
        self.rollback_reason.as_deref()
    }

    /// Compensation report of the rollback, once rolled back
    pub fn compensation_report(&self) -> Option<&CompensationReport> {
        self.report.as_ref()
    }

    /// Move to `next`
    ///
    /// # Errors
    /// `ValidationError` if the transition is not allowed.
    pub fn transition(&mut self, next: TransactionStatus) -> StrataResult<()> {
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(StrataError::validation(format!(
                "transaction {} cannot move from {} to {}",
                self.id, current, next
            )));
        }
        if next.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        self.status.store(next);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Operation log
    // ------------------------------------------------------------------------

    pub(crate) fn begin_batch(&mut self) -> u32 {
        let batch = self.batches;
        self.batches += 1;
        batch
    }

    pub(crate) fn record_operation(
        &mut self,
        batch: u32,
        op_type: OperationType,
        table: String,
        entity_id: Option<String>,
        data: Option<Value>,
        description: Option<String>,
    ) -> u64 {
        let id = self.operations.len() as u64;
        self.operations.push(TransactionOperation {
            id,
            batch,
            op_type,
            table,
            entity_id,
            data,
            description,
            status: OperationStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
        });
        id
    }

    pub(crate) fn mark_executed(&mut self, operation_id: u64, result: Value, attempts: u32) {
        if let Some(op) = self.operations.get_mut(operation_id as usize) {
            op.status = OperationStatus::Executed;
            op.result = Some(result);
            op.attempts = attempts;
        }
    }

    pub(crate) fn mark_failed(&mut self, operation_id: u64, error: &StrataError, attempts: u32) {
        if let Some(op) = self.operations.get_mut(operation_id as usize) {
            op.status = OperationStatus::Failed;
            op.error = Some(error.to_string());
            op.attempts = attempts;
        }
    }

    /// Operations that failed
    pub fn failed_operation_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .count()
    }

    // ------------------------------------------------------------------------
    // Compensations
    // ------------------------------------------------------------------------

    pub(crate) fn push_compensation(
        &mut self,
        operation_id: u64,
        batch: u32,
        priority: usize,
        description: String,
        compensation: Compensation,
    ) {
        let id = self.compensations.len() as u64;
        self.compensations.push(CompensationRecord {
            id,
            operation_id,
            description: description.clone(),
            priority,
            status: CompensationStatus::Pending,
        });
        self.pending.push(PendingCompensation {
            id,
            operation_id,
            batch,
            priority,
            description,
            compensation,
        });
    }

    /// Hand every not-yet-run compensation to the caller (each runs at most once)
    pub(crate) fn take_pending(&mut self) -> Vec<PendingCompensation> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn record_compensation(&mut self, id: u64, operation_id: u64, succeeded: bool) {
        if let Some(record) = self.compensations.get_mut(id as usize) {
            record.status = if succeeded {
                CompensationStatus::Executed
            } else {
                CompensationStatus::Failed
            };
        }
        if succeeded {
            if let Some(op) = self.operations.get_mut(operation_id as usize) {
                op.status = OperationStatus::Compensated;
            }
        }
    }

    pub(crate) fn set_rollback(&mut self, reason: String, report: CompensationReport) {
        self.rollback_reason = Some(reason);
        self.report = Some(report);
    }

    // ------------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------------

    pub(crate) fn record_lock(&mut self, lock: &HeldLock) {
        let exists = self
            .locks
            .iter_mut()
            .find(|l| l.key == lock.key && l.acquired);
        match exists {
            Some(summary) => summary.mode = lock.mode,
            None => self.locks.push(LockSummary {
                key: lock.key.clone(),
                mode: lock.mode,
                expected_version: lock.expected_version,
                acquired: true,
            }),
        }
    }

    pub(crate) fn record_declared_lock(
        &mut self,
        key: EntityKey,
        mode: LockMode,
        expected_version: Option<u64>,
    ) {
        self.locks.push(LockSummary {
            key,
            mode,
            expected_version,
            acquired: false,
        });
    }

    pub(crate) fn clear_locks(&mut self) {
        self.locks.retain(|l| !l.acquired);
    }

    /// Locks recorded on the context
    pub fn locks(&self) -> &[LockSummary] {
        &self.locks
    }

    /// Copy the observable state
    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            id: self.id,
            mode: self.mode,
            isolation_level: self.isolation_level,
            label: self.label.clone(),
            status: self.status(),
            start_time: self.start_time,
            end_time: self.end_time,
            timeout: self.timeout,
            operations: self.operations.clone(),
            compensations: self.compensations.clone(),
            locks: self.locks.clone(),
            rollback_reason: self.rollback_reason.clone(),
            compensation_failures: self
                .report
                .as_ref()
                .map(|r| r.failures.clone())
                .unwrap_or_default(),
        }
    }
}
