//! Operations submitted to `execute`
//!
//! An [`Operation`] is one unit of work plus what the coordinator needs to
//! run it safely:
//! - an action (run once, run under a retry policy, or run with access to
//!   the transaction scope and report its own undo command)
//! - an optional [`Compensation`] (closure or [`UndoCommand`])
//! - optional [`LockRequirement`]s acquired before the action runs
//! - descriptive metadata (type, table, entity id, data) for snapshots
//!
//! Actions are `FnOnce` (or `FnMut` when retried) and compensations are
//! `FnOnce`: ownership makes "invoked at most once" a compile-time fact.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strata_concurrency::{CancelToken, LockRequest, RetryPolicy};
use strata_core::{EntityKey, LockMode, Patch, Row, StrataResult, TxnId};
use strata_storage::RowStore;

use crate::context::OperationType;

// ============================================================================
// Scope
// ============================================================================

/// What a scoped action can see of its transaction
pub struct OperationScope {
    txn_id: TxnId,
    cancel: Arc<CancelToken>,
    retry: RetryPolicy,
}

impl OperationScope {
    pub(crate) fn new(txn_id: TxnId, cancel: Arc<CancelToken>, retry: RetryPolicy) -> Self {
        Self {
            txn_id,
            cancel,
            retry,
        }
    }

    /// Owning transaction
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Retry policy for the transaction's mode
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Whether the transaction has been asked to stop (timeout, deadlock, rollback)
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of a scoped action: its value, the undo for what it did, and
/// how many internal retries it needed
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Value returned to the caller of `execute`
    pub value: Value,
    /// Undo command registered as the operation's compensation
    pub undo: Option<UndoCommand>,
    /// Retries performed inside the action
    pub retries: u32,
}

impl Applied {
    /// A value with no undo
    pub fn value(value: Value) -> Self {
        Self {
            value,
            undo: None,
            retries: 0,
        }
    }

    /// A value with an undo command
    pub fn with_undo(value: Value, undo: UndoCommand) -> Self {
        Self {
            value,
            undo: Some(undo),
            retries: 0,
        }
    }
}

/// Boxed single-shot action
pub type ActionFn = Box<dyn FnOnce() -> StrataResult<Value> + Send>;
/// Boxed re-runnable action
pub type RetryableFn = Box<dyn FnMut() -> StrataResult<Value> + Send>;
/// Boxed scoped action
pub type ScopedFn = Box<dyn FnOnce(&OperationScope) -> StrataResult<Applied> + Send>;
/// Boxed compensation closure
pub type CompensateFn = Box<dyn FnOnce() -> StrataResult<()> + Send>;

/// How an operation's work is run
pub enum OperationAction {
    /// Run exactly once
    Once(ActionFn),
    /// Re-run on retryable errors; `None` uses the transaction mode's policy
    Retryable {
        /// The work
        action: RetryableFn,
        /// Policy override
        policy: Option<RetryPolicy>,
    },
    /// Run once with access to the transaction scope
    Scoped(ScopedFn),
}

impl fmt::Debug for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationAction::Once(_) => f.write_str("Once"),
            OperationAction::Retryable { policy, .. } => {
                f.debug_struct("Retryable").field("policy", policy).finish()
            }
            OperationAction::Scoped(_) => f.write_str("Scoped"),
        }
    }
}

// ============================================================================
// Compensation
// ============================================================================

/// Tagged undo command interpreted against the coordinator's store
#[derive(Debug, Clone, PartialEq)]
pub enum UndoCommand {
    /// Undo an insert
    DeleteRow {
        /// Table
        table: String,
        /// Row id
        id: String,
    },
    /// Undo an update by writing the previous field values back
    ///
    /// Fields the update added are set to `null` (patches cannot remove fields).
    RestoreRow {
        /// Table
        table: String,
        /// Row as it was before the update
        previous: Row,
    },
    /// Undo a delete by inserting the last stored state again
    ReinsertRow {
        /// Table
        table: String,
        /// Deleted row
        row: Row,
    },
}

impl UndoCommand {
    /// Entity the command touches
    pub fn key(&self) -> EntityKey {
        match self {
            UndoCommand::DeleteRow { table, id } => EntityKey::new(table.as_str(), id.as_str()),
            UndoCommand::RestoreRow { table, previous } => {
                EntityKey::new(table.as_str(), previous.id.as_str())
            }
            UndoCommand::ReinsertRow { table, row } => {
                EntityKey::new(table.as_str(), row.id.as_str())
            }
        }
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self {
            UndoCommand::DeleteRow { .. } => format!("delete {}", self.key()),
            UndoCommand::RestoreRow { previous, .. } => {
                format!("restore {} to version {}", self.key(), previous.version)
            }
            UndoCommand::ReinsertRow { .. } => format!("reinsert {}", self.key()),
        }
    }

    /// Apply the command to `store`
    pub fn apply(&self, store: &dyn RowStore) -> StrataResult<()> {
        match self {
            UndoCommand::DeleteRow { table, id } => {
                store.delete(table, id)?;
            }
            UndoCommand::RestoreRow { table, previous } => {
                let current = store.get(table, &previous.id)?;
                let mut patch: Patch = previous.to_patch();
                for field in current.fields.keys() {
                    if !patch.contains_key(field) {
                        patch.insert(field.clone(), Value::Null);
                    }
                }
                store.update(table, &previous.id, &patch, None)?;
            }
            UndoCommand::ReinsertRow { table, row } => {
                store.insert(table, row.clone())?;
            }
        }
        Ok(())
    }
}

/// Undo logic for one operation
pub enum Compensation {
    /// Arbitrary closure
    Action(CompensateFn),
    /// Store-level undo command
    Undo(UndoCommand),
}

impl Compensation {
    /// Wrap a closure
    pub fn action<F>(f: F) -> Self
    where
        F: FnOnce() -> StrataResult<()> + Send + 'static,
    {
        Compensation::Action(Box::new(f))
    }

    /// Run the compensation, consuming it
    pub fn run(self, store: &dyn RowStore) -> StrataResult<()> {
        match self {
            Compensation::Action(f) => f(),
            Compensation::Undo(command) => command.apply(store),
        }
    }
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::Action(_) => f.write_str("Action(..)"),
            Compensation::Undo(command) => f.debug_tuple("Undo").field(command).finish(),
        }
    }
}

// ============================================================================
// Lock requirements
// ============================================================================

/// Advisory lock an operation needs before it runs
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequirement {
    /// Entity to lock
    pub key: EntityKey,
    /// Lock mode
    pub mode: LockMode,
    /// Fail with a version conflict unless the row is at this version once locked
    pub expected_version: Option<u64>,
    /// Lock lifetime; `None` uses the configured default
    pub timeout: Option<Duration>,
    /// How long to wait for an incompatible lock; `None` rejects at once
    pub wait: Option<Duration>,
}

impl LockRequirement {
    /// Require a lock in `mode` on (table, id)
    pub fn new(table: impl Into<String>, id: impl Into<String>, mode: LockMode) -> Self {
        Self {
            key: EntityKey::new(table, id),
            mode,
            expected_version: None,
            timeout: None,
            wait: None,
        }
    }

    /// Shared lock
    pub fn read(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(table, id, LockMode::Read)
    }

    /// Exclusive lock
    pub fn write(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(table, id, LockMode::Write)
    }

    /// Require the row to be at `version`
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Set the lock lifetime
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait up to `wait` for the lock instead of failing at once
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub(crate) fn to_request(&self, default_ttl: Duration) -> LockRequest {
        LockRequest {
            key: self.key.clone(),
            mode: self.mode,
            expected_version: self.expected_version,
            ttl: Some(self.timeout.unwrap_or(default_ttl)),
            wait: self.wait,
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

/// One unit of work in an `execute` batch
pub struct Operation {
    pub(crate) action: OperationAction,
    pub(crate) compensation: Option<Compensation>,
    pub(crate) priority: Option<usize>,
    /// Human-readable description
    pub description: Option<String>,
    /// Operation type
    pub op_type: OperationType,
    /// Target table (empty for opaque work)
    pub table: String,
    /// Target entity
    pub entity_id: Option<String>,
    /// Payload, for snapshots
    pub data: Option<Value>,
    /// Locks to acquire before running
    pub lock_requirements: Vec<LockRequirement>,
}

impl Operation {
    fn with_action(action: OperationAction) -> Self {
        Self {
            action,
            compensation: None,
            priority: None,
            description: None,
            op_type: OperationType::Update,
            table: String::new(),
            entity_id: None,
            data: None,
            lock_requirements: Vec::new(),
        }
    }

    /// An operation that runs `f` once
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> StrataResult<Value> + Send + 'static,
    {
        Self::with_action(OperationAction::Once(Box::new(f)))
    }

    /// An operation re-run on retryable errors (conflicts, timeouts) under
    /// the transaction mode's retry policy
    pub fn retryable<F>(f: F) -> Self
    where
        F: FnMut() -> StrataResult<Value> + Send + 'static,
    {
        Self::with_action(OperationAction::Retryable {
            action: Box::new(f),
            policy: None,
        })
    }

    /// An operation with access to its transaction scope that reports its own undo
    pub fn scoped<F>(f: F) -> Self
    where
        F: FnOnce(&OperationScope) -> StrataResult<Applied> + Send + 'static,
    {
        Self::with_action(OperationAction::Scoped(Box::new(f)))
    }

    /// Override the retry policy of a retryable operation (no effect otherwise)
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        if let OperationAction::Retryable { policy: slot, .. } = &mut self.action {
            *slot = Some(policy);
        }
        self
    }

    /// Attach a compensation closure
    pub fn with_compensation<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> StrataResult<()> + Send + 'static,
    {
        self.compensation = Some(Compensation::action(f));
        self
    }

    /// Attach an undo command as compensation
    pub fn with_undo(mut self, command: UndoCommand) -> Self {
        self.compensation = Some(Compensation::Undo(command));
        self
    }

    /// Override the compensation priority
    ///
    /// Within a batch, compensations run in ascending priority: a higher
    /// value runs LATER during rollback, not first. The default for the
    /// operation at `index` of a batch of `total` is `total - index`, which
    /// unwinds the batch newest first. Cross-domain transactions ignore
    /// priorities and unwind strictly newest first.
    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Describe the target of the operation
    pub fn targeting(
        mut self,
        op_type: OperationType,
        table: impl Into<String>,
        entity_id: Option<String>,
    ) -> Self {
        self.op_type = op_type;
        self.table = table.into();
        self.entity_id = entity_id;
        self
    }

    /// Attach a payload for snapshots
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Require an advisory lock
    pub fn with_lock(mut self, requirement: LockRequirement) -> Self {
        self.lock_requirements.push(requirement);
        self
    }

    /// Whether a compensation was supplied up front
    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("action", &self.action)
            .field("compensation", &self.compensation)
            .field("description", &self.description)
            .field("op_type", &self.op_type)
            .field("table", &self.table)
            .field("entity_id", &self.entity_id)
            .field("lock_requirements", &self.lock_requirements)
            .finish()
    }
}
