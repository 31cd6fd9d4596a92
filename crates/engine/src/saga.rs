//! Saga execution and compensation unwinding
//!
//! Two pieces live here:
//! - [`unwind`]: runs a set of pending compensations in a given order,
//!   never stopping on a failed compensation, and reports what ran and what
//!   failed. Every rollback path in the coordinator goes through it.
//! - [`SagaExecutor`]: a standalone runner for an ordered list of
//!   (action, compensation) steps that compensates completed steps in
//!   strict LIFO order on the first failure.
//!
//! # Ordering
//!
//! - `Lifo`: strict reverse submission order, priorities ignored
//! - `Priority`: newest batch first; within a batch ascending priority,
//!   ties in reverse submission order. With default priorities
//!   (`total_ops - index`) this is also strict reverse order.

use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use strata_core::{StrataError, StrataResult};
use strata_storage::RowStore;
use tracing::{debug, error, warn};

use crate::operation::{ActionFn, Compensation, UndoCommand};

/// A compensation registered by a successful operation, not yet run
#[derive(Debug)]
pub struct PendingCompensation {
    /// Compensation id (unique within the transaction, submission order)
    pub id: u64,
    /// Operation the compensation undoes
    pub operation_id: u64,
    /// Batch (`execute` call) the operation belonged to
    pub batch: u32,
    /// Priority within the batch
    pub priority: usize,
    /// Human-readable description
    pub description: String,
    /// The undo itself
    pub compensation: Compensation,
}

/// Unwind order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOrder {
    /// Strict reverse submission order
    Lifo,
    /// Batch-descending, priority-ascending, submission-descending
    Priority,
}

/// A compensation that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationFailure {
    /// Compensation id
    pub compensation_id: u64,
    /// Operation it was undoing
    pub operation_id: u64,
    /// Description
    pub description: String,
    /// Error text
    pub error: String,
}

/// What an unwind did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    /// Ids of compensations that succeeded, in run order
    pub executed: Vec<u64>,
    /// Compensations that failed, in run order
    pub failures: Vec<CompensationFailure>,
}

impl CompensationReport {
    /// True if every compensation succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// True if at least one compensation failed
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Compensations run (succeeded or failed)
    pub fn attempted(&self) -> usize {
        self.executed.len() + self.failures.len()
    }
}

/// Result of one compensation, as seen by an unwind observer
#[derive(Debug)]
pub struct CompensationOutcome<'a> {
    /// Compensation id
    pub id: u64,
    /// Operation it was undoing
    pub operation_id: u64,
    /// Description
    pub description: &'a str,
    /// `None` on success
    pub error: Option<&'a StrataError>,
}

/// Sort pending compensations into run order
pub fn order(pending: &mut [PendingCompensation], order: UnwindOrder) {
    match order {
        UnwindOrder::Lifo => pending.sort_by(|a, b| b.id.cmp(&a.id)),
        UnwindOrder::Priority => pending.sort_by(|a, b| {
            b.batch
                .cmp(&a.batch)
                .then(a.priority.cmp(&b.priority))
                .then(b.id.cmp(&a.id))
        }),
    }
}

/// Run every compensation once, in `unwind_order`
///
/// A failing (or panicking) compensation is recorded and the unwind moves
/// on. `observe` is called after each compensation.
pub fn unwind(
    mut pending: Vec<PendingCompensation>,
    unwind_order: UnwindOrder,
    store: &dyn RowStore,
    observe: &mut dyn FnMut(&CompensationOutcome<'_>),
) -> CompensationReport {
    order(&mut pending, unwind_order);
    let mut report = CompensationReport::default();

    for entry in pending {
        let PendingCompensation {
            id,
            operation_id,
            description,
            compensation,
            ..
        } = entry;
        let result = run_guarded(compensation, store);
        observe(&CompensationOutcome {
            id,
            operation_id,
            description: &description,
            error: result.as_ref().err(),
        });
        match result {
            Ok(()) => {
                debug!(target: "strata::saga", compensation_id = id, %description, "Compensation executed");
                report.executed.push(id);
            }
            Err(e) => {
                error!(target: "strata::saga", compensation_id = id, %description, error = %e, "Compensation failed");
                report.failures.push(CompensationFailure {
                    compensation_id: id,
                    operation_id,
                    description,
                    error: e.to_string(),
                });
            }
        }
    }

    if report.is_partial() {
        warn!(
            target: "strata::saga",
            failed = report.failures.len(),
            executed = report.executed.len(),
            "Partial compensation"
        );
    }
    report
}

fn run_guarded(compensation: Compensation, store: &dyn RowStore) -> StrataResult<()> {
    match catch_unwind(AssertUnwindSafe(|| compensation.run(store))) {
        Ok(result) => result,
        Err(panic) => Err(StrataError::internal(format!(
            "compensation panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "(non-string panic)".to_string())
}

// ============================================================================
// Standalone saga
// ============================================================================

/// One saga step
pub struct SagaStep {
    name: String,
    action: ActionFn,
    compensation: Option<Compensation>,
}

impl SagaStep {
    /// A step running `action`
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> StrataResult<Value> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
            compensation: None,
        }
    }

    /// Compensate with a closure
    pub fn with_compensation<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> StrataResult<()> + Send + 'static,
    {
        self.compensation = Some(Compensation::action(f));
        self
    }

    /// Compensate with an undo command
    pub fn with_undo(mut self, command: UndoCommand) -> Self {
        self.compensation = Some(Compensation::Undo(command));
        self
    }

    /// Step name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A saga that failed part-way
#[derive(Debug, Clone, PartialEq)]
pub struct SagaFailure {
    /// Error of the failing step
    pub error: StrataError,
    /// Index of the failing step
    pub failed_step: usize,
    /// Name of the failing step
    pub step_name: String,
    /// Compensation of the completed steps
    pub report: CompensationReport,
}

/// Runs saga steps in order, unwinding LIFO on the first failure
pub struct SagaExecutor {
    store: Arc<dyn RowStore>,
}

impl SagaExecutor {
    /// Create an executor whose undo commands target `store`
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    /// Run `steps`; on failure compensate every completed step in reverse
    pub fn run(&self, steps: Vec<SagaStep>) -> Result<Vec<Value>, SagaFailure> {
        let mut completed: Vec<PendingCompensation> = Vec::new();
        let mut values = Vec::with_capacity(steps.len());

        for (index, step) in steps.into_iter().enumerate() {
            let SagaStep {
                name,
                action,
                compensation,
            } = step;
            let result = match catch_unwind(AssertUnwindSafe(action)) {
                Ok(result) => result,
                Err(panic) => Err(StrataError::internal(format!(
                    "saga step '{}' panicked: {}",
                    name,
                    panic_message(panic.as_ref())
                ))),
            };

            match result {
                Ok(value) => {
                    debug!(target: "strata::saga", step = %name, index, "Saga step completed");
                    if let Some(compensation) = compensation {
                        completed.push(PendingCompensation {
                            id: index as u64,
                            operation_id: index as u64,
                            batch: 0,
                            priority: 0,
                            description: name,
                            compensation,
                        });
                    }
                    values.push(value);
                }
                Err(error) => {
                    warn!(target: "strata::saga", step = %name, index, error = %error, "Saga step failed");
                    let report =
                        unwind(completed, UnwindOrder::Lifo, self.store.as_ref(), &mut |_| {});
                    return Err(SagaFailure {
                        error,
                        failed_step: index,
                        step_name: name,
                        report,
                    });
                }
            }
        }
        Ok(values)
    }
}
