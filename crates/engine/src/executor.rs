//! Mode executors
//!
//! Runs one `execute` batch against a locked context. All four modes share
//! the forward path: operations run strictly in submission order, declared
//! locks are taken before each operation, and the first failure stops the
//! batch. They differ in how the batch is unwound afterwards
//! ([`unwind_order`]), in their default timeout and retry policy, and in the
//! terminal status a rollback reaches (see the coordinator).
//!
//! Distributed mode runs every operation immediately. There is no prepare
//! phase and no isolation between "prepare" and "commit"; the mode only
//! carries its own defaults and tag.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use strata_concurrency::{CancelToken, OptimisticLockManager};
use strata_core::{StrataError, StrataResult};
use strata_storage::RowStore;
use tracing::{debug, warn};

use crate::config::CoordinatorConfig;
use crate::context::{TransactionContext, TransactionMode};
use crate::events::{EventBus, TransactionEvent};
use crate::metrics::MetricsCollector;
use crate::operation::{
    Applied, Compensation, LockRequirement, Operation, OperationAction, OperationScope,
};
use crate::saga::{panic_message, UnwindOrder};

/// Shared services a batch runs against
pub(crate) struct BatchEnv<'a> {
    pub store: &'a dyn RowStore,
    pub optimistic: &'a OptimisticLockManager,
    pub events: &'a EventBus,
    pub metrics: &'a MetricsCollector,
    pub config: &'a CoordinatorConfig,
}

/// First failure of a batch
#[derive(Debug)]
pub(crate) struct BatchFailure {
    pub error: StrataError,
    pub index: usize,
}

/// Order in which a transaction of `mode` is unwound
pub fn unwind_order(mode: TransactionMode) -> UnwindOrder {
    match mode {
        TransactionMode::CrossDomain => UnwindOrder::Lifo,
        _ => UnwindOrder::Priority,
    }
}

/// Error reported when a transaction stops because its token was set
pub(crate) fn cancellation_error(ctx: &TransactionContext, reason: &str) -> StrataError {
    if reason == "timeout" {
        StrataError::timeout(
            format!("transaction {} exceeded its deadline", ctx.id()),
            ctx.elapsed(),
        )
    } else {
        StrataError::internal(format!("transaction {} cancelled: {}", ctx.id(), reason))
    }
}

/// Stop reason for the next operation, if any
fn interruption(ctx: &TransactionContext) -> Option<StrataError> {
    let token = ctx.cancel_token();
    if !token.is_cancelled() && ctx.is_expired(Instant::now()) {
        token.cancel("timeout");
    }
    if token.is_cancelled() {
        let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
        return Some(cancellation_error(ctx, &reason));
    }
    None
}

/// Run `ops` in order, stopping at the first failure
///
/// Every executed operation with a compensation pushes it onto the
/// context's stack; unwinding is left to the caller.
pub(crate) fn run_batch(
    ctx: &mut TransactionContext,
    ops: Vec<Operation>,
    env: &BatchEnv<'_>,
) -> Result<Vec<Value>, BatchFailure> {
    let batch = ctx.begin_batch();
    let total = ops.len();
    let mode = ctx.mode();
    let mut results = Vec::with_capacity(total);

    if mode == TransactionMode::Distributed {
        debug!(target: "strata::txn", txn_id = %ctx.id(), batch, operations = total, "Distributed batch: executing without prepare phase");
    }

    for (index, op) in ops.into_iter().enumerate() {
        if let Some(error) = interruption(ctx) {
            return Err(BatchFailure { error, index });
        }

        let Operation {
            action,
            compensation,
            priority,
            description,
            op_type,
            table,
            entity_id,
            data,
            lock_requirements,
        } = op;
        let op_id = ctx.record_operation(
            batch,
            op_type,
            table,
            entity_id,
            data,
            description.clone(),
        );

        if let Err(error) = take_locks(ctx, &lock_requirements, env) {
            ctx.mark_failed(op_id, &error, 0);
            warn!(target: "strata::txn", txn_id = %ctx.id(), index, error = %error, "Lock requirement failed");
            return Err(BatchFailure { error, index });
        }

        match run_action(ctx, action, env) {
            Ok((applied, attempts)) => {
                ctx.mark_executed(op_id, applied.value.clone(), attempts);
                let compensation = compensation.or_else(|| applied.undo.map(Compensation::Undo));
                if let Some(compensation) = compensation {
                    let description = description.clone().unwrap_or_else(|| match &compensation {
                        Compensation::Undo(command) => command.describe(),
                        Compensation::Action(_) => format!("compensate operation {}", op_id),
                    });
                    ctx.push_compensation(
                        op_id,
                        batch,
                        priority.unwrap_or(total - index),
                        description,
                        compensation,
                    );
                }
                results.push(applied.value);
            }
            Err((error, attempts)) => {
                ctx.mark_failed(op_id, &error, attempts);
                warn!(
                    target: "strata::txn",
                    txn_id = %ctx.id(),
                    mode = mode.name(),
                    index,
                    attempts,
                    error = %error,
                    "Operation failed"
                );
                return Err(BatchFailure { error, index });
            }
        }
    }

    debug!(target: "strata::txn", txn_id = %ctx.id(), batch, operations = total, "Batch executed");
    Ok(results)
}

fn take_locks(
    ctx: &mut TransactionContext,
    requirements: &[LockRequirement],
    env: &BatchEnv<'_>,
) -> StrataResult<()> {
    for requirement in requirements {
        if !env.config.enable_optimistic_locking {
            ctx.record_declared_lock(
                requirement.key.clone(),
                requirement.mode,
                requirement.expected_version,
            );
            continue;
        }

        let request = requirement.to_request(env.config.default_lock_timeout());
        let grant = env.optimistic.acquire_lock(ctx.id(), &request)?;
        env.metrics.record_lock_wait(ctx.id(), grant.waited);
        ctx.record_lock(&grant.lock);
        env.events.emit(TransactionEvent::LockAcquired {
            txn_id: ctx.id(),
            key: grant.lock.key.clone(),
            mode: grant.lock.mode,
            waited: grant.waited,
        });

        if let Some(expected) = requirement.expected_version {
            let key = &requirement.key;
            let row = env.store.get(&key.table, &key.entity_id)?;
            if row.version != expected {
                return Err(StrataError::version_conflict(
                    key.clone(),
                    expected,
                    row.version,
                ));
            }
        }
    }
    Ok(())
}

fn run_action(
    ctx: &TransactionContext,
    action: OperationAction,
    env: &BatchEnv<'_>,
) -> Result<(Applied, u32), (StrataError, u32)> {
    match action {
        OperationAction::Once(f) => guarded(f)
            .map(|value| (Applied::value(value), 1))
            .map_err(|e| (e, 1)),
        OperationAction::Retryable { mut action, policy } => {
            let policy = policy.unwrap_or_else(|| env.config.retry_policy_for(ctx.mode()));
            let token: Arc<CancelToken> = Arc::clone(ctx.cancel_token());
            let retried = policy.run_interruptible(
                || guarded(&mut action),
                StrataError::is_retryable,
                || token.is_cancelled(),
            );
            env.metrics.record_retries(ctx.id(), retried.retries());
            let attempts = retried.attempts;
            retried
                .result
                .map(|value| (Applied::value(value), attempts))
                .map_err(|e| (e, attempts))
        }
        OperationAction::Scoped(f) => {
            let scope = OperationScope::new(
                ctx.id(),
                Arc::clone(ctx.cancel_token()),
                env.config.retry_policy_for(ctx.mode()),
            );
            match guarded(|| f(&scope)) {
                Ok(applied) => {
                    env.metrics.record_retries(ctx.id(), applied.retries);
                    let attempts = applied.retries + 1;
                    Ok((applied, attempts))
                }
                Err(e) => Err((e, 1)),
            }
        }
    }
}

/// Run user code, turning a panic into an internal error
fn guarded<T, F>(f: F) -> StrataResult<T>
where
    F: FnOnce() -> StrataResult<T>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        Err(StrataError::internal(format!(
            "operation panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}
