//! Timeout Tests
//!
//! A transaction past its deadline is rolled back with reason "timeout",
//! whether it is idle, between batches or stuck inside an operation.

use crate::common::*;
use std::thread;
use std::time::{Duration, Instant};

fn short(ms: u64) -> TransactionOptions {
    TransactionOptions::default().with_timeout(Duration::from_millis(ms))
}

#[test]
fn test_idle_transaction_times_out() {
    let tc = TestCoordinator::started(
        fast_config().with_timeout_sweep_interval(Duration::from_millis(5)),
    );
    let trace = new_trace();
    let id = tc.begin_with(short(50));
    tc.coord.execute(id, vec![traced("hold", &trace)]).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        tc.coord.status(id).map(|s| s.is_terminal()).unwrap_or(false)
    }));

    let snapshot = tc.coord.snapshot(id).unwrap();
    assert_eq!(snapshot.status, TransactionStatus::Aborted);
    assert_eq!(snapshot.rollback_reason.as_deref(), Some("timeout"));
    assert_eq!(*trace.lock(), vec!["hold".to_string()]);
    assert_eq!(tc.coord.stats().timeouts, 1);
}

#[test]
fn test_expired_transaction_cannot_execute_or_commit() {
    let tc = TestCoordinator::new();

    let a = tc.begin_with(short(10));
    thread::sleep(Duration::from_millis(20));
    let err = tc.coord.execute(a, vec![lock_only("x")]).unwrap_err();
    assert!(err.error.is_timeout());
    assert_eq!(err.failed_index, None);

    let b = tc.begin_with(short(30));
    tc.coord.execute(b, vec![lock_only("y")]).unwrap();
    thread::sleep(Duration::from_millis(40));
    assert!(tc.coord.commit(b).unwrap_err().is_timeout());
    assert_eq!(tc.coord.status(b).unwrap(), TransactionStatus::Aborted);
    assert_eq!(tc.coord.lock_count(), 0);
}

#[test]
fn test_deadline_checked_between_operations() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin_with(short(30));

    let err = tc
        .coord
        .execute(
            id,
            vec![
                traced("before", &trace),
                Operation::new(|| {
                    thread::sleep(Duration::from_millis(50));
                    Ok(Value::Null)
                }),
                traced("after", &trace),
            ],
        )
        .unwrap_err();

    assert_eq!(err.failed_index, Some(2));
    assert!(err.error.is_timeout());
    // The sleeping op had no compensation; only "before" is undone
    assert_eq!(*trace.lock(), vec!["before".to_string()]);
    assert_eq!(
        tc.coord.snapshot(id).unwrap().rollback_reason.as_deref(),
        Some("timeout")
    );
}

#[test]
fn test_watchdog_interrupts_cooperative_operation() {
    let tc = TestCoordinator::started(
        fast_config().with_timeout_sweep_interval(Duration::from_millis(5)),
    );
    let id = tc.begin_with(short(50));

    let started = Instant::now();
    let err = tc
        .coord
        .execute(
            id,
            vec![Operation::scoped(|scope| {
                while !scope.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(StrataError::internal("stopped early"))
            })],
        )
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.failed_index, Some(0));
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Aborted);
    assert_eq!(
        tc.coord.snapshot(id).unwrap().rollback_reason.as_deref(),
        Some("timeout")
    );
}

#[test]
fn test_distributed_mode_uses_its_own_timeout() {
    let tc = TestCoordinator::new();
    let id = tc.begin_with(TransactionOptions::distributed());
    let snapshot = tc.coord.snapshot(id).unwrap();
    assert_eq!(snapshot.timeout, Duration::from_millis(60_000));
    assert_eq!(snapshot.mode, TransactionMode::Distributed);
}
