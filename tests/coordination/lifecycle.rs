//! Transaction Lifecycle Tests
//!
//! - Begin-execute-commit cycle
//! - Rollback of idle transactions
//! - Terminal transactions reject further work

use crate::common::*;
use std::time::Duration;

// ============================================================================
// Commit
// ============================================================================

#[test]
fn test_commit_releases_every_lock_and_emits_once() {
    let tc = TestCoordinator::new();
    let id = tc.begin();

    tc.coord
        .execute(id, vec![lock_only("a"), lock_only("b"), lock_only("c")])
        .unwrap();
    assert_eq!(tc.coord.held_locks(id).len(), 3);

    let metrics = tc.coord.commit(id).unwrap();
    assert_eq!(metrics.status, TransactionStatus::Committed);
    assert_eq!(metrics.operation_count, 3);

    assert_eq!(tc.coord.lock_count(), 0);
    assert_eq!(tc.log.count("transaction:committed"), 1);
    assert_eq!(tc.log.count("lock:released"), 3);
    assert_eq!(tc.coord.active_count(), 0);
}

#[test]
fn test_status_walks_pending_running_committed() {
    let tc = TestCoordinator::new();
    let id = tc.begin();
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Pending);

    tc.coord.execute(id, vec![lock_only("x")]).unwrap();
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Running);

    tc.coord.commit(id).unwrap();
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Committed);
}

#[test]
fn test_multiple_batches_accumulate_operations() {
    let tc = TestCoordinator::new();
    let id = tc.begin();

    let first = tc
        .coord
        .execute(id, vec![Operation::new(|| Ok(json!(1)))])
        .unwrap();
    let second = tc
        .coord
        .execute(
            id,
            vec![
                Operation::new(|| Ok(json!(2))),
                Operation::new(|| Ok(json!(3))),
            ],
        )
        .unwrap();
    assert_eq!(first, vec![json!(1)]);
    assert_eq!(second, vec![json!(2), json!(3)]);

    let snapshot = tc.coord.snapshot(id).unwrap();
    assert_eq!(snapshot.operations.len(), 3);
    assert_eq!(snapshot.operations[2].batch, 1);
    assert!(snapshot
        .operations
        .iter()
        .all(|op| op.status == OperationStatus::Executed));
}

#[test]
fn test_commit_without_execute_is_rejected() {
    let tc = TestCoordinator::new();
    let id = tc.begin();
    let err = tc.coord.commit(id).unwrap_err();
    assert_eq!(err.kind(), "validation");
    // Still usable afterwards
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Pending);
}

#[test]
fn test_committed_snapshot_survives_eviction() {
    let tc = TestCoordinator::with_config(
        fast_config().with_eviction_grace(Duration::from_millis(1)),
    );
    let id = tc.begin_with(TransactionOptions::default().with_label("nightly import"));
    tc.coord.execute(id, vec![lock_only("x")]).unwrap();
    tc.coord.commit(id).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(tc.coord.process_evictions(), 1);

    let snapshot = tc.coord.snapshot(id).unwrap();
    assert_eq!(snapshot.status, TransactionStatus::Committed);
    assert_eq!(snapshot.label.as_deref(), Some("nightly import"));
    assert!(snapshot.end_time.is_some());
}

// ============================================================================
// Rollback
// ============================================================================

#[test]
fn test_double_rollback_is_not_found() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();
    tc.coord.execute(id, vec![traced("one", &trace)]).unwrap();

    let report = tc.coord.rollback(id, "user cancelled").unwrap();
    assert_eq!(report.executed.len(), 1);

    let err = tc.coord.rollback(id, "again").unwrap_err();
    assert!(err.is_not_found());
    // Compensation ran exactly once
    assert_eq!(*trace.lock(), vec!["one".to_string()]);
}

#[test]
fn test_rollback_of_pending_transaction() {
    let tc = TestCoordinator::new();
    let id = tc.begin();
    let report = tc.coord.rollback(id, "changed my mind").unwrap();
    assert_eq!(report.attempted(), 0);
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Aborted);
    assert_eq!(tc.log.count("transaction:rolled_back"), 1);
}

#[test]
fn test_terminal_transactions_reject_work() {
    let tc = TestCoordinator::new();
    let id = tc.begin();
    tc.coord.execute(id, vec![lock_only("x")]).unwrap();
    tc.coord.commit(id).unwrap();

    assert!(tc.coord.execute(id, vec![lock_only("y")]).unwrap_err().error.is_not_found());
    assert!(tc.coord.commit(id).unwrap_err().is_not_found());
    assert!(tc.coord.rollback(id, "late").unwrap_err().is_not_found());
}

#[test]
fn test_unknown_transaction_is_not_found() {
    let tc = TestCoordinator::new();
    let ghost = TxnId::new();
    assert!(tc.coord.status(ghost).unwrap_err().is_not_found());
    assert!(tc.coord.snapshot(ghost).unwrap_err().is_not_found());
    assert!(!tc.coord.request_rollback(ghost, "nope"));
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn test_quota_counts_only_live_transactions() {
    let tc = TestCoordinator::with_config(fast_config().with_max_concurrent_transactions(2));
    let a = tc.begin();
    let _b = tc.begin();

    let err = tc.coord.begin(TransactionOptions::default()).unwrap_err();
    assert_eq!(err.kind(), "quota_exceeded");

    tc.coord.execute(a, vec![lock_only("x")]).unwrap();
    tc.coord.commit(a).unwrap();
    // The committed context is still queryable but no longer counts
    assert!(tc.coord.begin(TransactionOptions::default()).is_ok());
}

#[test]
fn test_zero_timeout_is_rejected() {
    let tc = TestCoordinator::new();
    let err = tc
        .coord
        .begin(TransactionOptions::default().with_timeout(Duration::ZERO))
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert_eq!(tc.coord.active_count(), 0);
}

#[test]
fn test_stats_track_outcomes() {
    let tc = TestCoordinator::new();
    let committed = tc.begin();
    tc.coord.execute(committed, vec![lock_only("x")]).unwrap();
    tc.coord.commit(committed).unwrap();

    let failed = tc.begin();
    tc.coord.execute(failed, vec![failing("boom")]).unwrap_err();

    let stats = tc.coord.stats();
    assert_eq!(stats.started, 2);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.active, 0);
    assert!((stats.commit_rate - 0.5).abs() < f64::EPSILON);
}
