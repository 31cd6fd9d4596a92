//! Compensation Tests
//!
//! When operation k of a batch fails, the compensations of operations
//! 1..k-1 run exactly once, newest first, and the first error is the one
//! reported.

use crate::common::*;

fn names(trace: &std::sync::Arc<parking_lot::Mutex<Vec<String>>>) -> Vec<String> {
    trace.lock().clone()
}

// ============================================================================
// Unwind order
// ============================================================================

#[test]
fn test_failure_compensates_prior_operations_in_reverse() {
    for mode in [
        TransactionMode::SingleDomain,
        TransactionMode::CrossDomain,
        TransactionMode::Distributed,
        TransactionMode::Compensating,
    ] {
        let tc = TestCoordinator::new();
        let trace = new_trace();
        let id = tc.begin_with(TransactionOptions::new(mode));

        let err = tc
            .coord
            .execute(
                id,
                vec![
                    traced("reserve", &trace),
                    traced("charge", &trace),
                    traced("notify", &trace),
                    failing("ship failed"),
                    traced("never", &trace),
                ],
            )
            .unwrap_err();

        assert_eq!(err.failed_index, Some(3), "mode {}", mode);
        assert_eq!(err.error, StrataError::validation("ship failed"));
        assert_eq!(names(&trace), vec!["notify", "charge", "reserve"], "mode {}", mode);
        assert_eq!(err.compensation.executed.len(), 3);
    }
}

#[test]
fn test_rollback_spans_earlier_batches() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();

    tc.coord
        .execute(id, vec![traced("b0-first", &trace), traced("b0-second", &trace)])
        .unwrap();
    tc.coord
        .execute(id, vec![traced("b1-first", &trace), failing("nope")])
        .unwrap_err();

    assert_eq!(
        names(&trace),
        vec!["b1-first", "b0-second", "b0-first"]
    );
}

#[test]
fn test_explicit_priority_runs_later() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();

    // Default priorities are 3, 2, 1; raising the first op's priority
    // keeps it last, raising the last one's pushes it behind the middle.
    tc.coord
        .execute(
            id,
            vec![
                traced("audit", &trace),
                traced("cache", &trace),
                traced("index", &trace).with_priority(5),
            ],
        )
        .unwrap();
    tc.coord.rollback(id, "user").unwrap();

    assert_eq!(names(&trace), vec!["cache", "audit", "index"]);
}

#[test]
fn test_cross_domain_ignores_priority() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin_with(TransactionOptions::cross_domain());

    tc.coord
        .execute(
            id,
            vec![
                traced("first", &trace).with_priority(0),
                traced("second", &trace).with_priority(99),
            ],
        )
        .unwrap();
    tc.coord.rollback(id, "user").unwrap();

    assert_eq!(names(&trace), vec!["second", "first"]);
}

// ============================================================================
// Failing compensations
// ============================================================================

#[test]
fn test_failed_compensation_does_not_stop_unwind() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();

    let err = tc
        .coord
        .execute(
            id,
            vec![
                traced("first", &trace),
                Operation::new(|| Ok(json!("second")))
                    .with_description("release hold")
                    .with_compensation(|| Err(StrataError::internal("payment api down"))),
                traced("third", &trace),
                failing("boom"),
            ],
        )
        .unwrap_err();

    // The original failure is reported, not the compensation's
    assert_eq!(err.kind(), "validation");
    assert!(err.is_partial_compensation());
    assert_eq!(err.compensation.failures.len(), 1);
    assert_eq!(err.compensation.failures[0].description, "release hold");
    assert_eq!(names(&trace), vec!["third", "first"]);

    assert_eq!(tc.log.count("compensation:executed"), 2);
    assert_eq!(tc.log.count("compensation:failed"), 1);
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Aborted);
}

#[test]
fn test_panicking_compensation_is_contained() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();

    tc.coord
        .execute(
            id,
            vec![
                traced("survivor", &trace),
                Operation::new(|| Ok(json!(null))).with_compensation(|| panic!("bad undo")),
            ],
        )
        .unwrap();
    let report = tc.coord.rollback(id, "user").unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("bad undo"));
    assert_eq!(names(&trace), vec!["survivor"]);
}

#[test]
fn test_panicking_operation_rolls_back() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();

    let err = tc
        .coord
        .execute(
            id,
            vec![
                traced("done", &trace),
                Operation::new(|| panic!("operation exploded")),
            ],
        )
        .unwrap_err();

    assert_eq!(err.kind(), "internal");
    assert_eq!(names(&trace), vec!["done"]);
    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Aborted);
}

// ============================================================================
// Compensating mode terminal states
// ============================================================================

#[test]
fn test_compensating_mode_ends_compensated() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin_with(TransactionOptions::compensating());

    tc.coord
        .execute(id, vec![traced("one", &trace), failing("two")])
        .unwrap_err();

    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Compensated);
    assert_eq!(tc.coord.stats().compensated, 1);
}

#[test]
fn test_compensating_mode_with_failed_compensation_ends_aborted() {
    let tc = TestCoordinator::new();
    let id = tc.begin_with(TransactionOptions::compensating());

    tc.coord
        .execute(
            id,
            vec![
                Operation::new(|| Ok(json!(null)))
                    .with_compensation(|| Err(StrataError::internal("cannot undo"))),
                failing("two"),
            ],
        )
        .unwrap_err();

    assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Aborted);
    let snapshot = tc.coord.snapshot(id).unwrap();
    assert_eq!(snapshot.compensation_failures.len(), 1);
    assert!(snapshot.compensation_failures[0].error.contains("cannot undo"));

    let stats = tc.coord.stats();
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.compensated, 0);
    assert_eq!(stats.failed, 0);
}

#[test]
fn test_snapshot_records_compensation_status() {
    let tc = TestCoordinator::new();
    let trace = new_trace();
    let id = tc.begin();

    tc.coord
        .execute(
            id,
            vec![traced("a", &trace), traced("b", &trace), failing("c")],
        )
        .unwrap_err();

    let snapshot = tc.coord.snapshot(id).unwrap();
    assert_eq!(snapshot.compensations.len(), 2);
    assert!(snapshot
        .compensations
        .iter()
        .all(|c| c.status == CompensationStatus::Executed));
    assert_eq!(snapshot.operations[2].status, OperationStatus::Failed);
    assert!(snapshot
        .rollback_reason
        .as_deref()
        .unwrap()
        .starts_with("operation failed"));
}
