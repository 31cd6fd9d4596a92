//! Deadlock Tests
//!
//! A waits for B's lock while B waits for A's: the younger transaction is
//! rolled back with reason "deadlock" and the older one proceeds.

use crate::common::*;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn wait_for(
    tc: &TestCoordinator,
    owner: TxnId,
    key: &'static str,
) -> JoinHandle<Result<Vec<Value>, ExecuteError>> {
    let coord = Arc::clone(&tc.coord);
    thread::spawn(move || coord.execute(owner, vec![lock_waiting(key, Duration::from_secs(10))]))
}

/// Begin A, then B (strictly younger), each holding one lock.
fn crossed_pair(tc: &TestCoordinator) -> (TxnId, TxnId) {
    let a = tc.begin();
    thread::sleep(Duration::from_millis(5));
    let b = tc.begin();
    tc.coord.execute(a, vec![lock_only("left")]).unwrap();
    tc.coord.execute(b, vec![lock_only("right")]).unwrap();
    (a, b)
}

#[test]
fn test_manual_detection_aborts_younger() {
    let tc = TestCoordinator::with_config(fast_config().with_deadlock_detection(false));
    let (a, b) = crossed_pair(&tc);

    let ha = wait_for(&tc, a, "right");
    let hb = wait_for(&tc, b, "left");

    assert!(wait_until(Duration::from_secs(5), || {
        !tc.coord.detect_deadlocks().is_empty()
    }));

    let rb = hb.join().unwrap();
    let ra = ha.join().unwrap();
    assert!(ra.is_ok());
    assert!(rb.is_err());

    assert_eq!(tc.coord.status(b).unwrap(), TransactionStatus::Aborted);
    assert_eq!(
        tc.coord.snapshot(b).unwrap().rollback_reason.as_deref(),
        Some("deadlock")
    );
    assert_eq!(tc.log.count("deadlock:detected"), 1);

    tc.coord.commit(a).unwrap();
    assert_eq!(tc.coord.lock_count(), 0);
}

#[test]
fn test_background_detection_aborts_younger() {
    let tc = TestCoordinator::started(
        fast_config().with_deadlock_check_interval(Duration::from_millis(10)),
    );
    let (a, b) = crossed_pair(&tc);

    let ha = wait_for(&tc, a, "right");
    let hb = wait_for(&tc, b, "left");

    assert!(ha.join().unwrap().is_ok());
    assert!(hb.join().unwrap().is_err());
    assert_eq!(tc.coord.status(a).unwrap(), TransactionStatus::Running);
    assert_eq!(tc.coord.status(b).unwrap(), TransactionStatus::Aborted);
    assert_eq!(tc.coord.stats().deadlocks, 1);
}

#[test]
fn test_victim_compensations_run() {
    let tc = TestCoordinator::with_config(fast_config().with_deadlock_detection(false));
    let trace = new_trace();
    let a = tc.begin();
    thread::sleep(Duration::from_millis(5));
    let b = tc.begin();
    tc.coord.execute(a, vec![lock_only("left")]).unwrap();
    tc.coord
        .execute(b, vec![lock_only("right"), traced("b-work", &trace)])
        .unwrap();

    let ha = wait_for(&tc, a, "right");
    let hb = wait_for(&tc, b, "left");
    assert!(wait_until(Duration::from_secs(5), || {
        !tc.coord.detect_deadlocks().is_empty()
    }));

    let err = hb.join().unwrap().unwrap_err();
    assert_eq!(err.compensation.executed.len(), 1);
    assert_eq!(*trace.lock(), vec!["b-work".to_string()]);
    ha.join().unwrap().unwrap();
}

#[test]
fn test_no_cycle_no_victim() {
    let tc = TestCoordinator::with_config(fast_config().with_deadlock_detection(false));
    let a = tc.begin();
    let b = tc.begin();
    tc.coord.execute(a, vec![lock_only("solo")]).unwrap();

    let hb = wait_for(&tc, b, "solo");
    thread::sleep(Duration::from_millis(20));
    assert!(tc.coord.detect_deadlocks().is_empty());

    tc.coord.commit(a).unwrap();
    assert!(hb.join().unwrap().is_ok());
}
