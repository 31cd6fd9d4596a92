//! Advisory Locking Tests

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_concurrent_write_locks_exactly_one_succeeds() {
    let tc = TestCoordinator::new();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let successes = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let coord = Arc::clone(&tc.coord);
            let barrier = Arc::clone(&barrier);
            let successes = Arc::clone(&successes);
            thread::spawn(move || {
                let id = coord.begin(TransactionOptions::default()).unwrap();
                barrier.wait();
                let won = coord.execute(id, vec![lock_only("invoice-7")]).is_ok();
                if won {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
                (id, won)
            })
        })
        .collect();
    let outcomes: Vec<(TxnId, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(tc.coord.lock_count(), 1);
    for (id, won) in outcomes {
        if won {
            tc.coord.commit(id).unwrap();
        } else {
            assert_eq!(tc.coord.status(id).unwrap(), TransactionStatus::Aborted);
        }
    }
    assert_eq!(tc.coord.lock_count(), 0);
}

#[test]
fn test_second_writer_is_rejected_while_first_holds() {
    let tc = TestCoordinator::new();
    let a = tc.begin();
    let b = tc.begin();

    tc.coord.execute(a, vec![lock_only("doc")]).unwrap();
    let err = tc.coord.execute(b, vec![lock_only("doc")]).unwrap_err();

    match err.error.as_conflict() {
        Some(Conflict::Lock { holder, requested, .. }) => {
            assert_eq!(*holder, Some(a));
            assert_eq!(*requested, LockMode::Write);
        }
        other => panic!("expected lock conflict, got {:?}", other),
    }
    assert_eq!(tc.coord.status(b).unwrap(), TransactionStatus::Aborted);
    assert_eq!(tc.coord.held_locks(a).len(), 1);
}

#[test]
fn test_read_locks_are_shared() {
    let tc = TestCoordinator::new();
    let a = tc.begin();
    let b = tc.begin();
    let read = |id| {
        tc.coord.execute(
            id,
            vec![Operation::new(|| Ok(Value::Null))
                .with_lock(LockRequirement::read("entities", "shared"))],
        )
    };

    read(a).unwrap();
    read(b).unwrap();
    assert_eq!(tc.coord.lock_count(), 2);

    // A writer is blocked by either reader
    let c = tc.begin();
    assert!(tc.coord.execute(c, vec![lock_only("shared")]).is_err());
}

#[test]
fn test_sole_reader_upgrades_to_write() {
    let tc = TestCoordinator::new();
    let a = tc.begin();
    tc.coord
        .execute(
            a,
            vec![
                Operation::new(|| Ok(Value::Null))
                    .with_lock(LockRequirement::read("entities", "row")),
                lock_only("row"),
            ],
        )
        .unwrap();

    let held = tc.coord.held_locks(a);
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].mode, LockMode::Write);
}

#[test]
fn test_expected_version_checked_after_lock() {
    let tc = TestCoordinator::new();
    tc.seed("boards", "b1", json!({"name": "x"}));
    let id = tc.begin();

    let err = tc
        .coord
        .execute(
            id,
            vec![Operation::new(|| Ok(Value::Null)).with_lock(
                LockRequirement::write("boards", "b1").with_expected_version(7),
            )],
        )
        .unwrap_err();
    assert!(err.error.is_version_conflict());
    assert_eq!(tc.coord.lock_count(), 0);
}

#[test]
fn test_expired_lock_is_swept() {
    let tc = TestCoordinator::new();
    let id = tc.begin();
    tc.coord
        .execute(
            id,
            vec![Operation::new(|| Ok(Value::Null)).with_lock(
                LockRequirement::write("entities", "short")
                    .with_timeout(Duration::from_millis(5)),
            )],
        )
        .unwrap();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(tc.coord.sweep_expired_locks(), 1);
    assert_eq!(tc.coord.lock_count(), 0);
    assert_eq!(tc.log.count("lock:released"), 1);
}

#[test]
fn test_disabled_locking_only_records_requirements() {
    let tc = TestCoordinator::with_config(fast_config().with_optimistic_locking(false));
    let a = tc.begin();
    let b = tc.begin();

    tc.coord.execute(a, vec![lock_only("doc")]).unwrap();
    tc.coord.execute(b, vec![lock_only("doc")]).unwrap();

    assert_eq!(tc.coord.lock_count(), 0);
    let locks = tc.coord.snapshot(a).unwrap().locks;
    assert_eq!(locks.len(), 1);
    assert!(!locks[0].acquired);
}
