//! Optimistic Concurrency Tests
//!
//! Version-checked updates under every conflict strategy.

use crate::common::*;
use std::sync::{Arc, Barrier};
use std::thread;

/// Seed `boards/b1` at version 1, then bump it to version 2 behind our back.
fn stale_board(tc: &TestCoordinator) {
    tc.seed("boards", "b1", json!({"title": "Roadmap", "tags": ["q3"], "owner": "ana"}));
    tc.store
        .update(
            "boards",
            "b1",
            &patch_from(json!({"tags": ["q3", "infra"], "owner": "ben"})),
            Some(1),
        )
        .unwrap();
}

fn update_board(
    tc: &TestCoordinator,
    patch: Value,
    strategy: ConflictStrategy,
) -> Result<Vec<Value>, ExecuteError> {
    let id = tc.begin();
    let result = tc.coord.execute(
        id,
        vec![tc.rows().update("boards", "b1", 1, patch_from(patch), strategy)],
    );
    if result.is_ok() {
        tc.coord.commit(id).unwrap();
    }
    result
}

// ============================================================================
// Strategies
// ============================================================================

#[test]
fn test_fail_fast_surfaces_current_version() {
    let tc = TestCoordinator::new();
    stale_board(&tc);

    let err = update_board(&tc, json!({"title": "Mine"}), ConflictStrategy::FailFast).unwrap_err();
    match err.error.as_conflict() {
        Some(Conflict::Version { expected, current, .. }) => {
            assert_eq!(*expected, 1);
            assert_eq!(*current, 2);
        }
        other => panic!("expected version conflict, got {:?}", other),
    }
    assert_eq!(tc.store.version("boards", "b1"), Some(2));
    assert_eq!(tc.store.get("boards", "b1").unwrap().get("title"), Some(&json!("Roadmap")));
}

#[test]
fn test_retry_automatic_applies_on_refreshed_version() {
    let tc = TestCoordinator::new();
    stale_board(&tc);

    let values = update_board(&tc, json!({"title": "Mine"}), ConflictStrategy::RetryAutomatic).unwrap();
    assert_eq!(values[0]["version"], json!(3));

    let row = tc.store.get("boards", "b1").unwrap();
    assert_eq!(row.get("title"), Some(&json!("Mine")));
    assert_eq!(row.get("owner"), Some(&json!("ben")));
    assert_eq!(tc.coord.stats().retries, 1);
}

#[test]
fn test_last_writer_wins_overlays_full_image() {
    let tc = TestCoordinator::new();
    stale_board(&tc);

    update_board(&tc, json!({"owner": "cy"}), ConflictStrategy::LastWriterWins).unwrap();
    let row = tc.store.get("boards", "b1").unwrap();
    assert_eq!(row.get("owner"), Some(&json!("cy")));
    assert_eq!(row.get("tags"), Some(&json!(["q3", "infra"])));
    assert_eq!(row.version, 3);
}

#[test]
fn test_merge_fields_applies_rules() {
    let tc = TestCoordinator::new();
    stale_board(&tc);

    let strategy = ConflictStrategy::MergeFields(vec![
        FieldMergeRule::keep_current("owner"),
        FieldMergeRule::merge_arrays("tags"),
    ]);
    update_board(
        &tc,
        json!({"owner": "dee", "tags": ["q3", "design"], "title": "Merged"}),
        strategy,
    )
    .unwrap();

    let row = tc.store.get("boards", "b1").unwrap();
    assert_eq!(row.get("owner"), Some(&json!("ben")));
    assert_eq!(row.get("tags"), Some(&json!(["q3", "infra", "design"])));
    assert_eq!(row.get("title"), Some(&json!("Merged")));
}

#[test]
fn test_manual_resolution_decides() {
    let tc = TestCoordinator::new();
    stale_board(&tc);

    let accept = ConflictStrategy::manual(|conflict, current, incoming| {
        assert_eq!(conflict.current, current.version);
        let mut patch = incoming.clone();
        patch.insert("resolved".to_string(), json!(true));
        Some(patch)
    });
    update_board(&tc, json!({"title": "Manual"}), accept).unwrap();
    let row = tc.store.get("boards", "b1").unwrap();
    assert_eq!(row.get("resolved"), Some(&json!(true)));

    let refuse = ConflictStrategy::manual(|_, _, _| None);
    let err = update_board(&tc, json!({"title": "Refused"}), refuse).unwrap_err();
    assert!(err.error.is_version_conflict());
    assert_eq!(
        tc.coord.conflict_history(&EntityKey::new("boards", "b1")).len(),
        2
    );
}

// ============================================================================
// Retry budget per mode
// ============================================================================

/// Update whose every merge bumps the row again, so every attempt loses.
fn losing_update(tc: &TestCoordinator, options: TransactionOptions) -> usize {
    tc.seed("boards", "b1", json!({"title": "Roadmap"}));
    tc.store
        .update("boards", "b1", &patch_from(json!({"title": "Other"})), None)
        .unwrap();
    let store = Arc::clone(&tc.store);
    let strategy = ConflictStrategy::MergeFields(vec![FieldMergeRule::custom(
        "title",
        move |_, incoming| {
            store
                .update("boards", "b1", &patch_from(json!({"title": "Racer"})), None)
                .unwrap();
            incoming.clone()
        },
    )]);

    let id = tc.begin_with(options);
    let err = tc
        .coord
        .execute(
            id,
            vec![tc
                .rows()
                .update("boards", "b1", 1, patch_from(json!({"title": "Mine"})), strategy)],
        )
        .unwrap_err();
    assert!(err.error.is_version_conflict());
    tc.coord
        .conflict_history(&EntityKey::new("boards", "b1"))
        .len()
}

fn split_retry_config() -> CoordinatorConfig {
    fast_config()
        .with_retry(
            RetryConfig::default()
                .with_max_retries(1)
                .with_base_delay_ms(1)
                .with_jitter(false),
        )
        .with_distributed_retry(
            RetryConfig::default()
                .with_max_retries(5)
                .with_base_delay_ms(1)
                .with_jitter(false),
        )
}

#[test]
fn test_row_update_uses_distributed_retry_budget() {
    let tc = TestCoordinator::with_config(split_retry_config());
    assert_eq!(losing_update(&tc, TransactionOptions::distributed()), 6);
}

#[test]
fn test_row_update_uses_default_retry_budget_outside_distributed() {
    let tc = TestCoordinator::with_config(split_retry_config());
    assert_eq!(losing_update(&tc, TransactionOptions::default()), 2);
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[test]
fn test_concurrent_retrying_writers_all_land() {
    let tc = TestCoordinator::new();
    tc.seed("counters", "c", json!({}));
    let writers = 4;
    let barrier = Arc::new(Barrier::new(writers));
    let optimistic = Arc::clone(tc.coord.optimistic());

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let optimistic = Arc::clone(&optimistic);
            thread::spawn(move || {
                let mut patch = Patch::new();
                patch.insert(format!("w{}", i), json!(true));
                barrier.wait();
                optimistic.update_with_optimistic_locking(
                    &EntityKey::new("counters", "c"),
                    1,
                    &patch,
                    &ConflictStrategy::RetryAutomatic,
                )
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    let row = tc.store.get("counters", "c").unwrap();
    assert_eq!(row.version, 1 + writers as u64);
    assert_eq!(row.fields.len(), writers);
}
