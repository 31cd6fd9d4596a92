//! Standalone Saga Tests
//!
//! `SagaExecutor` runs steps outside any transaction and unwinds completed
//! steps in reverse on the first failure.

use crate::common::*;

#[test]
fn test_saga_success_returns_every_value() {
    let tc = TestCoordinator::new();
    let saga = tc.coord.saga_executor();

    let values = saga
        .run(vec![
            SagaStep::new("reserve", || Ok(json!("r1"))),
            SagaStep::new("charge", || Ok(json!("c1"))),
        ])
        .unwrap();
    assert_eq!(values, vec![json!("r1"), json!("c1")]);
}

#[test]
fn test_saga_failure_unwinds_in_reverse() {
    let tc = TestCoordinator::new();
    let saga = tc.coord.saga_executor();
    let trace = new_trace();
    let step = |name: &'static str| {
        let trace = std::sync::Arc::clone(&trace);
        SagaStep::new(name, move || Ok(json!(name))).with_compensation(move || {
            trace.lock().push(name.to_string());
            Ok(())
        })
    };

    let failure = saga
        .run(vec![
            step("reserve"),
            step("charge"),
            SagaStep::new("ship", || Err(StrataError::internal("carrier offline"))),
            step("email"),
        ])
        .unwrap_err();

    assert_eq!(failure.failed_step, 2);
    assert_eq!(failure.step_name, "ship");
    assert_eq!(failure.error.kind(), "internal");
    assert!(failure.report.is_complete());
    assert_eq!(*trace.lock(), vec!["charge".to_string(), "reserve".to_string()]);
}

#[test]
fn test_saga_undo_commands_target_the_store() {
    let tc = TestCoordinator::new();
    let saga = tc.coord.saga_executor();
    let store = tc.store.clone();

    let failure = saga
        .run(vec![
            SagaStep::new("create card", move || {
                let row = store.insert("cards", Row::new("c9", patch_from(json!({"t": 1}))))?;
                Ok(row.to_value())
            })
            .with_undo(UndoCommand::DeleteRow {
                table: "cards".into(),
                id: "c9".into(),
            }),
            SagaStep::new("explode", || panic!("step crashed")),
        ])
        .unwrap_err();

    assert!(failure.error.to_string().contains("step crashed"));
    assert!(!tc.store.contains("cards", "c9"));
}
