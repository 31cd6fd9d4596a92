//! Configuration File Tests

use crate::common::*;
use std::time::Duration;

#[test]
fn test_default_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);

    CoordinatorConfig::write_default_if_missing(&path).unwrap();
    let loaded = CoordinatorConfig::from_file(&path).unwrap();
    assert_eq!(loaded, CoordinatorConfig::default());
}

#[test]
fn test_existing_file_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, "max_concurrent_transactions = 7\n").unwrap();

    CoordinatorConfig::write_default_if_missing(&path).unwrap();
    let loaded = CoordinatorConfig::from_file(&path).unwrap();
    assert_eq!(loaded.max_concurrent_transactions, 7);
    assert_eq!(loaded.default_timeout_ms, 30_000);
}

#[test]
fn test_loaded_config_drives_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(
        &path,
        "max_concurrent_transactions = 1\ndefault_timeout_ms = 250\n\n[retry]\nmax_retries = 0\n",
    )
    .unwrap();

    let tc = TestCoordinator::with_config(CoordinatorConfig::from_file(&path).unwrap());
    let id = tc.begin();
    assert_eq!(tc.coord.snapshot(id).unwrap().timeout, Duration::from_millis(250));
    assert_eq!(
        tc.coord.begin(TransactionOptions::default()).unwrap_err().kind(),
        "quota_exceeded"
    );
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);

    std::fs::write(&path, "timeout_sweep_interval_ms = 0\n").unwrap();
    assert_eq!(CoordinatorConfig::from_file(&path).unwrap_err().kind(), "validation");

    std::fs::write(&path, "max_concurrent_transactions = \"lots\"\n").unwrap();
    assert_eq!(CoordinatorConfig::from_file(&path).unwrap_err().kind(), "validation");

    let missing = dir.path().join("absent.toml");
    assert_eq!(CoordinatorConfig::from_file(&missing).unwrap_err().kind(), "internal");
}
