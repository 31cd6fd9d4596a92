//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

pub use serde_json::json;
pub use strata_coordinator::*;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route coordinator logs to the test writer.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}

// ============================================================================
// TestCoordinator - coordinator + store + event log
// ============================================================================

/// Coordinator over an in-memory store with every event recorded.
pub struct TestCoordinator {
    pub coord: Arc<TransactionCoordinator>,
    pub store: Arc<MemoryStore>,
    pub log: Arc<EventLog>,
}

impl TestCoordinator {
    /// No background workers; tests drive sweeps by hand.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// No background workers, custom config.
    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(
            TransactionCoordinator::new(store.clone(), config)
                .expect("Failed to create coordinator"),
        );
        Self::wrap(coord, store)
    }

    /// With watchdog and deadlock detector running.
    pub fn started(config: CoordinatorConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let coord = TransactionCoordinator::start(store.clone(), config)
            .expect("Failed to start coordinator");
        Self::wrap(coord, store)
    }

    fn wrap(coord: Arc<TransactionCoordinator>, store: Arc<MemoryStore>) -> Self {
        let log = Arc::new(EventLog::new());
        coord.events().subscribe(log.clone());
        TestCoordinator { coord, store, log }
    }

    pub fn rows(&self) -> RowOps {
        self.coord.row_ops()
    }

    /// Insert a row directly into the store (outside any transaction).
    pub fn seed(&self, table: &str, id: &str, fields: Value) -> Row {
        self.store
            .insert(table, Row::new(id, patch_from(fields)))
            .expect("Failed to seed row")
    }

    /// Begin with default options.
    pub fn begin(&self) -> TxnId {
        self.coord
            .begin(TransactionOptions::default())
            .expect("Failed to begin")
    }

    pub fn begin_with(&self, options: TransactionOptions) -> TxnId {
        self.coord.begin(options).expect("Failed to begin")
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.coord.shutdown();
    }
}

/// Millisecond retry delays so conflict tests stay fast.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default().with_retry(
        RetryConfig::default()
            .with_base_delay_ms(1)
            .with_jitter(false),
    )
}

// ============================================================================
// Operation helpers
// ============================================================================

/// Operation that returns `value` and records `name` into `trace` when compensated.
pub fn traced(name: &'static str, trace: &Arc<parking_lot::Mutex<Vec<String>>>) -> Operation {
    let trace = Arc::clone(trace);
    Operation::new(move || Ok(json!(name))).with_compensation(move || {
        trace.lock().push(name.to_string());
        Ok(())
    })
}

/// Operation that always fails with a validation error.
pub fn failing(message: &'static str) -> Operation {
    Operation::new(move || Err(StrataError::validation(message)))
}

/// Operation that only takes a write lock on `entities/<key>`.
pub fn lock_only(key: &str) -> Operation {
    Operation::new(|| Ok(Value::Null)).with_lock(LockRequirement::write("entities", key))
}

/// Like [`lock_only`] but waits up to `wait` for the lock.
pub fn lock_waiting(key: &str, wait: Duration) -> Operation {
    Operation::new(|| Ok(Value::Null))
        .with_lock(LockRequirement::write("entities", key).with_wait(wait))
}

pub fn new_trace() -> Arc<parking_lot::Mutex<Vec<String>>> {
    Arc::new(parking_lot::Mutex::new(Vec::new()))
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `f` every millisecond until it holds or `deadline` passes.
pub fn wait_until(deadline: Duration, f: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    f()
}
