//! Transaction coordination engine for Strata
//!
//! This crate orchestrates the lower layers into transactions:
//! - TransactionCoordinator: begin / execute / commit / rollback
//! - TransactionContext: state machine, operation log, compensation stack
//! - ContextStore: concurrent registry of live contexts
//! - Mode executors: single-domain, cross-domain (saga), distributed,
//!   compensating
//! - SagaExecutor: standalone (action, compensation) step runner
//! - RowOps: store-backed operations with automatic undo commands
//! - EventBus / MetricsCollector: lifecycle events and per-transaction metrics
//! - Background workers: timeout watchdog and deadlock detector
//!
//! The engine is the only component that knows about:
//! - Transaction lifecycle and modes
//! - Cross-layer coordination (store + locks + compensation)
//! - Cancellation of in-flight work

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod operation;
pub mod ops;
pub mod registry;
pub mod saga;

pub use background::BackgroundWorkers;
pub use config::{CoordinatorConfig, RetryConfig, TransactionOptions, CONFIG_FILE_NAME};
pub use context::{
    CompensationRecord, CompensationStatus, IsolationLevel, LockSummary, OperationStatus,
    OperationType, StatusCell, TransactionContext, TransactionMode, TransactionOperation,
    TransactionSnapshot, TransactionStatus,
};
pub use coordinator::TransactionCoordinator;
pub use error::ExecuteError;
pub use events::{
    ChannelObserver, EventBus, EventLog, EventObserver, ObserverId, TransactionEvent,
};
pub use executor::unwind_order;
pub use metrics::{CoordinatorStats, MetricsCollector, TransactionMetrics};
pub use operation::{
    ActionFn, Applied, CompensateFn, Compensation, LockRequirement, Operation, OperationAction,
    OperationScope, RetryableFn, ScopedFn, UndoCommand,
};
pub use ops::RowOps;
pub use registry::{ContextEntry, ContextStore, ARCHIVE_LIMIT};
pub use saga::{
    CompensationFailure, CompensationOutcome, CompensationReport, PendingCompensation,
    SagaExecutor, SagaFailure, SagaStep, UnwindOrder,
};
