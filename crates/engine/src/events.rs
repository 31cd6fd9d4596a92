//! In-process transaction events
//!
//! The coordinator reports lifecycle changes as [`TransactionEvent`] values
//! delivered to every [`EventObserver`] registered on its [`EventBus`].
//!
//! Delivery is synchronous and fire-and-forget: observers run on the thread
//! that produced the event, after the bus lock has been released, and a
//! panicking observer is logged and skipped.
//!
//! Two observers ship with the crate:
//! - [`ChannelObserver`]: forwards events into a `std::sync::mpsc` channel
//! - [`EventLog`]: records events in memory (tests, diagnostics)

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use strata_concurrency::DeadlockInfo;
use strata_core::{EntityKey, LockMode, TxnId};
use tracing::error;

use crate::context::{TransactionMode, TransactionStatus};
use crate::metrics::TransactionMetrics;
use crate::saga::panic_message;

/// Something the coordinator did
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    /// `transaction:started`
    Started {
        /// Transaction
        txn_id: TxnId,
        /// Mode
        mode: TransactionMode,
    },
    /// `transaction:committed`
    Committed {
        /// Transaction
        txn_id: TxnId,
        /// Time since begin
        duration: Duration,
        /// Operations executed
        operation_count: usize,
    },
    /// `transaction:rolled_back`
    RolledBack {
        /// Transaction
        txn_id: TxnId,
        /// Rollback reason
        reason: String,
        /// Terminal status reached
        status: TransactionStatus,
        /// Compensations that failed
        compensation_failures: usize,
    },
    /// `lock:acquired`
    LockAcquired {
        /// Owner
        txn_id: TxnId,
        /// Entity
        key: EntityKey,
        /// Mode
        mode: LockMode,
        /// Time spent waiting
        waited: Duration,
    },
    /// `lock:released`
    LockReleased {
        /// Former owner
        txn_id: TxnId,
        /// Entity
        key: EntityKey,
        /// Mode
        mode: LockMode,
    },
    /// `deadlock:detected`
    DeadlockDetected(DeadlockInfo),
    /// `compensation:executed`
    CompensationExecuted {
        /// Transaction
        txn_id: TxnId,
        /// Compensation id
        compensation_id: u64,
        /// Operation it undid
        operation_id: u64,
        /// Description
        description: String,
    },
    /// `compensation:failed`
    CompensationFailed {
        /// Transaction
        txn_id: TxnId,
        /// Compensation id
        compensation_id: u64,
        /// Operation it tried to undo
        operation_id: u64,
        /// Description
        description: String,
        /// Error text
        error: String,
    },
    /// `transaction:metrics`
    Metrics(TransactionMetrics),
}

impl TransactionEvent {
    /// Event name in `domain:action` form
    pub fn name(&self) -> &'static str {
        match self {
            TransactionEvent::Started { .. } => "transaction:started",
            TransactionEvent::Committed { .. } => "transaction:committed",
            TransactionEvent::RolledBack { .. } => "transaction:rolled_back",
            TransactionEvent::LockAcquired { .. } => "lock:acquired",
            TransactionEvent::LockReleased { .. } => "lock:released",
            TransactionEvent::DeadlockDetected(_) => "deadlock:detected",
            TransactionEvent::CompensationExecuted { .. } => "compensation:executed",
            TransactionEvent::CompensationFailed { .. } => "compensation:failed",
            TransactionEvent::Metrics(_) => "transaction:metrics",
        }
    }

    /// Transaction the event is about (deadlocks involve several: `None`)
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            TransactionEvent::Started { txn_id, .. }
            | TransactionEvent::Committed { txn_id, .. }
            | TransactionEvent::RolledBack { txn_id, .. }
            | TransactionEvent::LockAcquired { txn_id, .. }
            | TransactionEvent::LockReleased { txn_id, .. }
            | TransactionEvent::CompensationExecuted { txn_id, .. }
            | TransactionEvent::CompensationFailed { txn_id, .. } => Some(*txn_id),
            TransactionEvent::Metrics(metrics) => Some(metrics.txn_id),
            TransactionEvent::DeadlockDetected(_) => None,
        }
    }
}

/// Receiver of coordinator events
pub trait EventObserver: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &TransactionEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&TransactionEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransactionEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Fan-out of events to registered observers
pub struct EventBus {
    observers: RwLock<Vec<(ObserverId, Arc<dyn EventObserver>)>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
}

impl EventBus {
    /// Create a bus with no observers
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        }
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Events emitted since creation
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Deliver `event` to every observer
    pub fn emit(&self, event: TransactionEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let observers: Vec<Arc<dyn EventObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                error!(
                    target: "strata::txn",
                    event = event.name(),
                    "event observer panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .field("emitted", &self.emitted())
            .finish()
    }
}

/// Forwards events into an mpsc channel
pub struct ChannelObserver {
    sender: Mutex<mpsc::Sender<TransactionEvent>>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel
    pub fn new() -> (Self, mpsc::Receiver<TransactionEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &TransactionEvent) {
        // A dropped receiver just means nobody listens any more
        let _ = self.sender.lock().send(event.clone());
    }
}

/// Records every event in memory
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<TransactionEvent>>,
}

impl EventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far
    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().clone()
    }

    /// Events with the given name
    pub fn named(&self, name: &str) -> Vec<TransactionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Number of events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Events about one transaction
    pub fn for_txn(&self, txn_id: TxnId) -> Vec<TransactionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.txn_id() == Some(txn_id))
            .cloned()
            .collect()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventObserver for EventLog {
    fn on_event(&self, event: &TransactionEvent) {
        self.events.lock().push(event.clone());
    }
}
