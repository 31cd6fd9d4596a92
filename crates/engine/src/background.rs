//! Periodic background workers
//!
//! The coordinator runs its timeout watchdog and deadlock detector on named
//! threads. Each worker holds only a `Weak` reference to its target, so a
//! dropped coordinator is never kept alive by its own sweepers: the worker
//! exits the next time it fails to upgrade.
//!
//! Workers sleep on a condvar, so `shutdown` wakes them immediately instead
//! of waiting out the interval.

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

use crate::saga::panic_message;

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// A set of periodic worker threads sharing one shutdown signal
pub struct BackgroundWorkers {
    signal: Arc<Signal>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundWorkers {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            signal: Arc::new(Signal::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `tick` against `target` every `interval` until shutdown or until
    /// `target` is dropped
    ///
    /// A panicking tick is logged and the worker keeps going.
    pub fn spawn_periodic<T>(
        &self,
        name: &str,
        interval: Duration,
        target: Weak<T>,
        tick: fn(&T),
    ) where
        T: Send + Sync + 'static,
    {
        let signal = Arc::clone(&self.signal);
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    {
                        let mut stopped = signal.stopped.lock();
                        if !*stopped {
                            signal.wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    let Some(target) = target.upgrade() else {
                        break;
                    };
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| tick(&target))) {
                        error!(
                            target: "strata::txn",
                            worker = %thread_name,
                            "background worker panicked: {}",
                            panic_message(panic.as_ref())
                        );
                    }
                }
                debug!(target: "strata::txn", worker = %thread_name, "Background worker stopped");
            })
            .expect("failed to spawn background worker thread");
        self.handles.lock().push(handle);
    }

    /// Number of spawned workers not yet joined
    pub fn worker_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether shutdown was requested
    pub fn is_stopped(&self) -> bool {
        *self.signal.stopped.lock()
    }

    /// Signal every worker to stop and join them
    ///
    /// Idempotent. When called from one of the workers themselves (the last
    /// reference to the target dropped inside a tick), that worker is
    /// detached instead of joined.
    pub fn shutdown(&self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.wake.notify_all();
        }

        let current = std::thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Default for BackgroundWorkers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BackgroundWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorkers")
            .field("workers", &self.worker_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
