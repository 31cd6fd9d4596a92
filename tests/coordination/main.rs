//! Coordination Integration Tests
//!
//! End-to-end guarantees of the transaction coordinator: lifecycle,
//! compensation, optimistic concurrency, advisory locking, timeouts and
//! deadlock resolution.

#[path = "../common/mod.rs"]
mod common;

mod compensation;
mod config_file;
mod deadlock;
mod lifecycle;
mod locking;
mod optimistic;
mod saga;
mod timeouts;
