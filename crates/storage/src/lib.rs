//! Storage layer for Strata coordination
//!
//! This crate defines the row store the coordinator runs on top of:
//! - RowStore: point get/insert/update/delete contract with an optional
//!   expected-version precondition on update
//! - StoreError: tagged failures (not found, version conflict, constraint
//!   violation, other)
//! - MemoryStore: DashMap-backed implementation with a version column

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{RowStore, StoreError, StoreResult};
