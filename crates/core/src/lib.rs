//! Core types for Strata transaction coordination
//!
//! This crate defines the foundational types used throughout the system:
//! - TxnId: Unique identifier for coordinated transactions
//! - EntityKey: (table, entity id) addressing, the unit of contention
//! - LockMode: Advisory lock compatibility classes
//! - Row / Patch: Versioned rows exchanged with the row store
//! - StrataError: Error taxonomy (NotFound, Conflict, QuotaExceeded, Timeout,
//!   ValidationError, Internal)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Conflict, StrataError, StrataResult};
pub use types::{patch_from, EntityKey, LockMode, Patch, Row, TxnId};

// JSON values are the payload type for rows and operation results
pub use serde_json::Value;
