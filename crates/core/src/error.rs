//! Error types for transaction coordination
//!
//! Every failure crossing the coordinator boundary is one of six kinds:
//! `NotFound`, `Conflict` (version or lock), `QuotaExceeded`, `Timeout`,
//! `ValidationError` and `Internal`. Errors are returned, never panicked.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::{EntityKey, LockMode, TxnId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for coordination operations
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// Why two parties could not both proceed on the same entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Stored version differs from the version the writer read
    Version {
        /// Entity the update targeted
        key: EntityKey,
        /// Version the writer expected
        expected: u64,
        /// Version currently stored
        current: u64,
    },
    /// An incompatible advisory lock is held by another transaction
    Lock {
        /// Entity the lock was requested on
        key: EntityKey,
        /// Mode that was requested
        requested: LockMode,
        /// Transaction holding the incompatible lock, if known
        holder: Option<TxnId>,
    },
}

impl Conflict {
    /// Entity the conflict occurred on
    pub fn key(&self) -> &EntityKey {
        match self {
            Conflict::Version { key, .. } | Conflict::Lock { key, .. } => key,
        }
    }

    /// Current stored version for version conflicts
    pub fn current_version(&self) -> Option<u64> {
        match self {
            Conflict::Version { current, .. } => Some(*current),
            Conflict::Lock { .. } => None,
        }
    }
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conflict::Version {
                key,
                expected,
                current,
            } => write!(
                f,
                "version conflict on {}: expected {}, current {}",
                key, expected, current
            ),
            Conflict::Lock {
                key,
                requested,
                holder: Some(holder),
            } => write!(
                f,
                "lock conflict on {}: {} lock blocked by transaction {}",
                key, requested, holder
            ),
            Conflict::Lock {
                key,
                requested,
                holder: None,
            } => write!(f, "lock conflict on {}: {} lock unavailable", key, requested),
        }
    }
}

/// Error taxonomy for the coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    /// Transaction, row or lock does not exist (or is no longer live)
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing thing
        what: String,
    },

    /// Version or lock conflict
    #[error("Conflict: {0}")]
    Conflict(Conflict),

    /// Live transaction ceiling reached
    #[error("Quota exceeded: {active} live transactions (limit {limit})")]
    QuotaExceeded {
        /// Live transactions at the time of the request
        active: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Deadline passed before the work completed
    #[error("Timeout after {elapsed:?}: {message}")]
    Timeout {
        /// What timed out
        message: String,
        /// How long we waited
        elapsed: Duration,
    },

    /// Caller supplied something invalid (bad state, bad config, bad input)
    #[error("Validation error: {message}")]
    ValidationError {
        /// Human-readable description
        message: String,
    },

    /// Unexpected internal or storage failure
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable description
        message: String,
    },
}

impl StrataError {
    /// Create a new not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        StrataError::NotFound { what: what.into() }
    }

    /// Create a not-found error for a transaction id
    pub fn txn_not_found(txn_id: TxnId) -> Self {
        StrataError::NotFound {
            what: format!("transaction {}", txn_id),
        }
    }

    /// Create a version conflict
    pub fn version_conflict(key: EntityKey, expected: u64, current: u64) -> Self {
        StrataError::Conflict(Conflict::Version {
            key,
            expected,
            current,
        })
    }

    /// Create a lock conflict
    pub fn lock_conflict(key: EntityKey, requested: LockMode, holder: Option<TxnId>) -> Self {
        StrataError::Conflict(Conflict::Lock {
            key,
            requested,
            holder,
        })
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>, elapsed: Duration) -> Self {
        StrataError::Timeout {
            message: message.into(),
            elapsed,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        StrataError::ValidationError {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        StrataError::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a version or lock conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StrataError::Conflict(_))
    }

    /// Whether this is a version conflict specifically
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StrataError::Conflict(Conflict::Version { .. }))
    }

    /// Whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound { .. })
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StrataError::Timeout { .. })
    }

    /// Default retry classification: conflicts and timeouts are transient,
    /// everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Conflict(_) | StrataError::Timeout { .. })
    }

    /// The conflict payload, if this is a conflict
    pub fn as_conflict(&self) -> Option<&Conflict> {
        match self {
            StrataError::Conflict(c) => Some(c),
            _ => None,
        }
    }

    /// Short stable name of the error kind (used in events and logs)
    pub fn kind(&self) -> &'static str {
        match self {
            StrataError::NotFound { .. } => "not_found",
            StrataError::Conflict(_) => "conflict",
            StrataError::QuotaExceeded { .. } => "quota_exceeded",
            StrataError::Timeout { .. } => "timeout",
            StrataError::ValidationError { .. } => "validation",
            StrataError::Internal { .. } => "internal",
        }
    }
}

impl From<Conflict> for StrataError {
    fn from(conflict: Conflict) -> Self {
        StrataError::Conflict(conflict)
    }
}
