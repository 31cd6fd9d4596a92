//! Errors returned by `execute`

use strata_core::StrataError;
use thiserror::Error;

use crate::saga::CompensationReport;

/// Failure of an `execute` call
///
/// `error` is the first failure; compensation failures never replace it and
/// are reported in `compensation` instead.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct ExecuteError {
    /// First failure
    pub error: StrataError,
    /// Index (within the batch) of the operation that failed, if one did
    pub failed_index: Option<usize>,
    /// What the automatic rollback did
    pub compensation: CompensationReport,
}

impl ExecuteError {
    /// An error raised before any operation ran (nothing to compensate)
    pub fn new(error: StrataError) -> Self {
        Self {
            error,
            failed_index: None,
            compensation: CompensationReport::default(),
        }
    }

    /// True if at least one compensation failed
    pub fn is_partial_compensation(&self) -> bool {
        self.compensation.is_partial()
    }

    /// Short stable name of the underlying error kind
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

impl From<StrataError> for ExecuteError {
    fn from(error: StrataError) -> Self {
        Self::new(error)
    }
}

impl From<ExecuteError> for StrataError {
    fn from(e: ExecuteError) -> Self {
        e.error
    }
}
