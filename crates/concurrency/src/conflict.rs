//! Version conflict resolution
//!
//! When a guarded update loses a race, the resolver decides what happens
//! next based on the caller's [`ConflictStrategy`]:
//!
//! - **FailFast**: surface the conflict immediately
//! - **RetryAutomatic**: refresh the expected version, back off, retry the same patch
//! - **LastWriterWins**: refresh the expected version and retry at once; the
//!   caller's fields override whatever the other writer stored
//! - **MergeFields**: merge the caller's patch into the current row with
//!   per-field rules, then retry
//! - **ManualResolution**: ask a caller-supplied [`ConflictHandler`] for a
//!   replacement patch, retry once
//!
//! Every conflict is recorded in a bounded per-entity [`ConflictHistory`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use strata_core::{EntityKey, Patch, Row};

/// Maximum conflict records kept per entity
pub const CONFLICT_HISTORY_LIMIT: usize = 100;

/// A lost optimistic race on one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
    /// Entity the update targeted
    pub key: EntityKey,
    /// Version the writer expected
    pub expected: u64,
    /// Version found in the store
    pub current: u64,
}

/// Caller-supplied conflict callback for `ManualResolution`
///
/// Returns a replacement patch to retry with, or `None` to decline (the
/// update then fails with the original conflict).
pub trait ConflictHandler: Send + Sync {
    /// Produce a replacement patch for a conflicting update
    fn resolve(&self, conflict: &VersionConflict, current: &Row, incoming: &Patch)
        -> Option<Patch>;
}

impl<F> ConflictHandler for F
where
    F: Fn(&VersionConflict, &Row, &Patch) -> Option<Patch> + Send + Sync,
{
    fn resolve(
        &self,
        conflict: &VersionConflict,
        current: &Row,
        incoming: &Patch,
    ) -> Option<Patch> {
        self(conflict, current, incoming)
    }
}

/// Custom merge function: (current value if any, incoming value) → merged value
pub type MergeFn = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

/// How to merge one field when both writers touched the row
#[derive(Clone)]
pub enum MergeStrategy {
    /// Keep the stored value, drop the caller's value
    KeepCurrent,
    /// Take the caller's value
    KeepIncoming,
    /// Set-like union of two arrays (stored order first, duplicates dropped)
    MergeArrays,
    /// Arbitrary merge function
    Custom(MergeFn),
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::KeepCurrent => f.write_str("KeepCurrent"),
            MergeStrategy::KeepIncoming => f.write_str("KeepIncoming"),
            MergeStrategy::MergeArrays => f.write_str("MergeArrays"),
            MergeStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Merge rule for a single top-level field
#[derive(Debug, Clone)]
pub struct FieldMergeRule {
    /// Field name
    pub field: String,
    /// Strategy for that field
    pub strategy: MergeStrategy,
}

impl FieldMergeRule {
    /// Create a rule
    pub fn new(field: impl Into<String>, strategy: MergeStrategy) -> Self {
        Self {
            field: field.into(),
            strategy,
        }
    }

    /// Keep the stored value for `field`
    pub fn keep_current(field: impl Into<String>) -> Self {
        Self::new(field, MergeStrategy::KeepCurrent)
    }

    /// Take the caller's value for `field`
    pub fn keep_incoming(field: impl Into<String>) -> Self {
        Self::new(field, MergeStrategy::KeepIncoming)
    }

    /// Union arrays for `field`
    pub fn merge_arrays(field: impl Into<String>) -> Self {
        Self::new(field, MergeStrategy::MergeArrays)
    }

    /// Custom merge for `field`
    pub fn custom<F>(field: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Value + Send + Sync + 'static,
    {
        Self::new(field, MergeStrategy::Custom(Arc::new(f)))
    }
}

/// What to do when an optimistic update loses a race
#[derive(Clone, Default)]
pub enum ConflictStrategy {
    /// Return the conflict immediately
    #[default]
    FailFast,
    /// Refresh the expected version and retry with backoff
    RetryAutomatic,
    /// Refresh the expected version and retry at once; caller's fields win
    LastWriterWins,
    /// Merge with per-field rules, then retry (unlisted fields: incoming wins)
    MergeFields(Vec<FieldMergeRule>),
    /// Hand the conflict to a callback, retry once with its patch
    ManualResolution(Arc<dyn ConflictHandler>),
}

impl ConflictStrategy {
    /// Build a manual-resolution strategy from a closure
    pub fn manual<F>(handler: F) -> Self
    where
        F: Fn(&VersionConflict, &Row, &Patch) -> Option<Patch> + Send + Sync + 'static,
    {
        ConflictStrategy::ManualResolution(Arc::new(handler))
    }

    /// Stable lowercase name, used in logs and the conflict history
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::FailFast => "fail_fast",
            ConflictStrategy::RetryAutomatic => "retry_automatic",
            ConflictStrategy::LastWriterWins => "last_writer_wins",
            ConflictStrategy::MergeFields(_) => "merge_fields",
            ConflictStrategy::ManualResolution(_) => "manual_resolution",
        }
    }

    /// Whether retries of this strategy sleep between attempts
    pub fn backs_off(&self) -> bool {
        matches!(
            self,
            ConflictStrategy::RetryAutomatic | ConflictStrategy::MergeFields(_)
        )
    }

    /// Whether this strategy gets at most one retry regardless of the budget
    pub fn single_retry(&self) -> bool {
        matches!(self, ConflictStrategy::ManualResolution(_))
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::MergeFields(rules) => {
                f.debug_tuple("MergeFields").field(rules).finish()
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Decision for one conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Give up and surface the conflict
    Fail,
    /// Retry with this patch against this version
    Retry {
        /// Patch to send
        patch: Patch,
        /// Refreshed expected version
        expected_version: u64,
    },
}

/// Stateless strategy dispatcher
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Create a resolver
    pub fn new() -> Self {
        Self
    }

    /// Decide how to continue after `conflict`
    ///
    /// `current` is the row as stored right now; `incoming` is the patch
    /// that lost the race.
    pub fn resolve(
        &self,
        strategy: &ConflictStrategy,
        conflict: &VersionConflict,
        current: &Row,
        incoming: &Patch,
    ) -> Resolution {
        match strategy {
            ConflictStrategy::FailFast => Resolution::Fail,
            ConflictStrategy::RetryAutomatic => Resolution::Retry {
                patch: incoming.clone(),
                expected_version: current.version,
            },
            ConflictStrategy::LastWriterWins => Resolution::Retry {
                patch: overlay(current, incoming),
                expected_version: current.version,
            },
            ConflictStrategy::MergeFields(rules) => Resolution::Retry {
                patch: merge_fields(current, incoming, rules),
                expected_version: current.version,
            },
            ConflictStrategy::ManualResolution(handler) => {
                match handler.resolve(conflict, current, incoming) {
                    Some(patch) => Resolution::Retry {
                        patch,
                        expected_version: current.version,
                    },
                    None => Resolution::Fail,
                }
            }
        }
    }
}

/// Full row image: current fields overridden by every incoming field
fn overlay(current: &Row, incoming: &Patch) -> Patch {
    let mut image = current.to_patch();
    for (field, value) in incoming {
        image.insert(field.clone(), value.clone());
    }
    image
}

/// Merge `incoming` into `current` field by field
///
/// Only fields present in `incoming` are considered. Fields without a rule
/// take the incoming value. A `KeepCurrent` field is left out of the merged
/// patch so the stored value survives.
pub fn merge_fields(current: &Row, incoming: &Patch, rules: &[FieldMergeRule]) -> Patch {
    let mut merged = Patch::new();
    for (field, incoming_value) in incoming {
        let strategy = rules
            .iter()
            .find(|rule| rule.field == *field)
            .map(|rule| &rule.strategy)
            .unwrap_or(&MergeStrategy::KeepIncoming);
        let current_value = current.get(field);

        match strategy {
            MergeStrategy::KeepCurrent => {}
            MergeStrategy::KeepIncoming => {
                merged.insert(field.clone(), incoming_value.clone());
            }
            MergeStrategy::MergeArrays => {
                merged.insert(field.clone(), union_arrays(current_value, incoming_value));
            }
            MergeStrategy::Custom(f) => {
                merged.insert(field.clone(), f(current_value, incoming_value));
            }
        }
    }
    merged
}

fn union_arrays(current: Option<&Value>, incoming: &Value) -> Value {
    match (current, incoming) {
        (Some(Value::Array(stored)), Value::Array(new)) => {
            let mut out = stored.clone();
            for item in new {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        _ => incoming.clone(),
    }
}

/// One recorded conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// Entity the conflict occurred on
    pub key: EntityKey,
    /// Version the writer expected
    pub expected: u64,
    /// Version that was stored
    pub current: u64,
    /// Strategy in force (`ConflictStrategy::name`)
    pub strategy: &'static str,
    /// When the conflict was observed
    pub at: DateTime<Utc>,
}

/// Bounded per-entity conflict log for diagnostics
#[derive(Debug, Default)]
pub struct ConflictHistory {
    entries: DashMap<EntityKey, VecDeque<ConflictRecord>>,
}

impl ConflictHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a conflict, evicting the oldest entry beyond the limit
    pub fn record(&self, conflict: &VersionConflict, strategy: &ConflictStrategy) {
        let mut log = self.entries.entry(conflict.key.clone()).or_default();
        log.push_back(ConflictRecord {
            key: conflict.key.clone(),
            expected: conflict.expected,
            current: conflict.current,
            strategy: strategy.name(),
            at: Utc::now(),
        });
        while log.len() > CONFLICT_HISTORY_LIMIT {
            log.pop_front();
        }
    }

    /// Conflicts recorded for `key`, oldest first
    pub fn for_entity(&self, key: &EntityKey) -> Vec<ConflictRecord> {
        self.entries
            .get(key)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total conflicts currently retained across all entities
    pub fn total(&self) -> usize {
        self.entries.iter().map(|log| log.len()).sum()
    }

    /// Drop the history of one entity
    pub fn clear(&self, key: &EntityKey) {
        self.entries.remove(key);
    }
}
