//! Coordinator configuration via `coordinator.toml`
//!
//! `CoordinatorConfig` holds the process-wide knobs (quota, timeouts,
//! background sweep intervals, retry defaults). It can be built in code,
//! parsed from a TOML string, or loaded from a file. Every load path
//! validates the values before handing the config out.
//!
//! Per-call settings (mode, isolation level, timeout override, label) live
//! in [`TransactionOptions`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strata_concurrency::RetryPolicy;
use strata_core::{StrataError, StrataResult};

use crate::context::{IsolationLevel, TransactionMode};

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "coordinator.toml";

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry behavior for retryable operations and optimistic updates
///
/// # Example
/// ```ignore
/// let retry = RetryConfig::default().with_max_retries(5).with_base_delay_ms(10);
/// let policy = retry.policy();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Add random jitter up to the base delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Defaults for distributed-mode transactions: more retries, slower backoff
    pub fn distributed_default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the retry policy this config describes
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_retries(self.max_retries, self.base_delay_ms, self.max_delay_ms)
            .with_jitter(self.jitter)
    }

    fn validate(&self, section: &str) -> StrataResult<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(StrataError::validation(format!(
                "[{}] base_delay_ms ({}) exceeds max_delay_ms ({})",
                section, self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Coordinator Configuration
// ============================================================================

/// Coordinator configuration
///
/// # Example
///
/// ```toml
/// max_concurrent_transactions = 100
/// default_timeout_ms = 30000
/// enable_deadlock_detection = true
///
/// [retry]
/// max_retries = 3
/// base_delay_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Ceiling on live (non-terminal) transactions
    pub max_concurrent_transactions: usize,
    /// Default transaction timeout in milliseconds
    pub default_timeout_ms: u64,
    /// Default timeout for distributed-mode transactions in milliseconds
    pub distributed_timeout_ms: u64,
    /// Run the periodic deadlock detector
    pub enable_deadlock_detection: bool,
    /// Deadlock detector interval in milliseconds
    pub deadlock_check_interval_ms: u64,
    /// Timeout watchdog interval in milliseconds
    pub timeout_sweep_interval_ms: u64,
    /// Build and emit per-transaction metrics
    pub enable_metrics: bool,
    /// Acquire declared advisory locks (when false they are only recorded)
    pub enable_optimistic_locking: bool,
    /// How long committed transactions stay queryable before eviction
    pub eviction_grace_ms: u64,
    /// Lifetime of advisory locks that do not set their own timeout
    pub default_lock_timeout_ms: u64,
    /// Retry defaults
    pub retry: RetryConfig,
    /// Retry defaults for distributed-mode transactions
    pub distributed_retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transactions: 100,
            default_timeout_ms: 30_000,
            distributed_timeout_ms: 60_000,
            enable_deadlock_detection: true,
            deadlock_check_interval_ms: 1000,
            timeout_sweep_interval_ms: 100,
            enable_metrics: true,
            enable_optimistic_locking: true,
            eviction_grace_ms: 5000,
            default_lock_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            distributed_retry: RetryConfig::distributed_default(),
        }
    }
}

impl CoordinatorConfig {
    /// Set the live transaction ceiling
    pub fn with_max_concurrent_transactions(mut self, max: usize) -> Self {
        self.max_concurrent_transactions = max;
        self
    }

    /// Set the default transaction timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable the deadlock detector
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.enable_deadlock_detection = enabled;
        self
    }

    /// Set the deadlock detector interval
    pub fn with_deadlock_check_interval(mut self, interval: Duration) -> Self {
        self.deadlock_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the timeout watchdog interval
    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the post-commit eviction grace period
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Enable or disable metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Enable or disable advisory lock acquisition
    pub fn with_optimistic_locking(mut self, enabled: bool) -> Self {
        self.enable_optimistic_locking = enabled;
        self
    }

    /// Replace the retry defaults
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the retry defaults for distributed transactions
    pub fn with_distributed_retry(mut self, retry: RetryConfig) -> Self {
        self.distributed_retry = retry;
        self
    }

    /// Default timeout for a transaction of `mode`
    pub fn timeout_for(&self, mode: TransactionMode) -> Duration {
        match mode {
            TransactionMode::Distributed => Duration::from_millis(self.distributed_timeout_ms),
            _ => Duration::from_millis(self.default_timeout_ms),
        }
    }

    /// Retry policy for a transaction of `mode`
    pub fn retry_policy_for(&self, mode: TransactionMode) -> RetryPolicy {
        match mode {
            TransactionMode::Distributed => self.distributed_retry.policy(),
            _ => self.retry.policy(),
        }
    }

    /// Deadlock detector interval
    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_check_interval_ms)
    }

    /// Timeout watchdog interval
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    /// Post-commit eviction grace period
    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    /// Default advisory lock lifetime
    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.default_lock_timeout_ms)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first offending key.
    pub fn validate(&self) -> StrataResult<()> {
        let positive = [
            ("default_timeout_ms", self.default_timeout_ms),
            ("distributed_timeout_ms", self.distributed_timeout_ms),
            ("deadlock_check_interval_ms", self.deadlock_check_interval_ms),
            ("timeout_sweep_interval_ms", self.timeout_sweep_interval_ms),
            ("default_lock_timeout_ms", self.default_lock_timeout_ms),
        ];
        if self.max_concurrent_transactions == 0 {
            return Err(StrataError::validation(
                "max_concurrent_transactions must be at least 1",
            ));
        }
        for (name, value) in positive {
            if value == 0 {
                return Err(StrataError::validation(format!("{} must be positive", name)));
            }
        }
        self.retry.validate("retry")?;
        self.distributed_retry.validate("distributed_retry")
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Strata coordinator configuration

# Maximum number of live (not yet committed or aborted) transactions
max_concurrent_transactions = 100

# Transaction timeouts in milliseconds
default_timeout_ms = 30000
distributed_timeout_ms = 60000

# Background work
enable_deadlock_detection = true
deadlock_check_interval_ms = 1000
timeout_sweep_interval_ms = 100

# Per-transaction metrics (emitted as events)
enable_metrics = true

# Acquire declared advisory locks. When false, lock requirements are
# recorded on the transaction but never acquired.
enable_optimistic_locking = true

# Committed transactions stay queryable this long before eviction
eviction_grace_ms = 5000

# Lifetime of advisory locks that do not set their own timeout
default_lock_timeout_ms = 30000

[retry]
max_retries = 3
base_delay_ms = 100
max_delay_ms = 5000
jitter = true

[distributed_retry]
max_retries = 5
base_delay_ms = 200
max_delay_ms = 10000
jitter = true
"#
    }

    /// Parse and validate config from TOML text.
    ///
    /// Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> StrataResult<Self> {
        let config: CoordinatorConfig = toml::from_str(content)
            .map_err(|e| StrataError::validation(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: CoordinatorConfig = toml::from_str(&content).map_err(|e| {
            StrataError::validation(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> StrataResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                StrataError::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StrataResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StrataError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            StrataError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

// ============================================================================
// Per-transaction options
// ============================================================================

/// Options passed to `begin`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    /// Execution algorithm
    pub mode: TransactionMode,
    /// Advisory isolation level (recorded, not enforced)
    pub isolation_level: IsolationLevel,
    /// Timeout override; `None` uses the mode's configured default
    pub timeout: Option<Duration>,
    /// Free-form label for logs and snapshots
    pub label: Option<String>,
}

impl TransactionOptions {
    /// Options for the given mode with default isolation and timeout
    pub fn new(mode: TransactionMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Single-domain transaction
    pub fn single_domain() -> Self {
        Self::new(TransactionMode::SingleDomain)
    }

    /// Cross-domain (saga) transaction
    pub fn cross_domain() -> Self {
        Self::new(TransactionMode::CrossDomain)
    }

    /// Distributed (two-phase simulation) transaction
    pub fn distributed() -> Self {
        Self::new(TransactionMode::Distributed)
    }

    /// Compensating transaction
    pub fn compensating() -> Self {
        Self::new(TransactionMode::Compensating)
    }

    /// Set the isolation level
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.max_concurrent_transactions, 100);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert!(config.enable_deadlock_detection);
        assert!(config.enable_optimistic_locking);
        assert_eq!(config.retry.max_retries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_toml_matches_default() {
        let parsed = CoordinatorConfig::from_toml_str(CoordinatorConfig::default_toml()).unwrap();
        assert_eq!(parsed, CoordinatorConfig::default());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CoordinatorConfig::from_toml_str(
            "max_concurrent_transactions = 5\n[retry]\nmax_retries = 9\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrent_transactions, 5);
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CoordinatorConfig::from_toml_str("max_concurrent_transactions = 0").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_transactions"));

        let err = CoordinatorConfig::from_toml_str("[retry]\nbase_delay_ms = 10\nmax_delay_ms = 1")
            .unwrap_err();
        assert!(err.to_string().contains("base_delay_ms"));

        assert!(CoordinatorConfig::from_toml_str("default_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = CoordinatorConfig::default()
            .with_max_concurrent_transactions(7)
            .with_deadlock_detection(false)
            .with_retry(RetryConfig::no_retry());
        config.write_to_file(&path).unwrap();

        let loaded = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_write_default_if_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        CoordinatorConfig::write_default_if_missing(&path).unwrap();
        std::fs::write(&path, "max_concurrent_transactions = 3\n").unwrap();
        CoordinatorConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(
            CoordinatorConfig::from_file(&path)
                .unwrap()
                .max_concurrent_transactions,
            3
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(CoordinatorConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_mode_specific_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(
            config.timeout_for(TransactionMode::Distributed),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            config.timeout_for(TransactionMode::SingleDomain),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            config.retry_policy_for(TransactionMode::Distributed).max_retries(),
            5
        );
        assert_eq!(config.retry_policy_for(TransactionMode::CrossDomain).max_retries(), 3);
    }

    #[test]
    fn test_transaction_options_builder() {
        let options = TransactionOptions::distributed()
            .with_isolation(IsolationLevel::Serializable)
            .with_timeout(Duration::from_millis(50))
            .with_label("transfer");
        assert_eq!(options.mode, TransactionMode::Distributed);
        assert_eq!(options.isolation_level, IsolationLevel::Serializable);
        assert_eq!(options.timeout, Some(Duration::from_millis(50)));
        assert_eq!(options.label.as_deref(), Some("transfer"));
        assert_eq!(TransactionOptions::default().mode, TransactionMode::SingleDomain);
    }
}
