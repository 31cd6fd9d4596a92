//! Retry policy with bounded exponential backoff
//!
//! Runs a unit of work until it succeeds, fails with an error the caller
//! classifies as non-retryable, or the attempt budget runs out. Between
//! attempts the calling thread sleeps for
//! `base × 2^(attempt−1)` (capped at `max_delay`) plus a random jitter in
//! `[0, base]`.
//!
//! # Example
//! ```ignore
//! let policy = RetryPolicy::new(5, Duration::from_millis(10));
//! let row = policy.run(|| store.update(..), |e| e.is_conflict())?;
//! ```

use rand::Rng;
use std::time::Duration;

/// Retry configuration
///
/// `max_attempts` counts the first try: a policy with `max_attempts = 1`
/// never retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, first try included (minimum 1)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay
    pub max_delay: Duration,
    /// Add random jitter in `[0, base_delay]` to every delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            jitter: true,
        }
    }
}

/// Result of a retried unit of work together with how many attempts it took
#[derive(Debug)]
pub struct Retried<T, E> {
    /// Final result (last error if every attempt failed)
    pub result: Result<T, E>,
    /// Attempts made, first try included
    pub attempts: u32,
}

impl<T, E> Retried<T, E> {
    /// Attempts beyond the first one
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and base delay
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Create a policy from a retry count (attempts = retries + 1) and millisecond delays
    pub fn from_retries(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            jitter: true,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the upper bound of the exponential part
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Exponential part of the delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        // Cap the shift to prevent overflow
        let shift = attempt.saturating_sub(1).min(31);
        let multiplier = 1u32 << shift;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full delay (backoff plus jitter) after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if !self.jitter || self.base_delay.is_zero() {
            return backoff;
        }
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms);
        backoff + Duration::from_millis(jitter_ms)
    }

    /// Run `op` with retries, returning the final result
    pub fn run<T, E, F, P>(&self, op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        self.run_counted(op, is_retryable).result
    }

    /// Run `op` with retries, returning the result and the attempt count
    pub fn run_counted<T, E, F, P>(&self, op: F, is_retryable: P) -> Retried<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        self.run_interruptible(op, is_retryable, || false)
    }

    /// Run `op` with retries, giving up early once `interrupted` returns true
    ///
    /// `interrupted` is checked before every retry (never before the first
    /// attempt). When it fires, the last error is returned.
    pub fn run_interruptible<T, E, F, P, C>(
        &self,
        mut op: F,
        is_retryable: P,
        interrupted: C,
    ) -> Retried<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        C: Fn() -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if attempt < max_attempts && is_retryable(&e) && !interrupted() => {
                    std::thread::sleep(self.delay_for(attempt));
                    attempt += 1;
                }
                Err(e) => {
                    return Retried {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
