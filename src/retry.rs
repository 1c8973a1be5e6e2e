//! Bounded retry with exponential backoff for transient storage failures.
//!
//! Retry state lives entirely in the call: each invocation of [`RetryPolicy::run`]
//! or [`RetryPolicy::run_blocking`] counts its own attempts. Only errors for
//! which [`Error::is_transient`] holds are retried.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Backoff parameters for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles thereafter.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    /// A policy that never waits. Useful for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Run an async operation, retrying transient failures.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => match self.next_delay(operation, attempt, attempts, e) {
                    Ok(delay) => tokio::time::sleep(delay).await,
                    Err(e) => return Err(e),
                },
            }
            attempt += 1;
        }
    }

    /// Run a synchronous operation, retrying transient failures.
    ///
    /// Blocks the calling thread between attempts.
    pub fn run_blocking<F, T>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => match self.next_delay(operation, attempt, attempts, e) {
                    Ok(delay) => std::thread::sleep(delay),
                    Err(e) => return Err(e),
                },
            }
            attempt += 1;
        }
    }

    /// Decide whether a failed attempt is retried. Returns the delay, or the
    /// error to surface.
    fn next_delay(&self, operation: &str, attempt: u32, attempts: u32, err: Error) -> Result<Duration> {
        if !err.is_transient() {
            return Err(err);
        }
        if attempt + 1 >= attempts {
            error!(operation, attempts, error = %err, "retries exhausted");
            return Err(err);
        }
        let delay = self.delay_for(attempt);
        warn!(
            operation,
            attempt = attempt + 1,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "storage busy, retrying"
        );
        Ok(delay)
    }
}
