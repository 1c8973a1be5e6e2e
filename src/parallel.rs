//! Bounded parallel execution of independent sub-calls.
//!
//! - Concurrency is capped by a semaphore
//! - Each call may carry a timeout
//! - A failed or timed-out call becomes a failure entry; siblings keep running
//! - Results come back in input order
//!
//! # Example
//!
//! ```rust,ignore
//! use cortex_memory::parallel::ParallelExecutor;
//!
//! let executor = ParallelExecutor::new()
//!     .with_max_concurrency(3)
//!     .with_task_timeout(Duration::from_secs(5));
//!
//! let results = executor
//!     .execute(vec!["a", "b"], |q| async move { lookup(q).await })
//!     .await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{Error, Result};

/// Default maximum concurrent calls.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Outcome of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResult<T> {
    /// Position in the input
    pub index: usize,
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl<T> SubResult<T> {
    pub fn success(index: usize, value: T, elapsed_ms: u64) -> Self {
        Self {
            index,
            success: true,
            value: Some(value),
            error: None,
            elapsed_ms,
        }
    }

    pub fn failure(index: usize, error: String, elapsed_ms: u64) -> Self {
        Self {
            index,
            success: false,
            value: None,
            error: Some(error),
            elapsed_ms,
        }
    }
}

/// All outcomes of an [`ParallelExecutor::execute`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelResults<T> {
    /// Results in input order
    pub results: Vec<SubResult<T>>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl<T> ParallelResults<T> {
    pub fn from_results(mut results: Vec<SubResult<T>>) -> Self {
        results.sort_by_key(|r| r.index);
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        Self {
            results,
            success_count,
            failure_count,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    /// Values in input order, `None` where the call failed.
    pub fn values(&self) -> Vec<Option<&T>> {
        self.results.iter().map(|r| r.value.as_ref()).collect()
    }

    /// Consume into values in input order.
    pub fn into_values(self) -> Vec<Option<T>> {
        self.results.into_iter().map(|r| r.value).collect()
    }

    /// `(index, message)` for each failed call.
    pub fn errors(&self) -> Vec<(usize, &str)> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_deref().map(|e| (r.index, e)))
            .collect()
    }
}

/// Runs independent async calls with a concurrency cap and per-call timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelExecutor {
    pub max_concurrency: usize,
    pub task_timeout_ms: Option<u64>,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            task_timeout_ms: None,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Run `f` over every input and collect the outcomes in input order.
    pub async fn execute<I, T, F, Fut>(&self, inputs: Vec<I>, f: F) -> ParallelResults<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let timeout = self.task_timeout_ms.map(Duration::from_millis);
        let f = &f;

        let tasks = inputs.into_iter().enumerate().map(|(index, input)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => return SubResult::failure(index, e.to_string(), 0),
                };
                let started = Instant::now();
                let outcome = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, f(input)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::timeout(limit.as_millis() as u64)),
                    },
                    None => f(input).await,
                };
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(value) => SubResult::success(index, value, elapsed_ms),
                    Err(e) => {
                        warn!(index, error = %e, "parallel call failed");
                        SubResult::failure(index, e.to_string(), elapsed_ms)
                    }
                }
            }
        });

        ParallelResults::from_results(join_all(tasks).await)
    }
}
