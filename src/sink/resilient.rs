use async_trait::async_trait;
use std::future::Future;
use tracing::{debug, error, warn};

use crate::data::ResultSink;
use crate::engine::{OutcomeRow, RunStatistics};
use crate::error::{BacktestError, Result};

use super::breaker::CircuitBreaker;
use super::retry::RetryPolicy;

/// Wraps a sink with retries and a circuit breaker. Exhausted retries come
/// back as `BacktestError::Persistence`.
pub struct ResilientSink<S> {
    inner: S,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl<S: ResultSink> ResilientSink<S> {
    pub fn new(inner: S, retry: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            retry,
            breaker,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if !self.breaker.allows_request() {
                error!("{} refused: result sink circuit is open", operation);
                return Err(BacktestError::Persistence {
                    attempts: attempt - 1,
                    reason: if last_error.is_empty() {
                        "circuit open".to_string()
                    } else {
                        format!("circuit open after: {}", last_error)
                    },
                });
            }

            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                            operation, attempt, self.retry.max_attempts, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            "{} failed after {} attempt(s): {}",
            operation, self.retry.max_attempts, last_error
        );
        Err(BacktestError::Persistence {
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }
}

#[async_trait]
impl<S: ResultSink> ResultSink for ResilientSink<S> {
    async fn upsert_outcomes(&self, run_id: &str, rows: &[OutcomeRow]) -> Result<usize> {
        self.with_retry("upsert_outcomes", || self.inner.upsert_outcomes(run_id, rows))
            .await
    }

    async fn upsert_run_statistics(&self, run_id: &str, stats: &RunStatistics) -> Result<()> {
        self.with_retry("upsert_run_statistics", || {
            self.inner.upsert_run_statistics(run_id, stats)
        })
        .await
    }
}
