//! Retry executor - exponential backoff with jitter, bounded attempts, cancellable

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Retryable;
use crate::shutdown::CancelToken;

/// Outcome of an operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation was observed before an attempt succeeded
    #[error("cancelled while retrying")]
    Cancelled,

    /// Terminal failure, or retries exhausted. Carries the last error.
    #[error("failed after {attempts} attempt(s): {error}")]
    Failed { attempts: u32, error: E },
}

/// Backoff policy: `initial * multiplier^n`, capped at `max`, jittered by `± jitter * delay`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    5
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_retries: default_max_retries(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval_ms: initial_interval.as_millis() as u64,
            max_interval_ms: max_interval.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Next base interval after a failed attempt
    pub fn next_interval(&self, current: Duration) -> Duration {
        let max = self.max_interval();
        let next = current.as_secs_f64() * self.multiplier.max(0.0);
        if !next.is_finite() || next >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(next)
    }

    /// Apply jitter to a base interval. Never negative.
    pub fn jittered(&self, interval: Duration) -> Duration {
        let secs = interval.as_secs_f64();
        // Clamp negative jitter to 0 to prevent gen_range panic
        let range = secs * self.jitter.max(0.0);
        let offset = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_secs_f64((secs + offset).max(0.0))
    }

    /// Run `operation` until it succeeds, fails terminally, exhausts the retry
    /// budget, or `cancel` fires. Both the attempt and the backoff sleep are
    /// raced against cancellation.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut interval = self.initial_interval();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!("Attempt {} failed with terminal error: {}", attempts, error);
                return Err(RetryError::Failed { attempts, error });
            }
            if attempts > self.max_retries {
                warn!("Giving up after {} attempt(s): {}", attempts, error);
                return Err(RetryError::Failed { attempts, error });
            }

            let delay = self.jittered(interval);
            debug!(
                "Attempt {} failed: {} (retrying in {}ms)",
                attempts,
                error,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            interval = self.next_interval(interval);
        }
    }
}
