//! Bounded retry with exponential backoff for calls to external services.
//!
//! Every attempt carries a timeout. Transient failures and timeouts are retried
//! until `max_attempts` is reached; fatal failures return immediately.

use crate::cancel::CancellationToken;
use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Retry policy for a collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry
    pub base_delay_ms: u64,
    /// Backoff ceiling
    pub max_delay_ms: u64,
    /// Per-attempt timeout
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::DEFAULT_RETRY_MAX_DELAY_MS,
            timeout_secs: defaults::DEFAULT_SOURCE_TIMEOUT_SECS,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Classifies collaborator errors for the retry loop.
pub trait Retryable {
    /// Transient errors are retried; everything else is fatal.
    fn is_transient(&self) -> bool;
}

/// How the last attempt failed.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Error(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Error(err) => write!(f, "{}", err),
            AttemptFailure::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

/// Terminal outcome of a retried call.
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display + fmt::Debug> {
    /// Non-transient failure; not retried
    #[error("fatal: {0}")]
    Fatal(E),

    /// Transient failures on every attempt
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AttemptFailure<E> },

    /// Cancellation requested while waiting to retry
    #[error("cancelled")]
    Cancelled,
}

/// Run `op` under `policy`.
///
/// `label` only feeds log lines (e.g. the flow being fetched).
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + fmt::Display + fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let timeout = policy.timeout();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let failure = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(label, attempt, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(err)) if !err.is_transient() => return Err(RetryError::Fatal(err)),
            Ok(Err(err)) => AttemptFailure::Error(err),
            Err(_) => AttemptFailure::TimedOut(timeout),
        };

        if attempt >= attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: failure,
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            label,
            attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            "Transient failure: {}; retrying",
            failure
        );
        tokio::time::sleep(delay).await;
    }
}
