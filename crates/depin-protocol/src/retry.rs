//! Bounded retry with fixed or exponential delay.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cancel::sleep_or_cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl DelayPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match *self {
            DelayPolicy::Fixed(d) => d,
            DelayPolicy::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug)]
pub struct RetryPolicy<E> {
    pub max_attempts: usize,
    pub delay: DelayPolicy,
    pub is_retryable: fn(&E) -> bool,
}

// Manual impls: a derive would require `E: Copy`.
impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> RetryPolicy<E> {
    pub fn new(max_attempts: usize, delay: DelayPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            is_retryable: |_| true,
        }
    }

    /// 5 attempts, 2s apart. Used by checker-side network calls.
    pub fn checker_default() -> Self {
        Self::new(5, DelayPolicy::Fixed(Duration::from_secs(2)))
    }

    /// 5 attempts, exponential from 10s. Used by worker ledger submissions.
    pub fn worker_default() -> Self {
        Self::new(
            5,
            DelayPolicy::Exponential {
                base: Duration::from_secs(10),
                max: Duration::from_secs(160),
            },
        )
    }

    pub fn retry_if(mut self, is_retryable: fn(&E) -> bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancelled before an attempt succeeded.
    Cancelled,
    /// Non-retryable error, or the last error once attempts ran out.
    Failed { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Failed { last, .. } => Some(last),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "retry cancelled"),
            RetryError::Failed { attempts, last } => {
                write!(f, "failed after {attempts} attempt(s): {last}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `operation` until it succeeds, returns a non-retryable error, runs
/// out of attempts, or `cancel` fires. `operation` receives the 1-based
/// attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let err = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = operation(attempt) => match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            },
        };

        if !(policy.is_retryable)(&err) || attempt >= policy.max_attempts {
            return Err(RetryError::Failed { attempts: attempt, last: err });
        }

        let delay = policy.delay.delay_for(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying: {err}");
        if !sleep_or_cancelled(delay, cancel).await {
            return Err(RetryError::Cancelled);
        }
    }
}
