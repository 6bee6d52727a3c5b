//! Bounded retry with exponential backoff and a hard per-attempt timeout
//!
//! Every attempt races the operation against `timeout`. Failures are classified
//! by the error itself through [`Classify`]:
//!
//! | Class          | Retries allowed                                 | Delay before retry `n` (0-based)      |
//! |----------------|-------------------------------------------------|---------------------------------------|
//! | `Retryable`    | `max_retries`                                   | `base * 2^n` (or `base` if linear)    |
//! | `RateLimited`  | `max(max_retries, rate_limit_max_retries)`      | `max(base * 2^n, retry_after)` always |
//!
//! Every delay, including a server-provided `Retry-After`, is capped at `max_backoff`.
//! | `Fatal`        | none                                            | -                                     |
//!
//! The executor knows nothing about fallbacks; callers convert the final
//! [`RetryError`] into whatever degraded value they need.

use std::{fmt, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient: timeout, network error, 5xx
    Retryable,
    /// HTTP 429 or quota pressure, optionally with a server-provided hint
    RateLimited { retry_after: Option<Duration> },
    /// Auth errors, malformed requests: retrying cannot help
    Fatal,
}

/// Errors that know whether they are worth retrying
pub trait Classify {
    fn classify(&self) -> FailureClass;
}

/// Outcome of a single failed attempt
#[derive(Debug, thiserror::Error)]
pub enum AttemptError<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),
}

impl<E: Classify> Classify for AttemptError<E> {
    fn classify(&self) -> FailureClass {
        match self {
            AttemptError::TimedOut(_) => FailureClass::Retryable,
            AttemptError::Failed(error) => error.classify(),
        }
    }
}

/// Final error of a retried operation
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("fatal error on attempt {attempts}: {error}")]
    Fatal { attempts: u32, error: E },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AttemptError<E> },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RetryError::Exhausted {
                last: AttemptError::TimedOut(_),
                ..
            }
        )
    }

    /// The last error returned by the operation, if the final attempt did not time out
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Exhausted {
                last: AttemptError::Failed(error),
                ..
            } => Some(error),
            _ => None,
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Exhausted {
                last: AttemptError::Failed(error),
                ..
            } => Some(error),
            _ => None,
        }
    }
}

/// Retry policy knobs
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub timeout: Duration,
    /// Retry allowance for rate-limit failures; the larger of this and `max_retries` applies
    pub rate_limit_max_retries: u32,
    /// Upper bound on any single delay, server hints included
    pub max_backoff: Duration,
}

pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            exponential: true,
            timeout: Duration::from_secs(30),
            rate_limit_max_retries: 4,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Retry only rate-limit failures, doubling the delay per attempt
    pub fn rate_limit_only(retries: u32, base_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            base_delay,
            exponential: true,
            timeout,
            rate_limit_max_retries: retries,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// Single attempt, no retries
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            exponential: false,
            timeout,
            rate_limit_max_retries: 0,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// Outer policy for calls routed through a [`RateLimitedQueue`](crate::queue::RateLimitedQueue).
    ///
    /// The queue already times each attempt and retries rate limits, so this
    /// layer only re-enqueues on transient failures and never times out the
    /// wait for admission.
    pub fn for_queued_calls(&self) -> Self {
        Self {
            timeout: Duration::MAX,
            rate_limit_max_retries: 0,
            ..self.clone()
        }
    }

    fn allowance(&self, class: &FailureClass) -> u32 {
        match class {
            FailureClass::Fatal => 0,
            FailureClass::Retryable => self.max_retries,
            FailureClass::RateLimited { .. } => self.max_retries.max(self.rate_limit_max_retries),
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32, class: &FailureClass) -> Duration {
        let exponential = match class {
            FailureClass::RateLimited { .. } => true,
            _ => self.exponential,
        };
        let delay = if exponential {
            self.base_delay.saturating_mul(2u32.saturating_pow(retry))
        } else {
            self.base_delay
        };
        let delay = match class {
            FailureClass::RateLimited {
                retry_after: Some(hint),
            } => delay.max(*hint),
            _ => delay,
        };
        delay.min(self.max_backoff)
    }
}

/// Generic retry wrapper for a single external call
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts its retries or is cancelled.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.execute_gated(label, cancel, || std::future::ready(()), operation)
            .await
    }

    /// Like [`execute`](Self::execute), but awaits `gate` before every attempt.
    ///
    /// The gate runs outside the attempt timeout, so admission control can make an
    /// attempt wait without that wait counting against it.
    pub async fn execute_gated<T, E, F, Fut, G, GFut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut gate: G,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnMut() -> GFut,
        GFut: Future<Output = ()>,
        E: Classify + fmt::Display,
    {
        let policy = &self.policy;
        let mut retries = 0u32;

        loop {
            let attempt = retries + 1;
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: retries });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: retries }),
                _ = gate() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                outcome = tokio::time::timeout(policy.timeout, operation()) => outcome,
            };

            let (failure, class) = match outcome {
                Ok(Ok(value)) => {
                    if retries > 0 {
                        tracing::debug!("[RETRY] {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    let class = error.classify();
                    if class == FailureClass::Fatal {
                        tracing::warn!("[RETRY] {} failed fatally on attempt {}: {}", label, attempt, error);
                        return Err(RetryError::Fatal {
                            attempts: attempt,
                            error,
                        });
                    }
                    (AttemptError::Failed(error), class)
                }
                Err(_) => (AttemptError::TimedOut(policy.timeout), FailureClass::Retryable),
            };

            if retries >= policy.allowance(&class) {
                tracing::warn!(
                    "[RETRY] {} giving up after {} attempts: {}",
                    label,
                    attempt,
                    failure
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = policy.backoff(retries, &class);
            tracing::debug!(
                "[RETRY] {} attempt {} failed ({}), retrying in {:?}",
                label,
                attempt,
                failure,
                delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(delay) => {}
            }
            retries += 1;
        }
    }
}
