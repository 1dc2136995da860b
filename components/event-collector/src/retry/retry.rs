//! Bounded retry with exponential backoff.
//!
//! `retry` re-invokes a deferred operation (a closure producing a fresh future
//! per attempt) until it succeeds, fails with an error the caller classifies as
//! non-retryable, or the attempt budget runs out.
//!
//! Policy:
//! - Start with `initial_delay`.
//! - Multiply the delay by `multiplier` after each failed attempt, capped at
//!   `max_delay` when one is set.
//! - Optionally apply a symmetric `jitter` ratio to each sleep.
//! - `max_attempts == 0` retries until success or a non-retryable error.

// External crates
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::instrument;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RetryPolicyError {
    #[error("backoff multiplier must be a finite number >= 1.0, got {0}")]
    Multiplier(f64),
    #[error("retry jitter must be within [0.0, 1.0), got {0}")]
    Jitter(f64),
    #[error("max delay {max:?} is shorter than the initial delay {initial:?}")]
    MaxDelay { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of invocations allowed; `0` means unlimited.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(60)),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RetryPolicyError::Multiplier(self.multiplier));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(RetryPolicyError::Jitter(self.jitter));
        }
        if let Some(max) = self.max_delay {
            if max < self.initial_delay {
                return Err(RetryPolicyError::MaxDelay {
                    initial: self.initial_delay,
                    max,
                });
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: self.initial_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(1.0 - self.jitter..1.0 + self.jitter);
        delay.mul_f64(factor)
    }
}

/// Delay sequence of a policy, before jitter. Never decreases.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(Duration::MAX);
        self.current = match self.max_delay {
            Some(max) => grown.min(max),
            None => grown,
        };
        delay
    }
}

/// Run `operation` under `policy`, retrying failures accepted by `is_retryable`.
///
/// On exhaustion the last error is returned unchanged.
#[instrument(
    name = "event_collector_retry::retry",
    target = "retry::retry",
    skip_all,
    fields(max_attempts = policy.max_attempts),
    level = "debug"
)]
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_retryable: P, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut backoff = policy.backoff();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        tracing::debug!(attempt = attempts, "Invoking retryable operation");

        let error = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!(attempts, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !is_retryable(&error) {
            tracing::error!(attempt = attempts, error = %error, "Operation failed with a non-retryable error");
            return Err(error);
        }

        if policy.exhausted(attempts) {
            tracing::error!(
                attempts,
                error = %error,
                "Exceeded configured max_attempts, giving up"
            );
            return Err(error);
        }

        let delay = policy.jittered(backoff.next_delay());
        tracing::warn!(
            attempt = attempts,
            error = %error,
            sleep_duration = ?delay,
            "Attempt {attempts} failed, retrying after backoff"
        );
        sleep(delay).await;
    }
}
