//! Retry with capped exponential backoff
//!
//! Only errors classified as retryable (see [`BleError::is_retryable`]) are
//! retried. Validation failures, unsupported operations and cancellations
//! surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BleError, BleResult, ErrorCode, ValidationError};

// ----------------------------------------------------------------------------
// Retry Configuration
// ----------------------------------------------------------------------------

/// Backoff schedule: attempt `n` (0-based) waits `initial_delay * multiplier^n`,
/// capped at `max_delay`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast schedule for tests
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// A single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay to wait after the failed attempt `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * f64::from(self.multiplier).powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::new(
                "max attempts",
                self.max_attempts,
                "at least one attempt is required",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ValidationError::new(
                "multiplier",
                self.multiplier,
                "must be a finite value of at least 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ValidationError::new(
                "initial delay",
                self.initial_delay,
                format!("must not exceed max delay ({:?})", self.max_delay),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Retry Helpers
// ----------------------------------------------------------------------------

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` attempts have failed.
///
/// Exhaustion yields [`ErrorCode::RETRIES_EXHAUSTED`] with the last failure as
/// its cause and the attempt count under the `attempts` context key.
pub async fn retry_with_backoff<T, F, Fut>(config: &RetryConfig, operation: F) -> BleResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BleResult<T>>,
{
    retry_until_cancelled(&CancellationToken::new(), config, operation).await
}

/// [`retry_with_backoff`] that also gives up, with
/// [`ErrorCode::OPERATION_CANCELLED`], once `cancel` fires. Cancellation is
/// observed between attempts and while backing off.
pub async fn retry_until_cancelled<T, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
) -> BleResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BleResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(BleError::cancelled("retry").with_context("attempts", attempt));
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!("Giving up after {} attempts: {}", attempt, err);
            return Err(BleError::new(
                ErrorCode::RETRIES_EXHAUSTED,
                format!("operation failed after {} attempts", attempt),
            )
            .with_context("attempts", attempt)
            .with_cause(err));
        }

        let delay = config.delay_for_attempt(attempt - 1);
        debug!("Attempt {} failed ({}), retrying in {:?}", attempt, err, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(BleError::cancelled("retry")
                    .with_context("attempts", attempt)
                    .with_cause(err));
            }
        }
    }
}
