use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tierdump_core::{Error, ErrorClass};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of calls, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each wait
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// No waiting and a single attempt, for tests and one-shot tools.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter && duration_ms > 0 {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Error types the retry loop can classify.
pub trait Retryable: Sized {
    fn class(&self) -> ErrorClass;

    /// The error returned when a wait is interrupted by cancellation.
    fn cancelled() -> Self;

    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl Retryable for Error {
    fn class(&self) -> ErrorClass {
        Error::class(self)
    }

    fn cancelled() -> Self {
        Error::Cancelled
    }
}

/// Retry a future operation with exponential backoff.
///
/// Only retryable errors are retried. Critical and ordinary errors are
/// returned as soon as they occur. Cancelling `cancel` during a wait ends
/// the loop with the cancellation error; an in-flight call is never
/// interrupted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        match error.class() {
            ErrorClass::Critical => {
                warn!(
                    operation = operation_name,
                    error = %error,
                    "Critical error, aborting without retry"
                );
                return Err(error);
            }
            ErrorClass::Ordinary => {
                debug!(
                    operation = operation_name,
                    error = %error,
                    "Error is not retryable, failing immediately"
                );
                return Err(error);
            }
            ErrorClass::Retryable => {}
        }

        attempt += 1;
        if attempt >= max_attempts {
            warn!(
                operation = operation_name,
                max_attempts,
                error = %error,
                "Operation failed after all retry attempts"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Operation failed, retrying after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(operation = operation_name, "Retry wait cancelled");
                return Err(E::cancelled());
            }
            _ = sleep(backoff) => {}
        }
    }
}
