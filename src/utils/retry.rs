use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::config::RetrySettings;

/// Outcome of a retried operation that never succeeded
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, multiplier: f64, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            multiplier,
            initial_delay,
            max_delay,
        }
    }

    /// Delay slept before `attempt` (1-based). The first attempt never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        // Exponent is capped so the float cannot overflow on absurd attempt counts.
        let exponent = (attempt - 2).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds, attempts run out, or `token` is cancelled
    pub async fn run<T, E, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, "Operation failed after all retries: {}", e);
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Attempt failed, retrying: {}", e);

                    tokio::select! {
                        _ = token.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            settings.backoff_multiplier,
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }
}
