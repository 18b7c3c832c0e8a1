//! Bounded exponential backoff for calls to translation backends.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first call included. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single pause
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Three attempts, pausing 200ms then 400ms. Sized to fit inside the
    /// per-backend timeout, which still has the final word.
    pub fn translation_backend() -> Self {
        Self::new(3, Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
    }

    /// Pause before the `retry`-th retry (1 for the first retry).
    fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::translation_backend()
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the attempts run out. The last error is returned as is.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut retry = 0;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!("{} recovered after {} retries", operation_name, retry);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !should_retry(&error) {
            debug!("{} failed permanently: {}", operation_name, error);
            return Err(error);
        }

        retry += 1;
        if retry >= attempts {
            warn!(
                "{} gave up after {} attempts: {}",
                operation_name, attempts, error
            );
            return Err(error);
        }

        let pause = config.backoff(retry);
        warn!(
            "{} failed ({}), retrying in {:?} ({}/{})",
            operation_name,
            error,
            pause,
            retry + 1,
            attempts
        );
        sleep(pause).await;
    }
}
