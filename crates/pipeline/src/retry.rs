//! Exponential backoff for fallible async operations.

use ingest_core::{Error, FailureClass, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;

/// Retries transient failures with capped exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs_f64(config.base_delay_secs),
            multiplier: config.multiplier,
            max_delay: Duration::from_secs_f64(config.max_delay_secs),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay before retry `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }

    /// Run `f` with the error's own classification.
    pub async fn run<T, F, Fut>(&self, operation: &str, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_classified(operation, cancel, Error::classify, |_, _, _| {}, f)
            .await
    }

    /// Run `f` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `f` receives the 1-based attempt number. `on_backoff` is called with
    /// the attempt, its error and the delay before each sleep.
    pub async fn run_classified<T, F, Fut, C, B>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        classify: C,
        mut on_backoff: B,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> FailureClass,
        B: FnMut(u32, &Error, Duration),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if err.is_cancelled() || classify(&err) == FailureClass::Permanent {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(operation, attempts = attempt, error = %err, "Retries exhausted");
                return Err(Error::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.jittered(self.delay_for(attempt));
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, backing off"
            );
            on_backoff(attempt, &err, delay);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
