// src/retry/strategy.rs
use super::budget::RetryBudget;
use crate::config::RetryConfig;
use crate::error::ProxyError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff with jitter around a retryable-error predicate.
///
/// Delays follow `initial * multiplier^(n-1)` clamped to `max_delay`, plus
/// a uniform offset in `[-jitter*d, +jitter*d]` clamped at zero. An
/// optional budget gates retries across calls; cancellation interrupts
/// the backoff sleep.
#[derive(Clone)]
pub struct Retryer {
    config: RetryConfig,
    budget: Option<Arc<RetryBudget>>,
}

impl Retryer {
    pub fn new(config: RetryConfig) -> Self {
        let budget = config.budget.as_ref().map(|b| Arc::new(RetryBudget::new(b)));
        Self { config, budget }
    }

    pub async fn execute<F, Fut, T>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<T, ProxyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        self.execute_with_hook(token, f, |_, _, _| {}).await
    }

    /// `on_retry` fires before each backoff sleep with the attempt number,
    /// the error, and the chosen delay.
    pub async fn execute_with_hook<F, Fut, T, H>(
        &self,
        token: &CancellationToken,
        mut f: F,
        mut on_retry: H,
    ) -> Result<T, ProxyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
        H: FnMut(u32, &ProxyError, Duration),
    {
        if let Some(budget) = &self.budget {
            budget.record_request();
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(ProxyError::Cancelled) => return Err(ProxyError::Cancelled),
                Err(err) if !err.is_retryable() => {
                    debug!(error = %err, "error is not retryable");
                    return Err(err);
                }
                Err(err) => {
                    if attempt >= self.config.max_attempts {
                        warn!(attempts = attempt, error = %err, "max retries exceeded");
                        return Err(ProxyError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    if let Some(budget) = &self.budget {
                        if !budget.try_withdraw() {
                            debug!(attempt, "retry budget exhausted");
                            return Err(ProxyError::RetryBudgetExhausted);
                        }
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying after backoff");
                    on_retry(attempt, &err, delay);

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = token.cancelled() => return Err(ProxyError::Cancelled),
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay().as_secs_f64();
        let max = self.config.max_delay().as_secs_f64();
        let exponential = initial * self.config.multiplier.powi(attempt as i32 - 1);
        let capped = exponential.min(max);

        if self.config.jitter > 0.0 {
            let offset = (rand::random::<f64>() * 2.0 - 1.0) * self.config.jitter * capped;
            Duration::from_secs_f64((capped + offset).max(0.0))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}
