// src/retry/budget.rs
use crate::config::RetryBudgetConfig;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct WindowState {
    started_at: Instant,
    requests: u64,
    retries: u64,
}

/// Rate-of-retries limiter, independent of per-call attempt caps.
///
/// Within a `ttl` window a retry is permitted iff
/// `retries < max(min_per_sec * elapsed, requests * ratio)`. The window
/// resets on the first request observed after the ttl elapses.
pub struct RetryBudget {
    ttl: Duration,
    min_per_sec: u32,
    ratio: f64,
    inner: Mutex<WindowState>,
}

impl RetryBudget {
    pub fn new(config: &RetryBudgetConfig) -> Self {
        Self {
            ttl: config.ttl(),
            min_per_sec: config.min_per_sec,
            ratio: config.retry_ratio.max(0.0),
            inner: Mutex::new(WindowState {
                started_at: Instant::now(),
                requests: 0,
                retries: 0,
            }),
        }
    }

    pub fn record_request(&self) {
        let mut state = self.inner.lock().expect("budget lock poisoned");
        if state.started_at.elapsed() > self.ttl {
            state.started_at = Instant::now();
            state.requests = 0;
            state.retries = 0;
        }
        state.requests += 1;
    }

    /// Take one retry from the budget if any allowance remains.
    pub fn try_withdraw(&self) -> bool {
        let mut state = self.inner.lock().expect("budget lock poisoned");
        let elapsed = state.started_at.elapsed().as_secs_f64();
        let allowance =
            (f64::from(self.min_per_sec) * elapsed).max(state.requests as f64 * self.ratio);
        if (state.retries as f64) < allowance {
            state.retries += 1;
            true
        } else {
            false
        }
    }
}
