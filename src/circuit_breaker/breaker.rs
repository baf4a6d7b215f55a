// src/circuit_breaker/breaker.rs
use crate::config::CircuitBreakerConfig;
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Rejecting everything until the timeout elapses.
    Open,
    /// Admitting a bounded number of probes.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitTransition {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_inflight: u32,
    opened_at: Option<Instant>,
}

/// Gate in front of one protected dependency, typically one backend.
///
/// Admission and state transitions are serialized by the inner mutex;
/// transition events go out on a broadcast channel so subscribers never
/// re-enter the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    timeout: std::time::Duration,
    max_concurrent_probes: u32,
    success_threshold: u32,
    inner: Mutex<BreakerInner>,

    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,

    events: broadcast::Sender<CircuitTransition>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let max_failures = config.max_failures.max(1);
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            max_failures,
            timeout: config.timeout(),
            max_concurrent_probes: config.max_concurrent_requests.max(1),
            success_threshold: (max_failures / 2).max(1),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_inflight: 0,
                opened_at: None,
            }),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Ask for admission. The permit must be resolved with
    /// `record_success`/`record_failure`; dropping it unresolved (e.g. on
    /// cancellation) releases a half-open probe slot without counting
    /// either way.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, ProxyError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, false)),
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|at| at.elapsed() > self.timeout)
                    .unwrap_or(true);
                if expired {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_inflight = 1;
                    Ok(CircuitPermit::new(self, true))
                } else {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    Err(ProxyError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_inflight < self.max_concurrent_probes {
                    inner.half_open_inflight += 1;
                    Ok(CircuitPermit::new(self, true))
                } else {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    Err(ProxyError::TooManyProbes)
                }
            }
        }
    }

    fn on_result(&self, success: bool, probe: bool) {
        if success {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if probe && inner.state == CircuitState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }

        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.max_failures {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, false) => {
                self.transition(&mut inner, CircuitState::Open);
            }
            (CircuitState::Open, false) => {
                // A straggler from before the trip; refresh the deadline.
                inner.opened_at = Some(Instant::now());
            }
            (CircuitState::Open, true) => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                warn!(
                    circuit = %self.name,
                    failures = inner.consecutive_failures,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_inflight = 0;
                info!(circuit = %self.name, "circuit half-open");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.half_open_inflight = 0;
                inner.opened_at = None;
                info!(circuit = %self.name, "circuit closed");
            }
        }
        let _ = self.events.send(CircuitTransition {
            circuit: self.name.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        CircuitBreakerMetrics {
            state: inner.state,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

/// Admission token returned by `try_acquire`.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: bool,
}

impl CircuitPermit {
    fn new(breaker: &Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker: Arc::clone(breaker),
            probe,
            resolved: false,
        }
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_result(true, self.probe);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_result(false, self.probe);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Per-backend circuit breakers, created on first use.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, &self.config)))
            .clone()
    }

    pub fn remove(&self, name: &str) {
        self.breakers.remove(name);
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(max_failures: u32, timeout_secs: u64, probes: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                enabled: true,
                max_failures,
                timeout_secs,
                max_concurrent_requests: probes,
            },
        ))
    }

    fn fail_once(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().record_failure();
    }

    #[test]
    fn opens_after_max_consecutive_failures() {
        let cb = breaker(5, 60, 1);
        for _ in 0..4 {
            fail_once(&cb);
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, ProxyError::CircuitOpen));
        assert_eq!(cb.metrics().total_rejected, 1);
    }

    #[test]
    fn success_resets_failure_count_when_closed() {
        let cb = breaker(3, 60, 1);
        fail_once(&cb);
        fail_once(&cb);
        cb.try_acquire().unwrap().record_success();
        fail_once(&cb);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_until_timeout_then_half_open() {
        let cb = breaker(1, 1, 1);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let permit = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        permit.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_caps_concurrent_probes() {
        let cb = breaker(2, 1, 1);
        fail_once(&cb);
        fail_once(&cb);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let probe = cb.try_acquire().unwrap();
        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, ProxyError::TooManyProbes));

        probe.record_success();
        // success_threshold = max(2/2, 1) = 1: closed again.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, 1, 2);
        fail_once(&cb);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let probe = cb.try_acquire().unwrap();
        probe.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn requires_success_threshold_to_close() {
        // max_failures = 4 -> success_threshold = 2
        let cb = breaker(4, 1, 4);
        for _ in 0..4 {
            fail_once(&cb);
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        cb.try_acquire().unwrap().record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.try_acquire().unwrap().record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_releases_slot() {
        let cb = breaker(1, 1, 1);
        fail_once(&cb);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let probe = cb.try_acquire().unwrap();
        drop(probe);
        // Slot released without a verdict; the next probe is admitted.
        let probe = cb.try_acquire().unwrap();
        probe.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn transitions_are_broadcast_in_order() {
        let cb = breaker(1, 60, 1);
        let mut events = cb.subscribe();
        fail_once(&cb);

        let event = events.try_recv().unwrap();
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);
    }

    #[test]
    fn manager_hands_out_one_breaker_per_name() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let a1 = manager.get_or_create("a");
        let a2 = manager.get_or_create("a");
        let b = manager.get_or_create("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        manager.remove("a");
        assert_eq!(manager.all().len(), 1);
    }
}
