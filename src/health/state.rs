// src/health/state.rs
use crate::proxy::Backend;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    /// Entered only by explicit request; never exited automatically.
    Draining,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Draining => "draining",
        }
    }
}

/// Broadcast on every state change, in per-backend transition order.
#[derive(Debug, Clone)]
pub struct HealthTransition {
    pub backend: String,
    pub from: HealthState,
    pub to: HealthState,
    pub at: DateTime<Utc>,
}

/// Point-in-time counters for one backend.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub state: HealthState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub cumulative_response_time: Duration,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

struct StateInner {
    state: HealthState,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_check_at: Option<DateTime<Utc>>,
    last_transition_at: Option<DateTime<Utc>>,
}

/// Per-backend health state machine.
///
/// Transitions are serialized by the inner mutex and published on the
/// shared broadcast channel while it is held, so listeners observe each
/// backend's transitions in the order they happened. The backend's atomic
/// `healthy` flag is updated inside the same critical section.
pub struct HealthStateMachine {
    backend: Arc<Backend>,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    inner: Mutex<StateInner>,

    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    cumulative_response_time_us: AtomicU64,

    events: broadcast::Sender<HealthTransition>,
}

impl HealthStateMachine {
    pub fn new(
        backend: Arc<Backend>,
        unhealthy_threshold: u32,
        healthy_threshold: u32,
        events: broadcast::Sender<HealthTransition>,
    ) -> Self {
        Self {
            backend,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            inner: Mutex::new(StateInner {
                state: HealthState::Healthy,
                consecutive_successes: 0,
                consecutive_failures: 0,
                last_check_at: None,
                last_transition_at: None,
            }),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            cumulative_response_time_us: AtomicU64::new(0),
            events,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn state(&self) -> HealthState {
        self.inner.lock().expect("state lock poisoned").state
    }

    /// Record a successful probe.
    pub fn record_success(&self, response_time: Duration) -> Option<HealthTransition> {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.cumulative_response_time_us
            .fetch_add(response_time.as_micros() as u64, Ordering::Relaxed);

        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.last_check_at = Some(Utc::now());
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        if inner.state == HealthState::Unhealthy
            && inner.consecutive_successes >= self.healthy_threshold
        {
            return Some(self.transition(&mut inner, HealthState::Healthy));
        }
        None
    }

    /// Record a failed probe.
    pub fn record_failure(&self, response_time: Duration) -> Option<HealthTransition> {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.cumulative_response_time_us
            .fetch_add(response_time.as_micros() as u64, Ordering::Relaxed);

        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.last_check_at = Some(Utc::now());
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        if inner.state == HealthState::Healthy
            && inner.consecutive_failures >= self.unhealthy_threshold
        {
            return Some(self.transition(&mut inner, HealthState::Unhealthy));
        }
        None
    }

    /// Immediate Healthy -> Unhealthy transition, bypassing the probe
    /// counter. Used for passive-check trips and persistent dial failures.
    pub fn force_unhealthy(&self) -> Option<HealthTransition> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if inner.state != HealthState::Healthy {
            return None;
        }
        Some(self.transition(&mut inner, HealthState::Unhealthy))
    }

    /// Explicit drain request. No automatic exit.
    pub fn set_draining(&self) -> Option<HealthTransition> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        if inner.state == HealthState::Draining {
            return None;
        }
        Some(self.transition(&mut inner, HealthState::Draining))
    }

    /// Record a live-traffic request outcome (totals only; passive
    /// tripping is the orchestrator's call).
    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.backend.record_request(success);
    }

    fn transition(&self, inner: &mut StateInner, to: HealthState) -> HealthTransition {
        let from = inner.state;
        inner.state = to;
        match to {
            HealthState::Healthy => inner.consecutive_failures = 0,
            HealthState::Unhealthy | HealthState::Draining => inner.consecutive_successes = 0,
        }
        let now = Utc::now();
        inner.last_transition_at = Some(now);
        self.backend.set_healthy(to == HealthState::Healthy);

        let event = HealthTransition {
            backend: self.backend.name.clone(),
            from,
            to,
            at: now,
        };
        info!(
            backend = %event.backend,
            from = from.as_str(),
            to = to.as_str(),
            "health state changed"
        );
        let _ = self.events.send(event.clone());
        event
    }

    pub fn metrics(&self) -> HealthMetrics {
        let inner = self.inner.lock().expect("state lock poisoned");
        HealthMetrics {
            state: inner.state,
            consecutive_successes: inner.consecutive_successes,
            consecutive_failures: inner.consecutive_failures,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cumulative_response_time: Duration::from_micros(
                self.cumulative_response_time_us.load(Ordering::Relaxed),
            ),
            last_check_at: inner.last_check_at,
            last_transition_at: inner.last_transition_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(unhealthy: u32, healthy: u32) -> HealthStateMachine {
        let (tx, _rx) = broadcast::channel(16);
        HealthStateMachine::new(
            Arc::new(Backend::new("a", "127.0.0.1:9000", 1)),
            unhealthy,
            healthy,
            tx,
        )
    }

    #[test]
    fn exact_threshold_transitions() {
        let sm = machine(3, 2);
        assert_eq!(sm.state(), HealthState::Healthy);

        sm.record_failure(Duration::ZERO);
        sm.record_failure(Duration::ZERO);
        assert_eq!(sm.state(), HealthState::Healthy);
        let t = sm.record_failure(Duration::ZERO).unwrap();
        assert_eq!(t.to, HealthState::Unhealthy);
        assert!(!sm.backend().is_healthy());

        sm.record_success(Duration::ZERO);
        assert_eq!(sm.state(), HealthState::Unhealthy);
        let t = sm.record_success(Duration::ZERO).unwrap();
        assert_eq!(t.to, HealthState::Healthy);
        assert!(sm.backend().is_healthy());
    }

    #[test]
    fn success_resets_failure_streak() {
        let sm = machine(3, 2);
        sm.record_failure(Duration::ZERO);
        sm.record_failure(Duration::ZERO);
        sm.record_success(Duration::ZERO);
        sm.record_failure(Duration::ZERO);
        sm.record_failure(Duration::ZERO);
        // The success reset the streak, so two failures stay under the
        // threshold.
        assert_eq!(sm.state(), HealthState::Healthy);
        sm.record_failure(Duration::ZERO);
        assert_eq!(sm.state(), HealthState::Unhealthy);
    }

    #[test]
    fn draining_has_no_automatic_exit() {
        let sm = machine(1, 1);
        sm.set_draining().unwrap();
        assert!(!sm.backend().is_healthy());

        for _ in 0..5 {
            sm.record_success(Duration::ZERO);
        }
        assert_eq!(sm.state(), HealthState::Draining);
        assert!(!sm.backend().is_healthy());
    }

    #[test]
    fn force_unhealthy_only_from_healthy() {
        let sm = machine(5, 1);
        assert!(sm.force_unhealthy().is_some());
        assert!(sm.force_unhealthy().is_none());
        sm.record_success(Duration::ZERO);
        assert_eq!(sm.state(), HealthState::Healthy);
    }

    #[test]
    fn listeners_observe_transitions_in_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let sm = HealthStateMachine::new(
            Arc::new(Backend::new("a", "127.0.0.1:9000", 1)),
            1,
            1,
            tx,
        );
        sm.record_failure(Duration::ZERO);
        sm.record_success(Duration::ZERO);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.to, HealthState::Unhealthy);
        assert_eq!(second.to, HealthState::Healthy);
    }

    #[test]
    fn metrics_snapshot_counts() {
        let sm = machine(3, 2);
        sm.record_failure(Duration::from_millis(5));
        sm.record_success(Duration::from_millis(10));
        sm.record_request(true);
        sm.record_request(false);

        let m = sm.metrics();
        assert_eq!(m.total_successes, 1);
        assert_eq!(m.total_failures, 1);
        assert_eq!(m.total_requests, 2);
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.consecutive_successes, 1);
        assert_eq!(m.consecutive_failures, 0);
        assert_eq!(m.cumulative_response_time, Duration::from_millis(15));
        assert!(m.last_check_at.is_some());
    }
}
