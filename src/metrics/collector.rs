// src/metrics/collector.rs
use crate::circuit_breaker::CircuitState;
use crate::health::HealthState;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);
        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.collector)
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Session / request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub active_sessions: IntGauge,
    pub relay_bytes_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub retries_total: IntCounter,

    // Backend metrics
    pub backend_connections_active: IntGaugeVec,
    pub backend_health_status: IntGaugeVec,
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,

    // Circuit breaker metrics
    pub circuit_breaker_state: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Proxied sessions/requests"),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("lb_request_duration_seconds", "Session duration in seconds"),
            &["backend"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let active_sessions = IntGauge::new("lb_active_sessions", "Sessions in flight")?;
        registry.register(Box::new(active_sessions.clone()))?;

        let relay_bytes_total = IntCounterVec::new(
            Opts::new("lb_relay_bytes_total", "Bytes relayed"),
            &["direction"],
        )?;
        registry.register(Box::new(relay_bytes_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("lb_errors_total", "Errors by stable category"),
            &["category"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let retries_total = IntCounter::new("lb_retries_total", "Retry attempts made")?;
        registry.register(Box::new(retries_total.clone()))?;

        let backend_connections_active = IntGaugeVec::new(
            Opts::new("lb_backend_connections_active", "Active backend connections"),
            &["backend"],
        )?;
        registry.register(Box::new(backend_connections_active.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health (1=healthy, 0=unhealthy/draining)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let healthy_backends = IntGauge::new("lb_healthy_backends", "Healthy backend count")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends = IntGauge::new("lb_total_backends", "Known backend count")?;
        registry.register(Box::new(total_backends.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "lb_circuit_breaker_state",
                "Circuit state (0=closed, 1=open, 2=half-open)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            active_sessions,
            relay_bytes_total,
            errors_total,
            retries_total,
            backend_connections_active,
            backend_health_status,
            healthy_backends,
            total_backends,
            circuit_breaker_state,
        })
    }

    pub fn record_session(&self, backend: &str, success: bool, duration: std::time::Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.requests_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_relay_bytes(&self, client_to_backend: u64, backend_to_client: u64) {
        self.relay_bytes_total
            .with_label_values(&["client_to_backend"])
            .inc_by(client_to_backend);
        self.relay_bytes_total
            .with_label_values(&["backend_to_client"])
            .inc_by(backend_to_client);
    }

    pub fn record_error(&self, category: &str) {
        self.errors_total.with_label_values(&[category]).inc();
    }

    pub fn update_backend_connections(&self, backend: &str, count: i64) {
        self.backend_connections_active
            .with_label_values(&[backend])
            .set(count);
    }

    pub fn update_backend_health(&self, backend: &str, state: HealthState) {
        let value = i64::from(state == HealthState::Healthy);
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }

    pub fn update_circuit_state(&self, backend: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.circuit_breaker_state
            .with_label_values(&[backend])
            .set(value);
    }
}
