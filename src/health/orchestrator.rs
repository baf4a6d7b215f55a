// src/health/orchestrator.rs
use super::active::ActiveChecker;
use super::passive::PassiveChecker;
use super::state::{HealthState, HealthStateMachine, HealthTransition};
use crate::config::HealthCheckConfig;
use crate::proxy::{Backend, BackendPool};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives active probes on an interval, feeds their results into the
/// per-backend state machines, and folds passive signals from live
/// traffic into the same machines.
pub struct HealthOrchestrator {
    config: HealthCheckConfig,
    pool: Arc<BackendPool>,
    checker: ActiveChecker,
    passive: Option<PassiveChecker>,
    machines: DashMap<String, Arc<HealthStateMachine>>,
    events: broadcast::Sender<HealthTransition>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthOrchestrator {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<BackendPool>,
        token: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let passive = config
            .passive_checks
            .enabled
            .then(|| PassiveChecker::new(&config.passive_checks));
        let checker = ActiveChecker::new(&config);

        let orchestrator = Self {
            config,
            pool,
            checker,
            passive,
            machines: DashMap::new(),
            events,
            token,
            handle: Mutex::new(None),
        };
        for backend in orchestrator.pool.snapshot_all() {
            orchestrator.machine_for(&backend);
        }
        orchestrator
    }

    /// Transition stream shared by every state machine. Per-backend order
    /// is the order transitions occurred; no cross-backend order promised.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.events.subscribe()
    }

    pub fn machine_for(&self, backend: &Arc<Backend>) -> Arc<HealthStateMachine> {
        self.machines
            .entry(backend.name.clone())
            .or_insert_with(|| {
                Arc::new(HealthStateMachine::new(
                    Arc::clone(backend),
                    self.config.unhealthy_threshold,
                    self.config.healthy_threshold,
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn machine(&self, name: &str) -> Option<Arc<HealthStateMachine>> {
        self.machines.get(name).map(|m| m.clone())
    }

    /// Spawn the probe loop. A no-op when active checking is disabled.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            debug!("active health checking disabled");
            return;
        }

        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.interval());
            info!(
                interval = ?orchestrator.config.interval(),
                check_type = ?orchestrator.config.check_type,
                "health checker started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => orchestrator.run_checks().await,
                    _ = orchestrator.token.cancelled() => {
                        info!("health checker shutting down");
                        break;
                    }
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    async fn run_checks(&self) {
        let backends = self.pool.snapshot_all();
        if backends.is_empty() {
            return;
        }

        // The whole sweep must finish within one interval.
        let results = match timeout(
            self.config.interval(),
            self.checker.check_multiple(&backends, &self.token),
        )
        .await
        {
            Ok(results) => results,
            Err(_) => {
                warn!("health check sweep exceeded its interval");
                return;
            }
        };

        let mut healthy = 0usize;
        for (backend, result) in backends.iter().zip(results) {
            let machine = self.machine_for(backend);
            let transition = if result.healthy {
                healthy += 1;
                machine.record_success(result.duration)
            } else {
                debug!(
                    backend = %result.backend,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "probe failed"
                );
                machine.record_failure(result.duration)
            };
            if let Some(t) = transition {
                self.on_transition(&t);
            }
        }
        debug!(healthy, total = backends.len(), "health sweep complete");
    }

    fn on_transition(&self, transition: &HealthTransition) {
        // A recovered backend starts from a clean passive slate.
        if transition.to == HealthState::Healthy {
            if let Some(passive) = &self.passive {
                passive.reset(&transition.backend);
            }
        }
    }

    /// Fold one live-traffic outcome into passive tracking. A passive trip
    /// forces the backend Unhealthy immediately.
    pub fn record_passive_result(&self, backend: &Arc<Backend>, success: bool) {
        let machine = self.machine_for(backend);
        machine.record_request(success);

        let Some(passive) = &self.passive else {
            return;
        };
        if success {
            passive.record_success(&backend.name);
        } else if passive.record_failure(&backend.name) {
            warn!(backend = %backend.name, "passive checks tripped");
            if let Some(t) = machine.force_unhealthy() {
                self.on_transition(&t);
            }
        }
    }

    /// Immediate removal from rotation, e.g. after a persistent dial
    /// failure.
    pub fn mark_unhealthy(&self, backend: &Arc<Backend>) {
        let machine = self.machine_for(backend);
        if let Some(t) = machine.force_unhealthy() {
            self.on_transition(&t);
        }
    }

    /// Explicit drain request for ops; never exited automatically.
    pub fn set_draining(&self, name: &str) -> bool {
        match self.machine(name) {
            Some(machine) => machine.set_draining().is_some(),
            None => false,
        }
    }

    /// Cancel the probe loop and wait for it to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}
