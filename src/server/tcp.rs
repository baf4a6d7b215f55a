// src/server/tcp.rs
use crate::balance::BackendChooser;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::TimeoutConfig;
use crate::connection::{ConnectionPoolManager, PooledConnection};
use crate::error::{ProxyError, TimeoutPhase};
use crate::health::HealthOrchestrator;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendPool};
use crate::relay::{self, RelayLimits};
use crate::retry::Retryer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Layer 4 dispatcher: accept, select, dial, splice.
pub struct TcpProxy {
    pool: Arc<BackendPool>,
    chooser: BackendChooser,
    health: Arc<HealthOrchestrator>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    retryer: Option<Retryer>,
    conn_pools: Option<Arc<ConnectionPoolManager>>,
    timeouts: TimeoutConfig,
    metrics: Arc<MetricsCollector>,
    token: CancellationToken,
}

enum Upstream {
    Pooled(PooledConnection),
    Direct(TcpStream),
}

impl TcpProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<BackendPool>,
        chooser: BackendChooser,
        health: Arc<HealthOrchestrator>,
        breakers: Option<Arc<CircuitBreakerManager>>,
        retryer: Option<Retryer>,
        conn_pools: Option<Arc<ConnectionPoolManager>>,
        timeouts: TimeoutConfig,
        metrics: Arc<MetricsCollector>,
        token: CancellationToken,
    ) -> Self {
        Self {
            pool,
            chooser,
            health,
            breakers,
            retryer,
            conn_pools,
            timeouts,
            metrics,
            token,
        }
    }

    /// Accept loop. Returns once the token is cancelled and every session
    /// has drained (or the grace period forced them down).
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(listen = %local, algorithm = self.chooser.name(), "tcp proxy listening");

        let mut sessions: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let proxy = Arc::clone(&self);
                            sessions.spawn(async move {
                                proxy.metrics.active_sessions.inc();
                                let result = proxy.handle_session(stream, peer).await;
                                proxy.metrics.active_sessions.dec();
                                if let Err(err) = result {
                                    proxy.metrics.record_error(err.category());
                                    debug!(%peer, error = %err, category = err.category(), "session failed");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                    // Reap whatever already finished so the set stays small.
                    while sessions.try_join_next().is_some() {}
                }
            }
        }

        // New connects are refused from here on.
        drop(listener);
        self.drain(sessions).await;
        info!(listen = %local, "tcp proxy stopped");
        Ok(())
    }

    async fn drain(&self, mut sessions: JoinSet<()>) {
        let in_flight = sessions.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for tcp sessions to finish");
        }
        let all_done = async {
            while sessions.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_GRACE, all_done).await.is_err() {
            warn!("shutdown grace period elapsed, aborting remaining sessions");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }

    async fn handle_session(&self, mut client: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let started = Instant::now();
        let client_key = peer.ip().to_string();

        let healthy = self.pool.snapshot_healthy();
        let backend = self
            .chooser
            .choose(&healthy, &client_key)
            .ok_or(ProxyError::NoHealthyBackend)?;

        // A backend at its connection cap is as good as absent.
        let guard = backend
            .try_acquire_connection()
            .ok_or(ProxyError::NoHealthyBackend)?;
        self.metrics
            .update_backend_connections(&backend.name, backend.active_connections());

        let permit = match &self.breakers {
            Some(manager) => Some(manager.get_or_create(&backend.name).try_acquire()?),
            None => None,
        };

        let mut upstream = match self.connect_backend(&backend).await {
            Ok(upstream) => upstream,
            Err(err) => {
                if let Some(permit) = permit {
                    permit.record_failure();
                }
                self.health.record_passive_result(&backend, false);
                self.health.mark_unhealthy(&backend);
                self.metrics
                    .record_session(&backend.name, false, started.elapsed());
                return Err(err);
            }
        };

        debug!(%peer, backend = %backend.name, address = %backend.address, "session established");

        let limits = RelayLimits::new(Some(self.timeouts.read()), Some(self.timeouts.write()));
        let outcome = match &mut upstream {
            Upstream::Pooled(conn) => {
                let result =
                    relay::copy_bidirectional_streams(&mut client, conn.stream_mut(), &limits)
                        .await;
                // The relay half-closes the socket; it cannot be reused.
                conn.mark_broken();
                result
            }
            Upstream::Direct(stream) => {
                relay::copy_bidirectional_streams(&mut client, stream, &limits).await
            }
        };

        // The session verdict covers the whole relay, not just the dial: a
        // backend that accepts and then stalls or resets still counts
        // against the breaker and the passive checker.
        let relay_ok = outcome.error.is_none();
        if let Some(permit) = permit {
            if relay_ok {
                permit.record_success();
            } else {
                permit.record_failure();
            }
        }
        self.health.record_passive_result(&backend, relay_ok);

        self.metrics
            .record_relay_bytes(outcome.client_to_backend, outcome.backend_to_client);
        self.metrics
            .record_session(&backend.name, relay_ok, started.elapsed());
        debug!(
            %peer,
            backend = %backend.name,
            client_to_backend = outcome.client_to_backend,
            backend_to_client = outcome.backend_to_client,
            "session closed"
        );
        drop(guard);

        match outcome.error {
            Some(err) => Err(ProxyError::Io(err)),
            None => Ok(()),
        }
    }

    async fn connect_backend(&self, backend: &Arc<Backend>) -> Result<Upstream, ProxyError> {
        match &self.retryer {
            Some(retryer) => {
                let metrics = Arc::clone(&self.metrics);
                retryer
                    .execute_with_hook(
                        &self.token,
                        || self.dial_once(backend),
                        move |_, _, _| metrics.retries_total.inc(),
                    )
                    .await
            }
            None => self.dial_once(backend).await,
        }
    }

    async fn dial_once(&self, backend: &Arc<Backend>) -> Result<Upstream, ProxyError> {
        if let Some(pools) = &self.conn_pools {
            let pool = pools.pool_for(backend);
            return Ok(Upstream::Pooled(pool.get(&self.token).await?));
        }

        match timeout(
            self.timeouts.connect(),
            TcpStream::connect(backend.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(Upstream::Direct(stream)),
            Ok(Err(source)) => Err(ProxyError::DialFailed {
                address: backend.address.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::Timeout {
                phase: TimeoutPhase::Connect,
                timeout: self.timeouts.connect(),
            }),
        }
    }
}
