// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use waypoint::balance::build_chooser;
use waypoint::circuit_breaker::CircuitBreakerManager;
use waypoint::config::{self, Mode};
use waypoint::connection::ConnectionPoolManager;
use waypoint::health::HealthOrchestrator;
use waypoint::metrics::{MetricsCollector, MetricsRegistry};
use waypoint::proxy::BackendPool;
use waypoint::retry::Retryer;
use waypoint::server::{HttpProxy, HyperUpstream, RouteTable, TcpProxy};

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Layer 4/7 reverse proxy and load balancer")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("waypoint=info".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    info!(path = %cli.config.display(), "loading configuration");
    let config = config::load_config(&cli.config).await?;

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_token.cancel();
    });

    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    let pool = Arc::new(BackendPool::new(&config.backends));
    let health = Arc::new(HealthOrchestrator::new(
        config.health_check.clone(),
        Arc::clone(&pool),
        token.child_token(),
    ));
    health.start().await;
    spawn_health_metrics_pump(&health, &pool, &metrics);

    let breakers = config
        .resilience
        .circuit_breaker
        .enabled
        .then(|| Arc::new(CircuitBreakerManager::new(config.resilience.circuit_breaker.clone())));
    if let Some(manager) = &breakers {
        spawn_circuit_gauge_pump(manager, &metrics, &token);
    }
    let retryer = config
        .resilience
        .retry
        .enabled
        .then(|| Retryer::new(config.resilience.retry.clone()));
    let conn_pools = config.connection_pool.enabled.then(|| {
        Arc::new(ConnectionPoolManager::new(
            config.connection_pool.clone(),
            config.timeouts.connect(),
            token.child_token(),
        ))
    });

    if config.metrics.enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    match config.mode {
        Mode::Tcp => {
            let proxy = Arc::new(TcpProxy::new(
                Arc::clone(&pool),
                build_chooser(&config.load_balancer, &token),
                Arc::clone(&health),
                breakers.clone(),
                retryer.clone(),
                conn_pools.clone(),
                config.timeouts.clone(),
                Arc::clone(&metrics),
                token.clone(),
            ));
            proxy.run(listener).await?;
        }
        Mode::Http => {
            let router = RouteTable::compile(
                &config.http.routes,
                &config.load_balancer,
                &pool,
                &token,
            )?;
            let upstream = Arc::new(HyperUpstream::new(&config.http, &config.timeouts));
            let proxy = Arc::new(HttpProxy::new(
                router,
                Arc::clone(&health),
                breakers.clone(),
                retryer.clone(),
                upstream,
                config.timeouts.clone(),
                config.http.enable_websocket,
                Arc::clone(&metrics),
                token.clone(),
            ));
            proxy.run(listener).await?;
        }
    }

    health.stop().await;
    if let Some(pools) = &conn_pools {
        pools.close_all().await;
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_health_metrics_pump(
    health: &Arc<HealthOrchestrator>,
    pool: &Arc<BackendPool>,
    metrics: &Arc<MetricsCollector>,
) {
    for backend in pool.snapshot_all() {
        let machine = health.machine_for(&backend);
        metrics.update_backend_health(&backend.name, machine.state());
    }
    metrics.update_backend_counts(pool.snapshot_healthy().len(), pool.len());

    let mut events = health.subscribe();
    let metrics = Arc::clone(metrics);
    let pool = Arc::clone(pool);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(transition) => {
                    metrics.update_backend_health(&transition.backend, transition.to);
                    metrics.update_backend_counts(pool.snapshot_healthy().len(), pool.len());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "health event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_circuit_gauge_pump(
    manager: &Arc<CircuitBreakerManager>,
    metrics: &Arc<MetricsCollector>,
    token: &CancellationToken,
) {
    let manager = Arc::clone(manager);
    let metrics = Arc::clone(metrics);
    let token = token.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for breaker in manager.all() {
                        metrics.update_circuit_state(breaker.name(), breaker.state());
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    });
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = Arc::clone(&metrics_path);

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = Arc::clone(&registry);
        let path = Arc::clone(&service_path);

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = Arc::clone(&registry);
                let path = Arc::clone(&path);

                async move {
                    if req.uri().path() == path.as_str() {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(registry.gather()))
                                .unwrap_or_else(|_| Response::new(Body::empty())),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap_or_else(|_| Response::new(Body::empty())),
                        )
                    }
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind metrics endpoint {addr}"))?
        .serve(make_service);
    info!("metrics server listening on http://{}{}", addr, metrics_path);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(error = %e, "metrics server error");
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
