// src/server/http.rs
use super::rewrite;
use super::router::RouteTable;
use super::upstream::UpstreamClient;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::TimeoutConfig;
use crate::error::{ProxyError, TimeoutPhase};
use crate::health::HealthOrchestrator;
use crate::metrics::MetricsCollector;
use crate::proxy::Backend;
use crate::relay::{self, RelayLimits};
use crate::retry::Retryer;
use futures::future::BoxFuture;
use hyper::server::conn::Http;
use hyper::{Body, Request, Response, StatusCode, Version};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Layer 7 dispatcher: route, rewrite, forward; WebSocket upgrades become
/// opaque byte tunnels.
pub struct HttpProxy {
    router: RouteTable,
    health: Arc<HealthOrchestrator>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    retryer: Option<Retryer>,
    upstream: Arc<dyn UpstreamClient>,
    timeouts: TimeoutConfig,
    enable_websocket: bool,
    metrics: Arc<MetricsCollector>,
    token: CancellationToken,
}

impl HttpProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: RouteTable,
        health: Arc<HealthOrchestrator>,
        breakers: Option<Arc<CircuitBreakerManager>>,
        retryer: Option<Retryer>,
        upstream: Arc<dyn UpstreamClient>,
        timeouts: TimeoutConfig,
        enable_websocket: bool,
        metrics: Arc<MetricsCollector>,
        token: CancellationToken,
    ) -> Self {
        Self {
            router,
            health,
            breakers,
            retryer,
            upstream,
            timeouts,
            enable_websocket,
            metrics,
            token,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(listen = %local, "http proxy listening");

        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let service = ProxyService {
                                proxy: Arc::clone(&self),
                                peer,
                            };
                            connections.spawn(async move {
                                let result = Http::new()
                                    .serve_connection(stream, service)
                                    .with_upgrades()
                                    .await;
                                if let Err(err) = result {
                                    debug!(%peer, error = %err, "connection error");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                    while connections.try_join_next().is_some() {}
                }
            }
        }

        drop(listener);
        let in_flight = connections.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for http connections to finish");
        }
        let all_done = async {
            while connections.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_GRACE, all_done).await.is_err() {
            warn!("shutdown grace period elapsed, aborting remaining connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        info!(listen = %local, "http proxy stopped");
        Ok(())
    }

    pub async fn handle(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        self.metrics.active_sessions.inc();
        let response = if self.enable_websocket && rewrite::is_websocket_upgrade(req.headers()) {
            self.handle_websocket(req, peer).await
        } else {
            self.forward(req, peer).await
        };
        self.metrics.active_sessions.dec();

        response.unwrap_or_else(|err| {
            self.metrics.record_error(err.category());
            debug!(%peer, error = %err, category = err.category(), "request failed");
            error_response(&err)
        })
    }

    async fn forward(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, ProxyError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let route = self.router.match_route(&req);
        let client_key = rewrite::client_key(&req, peer);
        let original_host = rewrite::request_host(&req);
        let proto = rewrite::forwarded_proto(req.headers());

        let healthy = route.healthy_backends();
        let backend = route
            .chooser
            .choose(&healthy, &client_key)
            .ok_or(ProxyError::NoHealthyBackend)?;
        let _guard = backend
            .try_acquire_connection()
            .ok_or(ProxyError::NoHealthyBackend)?;
        self.metrics
            .update_backend_connections(&backend.name, backend.active_connections());
        let permit = match &self.breakers {
            Some(manager) => Some(manager.get_or_create(&backend.name).try_acquire()?),
            None => None,
        };
        debug!(
            %request_id,
            route = %route.name,
            backend = %backend.name,
            method = %req.method(),
            path = req.uri().path(),
            "forwarding request"
        );

        let (mut parts, body) = req.into_parts();
        // Buffered so the request can be replayed on retry.
        let body_bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ProxyError::UpstreamProtocolError(format!("request body: {e}")))?;

        rewrite::strip_hop_by_hop(&mut parts.headers);
        rewrite::apply_forwarding_headers(
            &mut parts.headers,
            &peer.ip().to_string(),
            original_host.as_deref(),
            &proto,
        );

        let mut path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        if let Some(transform) = &route.transform {
            rewrite::apply_header_transform(&mut parts.headers, transform);
            let (path, query) = match path_and_query.split_once('?') {
                Some((p, q)) => (p.to_string(), Some(q.to_string())),
                None => (path_and_query.clone(), None),
            };
            let path = rewrite::rewrite_path(&path, transform);
            path_and_query = match query {
                Some(q) => format!("{path}?{q}"),
                None => path,
            };
        }
        let uri = rewrite::upstream_uri(&backend.address, &path_and_query)
            .map_err(|e| ProxyError::UpstreamProtocolError(format!("upstream uri: {e}")))?;

        let method = parts.method.clone();
        let headers = parts.headers.clone();
        let build_request = move || -> Result<Request<Body>, ProxyError> {
            let mut builder = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .version(Version::HTTP_11);
            match builder.headers_mut() {
                Some(map) => *map = headers.clone(),
                None => return Err(ProxyError::UpstreamProtocolError("bad request".into())),
            }
            builder
                .body(Body::from(body_bytes.clone()))
                .map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))
        };

        let result = match &self.retryer {
            Some(retryer) => {
                let metrics = Arc::clone(&self.metrics);
                retryer
                    .execute_with_hook(
                        &self.token,
                        || async { self.upstream.execute(build_request()?).await },
                        move |_, _, _| metrics.retries_total.inc(),
                    )
                    .await
            }
            None => self.upstream.execute(build_request()?).await,
        };

        match result {
            Ok(mut response) => {
                if let Some(permit) = permit {
                    permit.record_success();
                }
                self.health.record_passive_result(&backend, true);
                rewrite::strip_hop_by_hop(response.headers_mut());
                self.metrics
                    .record_session(&backend.name, true, started.elapsed());
                Ok(response)
            }
            Err(err) => {
                if let Some(permit) = permit {
                    permit.record_failure();
                }
                self.health.record_passive_result(&backend, false);
                self.health.mark_unhealthy(&backend);
                self.metrics
                    .record_session(&backend.name, false, started.elapsed());
                Err(err)
            }
        }
    }

    /// Forward the upgrade request unmodified over a dedicated connection,
    /// surface the backend's response unchanged, and on 101 turn both
    /// sides into an opaque byte tunnel.
    async fn handle_websocket(
        &self,
        mut req: Request<Body>,
        peer: SocketAddr,
    ) -> Result<Response<Body>, ProxyError> {
        let route = self.router.match_route(&req);
        let client_key = rewrite::client_key(&req, peer);
        let healthy = route.healthy_backends();
        let backend = route
            .chooser
            .choose(&healthy, &client_key)
            .ok_or(ProxyError::NoHealthyBackend)?;
        let guard = backend
            .try_acquire_connection()
            .ok_or(ProxyError::NoHealthyBackend)?;
        let permit = match &self.breakers {
            Some(manager) => Some(manager.get_or_create(&backend.name).try_acquire()?),
            None => None,
        };

        // Take the client's upgrade handle before the request moves on.
        let client_upgrade = hyper::upgrade::on(&mut req);

        let stream = match self.dial_backend(&backend).await {
            Ok(stream) => stream,
            Err(err) => {
                if let Some(permit) = permit {
                    permit.record_failure();
                }
                self.health.record_passive_result(&backend, false);
                self.health.mark_unhealthy(&backend);
                return Err(err);
            }
        };

        let (mut sender, conn) = hyper::client::conn::Builder::new()
            .handshake::<TcpStream, Body>(stream)
            .await
            .map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "websocket upstream connection ended");
            }
        });

        // Origin-form URI, headers untouched: the backend sees what the
        // client sent.
        let (mut parts, body) = req.into_parts();
        parts.uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e| ProxyError::UpstreamProtocolError(format!("origin uri: {e}")))?;
        let upstream_req = Request::from_parts(parts, body);

        let mut response = match sender.send_request(upstream_req).await {
            Ok(response) => response,
            Err(err) => {
                if let Some(permit) = permit {
                    permit.record_failure();
                }
                self.health.record_passive_result(&backend, false);
                self.health.mark_unhealthy(&backend);
                return Err(ProxyError::UpstreamProtocolError(err.to_string()));
            }
        };
        if let Some(permit) = permit {
            permit.record_success();
        }
        self.health.record_passive_result(&backend, true);

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                // Hold the connection-count guard for the tunnel lifetime.
                let _guard = guard;
                match tokio::try_join!(client_upgrade, backend_upgrade) {
                    Ok((client_io, backend_io)) => {
                        let outcome = relay::copy_bidirectional_io(
                            client_io,
                            backend_io,
                            &RelayLimits::default(),
                        )
                        .await;
                        metrics.record_relay_bytes(
                            outcome.client_to_backend,
                            outcome.backend_to_client,
                        );
                        debug!(
                            %peer,
                            client_to_backend = outcome.client_to_backend,
                            backend_to_client = outcome.backend_to_client,
                            "websocket tunnel closed"
                        );
                    }
                    Err(err) => debug!(%peer, error = %err, "websocket upgrade failed"),
                }
            });
        }

        // A non-101 rejection is surfaced to the client unchanged.
        Ok(response)
    }

    async fn dial_backend(&self, backend: &Arc<Backend>) -> Result<TcpStream, ProxyError> {
        let dial = || async {
            match timeout(
                self.timeouts.connect(),
                TcpStream::connect(backend.address.as_str()),
            )
            .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(source)) => Err(ProxyError::DialFailed {
                    address: backend.address.clone(),
                    source,
                }),
                Err(_) => Err(ProxyError::Timeout {
                    phase: TimeoutPhase::Connect,
                    timeout: self.timeouts.connect(),
                }),
            }
        };
        match &self.retryer {
            Some(retryer) => retryer.execute(&self.token, dial).await,
            None => dial().await,
        }
    }
}

fn error_response(err: &ProxyError) -> Response<Body> {
    let status = match err {
        ProxyError::NoHealthyBackend
        | ProxyError::CircuitOpen
        | ProxyError::TooManyProbes
        | ProxyError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(err.to_string()))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::BAD_GATEWAY;
            fallback
        })
}

/// Per-connection service handing requests to the shared proxy.
pub struct ProxyService {
    proxy: Arc<HttpProxy>,
    peer: SocketAddr,
}

impl Service<Request<Body>> for ProxyService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let peer = self.peer;
        Box::pin(async move { Ok(proxy.handle(req, peer).await) })
    }
}
