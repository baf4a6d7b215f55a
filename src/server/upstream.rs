// src/server/upstream.rs
use crate::config::{HttpConfig, TimeoutConfig};
use crate::error::{ProxyError, TimeoutPhase};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use hyper_tls::HttpsConnector;
use std::time::Duration;
use tokio::time::timeout;

/// Seam between the dispatcher and the real upstream HTTP client, so
/// tests substitute a deterministic fake.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn execute(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError>;
}

/// Production client: a pooled hyper client honoring the configured idle
/// limits, with the whole exchange bounded by the read timeout.
///
/// `enable_http2` controls whether the connector advertises `h2` via
/// ALPN: enabled, TLS upstreams that negotiate it are spoken to over
/// HTTP/2; disabled, the ALPN-free connector pins every upstream to
/// HTTP/1.1. Plain-text backends stay on HTTP/1.1 either way.
pub struct HyperUpstream {
    client: Client<HttpsConnector<HttpConnector>>,
    request_timeout: Duration,
}

impl HyperUpstream {
    pub fn new(http: &HttpConfig, timeouts: &TimeoutConfig) -> Self {
        let connector = if http.enable_http2 {
            // Advertises h2 (hyper-tls `alpn` feature).
            HttpsConnector::new()
        } else {
            let mut inner = HttpConnector::new();
            inner.enforce_http(false);
            let tls = native_tls::TlsConnector::new()
                .expect("Failed to create TLS connector");
            HttpsConnector::from((inner, tls.into()))
        };
        let client = Client::builder()
            .pool_max_idle_per_host(http.max_idle_conns_per_host)
            .pool_idle_timeout(http.idle_conn_timeout())
            .build(connector);
        Self {
            client,
            request_timeout: timeouts.connect() + timeouts.read(),
        }
    }
}

#[async_trait]
impl UpstreamClient for HyperUpstream {
    async fn execute(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let address = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();

        match timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(map_hyper_error(address, err)),
            Err(_) => Err(ProxyError::Timeout {
                phase: TimeoutPhase::Request,
                timeout: self.request_timeout,
            }),
        }
    }
}

fn map_hyper_error(address: String, err: hyper::Error) -> ProxyError {
    if err.is_parse() || err.is_incomplete_message() {
        return ProxyError::UpstreamProtocolError(err.to_string());
    }
    if err.is_timeout() {
        return ProxyError::Timeout {
            phase: TimeoutPhase::Request,
            timeout: Duration::ZERO,
        };
    }
    // Connect refusals and torn connections both count as dial-level
    // failures for retry and breaker purposes.
    ProxyError::DialFailed {
        address,
        source: std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}
