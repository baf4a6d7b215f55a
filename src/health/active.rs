// src/health/active.rs
use crate::config::{HealthCheckConfig, HealthCheckType};
use crate::proxy::Backend;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Outcome of one probe against one backend.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub backend: String,
    pub healthy: bool,
    pub status: Option<u16>,
    pub duration: Duration,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    fn failure(backend: &Backend, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            backend: backend.name.clone(),
            healthy: false,
            status: None,
            duration,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Probes backends over TCP or HTTP(S).
///
/// TCP succeeds iff the dial completes within the deadline; HTTP(S) issues
/// a GET without keep-alive and succeeds iff the status is expected.
pub struct ActiveChecker {
    check_type: HealthCheckType,
    probe_timeout: Duration,
    path: String,
    expected_status_codes: Vec<u16>,
    client: Client,
}

impl ActiveChecker {
    pub fn new(config: &HealthCheckConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout())
            // Probes never reuse connections.
            .pool_max_idle_per_host(0)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            check_type: config.check_type,
            probe_timeout: config.timeout(),
            path: config.path.clone(),
            expected_status_codes: config.expected_status_codes.clone(),
            client,
        }
    }

    /// Probe every backend concurrently; the result vector preserves the
    /// input order.
    pub async fn check_multiple(
        &self,
        backends: &[Arc<Backend>],
        token: &CancellationToken,
    ) -> Vec<CheckResult> {
        let probes = backends.iter().map(|b| self.check(b, token));
        futures::future::join_all(probes).await
    }

    pub async fn check(&self, backend: &Arc<Backend>, token: &CancellationToken) -> CheckResult {
        // A pre-cancelled token yields a failure without touching the network.
        if token.is_cancelled() {
            return CheckResult::failure(backend, Duration::ZERO, "check cancelled");
        }

        let start = Instant::now();
        let result = tokio::select! {
            result = self.probe(backend) => result,
            _ = token.cancelled() => {
                return CheckResult::failure(backend, start.elapsed(), "check cancelled");
            }
        };

        let duration = start.elapsed();
        match result {
            Ok(status) => {
                debug!(backend = %backend.name, ?status, ?duration, "probe succeeded");
                CheckResult {
                    backend: backend.name.clone(),
                    healthy: true,
                    status,
                    duration,
                    error: None,
                    checked_at: Utc::now(),
                }
            }
            Err(ProbeError::UnexpectedStatus(status)) => CheckResult {
                backend: backend.name.clone(),
                healthy: false,
                status: Some(status),
                duration,
                error: Some(format!("unexpected status {status}")),
                checked_at: Utc::now(),
            },
            Err(ProbeError::Failed(message)) => {
                CheckResult::failure(backend, duration, message)
            }
        }
    }

    async fn probe(&self, backend: &Backend) -> Result<Option<u16>, ProbeError> {
        match self.check_type {
            HealthCheckType::Tcp => {
                match timeout(self.probe_timeout, TcpStream::connect(backend.address.as_str())).await {
                    Ok(Ok(_stream)) => Ok(None),
                    Ok(Err(e)) => Err(ProbeError::Failed(e.to_string())),
                    Err(_) => Err(ProbeError::Failed("connect timeout".to_string())),
                }
            }
            HealthCheckType::Http | HealthCheckType::Https => {
                let scheme = match self.check_type {
                    HealthCheckType::Https => "https",
                    _ => "http",
                };
                let url =
                    Url::parse(&format!("{}://{}{}", scheme, backend.address, self.path))
                        .map_err(|e| ProbeError::Failed(format!("bad probe url: {e}")))?;
                let response = self
                    .client
                    .get(url)
                    .header(reqwest::header::CONNECTION, "close")
                    .send()
                    .await
                    .map_err(|e| ProbeError::Failed(e.to_string()))?;

                let status = response.status().as_u16();
                if self.expected_status_codes.contains(&status) {
                    Ok(Some(status))
                } else {
                    Err(ProbeError::UnexpectedStatus(status))
                }
            }
        }
    }
}

enum ProbeError {
    UnexpectedStatus(u16),
    Failed(String),
}
