// src/config/models.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tcp,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub name: String,
    /// `host:port`, immutable after creation.
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    WeightedLeastConnections,
    ConsistentHash,
    BoundedConsistentHash,
}

impl Algorithm {
    pub fn is_hash_based(&self) -> bool {
        matches!(
            self,
            Algorithm::ConsistentHash | Algorithm::BoundedConsistentHash
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    /// Hash input for consistent-hash algorithms. Only `source-ip` is
    /// recognized today.
    #[serde(default)]
    pub hash_key: Option<String>,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,
    #[serde(default)]
    pub sticky_sessions: StickySessionConfig,
}

fn default_algorithm() -> Algorithm {
    Algorithm::RoundRobin
}

fn default_virtual_nodes() -> usize {
    150
}

fn default_load_factor() -> f64 {
    1.25
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            hash_key: None,
            virtual_nodes: default_virtual_nodes(),
            load_factor: default_load_factor(),
            sticky_sessions: StickySessionConfig::default(),
        }
    }
}

impl LoadBalancerConfig {
    /// Effective hash key; defaults to `source-ip` for hash algorithms.
    pub fn hash_key(&self) -> &str {
        self.hash_key.as_deref().unwrap_or("source-ip")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StickySessionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sticky_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_sticky_timeout_secs() -> u64 {
    600
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_sticky_timeout_secs(),
        }
    }
}

impl StickySessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
    #[serde(default = "default_write_secs")]
    pub write_secs: u64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

fn default_connect_secs() -> u64 {
    5
}

fn default_read_secs() -> u64 {
    30
}

fn default_write_secs() -> u64 {
    30
}

fn default_idle_secs() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            read_secs: default_read_secs(),
            write_secs: default_write_secs(),
            idle_secs: default_idle_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Tcp,
    Http,
    Https,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_hc_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_hc_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_hc_type", rename = "type")]
    pub check_type: HealthCheckType,
    #[serde(default = "default_hc_path")]
    pub path: String,
    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: Vec<u16>,
    #[serde(default)]
    pub passive_checks: PassiveCheckConfig,
}

fn default_hc_interval_secs() -> u64 {
    10
}

fn default_hc_timeout_secs() -> u64 {
    3
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_hc_type() -> HealthCheckType {
    HealthCheckType::Tcp
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_expected_status_codes() -> Vec<u16> {
    vec![200]
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_hc_interval_secs(),
            timeout_secs: default_hc_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
            check_type: default_hc_type(),
            path: default_hc_path(),
            expected_status_codes: default_expected_status_codes(),
            passive_checks: PassiveCheckConfig::default(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PassiveCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Recognized for compatibility; the window trigger counts failures.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_passive_consecutive")]
    pub consecutive_failures: u32,
    #[serde(default = "default_passive_min_requests")]
    pub min_requests: usize,
    #[serde(default = "default_passive_window_secs")]
    pub window_secs: u64,
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_passive_consecutive() -> u32 {
    5
}

fn default_passive_min_requests() -> usize {
    10
}

fn default_passive_window_secs() -> u64 {
    60
}

impl Default for PassiveCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            error_rate_threshold: default_error_rate_threshold(),
            consecutive_failures: default_passive_consecutive(),
            min_requests: default_passive_min_requests(),
            window_secs: default_passive_window_secs(),
        }
    }
}

impl PassiveCheckConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_cb_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_cb_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_requests() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_failures: default_max_failures(),
            timeout_secs: default_cb_timeout_secs(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub budget: Option<RetryBudgetConfig>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            budget: None,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryBudgetConfig {
    #[serde(default = "default_budget_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_budget_min_per_sec")]
    pub min_per_sec: u32,
    #[serde(default = "default_budget_ratio")]
    pub retry_ratio: f64,
}

fn default_budget_ttl_secs() -> u64 {
    10
}

fn default_budget_min_per_sec() -> u32 {
    10
}

fn default_budget_ratio() -> f64 {
    0.1
}

impl RetryBudgetConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_pool_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_pool_max_size() -> usize {
    10
}

fn default_pool_max_idle_secs() -> u64 {
    300
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_pool_max_size(),
            max_idle_secs: default_pool_max_idle_secs(),
        }
    }
}

impl ConnectionPoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_true")]
    pub enable_websocket: bool,
    #[serde(default = "default_true")]
    pub enable_http2: bool,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default = "default_idle_conn_timeout_secs")]
    pub idle_conn_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_idle_conns_per_host() -> usize {
    100
}

fn default_idle_conn_timeout_secs() -> u64 {
    90
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            enable_websocket: true,
            enable_http2: true,
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            idle_conn_timeout_secs: default_idle_conn_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_conn_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub name: String,
    /// Exact host or `*.suffix` wildcard; port is stripped before matching.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Header equality predicates; all must match.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Backend names drawn from the top-level `backends` list.
    pub backends: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
}

/// Request edits applied after the standard forwarding headers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransformConfig {
    /// Appended, preserving any existing value.
    #[serde(default)]
    pub add_headers: HashMap<String, String>,
    /// Replaces any existing value.
    #[serde(default)]
    pub set_headers: HashMap<String, String>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default)]
    pub add_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen.to_socket_addrs_ok().is_err() {
            bail!("listen address {:?} is not a valid host:port", self.listen);
        }

        if self.backends.is_empty() {
            bail!("at least one backend is required");
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                bail!("backend name must not be empty");
            }
            if !names.insert(backend.name.as_str()) {
                bail!("duplicate backend name {:?}", backend.name);
            }
            if backend.address.to_socket_addrs_ok().is_err() {
                bail!(
                    "backend {:?} address {:?} is not a valid host:port",
                    backend.name,
                    backend.address
                );
            }
        }

        if self.load_balancer.algorithm.is_hash_based()
            && self.load_balancer.hash_key() != "source-ip"
        {
            bail!(
                "unsupported hash_key {:?}; only \"source-ip\" is recognized",
                self.load_balancer.hash_key()
            );
        }
        if self.load_balancer.virtual_nodes == 0 {
            bail!("load_balancer.virtual_nodes must be at least 1");
        }
        if self.load_balancer.load_factor < 1.0 {
            bail!("load_balancer.load_factor must be >= 1.0");
        }

        let retry = &self.resilience.retry;
        if retry.enabled {
            if retry.max_attempts == 0 {
                bail!("retry.max_attempts must be at least 1");
            }
            if !(0.0..=1.0).contains(&retry.jitter) {
                bail!("retry.jitter must be within [0, 1]");
            }
            if retry.multiplier < 1.0 {
                bail!("retry.multiplier must be >= 1.0");
            }
        }

        let breaker = &self.resilience.circuit_breaker;
        if breaker.enabled {
            if breaker.max_failures == 0 {
                bail!("circuit_breaker.max_failures must be at least 1");
            }
            if breaker.max_concurrent_requests == 0 {
                bail!("circuit_breaker.max_concurrent_requests must be at least 1");
            }
        }

        if self.connection_pool.enabled && self.connection_pool.max_size == 0 {
            bail!("connection_pool.max_size must be at least 1");
        }

        for route in &self.http.routes {
            if route.backends.is_empty() {
                bail!("route {:?} must name at least one backend", route.name);
            }
            for name in &route.backends {
                if !names.contains(name.as_str()) {
                    bail!("route {:?} references unknown backend {:?}", route.name, name);
                }
            }
        }

        Ok(())
    }
}

trait ToSocketAddrsOk {
    fn to_socket_addrs_ok(&self) -> Result<(), ()>;
}

impl ToSocketAddrsOk for String {
    fn to_socket_addrs_ok(&self) -> Result<(), ()> {
        // host:port shape only; DNS resolution happens at dial time.
        let (host, port) = self.rsplit_once(':').ok_or(())?;
        if host.is_empty() {
            return Err(());
        }
        port.parse::<u16>().map(|_| ()).map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
mode: tcp
listen: "127.0.0.1:8080"
backends:
  - name: a
    address: "127.0.0.1:9001"
  - name: b
    address: "127.0.0.1:9002"
    weight: 3
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.mode, Mode::Tcp);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, 1);
        assert_eq!(config.backends[1].weight, 3);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(5));
        assert_eq!(config.timeouts.read(), Duration::from_secs(30));
        assert_eq!(config.health_check.unhealthy_threshold, 3);
        assert_eq!(config.health_check.healthy_threshold, 2);
        assert_eq!(config.resilience.retry.max_attempts, 3);
        assert_eq!(config.resilience.circuit_breaker.max_failures, 5);
        assert_eq!(config.connection_pool.max_size, 10);
        assert!(config.http.enable_websocket);
    }

    #[test]
    fn rejects_duplicate_backend_names() {
        let yaml = r#"
mode: tcp
listen: "127.0.0.1:8080"
backends:
  - name: a
    address: "127.0.0.1:9001"
  - name: a
    address: "127.0.0.1:9002"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_backend_address() {
        let yaml = r#"
mode: tcp
listen: "127.0.0.1:8080"
backends:
  - name: a
    address: "not-an-address"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_route_with_unknown_backend() {
        let yaml = r#"
mode: http
listen: "127.0.0.1:8080"
backends:
  - name: a
    address: "127.0.0.1:9001"
http:
  routes:
    - name: api
      path_prefix: /api
      backends: [missing]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown backend"));
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let yaml = r#"
mode: tcp
listen: "127.0.0.1:8080"
backends:
  - name: a
    address: "127.0.0.1:9001"
resilience:
  retry:
    enabled: true
    jitter: 1.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn hash_key_defaults_to_source_ip() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.load_balancer.hash_key(), "source-ip");
    }
}
