// src/error.rs
use std::fmt;
use std::io;
use std::time::Duration;

/// Which deadline fired. Kept separate from the error so log lines and
/// metric labels can distinguish a slow dial from a stalled read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Read,
    Write,
    Request,
    Handshake,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Read => "read",
            TimeoutPhase::Write => "write",
            TimeoutPhase::Request => "request",
            TimeoutPhase::Handshake => "handshake",
        };
        f.write_str(s)
    }
}

/// Error surfaced by the proxy core. Every variant carries a stable
/// `category()` tag used as a metric label.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no healthy backend available")]
    NoHealthyBackend,

    #[error("failed to dial backend {address}")]
    DialFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("connection pool closed")]
    PoolClosed,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("circuit breaker probe limit reached")]
    TooManyProbes,

    #[error("{phase} timed out after {timeout:?}")]
    Timeout {
        phase: TimeoutPhase,
        timeout: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("max retries exceeded after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("retry budget exhausted")]
    RetryBudgetExhausted,

    #[error("i/o error")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Stable category tag for metric labeling.
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::ConfigInvalid(_) => "config_invalid",
            ProxyError::NoHealthyBackend => "no_healthy_backend",
            ProxyError::DialFailed { .. } => "dial_failed",
            ProxyError::PoolExhausted => "pool_exhausted",
            ProxyError::PoolClosed => "pool_closed",
            ProxyError::CircuitOpen => "circuit_open",
            ProxyError::TooManyProbes => "too_many_probes",
            ProxyError::Timeout { .. } => "timeout",
            ProxyError::Cancelled => "cancelled",
            ProxyError::UpstreamProtocolError(_) => "upstream_protocol",
            ProxyError::RetriesExhausted { .. } => "retries_exhausted",
            ProxyError::RetryBudgetExhausted => "retry_budget_exhausted",
            ProxyError::Io(_) => "io",
        }
    }

    /// Transient dial and I/O failures may be retried; protocol errors,
    /// cancellation and breaker rejections never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::DialFailed { .. }
                | ProxyError::Timeout { .. }
                | ProxyError::PoolExhausted
                | ProxyError::Io(_)
        )
    }
}
