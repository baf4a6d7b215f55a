// src/proxy/backend.rs
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// A named upstream target.
///
/// Identity is `name`; `address` is immutable after creation. The health
/// flag and connection gauge are atomics so selectors and dispatchers read
/// them without locking. The pool owns the backend for its lifetime;
/// everything else holds a shared `Arc` handle that stays valid after the
/// backend is removed from the pool, so in-flight sessions can finish.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub address: String,
    weight: u64,
    max_connections: usize,

    healthy: AtomicBool,
    active_connections: AtomicI64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl Backend {
    pub fn new(name: impl Into<String>, address: impl Into<String>, weight: u32) -> Self {
        Self::with_max_connections(name, address, weight, 0)
    }

    pub fn with_max_connections(
        name: impl Into<String>,
        address: impl Into<String>,
        weight: u32,
        max_connections: usize,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            // weight <= 0 is normalized to 1 where consumed
            weight: weight.max(1) as u64,
            max_connections,
            healthy: AtomicBool::new(true),
            active_connections: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Reserve a connection slot, refusing past `max_connections` (0 means
    /// unlimited). The returned guard decrements the gauge on drop.
    pub fn try_acquire_connection(self: &Arc<Self>) -> Option<ConnectionGuard> {
        loop {
            let current = self.active_connections.load(Ordering::Acquire);
            if self.max_connections > 0 && current >= self.max_connections as i64 {
                return None;
            }
            if self
                .active_connections
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ConnectionGuard {
                    backend: Arc::clone(self),
                });
            }
        }
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn request_counts(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.failed_requests.load(Ordering::Relaxed),
        )
    }
}

/// RAII guard pairing every `active_connections` increment with exactly
/// one decrement, however the session ends.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
