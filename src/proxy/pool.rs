// src/proxy/pool.rs
use super::backend::Backend;
use crate::config::BackendConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Insertion-ordered set of backends, keyed uniquely by name.
///
/// Mutations take the write lock; reads return snapshots so callers can
/// iterate without holding it. Removal detaches a backend from the pool's
/// views but never invalidates handles already held by sessions.
pub struct BackendPool {
    inner: RwLock<PoolInner>,
}

struct PoolInner {
    ordered: Vec<Arc<Backend>>,
    by_name: HashMap<String, Arc<Backend>>,
}

impl BackendPool {
    pub fn new(configs: &[BackendConfig]) -> Self {
        let pool = Self {
            inner: RwLock::new(PoolInner {
                ordered: Vec::new(),
                by_name: HashMap::new(),
            }),
        };
        for config in configs {
            pool.add(Arc::new(Backend::with_max_connections(
                config.name.clone(),
                config.address.clone(),
                config.weight,
                config.max_connections,
            )));
        }
        pool
    }

    pub fn add(&self, backend: Arc<Backend>) {
        let mut inner = self.inner.write().expect("pool lock poisoned");
        if inner.by_name.contains_key(&backend.name) {
            tracing::warn!(backend = %backend.name, "ignoring duplicate backend");
            return;
        }
        inner.by_name.insert(backend.name.clone(), Arc::clone(&backend));
        inner.ordered.push(backend);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.write().expect("pool lock poisoned");
        if inner.by_name.remove(name).is_none() {
            return false;
        }
        inner.ordered.retain(|b| b.name != name);
        tracing::info!(backend = %name, "removed backend from pool");
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.by_name.get(name).cloned()
    }

    /// Point-in-time copy of every backend, in insertion order.
    pub fn snapshot_all(&self) -> Vec<Arc<Backend>> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.ordered.clone()
    }

    /// Order-preserving filter of the backends currently marked healthy.
    pub fn snapshot_healthy(&self) -> Vec<Arc<Backend>> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner
            .ordered
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("pool lock poisoned").ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
