// src/balance/consistent_hash.rs
use super::{KeyedSelector, Selector};
use crate::proxy::Backend;
use std::sync::{Arc, RwLock};

/// FNV-1a, 32-bit, over UTF-8 bytes. The wire-stable hash for both ring
/// positions and client keys.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

struct RingState {
    /// Sorted by hash. Each backend contributes
    /// `virtual_nodes * max(weight, 1)` entries keyed `hash(address-i)`.
    entries: Vec<(u32, Arc<Backend>)>,
    /// Names in snapshot order; the ring is rebuilt iff this changes.
    identity: Vec<String>,
}

/// Shared ring maintenance for both hash selectors. Reads take the shared
/// lock; a rebuild takes the exclusive lock and only happens when the
/// healthy set actually changed.
struct HashRing {
    virtual_nodes: usize,
    state: RwLock<RingState>,
}

impl HashRing {
    fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            state: RwLock::new(RingState {
                entries: Vec::new(),
                identity: Vec::new(),
            }),
        }
    }

    fn ensure(&self, backends: &[Arc<Backend>]) {
        {
            let state = self.state.read().expect("ring lock poisoned");
            if state.identity.len() == backends.len()
                && state
                    .identity
                    .iter()
                    .zip(backends)
                    .all(|(name, b)| *name == b.name)
            {
                return;
            }
        }

        let mut state = self.state.write().expect("ring lock poisoned");
        if state.identity.len() == backends.len()
            && state
                .identity
                .iter()
                .zip(backends)
                .all(|(name, b)| *name == b.name)
        {
            return;
        }

        let mut entries = Vec::with_capacity(backends.len() * self.virtual_nodes);
        for backend in backends {
            let replicas = self.virtual_nodes * backend.weight().max(1) as usize;
            for i in 0..replicas {
                let key = format!("{}-{}", backend.address, i);
                entries.push((fnv1a_32(key.as_bytes()), Arc::clone(backend)));
            }
        }
        entries.sort_by_key(|(hash, _)| *hash);

        state.identity = backends.iter().map(|b| b.name.clone()).collect();
        state.entries = entries;
        tracing::debug!(
            backends = backends.len(),
            entries = state.entries.len(),
            "rebuilt hash ring"
        );
    }

    /// Index of the first entry with hash >= hash(key), wrapping to 0.
    /// The empty key degrades to index 0.
    fn start_index(entries: &[(u32, Arc<Backend>)], key: &str) -> usize {
        if key.is_empty() {
            return 0;
        }
        let target = fnv1a_32(key.as_bytes());
        let idx = entries.partition_point(|(hash, _)| *hash < target);
        if idx == entries.len() {
            0
        } else {
            idx
        }
    }

    fn lookup(&self, backends: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        self.ensure(backends);
        let state = self.state.read().expect("ring lock poisoned");
        if state.entries.is_empty() {
            return None;
        }
        let idx = Self::start_index(&state.entries, key);
        Some(Arc::clone(&state.entries[idx].1))
    }
}

/// Classic ring lookup: same `(key, healthy set)` pair always lands on the
/// same backend within a process run.
pub struct ConsistentHash {
    ring: HashRing,
}

impl ConsistentHash {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: HashRing::new(virtual_nodes),
        }
    }
}

impl Selector for ConsistentHash {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        self.ring.lookup(backends, "")
    }

    fn name(&self) -> &'static str {
        "consistent-hash"
    }
}

impl KeyedSelector for ConsistentHash {
    fn select_with_key(&self, backends: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>> {
        self.ring.lookup(backends, key)
    }
}

/// Ring lookup with a load bound: from the ring position, advance until a
/// backend is at or under `load_factor x` the average active connections.
/// If a full ring walk finds none, fall back to the least-loaded backend.
pub struct BoundedLoadConsistentHash {
    ring: HashRing,
    load_factor: f64,
}

impl BoundedLoadConsistentHash {
    pub fn new(virtual_nodes: usize, load_factor: f64) -> Self {
        Self {
            ring: HashRing::new(virtual_nodes),
            load_factor: load_factor.max(1.0),
        }
    }

    fn least_loaded(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut best: Option<&Arc<Backend>> = None;
        let mut best_conns = i64::MAX;
        for backend in backends {
            let conns = backend.active_connections();
            if conns < best_conns {
                best = Some(backend);
                best_conns = conns;
            }
        }
        best.cloned()
    }
}

impl Selector for BoundedLoadConsistentHash {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        self.select_with_key(backends, "")
    }

    fn name(&self) -> &'static str {
        "bounded-consistent-hash"
    }
}

impl KeyedSelector for BoundedLoadConsistentHash {
    fn select_with_key(&self, backends: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        self.ring.ensure(backends);

        let total_active: i64 = backends.iter().map(|b| b.active_connections()).sum();
        let average = total_active as f64 / backends.len() as f64;
        let threshold = self.load_factor * average;

        let state = self.ring.state.read().expect("ring lock poisoned");
        if state.entries.is_empty() {
            return None;
        }
        let start = HashRing::start_index(&state.entries, key);
        for offset in 0..state.entries.len() {
            let (_, backend) = &state.entries[(start + offset) % state.entries.len()];
            if backend.active_connections() as f64 <= threshold {
                return Some(Arc::clone(backend));
            }
        }
        drop(state);

        Self::least_loaded(backends)
    }
}
