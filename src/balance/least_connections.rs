// src/balance/least_connections.rs
use super::Selector;
use crate::proxy::Backend;
use std::sync::Arc;

/// Linear scan for the minimum `active_connections`; ties go to the first
/// backend encountered in the snapshot.
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for LeastConnections {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
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

    fn name(&self) -> &'static str {
        "least-connections"
    }
}
