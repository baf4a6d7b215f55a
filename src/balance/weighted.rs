// src/balance/weighted.rs
use super::Selector;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter modulo the weight sum; each backend owns a contiguous range of
/// tickets proportional to its weight. Over any window of `k * sum(w)`
/// selections against a stable snapshot, backend `i` is chosen exactly
/// `k * w_i` times.
pub struct WeightedRoundRobin {
    counter: AtomicU64,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for WeightedRoundRobin {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let total: u64 = backends.iter().map(|b| b.weight()).sum();
        let mut ticket = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for backend in backends {
            let weight = backend.weight();
            if ticket < weight {
                return Some(Arc::clone(backend));
            }
            ticket -= weight;
        }
        // Unreachable: ticket < total and the ranges cover [0, total).
        backends.first().cloned()
    }

    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }
}

/// Minimum `active_connections / weight`, weight floored at 1; ties go to
/// the first backend encountered.
pub struct WeightedLeastConnections;

impl WeightedLeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedLeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for WeightedLeastConnections {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut best: Option<&Arc<Backend>> = None;
        let mut best_score = f64::INFINITY;
        for backend in backends {
            let score = backend.active_connections() as f64 / backend.weight() as f64;
            if score < best_score {
                best = Some(backend);
                best_score = score;
            }
        }
        best.cloned()
    }

    fn name(&self) -> &'static str {
        "weighted-least-connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(names_weights: &[(&str, u32)]) -> Vec<Arc<Backend>> {
        names_weights
            .iter()
            .enumerate()
            .map(|(i, (name, w))| {
                Arc::new(Backend::new(*name, format!("127.0.0.1:{}", 9000 + i), *w))
            })
            .collect()
    }

    #[test]
    fn wrr_distribution_matches_weights_exactly() {
        let pool = weighted(&[("a", 3), ("b", 1), ("c", 2)]);
        let wrr = WeightedRoundRobin::new();
        let mut counts = std::collections::HashMap::new();
        // 5 windows of sum(w) = 6
        for _ in 0..30 {
            let chosen = wrr.select(&pool).unwrap();
            *counts.entry(chosen.name.clone()).or_insert(0u32) += 1;
        }
        assert_eq!(counts["a"], 15);
        assert_eq!(counts["b"], 5);
        assert_eq!(counts["c"], 10);
    }

    #[test]
    fn wrr_single_backend() {
        let pool = weighted(&[("a", 7)]);
        let wrr = WeightedRoundRobin::new();
        for _ in 0..10 {
            assert_eq!(wrr.select(&pool).unwrap().name, "a");
        }
    }

    #[test]
    fn wlc_divides_by_weight() {
        let pool = weighted(&[("a", 1), ("b", 4)]);
        // a: 1 conn / weight 1 = 1.0; b: 2 conns / weight 4 = 0.5
        let _ga = pool[0].try_acquire_connection().unwrap();
        let _gb1 = pool[1].try_acquire_connection().unwrap();
        let _gb2 = pool[1].try_acquire_connection().unwrap();

        let wlc = WeightedLeastConnections::new();
        assert_eq!(wlc.select(&pool).unwrap().name, "b");
    }

    #[test]
    fn wlc_all_idle_picks_first_encountered() {
        let pool = weighted(&[("a", 1), ("b", 9)]);
        let wlc = WeightedLeastConnections::new();
        assert_eq!(wlc.select(&pool).unwrap().name, "a");
    }

    #[test]
    fn empty_snapshot_yields_none() {
        assert!(WeightedRoundRobin::new().select(&[]).is_none());
        assert!(WeightedLeastConnections::new().select(&[]).is_none());
    }
}
