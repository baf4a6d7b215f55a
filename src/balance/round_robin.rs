// src/balance/round_robin.rs
use super::Selector;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Atomic counter modulo the healthy count. Deterministic for a fixed
/// snapshot ordering.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RoundRobin {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % backends.len();
        Some(Arc::clone(&backends[index]))
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(n: usize) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| {
                Arc::new(Backend::new(
                    format!("b{i}"),
                    format!("127.0.0.1:{}", 9000 + i),
                    1,
                ))
            })
            .collect()
    }

    #[test]
    fn empty_snapshot_yields_none() {
        let rr = RoundRobin::new();
        assert!(rr.select(&[]).is_none());
    }

    #[test]
    fn exact_distribution_over_window() {
        let rr = RoundRobin::new();
        let pool = backends(3);
        let mut counts = [0usize; 3];
        for _ in 0..300 {
            let chosen = rr.select(&pool).unwrap();
            let idx = pool.iter().position(|b| b.name == chosen.name).unwrap();
            counts[idx] += 1;
        }
        assert_eq!(counts, [100, 100, 100]);
    }

    #[test]
    fn wraps_in_order() {
        let rr = RoundRobin::new();
        let pool = backends(2);
        let picks: Vec<_> = (0..4).map(|_| rr.select(&pool).unwrap().name.clone()).collect();
        assert_eq!(picks, ["b0", "b1", "b0", "b1"]);
    }
}
