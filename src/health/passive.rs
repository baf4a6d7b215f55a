// src/health/passive.rs
use crate::config::PassiveCheckConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Tracker {
    consecutive: u32,
    window_failures: VecDeque<Instant>,
}

/// Aggregates failure signals from live traffic, per backend.
///
/// Trips when either the consecutive-failure streak or the number of
/// failures inside the sliding window crosses its threshold. State is
/// locked per backend, not globally.
pub struct PassiveChecker {
    consecutive_threshold: u32,
    min_requests: usize,
    window: Duration,
    trackers: DashMap<String, Mutex<Tracker>>,
}

impl PassiveChecker {
    pub fn new(config: &PassiveCheckConfig) -> Self {
        Self {
            consecutive_threshold: config.consecutive_failures.max(1),
            min_requests: config.min_requests.max(1),
            window: config.window(),
            trackers: DashMap::new(),
        }
    }

    pub fn record_success(&self, backend: &str) {
        if let Some(entry) = self.trackers.get(backend) {
            let mut tracker = entry.lock().expect("tracker lock poisoned");
            tracker.consecutive = 0;
        }
    }

    /// Record a failure; returns true when the backend should be taken out
    /// of rotation.
    pub fn record_failure(&self, backend: &str) -> bool {
        let entry = self
            .trackers
            .entry(backend.to_string())
            .or_insert_with(|| Mutex::new(Tracker::default()));
        let mut tracker = entry.lock().expect("tracker lock poisoned");

        let now = Instant::now();
        tracker.consecutive += 1;
        tracker.window_failures.push_back(now);
        while let Some(&oldest) = tracker.window_failures.front() {
            if now.duration_since(oldest) > self.window {
                tracker.window_failures.pop_front();
            } else {
                break;
            }
        }

        tracker.consecutive >= self.consecutive_threshold
            || tracker.window_failures.len() >= self.min_requests
    }

    pub fn reset(&self, backend: &str) {
        if let Some(entry) = self.trackers.get(backend) {
            let mut tracker = entry.lock().expect("tracker lock poisoned");
            tracker.consecutive = 0;
            tracker.window_failures.clear();
        }
    }

    pub fn reset_all(&self) {
        for entry in self.trackers.iter() {
            let mut tracker = entry.lock().expect("tracker lock poisoned");
            tracker.consecutive = 0;
            tracker.window_failures.clear();
        }
    }
}
