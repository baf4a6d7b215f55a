// src/balance/affinity.rs
use super::AnySelector;
use crate::proxy::Backend;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct SessionEntry {
    backend: Arc<Backend>,
    last_seen: Instant,
}

/// Sticky-session overlay around any selector.
///
/// A hit returns the mapped backend as long as the entry has not aged past
/// the timeout and the backend is still healthy; anything else is a miss
/// that delegates to the wrapped selector and records the result.
pub struct AffinityWrapper {
    selector: AnySelector,
    timeout: Duration,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl AffinityWrapper {
    pub fn new(selector: AnySelector, timeout: Duration) -> Self {
        Self {
            selector,
            timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.selector.name()
    }

    pub fn select_with_client_key(
        &self,
        backends: &[Arc<Backend>],
        key: &str,
    ) -> Option<Arc<Backend>> {
        {
            let mut sessions = self.sessions.write().expect("affinity lock poisoned");
            match sessions.get_mut(key) {
                Some(entry)
                    if entry.last_seen.elapsed() <= self.timeout
                        && entry.backend.is_healthy() =>
                {
                    entry.last_seen = Instant::now();
                    return Some(Arc::clone(&entry.backend));
                }
                Some(_) => {
                    // Stale or unhealthy mapping is invalidated on this call.
                    sessions.remove(key);
                }
                None => {}
            }
        }

        let chosen = self.selector.select_for(backends, key)?;
        let mut sessions = self.sessions.write().expect("affinity lock poisoned");
        sessions.insert(
            key.to_string(),
            SessionEntry {
                backend: Arc::clone(&chosen),
                last_seen: Instant::now(),
            },
        );
        Some(chosen)
    }

    pub fn clear(&self, key: &str) {
        self.sessions
            .write()
            .expect("affinity lock poisoned")
            .remove(key);
    }

    pub fn clear_all(&self) {
        self.sessions
            .write()
            .expect("affinity lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("affinity lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        let mut sessions = self.sessions.write().expect("affinity lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_seen.elapsed() <= self.timeout);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "swept expired sessions");
        }
    }

    /// Spawn the background sweep; stops when the token is cancelled.
    pub fn start_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let wrapper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => wrapper.sweep(),
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}
