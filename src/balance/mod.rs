// src/balance/mod.rs
mod affinity;
mod consistent_hash;
mod least_connections;
mod round_robin;
mod weighted;

pub use affinity::AffinityWrapper;
pub use consistent_hash::{fnv1a_32, BoundedLoadConsistentHash, ConsistentHash};
pub use least_connections::LeastConnections;
pub use round_robin::RoundRobin;
pub use weighted::{WeightedLeastConnections, WeightedRoundRobin};

use crate::config::LoadBalancerConfig;
use crate::proxy::Backend;
use std::sync::Arc;

/// Picks one backend from the healthy snapshot handed to it. Selectors
/// never cache handles across calls; the hash ring is the documented
/// exception and tracks snapshot identity itself.
pub trait Selector: Send + Sync {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}

/// Key-aware variant for algorithms that map a client key to a backend.
pub trait KeyedSelector: Selector {
    fn select_with_key(&self, backends: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>>;
}

/// Capability wrapper so dispatchers route a client key to selectors that
/// can use one without inspecting concrete types.
pub enum AnySelector {
    Plain(Box<dyn Selector>),
    Keyed(Box<dyn KeyedSelector>),
}

impl AnySelector {
    pub fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        match self {
            AnySelector::Plain(s) => s.select(backends),
            AnySelector::Keyed(s) => s.select(backends),
        }
    }

    /// Uses the key when the underlying selector understands one.
    pub fn select_for(&self, backends: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>> {
        match self {
            AnySelector::Plain(s) => s.select(backends),
            AnySelector::Keyed(s) => s.select_with_key(backends, key),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnySelector::Plain(s) => s.name(),
            AnySelector::Keyed(s) => s.name(),
        }
    }
}

/// Build the selector named by the configuration.
pub fn build_selector(config: &LoadBalancerConfig) -> AnySelector {
    use crate::config::Algorithm;

    match config.algorithm {
        Algorithm::RoundRobin => AnySelector::Plain(Box::new(RoundRobin::new())),
        Algorithm::LeastConnections => AnySelector::Plain(Box::new(LeastConnections::new())),
        Algorithm::WeightedRoundRobin => {
            AnySelector::Plain(Box::new(WeightedRoundRobin::new()))
        }
        Algorithm::WeightedLeastConnections => {
            AnySelector::Plain(Box::new(WeightedLeastConnections::new()))
        }
        Algorithm::ConsistentHash => {
            AnySelector::Keyed(Box::new(ConsistentHash::new(config.virtual_nodes)))
        }
        Algorithm::BoundedConsistentHash => AnySelector::Keyed(Box::new(
            BoundedLoadConsistentHash::new(config.virtual_nodes, config.load_factor),
        )),
    }
}

/// Build the configured selector, wrapped in the sticky-session overlay
/// (with its sweeper running) when affinity is enabled.
pub fn build_chooser(
    config: &LoadBalancerConfig,
    token: &tokio_util::sync::CancellationToken,
) -> BackendChooser {
    let selector = build_selector(config);
    if config.sticky_sessions.enabled {
        let wrapper = Arc::new(AffinityWrapper::new(
            selector,
            config.sticky_sessions.timeout(),
        ));
        wrapper.start_sweeper(token.child_token());
        BackendChooser::Sticky(wrapper)
    } else {
        BackendChooser::Direct(selector)
    }
}

/// Selection entry point used by both dispatchers: either straight through
/// the configured selector or via the sticky-session overlay.
pub enum BackendChooser {
    Direct(AnySelector),
    Sticky(Arc<AffinityWrapper>),
}

impl BackendChooser {
    pub fn choose(&self, backends: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>> {
        match self {
            BackendChooser::Direct(selector) => selector.select_for(backends, key),
            BackendChooser::Sticky(affinity) => affinity.select_with_client_key(backends, key),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendChooser::Direct(selector) => selector.name(),
            BackendChooser::Sticky(affinity) => affinity.name(),
        }
    }
}
