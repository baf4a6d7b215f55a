// src/server/router.rs
use super::rewrite;
use crate::balance::{build_chooser, BackendChooser};
use crate::config::{LoadBalancerConfig, RouteConfig, TransformConfig};
use crate::error::ProxyError;
use crate::proxy::{Backend, BackendPool};
use hyper::Request;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The backends a matched route balances over, with that route's own
/// selector state.
pub struct RouteTarget {
    pub name: String,
    backends: Vec<Arc<Backend>>,
    pub chooser: BackendChooser,
    pub transform: Option<TransformConfig>,
}

impl RouteTarget {
    pub fn healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }
}

enum HostPattern {
    Exact(String),
    /// `*.suffix`, matching any host that ends in `.suffix`.
    Wildcard(String),
}

impl HostPattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_prefix("*.") {
            Some(suffix) => HostPattern::Wildcard(format!(".{}", suffix.to_ascii_lowercase())),
            None => HostPattern::Exact(pattern.to_ascii_lowercase()),
        }
    }

    fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        match self {
            HostPattern::Exact(exact) => host == *exact,
            HostPattern::Wildcard(dot_suffix) => host.ends_with(dot_suffix.as_str()),
        }
    }
}

struct CompiledRoute {
    host: Option<HostPattern>,
    path_prefix: Option<String>,
    headers: Vec<(String, String)>,
    priority: i32,
    target: RouteTarget,
}

impl CompiledRoute {
    fn matches<B>(&self, req: &Request<B>) -> bool {
        if let Some(pattern) = &self.host {
            let matched = rewrite::request_host(req)
                .map(|host| pattern.matches(&host))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !req.uri().path().starts_with(prefix.as_str()) {
                return false;
            }
        }
        for (name, expected) in &self.headers {
            let matched = req
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v == expected)
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        true
    }
}

/// Compiled route table: descending priority, first match wins, falling
/// back to the default pool.
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
    default: RouteTarget,
}

impl RouteTable {
    pub fn compile(
        routes: &[RouteConfig],
        lb_config: &LoadBalancerConfig,
        pool: &BackendPool,
        token: &CancellationToken,
    ) -> Result<Self, ProxyError> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            let mut backends = Vec::with_capacity(route.backends.len());
            for name in &route.backends {
                let backend = pool.get(name).ok_or_else(|| {
                    ProxyError::ConfigInvalid(format!(
                        "route {:?} references unknown backend {:?}",
                        route.name, name
                    ))
                })?;
                backends.push(backend);
            }
            compiled.push(CompiledRoute {
                host: route.host.as_deref().map(HostPattern::parse),
                path_prefix: route.path_prefix.clone(),
                headers: route
                    .headers
                    .iter()
                    .flatten()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                    .collect(),
                priority: route.priority,
                target: RouteTarget {
                    name: route.name.clone(),
                    backends,
                    chooser: build_chooser(lb_config, token),
                    transform: route.transform.clone(),
                },
            });
        }
        // Stable sort keeps configuration order within a priority tier.
        compiled.sort_by_key(|r| std::cmp::Reverse(r.priority));

        Ok(Self {
            routes: compiled,
            default: RouteTarget {
                name: "default".to_string(),
                backends: pool.snapshot_all(),
                chooser: build_chooser(lb_config, token),
                transform: None,
            },
        })
    }

    pub fn match_route<B>(&self, req: &Request<B>) -> &RouteTarget {
        self.routes
            .iter()
            .find(|route| route.matches(req))
            .map(|route| &route.target)
            .unwrap_or(&self.default)
    }

    pub fn default_target(&self) -> &RouteTarget {
        &self.default
    }
}
