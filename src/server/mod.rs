// src/server/mod.rs
mod http;
mod rewrite;
mod router;
mod tcp;
mod upstream;

pub use http::{HttpProxy, ProxyService};
pub use rewrite::{
    apply_forwarding_headers, apply_header_transform, client_key, forwarded_proto,
    is_websocket_upgrade, rewrite_path, strip_hop_by_hop, HOP_BY_HOP_HEADERS,
};
pub use router::{RouteTable, RouteTarget};
pub use tcp::TcpProxy;
pub use upstream::{HyperUpstream, UpstreamClient};
