// src/server/rewrite.rs
//
// Header and path edits between the client-facing and backend-facing
// sides of a forwarded request. Everything else passes through untouched.
use crate::config::TransformConfig;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::http::uri::Uri;
use hyper::Request;
use std::net::SocketAddr;
use tracing::warn;

/// Headers that apply to a single transport hop and must not be forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// `Upgrade: websocket` plus a `Connection` header listing `upgrade`,
/// both case-insensitive.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let wants_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrades = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    wants_websocket && connection_upgrades
}

/// Client key: X-Forwarded-For head, then X-Real-IP, then the socket peer.
pub fn client_key<B>(req: &Request<B>, peer: SocketAddr) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.ip().to_string()
}

/// Request host with any port stripped, from the URI authority or the
/// Host header.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    let host = req.headers().get("host")?.to_str().ok()?;
    Some(strip_port(host).to_string())
}

pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

/// Remove the standard hop-by-hop set plus anything the Connection header
/// names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in connection_named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Standard reverse-proxy identification headers.
pub fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    client_ip: &str,
    original_host: Option<&str>,
    proto: &str,
) {
    let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert("x-forwarded-for", value);
    }

    if let Some(host) = original_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert("x-real-ip", value);
    }
}

/// The effective scheme seen by the client: an inbound
/// X-Forwarded-Proto wins, otherwise plain http.
pub fn forwarded_proto(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "http".to_string())
}

/// Configured add/set/remove header edits.
pub fn apply_header_transform(headers: &mut HeaderMap, transform: &TransformConfig) {
    for (name, value) in &transform.add_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "skipping invalid add_headers entry"),
        }
    }
    for (name, value) in &transform.set_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid set_headers entry"),
        }
    }
    for name in &transform.remove_headers {
        headers.remove(name.as_str());
    }
}

/// Optional prefix strip/add on the request path.
pub fn rewrite_path(path: &str, transform: &TransformConfig) -> String {
    let mut path = path.to_string();
    if let Some(prefix) = &transform.strip_prefix {
        if let Some(rest) = path.strip_prefix(prefix.as_str()) {
            path = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            };
        }
    }
    if let Some(prefix) = &transform.add_prefix {
        path = format!("{}{}", prefix.trim_end_matches('/'), path);
    }
    path
}

/// Absolute-form URI pointing the request at the chosen backend.
pub fn upstream_uri(address: &str, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
    format!("http://{address}{path_and_query}")
        .parse::<Uri>()
        .map_err(hyper::http::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Body;

    fn request_with(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn websocket_upgrade_detection_is_case_insensitive() {
        let req = request_with(&[("Upgrade", "WebSocket"), ("Connection", "keep-alive, Upgrade")]);
        assert!(is_websocket_upgrade(req.headers()));

        let req = request_with(&[("Upgrade", "websocket")]);
        assert!(!is_websocket_upgrade(req.headers()));

        let req = request_with(&[("Connection", "upgrade")]);
        assert!(!is_websocket_upgrade(req.headers()));
    }

    #[test]
    fn client_key_prefers_forwarded_chain_head() {
        let peer: SocketAddr = "192.0.2.9:4321".parse().unwrap();
        let req = request_with(&[("X-Forwarded-For", "10.0.0.1, 10.0.0.2")]);
        assert_eq!(client_key(&req, peer), "10.0.0.1");

        let req = request_with(&[("X-Real-IP", "10.9.9.9")]);
        assert_eq!(client_key(&req, peer), "10.9.9.9");

        let req = request_with(&[]);
        assert_eq!(client_key(&req, peer), "192.0.2.9");
    }

    #[test]
    fn hop_by_hop_and_connection_named_headers_are_stripped() {
        let mut req = request_with(&[
            ("Connection", "close, x-custom-hop"),
            ("Keep-Alive", "timeout=5"),
            ("Transfer-Encoding", "chunked"),
            ("X-Custom-Hop", "secret"),
            ("X-Keep-Me", "yes"),
        ]);
        strip_hop_by_hop(req.headers_mut());

        assert!(req.headers().get("connection").is_none());
        assert!(req.headers().get("keep-alive").is_none());
        assert!(req.headers().get("transfer-encoding").is_none());
        assert!(req.headers().get("x-custom-hop").is_none());
        assert_eq!(req.headers().get("x-keep-me").unwrap(), "yes");
    }

    #[test]
    fn forwarding_headers_append_and_set() {
        let mut req = request_with(&[("X-Forwarded-For", "10.0.0.1")]);
        apply_forwarding_headers(req.headers_mut(), "192.0.2.9", Some("app.example.com"), "http");

        assert_eq!(
            req.headers().get("x-forwarded-for").unwrap(),
            "10.0.0.1, 192.0.2.9"
        );
        assert_eq!(
            req.headers().get("x-forwarded-host").unwrap(),
            "app.example.com"
        );
        assert_eq!(req.headers().get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(req.headers().get("x-real-ip").unwrap(), "192.0.2.9");
    }

    #[test]
    fn inbound_proto_is_preserved() {
        let req = request_with(&[("X-Forwarded-Proto", "https")]);
        assert_eq!(forwarded_proto(req.headers()), "https");
        let req = request_with(&[]);
        assert_eq!(forwarded_proto(req.headers()), "http");
    }

    #[test]
    fn header_transform_add_set_remove() {
        let mut req = request_with(&[("x-env", "prod"), ("x-drop", "1")]);
        let transform = TransformConfig {
            add_headers: [("x-env".to_string(), "edge".to_string())].into(),
            set_headers: [("x-tier".to_string(), "gold".to_string())].into(),
            remove_headers: vec!["x-drop".to_string()],
            strip_prefix: None,
            add_prefix: None,
        };
        apply_header_transform(req.headers_mut(), &transform);

        let env: Vec<_> = req.headers().get_all("x-env").iter().collect();
        assert_eq!(env.len(), 2);
        assert_eq!(req.headers().get("x-tier").unwrap(), "gold");
        assert!(req.headers().get("x-drop").is_none());
    }

    #[test]
    fn path_strip_and_add_prefix() {
        let transform = TransformConfig {
            strip_prefix: Some("/api".to_string()),
            add_prefix: Some("/v2".to_string()),
            ..TransformConfig::default()
        };
        assert_eq!(rewrite_path("/api/users", &transform), "/v2/users");

        let strip_only = TransformConfig {
            strip_prefix: Some("/api".to_string()),
            ..TransformConfig::default()
        };
        assert_eq!(rewrite_path("/api", &strip_only), "/");
        assert_eq!(rewrite_path("/other", &strip_only), "/other");
    }

    #[test]
    fn strip_port_handles_ipv6_literals() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let uri = upstream_uri("127.0.0.1:9001", "/a/b?x=1").unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9001/a/b?x=1");
    }
}
