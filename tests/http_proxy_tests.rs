// tests/http_proxy_tests.rs
//
// End-to-end coverage for the L7 dispatcher: distribution, routing,
// header rewriting, error mapping, WebSocket tunneling.
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use waypoint::config::{
    BackendConfig, HealthCheckConfig, HttpConfig, LoadBalancerConfig, RouteConfig, TimeoutConfig,
};
use waypoint::health::HealthOrchestrator;
use waypoint::metrics::MetricsRegistry;
use waypoint::proxy::BackendPool;
use waypoint::server::{HttpProxy, HyperUpstream, RouteTable};

/// Backend answering with its name in the body and echoing every request
/// header back as `x-saw-<name>`.
async fn spawn_http_backend(name: &'static str) -> String {
    let make_service = make_service_fn(move |_| async move {
        Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
            let mut builder = Response::builder().status(StatusCode::OK);
            for (header_name, value) in req.headers() {
                let echo_name = format!("x-saw-{header_name}");
                builder = builder.header(echo_name.as_str(), value.clone());
            }
            Ok::<_, Infallible>(builder.body(Body::from(name)).unwrap())
        }))
    });

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = Server::bind(&addr).serve(make_service);
    let address = server.local_addr().to_string();
    tokio::spawn(async move {
        let _ = server.await;
    });
    address
}

struct Harness {
    proxy_addr: String,
    pool: Arc<BackendPool>,
    token: CancellationToken,
    run_task: tokio::task::JoinHandle<()>,
}

async fn start_proxy(backends: Vec<BackendConfig>, routes: Vec<RouteConfig>) -> Harness {
    let token = CancellationToken::new();
    let pool = Arc::new(BackendPool::new(&backends));
    let health = Arc::new(HealthOrchestrator::new(
        HealthCheckConfig::default(),
        Arc::clone(&pool),
        token.child_token(),
    ));
    let metrics = MetricsRegistry::new().unwrap().collector();
    let http_config = HttpConfig::default();
    let timeouts = TimeoutConfig {
        connect_secs: 2,
        read_secs: 5,
        write_secs: 5,
        idle_secs: 10,
    };
    let router = RouteTable::compile(&routes, &LoadBalancerConfig::default(), &pool, &token).unwrap();
    let upstream = Arc::new(HyperUpstream::new(&http_config, &timeouts));
    let proxy = Arc::new(HttpProxy::new(
        router,
        health,
        None,
        None,
        upstream,
        timeouts,
        true,
        metrics,
        token.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap().to_string();
    let run_task = tokio::spawn(async move {
        proxy.run(listener).await.unwrap();
    });

    Harness {
        proxy_addr,
        pool,
        token,
        run_task,
    }
}

fn backend(name: &str, address: String) -> BackendConfig {
    BackendConfig {
        name: name.into(),
        address,
        weight: 1,
        max_connections: 0,
    }
}

async fn shutdown(harness: Harness) {
    harness.token.cancel();
    let _ = timeout(Duration::from_secs(5), harness.run_task).await;
}

#[tokio::test]
async fn requests_are_distributed_round_robin() {
    let a = spawn_http_backend("a").await;
    let b = spawn_http_backend("b").await;
    let c = spawn_http_backend("c").await;
    let harness = start_proxy(
        vec![backend("a", a), backend("b", b), backend("c", c)],
        vec![],
    )
    .await;

    let client = Client::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..300 {
        let uri = format!("http://{}/", harness.proxy_addr).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        *counts
            .entry(String::from_utf8_lossy(&body).to_string())
            .or_default() += 1;
    }

    assert_eq!(counts["a"], 100);
    assert_eq!(counts["b"], 100);
    assert_eq!(counts["c"], 100);
    shutdown(harness).await;
}

#[tokio::test]
async fn no_healthy_backend_yields_503() {
    let a = spawn_http_backend("a").await;
    let harness = start_proxy(vec![backend("a", a)], vec![]).await;
    harness.pool.get("a").unwrap().set_healthy(false);

    let client = Client::new();
    let uri = format!("http://{}/", harness.proxy_addr).parse().unwrap();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    shutdown(harness).await;
}

#[tokio::test]
async fn dead_backend_yields_502_and_is_marked_unhealthy() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    };
    let harness = start_proxy(vec![backend("dead", dead)], vec![]).await;

    let client = Client::new();
    let uri = format!("http://{}/", harness.proxy_addr).parse().unwrap();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!harness.pool.get("dead").unwrap().is_healthy());
    shutdown(harness).await;
}

#[tokio::test]
async fn routes_take_priority_over_default_pool() {
    let general = spawn_http_backend("general").await;
    let api = spawn_http_backend("api").await;
    let harness = start_proxy(
        vec![backend("general", general), backend("api", api)],
        vec![RouteConfig {
            name: "api".into(),
            host: None,
            path_prefix: Some("/api".into()),
            headers: None,
            backends: vec!["api".into()],
            priority: 10,
            transform: None,
        }],
    )
    .await;

    let client = Client::new();
    for _ in 0..3 {
        let uri = format!("http://{}/api/users", harness.proxy_addr)
            .parse()
            .unwrap();
        let body = hyper::body::to_bytes(client.get(uri).await.unwrap().into_body())
            .await
            .unwrap();
        assert_eq!(&body[..], b"api");
    }

    let uri = format!("http://{}/other", harness.proxy_addr).parse().unwrap();
    let body = hyper::body::to_bytes(client.get(uri).await.unwrap().into_body())
        .await
        .unwrap();
    assert!(&body[..] == b"general" || &body[..] == b"api");
    shutdown(harness).await;
}

#[tokio::test]
async fn forwarding_headers_are_added_and_hop_by_hop_stripped() {
    let a = spawn_http_backend("a").await;
    let harness = start_proxy(vec![backend("a", a)], vec![]).await;

    // Raw client so arbitrary hop-by-hop headers reach the proxy.
    let mut stream = TcpStream::connect(harness.proxy_addr.as_str()).await.unwrap();
    let request = format!(
        "GET /check HTTP/1.1\r\n\
         Host: app.example.com\r\n\
         X-Forwarded-For: 1.2.3.4\r\n\
         Connection: close, x-secret-hop\r\n\
         X-Secret-Hop: leak\r\n\
         Keep-Alive: timeout=5\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&response).to_ascii_lowercase();

    assert!(text.starts_with("http/1.1 200"));
    assert!(text.contains("x-saw-x-forwarded-for: 1.2.3.4, 127.0.0.1"));
    assert!(text.contains("x-saw-x-real-ip: 127.0.0.1"));
    assert!(text.contains("x-saw-x-forwarded-proto: http"));
    assert!(text.contains("x-saw-x-forwarded-host: app.example.com"));
    // Hop-by-hop and Connection-named headers never reach the backend.
    assert!(!text.contains("x-saw-x-secret-hop"));
    assert!(!text.contains("x-saw-keep-alive"));
    shutdown(harness).await;
}

/// Raw WebSocket-style backend: accepts the upgrade and echoes bytes.
async fn spawn_ws_echo_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head_text = String::from_utf8_lossy(&head).to_ascii_lowercase();
                assert!(head_text.contains("upgrade: websocket"));
                assert!(head_text.contains("connection: upgrade"));

                stream
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\n\
                          Upgrade: websocket\r\n\
                          Connection: Upgrade\r\n\
                          \r\n",
                    )
                    .await
                    .unwrap();

                // Opaque echo after the upgrade.
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    address
}

#[tokio::test]
async fn websocket_upgrade_becomes_a_byte_tunnel() {
    let ws = spawn_ws_echo_backend().await;
    let harness = start_proxy(vec![backend("ws", ws)], vec![]).await;

    let mut stream = TcpStream::connect(harness.proxy_addr.as_str()).await.unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: ws.example.com\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              \r\n",
        )
        .await
        .unwrap();

    // Read the 101 response head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "proxy closed before the upgrade completed");
        head.push(byte[0]);
    }
    let head_text = String::from_utf8_lossy(&head).to_ascii_lowercase();
    assert!(head_text.starts_with("http/1.1 101"));
    assert!(head_text.contains("upgrade: websocket"));

    // The tunnel relays raw bytes unmodified.
    let payload = [0xDE, 0xAD, 0xBE, 0xEF];
    stream.write_all(&payload).await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    shutdown(harness).await;
}

#[tokio::test]
async fn path_transform_strips_route_prefix() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    // Backend that answers with the path it received.
    let make_service = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            Ok::<_, Infallible>(Response::new(Body::from(req.uri().path().to_string())))
        }))
    });
    let server = Server::from_tcp(listener.into_std().unwrap())
        .unwrap()
        .serve(make_service);
    tokio::spawn(async move {
        let _ = server.await;
    });

    let harness = start_proxy(
        vec![backend("a", address)],
        vec![RouteConfig {
            name: "api".into(),
            host: None,
            path_prefix: Some("/api".into()),
            headers: None,
            backends: vec!["a".into()],
            priority: 0,
            transform: Some(waypoint::config::TransformConfig {
                strip_prefix: Some("/api".into()),
                ..waypoint::config::TransformConfig::default()
            }),
        }],
    )
    .await;

    let client = Client::new();
    let uri = format!("http://{}/api/users", harness.proxy_addr)
        .parse()
        .unwrap();
    let body = hyper::body::to_bytes(client.get(uri).await.unwrap().into_body())
        .await
        .unwrap();
    assert_eq!(&body[..], b"/users");
    shutdown(harness).await;
}
