// src/relay/mod.rs
mod buffered;
#[cfg(target_os = "linux")]
mod splice;

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Per-direction deadlines applied inside the copy loops.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayLimits {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl RelayLimits {
    pub fn new(read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        Self {
            read_timeout,
            write_timeout,
        }
    }
}

/// What a finished relay looked like: bytes moved per direction plus the
/// first hard error, if any. Peer resets and broken pipes count as normal
/// ends of stream.
#[derive(Debug)]
pub struct RelayOutcome {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub error: Option<io::Error>,
}

/// Copy both directions between two sockets until each side reaches EOF,
/// half-closing the opposite write side as a direction finishes.
///
/// On Linux the bytes move through a transient pipe pair with `splice`;
/// if the pipes cannot be created, or on other platforms, a buffered copy
/// is used. Callers never branch on platform.
pub async fn copy_bidirectional_streams(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    limits: &RelayLimits,
) -> RelayOutcome {
    #[cfg(target_os = "linux")]
    {
        match splice::Pipes::new() {
            Ok(pipes) => return splice::copy_bidirectional(client, backend, pipes, limits).await,
            Err(err) => {
                tracing::debug!(%err, "splice unavailable, falling back to buffered copy");
            }
        }
    }
    buffered::copy_bidirectional(client, backend, limits).await
}

/// Buffered variant for already-upgraded byte tunnels (e.g. WebSocket)
/// where the endpoints are not raw sockets.
pub async fn copy_bidirectional_io<A, B>(client: A, backend: B, limits: &RelayLimits) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffered::copy_bidirectional(client, backend, limits).await
}

/// A peer tearing down mid-stream is an end of stream, not a relay fault.
fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn relays_bytes_both_ways_and_counts_them() {
        let (mut client_near, mut client_far) = connected_pair().await;
        let (mut backend_near, mut backend_far) = connected_pair().await;

        let relay = tokio::spawn(async move {
            copy_bidirectional_streams(&mut client_far, &mut backend_near, &RelayLimits::default())
                .await
        });

        client_near.write_all(b"ping-from-client").await.unwrap();
        let mut buf = [0u8; 16];
        backend_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping-from-client");

        backend_far.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Close both ends so the relay drains.
        drop(client_near);
        drop(backend_far);
        let outcome = relay.await.unwrap();
        assert!(outcome.error.is_none(), "error: {:?}", outcome.error);
        assert_eq!(outcome.client_to_backend, 16);
        assert_eq!(outcome.backend_to_client, 4);
    }

    #[tokio::test]
    async fn half_close_propagates_to_the_other_side() {
        let (mut client_near, mut client_far) = connected_pair().await;
        let (mut backend_near, mut backend_far) = connected_pair().await;

        let relay = tokio::spawn(async move {
            copy_bidirectional_streams(&mut client_far, &mut backend_near, &RelayLimits::default())
                .await
        });

        client_near.write_all(b"bye").await.unwrap();
        client_near.shutdown().await.unwrap();

        // Backend sees the payload, then EOF.
        let mut buf = Vec::new();
        backend_far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");

        // The reverse direction still works after the half-close.
        backend_far.write_all(b"ack").await.unwrap();
        drop(backend_far);
        let mut buf = Vec::new();
        client_near.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ack");

        let outcome = relay.await.unwrap();
        assert_eq!(outcome.client_to_backend, 3);
        assert_eq!(outcome.backend_to_client, 3);
    }

    #[tokio::test]
    async fn large_transfer_is_not_truncated() {
        let (mut client_near, mut client_far) = connected_pair().await;
        let (mut backend_near, mut backend_far) = connected_pair().await;

        let relay = tokio::spawn(async move {
            copy_bidirectional_streams(&mut client_far, &mut backend_near, &RelayLimits::default())
                .await
        });

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_near.write_all(&payload).await.unwrap();
            client_near.shutdown().await.unwrap();
            client_near
        });

        let mut received = Vec::new();
        backend_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);

        drop(backend_far);
        let _client = writer.await.unwrap();
        let outcome = relay.await.unwrap();
        assert_eq!(outcome.client_to_backend, 1_000_000);
    }

    #[tokio::test]
    async fn read_timeout_surfaces_as_error() {
        let (client_near, mut client_far) = connected_pair().await;
        let (mut backend_near, backend_far) = connected_pair().await;

        let limits = RelayLimits::new(Some(Duration::from_millis(100)), None);
        let outcome =
            copy_bidirectional_streams(&mut client_far, &mut backend_near, &limits).await;

        assert!(outcome.error.is_some());
        assert_eq!(
            outcome.error.as_ref().unwrap().kind(),
            io::ErrorKind::TimedOut
        );
        drop(client_near);
        drop(backend_far);
    }
}
