// src/relay/buffered.rs
use super::{is_benign_close, RelayLimits, RelayOutcome};
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const COPY_BUF_SIZE: usize = 32 * 1024;
// At most 1 MiB of copy buffers retained across sessions.
const MAX_POOLED_BUFFERS: usize = 32;

static BUFFER_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

fn take_buffer() -> Vec<u8> {
    BUFFER_POOL
        .lock()
        .expect("buffer pool lock poisoned")
        .pop()
        .unwrap_or_else(|| vec![0u8; COPY_BUF_SIZE])
}

fn return_buffer(buf: Vec<u8>) {
    let mut pool = BUFFER_POOL.lock().expect("buffer pool lock poisoned");
    if pool.len() < MAX_POOLED_BUFFERS {
        pool.push(buf);
    }
}

pub(super) async fn copy_bidirectional<A, B>(
    client: A,
    backend: B,
    limits: &RelayLimits,
) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let c2b = copy_one_direction(&mut client_rd, &mut backend_wr, limits);
    let b2c = copy_one_direction(&mut backend_rd, &mut client_wr, limits);
    let ((client_to_backend, err_c2b), (backend_to_client, err_b2c)) = tokio::join!(c2b, b2c);

    RelayOutcome {
        client_to_backend,
        backend_to_client,
        error: err_c2b.or(err_b2c),
    }
}

/// Copy until EOF or error, then half-close the write side so the peer
/// sees end-of-stream while the opposite direction keeps running.
async fn copy_one_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    limits: &RelayLimits,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = take_buffer();
    let mut total = 0u64;
    let error = loop {
        let n = match read_bounded(reader, &mut buf, limits.read_timeout).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(ref e) if is_benign_close(e) => break None,
            Err(e) => break Some(e),
        };
        match write_bounded(writer, &buf[..n], limits.write_timeout).await {
            Ok(()) => total += n as u64,
            Err(ref e) if is_benign_close(e) => break None,
            Err(e) => break Some(e),
        }
    };
    let _ = writer.shutdown().await;
    return_buffer(buf);
    (total, error)
}

async fn read_bounded<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Option<Duration>,
) -> io::Result<usize> {
    match deadline {
        Some(d) => timeout(d, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
        None => reader.read(buf).await,
    }
}

async fn write_bounded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    deadline: Option<Duration>,
) -> io::Result<()> {
    match deadline {
        Some(d) => timeout(d, writer.write_all(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?,
        None => writer.write_all(data).await,
    }
}
