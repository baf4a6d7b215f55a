// src/relay/splice.rs
//
// Zero-copy relay: socket -> pipe -> socket via splice(2). Each direction
// owns one pipe; the pipe is always fully drained before the next fill, so
// EAGAIN from the fill can only mean "socket not readable" and EAGAIN from
// the drain can only mean "socket not writable".
use super::{is_benign_close, RelayLimits, RelayOutcome};
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::timeout;

// Must not exceed the default pipe capacity, or draining could stall.
const SPLICE_LEN: usize = 64 * 1024;

struct Pipe {
    rd: OwnedFd,
    wr: OwnedFd,
}

pub(super) struct Pipes {
    c2b: Pipe,
    b2c: Pipe,
}

impl Pipes {
    pub(super) fn new() -> io::Result<Self> {
        Ok(Self {
            c2b: new_pipe()?,
            b2c: new_pipe()?,
        })
    }
}

fn new_pipe() -> io::Result<Pipe> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Pipe {
        rd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
        wr: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
}

pub(super) async fn copy_bidirectional(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    pipes: Pipes,
    limits: &RelayLimits,
) -> RelayOutcome {
    let (client, backend) = (&*client, &*backend);
    let c2b = splice_one_direction(client, backend, &pipes.c2b, limits);
    let b2c = splice_one_direction(backend, client, &pipes.b2c, limits);
    let ((client_to_backend, err_c2b), (backend_to_client, err_b2c)) = tokio::join!(c2b, b2c);

    RelayOutcome {
        client_to_backend,
        backend_to_client,
        error: err_c2b.or(err_b2c),
    }
}

async fn splice_one_direction(
    src: &TcpStream,
    dst: &TcpStream,
    pipe: &Pipe,
    limits: &RelayLimits,
) -> (u64, Option<io::Error>) {
    let mut total = 0u64;
    let error = loop {
        let filled = match bounded(limits.read_timeout, fill_pipe(src, pipe)).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(ref e) if is_benign_close(e) => break None,
            Err(e) => break Some(e),
        };

        let mut remaining = filled;
        let mut failed: Option<io::Error> = None;
        while remaining > 0 {
            match bounded(limits.write_timeout, drain_pipe(dst, pipe, remaining)).await {
                Ok(0) => {
                    failed = Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to drain splice pipe",
                    ));
                    break;
                }
                Ok(n) => {
                    remaining -= n;
                    total += n as u64;
                }
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            break if is_benign_close(&e) { None } else { Some(e) };
        }
    };
    shutdown_write(dst);
    (total, error)
}

async fn fill_pipe(src: &TcpStream, pipe: &Pipe) -> io::Result<usize> {
    let (src_fd, pipe_wr) = (src.as_raw_fd(), pipe.wr.as_raw_fd());
    src.async_io(Interest::READABLE, || splice(src_fd, pipe_wr, SPLICE_LEN))
        .await
}

async fn drain_pipe(dst: &TcpStream, pipe: &Pipe, len: usize) -> io::Result<usize> {
    let (pipe_rd, dst_fd) = (pipe.rd.as_raw_fd(), dst.as_raw_fd());
    dst.async_io(Interest::WRITABLE, || splice(pipe_rd, dst_fd, len))
        .await
}

fn splice(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::splice(
                from,
                std::ptr::null_mut(),
                to,
                std::ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

async fn bounded<F>(deadline: Option<Duration>, op: F) -> io::Result<usize>
where
    F: Future<Output = io::Result<usize>>,
{
    match deadline {
        Some(d) => timeout(d, op)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay deadline elapsed"))?,
        None => op.await,
    }
}

fn shutdown_write(stream: &TcpStream) {
    unsafe {
        libc::shutdown(stream.as_raw_fd(), libc::SHUT_WR);
    }
}
