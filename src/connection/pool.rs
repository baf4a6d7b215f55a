// src/connection/pool.rs
use crate::config::ConnectionPoolConfig;
use crate::error::{ProxyError, TimeoutPhase};
use crate::proxy::Backend;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct IdleConn {
    stream: TcpStream,
    last_used: Instant,
}

/// Bounded cache of reusable TCP connections to one backend address.
///
/// Semaphore permits bound the number of borrowed connections; idle
/// entries hold no permit, so `active` (borrowed + idle sockets) never
/// exceeds `max_size`. Borrowers wait on the semaphore when the pool is
/// saturated and can bail out through their cancellation token without
/// leaking capacity.
pub struct ConnectionPool {
    address: String,
    max_size: usize,
    max_idle_time: Duration,
    connect_timeout: Duration,

    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn>>,
    active: AtomicUsize,
    closed: AtomicBool,

    total_created: AtomicU64,
    total_reused: AtomicU64,

    token: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_reused: u64,
    pub max_size: usize,
}

impl ConnectionPool {
    pub fn new(
        address: impl Into<String>,
        config: &ConnectionPoolConfig,
        connect_timeout: Duration,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            address: address.into(),
            max_size: config.max_size.max(1),
            max_idle_time: config.max_idle_time(),
            connect_timeout,
            semaphore: Arc::new(Semaphore::new(config.max_size.max(1))),
            idle: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            token: parent.child_token(),
            sweeper: tokio::sync::Mutex::new(None),
        });
        pool.spawn_sweeper();
        pool
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.sweep_idle(),
                    _ = pool.token.cancelled() => break,
                }
            }
        });
        // new() runs once; the slot is always empty here.
        if let Ok(mut slot) = self.sweeper.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Borrow a connection: reuse a live idle one, dial a fresh one under
    /// capacity, or wait for a return. Cancellation while waiting refunds
    /// the reservation.
    pub async fn get(self: &Arc<Self>, token: &CancellationToken) -> Result<PooledConnection, ProxyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::PoolClosed);
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| ProxyError::PoolClosed)?
            }
            _ = token.cancelled() => return Err(ProxyError::Cancelled),
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::PoolClosed);
        }

        self.checkout(permit).await
    }

    /// Non-waiting variant: a saturated pool surfaces `PoolExhausted`
    /// immediately.
    pub async fn try_get(self: &Arc<Self>) -> Result<PooledConnection, ProxyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::PoolClosed);
        }
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| ProxyError::PoolExhausted)?;
        self.checkout(permit).await
    }

    async fn checkout(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledConnection, ProxyError> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock().expect("idle lock poisoned");
                idle.pop_front()
            };
            let Some(idle_conn) = candidate else { break };

            if Self::is_live(&idle_conn.stream) {
                self.total_reused.fetch_add(1, Ordering::Relaxed);
                trace!(address = %self.address, "reusing pooled connection");
                return Ok(PooledConnection::new(idle_conn.stream, permit, self));
            }
            // Broken while idle; drop the socket and keep scanning.
            self.active.fetch_sub(1, Ordering::AcqRel);
            debug!(address = %self.address, "discarded dead idle connection");
        }

        match timeout(self.connect_timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(Ok(stream)) => {
                self.active.fetch_add(1, Ordering::AcqRel);
                self.total_created.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(stream, permit, self))
            }
            Ok(Err(source)) => Err(ProxyError::DialFailed {
                address: self.address.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::Timeout {
                phase: TimeoutPhase::Connect,
                timeout: self.connect_timeout,
            }),
        }
    }

    /// A readable socket with nothing buffered reports `WouldBlock`;
    /// anything else (EOF, stray bytes, hard error) means the connection
    /// is not safe to hand out.
    fn is_live(stream: &TcpStream) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            stream.try_read(&mut buf),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        )
    }

    fn release(&self, stream: TcpStream, discard: bool) {
        if discard || self.closed.load(Ordering::Acquire) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let mut idle = self.idle.lock().expect("idle lock poisoned");
        if idle.len() >= self.max_size {
            drop(idle);
            self.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        idle.push_back(IdleConn {
            stream,
            last_used: Instant::now(),
        });
    }

    fn sweep_idle(&self) {
        let mut idle = self.idle.lock().expect("idle lock poisoned");
        let before = idle.len();
        let max_idle_time = self.max_idle_time;
        idle.retain(|conn| conn.last_used.elapsed() <= max_idle_time);
        let removed = before - idle.len();
        drop(idle);
        if removed > 0 {
            self.active.fetch_sub(removed, Ordering::AcqRel);
            debug!(address = %self.address, removed, "closed idle connections");
        }
    }

    /// Mark closed, drop every idle socket, stop the sweeper, and refuse
    /// future borrows.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = {
            let mut idle = self.idle.lock().expect("idle lock poisoned");
            let drained = idle.len();
            idle.clear();
            drained
        };
        if drained > 0 {
            self.active.fetch_sub(drained, Ordering::AcqRel);
        }
        // Wake anyone parked on the semaphore so they see PoolClosed.
        self.semaphore.close();
        self.token.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        debug!(address = %self.address, "connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Acquire),
            idle: self.idle.lock().expect("idle lock poisoned").len(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            max_size: self.max_size,
        }
    }
}

/// A borrowed connection. Dropping it returns the socket to the pool;
/// `mark_broken` discards it instead.
pub struct PooledConnection {
    stream: Option<TcpStream>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool>,
    discard: bool,
}

impl PooledConnection {
    fn new(stream: TcpStream, permit: OwnedSemaphorePermit, pool: &Arc<ConnectionPool>) -> Self {
        Self {
            stream: Some(stream),
            permit: Some(permit),
            pool: Arc::clone(pool),
            discard: false,
        }
    }

    pub fn mark_broken(&mut self) {
        self.discard = true;
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("stream taken")
    }
}

impl Deref for PooledConnection {
    type Target = TcpStream;

    fn deref(&self) -> &Self::Target {
        self.stream.as_ref().expect("stream taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.stream.as_mut().expect("stream taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Push back before the permit drops so a waiter that wakes up
            // finds the idle entry.
            self.pool.release(stream, self.discard);
        }
        self.permit.take();
    }
}

/// One pool per backend address, created on first use.
pub struct ConnectionPoolManager {
    config: ConnectionPoolConfig,
    connect_timeout: Duration,
    pools: DashMap<String, Arc<ConnectionPool>>,
    token: CancellationToken,
}

impl ConnectionPoolManager {
    pub fn new(
        config: ConnectionPoolConfig,
        connect_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            connect_timeout,
            pools: DashMap::new(),
            token,
        }
    }

    pub fn pool_for(&self, backend: &Backend) -> Arc<ConnectionPool> {
        self.pools
            .entry(backend.address.clone())
            .or_insert_with(|| {
                ConnectionPool::new(
                    backend.address.clone(),
                    &self.config,
                    self.connect_timeout,
                    &self.token,
                )
            })
            .clone()
    }

    pub async fn close_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}
