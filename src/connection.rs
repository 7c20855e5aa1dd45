//! Connection management: pooled connections and the per-endpoint pool.
//!
//! The pool bounds concurrent checkouts with a semaphore sized to its
//! capacity, keeps released connections on a LIFO stack behind a mutex, and
//! runs two background tasks: an idle reaper and, once dial failures reach
//! capacity, a redial probe that keeps the circuit breaker tripped until the
//! endpoint answers again.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{FdfsError, Result};
use crate::reader::FrameReader;

/// Future returned by a dial function
pub type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// Async dial function a pool uses to create sockets
pub type Dialer = Arc<dyn Fn() -> DialFuture + Send + Sync>;

/// Default TCP dialer: connect to `addr` within `dial_timeout`, NODELAY set
pub fn default_dialer(addr: &str, dial_timeout: Duration) -> Dialer {
    let addr = addr.to_string();
    let dial_timeout = if dial_timeout.is_zero() {
        Duration::from_secs(60)
    } else {
        dial_timeout
    };
    Arc::new(move || {
        let addr = addr.clone();
        Box::pin(async move {
            let stream = timeout(dial_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", addr),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    })
}

/// One live socket plus its frame reader and last-used timestamp.
///
/// While checked out the connection also carries its pool admission permit,
/// so every exit path (put, remove, or plain drop) frees exactly one slot.
#[derive(Debug)]
pub struct Conn {
    writer: OwnedWriteHalf,
    reader: FrameReader<OwnedReadHalf>,
    used_at: Instant,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Conn {
    /// Wraps an established TCP stream
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self {
            writer: write_half,
            reader: FrameReader::new(read_half),
            used_at: Instant::now(),
            local_addr,
            peer_addr,
            permit: None,
        }
    }

    /// Writes the whole buffer and refreshes the last-used timestamp
    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(buf).await?;
        self.used_at = Instant::now();
        Ok(())
    }

    /// Buffered read access to the socket
    pub fn reader(&mut self) -> &mut FrameReader<OwnedReadHalf> {
        &mut self.reader
    }

    /// Refreshes the last-used timestamp
    pub fn touch(&mut self) {
        self.used_at = Instant::now();
    }

    /// Timestamp of the last send or release
    pub fn used_at(&self) -> Instant {
        self.used_at
    }

    /// Whether the connection has been idle longer than `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        !timeout.is_zero() && self.used_at.elapsed() > timeout
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the underlying socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Pool configuration
#[derive(Clone)]
pub struct PoolOptions {
    /// Dial function used on pool misses
    pub dialer: Dialer,
    /// Maximum connections simultaneously checked out plus idle
    pub pool_size: usize,
    /// Maximum wait for an admission slot
    pub pool_timeout: Duration,
    /// Idle time after which a pooled connection is discarded
    pub idle_timeout: Duration,
    /// How often the reaper scans for stale connections; zero disables it
    pub idle_check_frequency: Duration,
}

/// Snapshot of pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Checkouts served from the idle list
    pub hits: u32,
    /// Checkouts that had to dial
    pub misses: u32,
    /// Acquisitions that gave up waiting for a slot
    pub timeouts: u32,
    /// Connections currently idle in the pool
    pub pool_conns: u32,
    /// Stale connections closed by the reaper
    pub stale_conns: u32,
}

/// Bounded pool of connections to one remote endpoint
pub struct ConnPool {
    opt: PoolOptions,
    queue: Arc<Semaphore>,
    conns: Mutex<Vec<Conn>>,
    dial_errors: AtomicU32,
    last_dial_error: std::sync::Mutex<Option<String>>,
    hits: AtomicU32,
    misses: AtomicU32,
    timeouts: AtomicU32,
    stale_conns: AtomicU32,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("pool_size", &self.opt.pool_size)
            .field("dial_errors", &self.dial_errors)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .field("timeouts", &self.timeouts)
            .field("stale_conns", &self.stale_conns)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ConnPool {
    /// Creates a pool and, when idle checking is enabled, spawns its reaper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(opt: PoolOptions) -> Arc<Self> {
        let pool = Arc::new(Self {
            queue: Arc::new(Semaphore::new(opt.pool_size)),
            conns: Mutex::new(Vec::with_capacity(opt.pool_size)),
            dial_errors: AtomicU32::new(0),
            last_dial_error: std::sync::Mutex::new(None),
            hits: AtomicU32::new(0),
            misses: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
            stale_conns: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            opt,
        });
        if !pool.opt.idle_timeout.is_zero() && !pool.opt.idle_check_frequency.is_zero() {
            tokio::spawn(Self::reaper(
                Arc::downgrade(&pool),
                pool.opt.idle_check_frequency,
            ));
        }
        pool
    }

    /// Checks out a connection, dialing on a pool miss.
    ///
    /// Waits up to the configured pool timeout for an admission slot, then
    /// pops the most recently released idle connection that is not stale.
    /// The boolean is `true` when the connection was freshly dialed.
    pub async fn get(self: &Arc<Self>) -> Result<(Conn, bool)> {
        if self.is_closed() {
            return Err(FdfsError::PoolClosed);
        }

        let permit = match timeout(self.opt.pool_timeout, self.queue.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FdfsError::PoolClosed),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(FdfsError::PoolTimeout);
            }
        };

        loop {
            let popped = self.conns.lock().await.pop();
            match popped {
                Some(conn) if conn.is_stale(self.opt.idle_timeout) => {
                    drop(conn);
                    continue;
                }
                Some(mut conn) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    conn.permit = Some(permit);
                    return Ok((conn, false));
                }
                None => break,
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.new_conn().await {
            Ok(mut conn) => {
                conn.permit = Some(permit);
                Ok((conn, true))
            }
            Err(err) => {
                drop(permit);
                Err(err)
            }
        }
    }

    /// Dials a fresh connection, subject to the circuit breaker.
    ///
    /// Once the failure counter reaches pool capacity, callers fail fast with
    /// the last recorded dial error and a background probe redials until the
    /// endpoint answers.
    pub async fn new_conn(self: &Arc<Self>) -> Result<Conn> {
        if self.is_closed() {
            return Err(FdfsError::PoolClosed);
        }

        if self.dial_errors.load(Ordering::Relaxed) >= self.opt.pool_size as u32 {
            return Err(self.replay_dial_error());
        }

        match (self.opt.dialer)().await {
            Ok(stream) => Ok(Conn::new(stream)),
            Err(err) => {
                let msg = err.to_string();
                self.record_dial_error(msg.clone());
                let failures = self.dial_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == self.opt.pool_size as u32 {
                    warn!(failures, "dial failures reached pool capacity, starting redial probe");
                    tokio::spawn(Self::try_dial(Arc::downgrade(self)));
                }
                Err(FdfsError::Dial(msg))
            }
        }
    }

    /// Background probe: redial once a second until a connect succeeds, then
    /// reset the failure counter
    async fn try_dial(weak: Weak<ConnPool>) {
        loop {
            {
                let Some(pool) = weak.upgrade() else { return };
                if pool.is_closed() {
                    return;
                }
                match (pool.opt.dialer)().await {
                    Ok(stream) => {
                        info!("redial probe succeeded, resetting dial failure counter");
                        pool.dial_errors.store(0, Ordering::Relaxed);
                        drop(stream);
                        return;
                    }
                    Err(err) => pool.record_dial_error(err.to_string()),
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn record_dial_error(&self, msg: String) {
        let mut last = self
            .last_dial_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *last = Some(msg);
    }

    fn replay_dial_error(&self) -> FdfsError {
        let last = self
            .last_dial_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        FdfsError::Dial(last.clone().unwrap_or_else(|| "dial failed".to_string()))
    }

    /// Returns a connection to the idle list and frees its admission slot
    pub async fn put(&self, mut conn: Conn) {
        let permit = conn.permit.take();
        if self.is_closed() {
            drop(conn);
        } else {
            conn.touch();
            self.conns.lock().await.push(conn);
        }
        drop(permit);
    }

    /// Closes an unhealthy connection and frees its admission slot
    pub fn remove(&self, mut conn: Conn) {
        let permit = conn.permit.take();
        drop(conn);
        drop(permit);
    }

    /// Number of idle connections
    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }

    /// Usage counter snapshot
    pub async fn stats(&self) -> Stats {
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            pool_conns: self.len().await as u32,
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
        }
    }

    /// Whether [`Self::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Closes the pool: drops all idle connections and fails pending and
    /// future acquisitions with `PoolClosed`. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.queue.close();
        self.conns.lock().await.clear();
    }

    /// One reap pass: evict stale connections from the front of the idle
    /// list, taking an admission slot per eviction so a connection cannot be
    /// reaped while a caller claims it
    async fn reap_stale_conns(&self) -> u32 {
        let mut reaped = 0;
        loop {
            let permit = match self.queue.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let evicted = {
                let mut conns = self.conns.lock().await;
                if !conns.is_empty() && conns[0].is_stale(self.opt.idle_timeout) {
                    Some(conns.remove(0))
                } else {
                    None
                }
            };
            drop(permit);
            match evicted {
                Some(conn) => {
                    drop(conn);
                    reaped += 1;
                }
                None => break,
            }
        }
        reaped
    }

    async fn reaper(weak: Weak<ConnPool>, frequency: Duration) {
        loop {
            tokio::time::sleep(frequency).await;
            let Some(pool) = weak.upgrade() else { return };
            if pool.is_closed() {
                return;
            }
            let reaped = pool.reap_stale_conns().await;
            if reaped > 0 {
                pool.stale_conns.fetch_add(reaped, Ordering::Relaxed);
                debug!(reaped, "closed stale idle connections");
            }
        }
    }
}
