//! Bounded pool of reusable HTTP connections with FIFO queuing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::ErrorKind;
use crate::retry::{Backoff, FetchError, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no connection became available within {}ms", waited.as_millis())]
    AcquireTimeout { waited: Duration },
    #[error("connection pool is closed")]
    Closed,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            PoolError::Closed => ErrorKind::PoolClosed,
        }
    }
}

/// Failure of [`ConnectionPool::fetch`]: either no connection or the call itself.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::Pool(err) => err.kind(),
            RequestError::Fetch(err) => err.kind(),
        }
    }
}

/// A leased connection. Hand it back with [`ConnectionPool::release`] (or
/// [`ConnectionPool::discard`]) so it is reused. Dropping a leased connection
/// (a cancelled fetch, a panicking holder) frees its slot instead.
pub struct PooledConnection {
    pool: Weak<PoolInner>,
    pool_id: u64,
    id: u64,
    busy: bool,
    last_used: Instant,
    retry_count: u32,
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.pool_id)
            .field("id", &self.id)
            .field("busy", &self.busy)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Retries spent by this connection since it was last released.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Send `request`, retrying per the pool's policy.
    pub async fn fetch(&mut self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let transport = self.transport.clone();
        let mut attempts: u32 = 0;
        let result = self
            .retry
            .execute(|| {
                attempts += 1;
                transport.send(request)
            })
            .await;
        self.retry_count = self
            .retry_count
            .saturating_add(attempts.saturating_sub(1));
        self.last_used = Instant::now();
        match result {
            Ok(outcome) => Ok(outcome.response),
            Err(err) => {
                debug!(conn = self.id, attempts, error = %err, "fetch failed");
                Err(err)
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Idle connections and ones already accounted for are not leases.
        if !self.busy {
            return;
        }
        self.busy = false;
        if let Some(inner) = self.pool.upgrade() {
            warn!(
                pool = inner.id,
                conn = self.id,
                "leased connection dropped without release; freeing its slot"
            );
            let mut state = inner.state.lock();
            inner.free_slot_locked(&mut state);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub max_size: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PooledConnection>,
}

struct PoolState {
    idle: VecDeque<PooledConnection>,
    total: usize,
    waiters: VecDeque<Waiter>,
    next_conn_id: u64,
    next_waiter_id: u64,
    closed: bool,
}

struct PoolInner {
    me: Weak<PoolInner>,
    id: u64,
    config: PoolConfig,
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn connection(&self, id: u64) -> PooledConnection {
        PooledConnection {
            pool: self.me.clone(),
            pool_id: self.id,
            id,
            busy: false,
            last_used: Instant::now(),
            retry_count: 0,
            transport: self.transport.clone(),
            retry: self.retry.clone(),
        }
    }

    fn create_locked(&self, state: &mut PoolState) -> PooledConnection {
        state.next_conn_id += 1;
        state.total += 1;
        self.connection(state.next_conn_id)
    }

    /// Give up one slot. A queued waiter gets a fresh connection in its place.
    fn free_slot_locked(&self, state: &mut PoolState) {
        state.total = state.total.saturating_sub(1);
        if state.closed {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            let mut conn = self.create_locked(state);
            conn.busy = true;
            match waiter.tx.send(conn) {
                Ok(()) => {
                    debug!(pool = self.id, waiter = waiter.id, "freed slot handed to waiter");
                    return;
                }
                Err(mut unclaimed) => {
                    unclaimed.busy = false;
                    state.total -= 1;
                }
            }
        }
    }

    fn reap_idle_locked(&self, state: &mut PoolState) {
        let idle_timeout = self.config.idle_timeout();
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(conn) = state.idle.pop_front() {
            if state.total > self.config.min_size && conn.last_used.elapsed() > idle_timeout {
                state.total -= 1;
                debug!(pool = self.id, conn = conn.id, "reaped idle connection");
            } else {
                kept.push_back(conn);
            }
        }
        state.idle = kept;
    }
}

/// Shared handle; clones refer to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let retry = RetryPolicy::new(
            config.max_retries,
            Backoff::exponential(config.retry_delay()),
        );
        Self::with_retry_policy(config, transport, retry)
    }

    pub fn with_retry_policy(
        mut config: PoolConfig,
        transport: Arc<dyn HttpTransport>,
        retry: RetryPolicy,
    ) -> Self {
        config.max_size = config.max_size.max(1);
        config.min_size = config.min_size.min(config.max_size);
        let inner = Arc::new_cyclic(|me: &Weak<PoolInner>| {
            let mut inner = PoolInner {
                me: me.clone(),
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                transport,
                retry,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                    next_conn_id: 0,
                    next_waiter_id: 0,
                    closed: false,
                }),
                config,
            };
            let prewarmed: VecDeque<PooledConnection> = (1..=inner.config.min_size as u64)
                .map(|id| inner.connection(id))
                .collect();
            let state = inner.state.get_mut();
            state.total = prewarmed.len();
            state.next_conn_id = prewarmed.len() as u64;
            state.idle = prewarmed;
            inner
        });
        info!(
            pool = inner.id,
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "connection pool ready"
        );
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection: idle first, then a new one under `max_size`, else
    /// wait in FIFO order for a release until `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let started = Instant::now();
        let (waiter_id, mut rx) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            self.inner.reap_idle_locked(&mut state);
            if let Some(mut conn) = state.idle.pop_front() {
                conn.busy = true;
                debug!(pool = self.inner.id, conn = conn.id, "acquired idle connection");
                return Ok(conn);
            }
            if state.total < self.inner.config.max_size {
                let mut conn = self.inner.create_locked(&mut state);
                conn.busy = true;
                debug!(
                    pool = self.inner.id,
                    conn = conn.id,
                    total = state.total,
                    "created connection"
                );
                return Ok(conn);
            }
            let (tx, rx) = oneshot::channel();
            state.next_waiter_id += 1;
            let id = state.next_waiter_id;
            state.waiters.push_back(Waiter { id, tx });
            debug!(
                pool = self.inner.id,
                waiting = state.waiters.len(),
                "pool exhausted; queued acquire"
            );
            (id, rx)
        };

        match tokio::time::timeout(self.inner.config.acquire_timeout(), &mut rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                let mut state = self.inner.state.lock();
                let before = state.waiters.len();
                state.waiters.retain(|w| w.id != waiter_id);
                if state.waiters.len() == before {
                    // Dequeued by a release racing the deadline; take the handoff.
                    if let Ok(conn) = rx.try_recv() {
                        return Ok(conn);
                    }
                    if state.closed {
                        return Err(PoolError::Closed);
                    }
                }
                let waited = started.elapsed();
                warn!(
                    pool = self.inner.id,
                    waited_ms = waited.as_millis() as u64,
                    "acquire timed out"
                );
                Err(PoolError::AcquireTimeout { waited })
            }
        }
    }

    /// Return a connection. The oldest live waiter receives it directly.
    /// A connection from another pool is not reused here; dropping it frees
    /// the slot in the pool that leased it.
    pub async fn release(&self, mut conn: PooledConnection) {
        if conn.pool_id != self.inner.id {
            warn!(
                pool = self.inner.id,
                foreign_pool = conn.pool_id,
                "ignoring release of foreign connection"
            );
            return;
        }
        conn.last_used = Instant::now();
        conn.retry_count = 0;
        let mut state = self.inner.state.lock();
        if state.closed {
            conn.busy = false;
            state.total = state.total.saturating_sub(1);
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            conn.busy = true;
            match waiter.tx.send(conn) {
                Ok(()) => {
                    debug!(pool = self.inner.id, waiter = waiter.id, "handed connection to waiter");
                    return;
                }
                Err(returned) => conn = returned,
            }
        }
        conn.busy = false;
        state.idle.push_back(conn);
    }

    /// Drop a leased connection instead of reusing it, freeing its slot.
    pub async fn discard(&self, mut conn: PooledConnection) {
        if conn.pool_id != self.inner.id {
            return;
        }
        conn.busy = false;
        let mut state = self.inner.state.lock();
        self.inner.free_slot_locked(&mut state);
        debug!(pool = self.inner.id, conn = conn.id, "discarded connection");
    }

    /// Acquire, fetch and release in one call. The connection goes back to
    /// the pool whatever the fetch outcome.
    pub async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, RequestError> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch(request).await;
        self.release(conn).await;
        Ok(result?)
    }

    /// Drop idle connections and fail queued waiters with [`PoolError::Closed`].
    pub async fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = state.idle.len();
        state.idle.clear();
        state.total = state.total.saturating_sub(idle);
        let waiters = state.waiters.len();
        state.waiters.clear();
        info!(pool = self.inner.id, idle, waiters, "connection pool closed");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
            waiting: state.waiters.len(),
            max_size: self.inner.config.max_size,
        }
    }
}
