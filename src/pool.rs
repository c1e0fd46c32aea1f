//! Asynchronous connection pool.
//!
//! A bounded pool of [`AsyncConnection`]s with FIFO handoff. `idle + in_use`
//! never exceeds `maxsize`; a connection is either in the idle set or held by
//! exactly one caller. Waiters park on one-shot channels in arrival order,
//! and a release hands its connection (or the freed capacity slot) directly
//! to the head waiter, so a late arrival can never jump the queue.
//!
//! Cancellation is leak-free: a waiter that gives up (timeout or dropped
//! future) leaves only a dead channel behind, which the next release skips.
//! A grant that races with a timeout is reclaimed by the timed-out caller
//! and re-released, so the capacity it represents is never lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace};

use crate::async_connection::AsyncConnection;
use crate::config::{Config, PoolOptions};
use crate::error::{Error, Result};

/// What a release hands to a parked waiter.
enum Grant {
    /// A live connection, ownership transferred directly
    Conn(Box<AsyncConnection>),
    /// Permission to open a new connection; capacity already reserved
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

struct IdleConn {
    conn: AsyncConnection,
    idle_since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    in_use: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
}

struct PoolShared {
    config: Config,
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Signalled whenever `in_use` drops while the pool is closing
    drained: Notify,
}

/// Pool statistics at one observable moment.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Idle connections
    pub idle: usize,
    /// Connections held by callers
    pub in_use: usize,
    /// Parked acquires
    pub waiters: usize,
}

/// A bounded asynchronous connection pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("idle", &stats.idle)
            .field("in_use", &stats.in_use)
            .field("waiters", &stats.waiters)
            .field("maxsize", &self.shared.options.maxsize)
            .finish()
    }
}

impl Pool {
    /// Create an empty pool. Connections open lazily on acquire.
    pub fn new(config: Config, options: PoolOptions) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                options,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    closed: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Create a pool and open `minsize` connections up front.
    pub async fn connect(config: Config, options: PoolOptions) -> Result<Self> {
        let pool = Self::new(config, options);
        let minsize = pool.shared.options.minsize;
        for _ in 0..minsize {
            let conn = AsyncConnection::connect(pool.shared.config.clone()).await?;
            let mut state = pool.lock();
            state.idle.push_back(IdleConn {
                conn,
                idle_since: Instant::now(),
            });
        }
        Ok(pool)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared.state.lock().expect("pool state poisoned")
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            waiters: state.waiters.len(),
        }
    }

    /// Acquire a connection: reuse an idle one, open a new one under
    /// `maxsize`, or park FIFO until a release.
    ///
    /// The configured `acquire_timeout` bounds the parked wait; opening a
    /// new connection is bounded by the config's own connect timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_inner().await
    }

    async fn acquire_inner(&self) -> Result<PooledConnection> {
        loop {
            enum Plan {
                Take(Box<AsyncConnection>, Instant),
                Open,
                Park(oneshot::Receiver<Grant>, u64),
            }

            let plan = {
                let mut state = self.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.in_use += 1;
                    Plan::Take(Box::new(idle.conn), idle.idle_since)
                } else if state.idle.len() + state.in_use < self.shared.options.maxsize {
                    state.in_use += 1;
                    Plan::Open
                } else {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter { id, tx });
                    Plan::Park(rx, id)
                }
            };

            match plan {
                Plan::Take(conn, idle_since) => {
                    match self.vet_idle(*conn, idle_since).await {
                        Some(conn) => return Ok(self.wrap(conn)),
                        // Stale connection dropped; retry with capacity freed
                        None => {
                            self.release_slot();
                            continue;
                        }
                    }
                }
                Plan::Open => match self.open_new().await {
                    Ok(conn) => return Ok(self.wrap(conn)),
                    Err(e) => {
                        self.release_slot();
                        return Err(e);
                    }
                },
                Plan::Park(rx, id) => match self.await_grant(rx, id).await? {
                    Grant::Conn(conn) => return Ok(self.wrap(*conn)),
                    Grant::Slot => match self.open_new().await {
                        Ok(conn) => return Ok(self.wrap(conn)),
                        Err(e) => {
                            self.release_slot();
                            return Err(e);
                        }
                    },
                },
            }
        }
    }

    /// Wait for a grant, honoring `acquire_timeout`.
    ///
    /// On timeout the waiter entry is removed under the lock; if a grant was
    /// already sent, it is reclaimed and re-released so no capacity leaks.
    async fn await_grant(&self, mut rx: oneshot::Receiver<Grant>, id: u64) -> Result<Grant> {
        let outcome = match self.shared.options.acquire_timeout {
            None => Ok((&mut rx).await),
            Some(limit) => tokio::time::timeout(limit, &mut rx)
                .await
                .map_err(|_| Error::PoolTimeout(limit)),
        };

        match outcome {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_recv_gone)) => {
                // Sender dropped: the pool closed or discarded the queue
                let mut state = self.lock();
                state.waiters.retain(|w| w.id != id);
                if state.closed {
                    Err(Error::PoolClosed)
                } else {
                    Err(Error::protocol("pool waiter dropped without a grant"))
                }
            }
            Err(timeout_err) => {
                let still_queued = {
                    let mut state = self.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != id);
                    state.waiters.len() != before
                };
                if !still_queued {
                    // A grant raced the timeout; the send happened under the
                    // pool lock, so it is visible now
                    if let Ok(grant) = rx.try_recv() {
                        match grant {
                            Grant::Conn(conn) => release_conn_shared(&self.shared, *conn),
                            Grant::Slot => self.release_slot(),
                        }
                    }
                }
                Err(timeout_err)
            }
        }
    }

    async fn open_new(&self) -> Result<AsyncConnection> {
        debug!("pool opening a new connection");
        AsyncConnection::connect(self.shared.config.clone()).await
    }

    /// Health-check an idle connection past its recycle age.
    async fn vet_idle(
        &self,
        mut conn: AsyncConnection,
        idle_since: Instant,
    ) -> Option<AsyncConnection> {
        let needs_ping = self
            .shared
            .options
            .pool_recycle
            .is_some_and(|age| idle_since.elapsed() >= age);
        if !needs_ping {
            return Some(conn);
        }
        match conn.ping().await {
            Ok(()) => Some(conn),
            Err(e) => {
                debug!(error = %e, "recycling stale pooled connection");
                None
            }
        }
    }

    fn wrap(&self, conn: AsyncConnection) -> PooledConnection {
        trace!(connection_id = conn.connection_id(), "connection acquired");
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.shared),
        }
    }

    /// Give one unit of capacity back and wake the head waiter, if any.
    fn release_slot(&self) {
        release_slot_shared(&self.shared);
    }

    /// Return a connection to the pool.
    ///
    /// Healthy connections go to a waiter or the idle set; anything not in
    /// the `Idle` protocol state is discarded and its capacity freed.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close idle connections older than `pool_recycle`, keeping at least
    /// `minsize` idle.
    pub fn evict_expired(&self) {
        let Some(age) = self.shared.options.pool_recycle else {
            return;
        };
        let minsize = self.shared.options.minsize;
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            while state.idle.len() > minsize {
                match state.idle.front() {
                    Some(front) if front.idle_since.elapsed() >= age => {
                        evicted.push(state.idle.pop_front().expect("front exists"));
                    }
                    _ => break,
                }
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted expired idle connections");
        }
    }

    /// Close the pool: refuse new acquires, drop the idle set, and wait for
    /// every outstanding connection to come back.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            // Parked waiters learn of the closure from their dropped senders
            state.waiters.clear();
            state.idle.clear();
            state.in_use == 0
        };

        while !drained {
            let notified = self.shared.drained.notified();
            if self.lock().in_use == 0 {
                break;
            }
            notified.await;
        }
        debug!("pool closed");
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Shared release path, used by the pool and the guard's Drop.
fn release_slot_shared(shared: &Arc<PoolShared>) {
    let mut state = shared.state.lock().expect("pool state poisoned");
    state.in_use = state.in_use.saturating_sub(1);
    if state.closed {
        shared.drained.notify_waiters();
        return;
    }
    // Grant the freed slot to the first waiter still listening
    while let Some(waiter) = state.waiters.pop_front() {
        state.in_use += 1;
        if let Err(_grant) = waiter.tx.send(Grant::Slot) {
            state.in_use -= 1;
            continue;
        }
        break;
    }
}

fn release_conn_shared(shared: &Arc<PoolShared>, conn: AsyncConnection) {
    let mut state = shared.state.lock().expect("pool state poisoned");

    if state.closed {
        state.in_use = state.in_use.saturating_sub(1);
        shared.drained.notify_waiters();
        return;
    }

    if !conn.is_usable() {
        drop(state);
        debug!("discarding unusable connection on release");
        release_slot_shared(shared);
        return;
    }

    // Hand the connection straight to the head waiter; in_use is unchanged
    // because ownership transfers without touching the idle set
    let mut conn = conn;
    while let Some(waiter) = state.waiters.pop_front() {
        match waiter.tx.send(Grant::Conn(Box::new(conn))) {
            Ok(()) => {
                trace!("released connection handed to waiter");
                return;
            }
            Err(grant) => {
                let Grant::Conn(returned) = grant else {
                    unreachable!("slot grant on connection handoff")
                };
                conn = *returned;
            }
        }
    }

    state.in_use = state.in_use.saturating_sub(1);
    state.idle.push_back(IdleConn {
        conn,
        idle_since: Instant::now(),
    });
    trace!(idle = state.idle.len(), "connection returned to idle set");
}

/// A connection borrowed from the pool.
///
/// Returns itself to the pool on drop. Use [`PooledConnection::detach`] to
/// keep the connection past the pool's lifetime.
pub struct PooledConnection {
    conn: Option<AsyncConnection>,
    pool: Arc<PoolShared>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Take the connection out of the pool's accounting.
    pub fn detach(mut self) -> AsyncConnection {
        let conn = self.conn.take().expect("connection already taken");
        release_slot_shared(&self.pool);
        conn
    }

    /// Execute a statement; logs the SQL when the pool's `echo` is on.
    pub async fn query(&mut self, sql: &str) -> Result<crate::connection::ResultSet> {
        if self.pool.options.echo {
            debug!(sql, "pool echo");
        }
        self.conn
            .as_mut()
            .expect("connection already taken")
            .query(sql)
            .await
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = AsyncConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            release_conn_shared(&self.pool, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_pool(maxsize: usize) -> Pool {
        Pool::new(
            Config::new().host("127.0.0.1").port(3306).user("root"),
            PoolOptions::new()
                .minsize(0)
                .maxsize(maxsize)
                .acquire_timeout(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_empty_pool_stats() {
        let pool = test_pool(2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test]
    async fn test_acquire_from_closed_pool() {
        let pool = test_pool(2);
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_zero_capacity_acquire_times_out() {
        // maxsize 0 can never grant; the waiter must time out without
        // leaking queue capacity
        let pool = test_pool(0);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::PoolTimeout(_)));

        // The timed-out waiter removed itself from the queue
        assert_eq!(pool.stats().waiters, 0);
        pool.close().await;
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_close_wakes_parked_waiters() {
        // No acquire timeout: the waiter parks until close
        let pool = Pool::new(
            Config::new().host("127.0.0.1").user("root"),
            PoolOptions::new().minsize(0).maxsize(0),
        );
        let pool2 = pool.clone();

        let waiter = tokio::spawn(async move { pool2.acquire().await });

        // Give the waiter a moment to park
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiters, 1);

        pool.close().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_release_slot_bookkeeping() {
        let pool = test_pool(2);
        {
            let mut state = pool.lock();
            state.in_use = 2;
        }
        pool.release_slot();
        assert_eq!(pool.stats().in_use, 1);
        pool.release_slot();
        assert_eq!(pool.stats().in_use, 0);
        // Saturates rather than underflows
        pool.release_slot();
        assert_eq!(pool.stats().in_use, 0);
    }
}
