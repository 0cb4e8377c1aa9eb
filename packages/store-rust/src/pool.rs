//! Bounded connection pool with scoped checkout.
//!
//! Capacity is a [`Semaphore`] with one permit per physical connection; the
//! idle queue sits behind a [`parking_lot::Mutex`] that is never held across
//! an await. A checkout yields a `PooledConnection` guard which hands the
//! connection back on drop, so no exit path (error, panic, cancellation) can
//! leak it.
//!
//! A connection dropped while its transaction is still open is queued as
//! dirty and rolled back before the next checkout reuses it. If that rollback
//! fails the connection is discarded and a fresh one is opened in its place.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::error::{ScopeError, StorageError};

const DEREF_ERR: &str = "connection is present until the guard drops";

/// Point-in-time view of pool occupancy and lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: u32,
    /// Open physical connections (idle + checked out).
    pub size: u64,
    pub idle: usize,
    pub in_use: usize,
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub created: u64,
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

struct IdleConnection<C> {
    conn: C,
    dirty: bool,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    counters: Counters,
}

impl<M: ConnectionManager> PoolInner<M> {
    async fn connect(&self) -> Result<M::Connection, StorageError> {
        let conn = self.manager.connect().await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    async fn take_connection(&self) -> Result<M::Connection, StorageError> {
        let idle = self.idle.lock().pop_front();
        match idle {
            Some(IdleConnection { conn, dirty: false }) => Ok(conn),
            Some(IdleConnection {
                mut conn,
                dirty: true,
            }) => {
                // Counts the connection as discarded unless the reset completes,
                // including when this checkout is cancelled mid-rollback.
                let discard = DiscardGuard::new(&self.counters.discarded);
                match conn.rollback().await {
                    Ok(()) => {
                        discard.disarm();
                        tracing::debug!("rolled back dirty connection before reuse");
                        Ok(conn)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding connection that failed to reset");
                        drop(conn);
                        drop(discard);
                        self.connect().await
                    }
                }
            }
            None => self.connect().await,
        }
    }

    fn checkin(&self, conn: M::Connection, dirty: bool) {
        if self.slots.is_closed() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.idle.lock().push_back(IdleConnection { conn, dirty });
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Increments the discard counter on drop unless disarmed.
struct DiscardGuard<'a> {
    discarded: &'a AtomicU64,
    armed: bool,
}

impl<'a> DiscardGuard<'a> {
    fn new(discarded: &'a AtomicU64) -> Self {
        Self {
            discarded,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DiscardGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bounded, lazily connecting pool. Cheap to clone.
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Creates an empty pool. Connections are opened on first demand.
    #[must_use]
    pub(crate) fn new(manager: M, config: PoolConfig) -> Self {
        let permits = usize::try_from(config.max_connections).unwrap_or(usize::MAX);
        Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                slots: Arc::new(Semaphore::new(permits)),
                idle: Mutex::new(VecDeque::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Checks out a connection, waiting up to the configured acquire timeout.
    /// Only the binder checks out: a connection reaches caller code solely
    /// inside a bound transaction.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::PoolTimeout`] if no slot frees up in time
    /// - [`ScopeError::PoolClosed`] after [`close()`](Pool::close)
    /// - [`ScopeError::Storage`] if a new connection cannot be opened
    pub(crate) async fn acquire(&self) -> Result<PooledConnection<M>, ScopeError> {
        let started = Instant::now();
        let timeout = self.inner.config.acquire_timeout();
        let slots = Arc::clone(&self.inner.slots);

        let permit = match tokio::time::timeout(timeout, slots.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(ScopeError::PoolClosed),
            Err(_elapsed) => {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tenant_scope_pool_timeouts_total").increment(1);
                tracing::warn!(waited_ms, "connection pool checkout timed out");
                return Err(ScopeError::PoolTimeout { waited_ms });
            }
        };

        let conn = self.inner.take_connection().await?;
        self.inner.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            in_transaction: false,
            _permit: permit,
        })
    }

    /// Rejects future checkouts and drops idle connections. Connections
    /// still checked out are dropped when their guards release them.
    pub fn close(&self) {
        self.inner.slots.close();
        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        self.inner
            .counters
            .discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        tracing::info!(dropped = drained.len(), "connection pool closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let counters = &self.inner.counters;
        let max = usize::try_from(self.inner.config.max_connections).unwrap_or(usize::MAX);
        let created = counters.created.load(Ordering::Relaxed);
        let discarded = counters.discarded.load(Ordering::Relaxed);
        PoolStatus {
            max_connections: self.inner.config.max_connections,
            size: created.saturating_sub(discarded),
            idle: self.inner.idle.lock().len(),
            in_use: max.saturating_sub(self.inner.slots.available_permits()),
            acquired: counters.acquired.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            created,
            discarded,
        }
    }
}

/// RAII guard over a checked-out connection.
///
/// Returns the connection to the pool when dropped, even during unwinding.
pub(crate) struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    in_transaction: bool,
    // Released after `drop` has queued the connection, so a waiter woken by
    // the permit finds it idle.
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Records whether a transaction is open on this connection. An open
    /// transaction at drop time marks the connection dirty.
    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(DEREF_ERR)
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(DEREF_ERR)
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.in_transaction {
                tracing::warn!("connection released with an open transaction; rolling back before reuse");
            }
            self.pool.checkin(conn, self.in_transaction);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        opened: AtomicU64,
        rollbacks: AtomicU64,
        fail_rollback: std::sync::atomic::AtomicBool,
        stall_rollback: std::sync::atomic::AtomicBool,
    }

    struct FakeManager {
        state: Arc<FakeState>,
    }

    struct FakeConn {
        id: u64,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn begin(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn set_local(&mut self, _name: &str, _value: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), StorageError> {
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.state.stall_rollback.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.state.fail_rollback.load(Ordering::SeqCst) {
                return Err(StorageError::uncoded("connection reset"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionManager for FakeManager {
        type Connection = FakeConn;

        async fn connect(&self) -> Result<FakeConn, StorageError> {
            let id = self.state.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                id,
                state: Arc::clone(&self.state),
            })
        }
    }

    fn make_pool(max_connections: u32, acquire_timeout_ms: u64) -> (Pool<FakeManager>, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        let pool = Pool::new(
            FakeManager {
                state: Arc::clone(&state),
            },
            PoolConfig {
                max_connections,
                acquire_timeout_ms,
            },
        );
        (pool, state)
    }

    #[tokio::test]
    async fn connections_are_opened_lazily_and_reused() {
        let (pool, state) = make_pool(2, 1_000);
        assert_eq!(pool.status().size, 0);

        let first_id = {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(pool.status().in_use, 1);
            conn.id
        };
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, first_id);
        drop(conn);

        let status = pool.status();
        assert_eq!(state.opened.load(Ordering::SeqCst), 1);
        assert_eq!(status.size, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.acquired, 2);
        assert_eq!(status.released, 2);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let (pool, _state) = make_pool(1, 30);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, ScopeError::PoolTimeout { waited_ms } if waited_ms >= 30));
        assert!(err.is_retriable());
        assert_eq!(pool.status().timeouts, 1);
    }

    #[tokio::test]
    async fn waiter_gets_connection_once_released() {
        let (pool, state) = make_pool(1, 2_000);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, 0);
        assert_eq!(state.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dirty_connection_is_rolled_back_before_reuse() {
        let (pool, state) = make_pool(1, 1_000);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.set_in_transaction(true);
        }
        assert_eq!(state.rollbacks.load(Ordering::SeqCst), 0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 0);
        assert_eq!(state.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dirty_connection_failing_reset_is_replaced() {
        let (pool, state) = make_pool(1, 1_000);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.set_in_transaction(true);
        }
        state.fail_rollback.store(true, Ordering::SeqCst);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        drop(conn);

        let status = pool.status();
        assert_eq!(status.created, 2);
        assert_eq!(status.discarded, 1);
        assert_eq!(status.size, 1);
    }

    #[tokio::test]
    async fn checkout_cancelled_during_reset_counts_the_discard() {
        let (pool, state) = make_pool(1, 1_000);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.set_in_transaction(true);
        }
        state.stall_rollback.store(true, Ordering::SeqCst);

        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(cancelled.is_err());

        let status = pool.status();
        assert_eq!(status.created, 1);
        assert_eq!(status.discarded, 1);
        assert_eq!(status.size, 0);
        assert_eq!(status.idle, 0);
        assert_eq!(status.in_use, 0);

        state.stall_rollback.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        drop(conn);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_checkout() {
        let (pool, _state) = make_pool(2, 1_000);
        drop(pool.acquire().await.unwrap());
        pool.close();

        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(ScopeError::PoolClosed)));
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn connection_returned_after_close_is_dropped() {
        let (pool, _state) = make_pool(1, 1_000);
        let held = pool.acquire().await.unwrap();
        pool.close();
        drop(held);

        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.discarded, 1);
        assert_eq!(status.released, 1);
    }
}
