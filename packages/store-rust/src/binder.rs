//! Binds one transaction to a validated context and runs caller work in it.
//!
//! Per invocation the binder walks the state machine
//! `Idle -> ConnectionAcquired -> TransactionOpen -> ContextBound ->
//! WorkRunning -> {Committed | RolledBack} -> ConnectionReleased`.
//!
//! Every failure after `BEGIN` (session writes, work, work timeout, `COMMIT`)
//! goes through `ROLLBACK`. A failed rollback is logged and leaves the
//! connection dirty for the pool to reset; the original error is what the
//! caller sees. A panicking work future is rolled back and the panic resumed.
//! If the whole invocation is dropped mid-flight the `PooledConnection`
//! guard returns the connection dirty and the pool rolls it back before reuse.

use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tenantscope_core::{session_assignments, SessionVariables, ValidatedContext};

use crate::connection::{Connection, ConnectionManager};
use crate::error::ScopeError;
use crate::pool::{Pool, PooledConnection};

/// Lifecycle of one scoped invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Idle,
    ConnectionAcquired,
    TransactionOpen,
    ContextBound,
    WorkRunning,
    Committed,
    RolledBack,
    ConnectionReleased,
}

impl BindState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BindState::Idle => "idle",
            BindState::ConnectionAcquired => "connection_acquired",
            BindState::TransactionOpen => "transaction_open",
            BindState::ContextBound => "context_bound",
            BindState::WorkRunning => "work_running",
            BindState::Committed => "committed",
            BindState::RolledBack => "rolled_back",
            BindState::ConnectionReleased => "connection_released",
        }
    }
}

fn enter(state: BindState) {
    tracing::Span::current().record("state", state.as_str());
    tracing::debug!(state = state.as_str(), "tenant scope state");
}

/// Handle given to caller work: the transaction's connection plus the
/// context it is bound to.
///
/// Dereferences to the backend connection so backend query APIs apply
/// directly. Work must not issue its own `COMMIT` or `ROLLBACK`.
pub struct ScopedTx<'a, C> {
    conn: &'a mut C,
    context: &'a ValidatedContext,
}

impl<C> ScopedTx<'_, C> {
    /// Context this transaction's session state was bound from.
    #[must_use]
    pub fn context(&self) -> &ValidatedContext {
        self.context
    }

    pub fn connection(&mut self) -> &mut C {
        self.conn
    }
}

impl<C> Deref for ScopedTx<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
    }
}

impl<C> DerefMut for ScopedTx<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
    }
}

/// Borrowed view of what a single invocation needs from its executor.
pub(crate) struct Binder<'a, M: ConnectionManager> {
    pub(crate) pool: &'a Pool<M>,
    pub(crate) variables: &'a SessionVariables,
    pub(crate) work_timeout: Option<Duration>,
}

impl<M: ConnectionManager> Binder<'_, M> {
    /// Runs `work` in a transaction bound to `ctx`, committing on success.
    pub(crate) async fn run<T, F>(&self, ctx: ValidatedContext, work: F) -> Result<T, ScopeError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx<'_, M::Connection>) -> BoxFuture<'c, Result<T, ScopeError>>
            + Send,
    {
        enter(BindState::Idle);
        let mut conn = self.pool.acquire().await?;
        enter(BindState::ConnectionAcquired);

        let result = self.transact(&mut conn, &ctx, work).await;

        drop(conn);
        enter(BindState::ConnectionReleased);
        result
    }

    async fn transact<T, F>(
        &self,
        conn: &mut PooledConnection<M>,
        ctx: &ValidatedContext,
        work: F,
    ) -> Result<T, ScopeError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx<'_, M::Connection>) -> BoxFuture<'c, Result<T, ScopeError>>
            + Send,
    {
        // Marked before BEGIN: a BEGIN that fails mid-flight leaves the
        // session state unknown, so the pool resets it before reuse.
        conn.set_in_transaction(true);
        if let Err(err) = conn.begin().await {
            err.log("begin");
            return Err(err.into());
        }
        enter(BindState::TransactionOpen);

        let outcome = AssertUnwindSafe(self.bind_and_run(&mut **conn, ctx, work))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!("work panicked inside tenant scope; rolling back");
                rollback(conn).await;
                std::panic::resume_unwind(panic);
            }
        };

        match result {
            Ok(value) => match conn.commit().await {
                Ok(()) => {
                    conn.set_in_transaction(false);
                    enter(BindState::Committed);
                    Ok(value)
                }
                Err(err) => {
                    err.log("commit");
                    rollback(conn).await;
                    Err(err.into())
                }
            },
            Err(err) => {
                match &err {
                    ScopeError::Storage(storage) => storage.log("work"),
                    other => tracing::debug!(error = %other, "tenant scope work failed"),
                }
                rollback(conn).await;
                Err(err)
            }
        }
    }

    async fn bind_and_run<T, F>(
        &self,
        conn: &mut M::Connection,
        ctx: &ValidatedContext,
        work: F,
    ) -> Result<T, ScopeError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx<'_, M::Connection>) -> BoxFuture<'c, Result<T, ScopeError>>
            + Send,
    {
        for assignment in session_assignments(ctx, self.variables) {
            if let Err(err) = conn.set_local(assignment.name, &assignment.value).await {
                err.log("bind");
                return Err(err.into());
            }
        }
        enter(BindState::ContextBound);

        let mut tx = ScopedTx { conn, context: ctx };
        enter(BindState::WorkRunning);
        let fut = work(&mut tx);
        match self.work_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(timeout_ms, "tenant scope work timed out");
                    Err(ScopeError::WorkTimedOut { timeout_ms })
                }
            },
            None => fut.await,
        }
    }
}

/// Rolls back, keeping the connection dirty if the rollback itself fails.
async fn rollback<M: ConnectionManager>(conn: &mut PooledConnection<M>) {
    match conn.rollback().await {
        Ok(()) => {
            conn.set_in_transaction(false);
            enter(BindState::RolledBack);
        }
        Err(err) => {
            tracing::warn!(
                code = err.code.as_deref().unwrap_or(""),
                message = %err.message,
                "rollback failed; connection will be reset before reuse"
            );
        }
    }
}
