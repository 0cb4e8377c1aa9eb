//! Public entry points: the only sanctioned way to reach storage.
//!
//! [`TenantScope`] owns the pool. Callers never see a raw connection outside
//! a scoped invocation, and every invocation carries its context as an
//! explicit argument; there is no ambient "current tenant".

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tenantscope_core::{validate, ContextDescriptor, ValidatedContext};
use tracing::{info_span, Instrument};

use crate::binder::{Binder, ScopedTx};
use crate::config::{ConfigError, ScopeConfig};
use crate::connection::ConnectionManager;
use crate::error::ScopeError;
use crate::pool::Pool;

/// Scoped executor over a bounded pool. Cheap to clone; clones share the pool.
pub struct TenantScope<M: ConnectionManager> {
    pool: Pool<M>,
    config: Arc<ScopeConfig>,
}

impl<M: ConnectionManager> Clone for TenantScope<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<M: ConnectionManager> TenantScope<M> {
    /// Creates an executor with its own pool over `manager`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails [`ScopeConfig::check`].
    pub fn new(manager: M, config: ScopeConfig) -> Result<Self, ConfigError> {
        config.check()?;
        let pool = Pool::new(manager, config.pool.clone());
        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Pool status and lifecycle. The pool offers no checkout of its own;
    /// connections are only reachable through the scoped entry points.
    #[must_use]
    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Rejects all further invocations.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Runs `work` in a transaction bound to `descriptor`.
    ///
    /// The descriptor is validated before the pool is touched. Session state
    /// is bound before `work` starts; the transaction commits if `work`
    /// returns `Ok` and rolls back otherwise. The connection is back in the
    /// pool when this returns.
    ///
    /// ```ignore
    /// let count = scope
    ///     .with_tenant_context(descriptor, |tx| {
    ///         Box::pin(async move {
    ///             let rows = tx.select("projects").await?;
    ///             Ok::<_, ScopeError>(rows.len())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// # Errors
    ///
    /// - [`ScopeError::Validation`] for an absent or malformed descriptor
    /// - [`ScopeError::PoolTimeout`] / [`ScopeError::PoolClosed`] before any transaction opens
    /// - [`ScopeError::Storage`] from `BEGIN`, session binding, `work`, or `COMMIT`
    /// - [`ScopeError::WorkTimedOut`] when the configured work timeout elapses
    /// - whatever error `work` itself returns
    pub async fn with_tenant_context<T, F>(
        &self,
        descriptor: impl Into<Option<ContextDescriptor>>,
        work: F,
    ) -> Result<T, ScopeError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx<'_, M::Connection>) -> BoxFuture<'c, Result<T, ScopeError>>
            + Send,
    {
        let descriptor = descriptor.into();
        let validated = match validate(descriptor.as_ref()) {
            Ok(validated) => validated,
            Err(err) => {
                tracing::warn!(error = %err, "rejected context descriptor");
                metrics::counter!(
                    "tenant_scope_invocations_total",
                    "kind" => "unknown",
                    "outcome" => "rejected"
                )
                .increment(1);
                return Err(err.into());
            }
        };
        // Raw descriptor is not needed past validation.
        drop(descriptor);
        self.run(validated, work).await
    }

    /// Runs `work` with row isolation disabled, recording `reason` in the
    /// audit session variable.
    ///
    /// Privileged. Only for trusted system-internal paths such as migrations
    /// and background jobs; never for a handler driven by an end-user
    /// request, since every tenant's rows are visible for the whole
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`ScopeError::Validation`] with `MissingAuditReason` for a blank
    /// reason, otherwise as [`with_tenant_context`](Self::with_tenant_context).
    pub async fn with_service_context<T, F>(
        &self,
        reason: impl Into<String>,
        work: F,
    ) -> Result<T, ScopeError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx<'_, M::Connection>) -> BoxFuture<'c, Result<T, ScopeError>>
            + Send,
    {
        self.with_tenant_context(ContextDescriptor::service(reason), work)
            .await
    }

    async fn run<T, F>(&self, ctx: ValidatedContext, work: F) -> Result<T, ScopeError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx<'_, M::Connection>) -> BoxFuture<'c, Result<T, ScopeError>>
            + Send,
    {
        let kind = ctx.kind();
        let span = info_span!(
            "tenant_scope",
            kind = kind,
            state = tracing::field::Empty,
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        async move {
            let started = Instant::now();
            if ctx.bypasses_isolation() {
                tracing::info!("service context bypassing row isolation");
            }

            let binder = Binder {
                pool: &self.pool,
                variables: &self.config.session_variables,
                work_timeout: self.config.work_timeout(),
            };
            let result = binder.run(ctx, work).await;

            let outcome = match &result {
                Ok(_) => "committed",
                Err(ScopeError::PoolTimeout { .. } | ScopeError::PoolClosed) => "unavailable",
                Err(_) => "failed",
            };
            let elapsed = started.elapsed();
            let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            let span = tracing::Span::current();
            span.record("outcome", outcome);
            span.record("duration_ms", duration_ms);
            tracing::debug!(outcome, duration_ms, "tenant scope complete");

            metrics::counter!(
                "tenant_scope_invocations_total",
                "kind" => kind,
                "outcome" => outcome
            )
            .increment(1);
            metrics::histogram!("tenant_scope_duration_seconds", "kind" => kind)
                .record(elapsed.as_secs_f64());

            result
        }
        .instrument(span)
        .await
    }
}
