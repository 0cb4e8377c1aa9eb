//! Boundary traits for the connection source.
//!
//! A backend supplies a [`ConnectionManager`] that opens physical connections
//! and a [`Connection`] type exposing transaction control plus
//! transaction-local, parameter-bound session writes. Query execution is
//! whatever the backend's connection type natively offers.

use async_trait::async_trait;

use crate::error::StorageError;

/// Transaction control over one physical connection.
///
/// Used as the `C` in [`ScopedTx<'_, C>`](crate::binder::ScopedTx).
#[async_trait]
pub trait Connection: Send + 'static {
    /// Issue `BEGIN`.
    async fn begin(&mut self) -> Result<(), StorageError>;

    /// Set a session variable for the current transaction only.
    ///
    /// Both `name` and `value` must reach the engine through parameter
    /// binding, never by splicing them into statement text. The value is
    /// discarded by the engine at `COMMIT` or `ROLLBACK`.
    async fn set_local(&mut self, name: &str, value: &str) -> Result<(), StorageError>;

    /// Issue `COMMIT`.
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Issue `ROLLBACK`.
    async fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Opens physical connections for a [`Pool`](crate::pool::Pool).
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, StorageError>;
}
