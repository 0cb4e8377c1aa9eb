//! Tenant Scope Store — pooled transactions bound to a tenant or service
//! context before any caller query runs.
//!
//! [`TenantScope::with_tenant_context`] and [`TenantScope::with_service_context`]
//! are the only sanctioned way to reach storage. Each invocation validates its
//! context, checks out a pooled connection, opens a transaction, writes the
//! context into transaction-local session variables, runs the caller's work,
//! and commits or rolls back. Row isolation itself is enforced by the engine's
//! policies reading those variables.

pub mod binder;
pub mod config;
pub mod connection;
pub mod engines;
pub mod error;
pub mod executor;
pub mod pool;
pub mod telemetry;

pub use binder::{BindState, ScopedTx};
pub use config::{ConfigError, PoolConfig, ScopeConfig};
pub use connection::{Connection, ConnectionManager};
pub use error::{ScopeError, StorageError};
pub use executor::TenantScope;
pub use pool::{Pool, PoolStatus};
