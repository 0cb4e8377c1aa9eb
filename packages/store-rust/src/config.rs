//! Configuration types for scoped execution.

use std::time::Duration;

use serde::Deserialize;
use tenantscope_core::{SessionVariables, SessionVariablesError};

/// Environment variable overriding [`PoolConfig::max_connections`].
pub const ENV_MAX_CONNECTIONS: &str = "TENANT_SCOPE_MAX_CONNECTIONS";
/// Environment variable overriding [`PoolConfig::acquire_timeout_ms`].
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "TENANT_SCOPE_ACQUIRE_TIMEOUT_MS";
/// Environment variable setting [`ScopeConfig::work_timeout_ms`].
pub const ENV_WORK_TIMEOUT_MS: &str = "TENANT_SCOPE_WORK_TIMEOUT_MS";

/// Errors from building or loading a [`ScopeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid value")]
    InvalidValue { var: &'static str, value: String },
    #[error("max_connections must be at least 1")]
    EmptyPool,
    #[error(transparent)]
    SessionVariables(#[from] SessionVariablesError),
}

/// Bounds for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on physical connections, idle plus checked out.
    pub max_connections: u32,
    /// How long a checkout waits for a free slot before failing.
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Top-level configuration for a [`TenantScope`](crate::executor::TenantScope).
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub pool: PoolConfig,
    /// Upper bound on a single invocation's work. `None` leaves it to the caller.
    pub work_timeout_ms: Option<u64>,
    /// Names of the session variables the row policies read.
    pub session_variables: SessionVariables,
}

impl ScopeConfig {
    #[must_use]
    pub fn work_timeout(&self) -> Option<Duration> {
        self.work_timeout_ms.map(Duration::from_millis)
    }

    /// Checks invariants that deserialization alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty pool or bad session variable names.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.pool.max_connections == 0 {
            return Err(ConfigError::EmptyPool);
        }
        self.session_variables.check()?;
        Ok(())
    }

    /// Defaults overridden by `TENANT_SCOPE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_MAX_CONNECTIONS) {
            config.pool.max_connections = parse_var(ENV_MAX_CONNECTIONS, &value)?;
        }
        if let Some(value) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            config.pool.acquire_timeout_ms = parse_var(ENV_ACQUIRE_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_WORK_TIMEOUT_MS) {
            config.work_timeout_ms = Some(parse_var(ENV_WORK_TIMEOUT_MS, &value)?);
        }
        config.check()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
