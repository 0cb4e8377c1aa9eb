//! Error kinds surfaced by scoped invocations.

use tenantscope_core::ValidationError;

/// SQLSTATE for serialization failures.
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for detected deadlocks.
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for row-level security `WITH CHECK` violations.
pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
/// SQLSTATE for statements issued outside a valid transaction state.
pub const INVALID_TRANSACTION_STATE: &str = "25000";
/// SQLSTATE for references to unknown tables.
pub const UNDEFINED_TABLE: &str = "42P01";

/// Engine-level failure, passed through with its diagnostic metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
#[error(
    "{}{message}{}{}",
    code_prefix(.code),
    detail("table", .table),
    detail("constraint", .constraint)
)]
pub struct StorageError {
    /// Engine error code (SQLSTATE for SQL engines), when one was reported.
    pub code: Option<String>,
    pub message: String,
    pub constraint: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
}

impl StorageError {
    /// Error with a code and message and no further metadata.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Error without an engine code, e.g. an I/O failure on the socket.
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Whether retrying the whole invocation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
        )
    }

    /// Logs the error with its metadata. Never includes session values.
    pub(crate) fn log(&self, during: &'static str) {
        tracing::error!(
            during = during,
            code = self.code.as_deref().unwrap_or(""),
            constraint = self.constraint.as_deref().unwrap_or(""),
            table = self.table.as_deref().unwrap_or(""),
            column = self.column.as_deref().unwrap_or(""),
            message = %self.message,
            "storage error in tenant scope"
        );
    }
}

fn code_prefix(code: &Option<String>) -> String {
    code.as_ref().map(|code| format!("[{code}] ")).unwrap_or_default()
}

fn detail(label: &str, value: &Option<String>) -> String {
    value
        .as_ref()
        .map(|value| format!(" ({label} {value})"))
        .unwrap_or_default()
}

/// Everything a scoped invocation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// Descriptor was absent or malformed. Nothing touched the pool.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No connection became available within the acquire timeout.
    #[error("no connection available after {waited_ms}ms")]
    PoolTimeout { waited_ms: u64 },
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The caller's work exceeded the configured work timeout and was rolled back.
    #[error("work timed out after {timeout_ms}ms")]
    WorkTimedOut { timeout_ms: u64 },
    /// Business error raised by the caller's work.
    #[error(transparent)]
    Work(#[from] anyhow::Error),
}

impl ScopeError {
    /// True for an absent descriptor.
    #[must_use]
    pub fn is_context_required(&self) -> bool {
        matches!(
            self,
            ScopeError::Validation(ValidationError::ContextRequired)
        )
    }

    /// Whether the caller may retry. The store never retries on its own.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            ScopeError::PoolTimeout { .. } => true,
            ScopeError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Engine error, if this is one.
    #[must_use]
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            ScopeError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tenantscope_core::IdentifierField;

    use super::*;

    #[test]
    fn display_includes_code_and_table() {
        let err = StorageError::new(INSUFFICIENT_PRIVILEGE, "new row violates row-level security policy")
            .with_table("invoices");
        assert_eq!(
            err.to_string(),
            "[42501] new row violates row-level security policy (table invoices)"
        );
    }

    #[test]
    fn display_appends_table_then_constraint() {
        let err = StorageError::new("23505", "duplicate key value")
            .with_table("invoices")
            .with_constraint("invoices_pkey");
        assert_eq!(
            err.to_string(),
            "[23505] duplicate key value (table invoices) (constraint invoices_pkey)"
        );
        let source: &dyn std::error::Error = &ScopeError::Storage(err);
        assert!(source.source().is_some());
    }

    #[test]
    fn uncoded_display_is_message_only() {
        assert_eq!(StorageError::uncoded("connection reset").to_string(), "connection reset");
    }

    #[test]
    fn transient_codes_are_retriable() {
        let deadlock = ScopeError::Storage(StorageError::new(DEADLOCK_DETECTED, "deadlock"));
        let serialization =
            ScopeError::Storage(StorageError::new(SERIALIZATION_FAILURE, "could not serialize"));
        let constraint = ScopeError::Storage(
            StorageError::new("23505", "duplicate key").with_constraint("invoices_pkey"),
        );
        assert!(deadlock.is_retriable());
        assert!(serialization.is_retriable());
        assert!(!constraint.is_retriable());
        assert!(ScopeError::PoolTimeout { waited_ms: 10 }.is_retriable());
        assert!(!ScopeError::PoolClosed.is_retriable());
    }

    #[test]
    fn validation_errors_are_never_retriable() {
        let err = ScopeError::from(ValidationError::InvalidIdentifierFormat {
            field: IdentifierField::OrgId,
        });
        assert!(!err.is_retriable());
        assert!(!err.is_context_required());
        assert!(ScopeError::from(ValidationError::ContextRequired).is_context_required());
    }

    #[test]
    fn work_errors_keep_their_message() {
        let err = ScopeError::from(anyhow::anyhow!("invoice already paid"));
        assert_eq!(err.to_string(), "invoice already paid");
        assert!(err.storage().is_none());
    }
}
