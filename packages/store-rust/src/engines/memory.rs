//! In-memory engine that enforces row isolation the way a policy-aware SQL
//! engine does.
//!
//! Each table names a tenant column and a [`RowPolicy`]. A row is visible to a
//! transaction when its tenant column equals the transaction's org session
//! variable, or when the bypass variable is `on`. Inserts are checked against
//! the same predicate. Session variables live on the transaction and vanish at
//! `COMMIT`/`ROLLBACK`; writes are buffered and applied at `COMMIT`.
//!
//! Tests use [`FailPoint`] to make the next `BEGIN`, session write, `COMMIT`
//! or `ROLLBACK` fail once, and the per-connection [`Statement`] log of the
//! current transaction to check ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tenantscope_core::{SessionVariables, BYPASS_ON};

use crate::connection::{Connection, ConnectionManager};
use crate::error::{
    StorageError, INSUFFICIENT_PRIVILEGE, INVALID_TRANSACTION_STATE, UNDEFINED_TABLE,
};

/// A stored row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Isolation predicate for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPolicy {
    pub tenant_column: String,
    pub org_variable: String,
    pub bypass_variable: String,
}

impl RowPolicy {
    /// Policy keyed on `tenant_column`, reading the default variable names.
    pub fn new(tenant_column: impl Into<String>) -> Self {
        Self::with_variables(tenant_column, &SessionVariables::default())
    }

    /// Policy keyed on `tenant_column`, reading the names in `vars`.
    pub fn with_variables(tenant_column: impl Into<String>, vars: &SessionVariables) -> Self {
        Self {
            tenant_column: tenant_column.into(),
            org_variable: vars.org_id.clone(),
            bypass_variable: vars.bypass.clone(),
        }
    }

    fn admits(&self, settings: &HashMap<String, String>, row: &Row) -> bool {
        if settings.get(&self.bypass_variable).map(String::as_str) == Some(BYPASS_ON) {
            return true;
        }
        // Unset org variable admits nothing.
        match (
            row.get(&self.tenant_column).and_then(Value::as_str),
            settings.get(&self.org_variable),
        ) {
            (Some(row_org), Some(bound_org)) => row_org == bound_org.as_str(),
            _ => false,
        }
    }
}

/// Statement kinds recorded per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Begin,
    SetLocal { name: String, value: String },
    Select { table: String },
    Insert { table: String },
    Commit,
    Rollback,
}

/// Transaction-control statements that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    SetLocal,
    Commit,
    Rollback,
}

/// Engine-wide transaction counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

struct Table {
    policy: RowPolicy,
    rows: Vec<Row>,
}

/// Shared storage behind every [`MemoryConnection`].
#[derive(Default)]
pub struct MemoryEngine {
    tables: DashMap<String, Table>,
    failures: Mutex<HashMap<FailPoint, StorageError>>,
    next_connection_id: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) a table guarded by `policy`.
    pub fn create_table(&self, name: impl Into<String>, policy: RowPolicy) {
        self.tables.insert(
            name.into(),
            Table {
                policy,
                rows: Vec::new(),
            },
        );
    }

    /// Inserts a row directly, outside any transaction and policy. Fixture
    /// loading only.
    ///
    /// # Errors
    ///
    /// Returns an `UNDEFINED_TABLE` error if the table does not exist.
    pub fn seed(&self, table: &str, row: Row) -> Result<(), StorageError> {
        let mut entry = self.tables.get_mut(table).ok_or_else(|| undefined_table(table))?;
        entry.rows.push(row);
        Ok(())
    }

    /// Committed rows in `table`, ignoring policies.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Makes the next statement at `point` fail with `err`, on any connection.
    pub fn fail_next(&self, point: FailPoint, err: StorageError) {
        self.failures.lock().insert(point, err);
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            begins: self.begins.load(Ordering::SeqCst),
            commits: self.commits.load(Ordering::SeqCst),
            rollbacks: self.rollbacks.load(Ordering::SeqCst),
        }
    }

    fn injected(&self, point: FailPoint) -> Result<(), StorageError> {
        match self.failures.lock().remove(&point) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn undefined_table(table: &str) -> StorageError {
    StorageError::new(UNDEFINED_TABLE, format!("relation \"{table}\" does not exist"))
}

fn no_transaction() -> StorageError {
    StorageError::new(INVALID_TRANSACTION_STATE, "no transaction in progress")
}

#[derive(Default)]
struct MemoryTx {
    settings: HashMap<String, String>,
    pending: Vec<(String, Row)>,
}

/// Opens [`MemoryConnection`]s on a shared [`MemoryEngine`].
#[derive(Clone)]
pub struct MemoryManager {
    engine: Arc<MemoryEngine>,
}

impl MemoryManager {
    #[must_use]
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }
}

#[async_trait]
impl ConnectionManager for MemoryManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StorageError> {
        let id = self.engine.next_connection_id.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id,
            engine: Arc::clone(&self.engine),
            tx: None,
            log: Vec::new(),
        })
    }
}

/// One session on a [`MemoryEngine`].
pub struct MemoryConnection {
    id: u64,
    engine: Arc<MemoryEngine>,
    tx: Option<MemoryTx>,
    log: Vec<Statement>,
}

impl MemoryConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Statements since the last `BEGIN` on this connection, oldest first.
    /// Earlier transactions are cleared when the next one begins.
    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.log
    }

    /// Value of a session variable in the open transaction.
    #[must_use]
    pub fn current_setting(&self, name: &str) -> Option<&str> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.settings.get(name))
            .map(String::as_str)
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Rows of `table` visible under the transaction's session state,
    /// including this transaction's uncommitted inserts.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction or for an unknown table.
    pub async fn select(&mut self, table: &str) -> Result<Vec<Row>, StorageError> {
        tokio::task::yield_now().await;
        self.log.push(Statement::Select {
            table: table.to_string(),
        });
        let tx = self.tx.as_ref().ok_or_else(no_transaction)?;
        let stored = self
            .engine
            .tables
            .get(table)
            .ok_or_else(|| undefined_table(table))?;

        let pending = tx
            .pending
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, row)| row);
        Ok(stored
            .rows
            .iter()
            .chain(pending)
            .filter(|row| stored.policy.admits(&tx.settings, row))
            .cloned()
            .collect())
    }

    /// Buffers an insert, applied at `COMMIT`.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction, for an unknown table, or with
    /// `INSUFFICIENT_PRIVILEGE` when the row is outside the bound tenant.
    pub async fn insert(&mut self, table: &str, row: Row) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.log.push(Statement::Insert {
            table: table.to_string(),
        });
        let tx = self.tx.as_mut().ok_or_else(no_transaction)?;
        let stored = self
            .engine
            .tables
            .get(table)
            .ok_or_else(|| undefined_table(table))?;
        if !stored.policy.admits(&tx.settings, &row) {
            return Err(StorageError::new(
                INSUFFICIENT_PRIVILEGE,
                format!("new row violates row-level security policy for table \"{table}\""),
            )
            .with_table(table));
        }
        drop(stored);
        tx.pending.push((table.to_string(), row));
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.log.clear();
        self.log.push(Statement::Begin);
        self.engine.injected(FailPoint::Begin)?;
        // Like a SQL engine, BEGIN inside a transaction keeps the open one.
        if self.tx.is_none() {
            self.tx = Some(MemoryTx::default());
        }
        self.engine.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_local(&mut self, name: &str, value: &str) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.log.push(Statement::SetLocal {
            name: name.to_string(),
            value: value.to_string(),
        });
        self.engine.injected(FailPoint::SetLocal)?;
        let tx = self.tx.as_mut().ok_or_else(no_transaction)?;
        tx.settings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.log.push(Statement::Commit);
        self.engine.injected(FailPoint::Commit)?;
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        for (table, row) in tx.pending {
            let mut stored = self
                .engine
                .tables
                .get_mut(&table)
                .ok_or_else(|| undefined_table(&table))?;
            stored.rows.push(row);
        }
        self.engine.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.log.push(Statement::Rollback);
        self.engine.injected(FailPoint::Rollback)?;
        if self.tx.take().is_some() {
            self.engine.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ORG_A: &str = "11111111-1111-1111-1111-111111111111";
    const ORG_B: &str = "33333333-3333-3333-3333-333333333333";

    fn row(org: &str, title: &str) -> Row {
        let Value::Object(map) = json!({ "org_id": org, "title": title }) else {
            unreachable!()
        };
        map
    }

    async fn engine_with_rows() -> (Arc<MemoryEngine>, MemoryConnection) {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_table("projects", RowPolicy::new("org_id"));
        engine.seed("projects", row(ORG_A, "alpha")).unwrap();
        engine.seed("projects", row(ORG_B, "bravo")).unwrap();
        let conn = MemoryManager::new(Arc::clone(&engine)).connect().await.unwrap();
        (engine, conn)
    }

    #[tokio::test]
    async fn rows_are_filtered_by_bound_org() {
        let (_engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_A).await.unwrap();

        let rows = conn.select("projects").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "alpha");
    }

    #[tokio::test]
    async fn unbound_transaction_sees_nothing() {
        let (_engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        assert!(conn.select("projects").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bypass_sees_every_org() {
        let (_engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.bypass_rls", "on").await.unwrap();
        assert_eq!(conn.select("projects").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bypass_off_does_not_widen_visibility() {
        let (_engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_B).await.unwrap();
        conn.set_local("app.bypass_rls", "off").await.unwrap();
        let rows = conn.select("projects").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "bravo");
    }

    #[tokio::test]
    async fn cross_tenant_insert_violates_policy() {
        let (engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_A).await.unwrap();

        let err = conn.insert("projects", row(ORG_B, "sneaky")).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(INSUFFICIENT_PRIVILEGE));
        assert_eq!(err.table.as_deref(), Some("projects"));
        conn.rollback().await.unwrap();
        assert_eq!(engine.row_count("projects"), 2);
    }

    #[tokio::test]
    async fn inserts_apply_on_commit_only() {
        let (engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_A).await.unwrap();
        conn.insert("projects", row(ORG_A, "charlie")).await.unwrap();
        assert_eq!(conn.select("projects").await.unwrap().len(), 2);
        assert_eq!(engine.row_count("projects"), 2);

        conn.commit().await.unwrap();
        assert_eq!(engine.row_count("projects"), 3);
        assert_eq!(engine.stats().commits, 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_settings() {
        let (engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_A).await.unwrap();
        conn.insert("projects", row(ORG_A, "charlie")).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(!conn.in_transaction());
        assert_eq!(conn.current_setting("app.current_org_id"), None);
        assert_eq!(engine.row_count("projects"), 2);
        assert_eq!(engine.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn settings_do_not_survive_commit() {
        let (_engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_A).await.unwrap();
        conn.commit().await.unwrap();

        conn.begin().await.unwrap();
        assert_eq!(conn.current_setting("app.current_org_id"), None);
        assert!(conn.select("projects").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_local_outside_transaction_fails() {
        let (_engine, mut conn) = engine_with_rows().await;
        let err = conn.set_local("app.current_org_id", ORG_A).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(INVALID_TRANSACTION_STATE));
    }

    #[tokio::test]
    async fn unknown_table_is_reported() {
        let (_engine, mut conn) = engine_with_rows().await;
        conn.begin().await.unwrap();
        let err = conn.select("missing").await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(UNDEFINED_TABLE));
    }

    #[tokio::test]
    async fn fail_point_fires_once() {
        let (engine, mut conn) = engine_with_rows().await;
        engine.fail_next(FailPoint::Begin, StorageError::uncoded("socket closed"));
        assert!(conn.begin().await.is_err());
        assert!(conn.begin().await.is_ok());
        assert_eq!(conn.statements(), &[Statement::Begin]);
        assert_eq!(engine.stats().begins, 1);
    }

    #[tokio::test]
    async fn statement_log_holds_only_the_current_transaction() {
        let (_engine, mut conn) = engine_with_rows().await;
        for _ in 0..100 {
            conn.begin().await.unwrap();
            conn.set_local("app.current_org_id", ORG_A).await.unwrap();
            conn.select("projects").await.unwrap();
            conn.commit().await.unwrap();
        }

        assert_eq!(conn.statements().len(), 4);
        assert_eq!(conn.statements()[0], Statement::Begin);
        assert_eq!(conn.statements()[3], Statement::Commit);
    }

    #[tokio::test]
    async fn custom_variable_names_drive_the_policy() {
        let vars = SessionVariables::new(
            "tenancy.org",
            "tenancy.user",
            "tenancy.role",
            "tenancy.bypass",
            "tenancy.reason",
        )
        .unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.create_table("projects", RowPolicy::with_variables("org_id", &vars));
        engine.seed("projects", row(ORG_A, "alpha")).unwrap();
        let mut conn = MemoryManager::new(Arc::clone(&engine)).connect().await.unwrap();

        conn.begin().await.unwrap();
        conn.set_local("app.current_org_id", ORG_A).await.unwrap();
        assert!(conn.select("projects").await.unwrap().is_empty());
        conn.set_local("tenancy.org", ORG_A).await.unwrap();
        assert_eq!(conn.select("projects").await.unwrap().len(), 1);
    }
}
