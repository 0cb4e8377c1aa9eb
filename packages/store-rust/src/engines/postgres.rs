//! `PostgreSQL` backend.
//!
//! Session variables are written with `set_config(name, value, true)`, whose
//! third argument makes the setting transaction-local, and both arguments go
//! over the wire as bind parameters. Row policies read them back with
//! `current_setting('app.current_org_id', true)`.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgDatabaseError};
use sqlx::ConnectOptions;

use crate::connection::{Connection, ConnectionManager};
use crate::error::StorageError;

/// Opens `PgConnection`s from fixed connect options.
#[derive(Debug, Clone)]
pub struct PgManager {
    options: PgConnectOptions,
}

impl PgManager {
    #[must_use]
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    /// Parses a `postgres://` URL.
    ///
    /// # Errors
    ///
    /// Returns an uncoded [`StorageError`] if the URL is malformed.
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        let options = url.parse::<PgConnectOptions>().map_err(StorageError::from)?;
        Ok(Self::new(options))
    }
}

#[async_trait]
impl ConnectionManager for PgManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, StorageError> {
        Ok(self.options.connect().await?)
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn begin(&mut self) -> Result<(), StorageError> {
        sqlx::query("BEGIN").execute(&mut *self).await?;
        Ok(())
    }

    async fn set_local(&mut self, name: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(name)
            .bind(value)
            .execute(&mut *self)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        sqlx::query("COMMIT").execute(&mut *self).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        sqlx::query("ROLLBACK").execute(&mut *self).await?;
        Ok(())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let pg = db.try_downcast_ref::<PgDatabaseError>();
                StorageError {
                    code: db.code().map(|code| code.into_owned()),
                    message: db.message().to_string(),
                    constraint: db.constraint().map(str::to_string),
                    table: pg.and_then(PgDatabaseError::table).map(str::to_string),
                    column: pg.and_then(PgDatabaseError::column).map(str::to_string),
                }
            }
            other => StorageError::uncoded(other.to_string()),
        }
    }
}
