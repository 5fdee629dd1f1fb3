//! PostgreSQL collaborators built on sqlx.
//!
//! - [`PgConnectionProvider`] opens plain (unpooled) [`sqlx::PgConnection`]s from a connection string
//! - [`PgConnection`] binds [`Value`](crate::types::Value) parameters and decodes result rows
//! - [`PgSchemaMapper`] reads column layouts from `information_schema`

mod schema;
mod values;

use async_trait::async_trait;
use sqlx::Connection as _;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::connection::{Connection, ConnectionProvider};
use crate::errors::{Error, Result};
use crate::statement::Command;
use crate::types::{Row, Value};

pub use schema::PgSchemaMapper;

/// Opens one PostgreSQL connection per [`connect`](ConnectionProvider::connect).
#[derive(Debug, Clone)]
pub struct PgConnectionProvider {
    connection_string: String,
}

impl PgConnectionProvider {
    pub fn new(connection_string: impl Into<String>) -> Result<Self> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(Error::configuration("connection string is empty"));
        }
        Ok(Self { connection_string })
    }
}

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    type Connection = PgConnection;

    fn connection_string(&self) -> Option<&str> {
        Some(&self.connection_string)
    }

    #[instrument(skip(self), err(level = "debug"))]
    async fn connect(&self) -> Result<PgConnection> {
        let inner = sqlx::PgConnection::connect(&self.connection_string).await?;
        debug!("Opened PostgreSQL connection");
        Ok(PgConnection { inner })
    }

    #[instrument(skip_all, err(level = "debug"))]
    async fn dispose(&self, connection: PgConnection) -> Result<()> {
        connection.inner.close().await?;
        Ok(())
    }
}

/// An open PostgreSQL session.
#[derive(Debug)]
pub struct PgConnection {
    inner: sqlx::PgConnection,
}

impl PgConnection {
    pub fn new(inner: sqlx::PgConnection) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> sqlx::PgConnection {
        self.inner
    }
}

/// Apply the command-level timeout, if any.
async fn with_timeout<T>(timeout: Option<Duration>, fut: impl Future<Output = std::result::Result<T, sqlx::Error>>) -> Result<T> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(limit)),
        },
        None => Ok(fut.await?),
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&mut self, command: &Command) -> Result<u64> {
        let query = values::bind_all(sqlx::query(&command.sql), &command.params);
        let result = with_timeout(command.timeout, query.execute(&mut self.inner)).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, command: &Command) -> Result<Vec<Row>> {
        let query = values::bind_all(sqlx::query(&command.sql), &command.params);
        let rows = with_timeout(command.timeout, query.fetch_all(&mut self.inner)).await?;
        rows.iter().map(values::decode_row).collect()
    }

    async fn scalar(&mut self, command: &Command) -> Result<Option<Value>> {
        let query = values::bind_all(sqlx::query(&command.sql), &command.params);
        let row = with_timeout(command.timeout, query.fetch_optional(&mut self.inner)).await?;
        match row {
            Some(row) => Ok(values::decode_row(&row)?.into_iter().next().map(|(_, value)| value)),
            None => Ok(None),
        }
    }

    /// Inserts every row inside one transaction.
    async fn bulk_insert(&mut self, command: &Command, rows: Vec<Vec<Value>>) -> Result<u64> {
        let mut tx = self.inner.begin().await?;
        let mut affected = 0;
        for params in rows {
            let query = values::bind_all(sqlx::query(&command.sql), &params);
            affected += with_timeout(command.timeout, query.execute(&mut *tx)).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}
