//! Connection abstraction: the collaborators a repository executes through.
//!
//! A [`ConnectionProvider`] opens and disposes [`Connection`]s. The repository decides when to
//! do either according to its [`Persistency`], except inside a caller-owned [`Transaction`],
//! whose connection the repository only borrows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::errors::Result;
use crate::statement::Command;
use crate::types::{Row, Value};

/// One open database session.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, command: &Command) -> Result<u64>;

    /// Run a statement and materialize its result set.
    async fn query(&mut self, command: &Command) -> Result<Vec<Row>>;

    /// First column of the first row, if any.
    async fn scalar(&mut self, command: &Command) -> Result<Option<Value>>;

    /// Run one insert statement per row of parameters.
    ///
    /// Connections with a native bulk-copy path should override this.
    async fn bulk_insert(&mut self, command: &Command, rows: Vec<Vec<Value>>) -> Result<u64> {
        let mut affected = 0;
        for params in rows {
            let row_command = command.clone().with_params(params);
            affected += self.execute(&row_command).await?;
        }
        Ok(affected)
    }

    async fn begin(&mut self) -> Result<()> {
        self.execute(&Command::new("BEGIN")).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute(&Command::new("COMMIT")).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute(&Command::new("ROLLBACK")).await.map(|_| ())
    }
}

/// Opens and disposes connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    type Connection: Connection;

    /// Connection string the provider connects with.
    ///
    /// Scopes the field-definition cache, so one entity can be mapped against two databases.
    fn connection_string(&self) -> Option<&str> {
        None
    }

    async fn connect(&self) -> Result<Self::Connection>;

    async fn dispose(&self, connection: Self::Connection) -> Result<()>;
}

/// When the repository opens and disposes connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistency {
    /// A new connection per operation, disposed when the operation finishes (even on failure)
    #[default]
    PerCall,
    /// One connection opened on first use and kept until [`DbRepository::close`](crate::DbRepository::close)
    Instance,
}

/// A caller-owned transaction.
///
/// Repository operations given a transaction run on its connection and never dispose it. The
/// connection is disposed by [`commit`](Self::commit) or [`rollback`](Self::rollback); dropping an
/// unfinished transaction drops the connection, which for PostgreSQL rolls the transaction back
/// server-side.
pub struct Transaction<P: ConnectionProvider> {
    provider: Arc<P>,
    connection: Mutex<P::Connection>,
}

impl<P: ConnectionProvider> Transaction<P> {
    /// Open a dedicated connection and start a transaction on it.
    #[instrument(skip(provider), err(level = "debug"))]
    pub async fn begin(provider: Arc<P>) -> Result<Self> {
        let mut connection = provider.connect().await?;
        if let Err(e) = connection.begin().await {
            if let Err(disposal) = provider.dispose(connection).await {
                debug!(error = %disposal, "Disposing after a failed BEGIN also failed");
            }
            return Err(e);
        }
        debug!("Transaction started");
        Ok(Self {
            provider,
            connection: Mutex::new(connection),
        })
    }

    pub(crate) fn connection(&self) -> &Mutex<P::Connection> {
        &self.connection
    }

    #[instrument(skip(self), err(level = "debug"))]
    pub async fn commit(self) -> Result<()> {
        let mut connection = self.connection.into_inner();
        let result = connection.commit().await;
        let disposed = self.provider.dispose(connection).await;
        result.and(disposed)
    }

    #[instrument(skip(self), err(level = "debug"))]
    pub async fn rollback(self) -> Result<()> {
        let mut connection = self.connection.into_inner();
        let result = connection.rollback().await;
        let disposed = self.provider.dispose(connection).await;
        result.and(disposed)
    }
}

impl<P: ConnectionProvider> std::fmt::Debug for Transaction<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}
