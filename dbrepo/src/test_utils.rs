//! Test fixtures: entities, a scripted schema mapper and a recording connection provider.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{Connection, ConnectionProvider};
use crate::entity::{Entity, EntityType};
use crate::errors::{Error, Result};
use crate::fields::{FieldDefinition, SchemaMapper};
use crate::statement::Command;
use crate::types::{Row, Value};

/// Mapped entity with a declared, database-generated primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
}

impl Customer {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            email: None,
        }
    }
}

impl Entity for Customer {
    fn table_name() -> &'static str {
        "customers"
    }

    fn primary_key() -> Option<&'static str> {
        Some("id")
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("id", self.id)
            .with("name", self.name.clone())
            .with("email", self.email.clone())
            // not a column; must be ignored on writes
            .with("display_name", format!("{} <{}>", self.name, self.email.as_deref().unwrap_or("-")))
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
        })
    }
}

/// Entity the fake mapper knows nothing about, with no declared primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub number: String,
    pub total: f64,
}

impl Entity for Invoice {
    fn table_name() -> &'static str {
        "invoices"
    }

    fn to_row(&self) -> Row {
        Row::new().with("number", self.number.clone()).with("total", self.total)
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            number: row.try_get("number")?,
            total: row.try_get("total")?,
        })
    }
}

/// Entity keyed by a `uuid`, with a timestamp column.
#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub id: uuid::Uuid,
    pub seen_at: chrono::DateTime<chrono::Utc>,
}

impl Entity for Visit {
    fn table_name() -> &'static str {
        "visits"
    }

    fn primary_key() -> Option<&'static str> {
        Some("id")
    }

    fn to_row(&self) -> Row {
        Row::new().with("id", self.id).with("seen_at", self.seen_at)
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            seen_at: row.try_get("seen_at")?,
        })
    }
}

pub fn customer_definitions() -> Vec<FieldDefinition> {
    vec![
        FieldDefinition::new("id", "bigint", 0).primary().identity(),
        FieldDefinition::new("name", "text", 1).not_null(),
        FieldDefinition::new("email", "text", 2),
    ]
}

fn failure(message: &str) -> Error {
    Error::Execution(sqlx::Error::Protocol(message.to_string()))
}

/// Schema mapper serving `customers` and `visits`, and nothing otherwise.
#[derive(Debug, Default)]
pub struct FakeMapper {
    pub calls: AtomicUsize,
    fail: bool,
}

impl FakeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl SchemaMapper for FakeMapper {
    async fn get_field_definitions(&self, entity: &EntityType, _connection_string: Option<&str>) -> Result<Vec<FieldDefinition>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            return Err(failure("schema unavailable"));
        }
        Ok(match entity.table {
            "customers" => customer_definitions(),
            "visits" => vec![
                FieldDefinition::new("id", "uuid", 0).primary(),
                FieldDefinition::new("seen_at", "timestamp with time zone", 1).not_null(),
            ],
            _ => Vec::new(),
        })
    }
}

/// Everything the fake connections did, shared by the provider and its connections.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    created: AtomicUsize,
    disposed: AtomicUsize,
    executions: AtomicUsize,
    commands: Mutex<Vec<Command>>,
}

impl ConnectionStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.commands.lock().unwrap().iter().map(|c| c.sql.to_string()).collect()
    }

    pub fn last_command(&self) -> Option<Command> {
        self.commands.lock().unwrap().last().cloned()
    }

    fn record(&self, command: &Command) {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(command.clone());
    }
}

/// Canned results for fake connections.
#[derive(Debug, Default)]
struct Script {
    rows: Mutex<Vec<Row>>,
    scalar: Mutex<Option<Value>>,
    affected: AtomicU64,
    fail: AtomicBool,
    fail_dispose: AtomicBool,
}

/// Connection provider handing out recording, scripted connections.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    pub stats: Arc<ConnectionStats>,
    script: Arc<Script>,
    connect_delay: Option<Duration>,
    execution_delay: Option<Duration>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        *self.script.rows.lock().unwrap() = rows;
        self
    }

    pub fn with_scalar(self, value: impl Into<Value>) -> Self {
        *self.script.scalar.lock().unwrap() = Some(value.into());
        self
    }

    pub fn with_affected(self, affected: u64) -> Self {
        self.script.affected.store(affected, Ordering::SeqCst);
        self
    }

    /// Every statement fails once the connection is open.
    pub fn failing(self) -> Self {
        self.script.fail.store(true, Ordering::SeqCst);
        self
    }

    /// Disposal fails, after counting the connection as disposed.
    pub fn failing_dispose(self) -> Self {
        self.script.fail_dispose.store(true, Ordering::SeqCst);
        self
    }

    /// Widen the window in which concurrent first uses can race.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Every statement takes at least `delay`.
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = Some(delay);
        self
    }
}

#[async_trait]
impl ConnectionProvider for FakeProvider {
    type Connection = FakeConnection;

    fn connection_string(&self) -> Option<&str> {
        Some("fake://test")
    }

    async fn connect(&self) -> Result<FakeConnection> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            stats: Arc::clone(&self.stats),
            script: Arc::clone(&self.script),
            delay: self.execution_delay,
        })
    }

    async fn dispose(&self, _connection: FakeConnection) -> Result<()> {
        self.stats.disposed.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_dispose.load(Ordering::SeqCst) {
            return Err(failure("socket already closed"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    stats: Arc<ConnectionStats>,
    script: Arc<Script>,
    delay: Option<Duration>,
}

impl FakeConnection {
    async fn check(&self, command: &Command) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.record(command);
        if self.script.fail.load(Ordering::SeqCst) {
            return Err(failure("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&mut self, command: &Command) -> Result<u64> {
        self.check(command).await?;
        Ok(self.script.affected.load(Ordering::SeqCst))
    }

    async fn query(&mut self, command: &Command) -> Result<Vec<Row>> {
        self.check(command).await?;
        Ok(self.script.rows.lock().unwrap().clone())
    }

    async fn scalar(&mut self, command: &Command) -> Result<Option<Value>> {
        self.check(command).await?;
        Ok(self.script.scalar.lock().unwrap().clone())
    }
}
