//! The repository facade.
//!
//! [`DbRepository`] is the public operation surface: CRUD, batch reads, bulk inserts, merges
//! and raw SQL over any [`Entity`]. Every entity-bound operation follows the same path:
//!
//! 1. normalize the filter into a canonical [`QueryGroup`]
//! 2. describe the call as a [`Request`]
//! 3. fetch (or build and cache) its SQL from the [`StatementCache`]
//! 4. bind parameters into a [`Command`] and run it on a connection chosen by [`Persistency`],
//!    or on the caller's [`Transaction`]
//!
//! Field definitions come from the [`FieldDefinitionCache`], loaded on first use per entity
//! through the configured [`SchemaMapper`].
//!
//! # Example
//!
//! ```ignore
//! let provider = PgConnectionProvider::new(&url)?;
//! let options = RepositoryOptions::builder()
//!     .schema_mapper(Arc::new(PgSchemaMapper::new()))
//!     .persistency(Persistency::Instance)
//!     .build();
//! let repo = DbRepository::new(provider, options);
//!
//! let adults: Vec<Customer> = repo.query("age >= 18", QueryOptions::default(), None).await?;
//! let tx = repo.begin().await?;
//! repo.delete::<Customer>("age < 18", Some(&tx)).await?;
//! tx.commit().await?;
//! ```

use bon::Builder;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::cache::{DEFAULT_EXPIRATION, ResultCache};
use crate::connection::{Connection, ConnectionProvider, Persistency, Transaction};
use crate::entity::{Entity, EntityType};
use crate::errors::{Error, Result};
use crate::fields::{self, FieldDefinition, FieldDefinitionCache, SchemaMapper};
use crate::query::filter::primary_key;
use crate::query::{Filter, OrderField, QueryField, QueryGroup};
use crate::request::{Request, RequestKind};
use crate::statement::{Command, PgStatementBuilder, StatementBuilder, StatementCache};
use crate::trace::{self, Trace, TraceEvent};
use crate::types::{FromValue, Row, Value};

/// Facade configuration.
///
/// The two caches default to fresh instances; pass the same `Arc`s to several repositories to
/// share field definitions and statements between them.
#[derive(Clone, Builder)]
pub struct RepositoryOptions {
    pub schema_mapper: Arc<dyn SchemaMapper>,
    #[builder(default)]
    pub persistency: Persistency,
    /// Applied to every command; `None` waits indefinitely
    pub command_timeout: Option<Duration>,
    #[builder(default = Arc::new(PgStatementBuilder))]
    pub statement_builder: Arc<dyn StatementBuilder>,
    /// Result cache consulted by [`DbRepository::query`] when a cache key is given
    pub cache: Option<Arc<dyn ResultCache>>,
    #[builder(default = DEFAULT_EXPIRATION)]
    pub cache_expiration: Duration,
    pub trace: Option<Arc<dyn Trace>>,
    #[builder(default)]
    pub field_cache: Arc<FieldDefinitionCache>,
    #[builder(default)]
    pub statement_cache: Arc<StatementCache>,
}

impl std::fmt::Debug for RepositoryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryOptions")
            .field("persistency", &self.persistency)
            .field("command_timeout", &self.command_timeout)
            .field("statement_builder", &self.statement_builder.dialect())
            .field("cache", &self.cache.is_some())
            .field("cache_expiration", &self.cache_expiration)
            .field("trace", &self.trace.is_some())
            .finish_non_exhaustive()
    }
}

/// Extras for [`DbRepository::query`].
#[derive(Debug, Clone, Default, Builder)]
pub struct QueryOptions {
    #[builder(default)]
    pub order_by: Vec<OrderField>,
    /// Maximum number of rows
    pub top: Option<u64>,
    /// Serve from (and fill) the result cache under this key
    #[builder(into)]
    pub cache_key: Option<String>,
}

/// What to do with a command once a connection is in hand.
enum Work {
    NonQuery,
    Query,
    Scalar,
    Bulk(Vec<Vec<Value>>),
}

enum Output {
    Affected(u64),
    Rows(Vec<Row>),
    Scalar(Option<Value>),
}

impl Output {
    fn affected(self) -> u64 {
        match self {
            Output::Affected(n) => n,
            Output::Rows(rows) => rows.len() as u64,
            Output::Scalar(_) => 0,
        }
    }

    fn rows(self) -> Vec<Row> {
        match self {
            Output::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    fn scalar(self) -> Option<Value> {
        match self {
            Output::Scalar(value) => value,
            _ => None,
        }
    }
}

/// Normalize against loaded definitions, re-typing text literals to their columns.
fn normalize_with(entity: &EntityType, filter: Filter, definitions: &[FieldDefinition]) -> Result<Option<QueryGroup>> {
    let mut group = filter.normalize(entity, Some(definitions))?;
    if let Some(group) = group.as_mut() {
        group.coerce_text(definitions)?;
    }
    Ok(group)
}

async fn dispatch<C: Connection>(connection: &mut C, command: &Command, work: Work) -> Result<Output> {
    match work {
        Work::NonQuery => connection.execute(command).await.map(Output::Affected),
        Work::Query => connection.query(command).await.map(Output::Rows),
        Work::Scalar => connection.scalar(command).await.map(Output::Scalar),
        Work::Bulk(rows) => connection.bulk_insert(command, rows).await.map(Output::Affected),
    }
}

/// Repository facade over connections from `P`.
///
/// Cloning is cheap and shares the provider, caches and (under [`Persistency::Instance`]) the
/// retained connection.
pub struct DbRepository<P: ConnectionProvider> {
    provider: Arc<P>,
    options: RepositoryOptions,
    instance: Arc<Mutex<Option<P::Connection>>>,
}

impl<P: ConnectionProvider> Clone for DbRepository<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            options: self.options.clone(),
            instance: Arc::clone(&self.instance),
        }
    }
}

impl<P: ConnectionProvider> std::fmt::Debug for DbRepository<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRepository").field("options", &self.options).finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> DbRepository<P> {
    pub fn new(provider: P, options: RepositoryOptions) -> Self {
        Self {
            provider: Arc::new(provider),
            options,
            instance: Arc::new(Mutex::new(None)),
        }
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn statement_cache(&self) -> &Arc<StatementCache> {
        &self.options.statement_cache
    }

    pub fn field_cache(&self) -> &Arc<FieldDefinitionCache> {
        &self.options.field_cache
    }

    /// Same repository, different command timeout.
    pub fn with_command_timeout(&self, timeout: Option<Duration>) -> Self {
        let mut derived = self.clone();
        derived.options.command_timeout = timeout;
        derived
    }

    /// Same repository, different result cache.
    pub fn with_cache(&self, cache: Option<Arc<dyn ResultCache>>) -> Self {
        let mut derived = self.clone();
        derived.options.cache = cache;
        derived
    }

    /// Same repository, different trace hook.
    pub fn with_trace(&self, trace: Option<Arc<dyn Trace>>) -> Self {
        let mut derived = self.clone();
        derived.options.trace = trace;
        derived
    }

    /// Same repository, different statement builder.
    pub fn with_statement_builder(&self, builder: Arc<dyn StatementBuilder>) -> Self {
        let mut derived = self.clone();
        derived.options.statement_builder = builder;
        derived
    }

    /// Field definitions of `E`, loading them on first use.
    pub async fn field_definitions<E: Entity>(&self) -> Result<Arc<[FieldDefinition]>> {
        self.definitions(&EntityType::of::<E>()).await
    }

    async fn definitions(&self, entity: &EntityType) -> Result<Arc<[FieldDefinition]>> {
        self.options
            .field_cache
            .get_or_load(entity, self.provider.connection_string(), self.options.schema_mapper.as_ref())
            .await
    }

    /// Normalize a filter, loading definitions only when a primary key has to be resolved or a
    /// text literal has to take its column's type.
    async fn normalize(&self, entity: &EntityType, filter: Filter) -> Result<Option<QueryGroup>> {
        let mut definitions = match (&filter, entity.primary_key) {
            (Filter::PrimaryKey(_), None) => Some(self.definitions(entity).await?),
            _ => None,
        };
        let mut group = filter.normalize(entity, definitions.as_deref())?;
        if let Some(group) = group.as_mut()
            && group.has_text()
        {
            let definitions = match definitions.take() {
                Some(definitions) => definitions,
                None => self.definitions(entity).await?,
            };
            group.coerce_text(&definitions)?;
        }
        Ok(group)
    }

    fn statement(&self, request: &Request) -> Result<Arc<str>> {
        self.options
            .statement_cache
            .get_or_build(request, self.options.statement_builder.as_ref())
    }

    async fn run(
        &self,
        operation: &'static str,
        entity: Option<&'static str>,
        command: Command,
        work: Work,
        tx: Option<&Transaction<P>>,
    ) -> Result<Output> {
        let command = command.with_timeout(self.options.command_timeout);
        let hook = self.options.trace.as_deref();
        let event = TraceEvent {
            operation,
            entity,
            sql: Arc::clone(&command.sql),
        };

        trace::before(hook, &event).await;
        let started = Instant::now();
        let result = match tx {
            Some(tx) => {
                let mut connection = tx.connection().lock().await;
                dispatch(&mut *connection, &command, work).await
            }
            None => self.on_connection(command, work).await,
        };
        trace::after(hook, &event, started.elapsed()).await;
        result
    }

    /// Run on a connection chosen by the persistency policy.
    ///
    /// Per-call connections are disposed whether execution succeeds or fails; an execution
    /// error wins over a disposal error. That work runs on its own task, so a caller that stops
    /// waiting does not leave the connection open.
    async fn on_connection(&self, command: Command, work: Work) -> Result<Output> {
        match self.options.persistency {
            Persistency::PerCall => {
                let provider = Arc::clone(&self.provider);
                let task = tokio::spawn(async move {
                    let mut connection = provider.connect().await?;
                    let result = dispatch(&mut connection, &command, work).await;
                    let disposed = provider.dispose(connection).await;
                    match (result, disposed) {
                        (Err(e), _) => Err(e),
                        (Ok(_), Err(e)) => Err(e),
                        (Ok(output), Ok(())) => Ok(output),
                    }
                });
                task.await
                    .map_err(|e| Error::Other(anyhow::anyhow!("per-call connection task failed: {e}")))?
            }
            Persistency::Instance => {
                // Creation happens under the lock, so concurrent first uses open one connection
                let mut slot = self.instance.lock().await;
                let connection = match slot.take() {
                    Some(connection) => connection,
                    None => {
                        let connection = self.provider.connect().await?;
                        debug!("Opened retained connection");
                        connection
                    }
                };
                let connection = slot.insert(connection);
                dispatch(connection, &command, work).await
            }
        }
    }

    /// Dispose the retained connection, if one was opened. The next operation opens a new one.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn close(&self) -> Result<()> {
        let retained = self.instance.lock().await.take();
        if let Some(connection) = retained {
            self.provider.dispose(connection).await?;
            debug!("Closed retained connection");
        }
        Ok(())
    }

    /// Open a dedicated connection and start a transaction on it.
    pub async fn begin(&self) -> Result<Transaction<P>> {
        Transaction::begin(Arc::clone(&self.provider)).await
    }

    /// Number of rows matching `filter`.
    #[instrument(skip(self, filter, tx), fields(entity = %EntityType::of::<E>()), err(level = "debug"))]
    pub async fn count<E: Entity>(&self, filter: impl Into<Filter> + Send, tx: Option<&Transaction<P>>) -> Result<i64> {
        let entity = EntityType::of::<E>();
        let group = self.normalize(&entity, filter.into()).await?;
        let request = Request::new(RequestKind::Count, entity).with_filter(group);

        let command = Command::from_request(self.statement(&request)?, &request, Vec::new(), None);
        let value = self.run("Count", Some(entity.name), command, Work::Scalar, tx).await?.scalar();
        Ok(Option::<i64>::from_value(value.unwrap_or_default())
            .map_err(|message| Error::Decode {
                column: "count".to_string(),
                message,
            })?
            .unwrap_or_default())
    }

    /// Entities matching `filter`.
    ///
    /// With a cache key and a configured result cache, a cached result set is returned without
    /// touching any connection; otherwise the rows read are stored under the key.
    #[instrument(skip(self, filter, options, tx), fields(entity = %EntityType::of::<E>(), cache_key = options.cache_key.as_deref()), err(level = "debug"))]
    pub async fn query<E: Entity>(
        &self,
        filter: impl Into<Filter> + Send,
        options: QueryOptions,
        tx: Option<&Transaction<P>>,
    ) -> Result<Vec<E>> {
        let entity = EntityType::of::<E>();
        let filter: Filter = filter.into();
        let cache = match (&options.cache_key, &self.options.cache) {
            (Some(key), Some(cache)) => Some((key.as_str(), cache.as_ref())),
            _ => None,
        };

        if let Some((key, cache)) = cache
            && let Some(rows) = cache.get(key).await
        {
            debug!(rows = rows.len(), "Result cache hit");
            return rows.iter().map(E::from_row).collect();
        }

        let definitions = self.definitions(&entity).await?;
        let group = normalize_with(&entity, filter, &definitions)?;
        let request = Request::new(RequestKind::Query, entity)
            .with_filter(group)
            .with_fields(projection(&definitions))
            .with_order_by(options.order_by)
            .with_top(options.top);

        let command = Command::from_request(self.statement(&request)?, &request, Vec::new(), None);
        let rows = self.run("Query", Some(entity.name), command, Work::Query, tx).await?.rows();

        let entities = rows.iter().map(E::from_row).collect::<Result<Vec<_>>>()?;
        if let Some((key, cache)) = cache {
            debug!(rows = rows.len(), "Result cache miss, storing");
            cache.set(key, Arc::new(rows), Some(self.options.cache_expiration)).await;
        }
        Ok(entities)
    }

    /// One page of entities matching `filter`.
    ///
    /// `page` is zero-based. Without an explicit ordering, rows are ordered by primary key.
    #[instrument(skip(self, filter, order_by, tx), fields(entity = %EntityType::of::<E>()), err(level = "debug"))]
    pub async fn batch_query<E: Entity>(
        &self,
        filter: impl Into<Filter> + Send,
        page: u64,
        rows_per_batch: u64,
        order_by: Vec<OrderField>,
        tx: Option<&Transaction<P>>,
    ) -> Result<Vec<E>> {
        if rows_per_batch == 0 {
            return Err(Error::configuration("rows_per_batch must be greater than zero"));
        }
        let entity = EntityType::of::<E>();
        let definitions = self.definitions(&entity).await?;
        let group = normalize_with(&entity, filter.into(), &definitions)?;
        let order_by = if order_by.is_empty() {
            vec![OrderField::asc(primary_key(&entity, Some(&definitions[..]))?)]
        } else {
            order_by
        };
        let request = Request::new(RequestKind::BatchQuery, entity)
            .with_filter(group)
            .with_fields(projection(&definitions))
            .with_order_by(order_by)
            .paged();

        let offset = page.saturating_mul(rows_per_batch);
        let command = Command::from_request(self.statement(&request)?, &request, Vec::new(), Some((rows_per_batch, offset)));
        let rows = self.run("BatchQuery", Some(entity.name), command, Work::Query, tx).await?.rows();
        rows.iter().map(E::from_row).collect()
    }

    /// Insert an entity, returning its primary key value (generated or given), if it has one.
    pub async fn insert<E: Entity>(&self, entity: &E, tx: Option<&Transaction<P>>) -> Result<Option<Value>> {
        self.inline_insert::<E>(entity.to_row(), tx).await
    }

    /// Insert the columns of `row` into `E`'s table.
    ///
    /// Identity columns and columns without a field definition are skipped.
    #[instrument(skip(self, row, tx), fields(entity = %EntityType::of::<E>(), columns = row.len()), err(level = "debug"))]
    pub async fn inline_insert<E: Entity>(&self, row: Row, tx: Option<&Transaction<P>>) -> Result<Option<Value>> {
        let entity = EntityType::of::<E>();
        let definitions = self.definitions(&entity).await?;
        let (columns, values) = writable(row, &definitions, |definition| !definition.is_identity);
        let returning = primary_key(&entity, Some(&definitions[..])).ok();

        let request = Request::new(RequestKind::Insert, entity)
            .with_fields(columns)
            .with_qualifiers(returning.clone());
        let command = Command::from_request(self.statement(&request)?, &request, values, None);

        match returning {
            Some(_) => Ok(self.run("Insert", Some(entity.name), command, Work::Scalar, tx).await?.scalar()),
            None => {
                self.run("Insert", Some(entity.name), command, Work::NonQuery, tx).await?;
                Ok(None)
            }
        }
    }

    /// Update the row of `entity`.
    ///
    /// With [`Filter::None`] the row is matched by primary key.
    pub async fn update<E: Entity>(&self, entity: &E, filter: impl Into<Filter> + Send, tx: Option<&Transaction<P>>) -> Result<u64> {
        self.inline_update::<E>(entity.to_row(), filter, tx).await
    }

    /// Set the columns of `row` on the rows matching `filter`.
    ///
    /// Primary key, identity and unmapped columns are never set. With [`Filter::None`] the
    /// target row is matched by the primary key value in `row`.
    #[instrument(skip(self, row, filter, tx), fields(entity = %EntityType::of::<E>(), columns = row.len()), err(level = "debug"))]
    pub async fn inline_update<E: Entity>(
        &self,
        row: Row,
        filter: impl Into<Filter> + Send,
        tx: Option<&Transaction<P>>,
    ) -> Result<u64> {
        let entity = EntityType::of::<E>();
        let definitions = self.definitions(&entity).await?;
        let filter: Filter = filter.into();
        let group = match filter {
            Filter::None => {
                let key = primary_key(&entity, Some(&definitions[..]))?;
                let value = row
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| Error::configuration(format!("update of {entity} by primary key needs a `{key}` value")))?;
                Some(QueryGroup::and(vec![QueryField::equal(key, value)]))
            }
            other => normalize_with(&entity, other, &definitions)?,
        };

        let (columns, values) = writable(row, &definitions, |definition| !definition.is_identity && !definition.is_primary);
        let request = Request::new(RequestKind::Update, entity).with_fields(columns).with_filter(group);
        let command = Command::from_request(self.statement(&request)?, &request, values, None);
        Ok(self.run("Update", Some(entity.name), command, Work::NonQuery, tx).await?.affected())
    }

    /// Delete the rows matching `filter`. No filter deletes every row.
    #[instrument(skip(self, filter, tx), fields(entity = %EntityType::of::<E>()), err(level = "debug"))]
    pub async fn delete<E: Entity>(&self, filter: impl Into<Filter> + Send, tx: Option<&Transaction<P>>) -> Result<u64> {
        let entity = EntityType::of::<E>();
        let group = self.normalize(&entity, filter.into()).await?;
        let request = Request::new(RequestKind::Delete, entity).with_filter(group);
        let command = Command::from_request(self.statement(&request)?, &request, Vec::new(), None);
        Ok(self.run("Delete", Some(entity.name), command, Work::NonQuery, tx).await?.affected())
    }

    #[instrument(skip(self, tx), fields(entity = %EntityType::of::<E>()), err(level = "debug"))]
    pub async fn delete_all<E: Entity>(&self, tx: Option<&Transaction<P>>) -> Result<u64> {
        let entity = EntityType::of::<E>();
        let request = Request::new(RequestKind::DeleteAll, entity);
        let command = Command::new(self.statement(&request)?);
        Ok(self.run("DeleteAll", Some(entity.name), command, Work::NonQuery, tx).await?.affected())
    }

    /// Insert `entity`, or update the existing row matching it on `qualifiers`.
    pub async fn merge<E: Entity>(&self, entity: &E, qualifiers: &[&str], tx: Option<&Transaction<P>>) -> Result<u64> {
        self.inline_merge::<E>(entity.to_row(), qualifiers, tx).await
    }

    /// Insert-or-update the columns of `row`, matching existing rows on `qualifiers`.
    ///
    /// Empty qualifiers match on the primary key. Qualifiers need no unique index; the
    /// PostgreSQL builder renders a `MERGE` (PostgreSQL 15+). Identity columns are only written
    /// when they are qualifiers.
    #[instrument(skip(self, row, tx), fields(entity = %EntityType::of::<E>(), columns = row.len()), err(level = "debug"))]
    pub async fn inline_merge<E: Entity>(&self, row: Row, qualifiers: &[&str], tx: Option<&Transaction<P>>) -> Result<u64> {
        let entity = EntityType::of::<E>();
        let definitions = self.definitions(&entity).await?;
        let qualifiers: Vec<String> = if qualifiers.is_empty() {
            vec![primary_key(&entity, Some(&definitions[..]))?]
        } else {
            qualifiers.iter().map(|q| q.to_string()).collect()
        };
        for qualifier in &qualifiers {
            if row.get(qualifier).is_none() {
                return Err(Error::configuration(format!("merge of {entity} needs a `{qualifier}` value")));
            }
        }

        let (columns, values) = writable(row, &definitions, |definition| {
            !definition.is_identity || qualifiers.iter().any(|q| q.eq_ignore_ascii_case(&definition.name))
        });
        let request = Request::new(RequestKind::Merge, entity)
            .with_fields(columns)
            .with_qualifiers(qualifiers);
        let command = Command::from_request(self.statement(&request)?, &request, values, None);
        Ok(self.run("Merge", Some(entity.name), command, Work::NonQuery, tx).await?.affected())
    }

    /// Insert many entities through the connection's bulk path.
    ///
    /// Columns are taken from the first entity; identity and unmapped columns are skipped.
    #[instrument(skip(self, entities), fields(entity = %EntityType::of::<E>(), count = entities.len()), err(level = "debug"))]
    pub async fn bulk_insert<E: Entity>(&self, entities: &[E]) -> Result<u64> {
        let Some(first) = entities.first() else {
            return Ok(0);
        };
        let entity = EntityType::of::<E>();
        let definitions = self.definitions(&entity).await?;
        let (columns, _) = writable(first.to_row(), &definitions, |definition| !definition.is_identity);

        let rows = entities
            .iter()
            .map(|item| {
                let row = item.to_row();
                columns.iter().map(|column| row.get(column).cloned().unwrap_or_default()).collect()
            })
            .collect();

        let request = Request::new(RequestKind::Insert, entity).with_fields(columns);
        let command = Command::new(self.statement(&request)?);
        Ok(self
            .run("BulkInsert", Some(entity.name), command, Work::Bulk(rows), None)
            .await?
            .affected())
    }

    #[instrument(skip(self), fields(entity = %EntityType::of::<E>()), err(level = "debug"))]
    pub async fn truncate<E: Entity>(&self) -> Result<()> {
        let entity = EntityType::of::<E>();
        let request = Request::new(RequestKind::Truncate, entity);
        let command = Command::new(self.statement(&request)?);
        self.run("Truncate", Some(entity.name), command, Work::NonQuery, None).await?;
        Ok(())
    }

    /// Run raw SQL and map every row to `E`.
    pub async fn execute_query<E: Entity>(&self, sql: &str, params: Vec<Value>, tx: Option<&Transaction<P>>) -> Result<Vec<E>> {
        self.execute_query_rows(sql, params, tx).await?.iter().map(E::from_row).collect()
    }

    #[instrument(skip(self, params, tx), fields(params = params.len()), err(level = "debug"))]
    pub async fn execute_query_rows(&self, sql: &str, params: Vec<Value>, tx: Option<&Transaction<P>>) -> Result<Vec<Row>> {
        let command = Command::new(sql).with_params(params);
        Ok(self.run("ExecuteQuery", None, command, Work::Query, tx).await?.rows())
    }

    #[instrument(skip(self, params, tx), fields(params = params.len()), err(level = "debug"))]
    pub async fn execute_non_query(&self, sql: &str, params: Vec<Value>, tx: Option<&Transaction<P>>) -> Result<u64> {
        let command = Command::new(sql).with_params(params);
        Ok(self.run("ExecuteNonQuery", None, command, Work::NonQuery, tx).await?.affected())
    }

    #[instrument(skip(self, params, tx), fields(params = params.len()), err(level = "debug"))]
    pub async fn execute_scalar(&self, sql: &str, params: Vec<Value>, tx: Option<&Transaction<P>>) -> Result<Option<Value>> {
        let command = Command::new(sql).with_params(params);
        Ok(self.run("ExecuteScalar", None, command, Work::Scalar, tx).await?.scalar())
    }
}

/// Column list of a full-row read, in schema order.
fn projection(definitions: &[FieldDefinition]) -> Vec<String> {
    let mut ordered: Vec<_> = definitions.iter().collect();
    ordered.sort_by_key(|definition| definition.ordinal);
    ordered.into_iter().map(|definition| definition.name.clone()).collect()
}

/// Columns of `row` that have a definition accepted by `keep`, with their values, in row order.
fn writable(row: Row, definitions: &[FieldDefinition], keep: impl Fn(&FieldDefinition) -> bool) -> (Vec<String>, Vec<Value>) {
    row.into_iter()
        .filter_map(|(column, value)| {
            fields::find(definitions, &column)
                .filter(|definition| keep(definition))
                .map(|definition| (definition.name.clone(), value))
        })
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::test_utils::{ConnectionStats, Customer, FakeMapper, FakeProvider, Invoice, Visit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn repository(provider: FakeProvider, persistency: Persistency) -> (DbRepository<FakeProvider>, Arc<ConnectionStats>) {
        let stats = Arc::clone(&provider.stats);
        let options = RepositoryOptions::builder()
            .schema_mapper(Arc::new(FakeMapper::new()))
            .persistency(persistency)
            .build();
        (DbRepository::new(provider, options), stats)
    }

    #[test_log::test(tokio::test)]
    async fn per_call_opens_and_disposes_one_connection_per_operation() {
        let (repo, stats) = repository(FakeProvider::new().with_scalar(3_i64), Persistency::PerCall);

        assert_eq!(repo.count::<Customer>((), None).await.unwrap(), 3);
        assert_eq!((stats.created(), stats.disposed()), (1, 1));

        repo.delete::<Customer>("id == 5", None).await.unwrap();
        assert_eq!((stats.created(), stats.disposed()), (2, 2));
    }

    #[tokio::test]
    async fn per_call_disposes_connection_when_update_fails() {
        let (repo, stats) = repository(FakeProvider::new().failing(), Persistency::PerCall);

        let err = repo.update(&Customer::new(7, "Ada"), (), None).await.unwrap_err();

        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(stats.created(), 1);
        assert_eq!(stats.disposed(), 1);
    }

    #[tokio::test]
    async fn per_call_connection_is_disposed_when_the_caller_stops_waiting() {
        let provider = FakeProvider::new().with_scalar(1_i64).with_execution_delay(Duration::from_millis(200));
        let (repo, stats) = repository(provider, Persistency::PerCall);

        let outcome = tokio::time::timeout(Duration::from_millis(20), repo.count::<Customer>((), None)).await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(stats.created(), 1);
        assert_eq!(stats.disposed(), 1);
    }

    #[tokio::test]
    async fn text_literals_are_bound_with_the_column_type() {
        let (repo, stats) = repository(FakeProvider::new().with_affected(1), Persistency::PerCall);
        let id = "550e8400-e29b-41d4-a716-446655440000";

        repo.delete::<Visit>(format!("id == '{id}' && seen_at < '2024-01-01'"), None).await.unwrap();
        let params = stats.last_command().unwrap().params;
        assert_eq!(params[0], Value::Uuid(uuid::Uuid::parse_str(id).unwrap()));
        assert!(matches!(params[1], Value::Timestamp(_)));

        // columns that are not uuid or timestamp keep their text
        repo.delete::<Customer>("name == '42'", None).await.unwrap();
        assert_eq!(stats.last_command().unwrap().params, vec![Value::from("42")]);

        let err = repo.count::<Visit>("id == 'not-a-uuid'", None).await.unwrap_err();
        assert!(matches!(err, Error::Normalization { .. }));
        assert_eq!(stats.created(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn instance_opens_one_connection_under_concurrent_first_use() {
        let provider = FakeProvider::new().with_scalar(1_i64).with_connect_delay(Duration::from_millis(10));
        let (repo, stats) = repository(provider, Persistency::Instance);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.count::<Customer>((), None).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().unwrap(), 1);
        }

        assert_eq!(stats.created(), 1);
        assert_eq!(stats.disposed(), 0);
        assert_eq!(stats.executions(), 100);

        repo.close().await.unwrap();
        assert_eq!(stats.disposed(), 1);
    }

    #[tokio::test]
    async fn instance_reopens_after_close() {
        let (repo, stats) = repository(FakeProvider::new(), Persistency::Instance);

        repo.execute_non_query("SELECT 1", vec![], None).await.unwrap();
        repo.close().await.unwrap();
        repo.close().await.unwrap();
        repo.execute_non_query("SELECT 1", vec![], None).await.unwrap();

        assert_eq!((stats.created(), stats.disposed()), (2, 1));
    }

    #[tokio::test]
    async fn unfiltered_and_filtered_counts_use_separate_statements() {
        let (repo, stats) = repository(FakeProvider::new().with_scalar(0_i64), Persistency::PerCall);

        repo.count::<Customer>((), None).await.unwrap();
        repo.count::<Customer>("Id == 5", None).await.unwrap();
        assert_eq!(repo.statement_cache().len(), 2);

        repo.count::<Customer>("Id == 5", None).await.unwrap();
        assert_eq!(repo.statement_cache().len(), 2);

        let statements = stats.statements();
        assert_eq!(statements[0], "SELECT COUNT(*) AS count FROM customers");
        assert_eq!(statements[1], "SELECT COUNT(*) AS count FROM customers WHERE Id = $1");
        assert_eq!(statements[1], statements[2]);
    }

    #[tokio::test]
    async fn second_cached_query_is_served_without_execution() {
        let row = Row::new().with("id", 1_i64).with("name", "Ada").with("email", Value::Null);
        let provider = FakeProvider::new().with_rows(vec![row]);
        let stats = Arc::clone(&provider.stats);
        let options = RepositoryOptions::builder()
            .schema_mapper(Arc::new(FakeMapper::new()))
            .cache(Arc::new(MemoryCache::default()))
            .build();
        let repo = DbRepository::new(provider, options);
        let cached = || QueryOptions::builder().cache_key("k1").build();

        let first: Vec<Customer> = repo.query((), cached(), None).await.unwrap();
        let second: Vec<Customer> = repo.query((), cached(), None).await.unwrap();

        assert_eq!(first, vec![Customer::new(1, "Ada")]);
        assert_eq!(first, second);
        assert_eq!(stats.executions(), 1);
        assert_eq!(stats.created(), 1);
    }

    #[tokio::test]
    async fn query_without_cache_key_always_executes() {
        let provider = FakeProvider::new();
        let stats = Arc::clone(&provider.stats);
        let options = RepositoryOptions::builder()
            .schema_mapper(Arc::new(FakeMapper::new()))
            .cache(Arc::new(MemoryCache::default()))
            .build();
        let repo = DbRepository::new(provider, options);

        repo.query::<Customer>((), QueryOptions::default(), None).await.unwrap();
        repo.query::<Customer>((), QueryOptions::default(), None).await.unwrap();

        assert_eq!(stats.executions(), 2);
        assert_eq!(
            stats.statements()[0],
            "SELECT id, name, email FROM customers"
        );
    }

    #[tokio::test]
    async fn transaction_connection_is_never_disposed_by_operations() {
        let (repo, stats) = repository(FakeProvider::new().with_scalar(2_i64), Persistency::PerCall);

        let tx = repo.begin().await.unwrap();
        repo.count::<Customer>((), Some(&tx)).await.unwrap();
        repo.delete::<Customer>("id > 10", Some(&tx)).await.unwrap();

        assert_eq!(stats.created(), 1);
        assert_eq!(stats.disposed(), 0);

        tx.commit().await.unwrap();
        assert_eq!(stats.disposed(), 1);
        assert_eq!(stats.statements().first().map(String::as_str), Some("BEGIN"));
        assert_eq!(stats.statements().last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn insert_skips_identity_and_unmapped_columns() {
        let (repo, stats) = repository(FakeProvider::new().with_scalar(42_i64), Persistency::PerCall);

        let key = repo.insert(&Customer::new(0, "Ada"), None).await.unwrap();

        assert_eq!(key, Some(Value::Int(42)));
        let command = stats.last_command().unwrap();
        assert_eq!(&*command.sql, "INSERT INTO customers (name, email) VALUES ($1, $2) RETURNING id");
        assert_eq!(command.params, vec![Value::from("Ada"), Value::Null]);
    }

    #[tokio::test]
    async fn update_without_filter_matches_primary_key() {
        let (repo, stats) = repository(FakeProvider::new().with_affected(1), Persistency::PerCall);

        let affected = repo.update(&Customer::new(7, "Ada"), (), None).await.unwrap();

        assert_eq!(affected, 1);
        let command = stats.last_command().unwrap();
        assert_eq!(&*command.sql, "UPDATE customers SET name = $1, email = $2 WHERE id = $3");
        assert_eq!(command.params, vec![Value::from("Ada"), Value::Null, Value::Int(7)]);
    }

    #[tokio::test]
    async fn inline_update_with_filter() {
        let (repo, stats) = repository(FakeProvider::new().with_affected(4), Persistency::PerCall);

        let affected = repo
            .inline_update::<Customer>(Row::new().with("email", Value::Null), "name LIKE 'A%'", None)
            .await
            .unwrap();

        assert_eq!(affected, 4);
        let command = stats.last_command().unwrap();
        assert_eq!(&*command.sql, "UPDATE customers SET email = $1 WHERE name LIKE $2");
        assert_eq!(command.params, vec![Value::Null, Value::from("A%")]);
    }

    #[tokio::test]
    async fn batch_query_orders_by_primary_key_and_binds_paging() {
        let (repo, stats) = repository(FakeProvider::new(), Persistency::PerCall);

        repo.batch_query::<Customer>((), 2, 10, vec![], None).await.unwrap();

        let command = stats.last_command().unwrap();
        assert_eq!(&*command.sql, "SELECT id, name, email FROM customers ORDER BY id ASC LIMIT $1 OFFSET $2");
        assert_eq!(command.params, vec![Value::Int(10), Value::Int(20)]);
    }

    #[tokio::test]
    async fn batch_query_rejects_empty_pages() {
        let (repo, stats) = repository(FakeProvider::new(), Persistency::PerCall);

        let err = repo.batch_query::<Customer>((), 0, 0, vec![], None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(stats.created(), 0);
    }

    #[tokio::test]
    async fn merge_without_qualifiers_uses_primary_key() {
        let (repo, stats) = repository(FakeProvider::new().with_affected(1), Persistency::PerCall);

        repo.merge(&Customer::new(5, "Ada"), &[], None).await.unwrap();

        let command = stats.last_command().unwrap();
        assert_eq!(
            &*command.sql,
            "MERGE INTO customers AS target USING (SELECT 1) AS source ON target.id = $1 \
             WHEN MATCHED THEN UPDATE SET name = $2, email = $3 \
             WHEN NOT MATCHED THEN INSERT (id, name, email) VALUES ($1, $2, $3)"
        );
        assert_eq!(command.params, vec![Value::Int(5), Value::from("Ada"), Value::Null]);
    }

    #[tokio::test]
    async fn merge_needs_qualifier_values() {
        let (repo, _) = repository(FakeProvider::new(), Persistency::PerCall);

        let err = repo
            .inline_merge::<Customer>(Row::new().with("name", "Ada"), &["email"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn bulk_insert_uses_one_connection() {
        let (repo, stats) = repository(FakeProvider::new().with_affected(1), Persistency::PerCall);
        let customers = vec![Customer::new(0, "a"), Customer::new(0, "b"), Customer::new(0, "c")];

        assert_eq!(repo.bulk_insert(&customers).await.unwrap(), 3);
        assert_eq!(stats.executions(), 3);
        assert_eq!((stats.created(), stats.disposed()), (1, 1));

        assert_eq!(repo.bulk_insert::<Customer>(&[]).await.unwrap(), 0);
        assert_eq!(stats.created(), 1);
    }

    #[tokio::test]
    async fn delete_by_primary_key_value() {
        let (repo, stats) = repository(FakeProvider::new().with_affected(1), Persistency::PerCall);

        repo.delete::<Customer>(Filter::PrimaryKey(5_i64.into()), None).await.unwrap();
        repo.delete_all::<Customer>(None).await.unwrap();
        repo.truncate::<Customer>().await.unwrap();

        assert_eq!(
            stats.statements(),
            vec!["DELETE FROM customers WHERE id = $1", "DELETE FROM customers", "TRUNCATE TABLE customers"]
        );
    }

    #[tokio::test]
    async fn malformed_filter_fails_before_connecting() {
        let (repo, stats) = repository(FakeProvider::new(), Persistency::PerCall);

        let err = repo.count::<Customer>("Id ~ 5", None).await.unwrap_err();

        assert!(matches!(err, Error::Normalization { position: 3, .. }));
        assert_eq!(stats.created(), 0);
        assert!(repo.statement_cache().is_empty());
    }

    #[tokio::test]
    async fn unmapped_entity_is_a_configuration_error() {
        let (repo, stats) = repository(FakeProvider::new(), Persistency::PerCall);

        let err = repo.query::<Invoice>((), QueryOptions::default(), None).await.unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(stats.created(), 0);
    }

    #[tokio::test]
    async fn raw_execution_carries_command_timeout() {
        let (repo, stats) = repository(FakeProvider::new().with_scalar("ok"), Persistency::PerCall);
        let repo = repo.with_command_timeout(Some(Duration::from_secs(5)));

        let value = repo
            .execute_scalar("SELECT status FROM jobs WHERE id = $1", vec![Value::Int(9)], None)
            .await
            .unwrap();

        assert_eq!(value, Some(Value::from("ok")));
        let command = stats.last_command().unwrap();
        assert_eq!(command.timeout, Some(Duration::from_secs(5)));
        assert_eq!(command.params, vec![Value::Int(9)]);
    }

    #[derive(Default)]
    struct RecordingTrace {
        before: AtomicUsize,
        after: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Trace for RecordingTrace {
        async fn before_execution(&self, _event: &TraceEvent) -> anyhow::Result<()> {
            self.before.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("trace sink unavailable");
            }
            Ok(())
        }

        async fn after_execution(&self, _event: &TraceEvent, _elapsed: Duration) -> anyhow::Result<()> {
            self.after.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("trace sink unavailable");
            }
            Ok(())
        }
    }

    #[test_log::test(tokio::test)]
    async fn trace_hook_observes_every_execution_and_its_failures_are_ignored() {
        let (repo, _) = repository(FakeProvider::new().with_scalar(1_i64), Persistency::PerCall);

        let recording = Arc::new(RecordingTrace::default());
        let traced = repo.with_trace(Some(recording.clone() as Arc<dyn Trace>));
        traced.count::<Customer>((), None).await.unwrap();
        assert_eq!(recording.before.load(Ordering::SeqCst), 1);
        assert_eq!(recording.after.load(Ordering::SeqCst), 1);

        let failing = Arc::new(RecordingTrace {
            fail: true,
            ..Default::default()
        });
        let traced = repo.with_trace(Some(failing.clone() as Arc<dyn Trace>));
        assert_eq!(traced.count::<Customer>((), None).await.unwrap(), 1);
        assert_eq!(failing.after.load(Ordering::SeqCst), 1);
    }
}
