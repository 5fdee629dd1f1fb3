//! # dbrepo: typed repository facade
//!
//! `dbrepo` maps Rust types to database tables and runs CRUD, paging, bulk and merge
//! operations over them through a single facade, [`DbRepository`]. Callers describe rows with
//! filters (predicate expressions, field lists, query groups, primary key values or an object's
//! own columns) and never write SQL for the common cases. Raw SQL stays available through the
//! `execute_*` operations.
//!
//! ## Architecture
//!
//! Every entity-bound call follows one path:
//!
//! - The filter is normalized into a canonical [`QueryGroup`] ([`query`]).
//! - The call is described as a [`Request`](request::Request) whose fingerprint is a SHA-256
//!   digest of its statement shape: kind, entity, filter structure, fields, ordering, paging.
//!   Bound values are not part of the fingerprint, so `Id == 5` and `Id == 6` share a statement.
//! - The [`StatementCache`] returns the SQL for that fingerprint, building it with the configured
//!   [`StatementBuilder`] on a miss.
//! - The command runs on a connection from the [`ConnectionProvider`]: a fresh one per call, a
//!   retained one per repository, or the caller's [`Transaction`].
//!
//! Column metadata comes from a [`SchemaMapper`] and is cached per entity in the
//! [`FieldDefinitionCache`]. `Query` results can additionally be cached under a caller-chosen
//! key in a [`ResultCache`]. A [`Trace`] hook observes every statement.
//!
//! ## PostgreSQL
//!
//! [`postgres`] provides the connection provider (over `sqlx`), an `information_schema`
//! schema mapper, and [`PgStatementBuilder`] renders the SQL.
//!
//! ## Configuration
//!
//! The `dbrepo` binary reads [`config::Config`] from YAML and `DBREPO_` environment variables;
//! see [`config`] for details.

pub mod cache;
pub mod config;
pub mod connection;
pub mod entity;
pub mod errors;
pub mod fields;
pub mod postgres;
pub mod query;
pub mod repository;
pub mod request;
pub mod statement;
pub mod telemetry;
pub mod trace;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use cache::{MemoryCache, ResultCache};
pub use config::Config;
pub use connection::{Connection, ConnectionProvider, Persistency, Transaction};
pub use entity::{Entity, EntityType};
pub use errors::{Error, Result};
pub use fields::{FieldDefinition, FieldDefinitionCache, SchemaMapper};
pub use postgres::{PgConnectionProvider, PgSchemaMapper};
pub use query::{Conjunction, Filter, Operation, Order, OrderField, QueryField, QueryGroup};
pub use repository::{DbRepository, QueryOptions, RepositoryOptions};
pub use statement::{Command, PgStatementBuilder, StatementBuilder, StatementCache};
pub use trace::{LoggingTrace, Trace, TraceEvent};
pub use types::{FromValue, Row, Value};
