//! SQL statements: building them from requests, caching them, and binding their parameters.
//!
//! A [`StatementBuilder`] turns a [`Request`] into parameterized SQL. Placeholders are
//! numbered in one fixed order, which [`Command::from_request`] follows when it gathers the
//! values to bind:
//!
//! 1. written values (insert, update and merge columns, in request field order)
//! 2. filter values (fields before nested groups, arrays expanded, nothing for `IS [NOT] NULL`)
//! 3. paging values (`LIMIT`, then `OFFSET`) for batch reads

mod cache;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;
use crate::request::Request;
use crate::types::Value;

pub use cache::StatementCache;
pub use postgres::PgStatementBuilder;

/// Renders SQL text for a request in one dialect.
pub trait StatementBuilder: Send + Sync {
    /// Dialect name, part of the statement-cache key
    fn dialect(&self) -> &'static str;

    fn build(&self, request: &Request) -> Result<String>;
}

/// A statement ready to run: SQL text, bound parameters and an optional timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sql: Arc<str>,
    pub params: Vec<Value>,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(sql: impl Into<Arc<str>>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Gather parameters for a built request statement.
    ///
    /// `written` are the column values of insert, update and merge requests in
    /// [`Request::fields`] order; `paging` is `(limit, offset)` for paged requests.
    pub fn from_request(sql: Arc<str>, request: &Request, written: Vec<Value>, paging: Option<(u64, u64)>) -> Self {
        let mut params = written;
        if let Some(filter) = request.filter() {
            params.extend(filter.parameters());
        }
        if let Some((limit, offset)) = paging {
            params.push(Value::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
            params.push(Value::Int(i64::try_from(offset).unwrap_or(i64::MAX)));
        }
        Self {
            sql,
            params,
            timeout: None,
        }
    }
}
