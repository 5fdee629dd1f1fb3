use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use crate::errors::Result;
use crate::request::{Fingerprint, Request};
use crate::statement::StatementBuilder;

/// Built SQL text per request fingerprint and dialect.
///
/// Shared between repositories through an `Arc`; entries live until [`clear`](Self::clear).
/// Concurrent misses on one key may both build; the first stored text is kept.
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: DashMap<(&'static str, Fingerprint), Arc<str>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, request: &Request, builder: &dyn StatementBuilder) -> Result<Arc<str>> {
        let key = (builder.dialect(), request.fingerprint());

        if let Some(sql) = self.statements.get(&key) {
            trace!(kind = %request.kind(), fingerprint = %key.1, "Statement cache hit");
            return Ok(Arc::clone(sql.value()));
        }

        let built: Arc<str> = builder.build(request)?.into();
        trace!(kind = %request.kind(), fingerprint = %key.1, sql = %built, "Statement cache miss");
        let stored = self.statements.entry(key).or_insert(built);
        Ok(Arc::clone(stored.value()))
    }

    pub fn contains(&self, request: &Request, builder: &dyn StatementBuilder) -> bool {
        self.statements.contains_key(&(builder.dialect(), request.fingerprint()))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn clear(&self) {
        self.statements.clear();
    }
}
