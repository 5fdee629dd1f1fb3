//! Field definitions and the process-scoped field-definition cache.
//!
//! A [`FieldDefinition`] describes one mapped column. Definitions are produced by a
//! [`SchemaMapper`] (for PostgreSQL, [`PgSchemaMapper`](crate::postgres::PgSchemaMapper) reads
//! `information_schema`) and cached per entity type, optionally scoped by connection string
//! since the same entity can map to differently-shaped tables in two databases.
//!
//! # Concurrency
//!
//! Two callers missing the same key at the same time both run the mapper; the first to
//! store its result wins and every caller gets the stored sequence back. The mapper is a
//! read-only schema query, so the only cost of the race is one redundant round trip.
//! No shard lock is held while the mapper runs.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entity::EntityType;
use crate::errors::{Error, Result};

/// One mapped column of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    /// Declared database type name (e.g. `bigint`, `text`)
    pub data_type: String,
    pub is_primary: bool,
    /// Generated by the database (identity/serial columns); skipped on insert
    pub is_identity: bool,
    pub is_nullable: bool,
    pub ordinal: usize,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_primary: false,
            is_identity: false,
            is_nullable: true,
            ordinal,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.is_nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

/// Look up a definition by column name (case-insensitive).
pub fn find<'a>(definitions: &'a [FieldDefinition], name: &str) -> Option<&'a FieldDefinition> {
    definitions.iter().find(|d| d.name.eq_ignore_ascii_case(name))
}

/// Primary key column of a definition sequence.
pub fn primary(definitions: &[FieldDefinition]) -> Option<&FieldDefinition> {
    definitions.iter().find(|d| d.is_primary)
}

/// Loads the column layout of an entity from the database schema.
#[async_trait]
pub trait SchemaMapper: Send + Sync {
    /// Return the entity's columns in schema order.
    ///
    /// An empty result means the entity is not mapped.
    async fn get_field_definitions(&self, entity: &EntityType, connection_string: Option<&str>) -> Result<Vec<FieldDefinition>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    entity: &'static str,
    connection_string: Option<String>,
}

impl CacheKey {
    fn new(entity: &EntityType, connection_string: Option<&str>) -> Self {
        Self {
            entity: entity.name,
            connection_string: connection_string.map(str::to_string),
        }
    }
}

/// Field definitions per entity type (and optionally per connection string).
///
/// Populated on first access per key and never invalidated within a run, except through
/// [`clear`](Self::clear).
#[derive(Debug, Default)]
pub struct FieldDefinitionCache {
    definitions: DashMap<CacheKey, Arc<[FieldDefinition]>>,
}

impl FieldDefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached definitions for an entity, not scoped to any connection string. Never loads.
    pub fn get(&self, entity: &EntityType) -> Option<Arc<[FieldDefinition]>> {
        self.get_scoped(entity, None)
    }

    /// Cached definitions for an entity under a connection string. Never loads.
    pub fn get_scoped(&self, entity: &EntityType, connection_string: Option<&str>) -> Option<Arc<[FieldDefinition]>> {
        self.definitions
            .get(&CacheKey::new(entity, connection_string))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Cached definitions, loading them through `mapper` on a miss.
    ///
    /// Mapper failures propagate and leave the key uncached.
    #[instrument(skip(self, connection_string, mapper), fields(entity = %entity), err(level = "debug"))]
    pub async fn get_or_load(
        &self,
        entity: &EntityType,
        connection_string: Option<&str>,
        mapper: &dyn SchemaMapper,
    ) -> Result<Arc<[FieldDefinition]>> {
        let key = CacheKey::new(entity, connection_string);

        if let Some(entry) = self.definitions.get(&key) {
            return Ok(Arc::clone(entry.value()));
        }

        debug!("Field definitions not cached, loading from schema");
        let loaded = mapper.get_field_definitions(entity, connection_string).await?;
        if loaded.is_empty() {
            return Err(Error::configuration(format!(
                "entity {} is not mapped: no columns found for table `{}`",
                entity.name, entity.table
            )));
        }

        let stored = self.definitions.entry(key).or_insert_with(|| loaded.into());
        Ok(Arc::clone(stored.value()))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn clear(&self) {
        self.definitions.clear();
    }
}
