//! Mapped entity types.
//!
//! An entity is a Rust type backed by one table or view. The repository never reflects over
//! struct fields: the [`Entity`] implementation says which table it lives in and how it
//! converts to and from a [`Row`]. Everything else about its columns (types, nullability,
//! identity columns) comes from [`FieldDefinition`](crate::fields::FieldDefinition)s loaded
//! through a [`SchemaMapper`](crate::fields::SchemaMapper).
//!
//! # Example
//!
//! ```ignore
//! struct Customer {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Entity for Customer {
//!     fn table_name() -> &'static str {
//!         "customers"
//!     }
//!
//!     fn to_row(&self) -> Row {
//!         Row::new().with("id", self.id).with("name", self.name.clone())
//!     }
//!
//!     fn from_row(row: &Row) -> dbrepo::Result<Self> {
//!         Ok(Self {
//!             id: row.try_get("id")?,
//!             name: row.try_get("name")?,
//!         })
//!     }
//! }
//! ```

use std::fmt;

use crate::errors::Result;
use crate::types::Row;

pub trait Entity: Send + Sync + Sized + 'static {
    /// Table (or view) the entity maps to
    fn table_name() -> &'static str;

    /// Primary key column, when the entity declares one.
    ///
    /// When `None`, the primary key is taken from the loaded field definitions.
    fn primary_key() -> Option<&'static str> {
        None
    }

    /// Property values in declared order
    fn to_row(&self) -> Row;

    fn from_row(row: &Row) -> Result<Self>;
}

/// Identity of an entity type, detached from its generic parameter so requests and caches can
/// hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityType {
    /// Fully qualified Rust type name
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: Option<&'static str>,
}

impl EntityType {
    pub fn of<E: Entity>() -> Self {
        Self {
            name: std::any::type_name::<E>(),
            table: E::table_name(),
            primary_key: E::primary_key(),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
