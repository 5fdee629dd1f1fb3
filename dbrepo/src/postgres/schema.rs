use async_trait::async_trait;
use sqlx::{Connection as _, FromRow};
use tracing::{debug, instrument};

use crate::entity::EntityType;
use crate::errors::{Error, Result};
use crate::fields::{FieldDefinition, SchemaMapper};

const COLUMNS_QUERY: &str = r#"
    SELECT
        c.column_name::text AS name,
        c.data_type::text AS data_type,
        (c.is_nullable = 'YES') AS is_nullable,
        (c.is_identity = 'YES' OR COALESCE(c.column_default LIKE 'nextval(%', false)) AS is_identity,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage k
              ON k.constraint_schema = tc.constraint_schema
             AND k.constraint_name = tc.constraint_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = c.table_schema
              AND tc.table_name = c.table_name
              AND k.column_name = c.column_name
        ) AS is_primary,
        c.ordinal_position::int4 AS ordinal
    FROM information_schema.columns c
    WHERE c.table_schema = COALESCE($1, current_schema())
      AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

#[derive(Debug, FromRow)]
struct ColumnRow {
    name: String,
    data_type: String,
    is_nullable: bool,
    is_identity: bool,
    is_primary: bool,
    ordinal: i32,
}

/// Reads field definitions from `information_schema`.
///
/// Opens a short-lived connection of its own, to the connection string the repository passes
/// (or the one it was built with). Unqualified table names resolve against `current_schema()`.
#[derive(Debug, Clone, Default)]
pub struct PgSchemaMapper {
    default_connection_string: Option<String>,
}

impl PgSchemaMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            default_connection_string: Some(connection_string.into()),
        }
    }
}

#[async_trait]
impl SchemaMapper for PgSchemaMapper {
    #[instrument(skip(self, connection_string), fields(entity = %entity), err(level = "debug"))]
    async fn get_field_definitions(&self, entity: &EntityType, connection_string: Option<&str>) -> Result<Vec<FieldDefinition>> {
        let connection_string = connection_string
            .or(self.default_connection_string.as_deref())
            .ok_or_else(|| Error::configuration("schema mapper needs a connection string"))?;

        let (schema, table) = catalog_name(entity.table);

        let mut connection = sqlx::PgConnection::connect(connection_string).await?;
        let rows = sqlx::query_as::<_, ColumnRow>(COLUMNS_QUERY)
            .bind(schema)
            .bind(table)
            .fetch_all(&mut connection)
            .await;
        connection.close().await?;
        let rows = rows?;

        debug!(columns = rows.len(), "Loaded column layout");
        Ok(rows
            .into_iter()
            .map(|row| FieldDefinition {
                name: row.name,
                data_type: row.data_type,
                is_primary: row.is_primary,
                is_identity: row.is_identity,
                is_nullable: row.is_nullable,
                ordinal: usize::try_from(row.ordinal - 1).unwrap_or_default(),
            })
            .collect())
    }
}

/// Schema and table as `information_schema` stores them.
///
/// Statements use unquoted identifiers, which PostgreSQL folds to lower case, so the catalog
/// lookup folds the same way.
fn catalog_name(table: &str) -> (Option<String>, String) {
    match table.split_once('.') {
        Some((schema, table)) => (Some(schema.to_ascii_lowercase()), table.to_ascii_lowercase()),
        None => (None, table.to_ascii_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_name_folds_unquoted_identifiers() {
        assert_eq!(catalog_name("Customers"), (None, "customers".to_string()));
        assert_eq!(catalog_name("Sales.OrderLines"), (Some("sales".to_string()), "orderlines".to_string()));
        assert_eq!(catalog_name("invoices"), (None, "invoices".to_string()));
    }
}
