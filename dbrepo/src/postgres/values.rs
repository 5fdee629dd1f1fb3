//! Conversions between [`Value`] and the PostgreSQL wire types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::{Column, Encode, Postgres, Row as _, Type, TypeInfo};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::types::{Row, Value};

/// A `NULL` parameter with no declared type, left for the server to infer.
///
/// Binding `None::<String>` would declare the parameter as `text` and fail against non-text
/// columns.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

pub(super) fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Uuid(v) => query.bind(*v),
            Value::Timestamp(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Bytes(v) => query.bind(v.clone()),
            Value::Json(v) => query.bind(v.clone()),
            // Arrays outside IN/BETWEEN lists are stored as JSON
            array @ Value::Array(_) => query.bind(serde_json::to_value(array).unwrap_or(serde_json::Value::Null)),
        };
    }
    query
}

pub(super) fn decode_row(row: &PgRow) -> Result<Row> {
    let mut decoded = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name()).map_err(|e| Error::Decode {
            column: column.name().to_string(),
            message: e.to_string(),
        })?;
        decoded.push(column.name(), value);
    }
    Ok(decoded)
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> std::result::Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.into(),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(|d| d.to_f64().map(Value::Float).unwrap_or_else(|| Value::Text(d.to_string())))
            .unwrap_or_default(),
        "UUID" => row.try_get::<Option<Uuid>, _>(index)?.into(),
        "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(index)?.into(),
        "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(index)?.map(|t| t.and_utc()).into(),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.map(|d| d.to_string()).into(),
        "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(index)?.into(),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.into(),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "CHAR" => row.try_get::<Option<String>, _>(index)?.into(),
        other => {
            return Err(sqlx::Error::Decode(format!("unsupported column type {other}").into()));
        }
    };
    Ok(value)
}
