use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::fields::{self, FieldDefinition};
use crate::query::field::{Operation, QueryField};
use crate::types::Value;

/// Deepest group nesting a filter may have, counting the outermost group.
pub const MAX_NESTING: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

/// A conjunction (or disjunction) of comparisons and nested groups.
///
/// Fields are combined before nested groups, in the order given. Order is significant for
/// fingerprints: the same comparisons in a different order build a different statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryGroup {
    pub conjunction: Conjunction,
    pub is_not: bool,
    pub fields: Vec<QueryField>,
    pub groups: Vec<QueryGroup>,
}

impl QueryGroup {
    pub fn new(conjunction: Conjunction) -> Self {
        Self {
            conjunction,
            ..Default::default()
        }
    }

    pub fn and(fields: Vec<QueryField>) -> Self {
        Self {
            fields,
            ..Self::new(Conjunction::And)
        }
    }

    pub fn or(fields: Vec<QueryField>) -> Self {
        Self {
            fields,
            ..Self::new(Conjunction::Or)
        }
    }

    pub fn with_field(mut self, field: QueryField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_group(mut self, group: QueryGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Negate the whole group.
    pub fn negate(mut self) -> Self {
        self.is_not = !self.is_not;
        self
    }

    /// True when the group filters nothing.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.groups.iter().all(QueryGroup::is_empty)
    }

    /// Drop empty subgroups; an empty group becomes `None`.
    pub(crate) fn canonicalize(mut self) -> Option<QueryGroup> {
        self.groups = self.groups.into_iter().filter_map(QueryGroup::canonicalize).collect();
        if self.fields.is_empty() && self.groups.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    /// Check nesting depth and operation/value pairings that no statement could render.
    pub(crate) fn validate(&self) -> Result<()> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<()> {
        if depth > MAX_NESTING {
            return Err(Error::normalization(
                0,
                format!("filter nested too deeply (more than {MAX_NESTING} levels)"),
            ));
        }
        for (position, field) in self.fields.iter().enumerate() {
            if field.field.trim().is_empty() {
                return Err(Error::normalization(position, "comparison has an empty field name"));
            }
            match (field.operation, &field.value) {
                (Operation::Between | Operation::NotBetween, Value::Array(items)) if items.len() == 2 => {}
                (Operation::Between | Operation::NotBetween, _) => {
                    return Err(Error::normalization(
                        position,
                        format!("`{}` BETWEEN needs an array of exactly two values", field.field),
                    ));
                }
                (Operation::In | Operation::NotIn, Value::Array(_)) => {}
                (Operation::In | Operation::NotIn, _) => {
                    return Err(Error::normalization(position, format!("`{}` IN needs an array value", field.field)));
                }
                (Operation::Like | Operation::NotLike, Value::Text(_)) => {}
                (Operation::Like | Operation::NotLike, _) => {
                    return Err(Error::normalization(position, format!("`{}` LIKE needs a text pattern", field.field)));
                }
                (_, Value::Array(_)) => {
                    return Err(Error::normalization(
                        position,
                        format!("`{}` cannot be compared against an array with {:?}", field.field, field.operation),
                    ));
                }
                _ => {}
            }
        }
        self.groups.iter().try_for_each(|group| group.validate_at(depth + 1))
    }

    /// True when any comparison binds a text value.
    pub(crate) fn has_text(&self) -> bool {
        self.fields
            .iter()
            .any(|field| field.parameters().into_iter().any(|value| matches!(value, Value::Text(_))))
            || self.groups.iter().any(QueryGroup::has_text)
    }

    /// Re-type text literals compared against `uuid`, `timestamp` and `date` columns.
    ///
    /// Expression literals are untyped text; bound as `text` they would have no operator
    /// against those column types. Columns without a definition are left alone.
    pub(crate) fn coerce_text(&mut self, definitions: &[FieldDefinition]) -> Result<()> {
        for (position, field) in self.fields.iter_mut().enumerate() {
            if matches!(field.operation, Operation::Like | Operation::NotLike) {
                continue;
            }
            let Some(definition) = fields::find(definitions, &field.field) else {
                continue;
            };
            let data_type = definition.data_type.to_ascii_lowercase();
            let values: Vec<&mut Value> = match &mut field.value {
                Value::Array(items) => items.iter_mut().collect(),
                value => vec![value],
            };
            for value in values {
                coerce_value(value, &data_type).map_err(|message| {
                    Error::normalization(position, format!("`{}` is {data_type}: {message}", field.field))
                })?;
            }
        }
        self.groups.iter_mut().try_for_each(|group| group.coerce_text(definitions))
    }

    /// Bound values in placeholder order: fields first, then nested groups.
    pub fn parameters(&self) -> Vec<Value> {
        let mut values = Vec::new();
        self.collect_parameters(&mut values);
        values
    }

    fn collect_parameters(&self, values: &mut Vec<Value>) {
        for field in &self.fields {
            values.extend(field.parameters().into_iter().cloned());
        }
        for group in &self.groups {
            group.collect_parameters(values);
        }
    }
}

impl QueryField {
    /// Values this comparison binds, in placeholder order.
    ///
    /// `= NULL` and `<> NULL` bind nothing (they render as `IS [NOT] NULL`); range and list
    /// operations bind each array item.
    pub fn parameters(&self) -> Vec<&Value> {
        match (self.operation, &self.value) {
            (Operation::Equal | Operation::NotEqual, Value::Null) => Vec::new(),
            (Operation::Between | Operation::NotBetween | Operation::In | Operation::NotIn, Value::Array(items)) => {
                items.iter().collect()
            }
            (_, value) => vec![value],
        }
    }
}

fn coerce_value(value: &mut Value, data_type: &str) -> std::result::Result<(), String> {
    let Value::Text(text) = value else {
        return Ok(());
    };
    let coerced = match data_type {
        "uuid" => Value::Uuid(Uuid::parse_str(text.trim()).map_err(|e| e.to_string())?),
        "date" => Value::Timestamp(parse_timestamp(text)?),
        t if t.starts_with("timestamp") => Value::Timestamp(parse_timestamp(text)?),
        _ => return Ok(()),
    };
    *value = coerced;
    Ok(())
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` or `YYYY-MM-DD`; values without an offset are UTC.
fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| format!("`{text}` is not a date or timestamp"))
}
