use std::fmt::Write as _;

use crate::errors::{Error, Result};
use crate::query::{Conjunction, Operation, Order, QueryField, QueryGroup};
use crate::request::{Request, RequestKind};
use crate::statement::StatementBuilder;
use crate::types::Value;

/// PostgreSQL dialect: `$n` placeholders, `LIMIT`/`OFFSET` paging, `MERGE` statements.
///
/// Merges match on arbitrary qualifier columns, with no unique index required, and so need
/// PostgreSQL 15 or later.
///
/// Identifiers are emitted unquoted, so PostgreSQL folds them to lower case the same way
/// [`Row`](crate::types::Row) lookups ignore case. Anything that is not a plain
/// (optionally schema-qualified) identifier is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgStatementBuilder;

impl StatementBuilder for PgStatementBuilder {
    fn dialect(&self) -> &'static str {
        "postgres"
    }

    fn build(&self, request: &Request) -> Result<String> {
        let table = ident(request.entity().table)?;
        let mut sql = String::new();

        match request.kind() {
            RequestKind::Count => {
                write!(sql, "SELECT COUNT(*) AS count FROM {table}").ok();
                write_where(&mut sql, request, 1)?;
            }
            RequestKind::Query => {
                write!(sql, "SELECT {} FROM {table}", projection(request.fields())?).ok();
                write_where(&mut sql, request, 1)?;
                write_order_by(&mut sql, request)?;
                if let Some(top) = request.top() {
                    write!(sql, " LIMIT {top}").ok();
                }
            }
            RequestKind::BatchQuery => {
                if request.order_by().is_empty() {
                    return Err(Error::configuration(format!("batch query on {table} needs an ordering")));
                }
                write!(sql, "SELECT {} FROM {table}", projection(request.fields())?).ok();
                let next = write_where(&mut sql, request, 1)?;
                write_order_by(&mut sql, request)?;
                write!(sql, " LIMIT ${next} OFFSET ${}", next + 1).ok();
            }
            RequestKind::Insert => {
                let columns = idents(request.fields())?;
                if columns.is_empty() {
                    write!(sql, "INSERT INTO {table} DEFAULT VALUES").ok();
                } else {
                    write!(sql, "INSERT INTO {table} ({}) VALUES ({})", columns.join(", "), placeholders(1, columns.len())).ok();
                }
                let returning = idents(request.qualifiers())?;
                if !returning.is_empty() {
                    write!(sql, " RETURNING {}", returning.join(", ")).ok();
                }
            }
            RequestKind::Update => {
                let columns = idents(request.fields())?;
                if columns.is_empty() {
                    return Err(Error::configuration(format!("update on {table} has no columns to set")));
                }
                let assignments: Vec<_> = columns.iter().enumerate().map(|(i, column)| format!("{column} = ${}", i + 1)).collect();
                write!(sql, "UPDATE {table} SET {}", assignments.join(", ")).ok();
                write_where(&mut sql, request, columns.len() + 1)?;
            }
            RequestKind::Delete => {
                write!(sql, "DELETE FROM {table}").ok();
                write_where(&mut sql, request, 1)?;
            }
            RequestKind::DeleteAll => {
                write!(sql, "DELETE FROM {table}").ok();
            }
            RequestKind::Merge => {
                let columns = idents(request.fields())?;
                let qualifiers = idents(request.qualifiers())?;
                if columns.is_empty() || qualifiers.is_empty() {
                    return Err(Error::configuration(format!("merge on {table} needs columns and qualifiers")));
                }
                // qualifiers reuse the placeholder of their column, so values bind once
                let position = |name: &str| columns.iter().position(|column| column.eq_ignore_ascii_case(name));
                let matches = qualifiers
                    .iter()
                    .map(|qualifier| {
                        position(qualifier)
                            .map(|i| format!("target.{qualifier} = ${}", i + 1))
                            .ok_or_else(|| Error::configuration(format!("merge qualifier `{qualifier}` on {table} has no value")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let updates: Vec<_> = columns
                    .iter()
                    .enumerate()
                    .filter(|(_, column)| !qualifiers.iter().any(|q| q.eq_ignore_ascii_case(column)))
                    .map(|(i, column)| format!("{column} = ${}", i + 1))
                    .collect();

                write!(sql, "MERGE INTO {table} AS target USING (SELECT 1) AS source ON {}", matches.join(" AND ")).ok();
                if updates.is_empty() {
                    sql.push_str(" WHEN MATCHED THEN DO NOTHING");
                } else {
                    write!(sql, " WHEN MATCHED THEN UPDATE SET {}", updates.join(", ")).ok();
                }
                write!(
                    sql,
                    " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders(1, columns.len())
                )
                .ok();
            }
            RequestKind::Truncate => {
                write!(sql, "TRUNCATE TABLE {table}").ok();
            }
        }

        Ok(sql)
    }
}

fn ident(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(name)
    } else {
        Err(Error::configuration(format!("`{name}` is not a valid identifier")))
    }
}

fn idents(names: &[String]) -> Result<Vec<&str>> {
    names.iter().map(|name| ident(name)).collect()
}

fn projection(fields: &[String]) -> Result<String> {
    if fields.is_empty() {
        return Ok("*".to_string());
    }
    Ok(idents(fields)?.join(", "))
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|n| format!("${n}")).collect::<Vec<_>>().join(", ")
}

fn write_order_by(sql: &mut String, request: &Request) -> Result<()> {
    if request.order_by().is_empty() {
        return Ok(());
    }
    let terms = request
        .order_by()
        .iter()
        .map(|order| {
            let direction = match order.order {
                Order::Ascending => "ASC",
                Order::Descending => "DESC",
            };
            Ok(format!("{} {direction}", ident(&order.field)?))
        })
        .collect::<Result<Vec<_>>>()?;
    write!(sql, " ORDER BY {}", terms.join(", ")).ok();
    Ok(())
}

/// Append the `WHERE` clause, numbering placeholders from `next`. Returns the next free number.
fn write_where(sql: &mut String, request: &Request, next: usize) -> Result<usize> {
    let Some(filter) = request.filter() else {
        return Ok(next);
    };
    let mut next = next;
    let clause = render_group(filter, &mut next)?;
    write!(sql, " WHERE {clause}").ok();
    Ok(next)
}

fn render_group(group: &QueryGroup, next: &mut usize) -> Result<String> {
    let mut parts = Vec::with_capacity(group.fields.len() + group.groups.len());
    for field in &group.fields {
        parts.push(render_field(field, next)?);
    }
    for child in &group.groups {
        parts.push(format!("({})", render_group(child, next)?));
    }

    let separator = match group.conjunction {
        Conjunction::And => " AND ",
        Conjunction::Or => " OR ",
    };
    let joined = parts.join(separator);
    Ok(if group.is_not { format!("NOT ({joined})") } else { joined })
}

fn render_field(field: &QueryField, next: &mut usize) -> Result<String> {
    let column = ident(&field.field)?;
    let mut placeholder = || {
        let n = *next;
        *next += 1;
        format!("${n}")
    };

    let rendered = match (field.operation, &field.value) {
        (Operation::Equal, Value::Null) => format!("{column} IS NULL"),
        (Operation::NotEqual, Value::Null) => format!("{column} IS NOT NULL"),
        (Operation::In, Value::Array(items)) if items.is_empty() => "1 = 0".to_string(),
        (Operation::NotIn, Value::Array(items)) if items.is_empty() => "1 = 1".to_string(),
        (Operation::In | Operation::NotIn, Value::Array(items)) => {
            let list: Vec<_> = items.iter().map(|_| placeholder()).collect();
            let keyword = if field.operation == Operation::In { "IN" } else { "NOT IN" };
            format!("{column} {keyword} ({})", list.join(", "))
        }
        (Operation::Between | Operation::NotBetween, _) => {
            let low = placeholder();
            let high = placeholder();
            let keyword = if field.operation == Operation::Between { "BETWEEN" } else { "NOT BETWEEN" };
            format!("{column} {keyword} {low} AND {high}")
        }
        (operation, _) => {
            let symbol = match operation {
                Operation::Equal => "=",
                Operation::NotEqual => "<>",
                Operation::LessThan => "<",
                Operation::GreaterThan => ">",
                Operation::LessThanOrEqual => "<=",
                Operation::GreaterThanOrEqual => ">=",
                Operation::Like => "LIKE",
                Operation::NotLike => "NOT LIKE",
                other => {
                    return Err(Error::normalization(0, format!("`{column}` {other:?} needs an array value")));
                }
            };
            format!("{column} {symbol} {}", placeholder())
        }
    };
    Ok(rendered)
}
