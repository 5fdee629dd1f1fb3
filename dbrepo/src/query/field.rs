use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Value;

/// Comparison applied by a [`QueryField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    Like,
    NotLike,
    /// Expects an array of exactly two values
    Between,
    NotBetween,
    /// Expects an array of any length
    In,
    NotIn,
}

impl Operation {
    /// Stable tag written into request fingerprints.
    pub(crate) fn tag(self) -> u8 {
        match self {
            Operation::Equal => 0x01,
            Operation::NotEqual => 0x02,
            Operation::LessThan => 0x03,
            Operation::GreaterThan => 0x04,
            Operation::LessThanOrEqual => 0x05,
            Operation::GreaterThanOrEqual => 0x06,
            Operation::Like => 0x07,
            Operation::NotLike => 0x08,
            Operation::Between => 0x09,
            Operation::NotBetween => 0x0a,
            Operation::In => 0x0b,
            Operation::NotIn => 0x0c,
        }
    }
}

/// A single `field <operation> value` comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryField {
    pub field: String,
    pub operation: Operation,
    pub value: Value,
}

impl QueryField {
    pub fn new(field: impl Into<String>, operation: Operation, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operation,
            value: value.into(),
        }
    }

    /// Shorthand for the most common comparison.
    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operation::Equal, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderField {
    pub field: String,
    pub order: Order,
}

impl OrderField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Order::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: Order::Descending,
        }
    }
}

impl fmt::Display for OrderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.order {
            Order::Ascending => write!(f, "{} ASC", self.field),
            Order::Descending => write!(f, "{} DESC", self.field),
        }
    }
}
