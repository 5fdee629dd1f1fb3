//! Filter model: comparisons, query groups, orderings, and the filter inputs that normalize
//! into them.
//!
//! Every operation that takes a `where` accepts anything convertible into a [`Filter`]. The
//! filter is normalized once, up front, into an optional canonical [`QueryGroup`]; requests,
//! fingerprints and statement builders only ever see that canonical form.

pub mod expression;
pub mod field;
pub mod filter;
pub mod group;

pub use field::{Operation, Order, OrderField, QueryField};
pub use filter::Filter;
pub use group::{Conjunction, QueryGroup};
