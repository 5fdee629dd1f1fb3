//! Canonical request descriptors.
//!
//! A [`Request`] says what one repository call will do: which operation, on which entity,
//! under which canonical filter, touching which columns. It carries everything a
//! [`StatementBuilder`](crate::statement::StatementBuilder) needs to produce SQL text and
//! nothing else, which makes it a good statement-cache key.
//!
//! # Identity
//!
//! Requests compare and hash through their [`Fingerprint`]: a SHA-256 digest over the
//! operation kind, the entity type name and the *shape* of everything else. Bound values are
//! not part of the fingerprint (statements are parameterized), but anything that changes the
//! SQL text is: `NULL` comparisons, `IN` list lengths, field order inside a group, column
//! lists, ordering and `top`.
//!
//! The fingerprint is computed on first use and memoized; a request is never mutated after it
//! has been handed to a cache.
//!
//! Two requests are equal exactly when their fingerprints are equal. With 256-bit digests an
//! accidental collision between genuinely different requests is not a practical concern, so
//! cache lookups do not re-check the full structure.

mod fingerprint;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::entity::EntityType;
use crate::query::{OrderField, QueryGroup};

pub use fingerprint::Fingerprint;

/// Operation a request describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Count,
    Query,
    BatchQuery,
    Insert,
    Update,
    Delete,
    DeleteAll,
    Merge,
    Truncate,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Count => "Count",
            RequestKind::Query => "Query",
            RequestKind::BatchQuery => "BatchQuery",
            RequestKind::Insert => "Insert",
            RequestKind::Update => "Update",
            RequestKind::Delete => "Delete",
            RequestKind::DeleteAll => "DeleteAll",
            RequestKind::Merge => "Merge",
            RequestKind::Truncate => "Truncate",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable descriptor of one operation on one entity.
#[derive(Debug, Clone)]
pub struct Request {
    kind: RequestKind,
    entity: EntityType,
    filter: Option<QueryGroup>,
    fields: Vec<String>,
    qualifiers: Vec<String>,
    order_by: Vec<OrderField>,
    top: Option<u64>,
    paged: bool,
    fingerprint: OnceLock<Fingerprint>,
}

impl Request {
    pub fn new(kind: RequestKind, entity: EntityType) -> Self {
        Self {
            kind,
            entity,
            filter: None,
            fields: Vec::new(),
            qualifiers: Vec::new(),
            order_by: Vec::new(),
            top: None,
            paged: false,
            fingerprint: OnceLock::new(),
        }
    }

    /// Set the filter. Empty groups are dropped, so an empty conjunction is the same request as
    /// no filter at all.
    pub fn with_filter(self, filter: Option<QueryGroup>) -> Self {
        Self {
            filter: filter.and_then(QueryGroup::canonicalize),
            ..self.reset()
        }
    }

    /// Columns read (projection) or written (insert, update, merge), in statement order.
    pub fn with_fields<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..self.reset()
        }
    }

    /// Columns a merge matches existing rows on.
    pub fn with_qualifiers<I, S>(self, qualifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            qualifiers: qualifiers.into_iter().map(Into::into).collect(),
            ..self.reset()
        }
    }

    pub fn with_order_by(self, order_by: Vec<OrderField>) -> Self {
        Self {
            order_by,
            ..self.reset()
        }
    }

    /// Row limit; `Some(0)` means no limit.
    pub fn with_top(self, top: Option<u64>) -> Self {
        Self {
            top: top.filter(|&n| n > 0),
            ..self.reset()
        }
    }

    /// Mark the request as a page of a batch read (`LIMIT`/`OFFSET` bound as parameters).
    pub fn paged(self) -> Self {
        Self {
            paged: true,
            ..self.reset()
        }
    }

    fn reset(self) -> Self {
        Self {
            fingerprint: OnceLock::new(),
            ..self
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    pub fn filter(&self) -> Option<&QueryGroup> {
        self.filter.as_ref()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn qualifiers(&self) -> &[String] {
        &self.qualifiers
    }

    pub fn order_by(&self) -> &[OrderField] {
        &self.order_by
    }

    pub fn top(&self) -> Option<u64> {
        self.top
    }

    pub fn is_paged(&self) -> bool {
        self.paged
    }

    /// Memoized structural fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        *self.fingerprint.get_or_init(|| fingerprint::compute(self))
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint().hash(state);
    }
}
