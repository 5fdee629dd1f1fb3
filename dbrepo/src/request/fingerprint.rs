//! Deterministic hash stream for request fingerprints.
//!
//! Every component is written with a tag byte and length-prefixed strings, so two different
//! requests can only share a stream if they are structurally identical.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::query::{Conjunction, Order, OrderField, QueryField, QueryGroup};
use crate::types::ValueShape;

use super::Request;

/// SHA-256 digest identifying the statement shape of a request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn as_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            use std::fmt::Write as _;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.as_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell statements apart in logs
        f.write_str(&self.as_hex()[..16])
    }
}

pub(super) fn compute(request: &Request) -> Fingerprint {
    let mut hasher = Sha256::new();

    write_str(&mut hasher, &format!("{}.{}", request.kind().name(), request.entity().name));

    match request.filter() {
        None => write_tag(&mut hasher, 0x00),
        Some(group) => {
            write_tag(&mut hasher, 0x01);
            write_group(&mut hasher, group);
        }
    }

    write_tag(&mut hasher, 0x40);
    write_names(&mut hasher, request.fields());
    write_tag(&mut hasher, 0x41);
    write_names(&mut hasher, request.qualifiers());
    write_tag(&mut hasher, 0x42);
    write_order(&mut hasher, request.order_by());

    write_tag(&mut hasher, 0x43);
    match request.top() {
        None => write_tag(&mut hasher, 0x00),
        Some(top) => {
            write_tag(&mut hasher, 0x01);
            write_u64(&mut hasher, top);
        }
    }

    write_tag(&mut hasher, 0x44);
    write_tag(&mut hasher, u8::from(request.is_paged()));

    Fingerprint(hasher.finalize().into())
}

fn write_group(hasher: &mut Sha256, group: &QueryGroup) {
    write_tag(hasher, conjunction_tag(group.conjunction));
    write_tag(hasher, u8::from(group.is_not));
    write_u32(hasher, len_u32(group.fields.len()));
    for field in &group.fields {
        write_field(hasher, field);
    }
    write_u32(hasher, len_u32(group.groups.len()));
    for child in &group.groups {
        write_group(hasher, child);
    }
}

fn write_field(hasher: &mut Sha256, field: &QueryField) {
    write_str(hasher, &field.field);
    write_tag(hasher, field.operation.tag());
    match field.value.shape() {
        ValueShape::Null => write_tag(hasher, 0x30),
        ValueShape::Scalar => write_tag(hasher, 0x31),
        ValueShape::Array(len) => {
            write_tag(hasher, 0x32);
            write_u32(hasher, len_u32(len));
        }
    }
}

fn write_names(hasher: &mut Sha256, names: &[String]) {
    write_u32(hasher, len_u32(names.len()));
    for name in names {
        write_str(hasher, name);
    }
}

fn write_order(hasher: &mut Sha256, order_by: &[OrderField]) {
    write_u32(hasher, len_u32(order_by.len()));
    for order in order_by {
        write_str(hasher, &order.field);
        write_tag(hasher, order_tag(order.order));
    }
}

fn write_str(hasher: &mut Sha256, value: &str) {
    write_u32(hasher, len_u32(value.len()));
    hasher.update(value.as_bytes());
}

fn write_u32(hasher: &mut Sha256, value: u32) {
    hasher.update(value.to_be_bytes());
}

fn write_u64(hasher: &mut Sha256, value: u64) {
    hasher.update(value.to_be_bytes());
}

fn write_tag(hasher: &mut Sha256, tag: u8) {
    hasher.update([tag]);
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

const fn conjunction_tag(conjunction: Conjunction) -> u8 {
    match conjunction {
        Conjunction::And => 0x20,
        Conjunction::Or => 0x21,
    }
}

const fn order_tag(order: Order) -> u8 {
    match order {
        Order::Ascending => 0x01,
        Order::Descending => 0x02,
    }
}
