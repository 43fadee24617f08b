//! Shared value/type vocabulary for the column codec family (§4.1).
//!
//! Real production row stores compile a specialized encoder/decoder per
//! (logical type, nullable?, position) pair via a bytecode emitter. This
//! port takes the "small codec tree interpreter" option from the design
//! notes: one [`Value`] enum, one [`ColumnType`] enum, and codecs that
//! dispatch on them at runtime.

use std::cmp::Ordering;

/// The logical type of a column, independent of nullability or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    I64,
    F64,
    Bytes,
    Str,
    BigInt,
}

/// Sort direction for a key column. Value columns are always [`Direction::Ascending`]
/// in the sense that it has no effect on their (non order-preserving) encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Position of a column within its tuple: whether decode must be able to
/// stop at the column's end without an external length (`NonLast`), or may
/// consume the remaining bytes of the key/value (`Last`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    NonLast,
    Last,
}

/// A typed column value. `BigInt` is modeled as `i128` here: this core
/// layer encodes/decodes whatever bytes it is given and never performs
/// arithmetic on them, so a fixed-width big integer is sufficient to
/// exercise the sign/length-class header scheme §4.1 describes; a store
/// that needed true arbitrary precision would parameterize this variant
/// on a bignum type instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(f64),
    Bytes(Vec<u8>),
    Str(String),
    BigInt(i128),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Bool(_) => ColumnType::Bool,
            Value::I64(_) => ColumnType::I64,
            Value::F64(_) => ColumnType::F64,
            Value::Bytes(_) => ColumnType::Bytes,
            Value::Str(_) => ColumnType::Str,
            Value::BigInt(_) => ColumnType::BigInt,
        }
    }

    /// Ordering used by the sorted scanner's in-memory comparator (§4.7).
    /// Not used for key byte-encoding order, which is defined directly on
    /// the encoded bytes in `codec::key`.
    pub fn cmp_typed(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::I64(a), Value::I64(b)) => a.cmp(b),
            (Value::F64(a), Value::F64(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Minimal big-endian two's-complement bytes for `v`: the fewest bytes
/// that sign-extend back to `v`, with at least one byte kept.
pub(crate) fn bigint_minimal_be(v: i128) -> Vec<u8> {
    let full = v.to_be_bytes();
    let negative = v < 0;
    let mut start = 0usize;
    while start + 1 < full.len() {
        let b = full[start];
        let next_hi = full[start + 1] & 0x80 != 0;
        let redundant = if negative {
            b == 0xff && next_hi
        } else {
            b == 0x00 && !next_hi
        };
        if redundant {
            start += 1;
        } else {
            break;
        }
    }
    full[start..].to_vec()
}

/// Inverse of [`bigint_minimal_be`]: sign-extend `bytes` (big-endian,
/// two's complement) back to an `i128`.
pub(crate) fn bigint_from_be(bytes: &[u8]) -> i128 {
    debug_assert!(!bytes.is_empty() && bytes.len() <= 16);
    let negative = bytes[0] & 0x80 != 0;
    let mut full = if negative { [0xffu8; 16] } else { [0u8; 16] };
    full[16 - bytes.len()..].copy_from_slice(bytes);
    i128::from_be_bytes(full)
}
