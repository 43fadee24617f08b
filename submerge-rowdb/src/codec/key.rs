//! Key-position column codecs (§4.1, §3 "Encoded key").
//!
//! A key column's encoding must let decode stop at the column's end
//! without an external length when it isn't the last column in the key
//! (`Position::NonLast`), and must preserve unsigned lexicographic order
//! consistent with the column's logical order and descending flag.
//!
//! The approach: build the ascending ("logical") bytes for the column
//! first -- an optional one-byte null header followed by a type-specific
//! body -- then, for `Direction::Descending`, read/write every byte
//! through a bit-inversion. Inverting the whole column (header included)
//! keeps the null-ordering invariant intact in both directions: a null
//! header of `0x00` sorts below any present header ascending, and above
//! every present header once every byte (including the header) is
//! inverted.

use super::types::{bigint_from_be, bigint_minimal_be, ColumnType, Direction, Position, Value};
use submerge_base::{kind_err, ErrorKind, Result};

const NULL_HEADER: u8 = 0x00;
const PRESENT_HEADER: u8 = 0x01;

fn maybe_invert(b: u8, dir: Direction) -> u8 {
    match dir {
        Direction::Ascending => b,
        Direction::Descending => !b,
    }
}

fn push_logical(buf: &mut Vec<u8>, bytes: &[u8], dir: Direction) {
    buf.extend(bytes.iter().map(|b| maybe_invert(*b, dir)));
}

/// Reads one logical (direction-corrected) byte from `buf` at `pos`.
fn logical_at(buf: &[u8], pos: usize, dir: Direction) -> Result<u8> {
    let b = *buf
        .get(pos)
        .ok_or_else(|| kind_err(ErrorKind::Other, "truncated key column"))?;
    Ok(maybe_invert(b, dir))
}

fn encode_i64_body(v: i64) -> [u8; 8] {
    let flipped = (v as u64) ^ (1u64 << 63);
    flipped.to_be_bytes()
}

fn decode_i64_body(bytes: [u8; 8]) -> i64 {
    let flipped = u64::from_be_bytes(bytes);
    (flipped ^ (1u64 << 63)) as i64
}

fn encode_f64_body(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let transformed = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    transformed.to_be_bytes()
}

fn decode_f64_body(bytes: [u8; 8]) -> f64 {
    let enc = u64::from_be_bytes(bytes);
    let bits = if enc & (1u64 << 63) != 0 {
        enc & !(1u64 << 63)
    } else {
        !enc
    };
    f64::from_bits(bits)
}

/// Header+magnitude encoding for a big integer key. See module docs on
/// `codec::mod` for the cross-length ordering argument: within a fixed
/// (sign, length) bucket the raw two's-complement bytes already compare
/// correctly as unsigned, so only the header/length-class needs a
/// dedicated ordering rule across buckets.
fn encode_bigint_body(v: i128) -> Vec<u8> {
    let mag = bigint_minimal_be(v);
    let len = mag.len() as u32;
    let negative = v < 0;
    let mut out = Vec::with_capacity(mag.len() + 5);
    if len < 0x7f {
        let length_field = if negative { 0x7e - len as u8 } else { len as u8 };
        let sign_bit = if negative { 0x00 } else { 0x80 };
        out.push(sign_bit | length_field);
    } else {
        // Unreachable for `Value::BigInt(i128)`: its minimal big-endian
        // form is at most 16 bytes, well under the 0x7f extended-length
        // threshold. Kept correct (rather than deleted) in case `Value`
        // ever grows a wider big-integer representation.
        let sign_bit = if negative { 0x00 } else { 0x80 };
        out.push(sign_bit | 0x7f);
        let ext = if negative { u32::MAX - len } else { len };
        out.extend_from_slice(&ext.to_be_bytes());
    }
    out.extend_from_slice(&mag);
    out
}

fn decode_bigint_body(buf: &[u8], dir: Direction, pos: usize) -> Result<(i128, usize)> {
    let header = logical_at(buf, pos, dir)?;
    let negative = header & 0x80 == 0;
    let length_field = header & 0x7f;
    let (len, mut cur) = if length_field == 0x7f {
        let mut ext = [0u8; 4];
        for (i, slot) in ext.iter_mut().enumerate() {
            *slot = logical_at(buf, pos + 1 + i, dir)?;
        }
        let raw = u32::from_be_bytes(ext);
        let len = if negative { u32::MAX - raw } else { raw };
        (len, pos + 5)
    } else {
        let len = if negative { 0x7e - length_field } else { length_field };
        (len as u32, pos + 1)
    };
    let mut mag = Vec::with_capacity(len as usize);
    for i in 0..len as usize {
        mag.push(logical_at(buf, cur + i, dir)?);
    }
    cur += len as usize;
    Ok((bigint_from_be(&mag), cur))
}

/// Escapes `0x00` bytes as `0x00 0xff` and terminates with `0x00 0x00`, so
/// a non-last string/bytes column can be decoded without an external
/// length while the raw `0x00` byte still sorts correctly as a separator.
fn push_escaped_nonlast(buf: &mut Vec<u8>, data: &[u8], dir: Direction) {
    for &b in data {
        if b == 0x00 {
            push_logical(buf, &[0x00, 0xff], dir);
        } else {
            push_logical(buf, &[b], dir);
        }
    }
    push_logical(buf, &[0x00, 0x00], dir);
}

fn read_escaped_nonlast(buf: &[u8], dir: Direction, mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    loop {
        let b = logical_at(buf, pos, dir)?;
        if b == 0x00 {
            let next = logical_at(buf, pos + 1, dir)?;
            match next {
                0x00 => {
                    pos += 2;
                    return Ok((out, pos));
                }
                0xff => {
                    out.push(0x00);
                    pos += 2;
                }
                _ => return Err(kind_err(ErrorKind::Other, "corrupt escaped key string")),
            }
        } else {
            out.push(b);
            pos += 1;
        }
    }
}

pub fn encode(
    buf: &mut Vec<u8>,
    value: Option<&Value>,
    ty: ColumnType,
    nullable: bool,
    pos: Position,
    dir: Direction,
) -> Result<()> {
    if nullable {
        let header = if value.is_none() {
            NULL_HEADER
        } else {
            PRESENT_HEADER
        };
        push_logical(buf, &[header], dir);
    }
    let Some(value) = value else {
        return Ok(());
    };
    match (ty, value) {
        (ColumnType::Bool, Value::Bool(v)) => push_logical(buf, &[if *v { 1 } else { 0 }], dir),
        (ColumnType::I64, Value::I64(v)) => push_logical(buf, &encode_i64_body(*v), dir),
        (ColumnType::F64, Value::F64(v)) => push_logical(buf, &encode_f64_body(*v), dir),
        (ColumnType::BigInt, Value::BigInt(v)) => {
            push_logical(buf, &encode_bigint_body(*v), dir)
        }
        (ColumnType::Str, Value::Str(s)) => match pos {
            Position::NonLast => push_escaped_nonlast(buf, s.as_bytes(), dir),
            Position::Last => push_logical(buf, s.as_bytes(), dir),
        },
        (ColumnType::Bytes, Value::Bytes(b)) => match pos {
            Position::NonLast => push_escaped_nonlast(buf, b, dir),
            Position::Last => push_logical(buf, b, dir),
        },
        _ => return Err(kind_err(ErrorKind::Other, "value does not match column type")),
    }
    Ok(())
}

/// Decodes one key column starting at `buf[0]`. Returns the value (`None`
/// for SQL null) and the number of bytes consumed.
pub fn decode(
    buf: &[u8],
    ty: ColumnType,
    nullable: bool,
    pos: Position,
    dir: Direction,
) -> Result<(Option<Value>, usize)> {
    let mut cur = 0usize;
    if nullable {
        let header = logical_at(buf, 0, dir)?;
        cur = 1;
        if header == NULL_HEADER {
            return Ok((None, cur));
        }
    }
    let (value, consumed) = match (ty, pos) {
        (ColumnType::Bool, _) => {
            let b = logical_at(buf, cur, dir)?;
            (Value::Bool(b != 0), cur + 1)
        }
        (ColumnType::I64, _) => {
            let mut b = [0u8; 8];
            for (i, slot) in b.iter_mut().enumerate() {
                *slot = logical_at(buf, cur + i, dir)?;
            }
            (Value::I64(decode_i64_body(b)), cur + 8)
        }
        (ColumnType::F64, _) => {
            let mut b = [0u8; 8];
            for (i, slot) in b.iter_mut().enumerate() {
                *slot = logical_at(buf, cur + i, dir)?;
            }
            (Value::F64(decode_f64_body(b)), cur + 8)
        }
        (ColumnType::BigInt, _) => {
            let (v, end) = decode_bigint_body(buf, dir, cur)?;
            (Value::BigInt(v), end)
        }
        (ColumnType::Str, Position::NonLast) => {
            let (bytes, end) = read_escaped_nonlast(buf, dir, cur)?;
            let s = String::from_utf8(bytes)
                .map_err(|_| kind_err(ErrorKind::Other, "invalid utf-8 in key string"))?;
            (Value::Str(s), end)
        }
        (ColumnType::Str, Position::Last) => {
            let bytes: Result<Vec<u8>> =
                (cur..buf.len()).map(|i| logical_at(buf, i, dir)).collect();
            let bytes = bytes?;
            let s = String::from_utf8(bytes)
                .map_err(|_| kind_err(ErrorKind::Other, "invalid utf-8 in key string"))?;
            (Value::Str(s), buf.len())
        }
        (ColumnType::Bytes, Position::NonLast) => {
            let (bytes, end) = read_escaped_nonlast(buf, dir, cur)?;
            (Value::Bytes(bytes), end)
        }
        (ColumnType::Bytes, Position::Last) => {
            let bytes: Result<Vec<u8>> =
                (cur..buf.len()).map(|i| logical_at(buf, i, dir)).collect();
            (Value::Bytes(bytes?), buf.len())
        }
    };
    Ok((Some(value), consumed))
}
