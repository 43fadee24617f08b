//! Value-position column codecs (§4.1, §3 "Encoded value").
//!
//! Value encodings need not be order-preserving. Non-last columns are
//! framed with the `codec::varint` 1/2/4-byte length-prefix form (or, for
//! nullable columns, that same form storing `len + 1`, with `0` meaning
//! null); last columns may omit the prefix and consume the remaining
//! value bytes instead.

use super::types::{bigint_from_be, bigint_minimal_be, ColumnType, Position, Value};
use super::varint;
use submerge_base::{kind_err, ErrorKind, Result};

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}
fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_leb128(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

fn read_leb128(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    let mut shift = 0;
    for (i, &b) in buf.iter().enumerate() {
        v |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok((v, i + 1));
        }
        shift += 7;
    }
    Err(kind_err(ErrorKind::Other, "truncated varint"))
}

fn body_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Bool(b) => vec![if *b { 1 } else { 0 }],
        Value::I64(v) => {
            let mut buf = Vec::new();
            write_leb128(&mut buf, zigzag_encode(*v));
            buf
        }
        Value::F64(v) => v.to_be_bytes().to_vec(),
        Value::BigInt(v) => bigint_minimal_be(*v),
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::Bytes(b) => b.clone(),
    }
}

fn decode_body(bytes: &[u8], ty: ColumnType) -> Result<Value> {
    Ok(match ty {
        ColumnType::Bool => Value::Bool(*bytes.first().unwrap_or(&0) != 0),
        ColumnType::I64 => {
            let (zz, consumed) = read_leb128(bytes)?;
            if consumed != bytes.len() {
                return Err(kind_err(ErrorKind::Other, "trailing bytes after int value"));
            }
            Value::I64(zigzag_decode(zz))
        }
        ColumnType::F64 => {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| kind_err(ErrorKind::Other, "bad float value length"))?;
            Value::F64(f64::from_be_bytes(arr))
        }
        ColumnType::BigInt => Value::BigInt(bigint_from_be(bytes)),
        ColumnType::Str => Value::Str(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| kind_err(ErrorKind::Other, "invalid utf-8 in value string"))?,
        ),
        ColumnType::Bytes => Value::Bytes(bytes.to_vec()),
    })
}

pub fn encode(
    buf: &mut Vec<u8>,
    value: Option<&Value>,
    nullable: bool,
    pos: Position,
) -> Result<()> {
    match pos {
        Position::Last => {
            if nullable {
                buf.push(if value.is_some() { 1 } else { 0 });
            }
            if let Some(v) = value {
                buf.extend(body_bytes(v));
            }
        }
        Position::NonLast => {
            let body = value.map(body_bytes);
            if nullable {
                let encoded_len = body.as_ref().map(|b| b.len() as u32 + 1).unwrap_or(0);
                varint::write(buf, encoded_len);
            } else {
                varint::write(buf, body.as_ref().map(|b| b.len() as u32).unwrap_or(0));
            }
            if let Some(b) = body {
                buf.extend(b);
            }
        }
    }
    Ok(())
}

/// Decodes one value column starting at `buf[0]`. Returns the value and
/// the number of bytes consumed (for `Position::Last`, always the whole
/// of `buf`).
pub fn decode(
    buf: &[u8],
    ty: ColumnType,
    nullable: bool,
    pos: Position,
) -> Result<(Option<Value>, usize)> {
    match pos {
        Position::Last => {
            if nullable {
                let marker = *buf
                    .first()
                    .ok_or_else(|| kind_err(ErrorKind::Other, "truncated value"))?;
                if marker == 0 {
                    return Ok((None, 1));
                }
                let value = decode_body(&buf[1..], ty)?;
                Ok((Some(value), buf.len()))
            } else if buf.is_empty() && matches!(ty, ColumnType::Str | ColumnType::Bytes) {
                Ok((Some(decode_body(buf, ty)?), 0))
            } else {
                Ok((Some(decode_body(buf, ty)?), buf.len()))
            }
        }
        Position::NonLast => {
            let (raw_len, prefix_len) = varint::read(buf)?;
            let body_start = prefix_len;
            if nullable {
                if raw_len == 0 {
                    return Ok((None, body_start));
                }
                let body_len = (raw_len - 1) as usize;
                let end = body_start + body_len;
                let body = buf
                    .get(body_start..end)
                    .ok_or_else(|| kind_err(ErrorKind::Other, "truncated value body"))?;
                Ok((Some(decode_body(body, ty)?), end))
            } else {
                let body_len = raw_len as usize;
                let end = body_start + body_len;
                let body = buf
                    .get(body_start..end)
                    .ok_or_else(|| kind_err(ErrorKind::Other, "truncated value body"))?;
                Ok((Some(decode_body(body, ty)?), end))
            }
        }
    }
}
