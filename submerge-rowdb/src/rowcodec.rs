//! Row codec: composes column codecs into the key and value encodings of
//! §3, stamped with the schema version (§4.2, component C2).

use std::sync::Arc;

use submerge_base::{kind_err, ErrorKind, Result};

use crate::codec::{key, value, varint, Position};
use crate::row::Row;
use crate::schema::RowInfo;

/// Outcome of decoding a stored (key, value) pair against a particular
/// `RowInfo`'s expected schema version.
pub enum DecodeOutcome {
    Row(Row),
    /// The stored value was stamped with a different schema version than
    /// this codec expects; the caller (a scanner) should fetch the
    /// `RowInfo` for that version and rebind its decoder (§3 invariant).
    SchemaMismatch(u32),
}

/// Binds column codecs to one `RowInfo` and composes them into whole-row
/// encode/decode, matching the `decoder() -> RowDecoderEncoder` contract
/// scan controllers hand out per batch (§4.3).
#[derive(Clone)]
pub struct RowCodec {
    pub info: Arc<RowInfo>,
}

impl RowCodec {
    pub fn new(info: Arc<RowInfo>) -> Self {
        RowCodec { info }
    }

    pub fn encode_key(&self, row: &Row) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = self.info.key_columns.len();
        for (i, col) in self.info.key_columns.iter().enumerate() {
            let pos = if i + 1 == n { Position::Last } else { Position::NonLast };
            let slot = row.get(&col.name);
            let v = match slot {
                crate::row::Slot::Value(v) => Some(v),
                crate::row::Slot::Null => None,
                crate::row::Slot::Unset => {
                    return Err(kind_err(ErrorKind::Other, format!("key column {} is unset", col.name)))
                }
            };
            if v.is_none() && !col.nullable {
                return Err(kind_err(ErrorKind::Other, format!("key column {} is null but not nullable", col.name)));
            }
            key::encode(&mut buf, v, col.ty, col.nullable, pos, col.direction())?;
        }
        Ok(buf)
    }

    pub fn encode_value(&self, row: &Row) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        varint::write(&mut buf, self.info.schema_version);
        let n = self.info.value_columns.len();
        for (i, col) in self.info.value_columns.iter().enumerate() {
            let pos = if i + 1 == n { Position::Last } else { Position::NonLast };
            let slot = row.get(&col.name);
            let v = match slot {
                crate::row::Slot::Value(v) => Some(v),
                crate::row::Slot::Null => None,
                crate::row::Slot::Unset => {
                    return Err(kind_err(ErrorKind::Other, format!("value column {} is unset", col.name)))
                }
            };
            if v.is_none() && !col.nullable {
                return Err(kind_err(ErrorKind::Other, format!("value column {} is null but not nullable", col.name)));
            }
            value::encode(&mut buf, v, col.nullable, pos)?;
        }
        Ok(buf)
    }

    /// Reads the schema version stamped on a stored value without
    /// decoding the rest of it.
    pub fn peek_schema_version(value_bytes: &[u8]) -> Result<u32> {
        Ok(varint::read(value_bytes)?.0)
    }

    pub fn decode(&self, key_bytes: &[u8], value_bytes: &[u8]) -> Result<DecodeOutcome> {
        let (stamped_version, prefix_len) = varint::read(value_bytes)?;
        if stamped_version != self.info.schema_version {
            return Ok(DecodeOutcome::SchemaMismatch(stamped_version));
        }
        let mut row = Row::new();
        let mut pos = 0usize;
        let n_key = self.info.key_columns.len();
        for (i, col) in self.info.key_columns.iter().enumerate() {
            let p = if i + 1 == n_key { Position::Last } else { Position::NonLast };
            let (v, consumed) = key::decode(&key_bytes[pos..], col.ty, col.nullable, p, col.direction())?;
            pos += consumed;
            match v {
                Some(v) => row.set_value(col.name.clone(), v),
                None => row.set_null(col.name.clone()),
            }
        }
        let mut vpos = prefix_len;
        let n_val = self.info.value_columns.len();
        for (i, col) in self.info.value_columns.iter().enumerate() {
            let p = if i + 1 == n_val { Position::Last } else { Position::NonLast };
            let (v, consumed) = value::decode(&value_bytes[vpos..], col.ty, col.nullable, p)?;
            vpos += consumed;
            match v {
                Some(v) => row.set_value(col.name.clone(), v),
                None => row.set_null(col.name.clone()),
            }
        }
        Ok(DecodeOutcome::Row(row))
    }
}
