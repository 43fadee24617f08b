//! Row info and schema registry (§3 "Row info"/"Schema version", §4.2
//! component C2).
//!
//! `RowInfo` is the immutable, shared metadata for one row type at one
//! schema version: the ordered key columns (whose order defines the
//! row's sort order) and the unordered value columns. `SchemaRegistry`
//! wraps an external schema source (the row-type reflection layer is out
//! of scope per §1) with the weak cache the design notes call for, so a
//! scanner that drops the last reference to a `RowInfo` lets it be
//! reclaimed and refetched cleanly later.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use submerge_base::{kind_err, ErrorKind, Result};

use crate::codec::{varint, ColumnType, Direction};

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Meaningful only for key columns.
    pub descending: bool,
}

impl Column {
    pub fn key(name: impl Into<String>, ty: ColumnType, nullable: bool, descending: bool) -> Self {
        Column { name: name.into(), ty, nullable, descending }
    }
    pub fn value(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Column { name: name.into(), ty, nullable, descending: false }
    }
    pub(crate) fn direction(&self) -> Direction {
        if self.descending {
            Direction::Descending
        } else {
            Direction::Ascending
        }
    }
}

/// Immutable metadata for one row type at one schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct RowInfo {
    pub row_type: String,
    pub schema_version: u32,
    /// Ordered; this order defines the row's sort order (§3 invariant).
    pub key_columns: Vec<Column>,
    pub value_columns: Vec<Column>,
    value_index: HashMap<String, usize>,
}

impl RowInfo {
    pub fn new(
        row_type: impl Into<String>,
        schema_version: u32,
        key_columns: Vec<Column>,
        value_columns: Vec<Column>,
    ) -> Self {
        let value_index = value_columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        RowInfo { row_type: row_type.into(), schema_version, key_columns, value_columns, value_index }
    }

    /// The "all columns" view: key columns in key order, then value
    /// columns in value order.
    pub fn all_columns(&self) -> impl Iterator<Item = &Column> {
        self.key_columns.iter().chain(self.value_columns.iter())
    }

    pub fn value_column_index(&self, name: &str) -> Option<usize> {
        self.value_index.get(name).copied()
    }

    pub fn key_column_index(&self, name: &str) -> Option<usize> {
        self.key_columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.key_columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.value_columns.iter().find(|c| c.name == name))
    }
}

/// A secondary index's row info, plus the descriptor bytes that name it
/// (§6 "Secondary-index descriptor").
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryInfo {
    pub info: RowInfo,
    pub descriptor: Vec<u8>,
    pub index_id: u64,
}

/// Encodes a secondary-index descriptor: `prefixPF(numKeys)`, then per key
/// column a direction byte and `prefixPF(nameLen) || name`, then
/// `prefixPF(numValues)` and per value column `prefixPF(nameLen) || name`.
pub fn encode_descriptor(key_columns: &[(&str, Direction)], value_columns: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    varint::write(&mut buf, key_columns.len() as u32);
    for (name, dir) in key_columns {
        buf.push(match dir {
            Direction::Ascending => b'+',
            Direction::Descending => b'-',
        });
        varint::write(&mut buf, name.len() as u32);
        buf.extend(name.as_bytes());
    }
    varint::write(&mut buf, value_columns.len() as u32);
    for name in value_columns {
        varint::write(&mut buf, name.len() as u32);
        buf.extend(name.as_bytes());
    }
    buf
}

pub fn decode_descriptor(bytes: &[u8]) -> Result<(Vec<(String, Direction)>, Vec<String>)> {
    let mut pos = 0usize;
    let (num_keys, n) = varint::read(&bytes[pos..])?;
    pos += n;
    let mut keys = Vec::with_capacity(num_keys as usize);
    for _ in 0..num_keys {
        let dir_byte = *bytes
            .get(pos)
            .ok_or_else(|| kind_err(ErrorKind::CorruptDatabase, "truncated descriptor"))?;
        let dir = match dir_byte {
            b'+' => Direction::Ascending,
            b'-' => Direction::Descending,
            _ => return Err(kind_err(ErrorKind::CorruptDatabase, "bad direction byte in descriptor")),
        };
        pos += 1;
        let (len, n) = varint::read(&bytes[pos..])?;
        pos += n;
        let name_bytes = bytes
            .get(pos..pos + len as usize)
            .ok_or_else(|| kind_err(ErrorKind::CorruptDatabase, "truncated descriptor name"))?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| kind_err(ErrorKind::CorruptDatabase, "descriptor name not utf-8"))?;
        pos += len as usize;
        keys.push((name, dir));
    }
    let (num_values, n) = varint::read(&bytes[pos..])?;
    pos += n;
    let mut values = Vec::with_capacity(num_values as usize);
    for _ in 0..num_values {
        let (len, n) = varint::read(&bytes[pos..])?;
        pos += n;
        let name_bytes = bytes
            .get(pos..pos + len as usize)
            .ok_or_else(|| kind_err(ErrorKind::CorruptDatabase, "truncated descriptor name"))?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| kind_err(ErrorKind::CorruptDatabase, "descriptor name not utf-8"))?;
        pos += len as usize;
        values.push(name);
    }
    Ok((keys, values))
}

/// The external schema store the registry consults on a cache miss. The
/// row-type reflection layer that really implements this lives outside
/// the core (§1); tests and small deployments can use
/// [`StaticSchemaSource`].
pub trait SchemaSource: Send + Sync {
    fn load(&self, row_type: &str, index_id: u64, schema_version: u32) -> Result<RowInfo>;
}

/// An in-memory `SchemaSource`, mainly for tests: row infos are
/// registered up front and never garbage collected at the source level
/// (only the registry's cache entries are weak).
#[derive(Default)]
pub struct StaticSchemaSource {
    rows: DashMap<(String, u64, u32), RowInfo>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, index_id: u64, info: RowInfo) {
        let key = (info.row_type.clone(), index_id, info.schema_version);
        self.rows.insert(key, info);
    }
}

impl SchemaSource for StaticSchemaSource {
    fn load(&self, row_type: &str, index_id: u64, schema_version: u32) -> Result<RowInfo> {
        self.rows
            .get(&(row_type.to_string(), index_id, schema_version))
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                kind_err(
                    ErrorKind::SchemaMissing,
                    format!("no schema for {row_type} v{schema_version} on index {index_id}"),
                )
            })
    }
}

/// Wraps a [`SchemaSource`] with a weak cache keyed by (row type, index
/// id, schema version), so scanners sharing a version don't each refetch
/// row info, while a version nobody holds can still be reclaimed.
pub struct SchemaRegistry<S: SchemaSource> {
    source: S,
    cache: DashMap<(String, u64, u32), Weak<RowInfo>>,
}

impl<S: SchemaSource> SchemaRegistry<S> {
    pub fn new(source: S) -> Self {
        SchemaRegistry { source, cache: DashMap::new() }
    }

    pub fn row_info(&self, row_type: &str, index_id: u64, schema_version: u32) -> Result<Arc<RowInfo>> {
        let key = (row_type.to_string(), index_id, schema_version);
        if let Some(weak) = self.cache.get(&key) {
            if let Some(arc) = weak.upgrade() {
                return Ok(arc);
            }
        }
        let info = self.source.load(row_type, index_id, schema_version)?;
        let arc = Arc::new(info);
        self.cache.insert(key, Arc::downgrade(&arc));
        Ok(arc)
    }
}

/// Object-safe view of [`SchemaRegistry`], so a scanner or updater can
/// hold one behind `&dyn`/`Arc<dyn>` without `Table` itself becoming
/// generic over `S`. The §3 rebind invariant is the only reason any of
/// these types need a registry handle at all, so this is kept to the
/// one method that serves it.
pub trait SchemaResolver: Send + Sync {
    fn resolve(&self, row_type: &str, index_id: u64, schema_version: u32) -> Result<Arc<RowInfo>>;
}

impl<S: SchemaSource> SchemaResolver for SchemaRegistry<S> {
    fn resolve(&self, row_type: &str, index_id: u64, schema_version: u32) -> Result<Arc<RowInfo>> {
        self.row_info(row_type, index_id, schema_version)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let keys = [("a", Direction::Ascending), ("b", Direction::Descending)];
        let values = ["c", "d"];
        let bytes = encode_descriptor(&keys, &values);
        let (d_keys, d_values) = decode_descriptor(&bytes).unwrap();
        assert_eq!(d_keys, vec![("a".to_string(), Direction::Ascending), ("b".to_string(), Direction::Descending)]);
        assert_eq!(d_values, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_registry_missing_schema() {
        let registry = SchemaRegistry::new(StaticSchemaSource::new());
        let err = registry.row_info("widgets", 1, 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMissing);
    }

    #[test]
    fn test_registry_hit_after_register() {
        let source = StaticSchemaSource::new();
        source.register(1, RowInfo::new("widgets", 1, vec![Column::key("id", ColumnType::I64, false, false)], vec![]));
        let registry = SchemaRegistry::new(source);
        let info = registry.row_info("widgets", 1, 1).unwrap();
        assert_eq!(info.key_columns.len(), 1);
        // Second lookup hits the weak cache and returns the same Arc.
        let info2 = registry.row_info("widgets", 1, 1).unwrap();
        assert!(Arc::ptr_eq(&info, &info2));
    }

    #[test]
    fn test_resolver_trait_object_dispatches_to_registry() {
        let source = StaticSchemaSource::new();
        source.register(1, RowInfo::new("widgets", 1, vec![Column::key("id", ColumnType::I64, false, false)], vec![]));
        let registry: Arc<dyn SchemaResolver> = Arc::new(SchemaRegistry::new(source));
        let info = registry.resolve("widgets", 1, 1).unwrap();
        assert_eq!(info.schema_version, 1);
        assert_eq!(registry.resolve("widgets", 1, 9).unwrap_err().kind(), ErrorKind::SchemaMissing);
    }

    #[test]
    fn test_registry_reclaims_after_drop() {
        let source = StaticSchemaSource::new();
        source.register(1, RowInfo::new("widgets", 1, vec![Column::key("id", ColumnType::I64, false, false)], vec![]));
        let registry = SchemaRegistry::new(source);
        let info = registry.row_info("widgets", 1, 1).unwrap();
        drop(info);
        // Still loadable: the cache miss refetches from the source.
        let info2 = registry.row_info("widgets", 1, 1).unwrap();
        assert_eq!(info2.row_type, "widgets");
    }
}
