//! Wrapped scanner (§4.8, component C8).
//!
//! A `WrappedScanner` sits in front of any [`RowStream`] and applies a
//! `process(row) -> Option<Row>` hook to every row it pulls: `None`
//! skips the row, `Some` yields it (possibly transformed). The two
//! modes named in §4.8 -- predicate-only and projection-with-predicate
//! -- are both expressed through this one hook rather than as separate
//! scanner types. Projection reuses [`crate::row::Row::unset_all_except`]
//! so re-wrapping an already-projected row with the same keep set is a
//! no-op (§8 property 5).

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use submerge_base::{kind_err, Bitmap256, ErrorKind, Result};

use crate::filter::FilterExpr;
use crate::row::Row;
use crate::schema::RowInfo;
use crate::sorted::RowStream;

/// What a wrap does to each row it passes through.
#[derive(Debug, Clone)]
pub enum WrapMode {
    /// Keeps rows the predicate matches, unchanged.
    Predicate(FilterExpr),
    /// Optionally filters, then unsets every column outside `keep`.
    Projection { predicate: Option<FilterExpr>, keep: Vec<String> },
}

/// A scanner that filters and/or projects the rows of an inner
/// [`RowStream`] (§4.8).
pub struct WrappedScanner<S: RowStream> {
    inner: S,
    mode: WrapMode,
    info: Arc<RowInfo>,
    current: Option<Row>,
}

impl<S: RowStream> WrappedScanner<S> {
    pub fn new(inner: S, mode: WrapMode, info: Arc<RowInfo>) -> Result<Self> {
        let mut scanner = WrappedScanner { inner, mode, info, current: None };
        scanner.advance_to_next_match()?;
        Ok(scanner)
    }

    fn process(&self, row: &Row) -> Option<Row> {
        match &self.mode {
            WrapMode::Predicate(expr) => {
                if expr.evaluate(row, &self.info) {
                    Some(row.clone())
                } else {
                    None
                }
            }
            WrapMode::Projection { predicate, keep } => {
                if let Some(expr) = predicate {
                    if !expr.evaluate(row, &self.info) {
                        return None;
                    }
                }
                let mut projected = row.clone();
                projected.unset_all_except(&self.info, keep);
                Some(projected)
            }
        }
    }

    fn advance_to_next_match(&mut self) -> Result<()> {
        loop {
            match self.inner.row() {
                None => {
                    self.current = None;
                    return Ok(());
                }
                Some(row) => match self.process(row) {
                    Some(out) => {
                        self.current = Some(out);
                        return Ok(());
                    }
                    None => {
                        self.inner.step()?;
                        continue;
                    }
                },
            }
        }
    }

    pub fn row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn step(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }
        self.inner.step()?;
        self.advance_to_next_match()
    }

    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }
}

impl<S: RowStream> RowStream for WrappedScanner<S> {
    fn row(&self) -> Option<&Row> {
        WrappedScanner::row(self)
    }
    fn step(&mut self) -> Result<()> {
        WrappedScanner::step(self)
    }
    fn schema(&self) -> &RowInfo {
        self.info.as_ref()
    }
}

/// Builds the column-index bitmask for a projection's keep set against
/// one row type's `all_columns()` order. Errors if any name is unknown.
fn column_mask(info: &RowInfo, names: &[String]) -> Result<Bitmap256> {
    let mut mask = Bitmap256::new();
    for name in names {
        let idx = info
            .all_columns()
            .position(|c| &c.name == name)
            .ok_or_else(|| kind_err(ErrorKind::Other, format!("projection references unknown column {name}")))?;
        mask.set(idx as u8, true);
    }
    Ok(mask)
}

/// Recovers the kept column names from a mask, in `all_columns()` order.
fn columns_from_mask(info: &RowInfo, mask: &Bitmap256) -> Vec<String> {
    info.all_columns()
        .enumerate()
        .filter(|(i, _)| mask.get(*i as u8))
        .map(|(_, c)| c.name.clone())
        .collect()
}

/// Cache key for a wrap's validated, canonicalized column list (§4.8
/// weak-cache convention, matching [`crate::scanctrl::ScanControllerFactory`]
/// and [`crate::schema::SchemaRegistry`]). The keep set is carried as a
/// `Bitmap256` over column position rather than a sorted `Vec<String>`:
/// it is order-independent and self-deduplicating by construction, and
/// reuses the same schema-evolution bookkeeping bitset the rest of the
/// crate builds on top of `submerge-base`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProjectionSpec {
    row_type: String,
    mask: Bitmap256,
    has_predicate: bool,
}

/// Validates and canonicalizes projection column lists against one row
/// type's schema, caching the canonical column list weakly by
/// `(row type, keep-set bitmask, predicate presence)` so a caller
/// re-wrapping the same projection repeatedly skips re-validating column
/// names.
pub struct WrapperFactory {
    schema: Arc<RowInfo>,
    cache: DashMap<ProjectionSpec, Weak<Vec<String>>>,
}

impl WrapperFactory {
    pub fn new(schema: Arc<RowInfo>) -> Self {
        WrapperFactory { schema, cache: DashMap::new() }
    }

    pub fn canonical_projection(&self, keep: &[String], has_predicate: bool) -> Result<Arc<Vec<String>>> {
        let mask = column_mask(&self.schema, keep)?;
        let spec = ProjectionSpec { row_type: self.schema.row_type.clone(), mask, has_predicate };

        if let Some(w) = self.cache.get(&spec) {
            if let Some(arc) = w.upgrade() {
                return Ok(arc);
            }
        }
        let names = columns_from_mask(&self.schema, &spec.mask);
        let arc = Arc::new(names);
        self.cache.insert(spec, Arc::downgrade(&arc));
        Ok(arc)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{ColumnType, Value};
    use crate::filter;
    use crate::row::Slot;
    use crate::rowcodec::RowCodec;
    use crate::scanctrl::ScanControllerFactory;
    use crate::scanner::BasicScanner;
    use crate::schema::Column;
    use crate::storage::mem::MemIndex;
    use crate::storage::Index as _;

    fn widgets_info() -> Arc<RowInfo> {
        Arc::new(RowInfo::new(
            "widgets",
            1,
            vec![Column::key("id", ColumnType::I64, false, false)],
            vec![Column::value("name", ColumnType::Str, false), Column::value("color", ColumnType::Str, false)],
        ))
    }

    fn store_row(view: &dyn crate::storage::View, codec: &RowCodec, id: i64, name: &str, color: &str) {
        let mut row = Row::new();
        row.set_value("id", Value::I64(id));
        row.set_value("name", Value::Str(name.to_string()));
        row.set_value("color", Value::Str(color.to_string()));
        let key = codec.encode_key(&row).unwrap();
        let value = codec.encode_value(&row).unwrap();
        view.store(&key, &value).unwrap();
    }

    #[test]
    fn test_predicate_only_wrap() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        for (id, color) in [(1, "red"), (2, "blue"), (3, "red")] {
            store_row(view.as_ref(), &codec, id, "x", color);
        }
        let factory = ScanControllerFactory::new(info.clone());
        let ctrl = factory.controller_for("true", codec).unwrap();
        let scanner = BasicScanner::new(view.as_ref(), None, ctrl, 0, None).unwrap();

        let expr = filter::parse(r#"color == "red""#).unwrap();
        let mut wrapped = WrappedScanner::new(scanner, WrapMode::Predicate(expr), info).unwrap();
        let mut seen = Vec::new();
        while let Some(row) = wrapped.row() {
            seen.push(row.get("id").as_value().cloned().unwrap());
            wrapped.step().unwrap();
        }
        assert_eq!(seen, vec![Value::I64(1), Value::I64(3)]);
    }

    #[test]
    fn test_projection_unsets_dropped_columns() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        store_row(view.as_ref(), &codec, 1, "widget-a", "red");
        let factory = ScanControllerFactory::new(info.clone());
        let ctrl = factory.controller_for("true", codec).unwrap();
        let scanner = BasicScanner::new(view.as_ref(), None, ctrl, 0, None).unwrap();

        let mode = WrapMode::Projection { predicate: None, keep: vec!["id".to_string()] };
        let mut wrapped = WrappedScanner::new(scanner, mode, info).unwrap();
        let row = wrapped.row().unwrap();
        assert_eq!(row.get("id").as_value(), Some(&Value::I64(1)));
        assert_eq!(row.get("name"), &Slot::Unset);
        assert_eq!(row.get("color"), &Slot::Unset);
    }

    #[test]
    fn test_projection_is_idempotent_under_rewrap() {
        // §8 property 5: projecting an already-projected row onto the
        // same keep set changes nothing further.
        let mut row = Row::new();
        row.set_value("id", Value::I64(1));
        row.set_value("name", Value::Str("a".into()));
        row.set_null("color");
        let info = widgets_info();

        let mut once = row.clone();
        once.unset_all_except(&info, &["id".to_string()]);
        let mut twice = once.clone();
        twice.unset_all_except(&info, &["id".to_string()]);
        assert_eq!(once.get("id"), twice.get("id"));
        assert_eq!(once.get("name"), twice.get("name"));
        assert_eq!(once.get("color"), twice.get("color"));
    }

    #[test]
    fn test_projection_with_predicate() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        for (id, color) in [(1, "red"), (2, "blue")] {
            store_row(view.as_ref(), &codec, id, "x", color);
        }
        let factory = ScanControllerFactory::new(info.clone());
        let ctrl = factory.controller_for("true", codec).unwrap();
        let scanner = BasicScanner::new(view.as_ref(), None, ctrl, 0, None).unwrap();

        let predicate = filter::parse(r#"color == "red""#).unwrap();
        let mode = WrapMode::Projection { predicate: Some(predicate), keep: vec!["id".to_string()] };
        let mut wrapped = WrappedScanner::new(scanner, mode, info).unwrap();
        assert_eq!(wrapped.row().unwrap().get("id").as_value(), Some(&Value::I64(1)));
        wrapped.step().unwrap();
        assert!(wrapped.is_exhausted());
    }

    #[test]
    fn test_wrapper_factory_caches_canonical_projection() {
        let factory = WrapperFactory::new(widgets_info());
        let a = factory.canonical_projection(&["name".to_string(), "id".to_string()], false).unwrap();
        let b = factory.canonical_projection(&["id".to_string(), "name".to_string()], false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_wrapper_factory_rejects_unknown_column() {
        let factory = WrapperFactory::new(widgets_info());
        let err = factory.canonical_projection(&["nonexistent".to_string()], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
