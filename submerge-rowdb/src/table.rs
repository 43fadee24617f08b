//! Table entry point (§4.4): the write operations (`store`/`insert`/
//! `replace`/`update`/`delete`/`merge`/`exchange`) and the factory
//! methods for the read-side scanners (`scan`/`updater`/sorted/wrapped),
//! all bound to one primary [`Index`] and [`RowInfo`], with secondary
//! indexes kept in sync through a [`TriggerCell`] (§4.6).
//!
//! A `Table` owns its [`View`] for the lifetime of the table rather than
//! opening a fresh one per call, so scanners and updaters it hands out
//! can borrow `&'a dyn View` straight from `&'a self`.

use std::sync::{Arc, Mutex};

use submerge_base::{kind_err, ErrorKind, Result};

use crate::config::RowStoreConfig;
use crate::row::{Row, Slot};
use crate::rowcodec::{DecodeOutcome, RowCodec};
use crate::scanctrl::ScanControllerFactory;
use crate::scanner::BasicScanner;
use crate::schema::{RowInfo, SchemaResolver};
use crate::secidx::{SecondaryIndexManager, SecondaryIndexSource, Trigger, TriggerCell};
use crate::sorted::{self, OrderBy, SortedScanner};
use crate::storage::{Bound, Cursor, Index, Sorter, View};
use crate::updater::{RowUpdater, UpdateMode};
use crate::wrapped::{WrapMode, WrappedScanner};

/// One row type's primary storage, bound to its schema and secondary
/// indexes (§4.4).
pub struct Table {
    index: Arc<dyn Index>,
    view: Box<dyn View>,
    info: Arc<RowInfo>,
    factory: ScanControllerFactory,
    secondary: Mutex<SecondaryIndexManager>,
    trigger: TriggerCell,
    read_only: bool,
    registry: Option<Arc<dyn SchemaResolver>>,
}

impl Table {
    pub fn new(index: Arc<dyn Index>, info: Arc<RowInfo>) -> Self {
        Self::new_impl(index, info, false)
    }

    /// Wraps a secondary/alt-key index as a read-only derived table: scans
    /// and lookups work normally, but every write method fails with
    /// [`ErrorKind::UnmodifiableView`] (§7). Writes against such an index
    /// must go through the primary table, whose trigger keeps it in sync.
    pub fn new_secondary_view(index: Arc<dyn Index>, info: Arc<RowInfo>) -> Self {
        Self::new_impl(index, info, true)
    }

    fn new_impl(index: Arc<dyn Index>, info: Arc<RowInfo>, read_only: bool) -> Self {
        let view = index.view();
        let factory = ScanControllerFactory::new(info.clone());
        let secondary = Mutex::new(SecondaryIndexManager::new(info.clone()));
        Table { index, view, info, factory, secondary, trigger: TriggerCell::new(), read_only, registry: None }
    }

    /// Attaches a schema registry so scans and updaters over this table
    /// can rebind their decoder when they encounter a row stamped with an
    /// older schema version (§3 invariant) instead of treating it as
    /// corruption.
    pub fn with_schema_registry(mut self, registry: Arc<dyn SchemaResolver>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(kind_err(ErrorKind::UnmodifiableView, "write against a read-only derived table"));
        }
        Ok(())
    }

    pub fn schema(&self) -> &RowInfo {
        self.info.as_ref()
    }

    fn codec(&self) -> RowCodec {
        RowCodec::new(self.info.clone())
    }

    /// The trigger currently installed, or an empty one if no secondary
    /// indexes have ever been reconciled (§4.6).
    fn trigger(&self) -> Arc<Trigger> {
        self.trigger.load().unwrap_or_else(|| Arc::new(Trigger::empty()))
    }

    /// Reconciles secondary indexes against `source` and, if the set
    /// changed, swaps in a fresh trigger (§4.6). A no-op when nothing
    /// changed since the last call.
    pub fn refresh_secondary_indexes(&self, source: &dyn SecondaryIndexSource) -> Result<()> {
        let mut manager = self
            .secondary
            .lock()
            .map_err(|_| kind_err(ErrorKind::Other, "secondary index manager lock poisoned"))?;
        if let Some(new_trigger) = manager.update(source)? {
            self.trigger.swap(Some(Arc::new(new_trigger)));
        }
        Ok(())
    }

    /// A basic scan over this table for the given filter string (§4.4 C4).
    pub fn scan(&self, filter_str: &str) -> Result<BasicScanner<'_>> {
        let ctrl = self.factory.controller_for(filter_str, self.codec())?;
        BasicScanner::new(self.view.as_ref(), None, ctrl, self.index.id(), self.registry.as_deref())
    }

    /// A row updater over this table for the given filter string and
    /// lock-lifecycle mode (§4.5).
    pub fn updater(&self, filter_str: &str, mode: UpdateMode) -> Result<RowUpdater<'_>> {
        let ctrl = self.factory.controller_for(filter_str, self.codec())?;
        RowUpdater::new(self.view.as_ref(), self.index.as_ref(), mode, ctrl, self.index.id(), self.registry.as_deref())
    }

    /// A sorted scan over this table for the given filter string and
    /// order-by columns (§4.7), escalating to external sort per `config`.
    pub fn sorted_scan(
        &self,
        filter_str: &str,
        order: OrderBy,
        config: &RowStoreConfig,
        new_sorter: impl FnOnce() -> Box<dyn Sorter>,
    ) -> Result<SortedScanner> {
        let scanner = self.scan(filter_str)?;
        sorted::sorted_scan(scanner, self.info.clone(), order, config, new_sorter)
    }

    /// A filtered and/or projected scan over this table (§4.8).
    pub fn wrapped_scan(&self, filter_str: &str, mode: WrapMode) -> Result<WrappedScanner<BasicScanner<'_>>> {
        let scanner = self.scan(filter_str)?;
        WrappedScanner::new(scanner, mode, self.info.clone())
    }

    fn read_row(&self, key: &[u8]) -> Result<Option<Row>> {
        let mut cursor = self.view.new_cursor(None, Bound::Included(key.to_vec()), Bound::Included(key.to_vec()))?;
        cursor.first()?;
        match (cursor.key(), cursor.value()) {
            (Some(k), Some(v)) => match self.codec().decode(k, v)? {
                DecodeOutcome::Row(row) => Ok(Some(row)),
                DecodeOutcome::SchemaMismatch(version) => Err(kind_err(
                    ErrorKind::CorruptDatabase,
                    format!("row stamped with an unbound schema version {version}"),
                )),
            },
            _ => Ok(None),
        }
    }

    /// `store(row)`: writes `row` at its primary key unconditionally,
    /// overwriting whatever was there, and propagates the delta to every
    /// secondary index (§4.4).
    pub fn store(&self, row: Row) -> Result<()> {
        self.check_writable()?;
        let codec = self.codec();
        let key = codec.encode_key(&row)?;
        let old = self.read_row(&key)?;
        let value = codec.encode_value(&row)?;
        self.view.store(&key, &value)?;
        self.trigger().on_write(old.as_ref(), Some(&row))?;
        Ok(())
    }

    /// `insert(row)`: like `store`, but fails if a row already exists at
    /// this primary key.
    pub fn insert(&self, row: Row) -> Result<()> {
        self.check_writable()?;
        let codec = self.codec();
        let key = codec.encode_key(&row)?;
        if self.view.exists(&key)? {
            return Err(kind_err(ErrorKind::Other, "insert() row already exists"));
        }
        let value = codec.encode_value(&row)?;
        self.view.store(&key, &value)?;
        self.trigger().on_write(None, Some(&row))?;
        Ok(())
    }

    /// `replace(row)`: like `store`, but fails if no row currently exists
    /// at this primary key.
    pub fn replace(&self, row: Row) -> Result<()> {
        self.check_writable()?;
        let codec = self.codec();
        let key = codec.encode_key(&row)?;
        let old = self.read_row(&key)?;
        if old.is_none() {
            return Err(kind_err(ErrorKind::NoCurrentRow, "replace() row does not exist"));
        }
        let value = codec.encode_value(&row)?;
        self.view.store(&key, &value)?;
        self.trigger().on_write(old.as_ref(), Some(&row))?;
        Ok(())
    }

    /// `update(row)`: aliases [`Table::replace`]. Updating a row
    /// identified by its own primary key is exactly replacing the value
    /// stored there; a distinct `update` verb would only diverge from
    /// `replace` by accepting a partial column set, which `merge`
    /// already covers (an open question in the write-op set, resolved
    /// this way rather than adding a fourth near-duplicate verb).
    pub fn update(&self, row: Row) -> Result<()> {
        self.replace(row)
    }

    /// `delete(key_row)`: removes the row at `key_row`'s primary key, if
    /// any, and propagates the deletion to every secondary index.
    /// `key_row` need only have its key columns set.
    pub fn delete(&self, key_row: &Row) -> Result<()> {
        self.check_writable()?;
        let codec = self.codec();
        let key = codec.encode_key(key_row)?;
        let old = self.read_row(&key)?;
        let mut cursor = self.view.new_cursor(None, Bound::Included(key.clone()), Bound::Included(key))?;
        cursor.first()?;
        if cursor.key().is_some() {
            cursor.delete()?;
        }
        self.trigger().on_write(old.as_ref(), None)?;
        Ok(())
    }

    /// `merge(partial)`: applies only the set columns of `partial` onto
    /// the existing row at its primary key, leaving unset columns
    /// untouched, and stores the result. Fails if no row exists there
    /// yet (a merge onto nothing is an `insert`, not a `merge`).
    pub fn merge(&self, partial: Row) -> Result<Row> {
        self.check_writable()?;
        let codec = self.codec();
        let key = codec.encode_key(&partial)?;
        let existing =
            self.read_row(&key)?.ok_or_else(|| kind_err(ErrorKind::NoCurrentRow, "merge() row does not exist"))?;
        let mut merged = existing.clone();
        for col in self.info.all_columns() {
            match partial.get(&col.name) {
                Slot::Unset => {}
                Slot::Null => merged.set_null(&col.name),
                Slot::Value(v) => merged.set_value(col.name.clone(), v.clone()),
            }
        }
        let value = codec.encode_value(&merged)?;
        self.view.store(&key, &value)?;
        self.trigger().on_write(Some(&existing), Some(&merged))?;
        Ok(merged)
    }

    /// `exchange(row)`: stores `row` and returns whatever row previously
    /// occupied that primary key, as one atomic read-then-store from the
    /// caller's point of view.
    pub fn exchange(&self, row: Row) -> Result<Option<Row>> {
        self.check_writable()?;
        let codec = self.codec();
        let key = codec.encode_key(&row)?;
        let old = self.read_row(&key)?;
        let value = codec.encode_value(&row)?;
        self.view.store(&key, &value)?;
        self.trigger().on_write(old.as_ref(), Some(&row))?;
        Ok(old)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{ColumnType, Direction, Value};
    use crate::schema::{encode_descriptor, Column};
    use crate::storage::mem::{MemIndex, MemSorter};
    use std::sync::Mutex as StdMutex;

    fn widgets_info() -> Arc<RowInfo> {
        Arc::new(RowInfo::new(
            "widgets",
            1,
            vec![Column::key("id", ColumnType::I64, false, false)],
            vec![Column::value("name", ColumnType::Str, false), Column::value("color", ColumnType::Str, false)],
        ))
    }

    fn row(id: i64, name: &str, color: &str) -> Row {
        let mut r = Row::new();
        r.set_value("id", Value::I64(id));
        r.set_value("name", Value::Str(name.to_string()));
        r.set_value("color", Value::Str(color.to_string()));
        r
    }

    fn key_row(id: i64) -> Row {
        let mut r = Row::new();
        r.set_value("id", Value::I64(id));
        r
    }

    #[test]
    fn test_store_then_scan() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.store(row(1, "a", "red")).unwrap();
        table.store(row(2, "b", "blue")).unwrap();

        let mut scanner = table.scan("true").unwrap();
        let mut seen = Vec::new();
        while let Some(r) = scanner.row() {
            seen.push(r.get("id").as_value().cloned().unwrap());
            scanner.step().unwrap();
        }
        assert_eq!(seen, vec![Value::I64(1), Value::I64(2)]);
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.insert(row(1, "a", "red")).unwrap();
        let err = table.insert(row(1, "a2", "green")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_replace_requires_existing_row() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        let err = table.replace(row(1, "a", "red")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCurrentRow);

        table.insert(row(1, "a", "red")).unwrap();
        table.replace(row(1, "a2", "green")).unwrap();
        let found = table.scan("true").unwrap();
        assert_eq!(found.row().unwrap().get("color").as_value(), Some(&Value::Str("green".to_string())));
    }

    #[test]
    fn test_update_aliases_replace() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.insert(row(1, "a", "red")).unwrap();
        table.update(row(1, "a", "green")).unwrap();
        let found = table.scan("true").unwrap();
        assert_eq!(found.row().unwrap().get("color").as_value(), Some(&Value::Str("green".to_string())));
    }

    #[test]
    fn test_delete_removes_row() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.store(row(1, "a", "red")).unwrap();
        table.delete(&key_row(1)).unwrap();
        let scanner = table.scan("true").unwrap();
        assert!(scanner.is_exhausted());
    }

    #[test]
    fn test_merge_preserves_untouched_columns() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.store(row(1, "a", "red")).unwrap();
        let mut partial = key_row(1);
        partial.set_value("color", Value::Str("green".to_string()));
        let merged = table.merge(partial).unwrap();
        assert_eq!(merged.get("name").as_value(), Some(&Value::Str("a".to_string())));
        assert_eq!(merged.get("color").as_value(), Some(&Value::Str("green".to_string())));
    }

    #[test]
    fn test_exchange_returns_previous_value() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        assert!(table.exchange(row(1, "a", "red")).unwrap().is_none());
        let previous = table.exchange(row(1, "a2", "green")).unwrap().unwrap();
        assert_eq!(previous.get("name").as_value(), Some(&Value::Str("a".to_string())));
    }

    struct FakeSource {
        indexes: StdMutex<Vec<(Vec<u8>, u64, Arc<dyn Index>)>>,
    }

    impl SecondaryIndexSource for FakeSource {
        fn current_indexes(&self) -> Result<Vec<(Vec<u8>, u64)>> {
            Ok(self.indexes.lock().unwrap().iter().map(|(d, id, _)| (d.clone(), *id)).collect())
        }
        fn open_index(&self, id: u64) -> Result<Option<Arc<dyn Index>>> {
            Ok(self.indexes.lock().unwrap().iter().find(|(_, i, _)| *i == id).map(|(_, _, idx)| idx.clone()))
        }
    }

    #[test]
    fn test_trigger_propagates_writes_to_secondary_index() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        let secondary_index: Arc<dyn Index> = Arc::new(MemIndex::new(2));
        let descriptor = encode_descriptor(&[("color", Direction::Ascending)], &[]);
        let source = FakeSource { indexes: StdMutex::new(vec![(descriptor, 2, secondary_index.clone())]) };
        table.refresh_secondary_indexes(&source).unwrap();

        table.store(row(1, "a", "red")).unwrap();
        let view = secondary_index.view();
        let mut cursor = view.new_cursor(None, Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor.first().unwrap();
        assert!(cursor.key().is_some());

        table.delete(&key_row(1)).unwrap();
        let mut cursor = view.new_cursor(None, Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor.first().unwrap();
        assert!(cursor.key().is_none());
    }

    #[test]
    fn test_secondary_view_rejects_writes() {
        let index: Arc<dyn Index> = Arc::new(MemIndex::new(2));
        let view_info = Arc::new(RowInfo::new(
            "widgets_by_color",
            1,
            vec![Column::key("color", ColumnType::Str, false, false)],
            vec![],
        ));
        let table = Table::new_secondary_view(index, view_info);

        let mut r = Row::new();
        r.set_value("color", Value::Str("red".to_string()));
        assert_eq!(table.store(r.clone()).unwrap_err().kind(), ErrorKind::UnmodifiableView);
        assert_eq!(table.insert(r.clone()).unwrap_err().kind(), ErrorKind::UnmodifiableView);
        assert_eq!(table.replace(r.clone()).unwrap_err().kind(), ErrorKind::UnmodifiableView);
        assert_eq!(table.update(r.clone()).unwrap_err().kind(), ErrorKind::UnmodifiableView);
        assert_eq!(table.delete(&r).unwrap_err().kind(), ErrorKind::UnmodifiableView);
        assert_eq!(table.merge(r.clone()).unwrap_err().kind(), ErrorKind::UnmodifiableView);
        assert_eq!(table.exchange(r).unwrap_err().kind(), ErrorKind::UnmodifiableView);

        // Reads still work against a read-only view.
        assert!(table.scan("true").unwrap().is_exhausted());
    }

    #[test]
    fn test_sorted_scan_via_table() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.store(row(3, "c", "red")).unwrap();
        table.store(row(1, "a", "blue")).unwrap();
        table.store(row(2, "b", "green")).unwrap();

        let order = OrderBy::new(vec![("name".to_string(), Direction::Ascending)]);
        let config = RowStoreConfig::default();
        let mut scanner = table.sorted_scan("true", order, &config, || Box::new(MemSorter::new())).unwrap();
        let mut seen = Vec::new();
        while let Some(r) = scanner.row() {
            seen.push(r.get("name").as_value().cloned().unwrap());
            scanner.step().unwrap();
        }
        assert_eq!(seen, vec![Value::Str("a".into()), Value::Str("b".into()), Value::Str("c".into())]);
    }

    #[test]
    fn test_scan_rebinds_decoder_via_table_schema_registry() {
        use crate::schema::{SchemaRegistry, StaticSchemaSource};

        let v1_info = widgets_info();
        let index = Arc::new(MemIndex::new(1));
        Table::new(index.clone(), v1_info.clone()).store(row(1, "a", "red")).unwrap();

        let v2_info = Arc::new(RowInfo::new(
            "widgets",
            2,
            vec![Column::key("id", ColumnType::I64, false, false)],
            vec![
                Column::value("name", ColumnType::Str, false),
                Column::value("color", ColumnType::Str, false),
                Column::value("weight", ColumnType::I64, true),
            ],
        ));
        let source = StaticSchemaSource::new();
        source.register(index.id(), (*v1_info).clone());
        let registry: Arc<dyn crate::schema::SchemaResolver> = Arc::new(SchemaRegistry::new(source));

        let table = Table::new(index, v2_info).with_schema_registry(registry);
        let mut scanner = table.scan("true").unwrap();
        let found = scanner.row().unwrap();
        assert_eq!(found.get("id").as_value(), Some(&Value::I64(1)));
        assert_eq!(found.get("name").as_value(), Some(&Value::Str("a".to_string())));
        assert!(found.get("weight").is_unset());
        assert_eq!(scanner.schema().schema_version, 1);
        scanner.step().unwrap();
        assert!(scanner.is_exhausted());
    }

    #[test]
    fn test_wrapped_scan_via_table() {
        let table = Table::new(Arc::new(MemIndex::new(1)), widgets_info());
        table.store(row(1, "a", "red")).unwrap();
        table.store(row(2, "b", "blue")).unwrap();

        let mode = WrapMode::Projection { predicate: None, keep: vec!["id".to_string()] };
        let wrapped = table.wrapped_scan("true", mode).unwrap();
        let r = wrapped.row().unwrap();
        assert_eq!(r.get("id").as_value(), Some(&Value::I64(1)));
        assert_eq!(r.get("name"), &crate::row::Slot::Unset);
    }
}
