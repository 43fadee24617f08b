//! Row updater (§4.5, component C4 variant): a scanner with update/delete
//! hooks and one of four lock-lifecycle strategies. Per the design
//! notes' composition guidance, `RowUpdater` is one type parameterized
//! by an [`UpdateMode`] value rather than a subclass per mode; the
//! lock-lifecycle table in §4.5 becomes the match arms of
//! [`RowUpdater::apply_advance_lifecycle`].

use submerge_base::{kind_err, ErrorKind, Result};

use crate::row::Row;
use crate::rowcodec::{DecodeOutcome, RowCodec};
use crate::scanctrl::ScanController;
use crate::schema::{RowInfo, SchemaResolver};
use crate::storage::{Cursor, Index, LockMode, Transaction, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    AutoCommit,
    Basic,
    UpgradableRead,
    NonRepeatable,
}

pub struct RowUpdater<'a> {
    view: &'a dyn View,
    index: &'a dyn Index,
    mode: UpdateMode,
    ctrl: ScanController,
    index_id: u64,
    registry: Option<&'a dyn SchemaResolver>,
    txn: Box<dyn Transaction>,
    saved_lock_mode: LockMode,
    cursor: Option<Box<dyn Cursor>>,
    row: Option<Row>,
    row_was_updated: bool,
}

impl<'a> RowUpdater<'a> {
    pub fn new(
        view: &'a dyn View,
        index: &'a dyn Index,
        mode: UpdateMode,
        ctrl: ScanController,
        index_id: u64,
        registry: Option<&'a dyn SchemaResolver>,
    ) -> Result<Self> {
        let base_mode = match mode {
            UpdateMode::AutoCommit => LockMode::ReadCommitted,
            UpdateMode::Basic | UpdateMode::NonRepeatable => LockMode::Serializable,
            UpdateMode::UpgradableRead => LockMode::Serializable,
        };
        let mut txn = index.new_transaction(base_mode);
        let saved_lock_mode = txn.lock_mode();
        if matches!(mode, UpdateMode::UpgradableRead) {
            txn.set_lock_mode(LockMode::Upgradable);
        }
        let mut updater = RowUpdater {
            view,
            index,
            mode,
            ctrl,
            index_id,
            registry,
            txn,
            saved_lock_mode,
            cursor: None,
            row: None,
            row_was_updated: false,
        };
        updater.open_current_subrange()?;
        if matches!(updater.mode, UpdateMode::NonRepeatable) {
            if let Some(cursor) = updater.cursor.as_mut() {
                cursor.register();
            }
        }
        updater.advance_to_next_match()?;
        Ok(updater)
    }

    fn open_current_subrange(&mut self) -> Result<()> {
        self.cursor = match self.ctrl.current_subrange() {
            Some(sub) => {
                let (lo, hi) = sub.to_storage_bounds();
                let mut cursor = self.view.new_cursor(Some(self.txn.as_ref()), lo, hi)?;
                cursor.first()?;
                Some(cursor)
            }
            None => None,
        };
        Ok(())
    }

    /// Decodes `(key, value)` against the controller's current decoder,
    /// transparently rebinding to the stamped schema version on a
    /// mismatch and retrying once (§3 invariant, §4.4 algorithm).
    fn decode_with_rebind(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Row>> {
        match self.ctrl.decoder().decode(key, value)? {
            DecodeOutcome::Row(row) => Ok(Some(row)),
            DecodeOutcome::SchemaMismatch(stamped) => {
                let row_type = self.ctrl.schema().row_type.clone();
                let registry = self.registry.ok_or_else(|| {
                    kind_err(
                        ErrorKind::CorruptDatabase,
                        format!("row stamped with unbound schema version {stamped} and no schema registry configured"),
                    )
                })?;
                let info = registry.resolve(&row_type, self.index_id, stamped)?;
                self.ctrl.rebind_decoder(RowCodec::new(info));
                match self.ctrl.decoder().decode(key, value)? {
                    DecodeOutcome::Row(row) => Ok(Some(row)),
                    DecodeOutcome::SchemaMismatch(still) => Err(kind_err(
                        ErrorKind::CorruptDatabase,
                        format!("schema registry's v{still} row info still mismatches stamped version {stamped}"),
                    )),
                }
            }
        }
    }

    fn advance_to_next_match(&mut self) -> Result<()> {
        loop {
            let kv = match self.cursor.as_ref() {
                None => {
                    self.row = None;
                    return Ok(());
                }
                Some(cursor) => match (cursor.key(), cursor.value()) {
                    (Some(k), Some(v)) => Some((k.to_vec(), v.to_vec())),
                    _ => None,
                },
            };
            let (key, value) = match kv {
                Some(kv) => kv,
                None => {
                    if self.ctrl.next() {
                        self.open_current_subrange()?;
                        continue;
                    }
                    self.cursor = None;
                    self.row = None;
                    return Ok(());
                }
            };
            let decoded = self.decode_with_rebind(&key, &value)?;
            match decoded {
                Some(decoded) if self.ctrl.residual().evaluate(&decoded, self.ctrl.schema()) => {
                    self.row = Some(decoded);
                    return Ok(());
                }
                _ => self.step_cursor()?,
            }
        }
    }

    /// Applies the §4.5 lock-lifecycle hook for the row being left behind,
    /// then advances the cursor.
    fn step_cursor(&mut self) -> Result<()> {
        self.apply_advance_lifecycle()?;
        self.row_was_updated = false;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.next()?;
        }
        Ok(())
    }

    fn apply_advance_lifecycle(&mut self) -> Result<()> {
        let key = self.cursor.as_ref().and_then(|c| c.key().map(|k| k.to_vec()));
        match self.mode {
            UpdateMode::AutoCommit => {
                if self.row_was_updated {
                    self.txn.commit()?;
                    self.txn = self.index.new_transaction(LockMode::ReadCommitted);
                    // The open cursor is still bound to the transaction
                    // id that just committed; without re-linking it, every
                    // lock acquired on the rows ahead would be attributed
                    // to a transaction nothing will ever commit again.
                    if let Some(cursor) = self.cursor.as_mut() {
                        cursor.relink(Some(self.txn.id()));
                    }
                } else if let Some(k) = key {
                    self.txn.unlock(&k);
                }
            }
            UpdateMode::NonRepeatable => {
                if !self.row_was_updated {
                    if let Some(k) = key {
                        self.txn.unlock(&k);
                    }
                }
            }
            // Basic: keep the lock until the row is updated or the scanner
            // ends, i.e. never released on a plain advance.
            // Upgradable-read: the upgrade itself happens in `update`; a
            // plain advance carries no extra lock action.
            UpdateMode::Basic | UpdateMode::UpgradableRead => {}
        }
        Ok(())
    }

    pub fn row(&self) -> Option<&Row> {
        self.row.as_ref()
    }

    pub fn schema(&self) -> &RowInfo {
        self.ctrl.schema()
    }

    pub fn is_exhausted(&self) -> bool {
        self.row.is_none()
    }

    /// Advances to the next matching row, applying this update mode's
    /// per-row lock lifecycle (§4.5) to the row being left behind.
    pub fn step(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            return Ok(());
        }
        self.step_cursor()?;
        self.advance_to_next_match()
    }

    /// `update(row)` (§4.5): re-encodes `row` with the current decoder. If
    /// the key is unchanged, stores the new value in place; otherwise
    /// performs an atomic move (store new, delete old) inside a nested
    /// transaction scope. Does not itself advance the cursor.
    pub fn update(&mut self, row: Row) -> Result<()> {
        if self.row.is_none() {
            return Err(kind_err(ErrorKind::NoCurrentRow, "update() with no positioned row"));
        }
        if matches!(self.mode, UpdateMode::UpgradableRead) {
            self.txn.set_lock_mode(LockMode::Serializable);
        }
        let codec = self.ctrl.decoder();
        let new_key = codec.encode_key(&row)?;
        let new_value = codec.encode_value(&row)?;
        let old_key = self
            .cursor
            .as_ref()
            .and_then(|c| c.key().map(|k| k.to_vec()))
            .ok_or_else(|| kind_err(ErrorKind::NoCurrentRow, "update() with no positioned row"))?;

        if new_key == old_key {
            self.cursor
                .as_mut()
                .ok_or_else(|| kind_err(ErrorKind::NoCurrentRow, "update() with no positioned row"))?
                .store(&new_value)?;
        } else {
            self.txn.enter()?;
            let result = self.view.store(&new_key, &new_value).and_then(|_| {
                self.cursor
                    .as_mut()
                    .ok_or_else(|| kind_err(ErrorKind::NoCurrentRow, "update() with no positioned row"))?
                    .delete()
            });
            self.txn.exit()?;
            result?;
        }
        self.row = Some(row);
        self.row_was_updated = true;
        Ok(())
    }

    /// `delete()` (§4.5): deletes at the cursor position, then advances.
    pub fn delete(&mut self) -> Result<()> {
        if self.row.is_none() {
            return Err(kind_err(ErrorKind::NoCurrentRow, "delete() with no positioned row"));
        }
        self.cursor
            .as_mut()
            .ok_or_else(|| kind_err(ErrorKind::NoCurrentRow, "delete() with no positioned row"))?
            .delete()?;
        self.row_was_updated = false;
        self.step()
    }

    /// Finishes the scan per this mode's §4.5 "Finish" behavior.
    pub fn close(&mut self) -> Result<()> {
        if matches!(self.mode, UpdateMode::UpgradableRead) {
            self.txn.set_lock_mode(self.saved_lock_mode);
        }
        self.txn.commit()?;
        self.cursor = None;
        self.row = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{ColumnType, Value};
    use crate::rowcodec::RowCodec;
    use crate::scanctrl::ScanControllerFactory;
    use crate::schema::{Column, RowInfo};
    use crate::storage::mem::MemIndex;
    use crate::storage::Index as _;
    use std::sync::Arc;

    fn widgets_info() -> Arc<RowInfo> {
        Arc::new(RowInfo::new(
            "widgets",
            1,
            vec![Column::key("id", ColumnType::I64, false, false)],
            vec![Column::value("name", ColumnType::Str, false)],
        ))
    }

    fn store_row(view: &dyn View, codec: &RowCodec, id: i64, name: &str) {
        let mut row = Row::new();
        row.set_value("id", Value::I64(id));
        row.set_value("name", Value::Str(name.to_string()));
        let key = codec.encode_key(&row).unwrap();
        let value = codec.encode_value(&row).unwrap();
        view.store(&key, &value).unwrap();
    }

    #[test]
    fn test_s4_update_key_change_moves_row() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        store_row(view.as_ref(), &codec, 3, "moved");

        let factory = ScanControllerFactory::new(info.clone());
        let ctrl = factory.controller_for("id == 3", codec.clone()).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::Basic, ctrl, 0, None).unwrap();

        let mut new_row = Row::new();
        new_row.set_value("id", Value::I64(9));
        new_row.set_value("name", Value::Str("moved".to_string()));
        updater.update(new_row).unwrap();
        updater.close().unwrap();

        assert!(!view.exists(&codec.encode_key(&{
            let mut r = Row::new();
            r.set_value("id", Value::I64(3));
            r.set_value("name", Value::Str("moved".to_string()));
            r
        }).unwrap()).unwrap());
        assert!(view.exists(&codec.encode_key(&{
            let mut r = Row::new();
            r.set_value("id", Value::I64(9));
            r.set_value("name", Value::Str("moved".to_string()));
            r
        }).unwrap()).unwrap());
    }

    #[test]
    fn test_update_in_place_same_key() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        store_row(view.as_ref(), &codec, 1, "old");

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("id == 1", codec).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::Basic, ctrl, 0, None).unwrap();

        let mut new_row = Row::new();
        new_row.set_value("id", Value::I64(1));
        new_row.set_value("name", Value::Str("new".to_string()));
        updater.update(new_row).unwrap();
        updater.close().unwrap();
    }

    #[test]
    fn test_delete_advances_past_row() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        for id in [1, 2, 3] {
            store_row(view.as_ref(), &codec, id, "x");
        }

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("true", codec).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::Basic, ctrl, 0, None).unwrap();

        assert_eq!(updater.row().unwrap().get("id").as_value(), Some(&Value::I64(1)));
        updater.delete().unwrap();
        assert_eq!(updater.row().unwrap().get("id").as_value(), Some(&Value::I64(2)));
        updater.close().unwrap();

        assert!(view.exists(&{
            let mut buf = Vec::new();
            crate::codec::key::encode(&mut buf, Some(&Value::I64(2)), ColumnType::I64, false, crate::codec::Position::Last, crate::codec::Direction::Ascending).unwrap();
            buf
        }).unwrap());
    }

    #[test]
    fn test_update_on_unpositioned_scanner_errors() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("true", codec).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::Basic, ctrl, 0, None).unwrap();
        assert!(updater.is_exhausted());
        let err = updater.update(Row::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCurrentRow);
    }

    #[test]
    fn test_s5_non_repeatable_releases_on_step() {
        // S5 (simplified over the mem backend): stepping past rows 5 and 6
        // without updating releases their locks; the lock on the updated
        // row (4) is held until the transaction commits at close().
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        for id in [4, 5, 6, 7] {
            store_row(view.as_ref(), &codec, id, "x");
        }

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("true", codec.clone()).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::NonRepeatable, ctrl, 0, None).unwrap();

        assert_eq!(updater.row().unwrap().get("id").as_value(), Some(&Value::I64(4)));
        let mut same = Row::new();
        same.set_value("id", Value::I64(4));
        same.set_value("name", Value::Str("x".to_string()));
        updater.update(same).unwrap();

        updater.step().unwrap(); // past 5
        updater.step().unwrap(); // past 6, now on 7
        assert_eq!(updater.row().unwrap().get("id").as_value(), Some(&Value::I64(7)));
        updater.close().unwrap();
    }

    #[test]
    fn test_upgradable_read_restores_lock_mode_on_close() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        store_row(view.as_ref(), &codec, 1, "x");

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("true", codec).unwrap();
        let updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::UpgradableRead, ctrl, 0, None).unwrap();
        let saved = updater.saved_lock_mode;
        assert_eq!(saved, LockMode::Serializable);
    }

    #[test]
    fn test_auto_commit_commits_single_row_and_releases_locks() {
        // §4.5 AutoCommit: every updated row commits its own single-row
        // transaction and opens a fresh one. The re-linked cursor must
        // carry the new transaction id forward, or every lock acquired
        // past the first commit is attributed to an already-committed
        // transaction and never released.
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        for id in [1, 2, 3] {
            store_row(view.as_ref(), &codec, id, "old");
        }

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("true", codec).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::AutoCommit, ctrl, 0, None).unwrap();

        let mut seen = Vec::new();
        while let Some(row) = updater.row() {
            let id = row.get("id").as_value().cloned().unwrap();
            seen.push(id.clone());
            let mut new_row = Row::new();
            new_row.set_value("id", id);
            new_row.set_value("name", Value::Str("new".to_string()));
            updater.update(new_row).unwrap();
            updater.step().unwrap();
        }
        updater.close().unwrap();

        assert_eq!(seen, vec![Value::I64(1), Value::I64(2), Value::I64(3)]);
        assert_eq!(index.locked_key_count(), 0);
    }

    #[test]
    fn test_auto_commit_unlocks_unmodified_rows_on_advance() {
        let info = widgets_info();
        let codec = RowCodec::new(info.clone());
        let index = MemIndex::new(1);
        let view = index.view();
        for id in [1, 2] {
            store_row(view.as_ref(), &codec, id, "x");
        }

        let factory = ScanControllerFactory::new(info);
        let ctrl = factory.controller_for("true", codec).unwrap();
        let mut updater = RowUpdater::new(view.as_ref(), &index, UpdateMode::AutoCommit, ctrl, 0, None).unwrap();
        updater.step().unwrap(); // advance past row 1 without updating it
        updater.step().unwrap(); // advance past row 2
        updater.close().unwrap();

        assert_eq!(index.locked_key_count(), 0);
    }
}
