//! Basic scanner (§4.4, component C4).
//!
//! A `BasicScanner` walks a [`ScanController`]'s subranges in order,
//! opening a fresh storage cursor per subrange and decoding each
//! candidate row, applying the residual predicate and rebinding its
//! decoder on a schema-version mismatch (§3 invariant). Running off the
//! end of the final subrange is the natural, non-error end of the scan
//! (§4.4 "failure handling": an unpositioned cursor is only an error
//! when something tries to read through it afterward, not when a scan
//! simply completes).

use submerge_base::{kind_err, ErrorKind, Result};

use crate::row::Row;
use crate::rowcodec::{DecodeOutcome, RowCodec};
use crate::scanctrl::ScanController;
use crate::schema::{RowInfo, SchemaResolver};
use crate::storage::{Cursor, Transaction, View};

/// A positioned or exhausted scan over a table's rows, in key order
/// (ascending within each subrange, subranges themselves visited in
/// ascending-low-bound order -- §4.4 "ordering").
pub struct BasicScanner<'a> {
    view: &'a dyn View,
    txn: Option<&'a dyn Transaction>,
    ctrl: ScanController,
    index_id: u64,
    registry: Option<&'a dyn SchemaResolver>,
    cursor: Option<Box<dyn Cursor>>,
    row: Option<Row>,
}

impl<'a> BasicScanner<'a> {
    pub fn new(
        view: &'a dyn View,
        txn: Option<&'a dyn Transaction>,
        ctrl: ScanController,
        index_id: u64,
        registry: Option<&'a dyn SchemaResolver>,
    ) -> Result<Self> {
        let mut scanner = BasicScanner { view, txn, ctrl, index_id, registry, cursor: None, row: None };
        scanner.open_current_subrange()?;
        scanner.advance_to_next_match()?;
        Ok(scanner)
    }

    fn open_current_subrange(&mut self) -> Result<()> {
        self.cursor = match self.ctrl.current_subrange() {
            Some(sub) => {
                let (lo, hi) = sub.to_storage_bounds();
                let mut cursor = self.view.new_cursor(self.txn, lo, hi)?;
                cursor.first()?;
                Some(cursor)
            }
            None => None,
        };
        Ok(())
    }

    /// Advances the underlying cursor(s) -- across subrange boundaries if
    /// needed -- until it is positioned on a row that satisfies the
    /// residual predicate, or exhausted.
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
                    // This subrange is exhausted; move to the next one.
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
                _ => self.advance_cursor()?,
            }
        }
    }

    fn advance_cursor(&mut self) -> Result<()> {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.next()?;
        }
        Ok(())
    }

    /// Decodes `(key, value)` against the controller's current decoder,
    /// transparently rebinding to the stamped schema version on a
    /// mismatch and retrying once (§3 invariant, §4.4 algorithm). Returns
    /// `Ok(None)` only if callers should skip this candidate row instead.
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

    /// The current row, or `None` if the scan is exhausted.
    pub fn row(&self) -> Option<&Row> {
        self.row.as_ref()
    }

    pub fn schema(&self) -> &RowInfo {
        self.ctrl.schema()
    }

    /// Advances to the next matching row. Stepping past an exhausted
    /// scan is a no-op, matching `step()` idempotence at end-of-scan.
    pub fn step(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            return Ok(());
        }
        self.cursor.as_mut().unwrap().next()?;
        self.advance_to_next_match()
    }

    /// Closes the scan early, releasing its cursor.
    pub fn close(&mut self) {
        self.cursor = None;
        self.row = None;
    }

    pub fn is_exhausted(&self) -> bool {
        self.row.is_none()
    }
}
