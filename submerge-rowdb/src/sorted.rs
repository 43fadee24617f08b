//! Sorted scanner (§4.7, component C7).
//!
//! [`sorted_scan`] buffers an upstream [`RowStream`] until either it runs
//! dry (small mode: sort the buffer in memory) or the buffer reaches
//! `config.big_threshold` rows (big mode: spill everything seen so far,
//! plus the rest of the stream, through a caller-supplied external
//! [`Sorter`] via a [`Transcoder`] that rewrites each row into a
//! sort-ordered key/value schema of its own). A tie on the order-by
//! columns is broken by a synthetic ascending sequence column appended
//! to the transcoded key, so two rows with equal sort keys don't
//! collide in the sorter and the sort is stable.

use std::cmp::Ordering;
use std::sync::Arc;

use submerge_base::{kind_err, ErrorKind, Result};
use tracing::debug;

use crate::codec::{ColumnType, Direction, Value};
use crate::config::RowStoreConfig;
use crate::row::{Row, Slot};
use crate::rowcodec::{DecodeOutcome, RowCodec};
use crate::schema::{Column, RowInfo};
use crate::storage::{Cursor, Sorter};

/// A positioned stream of decoded rows, implemented by [`crate::scanner::BasicScanner`].
/// Factored out as a trait so [`sorted_scan`] doesn't need to know
/// whether its input is a fresh basic scan or something else upstream of
/// it that produces rows one at a time.
pub trait RowStream {
    fn row(&self) -> Option<&Row>;
    fn step(&mut self) -> Result<()>;
    fn schema(&self) -> &RowInfo;
}

impl<'a> RowStream for crate::scanner::BasicScanner<'a> {
    fn row(&self) -> Option<&Row> {
        crate::scanner::BasicScanner::row(self)
    }
    fn step(&mut self) -> Result<()> {
        crate::scanner::BasicScanner::step(self)
    }
    fn schema(&self) -> &RowInfo {
        crate::scanner::BasicScanner::schema(self)
    }
}

/// The sort key: an ordered list of (column, direction) pairs, most
/// significant first.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub columns: Vec<(String, Direction)>,
}

impl OrderBy {
    pub fn new(columns: Vec<(String, Direction)>) -> Self {
        OrderBy { columns }
    }
}

fn compare_rows(a: &Row, b: &Row, order: &OrderBy) -> Ordering {
    for (name, dir) in &order.columns {
        let av = a.get(name).as_value();
        let bv = b.get(name).as_value();
        let ord = match (av, bv) {
            (Some(x), Some(y)) => x.cmp_typed(y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ord = if matches!(dir, Direction::Descending) { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Rewrites rows from their table's native key/value schema into a
/// schema whose key is exactly the order-by columns plus a tiebreak
/// sequence number, and whose value holds every column of the source
/// row -- enough to reconstruct it on the way back out of the external
/// sorter (§4.7 "transcoder").
pub struct Transcoder {
    sort_info: Arc<RowInfo>,
    codec: RowCodec,
    source_info: Arc<RowInfo>,
    seq: u64,
}

impl Transcoder {
    pub fn new(source_info: Arc<RowInfo>, order: &OrderBy, schema_version: u32) -> Result<Self> {
        let mut key_columns = Vec::with_capacity(order.columns.len() + 1);
        for (name, dir) in &order.columns {
            let col = source_info
                .column(name)
                .ok_or_else(|| kind_err(ErrorKind::Other, format!("unknown order-by column {name}")))?;
            key_columns.push(Column { name: col.name.clone(), ty: col.ty, nullable: col.nullable, descending: matches!(dir, Direction::Descending) });
        }
        key_columns.push(Column::key("__seq", ColumnType::I64, false, false));
        let value_columns: Vec<Column> =
            source_info.all_columns().map(|c| Column::value(c.name.clone(), c.ty, true)).collect();
        let sort_info = Arc::new(RowInfo::new(
            format!("{}$sort", source_info.row_type),
            schema_version,
            key_columns,
            value_columns,
        ));
        let codec = RowCodec::new(sort_info.clone());
        Ok(Transcoder { sort_info, codec, source_info, seq: 0 })
    }

    /// Swaps in a row-info for a newer schema version encountered
    /// mid-scan, so value columns added since the scan started still
    /// decode correctly (§3 invariant: a stamped schema version binds
    /// the value layout, not the key layout, and order-by columns are
    /// always key-stable across a migration).
    pub fn rebind_source(&mut self, new_source_info: Arc<RowInfo>) {
        self.source_info = new_source_info;
    }

    pub fn encode(&mut self, row: &Row) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut transcoded = Row::new();
        for col in &self.sort_info.key_columns {
            if col.name == "__seq" {
                transcoded.set_value("__seq", Value::I64(self.seq as i64));
                continue;
            }
            match row.get(&col.name) {
                Slot::Value(v) => transcoded.set_value(col.name.clone(), v.clone()),
                Slot::Null | Slot::Unset => transcoded.set_null(&col.name),
            }
        }
        for col in &self.sort_info.value_columns {
            match row.get(&col.name) {
                Slot::Value(v) => transcoded.set_value(col.name.clone(), v.clone()),
                Slot::Null | Slot::Unset => transcoded.set_null(&col.name),
            }
        }
        self.seq += 1;
        let key = self.codec.encode_key(&transcoded)?;
        let value = self.codec.encode_value(&transcoded)?;
        Ok((key, value))
    }

    pub fn decode(&self, key: &[u8], value: &[u8]) -> Result<Row> {
        match self.codec.decode(key, value)? {
            DecodeOutcome::Row(transcoded) => {
                let mut row = Row::new();
                for col in self.source_info.all_columns() {
                    match transcoded.get(&col.name) {
                        Slot::Value(v) => row.set_value(col.name.clone(), v.clone()),
                        Slot::Null => row.set_null(&col.name),
                        Slot::Unset => row.unset(&col.name),
                    }
                }
                Ok(row)
            }
            DecodeOutcome::SchemaMismatch(v) => {
                Err(kind_err(ErrorKind::CorruptDatabase, format!("sort transcoder schema mismatch: {v}")))
            }
        }
    }
}

/// An exhausted-or-positioned sorted scan, in small (in-memory array) or
/// big (external sort) mode.
pub enum SortedScanner {
    Small(ArraySortedScanner),
    Big(BigSortedScanner),
}

impl SortedScanner {
    fn new_small(mut rows: Vec<Row>, order: &OrderBy) -> Self {
        rows.sort_by(|a, b| compare_rows(a, b, order));
        SortedScanner::Small(ArraySortedScanner { rows, idx: 0 })
    }

    fn new_big(cursor: Box<dyn Cursor>, transcoder: Transcoder) -> Result<Self> {
        Ok(SortedScanner::Big(BigSortedScanner::new(cursor, transcoder)?))
    }

    pub fn row(&self) -> Option<&Row> {
        match self {
            SortedScanner::Small(s) => s.row(),
            SortedScanner::Big(s) => s.row(),
        }
    }

    pub fn step(&mut self) -> Result<()> {
        match self {
            SortedScanner::Small(s) => s.step(),
            SortedScanner::Big(s) => s.step(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.row().is_none()
    }

    pub fn is_big_mode(&self) -> bool {
        matches!(self, SortedScanner::Big(_))
    }
}

pub struct ArraySortedScanner {
    rows: Vec<Row>,
    idx: usize,
}

impl ArraySortedScanner {
    fn row(&self) -> Option<&Row> {
        self.rows.get(self.idx)
    }

    fn step(&mut self) -> Result<()> {
        if self.idx < self.rows.len() {
            self.idx += 1;
        }
        Ok(())
    }
}

pub struct BigSortedScanner {
    cursor: Box<dyn Cursor>,
    transcoder: Transcoder,
    current: Option<Row>,
}

impl BigSortedScanner {
    fn new(mut cursor: Box<dyn Cursor>, transcoder: Transcoder) -> Result<Self> {
        cursor.first()?;
        let current = Self::decode_current(cursor.as_ref(), &transcoder)?;
        Ok(BigSortedScanner { cursor, transcoder, current })
    }

    fn decode_current(cursor: &dyn Cursor, transcoder: &Transcoder) -> Result<Option<Row>> {
        match (cursor.key(), cursor.value()) {
            (Some(k), Some(v)) => Ok(Some(transcoder.decode(k, v)?)),
            _ => Ok(None),
        }
    }

    fn row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    fn step(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }
        self.cursor.next()?;
        self.current = Self::decode_current(self.cursor.as_ref(), &self.transcoder)?;
        Ok(())
    }
}

/// Runs a sorted scan over `source`, escalating from small (in-memory
/// sort) to big (external sort) mode the moment the buffered row count
/// reaches `config.big_threshold` (§4.7). `new_sorter` is only invoked
/// if big mode is actually entered, so a caller never pays for an
/// external sorter on a scan that turns out to be small.
pub fn sorted_scan(
    mut source: impl RowStream,
    source_info: Arc<RowInfo>,
    order: OrderBy,
    config: &RowStoreConfig,
    new_sorter: impl FnOnce() -> Box<dyn Sorter>,
) -> Result<SortedScanner> {
    let mut buffered = Vec::new();
    while let Some(row) = source.row() {
        buffered.push(row.clone());
        source.step()?;
        if buffered.len() >= config.big_threshold {
            break;
        }
    }

    if source.row().is_none() {
        debug!(target: "submerge", rows = buffered.len(), "sorted scan selecting small (in-memory) mode");
        return Ok(SortedScanner::new_small(buffered, &order));
    }
    debug!(
        target: "submerge",
        big_threshold = config.big_threshold,
        "sorted scan selecting big (external sort) mode"
    );

    let mut transcoder = Transcoder::new(source_info.clone(), &order, source_info.schema_version)?;
    let mut sorter = new_sorter();
    let mut batch = Vec::with_capacity(config.sort_batch_size);
    let mut last_version = source_info.schema_version;

    for row in &buffered {
        batch.push(transcoder.encode(row)?);
        if batch.len() >= config.sort_batch_size {
            sorter.add_batch(&batch)?;
            batch.clear();
        }
    }

    while let Some(row) = source.row() {
        if source.schema().schema_version != last_version {
            debug!(
                target: "submerge",
                from = last_version,
                to = source.schema().schema_version,
                "sorted scan rebinding transcoder to new schema version mid-scan"
            );
            last_version = source.schema().schema_version;
            transcoder.rebind_source(Arc::new(source.schema().clone()));
        }
        let encoded = transcoder.encode(row)?;
        batch.push(encoded);
        if batch.len() >= config.sort_batch_size {
            sorter.add_batch(&batch)?;
            batch.clear();
        }
        source.step()?;
    }
    if !batch.is_empty() {
        sorter.add_batch(&batch)?;
    }

    let cursor = sorter.finish_scan()?;
    SortedScanner::new_big(cursor, transcoder)
}
