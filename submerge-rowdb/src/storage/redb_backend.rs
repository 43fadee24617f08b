//! `redb`-backed [`Index`]/[`View`] implementation, for persistent use
//! (the `#[cfg(test)]` module below exercises this directly against a
//! temp-file database; the rest of this crate only ever sees the
//! `storage` traits).
//!
//! Per the module-level note on eager materialization, a cursor's range
//! is read out of the `redb` table into an owned `Vec` up front rather
//! than streamed through `redb`'s zero-copy `AccessGuard`s. `redb` has
//! no per-row lock concept of its own -- its transactions already
//! serialize writers at the table level -- so a bound
//! `storage::Transaction` here always reports a fresh lock as acquired;
//! this crate's lock-lifecycle bookkeeping (§4.5) is exercised against
//! the real per-row semantics in [`super::mem`] instead.

use std::ops::Bound as StdBound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use submerge_base::{kind_err, ErrorKind, Result};

use super::cursor::{MutationSink, RangeCursor};
use super::{Bound, Cursor, Index, LockMode, Transaction, View};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("submerge_rowdb");

fn map_err(e: impl std::fmt::Display) -> submerge_base::Error {
    kind_err(ErrorKind::Other, e.to_string())
}

/// One `redb`-backed index. `id` names it for the secondary-index
/// manager (§4.6); every `RedbIndex` opened against one `Database`
/// shares the same physical table, since exercising the storage traits
/// does not require multiple physical tables -- callers distinguish
/// logical indexes by key prefix, the way `submerge-coldb` addresses
/// column families by key prefix.
pub struct RedbIndex {
    id: u64,
    db: Arc<Database>,
    next_txn_id: Arc<AtomicU64>,
}

impl RedbIndex {
    pub fn open(db: Arc<Database>, id: u64) -> Result<Self> {
        let write_txn = db.begin_write().map_err(map_err)?;
        {
            write_txn.open_table(TABLE).map_err(map_err)?;
        }
        write_txn.commit().map_err(map_err)?;
        Ok(RedbIndex { id, db, next_txn_id: Arc::new(AtomicU64::new(1)) })
    }
}

impl Index for RedbIndex {
    fn id(&self) -> u64 {
        self.id
    }

    fn view(&self) -> Box<dyn View> {
        Box::new(RedbView { db: self.db.clone() })
    }

    fn new_transaction(&self, mode: LockMode) -> Box<dyn Transaction> {
        let id = self.next_txn_id.fetch_add(1, AtomicOrdering::Relaxed);
        Box::new(RedbTransaction { id, mode, depth: 0 })
    }
}

pub struct RedbView {
    db: Arc<Database>,
}

struct RedbSink {
    db: Arc<Database>,
}

impl MutationSink for RedbSink {
    fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(map_err)?;
        {
            let mut table = write_txn.open_table(TABLE).map_err(map_err)?;
            table.insert(key, value).map_err(map_err)?;
        }
        write_txn.commit().map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(map_err)?;
        {
            let mut table = write_txn.open_table(TABLE).map_err(map_err)?;
            table.remove(key).map_err(map_err)?;
        }
        write_txn.commit().map_err(map_err)?;
        Ok(())
    }

    fn try_lock(&self, txn_id: Option<u64>, _key: &[u8]) -> super::LockResult {
        match txn_id {
            Some(_) => super::LockResult::Acquired,
            None => super::LockResult::Unowned,
        }
    }
}

impl View for RedbView {
    fn new_cursor(&self, txn: Option<&dyn Transaction>, low: Bound, high: Bound) -> Result<Box<dyn Cursor>> {
        let read_txn = self.db.begin_read().map_err(map_err)?;
        let table = read_txn.open_table(TABLE).map_err(map_err)?;

        let lo = match &low {
            Bound::Unbounded => StdBound::Unbounded,
            Bound::Included(b) => StdBound::Included(b.as_slice()),
            Bound::Excluded(b) => StdBound::Excluded(b.as_slice()),
        };
        let hi = match &high {
            Bound::Unbounded => StdBound::Unbounded,
            Bound::Included(b) => StdBound::Included(b.as_slice()),
            Bound::Excluded(b) => StdBound::Excluded(b.as_slice()),
        };
        let mut entries = Vec::new();
        for item in table.range((lo, hi)).map_err(map_err)? {
            let (k, v) = item.map_err(map_err)?;
            entries.push((k.value().to_vec(), v.value().to_vec()));
        }

        Ok(Box::new(RangeCursor::new(RedbSink { db: self.db.clone() }, entries, txn.map(|t| t.id()))))
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        RedbSink { db: self.db.clone() }.store(key, value)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(map_err)?;
        let table = read_txn.open_table(TABLE).map_err(map_err)?;
        Ok(table.get(key).map_err(map_err)?.is_some())
    }
}

struct RedbTransaction {
    id: u64,
    mode: LockMode,
    depth: u32,
}

impl Transaction for RedbTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(kind_err(ErrorKind::Other, "exit() without matching enter()"));
        }
        self.depth -= 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        // Each `RedbSink` operation already commits its own `redb` write
        // transaction; this only closes the logical transaction scope
        // the scanner/updater layer is tracking.
        Ok(())
    }

    fn set_lock_mode(&mut self, mode: LockMode) {
        self.mode = mode;
    }

    fn lock_mode(&self) -> LockMode {
        self.mode
    }

    fn unlock(&mut self, _key: &[u8]) {}
}
