//! A `Cursor` implementation shared by every backend in this module: it
//! walks a pre-materialized `Vec<(Vec<u8>, Vec<u8>)>` (see the
//! eager-materialization note on [`super`]) and delegates mutation and
//! lock bookkeeping to a small [`MutationSink`] the backend supplies.

use submerge_base::{kind_err, ErrorKind, Result};

use super::{Cursor, LockResult};

pub(super) trait MutationSink: Send {
    fn store(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Lock-acquire outcome for `key` under the bound transaction id (if
    /// any). Backends with no per-row lock concept of their own (e.g.
    /// `redb`, whose transactions already serialize at the table level)
    /// may always report [`LockResult::Acquired`].
    fn try_lock(&self, txn_id: Option<u64>, key: &[u8]) -> LockResult;
}

pub(super) struct RangeCursor<S: MutationSink> {
    sink: S,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
    txn_id: Option<u64>,
    lock_result: LockResult,
    autoload: bool,
}

impl<S: MutationSink> RangeCursor<S> {
    pub(super) fn new(sink: S, entries: Vec<(Vec<u8>, Vec<u8>)>, txn_id: Option<u64>) -> Self {
        RangeCursor { sink, entries, pos: None, txn_id, lock_result: LockResult::Unowned, autoload: true }
    }
}

impl<S: MutationSink> Cursor for RangeCursor<S> {
    fn first(&mut self) -> Result<()> {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
        if let Some(i) = self.pos {
            self.lock_result = self.sink.try_lock(self.txn_id, &self.entries[i].0);
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let next_pos = match self.pos {
            Some(i) => i + 1,
            None => return Err(kind_err(ErrorKind::UnpositionedCursor, "next() on unpositioned cursor")),
        };
        self.pos = if next_pos < self.entries.len() { Some(next_pos) } else { None };
        if let Some(i) = self.pos {
            self.lock_result = self.sink.try_lock(self.txn_id, &self.entries[i].0);
        }
        Ok(())
    }

    fn key(&self) -> Option<&[u8]> {
        self.pos.map(|i| self.entries[i].0.as_slice())
    }

    fn value(&self) -> Option<&[u8]> {
        self.pos.map(|i| self.entries[i].1.as_slice())
    }

    fn store(&mut self, value: &[u8]) -> Result<()> {
        let i = self.pos.ok_or_else(|| kind_err(ErrorKind::UnpositionedCursor, "store() on unpositioned cursor"))?;
        self.sink.store(&self.entries[i].0, value)?;
        self.entries[i].1 = value.to_vec();
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        let i = self.pos.ok_or_else(|| kind_err(ErrorKind::UnpositionedCursor, "delete() on unpositioned cursor"))?;
        self.sink.delete(&self.entries[i].0)
    }

    fn reset(&mut self) {
        self.pos = None;
    }

    fn register(&mut self) {
        // The transaction binding already happened at cursor construction.
    }

    fn autoload(&mut self, enabled: bool) {
        self.autoload = enabled;
    }

    fn lock_result(&self) -> LockResult {
        self.lock_result
    }

    fn relink(&mut self, txn_id: Option<u64>) {
        self.txn_id = txn_id;
    }
}
