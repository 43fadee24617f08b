//! In-memory reference implementation of the storage-engine interfaces
//! (§6), backing this crate's own unit tests. Ordering and lock-tracking
//! semantics are real; durability is not attempted (an in-memory engine
//! has none to offer, and the spec delegates durability to the storage
//! engine regardless, §1 Non-goals).

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound as StdBound;
use std::sync::{Arc, Mutex};

use submerge_base::Result;

use super::cursor::{MutationSink, RangeCursor};
use super::{Bound, Cursor, Index, LockMode, LockResult, Sorter, Transaction, View};

#[derive(Default)]
struct Table {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    lock_owner: HashMap<Vec<u8>, u64>,
}

pub struct MemIndex {
    id: u64,
    table: Arc<Mutex<Table>>,
    next_txn_id: Arc<Mutex<u64>>,
}

impl MemIndex {
    pub fn new(id: u64) -> Self {
        MemIndex { id, table: Arc::new(Mutex::new(Table::default())), next_txn_id: Arc::new(Mutex::new(1)) }
    }

    /// Test/debug helper: how many keys currently have a lock owner on
    /// record. A well-behaved lock lifecycle (§4.5) leaves this at zero
    /// once every updater/transaction touching this index has closed.
    pub fn locked_key_count(&self) -> usize {
        self.table.lock().unwrap().lock_owner.len()
    }
}

impl Index for MemIndex {
    fn id(&self) -> u64 {
        self.id
    }

    fn view(&self) -> Box<dyn View> {
        Box::new(MemView { table: self.table.clone() })
    }

    fn new_transaction(&self, mode: LockMode) -> Box<dyn Transaction> {
        let mut next = self.next_txn_id.lock().unwrap();
        let id = *next;
        *next += 1;
        Box::new(MemTransaction { id, mode, depth: 0, table: self.table.clone() })
    }
}

pub struct MemView {
    table: Arc<Mutex<Table>>,
}

struct MemSink {
    table: Arc<Mutex<Table>>,
}

impl MutationSink for MemSink {
    fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.table.lock().unwrap().data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.table.lock().unwrap().data.remove(key);
        Ok(())
    }

    fn try_lock(&self, txn_id: Option<u64>, key: &[u8]) -> LockResult {
        let mut table = self.table.lock().unwrap();
        match txn_id {
            None => LockResult::Unowned,
            Some(id) => match table.lock_owner.get(key) {
                Some(owner) if *owner == id => LockResult::AlreadyHeld,
                Some(_other) => LockResult::Unowned,
                None => {
                    table.lock_owner.insert(key.to_vec(), id);
                    LockResult::Acquired
                }
            },
        }
    }
}

impl View for MemView {
    fn new_cursor(&self, txn: Option<&dyn Transaction>, low: Bound, high: Bound) -> Result<Box<dyn Cursor>> {
        let guard = self.table.lock().unwrap();
        let lo = match &low {
            Bound::Unbounded => StdBound::Unbounded,
            Bound::Included(b) => StdBound::Included(b.clone()),
            Bound::Excluded(b) => StdBound::Excluded(b.clone()),
        };
        let hi = match &high {
            Bound::Unbounded => StdBound::Unbounded,
            Bound::Included(b) => StdBound::Included(b.clone()),
            Bound::Excluded(b) => StdBound::Excluded(b.clone()),
        };
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            guard.data.range((lo, hi)).map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(guard);
        Ok(Box::new(RangeCursor::new(MemSink { table: self.table.clone() }, entries, txn.map(|t| t.id()))))
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.table.lock().unwrap().data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.table.lock().unwrap().data.contains_key(key))
    }
}

pub struct MemTransaction {
    id: u64,
    mode: LockMode,
    depth: u32,
    table: Arc<Mutex<Table>>,
}

impl Transaction for MemTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(submerge_base::kind_err(submerge_base::ErrorKind::Other, "exit() without matching enter()"));
        }
        self.depth -= 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.depth == 0 {
            let mut table = self.table.lock().unwrap();
            let id = self.id;
            table.lock_owner.retain(|_, owner| *owner != id);
        }
        Ok(())
    }

    fn set_lock_mode(&mut self, mode: LockMode) {
        self.mode = mode;
    }

    fn lock_mode(&self) -> LockMode {
        self.mode
    }

    /// Releases this transaction's lock on `key`, if it holds one.
    /// `table.lock_owner` (not a local copy) is the single source of
    /// truth for who holds what, since locks are acquired through a
    /// cursor bound only by transaction id (see [`MemSink::try_lock`]);
    /// tracking a second, transaction-local copy of the same set would
    /// just be a second place for it to drift out of sync.
    fn unlock(&mut self, key: &[u8]) {
        let mut table = self.table.lock().unwrap();
        if table.lock_owner.get(key) == Some(&self.id) {
            table.lock_owner.remove(key);
        }
    }
}

/// A minimal external sorter: buffers all pairs, then sorts and dedups
/// by key (last writer wins) at `finish_scan`. Real engines spill to
/// disk in bounded memory; this crate's sorted-scanner tests only need
/// correct output ordering, not bounded-memory behavior.
#[derive(Default)]
pub struct MemSorter {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MemSorter {
    pub fn new() -> Self {
        MemSorter::default()
    }
}

struct NullSink;

impl MutationSink for NullSink {
    fn store(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }
    fn delete(&self, _key: &[u8]) -> Result<()> {
        Ok(())
    }
    fn try_lock(&self, _txn_id: Option<u64>, _key: &[u8]) -> LockResult {
        LockResult::Unowned
    }
}

impl Sorter for MemSorter {
    fn add_batch(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.pairs.extend_from_slice(pairs);
        Ok(())
    }

    fn finish_scan(self: Box<Self>) -> Result<Box<dyn Cursor>> {
        let mut map: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (k, v) in self.pairs {
            map.insert(k, v);
        }
        let entries: Vec<(Vec<u8>, Vec<u8>)> = map.into_iter().collect();
        Ok(Box::new(RangeCursor::new(NullSink, entries, None)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_view_store_and_cursor_scan() {
        let index = MemIndex::new(1);
        let view = index.view();
        view.store(b"a", b"1").unwrap();
        view.store(b"b", b"2").unwrap();
        view.store(b"c", b"3").unwrap();

        let mut cursor = view.new_cursor(None, Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor.first().unwrap();
        assert_eq!(cursor.key(), Some(&b"a"[..]));
        cursor.next().unwrap();
        assert_eq!(cursor.key(), Some(&b"b"[..]));
        cursor.next().unwrap();
        assert_eq!(cursor.key(), Some(&b"c"[..]));
        cursor.next().unwrap();
        assert_eq!(cursor.key(), None);
    }

    #[test]
    fn test_bounded_range() {
        let index = MemIndex::new(1);
        let view = index.view();
        for k in [1u8, 2, 3, 4, 5] {
            view.store(&[k], &[k]).unwrap();
        }
        let mut cursor = view.new_cursor(None, Bound::Included(vec![2]), Bound::Excluded(vec![4])).unwrap();
        cursor.first().unwrap();
        let mut seen = Vec::new();
        while let Some(k) = cursor.key() {
            seen.push(k.to_vec());
            cursor.next().unwrap();
        }
        assert_eq!(seen, vec![vec![2], vec![3]]);
    }

    #[test]
    fn test_lock_tracking() {
        let index = MemIndex::new(1);
        let view = index.view();
        view.store(b"a", b"1").unwrap();

        let txn = index.new_transaction(LockMode::Serializable);
        let mut cursor = view.new_cursor(Some(txn.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor.first().unwrap();
        assert_eq!(cursor.lock_result(), LockResult::Acquired);

        // A second cursor bound to the same transaction sees the lock
        // already held.
        let mut cursor2 = view.new_cursor(Some(txn.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor2.first().unwrap();
        assert_eq!(cursor2.lock_result(), LockResult::AlreadyHeld);
    }

    #[test]
    fn test_unlock_releases_for_other_transactions() {
        let index = MemIndex::new(1);
        let view = index.view();
        view.store(b"a", b"1").unwrap();

        let mut txn1 = index.new_transaction(LockMode::Serializable);
        let mut cursor1 = view.new_cursor(Some(txn1.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor1.first().unwrap();
        assert_eq!(cursor1.lock_result(), LockResult::Acquired);

        let txn2 = index.new_transaction(LockMode::Serializable);
        let mut cursor2 = view.new_cursor(Some(txn2.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor2.first().unwrap();
        assert_eq!(cursor2.lock_result(), LockResult::Unowned);

        txn1.unlock(b"a");
        let mut cursor3 = view.new_cursor(Some(txn2.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor3.first().unwrap();
        assert_eq!(cursor3.lock_result(), LockResult::Acquired);
    }

    #[test]
    fn test_commit_releases_all_locks_held_by_transaction() {
        let index = MemIndex::new(1);
        let view = index.view();
        view.store(b"a", b"1").unwrap();
        view.store(b"b", b"2").unwrap();

        let mut txn1 = index.new_transaction(LockMode::Serializable);
        let mut cursor1 = view.new_cursor(Some(txn1.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor1.first().unwrap();
        cursor1.next().unwrap();
        assert_eq!(cursor1.lock_result(), LockResult::Acquired);

        txn1.commit().unwrap();

        let txn2 = index.new_transaction(LockMode::Serializable);
        let mut cursor2 = view.new_cursor(Some(txn2.as_ref()), Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor2.first().unwrap();
        cursor2.next().unwrap();
        assert_eq!(cursor2.lock_result(), LockResult::Acquired);
    }

    #[test]
    fn test_sorter_dedups_by_key() {
        let mut sorter = Box::new(MemSorter::new());
        sorter.add_batch(&[(vec![3], vec![30]), (vec![1], vec![10])]).unwrap();
        sorter.add_batch(&[(vec![2], vec![20]), (vec![1], vec![11])]).unwrap();
        let mut cursor = sorter.finish_scan().unwrap();
        cursor.first().unwrap();
        let mut seen = Vec::new();
        while let Some(k) = cursor.key() {
            seen.push((k.to_vec(), cursor.value().unwrap().to_vec()));
            cursor.next().unwrap();
        }
        assert_eq!(seen, vec![(vec![1], vec![11]), (vec![2], vec![20]), (vec![3], vec![30])]);
    }
}
