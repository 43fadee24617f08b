//! Secondary-index manager and trigger (§4.6, component C6).
//!
//! The manager reconciles its cached `(descriptor -> SecondaryInfo)` map
//! against whatever set of secondary indexes the storage engine reports
//! right now; when the set changed, it hands back a fresh [`Trigger`]
//! for the table to install. The trigger itself is the side-effecting
//! hook a write goes through to propagate its delta into every
//! secondary index; it is swapped into a process-wide [`TriggerCell`]
//! with release-store / opaque-load semantics and a quiescence drain on
//! the way out (§4.6 "swap protocol").

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use submerge_base::{kind_err, ErrorKind, Result};
use tracing::debug;

use crate::codec::Direction;
use crate::row::Row;
use crate::rowcodec::RowCodec;
use crate::schema::{decode_descriptor, Column, RowInfo, SecondaryInfo};
use crate::storage::{Bound, Index, View};

/// What the manager consults on a reconciliation pass: the storage
/// engine's current view of which secondary indexes exist. A real
/// engine backs this with its own catalog; [`crate::storage::mem`] has
/// no catalog of its own, so tests supply a small in-memory source.
pub trait SecondaryIndexSource {
    /// Ordered `(descriptor bytes, index id)` pairs for every secondary
    /// index currently defined, read in a single autoload-disabled pass
    /// (§4.6 step 1).
    fn current_indexes(&self) -> Result<Vec<(Vec<u8>, u64)>>;
    /// Opens an index by id. `Ok(None)` signals the id no longer
    /// exists, which the manager turns into `CorruptDatabase` (§4.6
    /// step 3).
    fn open_index(&self, id: u64) -> Result<Option<Arc<dyn Index>>>;
}

fn build_secondary_info(
    primary: &RowInfo,
    key_cols: &[(String, Direction)],
    value_cols: &[String],
    index_id: u64,
    descriptor: Vec<u8>,
) -> Result<SecondaryInfo> {
    let mut key_columns = Vec::with_capacity(key_cols.len());
    for (name, dir) in key_cols {
        let base = primary.column(name).ok_or_else(|| {
            kind_err(ErrorKind::CorruptDatabase, format!("descriptor names unknown column {name}"))
        })?;
        key_columns.push(Column {
            name: base.name.clone(),
            ty: base.ty,
            nullable: base.nullable,
            descending: matches!(dir, Direction::Descending),
        });
    }
    let mut value_columns = Vec::with_capacity(value_cols.len());
    for name in value_cols {
        let base = primary.column(name).ok_or_else(|| {
            kind_err(ErrorKind::CorruptDatabase, format!("descriptor names unknown column {name}"))
        })?;
        value_columns.push(Column::value(base.name.clone(), base.ty, base.nullable));
    }
    let info = RowInfo::new(
        format!("{}$idx{}", primary.row_type, index_id),
        primary.schema_version,
        key_columns,
        value_columns,
    );
    Ok(SecondaryInfo { info, descriptor, index_id })
}

/// Holds the ordered map from descriptor bytes to `RowInfo` (§4.6). Not
/// thread-safe (§5): the caller is expected to hold a storage-engine
/// lock spanning `update`.
pub struct SecondaryIndexManager {
    primary: Arc<RowInfo>,
    entries: BTreeMap<Vec<u8>, Arc<SecondaryInfo>>,
}

impl SecondaryIndexManager {
    pub fn new(primary: Arc<RowInfo>) -> Self {
        SecondaryIndexManager { primary, entries: BTreeMap::new() }
    }

    pub fn indexed_descriptors(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.keys().map(|k| k.as_slice())
    }

    /// Reconciles the cached descriptor set against `source`'s current
    /// one (§4.6): unchanged -> `Ok(None)`; otherwise purges stale
    /// entries, rebuilds `RowInfo` for new descriptors, opens each
    /// index by id, and returns a fresh [`Trigger`].
    pub fn update(&mut self, source: &dyn SecondaryIndexSource) -> Result<Option<Trigger>> {
        let current = source.current_indexes()?;
        let unchanged = current.len() == self.entries.len()
            && current.iter().all(|(descriptor, _)| self.entries.contains_key(descriptor));
        if unchanged {
            return Ok(None);
        }
        debug!(
            target: "submerge",
            previous = self.entries.len(),
            current = current.len(),
            "secondary index set changed, reconciling"
        );

        let keep: std::collections::BTreeSet<&[u8]> =
            current.iter().map(|(d, _)| d.as_slice()).collect();
        self.entries.retain(|k, _| keep.contains(k.as_slice()));

        let mut indexes = Vec::with_capacity(current.len());
        for (descriptor, index_id) in &current {
            let info = match self.entries.get(descriptor) {
                Some(existing) => existing.clone(),
                None => {
                    let (key_cols, value_cols) = decode_descriptor(descriptor)?;
                    let secondary = build_secondary_info(
                        &self.primary,
                        &key_cols,
                        &value_cols,
                        *index_id,
                        descriptor.clone(),
                    )?;
                    let arc = Arc::new(secondary);
                    self.entries.insert(descriptor.clone(), arc.clone());
                    arc
                }
            };
            let index = source
                .open_index(*index_id)?
                .ok_or_else(|| kind_err(ErrorKind::CorruptDatabase, format!("index {index_id} no longer exists")))?;
            indexes.push((info, index));
        }
        debug!(target: "submerge", indexes = indexes.len(), "built replacement trigger");
        Ok(Some(Trigger::new(indexes)))
    }
}

/// One secondary index this trigger keeps in sync with the primary
/// table, paired with the open index handle it writes through.
type TriggerEntry = (Arc<SecondaryInfo>, Arc<dyn Index>);

/// The side-effecting hook a primary-table write goes through to
/// propagate its delta into every secondary index (§4.6, glossary
/// "Trigger").
pub struct Trigger {
    entries: Vec<TriggerEntry>,
    /// In-flight writers that acquired this trigger before a swap
    /// (§4.6 "disabled()" quiescence).
    active: Arc<AtomicUsize>,
}

impl Trigger {
    fn new(entries: Vec<TriggerEntry>) -> Self {
        Trigger { entries, active: Arc::new(AtomicUsize::new(0)) }
    }

    /// An empty trigger, installed on a table with no secondary indexes.
    pub fn empty() -> Self {
        Trigger::new(Vec::new())
    }

    /// Registers one writer's use of this trigger; the guard's drop
    /// releases it, which is what `disabled()` waits to observe.
    pub fn acquire(self: &Arc<Self>) -> TriggerGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        TriggerGuard { trigger: self.clone() }
    }

    /// Propagates a primary-table row change into every secondary
    /// index: deletes the stale secondary entry (if any) and stores the
    /// fresh one (if any). `old`/`new` are `None` for insert/delete
    /// respectively.
    pub fn on_write(&self, old: Option<&Row>, new: Option<&Row>) -> Result<()> {
        for (info, index) in &self.entries {
            let codec = RowCodec::new(Arc::new(info.info.clone()));
            let view = index.view();
            if let Some(old_row) = old {
                let key = codec.encode_key(old_row)?;
                delete_by_key(view.as_ref(), &key)?;
            }
            if let Some(new_row) = new {
                let key = codec.encode_key(new_row)?;
                let value = codec.encode_value(new_row)?;
                view.store(&key, &value)?;
            }
        }
        Ok(())
    }

    /// Blocks until every writer that acquired this trigger before it
    /// was swapped out has released it (§4.6, §9 design notes: any of
    /// hazard pointers / epochs / a reader count suffice; this uses a
    /// plain reference count).
    pub fn disabled(&self) {
        while self.active.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }
}

fn delete_by_key(view: &dyn View, key: &[u8]) -> Result<()> {
    let mut cursor = view.new_cursor(None, Bound::Included(key.to_vec()), Bound::Included(key.to_vec()))?;
    cursor.first()?;
    if cursor.key().is_some() {
        cursor.delete()?;
    }
    Ok(())
}

pub struct TriggerGuard {
    trigger: Arc<Trigger>,
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        self.trigger.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The process-wide mutable cell a table keeps its current trigger in
/// (§4.6). Readers `load()` with an opaque, non-synchronizing read;
/// `swap()` installs the new trigger atomically and waits for the
/// outgoing one to drain before returning.
#[derive(Default)]
pub struct TriggerCell {
    inner: ArcSwapOption<Trigger>,
}

impl TriggerCell {
    pub fn new() -> Self {
        TriggerCell { inner: ArcSwapOption::from(None) }
    }

    pub fn load(&self) -> Option<Arc<Trigger>> {
        self.inner.load_full()
    }

    /// Installs `new` and waits for the previous trigger (if any) to
    /// drain its in-flight writers before returning -- at most one
    /// trigger observes a write once the swap has completed, though
    /// both may run briefly concurrently on different writers during
    /// the swap window itself (§8 property 6).
    pub fn swap(&self, new: Option<Arc<Trigger>>) -> Option<Arc<Trigger>> {
        debug!(target: "submerge", "trigger swap starting");
        let old = self.inner.swap(new);
        if let Some(old_trigger) = &old {
            old_trigger.disabled();
        }
        debug!(target: "submerge", "trigger swap finished, outgoing trigger drained");
        old
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{ColumnType, Value};
    use crate::schema::encode_descriptor;
    use crate::storage::mem::MemIndex;
    use crate::storage::Index as _;
    use std::sync::Mutex;

    fn primary_info() -> Arc<RowInfo> {
        Arc::new(RowInfo::new(
            "widgets",
            1,
            vec![Column::key("id", ColumnType::I64, false, false)],
            vec![Column::value("name", ColumnType::Str, false), Column::value("color", ColumnType::Str, false)],
        ))
    }

    struct FakeSource {
        indexes: Mutex<Vec<(Vec<u8>, u64, Arc<dyn Index>)>>,
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
    fn test_update_returns_none_when_unchanged() {
        let mut manager = SecondaryIndexManager::new(primary_info());
        let descriptor = encode_descriptor(&[("color", Direction::Ascending)], &[]);
        let source = FakeSource {
            indexes: Mutex::new(vec![(descriptor, 2, Arc::new(MemIndex::new(2)))]),
        };
        let first = manager.update(&source).unwrap();
        assert!(first.is_some());
        let second = manager.update(&source).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_update_detects_added_index() {
        let mut manager = SecondaryIndexManager::new(primary_info());
        let d1 = encode_descriptor(&[("color", Direction::Ascending)], &[]);
        let source = FakeSource {
            indexes: Mutex::new(vec![(d1.clone(), 2, Arc::new(MemIndex::new(2)))]),
        };
        manager.update(&source).unwrap();

        let d2 = encode_descriptor(&[("name", Direction::Ascending)], &[]);
        source.indexes.lock().unwrap().push((d2, 3, Arc::new(MemIndex::new(3))));
        let trigger = manager.update(&source).unwrap();
        assert!(trigger.is_some());
        assert_eq!(manager.indexed_descriptors().count(), 2);
    }

    #[test]
    fn test_missing_index_is_corrupt_database() {
        struct MissingSource;
        impl SecondaryIndexSource for MissingSource {
            fn current_indexes(&self) -> Result<Vec<(Vec<u8>, u64)>> {
                Ok(vec![(encode_descriptor(&[("color", Direction::Ascending)], &[]), 9)])
            }
            fn open_index(&self, _id: u64) -> Result<Option<Arc<dyn Index>>> {
                Ok(None)
            }
        }
        let mut manager = SecondaryIndexManager::new(primary_info());
        let err = manager.update(&MissingSource).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptDatabase);
    }

    #[test]
    fn test_trigger_propagates_insert_and_delete() {
        let secondary_info = Arc::new(build_secondary_info(
            &primary_info(),
            &[("color".to_string(), Direction::Ascending)],
            &[],
            2,
            Vec::new(),
        ).unwrap());
        let index: Arc<dyn Index> = Arc::new(MemIndex::new(2));
        let trigger = Trigger::new(vec![(secondary_info, index.clone())]);

        let mut row = Row::new();
        row.set_value("id", Value::I64(1));
        row.set_value("name", Value::Str("a".into()));
        row.set_value("color", Value::Str("red".into()));

        trigger.on_write(None, Some(&row)).unwrap();
        let view = index.view();
        let mut cursor = view.new_cursor(None, Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor.first().unwrap();
        assert!(cursor.key().is_some());

        trigger.on_write(Some(&row), None).unwrap();
        let mut cursor = view.new_cursor(None, Bound::Unbounded, Bound::Unbounded).unwrap();
        cursor.first().unwrap();
        assert!(cursor.key().is_none());
    }

    #[test]
    fn test_trigger_cell_swap_drains_outgoing() {
        let cell = TriggerCell::new();
        let t1 = Arc::new(Trigger::empty());
        cell.swap(Some(t1.clone()));
        let guard = t1.acquire();
        assert_eq!(t1.active.load(Ordering::SeqCst), 1);
        drop(guard);
        let t2 = Arc::new(Trigger::empty());
        // With no in-flight writers left, the swap must not block.
        cell.swap(Some(t2));
        assert!(cell.load().is_some());
    }
}
