//! Storage-engine interfaces the core consumes (§6): `Index`, `View`,
//! `Cursor`, `Transaction`, `Sorter`. The underlying key/value engine
//! itself is out of scope (§1) -- these traits are the seam a real
//! engine plugs into. [`mem`] is a small reference implementation used
//! by this crate's own unit tests; [`redb_backend`] adapts the traits
//! onto `redb` for persistent use.
//!
//! A cursor's range is materialized eagerly into an owned
//! `Vec<(Vec<u8>, Vec<u8>)>` rather than streamed lazily through a
//! zero-copy guard type. Real storage engines (and a production `redb`
//! adapter) would stream; this crate's scanners never observe the
//! difference since they only ever see one (key, value) pair at a time
//! through the `Cursor` trait, so this is recorded as a scope
//! simplification rather than a semantic deviation.

mod cursor;
pub mod mem;
pub mod redb_backend;

use submerge_base::Result;

/// The lock mode a storage-engine transaction operates under (§4.5's
/// updater-lock-mode table drives this, it does not define it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    ReadCommitted,
    Upgradable,
    Serializable,
}

/// Result of a lock-acquire attempt during cursor positioning (§6
/// Transaction: "lock-acquire return codes include at least
/// {already-held, acquired, unowned}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    AlreadyHeld,
    Acquired,
    Unowned,
}

pub trait Transaction: Send {
    /// Stable identity used by a bound [`Cursor`] to attribute lock
    /// ownership (the concrete role `link()` plays in §6).
    fn id(&self) -> u64;
    fn enter(&mut self) -> Result<()>;
    fn exit(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn set_lock_mode(&mut self, mode: LockMode);
    fn lock_mode(&self) -> LockMode;
    /// `link().unlock()`: release any lock this transaction holds on `key`.
    fn unlock(&mut self, key: &[u8]);
}

pub trait Cursor: Send {
    fn first(&mut self) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn key(&self) -> Option<&[u8]>;
    fn value(&self) -> Option<&[u8]>;
    fn store(&mut self, value: &[u8]) -> Result<()>;
    fn delete(&mut self) -> Result<()>;
    fn reset(&mut self);
    /// Binds the cursor to its transaction for row-by-row lock tracking.
    fn register(&mut self);
    fn autoload(&mut self, enabled: bool);
    /// The lock-acquire outcome of the most recent `first`/`next` step.
    fn lock_result(&self) -> LockResult;
    /// `link()`: re-binds a positioned cursor to a different transaction
    /// id, e.g. when auto-commit mode commits its per-row transaction and
    /// opens a fresh one mid-scan (§4.5). Locks acquired by subsequent
    /// `first`/`next` calls are attributed to the newly linked id.
    fn relink(&mut self, txn_id: Option<u64>);
}

/// A windowed, possibly filtered projection of an [`Index`] (§6).
pub trait View: Send + Sync {
    /// `newCursor(txn)`, bound to the subrange `[low, high)`. `txn` is
    /// `None` for lock-free reads (e.g. the sorted scanner's "big" path
    /// streaming raw pairs into an external sorter).
    fn new_cursor(&self, txn: Option<&dyn Transaction>, low: Bound, high: Bound) -> Result<Box<dyn Cursor>>;
    fn store(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn exists(&self, key: &[u8]) -> Result<bool>;
}

/// A named ordered byte-keyed store, opened by numeric id.
pub trait Index: Send + Sync {
    fn id(&self) -> u64;
    fn view(&self) -> Box<dyn View>;
    fn new_transaction(&self, mode: LockMode) -> Box<dyn Transaction>;
}

/// One end of a subrange: unbounded, or an inclusive/exclusive byte
/// bound. Distinct from the scan controller's `EMPTY` sentinel (§4.3),
/// which never reaches the storage layer -- an empty subrange is
/// skipped before a cursor is ever opened for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    Unbounded,
    Included(Vec<u8>),
    Excluded(Vec<u8>),
}

/// An external sorter owned by the storage engine (§4.7 "big" mode).
pub trait Sorter: Send {
    fn add_batch(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()>;
    fn finish_scan(self: Box<Self>) -> Result<Box<dyn Cursor>>;
}
