//! Core relational row-access layer over an ordered key/value storage
//! engine: column codecs, row codec and schema registry, scan
//! controllers and scanners, row updaters, secondary-index management,
//! sorted and wrapped scanners, and the table entry point that ties
//! them together.

pub mod codec;
pub mod config;
pub mod filter;
pub mod row;
pub mod rowcodec;
pub mod scanctrl;
pub mod scanner;
pub mod schema;
pub mod secidx;
pub mod sorted;
pub mod storage;
pub mod table;
pub mod updater;
pub mod wrapped;

pub use codec::{ColumnType, Direction, FilterOp, Position, Value};
pub use config::RowStoreConfig;
pub use filter::FilterExpr;
pub use row::{Row, Slot};
pub use rowcodec::{DecodeOutcome, RowCodec};
pub use scanctrl::{ScanController, ScanControllerFactory};
pub use scanner::BasicScanner;
pub use schema::{Column, RowInfo, SchemaRegistry, SchemaSource, SecondaryInfo};
pub use secidx::{SecondaryIndexManager, SecondaryIndexSource, Trigger, TriggerCell};
pub use sorted::{sorted_scan, OrderBy, SortedScanner};
pub use table::Table;
pub use updater::{RowUpdater, UpdateMode};
pub use wrapped::{WrapMode, WrappedScanner};
