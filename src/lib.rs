//! A transactional, clustered B-tree storage engine core: MVCC
//! inserts/updates/deletes over a single physical copy of each row,
//! referential-integrity checking with bounded cascades, crash-safe
//! online index builds, an external-sort bulk index builder, and a
//! background page scrubber that erases tombstones left by purge.
//!
//! The engine is organized bottom-up, each module depending only on the
//! ones below it:
//!
//! - [`latch`] / [`page`] — page identity, the buffer pool boundary, and
//!   RAII S/X/U latch guards (L0).
//! - [`mtr`] — the mini-transaction: buffered redo records committed as
//!   one unit (L1).
//! - [`record`] — the clustered-record and tuple wire codec shared by
//!   the clustered index, the online-build log, and the bulk builder.
//! - [`cursor`] — descent through the tree to a leaf (`Searchable`).
//! - [`undo`] — the backward undo chain MVCC readers walk.
//! - [`mvcc`] — read views and visibility (I2).
//! - [`lock`] — the row/gap lock manager boundary the FK checker uses.
//! - [`dict`] — the catalog boundary: table/index/foreign-key metadata.
//! - [`clustered`] — the clustered-index writer: optimistic/pessimistic
//!   insert, update, delete-mark, purge (L4).
//! - [`secondary`] — secondary-index entries, uniqueness, and the
//!   delete-marked insert-by-modify tie-break.
//! - [`fk`] — the synchronous foreign-key checker and its bounded
//!   cascade recursion (L6).
//! - [`online_log`] — the crash-safe online-build log an in-flight
//!   `ALTER ... ADD INDEX` replays concurrent DML through (L7).
//! - [`bulk`] — the external-sort bulk index builder (L8).
//! - [`scrubber`] — the background page scrubber (L9).
//! - [`table`] / [`Engine`] — the orchestrator wiring all of the above
//!   into one per-table entry point.
//! - [`config`] and [`stats`] are the ambient tunables and counters
//!   every layer above shares.

pub mod error;
pub mod types;

pub mod config;
pub mod stats;

pub mod latch;
pub mod page;
pub mod mtr;
pub mod record;
pub mod cursor;
pub mod undo;
pub mod mvcc;
pub mod lock;
pub mod dict;
pub mod clustered;
pub mod secondary;
pub mod fk;
pub mod online_log;
pub mod bulk;
pub mod scrubber;
pub mod table;

pub use crate::clustered::{ClusteredIndex, Mode, UpdateOutcome};
pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::fk::{FkCatalog, ForeignKeyChecker};
pub use crate::mvcc::ReadView;
pub use crate::secondary::SecondaryIndex;
pub use crate::table::{ColumnMap, Engine, IndexBuildStatus, Table};
pub use crate::types::{ColumnValue, ExternRef, IndexKey, PrimaryKey, RollPtr, Row, Seqno, TrxId};
