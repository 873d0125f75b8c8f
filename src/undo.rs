//! Part of L5: the undo chain itself — a per-row backward linked list
//! of diffs (spec §3 "Undo record"), stored behind an opaque
//! `RollPtr`. Purge and rollback both traverse this structure; MVCC
//! reconstruction (`mvcc.rs`) walks it read-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{ColumnValue, RollPtr, TrxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    Insert,
    Update,
    DeleteMark,
    /// A delete-marked record was converted back into a live one by
    /// insert-by-modify (spec §4.1 step 3); reversing it must restore
    /// the delete-mark bit, not just the columns.
    Reinsert,
}

/// Diff + chain linkage for one prior row version (spec §3).
#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub kind: UndoKind,
    /// Pre-image of every user column the owning write touched.
    pub pre_image: Vec<(usize, ColumnValue)>,
    /// Pre-image of any virtual (computed) columns a secondary index
    /// depends on, recomputed lazily otherwise (spec §4.2 edge cases).
    pub pre_image_virtual: Vec<(usize, ColumnValue)>,
    pub prev_trx_id: TrxId,
    pub prev_roll_ptr: RollPtr,
}

/// Append-only undo store. A real engine backs this with rollback
/// segments on disk; this in-memory version is sufficient to drive the
/// MVCC and rollback algorithms under test, and purge is exercised
/// directly by the scrubber/property tests via `purge`.
pub struct UndoLog {
    next_ptr: AtomicU64,
    records: RwLock<HashMap<u64, UndoRecord>>,
}

impl Default for UndoLog {
    fn default() -> Self {
        UndoLog { next_ptr: AtomicU64::new(1), records: RwLock::new(HashMap::new()) }
    }
}

impl UndoLog {
    pub fn new() -> UndoLog {
        Self::default()
    }

    /// Append a new undo record, returning the `RollPtr` a clustered
    /// record should now point at (spec §4.1 step 5: "stamp the new
    /// record's ... DB_ROLL_PTR").
    pub fn push(&self, record: UndoRecord) -> RollPtr {
        let id = self.next_ptr.fetch_add(1, Ordering::SeqCst);
        self.records.write().insert(id, record);
        RollPtr(id)
    }

    pub fn get(&self, ptr: RollPtr) -> Result<UndoRecord> {
        if ptr.is_null() {
            return Err(Error::MissingHistory);
        }
        self.records.read().get(&ptr.0).cloned().ok_or(Error::MissingHistory)
    }

    /// Purge removes an undo record once no open read view needs it
    /// (spec: lifecycle of "Undo record"). Purging a record whose chain
    /// successor is still referenced by a delete-marked clustered
    /// record violates I2; callers must check that first.
    pub fn purge(&self, ptr: RollPtr) {
        self.records.write().remove(&ptr.0);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_of_two_is_traversable() {
        let log = UndoLog::new();
        let p1 = log.push(UndoRecord {
            kind: UndoKind::Insert,
            pre_image: vec![],
            pre_image_virtual: vec![],
            prev_trx_id: TrxId::RESET,
            prev_roll_ptr: RollPtr::NULL,
        });
        let p2 = log.push(UndoRecord {
            kind: UndoKind::Update,
            pre_image: vec![(0, ColumnValue::Int(1))],
            pre_image_virtual: vec![],
            prev_trx_id: TrxId(1),
            prev_roll_ptr: p1,
        });
        let rec2 = log.get(p2).unwrap();
        assert_eq!(rec2.prev_roll_ptr, p1);
        let rec1 = log.get(rec2.prev_roll_ptr).unwrap();
        assert_eq!(rec1.kind, UndoKind::Insert);
        assert!(rec1.prev_roll_ptr.is_null());
    }

    #[test]
    fn missing_history_after_purge() {
        let log = UndoLog::new();
        let p1 = log.push(UndoRecord {
            kind: UndoKind::Insert,
            pre_image: vec![],
            pre_image_virtual: vec![],
            prev_trx_id: TrxId::RESET,
            prev_roll_ptr: RollPtr::NULL,
        });
        log.purge(p1);
        assert!(matches!(log.get(p1), Err(Error::MissingHistory)));
    }
}
