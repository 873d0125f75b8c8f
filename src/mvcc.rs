//! L5: MVCC & undo reader (spec §4.2).
//!
//! Given a leaf record and a read view, reconstruct either the record
//! itself or the most recent prior version visible to that view, by
//! walking the `DB_ROLL_PTR` chain and applying each undo record's
//! inverse diff (spec P4 "Undo round-trip").

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::types::{ColumnValue, RollPtr, Row, TrxId};
use crate::undo::{UndoKind, UndoLog};

/// A snapshot: the caller's trx id and the set of trx ids considered
/// not-yet-committed when the view was opened (spec §3 "Read view").
#[derive(Debug, Clone)]
pub struct ReadView {
    pub creator: TrxId,
    /// Highest trx id assigned at the moment the view opened; any trx
    /// id beyond this is, by definition, started after the snapshot and
    /// invisible.
    pub max_trx_at_open: TrxId,
    /// Trx ids that were active (not yet committed) at open.
    pub active_at_open: HashSet<TrxId>,
}

impl ReadView {
    pub fn open(creator: TrxId, max_trx_at_open: TrxId, active_at_open: HashSet<TrxId>) -> ReadView {
        ReadView { creator, max_trx_at_open, active_at_open }
    }

    pub fn is_visible(&self, trx_id: TrxId) -> bool {
        if trx_id == self.creator {
            return true;
        }
        trx_id <= self.max_trx_at_open && !self.active_at_open.contains(&trx_id)
    }

    /// Lower bound below which every committed trx is guaranteed
    /// visible (spec P3 "T.min_not_started"): the oldest trx id that
    /// was still active at open, or one past the snapshot boundary if
    /// none were active.
    pub fn min_not_started(&self) -> TrxId {
        self.active_at_open.iter().min().copied().unwrap_or(TrxId(self.max_trx_at_open.0 + 1))
    }
}

/// Callback into the SQL layer to recompute a virtual (computed)
/// column from reconstructed base columns (spec §4.2 edge cases, §6
/// "vcol.compute").
pub trait VColCompute {
    fn compute(&self, columns: &[ColumnValue], col: usize) -> Result<ColumnValue>;
}

pub struct NoVirtualColumns;

impl VColCompute for NoVirtualColumns {
    fn compute(&self, _columns: &[ColumnValue], col: usize) -> Result<ColumnValue> {
        Err(Error::ComputeValueFailed { column: col.to_string() })
    }
}

/// Outcome of reconstructing a record against a read view.
pub enum Visibility {
    /// The record (or a prior version of it) is visible.
    Visible(Row),
    /// No version of this row is visible to the view (it did not yet
    /// exist, or its whole undo chain was purged before the view could
    /// walk it — spec §4.2 "a chain may be pruned concurrently by
    /// purge").
    NotVisible,
}

/// Core algorithm of spec §4.2.
pub fn reconstruct(record: &Row, view: &ReadView, undo: &UndoLog) -> Result<Visibility> {
    if view.is_visible(record.trx_id) {
        return Ok(Visibility::Visible(record.clone()));
    }

    let mut columns = record.columns.clone();
    let mut delete_marked = record.delete_marked;
    let mut roll_ptr = record.roll_ptr;

    loop {
        if roll_ptr.is_null() {
            return Ok(Visibility::NotVisible);
        }
        let undo_rec = match undo.get(roll_ptr) {
            Ok(r) => r,
            // Concurrently purged out from under us: the reader only
            // ever needed this chain because the record itself wasn't
            // visible, and purge never removes a version some view
            // still needs (I2), so a missing link here means no
            // version of this row is visible to this particular view.
            Err(Error::MissingHistory) => return Ok(Visibility::NotVisible),
            Err(e) => return Err(e),
        };

        match undo_rec.kind {
            UndoKind::Insert => {
                // Reversing the insert leaves nothing: the row did not
                // exist before trx `record.trx_id`.
                return Ok(Visibility::NotVisible);
            }
            UndoKind::DeleteMark => {
                delete_marked = false;
            }
            UndoKind::Reinsert => {
                delete_marked = true;
            }
            UndoKind::Update => {}
        }
        for (idx, old_val) in &undo_rec.pre_image {
            if let Some(slot) = columns.get_mut(*idx) {
                *slot = old_val.clone();
            }
        }

        let candidate_trx = undo_rec.prev_trx_id;
        roll_ptr = undo_rec.prev_roll_ptr;

        if view.is_visible(candidate_trx) {
            let mut row = record.clone();
            row.columns = columns;
            row.trx_id = candidate_trx;
            row.roll_ptr = roll_ptr;
            row.delete_marked = delete_marked;
            return Ok(Visibility::Visible(row));
        }
    }
}

/// Oldest trx id below which no currently open read view still needs a
/// prior version of a row (spec §4.1 step 3: a delete-marked match is
/// only eligible for insert-by-modify once it is "fully purged from
/// other snapshots' perspective", not merely from the inserter's own).
/// With no open views at all, every trx id is purgeable.
pub fn purge_watermark(open_views: &[ReadView]) -> TrxId {
    open_views.iter().map(ReadView::min_not_started).min().unwrap_or(TrxId(u64::MAX))
}

/// Whether `trx_id` precedes every open view's visibility horizon, i.e.
/// no live snapshot would ever need to walk back past it.
pub fn fully_purged(open_views: &[ReadView], trx_id: TrxId) -> bool {
    trx_id < purge_watermark(open_views)
}

/// Recompute a virtual column on a reconstructed row, per spec §4.2:
/// "if that callback returns 'compute failed' the visibility result is
/// 'not visible' and the error is propagated."
pub fn recompute_virtual_column(
    row: &Row,
    col: usize,
    vcol: &dyn VColCompute,
) -> Result<ColumnValue> {
    vcol.compute(&row.columns, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RollPtr;
    use crate::undo::UndoRecord;

    #[test]
    fn sees_prior_version_through_one_undo_hop() {
        let undo = UndoLog::new();
        let ptr = undo.push(UndoRecord {
            kind: UndoKind::Update,
            pre_image: vec![(0, ColumnValue::Text("x".into()))],
            pre_image_virtual: vec![],
            prev_trx_id: TrxId(1),
            prev_roll_ptr: RollPtr::NULL,
        });
        let current = {
            let mut r = Row::new(vec![ColumnValue::Int(5)], vec![ColumnValue::Text("y".into())]);
            r.trx_id = TrxId(2);
            r.roll_ptr = ptr;
            r
        };

        let view = ReadView::open(TrxId(99), TrxId(1), HashSet::new()); // opened before trx 2 committed
        match reconstruct(&current, &view, &undo).unwrap() {
            Visibility::Visible(row) => assert_eq!(row.columns[0], ColumnValue::Text("x".into())),
            Visibility::NotVisible => panic!("expected visible prior version"),
        }

        let view2 = ReadView::open(TrxId(100), TrxId(2), HashSet::new());
        match reconstruct(&current, &view2, &undo).unwrap() {
            Visibility::Visible(row) => assert_eq!(row.columns[0], ColumnValue::Text("y".into())),
            Visibility::NotVisible => panic!("expected the current version visible"),
        }
    }

    #[test]
    fn insert_undo_terminates_chain_as_not_visible() {
        let undo = UndoLog::new();
        let ptr = undo.push(UndoRecord {
            kind: UndoKind::Insert,
            pre_image: vec![],
            pre_image_virtual: vec![],
            prev_trx_id: TrxId::RESET,
            prev_roll_ptr: RollPtr::NULL,
        });
        let mut row = Row::new(vec![ColumnValue::Int(1)], vec![]);
        row.trx_id = TrxId(5);
        row.roll_ptr = ptr;

        let view = ReadView::open(TrxId(1), TrxId(4), HashSet::new());
        match reconstruct(&row, &view, &undo).unwrap() {
            Visibility::NotVisible => {}
            Visibility::Visible(_) => panic!("row should not exist before its own insert"),
        }
    }
}
