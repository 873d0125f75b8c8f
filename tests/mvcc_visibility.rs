//! Snapshot-isolation visibility end to end: a read view opened before
//! a concurrent update must keep seeing the pre-update column values by
//! walking the undo chain (spec §4.2, P3 "read-view monotonicity").

use std::collections::HashSet;
use std::sync::Arc;

use clustered_core::mtr::{Mtr, NullRedoLog};
use clustered_core::mvcc::{reconstruct, ReadView, Visibility};
use clustered_core::page::InMemoryBufferPool;
use clustered_core::types::{ColumnValue, Row, TrxId};
use clustered_core::undo::UndoLog;
use clustered_core::{ClusteredIndex, Mode};

fn index() -> (ClusteredIndex, Arc<UndoLog>) {
    let pool: Arc<dyn clustered_core::page::BufferPool> = Arc::new(InMemoryBufferPool::new());
    let undo = Arc::new(UndoLog::new());
    (ClusteredIndex::new("t", pool, undo.clone(), 4096, 0.9), undo)
}

#[test]
fn old_read_view_still_sees_pre_update_value() {
    let (idx, undo) = index();
    let redo = NullRedoLog;

    let row = Row::new(vec![ColumnValue::Int(1)], vec![ColumnValue::Text("v1".into())]);
    let mut mtr = Mtr::start(TrxId(1), &redo);
    idx.insert_row(TrxId(1), row, Mode::Optimistic, &mut mtr, TrxId(1)).unwrap();
    mtr.commit().unwrap();

    // Snapshot opened after trx 1 committed and before trx 2 starts: no
    // active trx ids, max_trx_at_open covers trx 1.
    let view = ReadView::open(TrxId(3), TrxId(1), HashSet::new());

    let mut new_row = Row::new(vec![ColumnValue::Int(1)], vec![ColumnValue::Text("v2".into())]);
    new_row.primary_key = vec![ColumnValue::Int(1)];
    let mut mtr = Mtr::start(TrxId(2), &redo);
    idx.update_row(TrxId(2), &vec![ColumnValue::Int(1)], new_row, &mut mtr, TrxId(2)).unwrap();
    mtr.commit().unwrap();

    let physical = idx.get_physical(&vec![ColumnValue::Int(1)]).unwrap().unwrap();
    assert_eq!(physical.columns[0], ColumnValue::Text("v2".into()));

    match reconstruct(&physical, &view, &undo).unwrap() {
        Visibility::Visible(old) => assert_eq!(old.columns[0], ColumnValue::Text("v1".into())),
        Visibility::NotVisible => panic!("trx 1's committed insert must be visible to this view"),
    }

    // A fresh view opened after trx 2 committed sees the new value
    // directly, without even touching the undo chain.
    let fresh_view = ReadView::open(TrxId(4), TrxId(2), HashSet::new());
    match reconstruct(&physical, &fresh_view, &undo).unwrap() {
        Visibility::Visible(cur) => assert_eq!(cur.columns[0], ColumnValue::Text("v2".into())),
        Visibility::NotVisible => panic!("trx 2's committed update must be visible to a later view"),
    }
}

#[test]
fn view_opened_before_insert_does_not_see_the_row() {
    let (idx, undo) = index();
    let redo = NullRedoLog;

    // Snapshot as-of before trx 1 even starts.
    let view = ReadView::open(TrxId(5), TrxId(0), HashSet::new());

    let row = Row::new(vec![ColumnValue::Int(7)], vec![ColumnValue::Text("fresh".into())]);
    let mut mtr = Mtr::start(TrxId(1), &redo);
    idx.insert_row(TrxId(1), row, Mode::Optimistic, &mut mtr, TrxId(1)).unwrap();
    mtr.commit().unwrap();

    let physical = idx.get_physical(&vec![ColumnValue::Int(7)]).unwrap().unwrap();
    match reconstruct(&physical, &view, &undo).unwrap() {
        Visibility::Visible(_) => panic!("a view opened before the inserting trx must not see the row"),
        Visibility::NotVisible => {}
    }
}
