//! End-to-end FK cascade behavior driven through `Engine`, exercising
//! spec §4.3's Cascade and SetNull actions against real clustered
//! tables rather than the checker in isolation (that's covered by
//! `fk.rs`'s own unit tests).

use std::sync::Arc;

use clustered_core::dict::{CascadeAction, ForeignKey, InMemoryDictionary, TableDescriptor};
use clustered_core::lock::InMemoryLockManager;
use clustered_core::mtr::NullRedoLog;
use clustered_core::page::InMemoryBufferPool;
use clustered_core::types::{ColumnValue, Row, TrxId};
use clustered_core::undo::UndoLog;
use clustered_core::{ClusteredIndex, Engine, Table};

fn make_engine(dict: Arc<InMemoryDictionary>) -> Engine {
    Engine::new(Arc::new(InMemoryLockManager::new()), dict, Arc::new(NullRedoLog), 15)
}

fn make_table(name: &str) -> Table {
    let pool: Arc<dyn clustered_core::page::BufferPool> = Arc::new(InMemoryBufferPool::new());
    let undo = Arc::new(UndoLog::new());
    Table::new(name, ClusteredIndex::new(name, pool, undo, 4096, 0.9))
}

fn fk(on_delete: CascadeAction, on_update: CascadeAction) -> ForeignKey {
    ForeignKey {
        name: "fk_child_parent".into(),
        child_table: "child".into(),
        child_columns: vec![0],
        parent_table: "parent".into(),
        parent_index: "pk".into(),
        parent_columns: vec![0],
        on_delete,
        on_update,
    }
}

fn row(pk: i64, parent: i64) -> Row {
    Row::new(vec![ColumnValue::Int(pk)], vec![ColumnValue::Int(parent)])
}

#[test]
fn cascade_delete_removes_children() {
    let dict = Arc::new(InMemoryDictionary::new());
    dict.add_table(TableDescriptor {
        name: "child".into(),
        fks_as_child: vec![fk(CascadeAction::Cascade, CascadeAction::Restrict)],
        ..Default::default()
    });
    dict.add_table(TableDescriptor { name: "parent".into(), ..Default::default() });

    let engine = make_engine(dict);
    engine.add_table(make_table("parent"));
    engine.add_table(make_table("child"));

    engine.insert(TrxId(1), "parent", row(99, 0)).unwrap();
    engine.insert(TrxId(1), "child", row(1, 99)).unwrap();
    engine.insert(TrxId(1), "child", row(2, 99)).unwrap();

    engine.delete(TrxId(2), "parent", &vec![ColumnValue::Int(99)]).unwrap();

    let rows = engine.scan_table("child").unwrap();
    assert!(rows.iter().all(|r| r.delete_marked), "every child row should be delete-marked after cascade");
}

#[test]
fn restrict_blocks_delete_while_children_exist() {
    let dict = Arc::new(InMemoryDictionary::new());
    dict.add_table(TableDescriptor {
        name: "child".into(),
        fks_as_child: vec![fk(CascadeAction::Restrict, CascadeAction::Restrict)],
        ..Default::default()
    });
    dict.add_table(TableDescriptor { name: "parent".into(), ..Default::default() });

    let engine = make_engine(dict);
    engine.add_table(make_table("parent"));
    engine.add_table(make_table("child"));

    engine.insert(TrxId(1), "parent", row(99, 0)).unwrap();
    engine.insert(TrxId(1), "child", row(1, 99)).unwrap();

    let err = engine.delete(TrxId(2), "parent", &vec![ColumnValue::Int(99)]).unwrap_err();
    assert!(matches!(err, clustered_core::Error::RowIsReferenced { .. }));
}

#[test]
fn set_null_on_delete_clears_child_fk_column() {
    let dict = Arc::new(InMemoryDictionary::new());
    dict.add_table(TableDescriptor {
        name: "child".into(),
        fks_as_child: vec![fk(CascadeAction::SetNull, CascadeAction::Restrict)],
        ..Default::default()
    });
    dict.add_table(TableDescriptor { name: "parent".into(), ..Default::default() });

    let engine = make_engine(dict);
    engine.add_table(make_table("parent"));
    engine.add_table(make_table("child"));

    engine.insert(TrxId(1), "parent", row(99, 0)).unwrap();
    engine.insert(TrxId(1), "child", row(1, 99)).unwrap();

    engine.delete(TrxId(2), "parent", &vec![ColumnValue::Int(99)]).unwrap();

    let child = engine.get_row("child", &vec![ColumnValue::Int(1)]).unwrap().unwrap();
    assert_eq!(child.columns[0], ColumnValue::Null);
    assert!(!child.delete_marked, "set-null must not delete-mark the child row");
}

#[test]
fn cascade_update_repoints_child_fk_column() {
    let dict = Arc::new(InMemoryDictionary::new());
    dict.add_table(TableDescriptor {
        name: "child".into(),
        fks_as_child: vec![fk(CascadeAction::Restrict, CascadeAction::Cascade)],
        ..Default::default()
    });
    dict.add_table(TableDescriptor {
        name: "parent".into(),
        fks_as_parent: vec![fk(CascadeAction::Restrict, CascadeAction::Cascade)],
        ..Default::default()
    });

    let engine = make_engine(dict);
    engine.add_table(make_table("parent"));
    engine.add_table(make_table("child"));

    engine.insert(TrxId(1), "parent", row(99, 0)).unwrap();
    engine.insert(TrxId(1), "child", row(1, 99)).unwrap();

    engine
        .update(TrxId(2), "parent", &vec![ColumnValue::Int(99)], row(100, 0))
        .unwrap();

    let child = engine.get_row("child", &vec![ColumnValue::Int(1)]).unwrap().unwrap();
    assert_eq!(child.columns[0], ColumnValue::Int(100), "cascade update must re-point the FK column to the new parent key");
    assert!(!child.delete_marked);
}
