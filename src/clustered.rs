//! L4: the clustered-index writer (spec §4.1). The sole authoritative
//! copy of every user column (I1) lives here; secondary indexes only
//! ever carry ordering columns plus this index's key (`secondary.rs`).

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mtr::{Mtr, RedoLog, RedoRecord};
use crate::mvcc::{self, ReadView, Visibility};
use crate::page::{BufferPool, PageBody, PageId, Separator};
use crate::record::ColumnDiff;
use crate::types::{ExternRef, PrimaryKey, RollPtr, Row, TrxId};
use crate::undo::{UndoKind, UndoLog, UndoRecord};
use crate::cursor::{search_leaf, LeafPath, Searchable, TreeCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Optimistic,
    Pessimistic,
}

/// How an update ended up being carried out, reported so callers (the
/// `Table` orchestrator, the online-log appender) know which secondary
/// maintenance path to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    InPlace,
    DeleteMarkAndReinsert,
}

/// Bound on pessimistic-retry attempts (spec §4.1 "Failure semantics":
/// RETRY_PESSIMISTIC "must be bounded to avoid infinite loops when the
/// tree is genuinely out of file space").
const MAX_PESSIMISTIC_RETRIES: usize = 8;

/// Maximum separators an internal page may hold before it must split;
/// a fixed fan-out keeps the split/propagate algorithm deterministic
/// without needing a byte-accurate physical page layout for internal
/// nodes (spec §1: physical page layout is an external concern; only
/// the tree shape invariants I4/I5 are this core's to keep).
fn internal_capacity(page_size_bytes: usize) -> usize {
    (page_size_bytes / 64).max(4)
}

pub struct ClusteredIndex {
    pub name: String,
    pool: Arc<dyn BufferPool>,
    undo: Arc<UndoLog>,
    page_size_bytes: usize,
    leaf_fill_factor: f64,
    cursor: TreeCursor,
}

impl ClusteredIndex {
    pub fn new(name: impl Into<String>, pool: Arc<dyn BufferPool>, undo: Arc<UndoLog>, page_size_bytes: usize, leaf_fill_factor: f64) -> ClusteredIndex {
        ClusteredIndex { name: name.into(), pool, undo, page_size_bytes, leaf_fill_factor, cursor: TreeCursor }
    }

    fn capacity_bytes(&self) -> usize {
        (self.page_size_bytes as f64 * self.leaf_fill_factor) as usize
    }

    /// The backing buffer pool, for collaborators that operate on pages
    /// directly rather than through the tree API (the scrubber, spec
    /// §4.6).
    pub fn pool(&self) -> &dyn BufferPool {
        self.pool.as_ref()
    }

    /// spec §4.1 "insert_row(row, mode)".
    pub fn insert_row(&self, trx: TrxId, mut row: Row, mode: Mode, mtr: &mut Mtr, purge_watermark: TrxId) -> Result<()> {
        let mut attempt_mode = mode;
        for attempt in 0.. {
            match self.try_insert(trx, row.clone(), attempt_mode, mtr, purge_watermark)? {
                Some(()) => return Ok(()),
                None => {
                    if attempt >= MAX_PESSIMISTIC_RETRIES {
                        return Err(Error::OutOfFileSpace { index: self.name.clone() });
                    }
                    attempt_mode = Mode::Pessimistic;
                }
            }
        }
        unreachable!()
    }

    /// Returns `Ok(Some(()))` on success, `Ok(None)` to signal the
    /// caller should retry in pessimistic mode (spec RETRY_PESSIMISTIC),
    /// handled internally here so only a genuine space exhaustion
    /// escapes as an error.
    fn try_insert(&self, trx: TrxId, mut row: Row, mode: Mode, mtr: &mut Mtr, purge_watermark: TrxId) -> Result<Option<()>> {
        let path = self.cursor.find_leaf(self.pool.as_ref(), &row.primary_key)?;
        let page_ref = self.pool.get(path.leaf)?;
        let xpage = page_ref.x_latch();
        let mut body = xpage.read();

        let records = match &mut body {
            PageBody::Leaf { records, .. } => records,
            PageBody::Internal { .. } => {
                return Err(Error::Corruption { index: self.name.clone(), detail: "descended to an internal page".into() })
            }
        };

        match search_leaf(records, &row.primary_key) {
            Ok(idx) => {
                if !records[idx].delete_marked {
                    return Err(Error::DuplicateKey { index: self.name.clone() });
                }
                if records[idx].trx_id >= purge_watermark {
                    // Not yet fully purged from every other snapshot's
                    // perspective (spec §4.1 step 3): still a duplicate.
                    // `purge_watermark` is `mvcc::purge_watermark(open_views)`,
                    // the oldest horizon any currently open read view still
                    // needs — equivalent to `!mvcc::fully_purged(open_views,
                    // records[idx].trx_id)`.
                    return Err(Error::DuplicateKey { index: self.name.clone() });
                }
                // Insert-by-modify: delete-unmark, rewrite columns,
                // preserve the primary key (spec §4.1 step 3).
                let old = records[idx].clone();
                let undo_rec = UndoRecord {
                    kind: UndoKind::Reinsert,
                    pre_image: old
                        .columns
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (i, v.clone()))
                        .collect(),
                    pre_image_virtual: vec![],
                    prev_trx_id: old.trx_id,
                    prev_roll_ptr: old.roll_ptr,
                };
                let roll_ptr = self.undo.push(undo_rec);
                row.trx_id = trx;
                row.roll_ptr = roll_ptr;
                row.delete_marked = false;
                records[idx] = row;
                xpage.write(body);
                mtr.push(RedoRecord::LeafUpdate { page: path.leaf.0, at: idx });
                Ok(Some(()))
            }
            Err(pos) => {
                let projected = body.footprint() + row.footprint();
                if projected > self.capacity_bytes() {
                    if mode == Mode::Optimistic {
                        return Ok(None); // caller retries pessimistic
                    }
                    drop(xpage);
                    self.pessimistic_insert(trx, row, path, mtr)?;
                    return Ok(Some(()));
                }
                let undo_rec = UndoRecord {
                    kind: UndoKind::Insert,
                    pre_image: vec![],
                    pre_image_virtual: vec![],
                    prev_trx_id: TrxId::RESET,
                    prev_roll_ptr: RollPtr::NULL,
                };
                let roll_ptr = self.undo.push(undo_rec);
                row.trx_id = trx;
                row.roll_ptr = roll_ptr;
                if let PageBody::Leaf { records, .. } = &mut body {
                    records.insert(pos, row);
                }
                xpage.write(body);
                mtr.push(RedoRecord::LeafInsert { page: path.leaf.0, at: pos });
                Ok(Some(()))
            }
        }
    }

    fn pessimistic_insert(&self, trx: TrxId, mut row: Row, path: LeafPath, mtr: &mut Mtr) -> Result<()> {
        let undo_rec = UndoRecord {
            kind: UndoKind::Insert,
            pre_image: vec![],
            pre_image_virtual: vec![],
            prev_trx_id: TrxId::RESET,
            prev_roll_ptr: RollPtr::NULL,
        };
        row.trx_id = trx;
        row.roll_ptr = self.undo.push(undo_rec);
        let sep = self.split_leaf_and_insert(path.leaf, row)?;
        mtr.push(RedoRecord::SplitLeaf { left: path.leaf.0, right: sep.child.0 });
        self.propagate_split(&path.ancestors, path.leaf, sep)
    }

    /// Split `leaf` in half by record count, insert `row` into whichever
    /// half it belongs to, and return the separator the parent (or a
    /// brand new root) must absorb (spec §4.1 step 4).
    fn split_leaf_and_insert(&self, leaf: PageId, row: Row) -> Result<Separator> {
        let page_ref = self.pool.get(leaf)?;
        let xpage = page_ref.x_latch();
        let mut body = xpage.read();
        let (records, next) = match &mut body {
            PageBody::Leaf { records, next, .. } => (records, *next),
            PageBody::Internal { .. } => {
                return Err(Error::Corruption { index: self.name.clone(), detail: "split target is internal".into() })
            }
        };
        let pos = search_leaf(records, &row.primary_key).unwrap_or_else(|p| p);
        records.insert(pos, row);

        let mid = records.len() / 2;
        let right_records: Vec<Row> = records.split_off(mid);
        let right_key = right_records[0].primary_key.clone();

        let new_id = self.pool.alloc_leaf()?;
        let new_ref = self.pool.get(new_id)?;
        let new_xpage = new_ref.x_latch();
        new_xpage.write(PageBody::Leaf { records: right_records, prev: Some(leaf), next });
        drop(new_xpage);

        if let PageBody::Leaf { next: next_ref, .. } = &mut body {
            *next_ref = Some(new_id);
        }
        xpage.write(body);

        Ok(Separator { key: right_key, child: new_id })
    }

    /// Insert `sep` into the parent named by the tail of `ancestors`; if
    /// that overflows, split the parent too and recurse upward, finally
    /// growing a new root if the chain runs out (spec §4.1 step 4:
    /// "propagating a new separator upward").
    fn propagate_split(&self, ancestors: &[PageId], left_child: PageId, sep: Separator) -> Result<()> {
        match ancestors.split_last() {
            None => {
                // `left_child` was the root; grow the tree by one level.
                let left_key = self.min_key_under(left_child)?;
                let new_root = self.pool.alloc_internal()?;
                let root_ref = self.pool.get(new_root)?;
                let xpage = root_ref.x_latch();
                xpage.write(PageBody::Internal {
                    separators: vec![
                        Separator { key: left_key, child: left_child },
                        sep,
                    ],
                });
                drop(xpage);
                self.pool.set_root(new_root);
                Ok(())
            }
            Some((&parent, rest)) => {
                let page_ref = self.pool.get(parent)?;
                let xpage = page_ref.x_latch();
                let mut body = xpage.read();
                let separators = match &mut body {
                    PageBody::Internal { separators } => separators,
                    PageBody::Leaf { .. } => {
                        return Err(Error::Corruption { index: self.name.clone(), detail: "ancestor is a leaf".into() })
                    }
                };
                let pos = separators.partition_point(|s| s.key < sep.key);
                separators.insert(pos, sep);

                if separators.len() <= internal_capacity(self.page_size_bytes) {
                    xpage.write(body);
                    return Ok(());
                }

                // Parent overflowed: split it and propagate further up.
                let mid = separators.len() / 2;
                let right: Vec<Separator> = separators.split_off(mid);
                let right_key = right[0].key.clone();
                xpage.write(body);

                let new_id = self.pool.alloc_internal()?;
                let new_ref = self.pool.get(new_id)?;
                let new_xpage = new_ref.x_latch();
                new_xpage.write(PageBody::Internal { separators: right });
                drop(new_xpage);

                self.propagate_split(rest, parent, Separator { key: right_key, child: new_id })
            }
        }
    }

    fn min_key_under(&self, page: PageId) -> Result<PrimaryKey> {
        let page_ref = self.pool.get(page)?;
        let (_s, body) = page_ref.s_latch();
        match body {
            PageBody::Leaf { records, .. } => records
                .first()
                .map(|r| r.primary_key.clone())
                .ok_or_else(|| Error::Corruption { index: self.name.clone(), detail: "empty leaf".into() }),
            PageBody::Internal { separators } => separators
                .first()
                .map(|s| s.key.clone())
                .ok_or_else(|| Error::Corruption { index: self.name.clone(), detail: "empty internal".into() }),
        }
    }

    /// spec §4.1 "update_row(cursor, diff)".
    ///
    /// `new_row.primary_key` may differ from `old_key`; the caller (the
    /// `Table` orchestrator, which maintains secondary indexes too)
    /// decides whether that's legal for this table.
    pub fn update_row(&self, trx: TrxId, old_key: &PrimaryKey, mut new_row: Row, mtr: &mut Mtr, purge_watermark: TrxId) -> Result<UpdateOutcome> {
        let path = self.cursor.find_leaf(self.pool.as_ref(), old_key)?;
        let page_ref = self.pool.get(path.leaf)?;
        let xpage = page_ref.x_latch();
        let mut body = xpage.read();
        let records = match &mut body {
            PageBody::Leaf { records, .. } => records,
            PageBody::Internal { .. } => {
                return Err(Error::Corruption { index: self.name.clone(), detail: "descended to an internal page".into() })
            }
        };
        let idx = search_leaf(records, old_key).map_err(|_| Error::RecordNotFound)?;
        let old = records[idx].clone();
        let diff = ColumnDiff::compute(&old, &new_row);

        let key_changed = &new_row.primary_key != old_key;

        if key_changed {
            // Ordering column touched: delete-mark + insert (spec §4.1).
            let undo_rec = UndoRecord {
                kind: UndoKind::Update,
                pre_image: diff.changed.iter().map(|(i, o, _)| (*i, o.clone())).collect(),
                pre_image_virtual: vec![],
                prev_trx_id: old.trx_id,
                prev_roll_ptr: old.roll_ptr,
            };
            let roll_ptr = self.undo.push(undo_rec);
            records[idx].delete_marked = true;
            records[idx].trx_id = trx;
            records[idx].roll_ptr = roll_ptr;
            xpage.write(body);
            mtr.push(RedoRecord::LeafUpdate { page: path.leaf.0, at: idx });

            // Inherit untouched off-page columns (spec §4.1 "if the old
            // record held off-page columns not touched by the update"):
            // disown them on the old (now delete-marked) copy, inherit
            // them on the new.
            let touched: std::collections::HashSet<usize> = diff.changed.iter().map(|(i, _, _)| *i).collect();
            for (col, ext) in &old.externs {
                if !touched.contains(col) {
                    let mut inherited = *ext;
                    inherited.owner = true;
                    inherited.inherited = true;
                    new_row.externs.push((*col, inherited));
                }
            }

            self.insert_row(trx, new_row, Mode::Pessimistic, mtr, purge_watermark)?;
            return Ok(UpdateOutcome::DeleteMarkAndReinsert);
        }

        let introduces_extern = new_row.externs.len() > old.externs.len();
        if diff.is_empty() {
            return Ok(UpdateOutcome::InPlace);
        }

        let undo_rec = UndoRecord {
            kind: UndoKind::Update,
            pre_image: diff.changed.iter().map(|(i, o, _)| (*i, o.clone())).collect(),
            pre_image_virtual: vec![],
            prev_trx_id: old.trx_id,
            prev_roll_ptr: old.roll_ptr,
        };
        let roll_ptr = self.undo.push(undo_rec);
        new_row.trx_id = trx;
        new_row.roll_ptr = roll_ptr;

        if !diff.is_length_changing() && !introduces_extern {
            records[idx] = new_row;
            xpage.write(body);
            mtr.push(RedoRecord::LeafUpdate { page: path.leaf.0, at: idx });
            return Ok(UpdateOutcome::InPlace);
        }

        // Pessimistic: replace in place if it still fits once the old
        // record is removed, else split the leaf to make room.
        records[idx] = new_row.clone();
        if body.footprint() <= self.capacity_bytes() {
            xpage.write(body);
            mtr.push(RedoRecord::LeafUpdate { page: path.leaf.0, at: idx });
            return Ok(UpdateOutcome::InPlace);
        }
        if let PageBody::Leaf { records, .. } = &mut body {
            records.remove(idx);
        }
        xpage.write(body);
        drop(xpage);
        let sep = self.split_leaf_and_insert(path.leaf, new_row)?;
        mtr.push(RedoRecord::SplitLeaf { left: path.leaf.0, right: sep.child.0 });
        self.propagate_split(&path.ancestors, path.leaf, sep)?;
        Ok(UpdateOutcome::InPlace)
    }

    /// spec §4.1 "delete_mark(cursor)".
    pub fn delete_mark(&self, trx: TrxId, key: &PrimaryKey, mtr: &mut Mtr) -> Result<()> {
        let path = self.cursor.find_leaf(self.pool.as_ref(), key)?;
        let page_ref = self.pool.get(path.leaf)?;
        let xpage = page_ref.x_latch();
        let mut body = xpage.read();
        let records = match &mut body {
            PageBody::Leaf { records, .. } => records,
            PageBody::Internal { .. } => {
                return Err(Error::Corruption { index: self.name.clone(), detail: "descended to an internal page".into() })
            }
        };
        let idx = search_leaf(records, key).map_err(|_| Error::RecordNotFound)?;
        if records[idx].delete_marked {
            return Ok(()); // idempotent
        }
        let old = records[idx].clone();
        let undo_rec = UndoRecord {
            kind: UndoKind::DeleteMark,
            pre_image: vec![],
            pre_image_virtual: vec![],
            prev_trx_id: old.trx_id,
            prev_roll_ptr: old.roll_ptr,
        };
        let roll_ptr = self.undo.push(undo_rec);
        records[idx].delete_marked = true;
        records[idx].trx_id = trx;
        records[idx].roll_ptr = roll_ptr;
        xpage.write(body);
        mtr.push(RedoRecord::LeafUpdate { page: path.leaf.0, at: idx });
        Ok(())
    }

    /// spec §4.1 "pessimistic_delete(cursor)" — physical removal, used
    /// by purge once no snapshot needs the delete-marked record (spec
    /// §3 "Row" lifecycle).
    pub fn pessimistic_delete(&self, key: &PrimaryKey, mtr: &mut Mtr) -> Result<()> {
        let path = self.cursor.find_leaf(self.pool.as_ref(), key)?;
        let page_ref = self.pool.get(path.leaf)?;
        let xpage = page_ref.x_latch();
        let mut body = xpage.read();
        let records = match &mut body {
            PageBody::Leaf { records, .. } => records,
            PageBody::Internal { .. } => {
                return Err(Error::Corruption { index: self.name.clone(), detail: "descended to an internal page".into() })
            }
        };
        let idx = search_leaf(records, key).map_err(|_| Error::RecordNotFound)?;
        if !records[idx].delete_marked {
            return Err(Error::Corruption { index: self.name.clone(), detail: "purge of a live record".into() });
        }
        let roll_ptr = records[idx].roll_ptr;
        self.undo.purge(roll_ptr);
        if let PageBody::Leaf { records, .. } = &mut body {
            records.remove(idx);
        }
        xpage.write(body);
        mtr.push(RedoRecord::LeafDelete { page: path.leaf.0, at: idx });
        Ok(())
    }

    /// Point lookup used by MVCC readers, the FK checker, and tests —
    /// returns the physical record as stored, delete-marked or not.
    pub fn get_physical(&self, key: &PrimaryKey) -> Result<Option<Row>> {
        let leaf = self.cursor.find_leaf(self.pool.as_ref(), key)?.leaf;
        let page_ref = self.pool.get(leaf)?;
        let (_s, body) = page_ref.s_latch();
        match body {
            PageBody::Leaf { records, .. } => Ok(search_leaf(&records, key).ok().map(|i| records[i].clone())),
            PageBody::Internal { .. } => Err(Error::Corruption { index: self.name.clone(), detail: "leaf expected".into() }),
        }
    }

    /// Full ascending scan of live (physical) records across leaves,
    /// used by tests and by the bulk builder's base scan.
    pub fn scan_all(&self) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        let mut leaf = Some(self.cursor.first_leaf(self.pool.as_ref())?);
        while let Some(id) = leaf {
            let page_ref = self.pool.get(id)?;
            let (_s, body) = page_ref.s_latch();
            if let PageBody::Leaf { records, .. } = body {
                out.extend(records);
            }
            leaf = self.cursor.next_leaf(self.pool.as_ref(), id)?;
        }
        Ok(out)
    }

    /// spec §4.5 "read the clustered index once": scan every physical
    /// record and, for each, reconstruct the version `view` sees,
    /// skipping rows with no visible version and rows whose visible
    /// version turned out delete-marked.
    pub fn scan_visible(&self, view: &ReadView) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        for record in self.scan_all()? {
            match mvcc::reconstruct(&record, view, &self.undo)? {
                Visibility::Visible(row) if !row.delete_marked => out.push(row),
                _ => {}
            }
        }
        Ok(out)
    }
}
