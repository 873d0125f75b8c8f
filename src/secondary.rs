//! Secondary index entries (spec §3 "Secondary index entry", I1/I3).
//!
//! A secondary entry is an ordering key followed by the clustered key;
//! it never carries its own trx_id/roll_ptr — the clustered index
//! (`clustered.rs`) remains the sole authoritative copy of every user
//! column. This module owns uniqueness (P1) and the insert/delete
//! tie-breaks spec §4.1 describes for adjacent delete-marked matches.
//!
//! The full paged B-tree machinery lives in `clustered.rs`; a secondary
//! index here is a single sorted vector behind one `IndexLatch` rather
//! than its own page tree — enough to drive the uniqueness and
//! consistency algorithms and their tests without duplicating the
//! split/propagate code for a second tree shape.

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::latch::IndexLatch;
use crate::types::{ColumnValue, IndexKey, PrimaryKey};

#[derive(Debug, Clone)]
struct Entry {
    key: IndexKey,
    pk: PrimaryKey,
    delete_marked: bool,
}

pub struct SecondaryIndex {
    pub name: String,
    pub table: String,
    pub unique: bool,
    /// Equal NULLs are treated as unequal in a unique index unless the
    /// index declares `nulls_equal` (spec §4.1 "Tie-breaks").
    pub nulls_equal: bool,
    /// Number of leading ordering columns that must be unique (P1).
    pub n_unique: usize,
    latch: IndexLatch,
    entries: RwLock<Vec<Entry>>,
}

fn prefix_eq(a: &[ColumnValue], b: &[ColumnValue], n: usize) -> bool {
    a.iter().take(n).eq(b.iter().take(n))
}

fn any_null(a: &[ColumnValue], n: usize) -> bool {
    a.iter().take(n).any(ColumnValue::is_null)
}

impl SecondaryIndex {
    pub fn new(name: impl Into<String>, table: impl Into<String>, unique: bool, nulls_equal: bool, n_unique: usize) -> SecondaryIndex {
        SecondaryIndex {
            name: name.into(),
            table: table.into(),
            unique,
            nulls_equal,
            n_unique,
            latch: IndexLatch::new(),
            entries: RwLock::new(Vec::new()),
        }
    }

    fn sort_key<'a>(&self, key: &'a IndexKey, pk: &'a PrimaryKey) -> (&'a IndexKey, &'a PrimaryKey) {
        (key, pk)
    }

    /// spec §4.1 "insert": P1 uniqueness plus the delete-marked
    /// tie-break ("When two adjacent records compare equal on
    /// n_unique fields and the lower one is delete-marked, the insert
    /// becomes an update of the delete-marked record; if the upper is
    /// delete-marked, the insert goes between them").
    pub fn insert(&self, key: IndexKey, pk: PrimaryKey) -> Result<()> {
        let _x = self.latch.x_latch();
        let mut entries = self.entries.write();

        let pos = entries
            .partition_point(|e| self.sort_key(&e.key, &e.pk) < self.sort_key(&key, &pk));

        if self.unique && !(self.nulls_equal == false && any_null(&key, self.n_unique)) {
            // Scan the run of entries sharing the n_unique prefix.
            let mut i = pos;
            while i < entries.len() && prefix_eq(&entries[i].key, &key, self.n_unique) {
                if !entries[i].delete_marked {
                    return Err(Error::DuplicateKey { index: self.name.clone() });
                }
                i += 1;
            }
            let mut j = pos;
            while j > 0 && prefix_eq(&entries[j - 1].key, &key, self.n_unique) {
                j -= 1;
                if !entries[j].delete_marked {
                    return Err(Error::DuplicateKey { index: self.name.clone() });
                }
            }
            // Lower neighbor delete-marked: convert into an update of
            // that entry rather than inserting a second physical one.
            if j < entries.len() && prefix_eq(&entries[j].key, &key, self.n_unique) && entries[j].delete_marked {
                entries[j] = Entry { key, pk, delete_marked: false };
                return Ok(());
            }
        }

        entries.insert(pos, Entry { key, pk, delete_marked: false });
        Ok(())
    }

    pub fn delete_mark(&self, key: &IndexKey, pk: &PrimaryKey) -> Result<()> {
        let _x = self.latch.x_latch();
        let mut entries = self.entries.write();
        let idx = entries
            .iter()
            .position(|e| &e.key == key && &e.pk == pk)
            .ok_or(Error::RecordNotFound)?;
        entries[idx].delete_marked = true;
        Ok(())
    }

    /// Physical removal once purge is satisfied (mirrors
    /// `ClusteredIndex::pessimistic_delete` for the secondary case).
    pub fn purge(&self, key: &IndexKey, pk: &PrimaryKey) -> Result<()> {
        let _x = self.latch.x_latch();
        let mut entries = self.entries.write();
        let idx = entries
            .iter()
            .position(|e| &e.key == key && &e.pk == pk)
            .ok_or(Error::RecordNotFound)?;
        entries.remove(idx);
        Ok(())
    }

    /// Load a pre-sorted, pre-deduplicated sequence directly, bypassing
    /// the per-insert P1 scan (spec §4.5 "bulk-insert the final sorted
    /// sequence using a dedicated loader"). Callers are responsible for
    /// uniqueness and ordering; this is only safe against a fresh index.
    pub fn bulk_load(&self, entries: Vec<(IndexKey, PrimaryKey)>) -> Result<()> {
        let _x = self.latch.x_latch();
        let mut guard = self.entries.write();
        guard.clear();
        guard.extend(entries.into_iter().map(|(key, pk)| Entry { key, pk, delete_marked: false }));
        Ok(())
    }

    /// Live (not delete-marked) entries, for P1/P2 checks and scans.
    pub fn scan_live(&self) -> Vec<(IndexKey, PrimaryKey)> {
        let _s = self.latch.s_latch();
        self.entries.read().iter().filter(|e| !e.delete_marked).map(|e| (e.key.clone(), e.pk.clone())).collect()
    }

    /// spec §4.3 "Detail floor": position a cursor on this index with a
    /// GE search on `probe`, then iterate while the leading
    /// `probe.len()` key columns stay equal to it, consulting the
    /// delete-mark bit of each candidate. Used by the FK checker's
    /// parent-side probe instead of a full clustered-index scan, when a
    /// secondary index ordered on the FK's columns exists.
    pub fn probe_prefix_live(&self, probe: &[ColumnValue]) -> Vec<PrimaryKey> {
        let _s = self.latch.s_latch();
        let entries = self.entries.read();
        let n = probe.len();
        let pos = entries.partition_point(|e| e.key.iter().take(n).cmp(probe.iter()) == std::cmp::Ordering::Less);
        entries[pos..]
            .iter()
            .take_while(|e| e.key.iter().take(n).eq(probe.iter()))
            .filter(|e| !e.delete_marked)
            .map(|e| e.pk.clone())
            .collect()
    }

    pub fn len_live(&self) -> usize {
        self.scan_live().len()
    }

    /// P1: no two live entries share an n_unique prefix unless it
    /// contains a NULL in a non-`nulls_equal` index.
    pub fn check_p1_uniqueness(&self) -> Result<()> {
        if !self.unique {
            return Ok(());
        }
        let live = self.scan_live();
        for w in live.windows(2) {
            let (a, _) = &w[0];
            let (b, _) = &w[1];
            if prefix_eq(a, b, self.n_unique) && !(any_null(a, self.n_unique) && !self.nulls_equal) {
                return Err(Error::Corruption { index: self.name.clone(), detail: "P1 uniqueness violated".into() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_index_rejects_duplicate() {
        let idx = SecondaryIndex::new("ux", "t", true, false, 1);
        idx.insert(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(10)]).unwrap();
        let err = idx.insert(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(11)]).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn unique_index_allows_multiple_nulls_by_default() {
        let idx = SecondaryIndex::new("ux", "t", true, false, 1);
        idx.insert(vec![ColumnValue::Null], vec![ColumnValue::Int(1)]).unwrap();
        idx.insert(vec![ColumnValue::Null], vec![ColumnValue::Int(2)]).unwrap();
        assert_eq!(idx.len_live(), 2);
    }

    #[test]
    fn nulls_equal_index_rejects_duplicate_nulls() {
        let idx = SecondaryIndex::new("ux", "t", true, true, 1);
        idx.insert(vec![ColumnValue::Null], vec![ColumnValue::Int(1)]).unwrap();
        let err = idx.insert(vec![ColumnValue::Null], vec![ColumnValue::Int(2)]).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn probe_prefix_live_finds_only_matching_non_deleted_entries() {
        let idx = SecondaryIndex::new("ix_parent", "child", false, false, 1);
        idx.insert(vec![ColumnValue::Int(1), ColumnValue::Int(100)], vec![ColumnValue::Int(10)]).unwrap();
        idx.insert(vec![ColumnValue::Int(1), ColumnValue::Int(200)], vec![ColumnValue::Int(11)]).unwrap();
        idx.insert(vec![ColumnValue::Int(2), ColumnValue::Int(300)], vec![ColumnValue::Int(12)]).unwrap();
        idx.delete_mark(&vec![ColumnValue::Int(1), ColumnValue::Int(200)], &vec![ColumnValue::Int(11)]).unwrap();

        let found = idx.probe_prefix_live(&[ColumnValue::Int(1)]);
        assert_eq!(found, vec![vec![ColumnValue::Int(10)]]);

        let none = idx.probe_prefix_live(&[ColumnValue::Int(3)]);
        assert!(none.is_empty());
    }

    #[test]
    fn insert_by_modify_over_delete_marked_slot() {
        let idx = SecondaryIndex::new("ux", "t", true, false, 1);
        idx.insert(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(10)]).unwrap();
        idx.delete_mark(&vec![ColumnValue::Int(1)], &vec![ColumnValue::Int(10)]).unwrap();
        idx.insert(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(20)]).unwrap();
        let live = idx.scan_live();
        assert_eq!(live, vec![(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(20)])]);
    }
}
