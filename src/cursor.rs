//! L3: tree cursor — binary search within a page, root-to-leaf descent,
//! leaf sibling walk.
//!
//! Spec §9 calls out "deep inheritance for B-tree cursor / bulk cursor /
//! scrub cursor" as a pattern to replace with one cursor struct plus
//! small capability traits. `Searchable` is implemented once here;
//! `clustered.rs` (writer), `bulk.rs` (loader) and `scrubber.rs` each
//! consume it through that one trait rather than subclassing a cursor
//! hierarchy.

use crate::error::{Error, Result};
use crate::page::{BufferPool, PageBody, PageId, Separator};
use crate::types::{PrimaryKey, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Ge,
    Le,
    Exact,
}

/// Capability shared by every cursor-consuming component: descend to
/// the leaf that would contain `key`.
pub trait Searchable {
    fn find_leaf(&self, pool: &dyn BufferPool, key: &PrimaryKey) -> Result<LeafPath>;
    fn first_leaf(&self, pool: &dyn BufferPool) -> Result<PageId>;
    fn next_leaf(&self, pool: &dyn BufferPool, leaf: PageId) -> Result<Option<PageId>>;
}

/// Result of a root-to-leaf descent: the destination leaf plus the full
/// chain of ancestor internal pages, needed by a pessimistic split to
/// propagate a new separator upward (spec §4.1 step 4).
#[derive(Debug, Clone)]
pub struct LeafPath {
    pub leaf: PageId,
    pub ancestors: Vec<PageId>, // root..=parent, in descent order
}

/// Binary search a leaf's records for `key`. Ok(i) means an exact match
/// at slot i; Err(i) means no match, insert/descend at slot i (spec §3
/// I4: leaves are kept in strictly ascending key order).
pub fn search_leaf(records: &[Row], key: &PrimaryKey) -> std::result::Result<usize, usize> {
    records.binary_search_by(|r| r.primary_key.cmp(key))
}

fn search_internal(separators: &[Separator], key: &PrimaryKey) -> usize {
    // find the last separator whose key <= the search key; that child
    // owns the range containing `key` (spec I4: separator keys ascend,
    // each child's range is contained in the separator interval).
    match separators.binary_search_by(|s| s.key.cmp(key)) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

pub struct TreeCursor;

impl Searchable for TreeCursor {
    fn find_leaf(&self, pool: &dyn BufferPool, key: &PrimaryKey) -> Result<LeafPath> {
        let mut ancestors = Vec::new();
        let mut current = pool.root();
        loop {
            let page_ref = pool.get(current)?;
            let (_s, body) = page_ref.s_latch();
            match body {
                PageBody::Leaf { .. } => {
                    return Ok(LeafPath { leaf: current, ancestors });
                }
                PageBody::Internal { separators } => {
                    if separators.is_empty() {
                        return Err(Error::Corruption {
                            index: "<tree>".into(),
                            detail: "internal page with no separators".into(),
                        });
                    }
                    let idx = search_internal(&separators, key);
                    ancestors.push(current);
                    current = separators[idx].child;
                }
            }
        }
    }

    fn first_leaf(&self, pool: &dyn BufferPool) -> Result<PageId> {
        let mut current = pool.root();
        loop {
            let page_ref = pool.get(current)?;
            let (_s, body) = page_ref.s_latch();
            match body {
                PageBody::Leaf { .. } => return Ok(current),
                PageBody::Internal { separators } => {
                    current = separators.first().ok_or(Error::Corruption {
                        index: "<tree>".into(),
                        detail: "internal page with no separators".into(),
                    })?.child;
                }
            }
        }
    }

    fn next_leaf(&self, pool: &dyn BufferPool, leaf: PageId) -> Result<Option<PageId>> {
        let page_ref = pool.get(leaf)?;
        let (_s, body) = page_ref.s_latch();
        match body {
            PageBody::Leaf { next, .. } => Ok(next),
            PageBody::Internal { .. } => Err(Error::Corruption {
                index: "<tree>".into(),
                detail: "next_leaf called on internal page".into(),
            }),
        }
    }
}
