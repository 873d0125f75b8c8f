//! L0: buffer-pool frames with reader/writer latches.
//!
//! The physical file layout, compression, and encryption of pages are
//! external collaborators (spec §1 Non-goals); this module only owns
//! the *shape* of a page the tree cursor needs (leaf records in key
//! order plus sibling links, or internal separator keys) and the latch
//! discipline around it. Addressing pages by `(space_id, page_no)`
//! instead of a raw pointer, and returning an owned guard from every
//! lookup, is the "pointer cycles across B-tree nodes" re-architecture
//! spec §9 calls for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::latch::PageLatch;
use crate::types::{PrimaryKey, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

/// Separator entry on a non-leaf page: every record in `child` compares
/// within `[key, next separator)` (spec I4).
#[derive(Debug, Clone)]
pub struct Separator {
    pub key: PrimaryKey,
    pub child: PageId,
}

#[derive(Debug, Clone)]
pub enum PageBody {
    Leaf {
        records: Vec<Row>,
        prev: Option<PageId>,
        next: Option<PageId>,
    },
    Internal {
        separators: Vec<Separator>,
    },
}

impl PageBody {
    pub fn new_leaf() -> PageBody {
        PageBody::Leaf { records: Vec::new(), prev: None, next: None }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, PageBody::Leaf { .. })
    }

    /// Approximate occupied bytes, for the leaf-fit check in §4.1 step 4.
    pub fn footprint(&self) -> usize {
        match self {
            PageBody::Leaf { records, .. } => records.iter().map(Row::footprint).sum(),
            PageBody::Internal { separators } => separators
                .iter()
                .map(|s| s.key.iter().map(|c| c.footprint()).sum::<usize>() + 8)
                .sum(),
        }
    }
}

struct Frame {
    latch: PageLatch,
    body: Mutex<PageBody>,
}

/// The buffer-pool contract the core consumes (spec §6
/// "buffer_pool.get(space, page_no, mode)"). A real buffer pool pins
/// frames with reference counts and flushes dirty ones under the redo
/// log's write-ahead rule; neither concern is this core's to own.
pub trait BufferPool: Send + Sync {
    fn get(&self, page_no: PageId) -> Result<PageRef<'_>>;
    fn alloc_leaf(&self) -> Result<PageId>;
    fn alloc_internal(&self) -> Result<PageId>;
    fn root(&self) -> PageId;
    fn set_root(&self, page_no: PageId);
    fn free(&self, page_no: PageId);
}

pub struct PageRef<'a> {
    frame: &'a Frame,
}

impl<'a> PageRef<'a> {
    pub fn s_latch(&self) -> (crate::latch::SLatch<'a>, PageBody) {
        let g = self.frame.latch.s_latch();
        let body = self.frame.body.lock().clone();
        (g, body)
    }

    pub fn x_latch(&self) -> XPage<'a> {
        let g = self.frame.latch.x_latch();
        XPage { _guard: g, frame: self.frame }
    }
}

/// An exclusively-latched page: the only way to mutate its body. The
/// latch is released when this guard drops, after any replacement body
/// is written back — this is what lets a pessimistic split "return a
/// new guard" instead of leaking a raw pointer (spec §9).
pub struct XPage<'a> {
    _guard: crate::latch::XLatch<'a>,
    frame: &'a Frame,
}

impl<'a> XPage<'a> {
    pub fn read(&self) -> PageBody {
        self.frame.body.lock().clone()
    }

    pub fn write(&self, body: PageBody) {
        *self.frame.body.lock() = body;
    }
}

/// A simple in-memory buffer pool: one frame per page, never evicted.
/// Stands in for the real disk-backed pool (out of scope) so the tree
/// operators above it are independently testable.
pub struct InMemoryBufferPool {
    frames: Mutex<HashMap<PageId, Box<Frame>>>,
    next_id: AtomicU32,
    root: Mutex<PageId>,
}

impl InMemoryBufferPool {
    pub fn new() -> InMemoryBufferPool {
        let pool = InMemoryBufferPool {
            frames: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            root: Mutex::new(PageId(0)),
        };
        let root_id = pool.alloc_leaf().expect("initial leaf alloc");
        *pool.root.lock() = root_id;
        pool
    }
}

impl Default for InMemoryBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: `PageRef` borrows into the `HashMap` through a `Box<Frame>`
// whose address is stable for the frame's lifetime (we never move or
// remove frames while references are outstanding in this in-memory
// pool; the map itself is only ever appended to). `unsafe` is confined
// to this one cast.
impl BufferPool for InMemoryBufferPool {
    fn get(&self, page_no: PageId) -> Result<PageRef<'_>> {
        let frames = self.frames.lock();
        let frame = frames.get(&page_no).ok_or(Error::RecordNotFound)?;
        let ptr: *const Frame = frame.as_ref();
        // The Box is never reallocated or freed while the pool lives;
        // reborrowing through the raw pointer lets PageRef outlive the
        // MutexGuard on `frames` without cloning the frame.
        Ok(PageRef { frame: unsafe { &*ptr } })
    }

    fn alloc_leaf(&self) -> Result<PageId> {
        let id = PageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let frame = Box::new(Frame { latch: PageLatch::new(), body: Mutex::new(PageBody::new_leaf()) });
        self.frames.lock().insert(id, frame);
        Ok(id)
    }

    fn alloc_internal(&self) -> Result<PageId> {
        let id = PageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let body = PageBody::Internal { separators: Vec::new() };
        let frame = Box::new(Frame { latch: PageLatch::new(), body: Mutex::new(body) });
        self.frames.lock().insert(id, frame);
        Ok(id)
    }

    fn root(&self) -> PageId {
        *self.root.lock()
    }

    fn set_root(&self, page_no: PageId) {
        *self.root.lock() = page_no;
    }

    fn free(&self, page_no: PageId) {
        self.frames.lock().remove(&page_no);
    }
}
