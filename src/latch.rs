//! Page and index latches (spec L0, §5 "Synchronization primitives").
//!
//! A single-writer/many-reader latch built as a door with RAII
//! `Reader`/`Writer` guards whose `Drop` releases the permission, the
//! shape a hand-rolled spinlock would take if it were one `AtomicU64`
//! with a latch bit, a lock bit, and a reader count. Here it's built on
//! `parking_lot::RwLock`, which already gives the "update" mode
//! (`upgradable_read`) that index latches need (§5: "plus an
//! intermediate 'update' mode that may be upgraded to X without
//! releasing readers") without reimplementing CAS spinning.

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

/// A single-writer/many-reader latch on one buffer-pool frame.
pub struct PageLatch {
    door: RwLock<()>,
}

impl Default for PageLatch {
    fn default() -> Self {
        PageLatch { door: RwLock::new(()) }
    }
}

impl PageLatch {
    pub fn new() -> PageLatch {
        Self::default()
    }

    pub fn s_latch(&self) -> SLatch<'_> {
        SLatch(self.door.read())
    }

    pub fn x_latch(&self) -> XLatch<'_> {
        XLatch(self.door.write())
    }
}

pub struct SLatch<'a>(RwLockReadGuard<'a, ()>);
pub struct XLatch<'a>(RwLockWriteGuard<'a, ()>);

/// A single-writer/many-reader latch on one B-tree, with an
/// "update" mode used by the FK checker and the online-build applier
/// (spec §4.4: "the applier holds the X-latch on the index only while
/// consuming the final in-memory block").
pub struct IndexLatch {
    door: RwLock<()>,
}

impl Default for IndexLatch {
    fn default() -> Self {
        IndexLatch { door: RwLock::new(()) }
    }
}

impl IndexLatch {
    pub fn new() -> IndexLatch {
        Self::default()
    }

    pub fn s_latch(&self) -> SLatch<'_> {
        SLatch(self.door.read())
    }

    pub fn x_latch(&self) -> XLatch<'_> {
        XLatch(self.door.write())
    }

    /// Acquire in "update" mode: other readers may still proceed, but no
    /// other writer/updater may enter until this is dropped or upgraded.
    pub fn u_latch(&self) -> ULatch<'_> {
        ULatch(self.door.upgradable_read())
    }
}

pub struct ULatch<'a>(RwLockUpgradableReadGuard<'a, ()>);

impl<'a> ULatch<'a> {
    pub fn upgrade(self) -> XLatch<'a> {
        XLatch(RwLockUpgradableReadGuard::upgrade(self.0))
    }
}
