//! Scoped handles over pinned pages.
//!
//! A guard owns exactly one pin and, for the read/write variants, the
//! frame's latch in the matching mode. Dropping a guard releases the latch
//! first and then returns the pin, so a page is never unpinned while its
//! bytes are still borrowed. Upgrades move the pin between variants; the
//! source is left empty and drops as a no-op.

use crate::buffer::pool::{BufferPoolManager, FrameRef};
use crate::disk::manager::PageData;
use crate::page::PageId;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Pin on a page without a latch.
///
/// Use [`upgrade_read`](Self::upgrade_read) /
/// [`upgrade_write`](Self::upgrade_write) to latch the page for the rest
/// of the guard's life, or [`data`](Self::data) for short-lived access.
pub struct PageGuard {
    core: Option<GuardCore>,
}

struct GuardCore {
    pool: BufferPoolManager,
    payload: Arc<RwLock<PageData>>,
    page_id: PageId,
    is_dirty: bool,
}

impl PageGuard {
    pub(crate) fn new(pool: BufferPoolManager, frame: &FrameRef) -> Self {
        Self {
            core: Some(GuardCore {
                pool,
                payload: frame.payload_arc(),
                page_id: frame.page_id(),
                is_dirty: false,
            }),
        }
    }

    fn empty() -> Self {
        Self { core: None }
    }

    /// True when this guard owns nothing (its pin was upgraded away).
    pub fn is_empty(&self) -> bool {
        self.core.is_none()
    }

    pub fn page_id(&self) -> PageId {
        self.core().page_id
    }

    pub fn is_dirty(&self) -> bool {
        self.core().is_dirty
    }

    /// Marks the page dirty for the unpin this guard performs on drop.
    pub fn set_dirty(&mut self) {
        self.core_mut().is_dirty = true;
    }

    /// The frame's payload latch, for access without upgrading.
    pub fn data(&self) -> &RwLock<PageData> {
        &self.core().payload
    }

    /// Acquires the read latch, then moves the pin into a read guard.
    /// Upgrading an empty guard yields an empty guard.
    pub fn upgrade_read(mut self) -> PageReadGuard {
        let Some(core) = self.core.take() else {
            return PageReadGuard {
                latch: None,
                guard: PageGuard::empty(),
            };
        };
        let latch = core.payload.read_arc();
        PageReadGuard {
            latch: Some(latch),
            guard: PageGuard { core: Some(core) },
        }
    }

    /// Acquires the write latch, then moves the pin into a write guard.
    /// Upgrading an empty guard yields an empty guard.
    pub fn upgrade_write(mut self) -> PageWriteGuard {
        let Some(core) = self.core.take() else {
            return PageWriteGuard {
                latch: None,
                guard: PageGuard::empty(),
            };
        };
        let latch = core.payload.write_arc();
        PageWriteGuard {
            latch: Some(latch),
            guard: PageGuard { core: Some(core) },
        }
    }

    fn core(&self) -> &GuardCore {
        self.core.as_ref().expect("guard is empty")
    }

    fn core_mut(&mut self) -> &mut GuardCore {
        self.core.as_mut().expect("guard is empty")
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.pool.unpin_page(core.page_id, core.is_dirty);
        }
    }
}

/// Pin plus shared latch. Dereferences to the page bytes.
pub struct PageReadGuard {
    // Declared before the pin so the latch releases first on drop.
    latch: Option<ArcRwLockReadGuard<RawRwLock, PageData>>,
    guard: PageGuard,
}

impl PageReadGuard {
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id()
    }
}

impl Deref for PageReadGuard {
    type Target = PageData;

    fn deref(&self) -> &PageData {
        self.latch.as_ref().expect("guard is empty")
    }
}

/// Pin plus exclusive latch. Dereferences to the page bytes; a mutable
/// dereference marks the page dirty.
pub struct PageWriteGuard {
    // Declared before the pin so the latch releases first on drop.
    latch: Option<ArcRwLockWriteGuard<RawRwLock, PageData>>,
    guard: PageGuard,
}

impl PageWriteGuard {
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id()
    }
}

impl Deref for PageWriteGuard {
    type Target = PageData;

    fn deref(&self) -> &PageData {
        self.latch.as_ref().expect("guard is empty")
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut PageData {
        if let Some(core) = self.guard.core.as_mut() {
            core.is_dirty = true;
        }
        self.latch.as_mut().expect("guard is empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::manager::DiskManager;
    use tempfile::{tempdir, TempDir};

    fn test_pool(pool_size: usize) -> (BufferPoolManager, TempDir) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::create(&dir.path().join("test.db")).unwrap();
        (BufferPoolManager::new(pool_size, disk, 2), dir)
    }

    #[test]
    fn test_guard_releases_pin_on_drop() {
        let (pool, _dir) = test_pool(2);

        let (page_id, guard) = pool.new_page_guarded().unwrap();
        assert_eq!(pool.pin_count(page_id), Some(1));

        drop(guard);
        assert_eq!(pool.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_basic_guard_dirty_flag_reaches_unpin() {
        let (pool, _dir) = test_pool(2);

        let (page_id, mut guard) = pool.new_page_guarded().unwrap();
        guard.data().write()[0] = 1;
        guard.set_dirty();
        drop(guard);

        assert_eq!(pool.is_dirty(page_id), Some(true));
    }

    #[test]
    fn test_write_guard_marks_dirty_on_mutation() {
        let (pool, _dir) = test_pool(2);

        let (page_id, guard) = pool.new_page_guarded().unwrap();
        drop(guard);

        let mut guard = pool.fetch_page_write(page_id).unwrap();
        guard[0..4].copy_from_slice(b"DATA");
        drop(guard);
        assert_eq!(pool.is_dirty(page_id), Some(true));
        assert_eq!(pool.pin_count(page_id), Some(0));

        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard[0..4], b"DATA");
        drop(guard);

        // Reading alone must not dirty the page.
        assert!(pool.flush_page(page_id).unwrap());
        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard[0..4], b"DATA");
        drop(guard);
        assert_eq!(pool.is_dirty(page_id), Some(false));
    }

    #[test]
    fn test_upgrade_keeps_the_pin() {
        let (pool, _dir) = test_pool(2);

        let (page_id, guard) = pool.new_page_guarded().unwrap();
        assert!(!guard.is_empty());

        let mut write_guard = guard.upgrade_write();
        assert_eq!(pool.pin_count(page_id), Some(1));
        write_guard[0] = 7;
        drop(write_guard);
        assert_eq!(pool.pin_count(page_id), Some(0));

        let basic = pool.fetch_page_basic(page_id).unwrap();
        let read_guard = basic.upgrade_read();
        assert_eq!(pool.pin_count(page_id), Some(1));
        assert_eq!(read_guard[0], 7);
        drop(read_guard);
        assert_eq!(pool.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_shared_read_guards_coexist() {
        let (pool, _dir) = test_pool(2);

        let (page_id, guard) = pool.new_page_guarded().unwrap();
        drop(guard);

        let first = pool.fetch_page_read(page_id).unwrap();
        let second = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(pool.pin_count(page_id), Some(2));
        assert_eq!(first[0], second[0]);

        drop(first);
        drop(second);
        assert_eq!(pool.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_guard_page_id() {
        let (pool, _dir) = test_pool(2);

        let (page_id, guard) = pool.new_page_guarded().unwrap();
        assert_eq!(guard.page_id(), page_id);

        let read_guard = guard.upgrade_read();
        assert_eq!(read_guard.page_id(), page_id);
    }
}
