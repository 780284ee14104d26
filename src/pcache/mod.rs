//! Pools of fixed-size cached pages with clean/dirty tracking and LRU reclamation.

mod lru;
pub mod pool;

#[cfg(test)]
mod tests;

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::{
    block::buf::BlockBuffer,
    error::Result,
    sync::{RefCount, WaitQueue, WaitReason},
};

pub use pool::PageCachePool;

/// Default size of a cached page in bytes.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// State bits of a cached page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageState: u8 {
        const BUSY = 1;
        const CLEAN = 2;
        const DIRTY = 4;
    }
}

impl PageState {
    /// A page is valid iff exactly one of `CLEAN` and `DIRTY` is set.
    pub fn is_valid(self) -> bool {
        self.contains(Self::CLEAN) != self.contains(Self::DIRTY)
    }

    fn check(self) -> Self {
        assert!(
            !self.contains(Self::CLEAN | Self::DIRTY),
            "page both clean and dirty"
        );
        self
    }
}

/// Transfers page contents between a pool and its backing store.
pub trait PageIo: Send + Sync {
    /// Fills `page` from the backing store.
    fn read_page(&self, page: &PageRef) -> Result<()>;

    /// Writes `page` back to the backing store.
    fn write_page(&self, page: &PageRef) -> Result<()>;
}

/// One cached page.
pub struct PageCache {
    offset: u64,
    state: AtomicU8,
    refs: RefCount,
    data: Mutex<Box<[u8]>>,
    buffers: Mutex<Vec<BlockBuffer>>,
    wait: WaitQueue,
}

impl PageCache {
    /// A page that is loading; the creator owns its busy bit.
    fn new_loading(offset: u64, size: usize) -> Self {
        Self {
            offset,
            state: AtomicU8::new(PageState::BUSY.bits()),
            refs: RefCount::new(),
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
            buffers: Mutex::new(Vec::new()),
            wait: WaitQueue::new(),
        }
    }

    /// Offset of the page within its pool.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the page in bytes.
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    pub fn state(&self) -> PageState {
        PageState::from_bits_truncate(self.state.load(Ordering::Acquire)).check()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().contains(PageState::DIRTY)
    }

    pub fn is_busy(&self) -> bool {
        self.state().contains(PageState::BUSY)
    }

    /// Number of references, including the pool's own while the page is cached.
    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// Mutates the page contents without touching its state.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Block buffers mapped onto this page.
    pub fn buffers(&self) -> Vec<BlockBuffer> {
        self.buffers.lock().clone()
    }

    pub(crate) fn buffers_mut(&self) -> parking_lot::MutexGuard<'_, Vec<BlockBuffer>> {
        self.buffers.lock()
    }

    fn update_state(&self, set: PageState, clear: PageState) -> PageState {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let next = (PageState::from_bits_truncate(cur) - clear) | set;
            match self.state.compare_exchange_weak(
                cur,
                next.check().bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return PageState::from_bits_truncate(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    fn try_mark_busy(&self) -> bool {
        let prev = self.state.fetch_or(PageState::BUSY.bits(), Ordering::AcqRel);
        prev & PageState::BUSY.bits() == 0
    }

    /// Claims the busy bit, waiting for the current holder to release it.
    fn mark_busy(&self) -> WaitReason {
        self.wait.wait_while(|| !self.try_mark_busy(), None)
    }

    fn unmark_busy(&self) {
        self.update_state(PageState::empty(), PageState::BUSY);
        self.wait.wake(WaitReason::Released);
    }

    fn wait_unbusy(&self) -> WaitReason {
        self.wait.wait_while(|| self.is_busy(), None)
    }

    /// Releases the page once the last reference is gone.
    fn free(&self) {
        self.buffers.lock().clear();
        self.wait.wake(WaitReason::Destroyed);
        log::trace!("page at {:#x} freed", self.offset);
    }

    fn put(&self) {
        if self.refs.dec_and_test() {
            self.free();
        }
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("offset", &self.offset)
            .field("state", &self.state())
            .field("refs", &self.refs.get())
            .finish()
    }
}

/// A counted reference to a cached page.
///
/// Dropping the reference is `put`.
pub struct PageRef {
    page: Arc<PageCache>,
    pool: Arc<PageCachePool>,
}

impl PageRef {
    pub fn pool(&self) -> &Arc<PageCachePool> {
        &self.pool
    }

    pub(crate) fn page_arc(&self) -> &Arc<PageCache> {
        &self.page
    }

    /// Returns `true` if both references name the same page.
    pub fn ptr_eq(&self, other: &PageRef) -> bool {
        Arc::ptr_eq(&self.page, &other.page)
    }

    /// Copies page bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.with_data(|data| {
            let src = data
                .get(offset..offset + buf.len())
                .ok_or(libc::EINVAL)?;
            buf.copy_from_slice(src);
            Ok(())
        })
    }

    /// Copies `buf` into the page at `offset` and marks it dirty.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.with_data_mut(|data| {
            let dst = data
                .get_mut(offset..offset + buf.len())
                .ok_or(libc::EINVAL)?;
            dst.copy_from_slice(buf);
            Ok::<_, libc::c_int>(())
        })?;
        self.mark_dirty()
    }

    pub fn mark_dirty(&self) -> Result<()> {
        self.pool.mark_dirty(self)
    }

    pub fn mark_clean(&self) -> Result<()> {
        self.pool.mark_clean(self)
    }

    /// Writes the page back if dirty, or fills it if invalid.
    pub fn sync(&self) -> Result<()> {
        self.pool.sync_page(self)
    }
}

impl Deref for PageRef {
    type Target = PageCache;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        assert!(self.page.refs.inc_if_nonzero(), "clone of a freed page");
        Self {
            page: self.page.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.page.put();
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.page.fmt(f)
    }
}
