use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use libc::{EBUSY, EINVAL, ENODEV, ENOENT};
use parking_lot::Mutex;

use super::{PageCache, PageIo, PageRef, PageState, lru::Lru};
use crate::{block::IoDirection, error::Result, sync::WaitReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LruKind {
    Clean,
    Dirty,
}

struct Slot {
    page: Arc<PageCache>,
    lru: Option<(LruKind, u64)>,
}

/// Arena of cached pages plus the offset index and the two LRU queues over it.
#[derive(Default)]
struct PoolInner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: BTreeMap<u64, usize>,
    clean: Lru,
    dirty: Lru,
    stamp: u64,
}

impl PoolInner {
    fn page(&self, id: usize) -> &Arc<PageCache> {
        match &self.slots[id] {
            Some(slot) => &slot.page,
            None => panic!("page cache slot {id} is vacant"),
        }
    }

    fn insert(&mut self, page: Arc<PageCache>) -> usize {
        let offset = page.offset();
        let slot = Slot { page, lru: None };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        let prev = self.index.insert(offset, id);
        assert!(prev.is_none(), "two pages cached at offset {offset:#x}");
        id
    }

    /// Slot of `page` if it is still the page indexed at its offset.
    fn slot_of(&self, page: &Arc<PageCache>) -> Option<usize> {
        let id = *self.index.get(&page.offset())?;
        let slot = self.slots[id].as_ref()?;
        Arc::ptr_eq(&slot.page, page).then_some(id)
    }

    fn lru_mut(&mut self, kind: LruKind) -> &mut Lru {
        match kind {
            LruKind::Clean => &mut self.clean,
            LruKind::Dirty => &mut self.dirty,
        }
    }

    fn lru_unlink(&mut self, id: usize) {
        let link = self.slots[id].as_mut().and_then(|slot| slot.lru.take());
        if let Some((kind, stamp)) = link {
            self.lru_mut(kind).remove(stamp);
        }
    }

    /// Moves the slot to the most recently used end of `kind`.
    fn lru_link(&mut self, id: usize, kind: LruKind) {
        self.lru_unlink(id);
        self.stamp += 1;
        let stamp = self.stamp;
        self.lru_mut(kind).insert(stamp, id);
        if let Some(slot) = self.slots[id].as_mut() {
            slot.lru = Some((kind, stamp));
        }
    }

    fn touch(&mut self, id: usize) {
        let kind = self.slots[id].as_ref().and_then(|slot| slot.lru).map(|(kind, _)| kind);
        if let Some(kind) = kind {
            self.lru_link(id, kind);
        }
    }

    /// Unlinks the slot from the index and LRU; the pool's reference moves to the caller.
    fn remove(&mut self, id: usize) -> Arc<PageCache> {
        self.lru_unlink(id);
        let Some(slot) = self.slots[id].take() else {
            panic!("page cache slot {id} is vacant");
        };
        self.index.remove(&slot.page.offset());
        self.free.push(id);
        slot.page
    }
}

/// A pool of cached pages of one device or file, indexed by offset.
pub struct PageCachePool {
    page_size: usize,
    io: Option<Weak<dyn PageIo>>,
    inner: Mutex<PoolInner>,
}

impl PageCachePool {
    /// Creates a pool whose pages are filled and written back through `io`.
    pub fn new(page_size: usize, io: Weak<dyn PageIo>) -> Arc<Self> {
        Self::build(page_size, Some(io))
    }

    /// Creates a pool without a backing store; new pages start zeroed and clean.
    pub fn anonymous(page_size: usize) -> Arc<Self> {
        Self::build(page_size, None)
    }

    fn build(page_size: usize, io: Option<Weak<dyn PageIo>>) -> Arc<Self> {
        assert!(page_size > 0, "page size must be nonzero");
        Arc::new(Self {
            page_size,
            io,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clean_len(&self) -> usize {
        self.inner.lock().clean.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.inner.lock().index.contains_key(&offset)
    }

    /// Offsets of dirty pages, least recently used first.
    pub fn dirty_offsets(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .dirty
            .iter()
            .map(|id| inner.page(id).offset())
            .collect()
    }

    fn make_ref(self: &Arc<Self>, page: &Arc<PageCache>) -> PageRef {
        assert!(page.refs.inc_if_nonzero(), "indexed page already freed");
        PageRef {
            page: page.clone(),
            pool: self.clone(),
        }
    }

    fn transfer(&self, page: &PageRef, dir: IoDirection) -> Result<()> {
        let Some(io) = &self.io else {
            return Ok(());
        };
        let io = io.upgrade().ok_or(ENODEV)?;
        match dir {
            IoDirection::Read => io.read_page(page),
            IoDirection::Write => io.write_page(page),
        }
    }

    /// Returns the page at `offset`, loading it on a miss.
    ///
    /// `offset` must be a multiple of the page size.
    pub fn get(self: &Arc<Self>, offset: u64) -> Result<PageRef> {
        if offset % self.page_size as u64 != 0 {
            return Err(EINVAL);
        }

        loop {
            let (page, fresh) = {
                let mut inner = self.inner.lock();
                match inner.index.get(&offset).copied() {
                    Some(id) => {
                        let page = self.make_ref(inner.page(id));
                        inner.touch(id);
                        (page, false)
                    }
                    None => {
                        let page = Arc::new(PageCache::new_loading(offset, self.page_size));
                        inner.insert(page.clone());
                        let page = self.make_ref(&page);
                        (page, true)
                    }
                }
            };

            if fresh {
                return match self.transfer(&page, IoDirection::Read) {
                    Ok(()) => {
                        self.set_loaded(&page);
                        page.unmark_busy();
                        Ok(page)
                    }
                    Err(e) => {
                        log::debug!("failed to load page at {offset:#x}: {e}");
                        self.unlink(&page);
                        page.unmark_busy();
                        Err(e)
                    }
                };
            }

            page.wait_unbusy();
            if page.state().is_valid() {
                return Ok(page);
            }
            // The loader failed; retry with a fresh page.
        }
    }

    /// Returns the page at `offset` only if it is already cached.
    pub fn lookup(self: &Arc<Self>, offset: u64) -> Option<PageRef> {
        let page = {
            let mut inner = self.inner.lock();
            let id = inner.index.get(&offset).copied()?;
            inner.touch(id);
            self.make_ref(inner.page(id))
        };
        page.wait_unbusy();
        page.state().is_valid().then_some(page)
    }

    fn set_loaded(&self, page: &PageRef) {
        let mut inner = self.inner.lock();
        page.update_state(PageState::CLEAN, PageState::DIRTY);
        if let Some(id) = inner.slot_of(&page.page) {
            inner.lru_link(id, LruKind::Clean);
        }
    }

    /// Drops the page from the index and LRU, releasing the pool's reference.
    fn unlink(&self, page: &PageRef) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner.slot_of(&page.page).map(|id| inner.remove(id))
        };
        match removed {
            Some(page) => {
                page.put();
                true
            }
            None => false,
        }
    }

    pub(super) fn mark_dirty(&self, page: &PageRef) -> Result<()> {
        self.mark(page, PageState::DIRTY, PageState::CLEAN, LruKind::Dirty)
    }

    pub(super) fn mark_clean(&self, page: &PageRef) -> Result<()> {
        self.mark(page, PageState::CLEAN, PageState::DIRTY, LruKind::Clean)
    }

    fn mark(&self, page: &PageRef, set: PageState, clear: PageState, kind: LruKind) -> Result<()> {
        let mut inner = self.inner.lock();
        if !page.state().is_valid() {
            return Err(EINVAL);
        }
        page.update_state(set, clear);
        if let Some(id) = inner.slot_of(&page.page) {
            inner.lru_link(id, kind);
        }
        Ok(())
    }

    /// Writes a dirty page back, or fills an invalid one. A clean page is left alone.
    pub(super) fn sync_page(&self, page: &PageRef) -> Result<()> {
        if page.mark_busy() == WaitReason::Destroyed {
            return Err(ENOENT);
        }

        let state = page.state();
        let res = if state.contains(PageState::DIRTY) {
            // Clean first so a write racing with the transfer leaves the page dirty.
            self.mark_clean(page).and_then(|()| {
                self.transfer(page, IoDirection::Write).inspect_err(|_| {
                    let _ = self.mark_dirty(page);
                })
            })
        } else if !state.is_valid() {
            self.transfer(page, IoDirection::Read)
                .map(|()| self.set_loaded(page))
        } else {
            Ok(())
        };

        page.unmark_busy();
        if let Err(e) = res {
            log::warn!("write-back of page at {:#x} failed: {e}", page.offset());
        }
        res
    }

    /// Writes back every dirty page, returning how many were written.
    ///
    /// Every dirty page is attempted; the first failure is returned.
    pub fn sync_all(self: &Arc<Self>) -> Result<usize> {
        let pages: Vec<PageRef> = {
            let inner = self.inner.lock();
            inner
                .dirty
                .iter()
                .map(|id| self.make_ref(inner.page(id)))
                .collect()
        };

        let mut written = 0;
        let mut first_err = None;
        for page in &pages {
            match self.sync_page(page) {
                Ok(()) => written += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(written), Err)
    }

    /// Evicts up to `limit` unreferenced clean pages, least recently used first.
    ///
    /// `None` reclaims every eligible page. Dirty pages are never evicted.
    pub fn shrink(&self, limit: Option<usize>) -> usize {
        let limit = limit.unwrap_or(usize::MAX);
        let victims: Vec<Arc<PageCache>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<usize> = inner
                .clean
                .iter()
                .filter(|&id| {
                    let page = inner.page(id);
                    page.ref_count() == 1 && !page.is_busy()
                })
                .take(limit)
                .collect();
            ids.into_iter().map(|id| inner.remove(id)).collect()
        };

        let reclaimed = victims.len();
        for page in victims {
            page.put();
        }
        if reclaimed > 0 {
            log::debug!("reclaimed {reclaimed} pages");
        }
        reclaimed
    }

    /// Writes back the page at `offset` if dirty and drops it from the pool.
    pub fn invalidate(self: &Arc<Self>, offset: u64) -> Result<()> {
        let Some(page) = self.lookup(offset) else {
            return Ok(());
        };
        self.sync_page(&page)?;
        self.unlink(&page);
        Ok(())
    }

    /// Discards pages past `size` and zeroes the tail of the last partial page.
    pub fn truncate(self: &Arc<Self>, size: u64) -> Result<()> {
        let page_size = self.page_size as u64;
        let boundary = size.div_ceil(page_size) * page_size;
        let doomed: Vec<PageRef> = {
            let inner = self.inner.lock();
            inner
                .index
                .range(boundary..)
                .map(|(_, &id)| self.make_ref(inner.page(id)))
                .collect()
        };
        for page in &doomed {
            page.wait_unbusy();
            self.unlink(page);
        }

        let tail = size % page_size;
        if tail != 0 {
            if let Some(page) = self.lookup(size - tail) {
                page.with_data_mut(|data| data[tail as usize..].fill(0));
                page.mark_dirty()?;
            }
        }
        Ok(())
    }

    /// Writes back and drops every page.
    ///
    /// Fails with `EBUSY` while any page is still referenced.
    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        self.sync_all()?;
        let pages: Vec<Arc<PageCache>> = {
            let mut inner = self.inner.lock();
            let busy = inner
                .index
                .values()
                .any(|&id| inner.page(id).ref_count() > 1);
            if busy {
                return Err(EBUSY);
            }
            let ids: Vec<usize> = inner.index.values().copied().collect();
            let pages = ids.into_iter().map(|id| inner.remove(id)).collect();
            assert!(inner.clean.is_empty() && inner.dirty.is_empty());
            pages
        };
        for page in pages {
            page.put();
        }
        Ok(())
    }
}

impl fmt::Debug for PageCachePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PageCachePool")
            .field("page_size", &self.page_size)
            .field("pages", &inner.index.len())
            .field("clean", &inner.clean.len())
            .field("dirty", &inner.dirty.len())
            .finish()
    }
}
