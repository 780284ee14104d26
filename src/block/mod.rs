pub mod allocator;
pub mod bio;
pub mod buf;
pub mod registry;
pub mod storage;

pub use allocator::Allocator;
pub use allocator::bitmap::BitmapAllocator;
pub use registry::DeviceRegistry;

use std::{
    fmt,
    sync::{Arc, Weak},
};

use libc::{EBUSY, EINVAL, ENOENT};
use parking_lot::Mutex;

use crate::{
    error::Result,
    pcache::{PAGE_SIZE, PageCache, PageCachePool, PageIo, PageRef},
};

/// Smallest sector size a device may report.
pub const SECTOR_SIZE_MIN: u32 = 512;

/// Identifies a block device by its major and minor numbers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevId(u64);

impl DevId {
    pub const INVALID: Self = Self(0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self(((major as u64) << 32) | minor as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn major(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn minor(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevId({}:{})", self.major(), self.minor())
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Transfer direction of a device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Sizes of a block device. All values are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub block_size: u32,
    pub capacity: u64,
}

impl Geometry {
    pub fn new(sector_size: u32, block_size: u32, capacity: u64) -> Self {
        Self {
            sector_size,
            block_size,
            capacity,
        }
    }

    /// Checks the size invariants against pages of `page_size` bytes.
    pub fn validate(&self, page_size: usize) -> Result<()> {
        let sector = self.sector_size;
        let block = self.block_size;
        if sector < SECTOR_SIZE_MIN || sector % SECTOR_SIZE_MIN != 0 {
            return Err(EINVAL);
        }
        if block < sector || block % sector != 0 {
            return Err(EINVAL);
        }
        if page_size % block as usize != 0 {
            return Err(EINVAL);
        }
        if self.capacity % sector as u64 != 0 {
            return Err(EINVAL);
        }
        Ok(())
    }

    /// Number of whole blocks the device holds.
    pub fn block_count(&self) -> u64 {
        self.capacity / self.block_size as u64
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(SECTOR_SIZE_MIN, PAGE_SIZE as u32, 0)
    }
}

/// Driver side of a block device.
pub trait DeviceOps: Send + Sync {
    /// Transfers every block buffer mapped on `page` in direction `dir`.
    ///
    /// A read fills the page from the device; a write flushes it to the device.
    fn strategy(&self, devid: DevId, page: &PageCache, dir: IoDirection) -> Result<()>;
}

/// A registered block device.
///
/// Handles are shared; the device is torn down once it is unregistered and the last handle is
/// dropped.
pub struct BlockDevice {
    id: DevId,
    geometry: Mutex<Geometry>,
    ops: Arc<dyn DeviceOps>,
    pool: Mutex<Option<Arc<PageCachePool>>>,
    queue: bio::RequestQueue,
    page_size: usize,
    this: Weak<BlockDevice>,
}

impl BlockDevice {
    pub(crate) fn new(
        id: DevId,
        geometry: Geometry,
        ops: Arc<dyn DeviceOps>,
        page_size: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<BlockDevice>| {
            let io: Weak<dyn PageIo> = this.clone();
            Self {
                id,
                geometry: Mutex::new(geometry),
                ops,
                pool: Mutex::new(Some(PageCachePool::new(page_size, io))),
                queue: bio::RequestQueue::default(),
                page_size,
                this: this.clone(),
            }
        })
    }

    pub fn id(&self) -> DevId {
        self.id
    }

    pub fn geometry(&self) -> Geometry {
        *self.geometry.lock()
    }

    pub fn sector_size(&self) -> u32 {
        self.geometry.lock().sector_size
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.lock().block_size
    }

    pub fn capacity(&self) -> u64 {
        self.geometry.lock().capacity
    }

    /// Size of the pages this device caches.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn update_geometry(&self, f: impl FnOnce(&mut Geometry)) -> Result<()> {
        let mut geometry = self.geometry.lock();
        let mut next = *geometry;
        f(&mut next);
        next.validate(self.page_size)?;
        *geometry = next;
        Ok(())
    }

    pub fn set_sector_size(&self, sector_size: u32) -> Result<()> {
        self.update_geometry(|g| g.sector_size = sector_size)
    }

    /// Changes the block size. Cached pages keep buffers of the old size, so this fails with
    /// `EBUSY` while any are cached.
    pub fn set_block_size(&self, block_size: u32) -> Result<()> {
        if self.pool.lock().as_ref().is_some_and(|pool| !pool.is_empty()) {
            return Err(EBUSY);
        }
        self.update_geometry(|g| g.block_size = block_size)
    }

    pub fn set_capacity(&self, capacity: u64) -> Result<()> {
        self.update_geometry(|g| g.capacity = capacity)
    }

    /// Creates an empty pool backed by this device.
    pub fn new_page_cache_pool(&self) -> Arc<PageCachePool> {
        let io: Weak<dyn PageIo> = self.this.clone();
        PageCachePool::new(self.page_size, io)
    }

    /// The attached page-cache pool.
    pub fn page_cache_pool(&self) -> Result<Arc<PageCachePool>> {
        self.pool.lock().clone().ok_or(ENOENT)
    }

    /// Attaches `pool`. Fails with `EBUSY` if a pool is already attached.
    pub fn set_page_cache_pool(&self, pool: Arc<PageCachePool>) -> Result<()> {
        if pool.page_size() % self.block_size() as usize != 0 {
            return Err(EINVAL);
        }
        let mut slot = self.pool.lock();
        if slot.is_some() {
            return Err(EBUSY);
        }
        *slot = Some(pool);
        Ok(())
    }

    /// Detaches the current pool.
    pub fn take_page_cache_pool(&self) -> Option<Arc<PageCachePool>> {
        self.pool.lock().take()
    }

    /// Returns the cached device page at `offset`, reading it on a miss.
    pub fn page_cache_get(&self, offset: u64) -> Result<PageRef> {
        self.page_cache_pool()?.get(offset)
    }

    /// Writes back every dirty page of the attached pool.
    pub fn flush(&self) -> Result<usize> {
        let pool = self.pool.lock().clone();
        match pool {
            Some(pool) => pool.sync_all(),
            None => Ok(0),
        }
    }

    /// Fails queued requests and drains the pool.
    pub(crate) fn shutdown(&self) {
        self.queue.abort(libc::ENODEV);
        if let Some(pool) = self.take_page_cache_pool() {
            if let Err(e) = pool.destroy() {
                log::warn!("device {}: page cache not drained: {e}", self.id);
            }
        }
    }

    fn transfer(&self, page: &PageRef, dir: IoDirection) -> Result<()> {
        buf::map_to_page(page, &self.geometry());
        self.ops.strategy(self.id, page, dir)
    }
}

impl PageIo for BlockDevice {
    fn read_page(&self, page: &PageRef) -> Result<()> {
        self.transfer(page, IoDirection::Read)
    }

    fn write_page(&self, page: &PageRef) -> Result<()> {
        self.transfer(page, IoDirection::Write)
    }
}

impl fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDevice")
            .field("id", &self.id)
            .field("geometry", &self.geometry())
            .finish()
    }
}
