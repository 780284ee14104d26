//! In-memory representatives of filesystem objects.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use bitflags::bitflags;
use libc::{ENOENT, ENOSYS};
use parking_lot::Mutex;

use crate::{
    block::IoDirection,
    error::{self, Result},
    pcache::{PageCachePool, PageIo, PageRef},
    sync::{WaitQueue, WaitReason},
    vfs::{FsCalls, FsContainer, FsSuper, FsVnode, Mode, Mount, Stat, StatMask, Vnid},
};

bitflags! {
    /// Status bits of a vnode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        const VALID = 1;
        /// Written since the last `fsync`.
        const DIRTY = 2;
        /// Held by a [`VnodeGuard`].
        const BUSY = 4;
        /// Unlinked while referenced; the driver removes it on the last release.
        const DELETE = 8;
    }
}

/// The driver handle of a vnode, shared with the vnode's page-cache pool.
struct VnodeIo {
    fs: Arc<FsContainer>,
    sb: FsSuper,
    fs_vnode: FsVnode,
}

impl PageIo for VnodeIo {
    fn read_page(&self, page: &PageRef) -> Result<()> {
        self.fs
            .calls()
            .strategy(&self.sb, &self.fs_vnode, page, IoDirection::Read)
            .map_err(error::coerce)
    }

    fn write_page(&self, page: &PageRef) -> Result<()> {
        self.fs
            .calls()
            .strategy(&self.sb, &self.fs_vnode, page, IoDirection::Write)
            .map_err(error::coerce)
    }
}

/// One loaded filesystem object.
///
/// Vnodes are shared through `Arc`. The mount indexes them weakly, so the last release unloads
/// the vnode: its cached pages are written back, the driver's `put_vnode` (or `remove_vnode`,
/// once deleted) is called, and only then is it unlinked from the index.
pub struct Vnode {
    id: Vnid,
    mount: Arc<Mount>,
    mode: Mode,
    io: Arc<VnodeIo>,
    flags: Mutex<VnodeFlags>,
    wait: WaitQueue,
    covered: Mutex<Weak<Mount>>,
    pcache: Mutex<Option<Arc<PageCachePool>>>,
    this: Weak<Vnode>,
}

impl Vnode {
    pub(crate) fn new(id: Vnid, mount: Arc<Mount>, fs_vnode: FsVnode, mode: Mode) -> Arc<Self> {
        let io = Arc::new(VnodeIo {
            fs: mount.fs().clone(),
            sb: mount.sb().clone(),
            fs_vnode,
        });
        Arc::new_cyclic(|this| Self {
            id,
            mount,
            mode,
            io,
            flags: Mutex::new(VnodeFlags::VALID),
            wait: WaitQueue::new(),
            covered: Mutex::new(Weak::new()),
            pcache: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> Vnid {
        self.id
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn flags(&self) -> VnodeFlags {
        *self.flags.lock()
    }

    pub fn calls(&self) -> &dyn FsCalls {
        self.io.fs.calls()
    }

    pub fn sb(&self) -> &FsSuper {
        &self.io.sb
    }

    pub fn fs_vnode(&self) -> &FsVnode {
        &self.io.fs_vnode
    }

    fn try_set_busy(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.contains(VnodeFlags::BUSY) {
            return false;
        }
        flags.insert(VnodeFlags::BUSY);
        true
    }

    /// Takes exclusive use of the vnode, waiting while another holder has it.
    pub fn lock(&self) -> VnodeGuard<'_> {
        while self.wait.wait_while(|| !self.try_set_busy(), None) != WaitReason::Released {}
        VnodeGuard { vnode: self }
    }

    /// Takes exclusive use of the vnode if no one else holds it.
    pub fn try_lock(&self) -> Option<VnodeGuard<'_>> {
        self.try_set_busy().then_some(VnodeGuard { vnode: self })
    }

    fn unlock(&self) {
        self.flags.lock().remove(VnodeFlags::BUSY);
        self.wait.wake(WaitReason::Released);
    }

    pub fn is_locked(&self) -> bool {
        self.flags().contains(VnodeFlags::BUSY)
    }

    /// Marks the vnode deleted; the driver removes it once the last reference is gone.
    pub fn mark_delete(&self) {
        self.flags.lock().insert(VnodeFlags::DELETE);
    }

    pub fn is_deleted(&self) -> bool {
        self.flags().contains(VnodeFlags::DELETE)
    }

    pub(crate) fn mark_dirty(&self) {
        self.flags.lock().insert(VnodeFlags::DIRTY);
    }

    pub(crate) fn clear_dirty(&self) {
        self.flags.lock().remove(VnodeFlags::DIRTY);
    }

    /// The mount whose root sits on this vnode, if any.
    pub fn covered_by(&self) -> Option<Arc<Mount>> {
        self.covered.lock().upgrade()
    }

    pub(crate) fn set_covered_by(&self, mount: Weak<Mount>) {
        *self.covered.lock() = mount;
    }

    /// Whether this vnode is the root of its mount.
    pub fn is_mount_root(&self) -> bool {
        self.id == self.mount.root_vnid()
    }

    /// The vnode's page-cache pool, created on first use.
    pub fn page_cache_pool(&self) -> Arc<PageCachePool> {
        let mut pcache = self.pcache.lock();
        pcache
            .get_or_insert_with(|| {
                let io = Arc::downgrade(&self.io) as Weak<dyn PageIo>;
                PageCachePool::new(self.mount.page_size(), io)
            })
            .clone()
    }

    /// The page-cache pool if one was created.
    pub fn cached_pool(&self) -> Option<Arc<PageCachePool>> {
        self.pcache.lock().clone()
    }

    /// Looks `name` up in this directory and returns the vnode it names.
    pub fn lookup(&self, name: &str) -> Result<Arc<Vnode>> {
        let guard = self.lock();
        self.lookup_locked(&guard, name)
    }

    /// Like [`Vnode::lookup`], for a caller that already holds the directory.
    pub fn lookup_locked(&self, guard: &VnodeGuard<'_>, name: &str) -> Result<Arc<Vnode>> {
        debug_assert!(std::ptr::eq(guard.vnode, self));
        let vnid = self
            .calls()
            .lookup(self.sb(), self.fs_vnode(), name)
            .map_err(|e| error::coerce_to(e, &[ENOENT]))?;
        self.mount
            .get_vnode(vnid)
            .map_err(|e| error::coerce_to(e, &[ENOENT]))
    }

    /// Reads the attributes selected by `mask`.
    pub fn getattr(&self, mask: StatMask) -> Result<Stat> {
        let mut stat = Stat::default();
        self.calls()
            .getattr(self.sb(), self.fs_vnode(), mask, &mut stat)
            .map_err(error::coerce)?;
        let mut out = Stat::default();
        out.copy_masked(&stat, mask);
        if mask.contains(StatMask::VNID) {
            out.vnid = self.id;
        }
        if mask.contains(StatMask::DEV) {
            out.dev = self.mount.dev().raw();
        }
        Ok(out)
    }

    /// Applies the attributes of `stat` selected by `mask`.
    pub fn setattr(&self, stat: &Stat, mask: StatMask) -> Result<()> {
        self.calls()
            .setattr(self.sb(), self.fs_vnode(), stat, mask)
            .map_err(error::coerce)
    }

    /// Current size of the file.
    pub fn size(&self) -> Result<u64> {
        Ok(self.getattr(StatMask::SIZE)?.size)
    }

    fn release(&mut self) {
        let pool = self.pcache.get_mut().take();
        if let Some(pool) = pool {
            let res = if self.is_deleted() {
                pool.truncate(0).and_then(|()| pool.destroy())
            } else {
                pool.destroy()
            };
            if let Err(e) = res {
                log::warn!("vnode {}: page cache not drained: {e}", self.id);
            }
        }

        let calls = self.io.fs.calls();
        let res = if self.is_deleted() {
            calls.remove_vnode(&self.io.sb, &self.io.fs_vnode)
        } else {
            calls.put_vnode(&self.io.sb, &self.io.fs_vnode)
        };
        match res {
            Ok(()) | Err(ENOSYS) => {}
            Err(e) => log::warn!("vnode {}: release failed: {e}", self.id),
        }
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        // The index entry stays until the release is done so that a reload sees written-back data.
        self.release();
        self.mount.finish_release(self.id, &self.this);
        log::trace!("mount {}: released vnode {}", self.mount.id(), self.id);
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("mount", &self.mount.id())
            .field("mode", &self.mode)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Exclusive use of a vnode. Dropping the guard releases it and wakes waiters.
#[must_use]
pub struct VnodeGuard<'a> {
    vnode: &'a Vnode,
}

impl VnodeGuard<'_> {
    pub fn vnode(&self) -> &Vnode {
        self.vnode
    }
}

impl Drop for VnodeGuard<'_> {
    fn drop(&mut self) {
        self.vnode.unlock();
    }
}
