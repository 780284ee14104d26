//! Mounted filesystem instances and the mount table.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use bitflags::bitflags;
use libc::{EBUSY, ENOENT, ENOSPC, ENOTDIR};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    block::{BlockDevice, DevId},
    error::{self, Result},
    sync::{WaitQueue, WaitReason},
    vfs::{FsCalls, FsContainer, FsSuper, INVALID_MNTID, MountId, Vnid, Vnode},
};

bitflags! {
    /// State and options of a mount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const UNMOUNTING = 1;
        const RDONLY = 2;
        const NOATIME = 4;
    }
}

/// One mounted filesystem instance.
///
/// The mount keeps its root vnode loaded until it is unmounted; every other vnode is indexed
/// weakly and unloaded on its last release. An index entry whose vnode is gone stays in place
/// until the release finishes, and loads of that vnid wait for it.
pub struct Mount {
    id: MountId,
    device: Option<Arc<BlockDevice>>,
    fs: Arc<FsContainer>,
    sb: FsSuper,
    root_vnid: Vnid,
    root: Mutex<Option<Arc<Vnode>>>,
    mount_point: Mutex<Option<Arc<Vnode>>>,
    path: String,
    flags: Mutex<MountFlags>,
    pub(crate) vnodes: Mutex<BTreeMap<Vnid, Weak<Vnode>>>,
    pub(crate) released: WaitQueue,
    page_size: usize,
}

impl Mount {
    /// Builds a mount over an instance the driver already mounted and loads its root vnode.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: MountId,
        device: Option<Arc<BlockDevice>>,
        fs: Arc<FsContainer>,
        sb: FsSuper,
        root_vnid: Vnid,
        mount_point: Option<Arc<Vnode>>,
        path: String,
        flags: MountFlags,
        page_size: usize,
    ) -> Result<Arc<Self>> {
        let mount = Arc::new(Self {
            id,
            device,
            fs,
            sb,
            root_vnid,
            root: Mutex::new(None),
            mount_point: Mutex::new(mount_point),
            path,
            flags: Mutex::new(flags),
            vnodes: Mutex::new(BTreeMap::new()),
            released: WaitQueue::new(),
            page_size,
        });

        let root = mount.get_vnode(root_vnid)?;
        if !root.mode().is_dir() {
            return Err(ENOTDIR);
        }
        *mount.root.lock() = Some(root);
        Ok(mount)
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    /// Id of the backing device, or [`DevId::INVALID`] for a pseudo filesystem.
    pub fn dev(&self) -> DevId {
        self.device.as_ref().map_or(DevId::INVALID, |dev| dev.id())
    }

    pub fn device(&self) -> Option<&Arc<BlockDevice>> {
        self.device.as_ref()
    }

    pub fn fs(&self) -> &Arc<FsContainer> {
        &self.fs
    }

    pub fn calls(&self) -> &dyn FsCalls {
        self.fs.calls()
    }

    pub fn sb(&self) -> &FsSuper {
        &self.sb
    }

    /// The path the filesystem was mounted on.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn flags(&self) -> MountFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: MountFlags) {
        *self.flags.lock() = flags;
    }

    pub(crate) fn insert_flags(&self, flags: MountFlags) {
        self.flags.lock().insert(flags);
    }

    pub(crate) fn remove_flags(&self, flags: MountFlags) {
        self.flags.lock().remove(flags);
    }

    pub fn is_read_only(&self) -> bool {
        self.flags().contains(MountFlags::RDONLY)
    }

    pub fn root_vnid(&self) -> Vnid {
        self.root_vnid
    }

    /// The root vnode. Fails with `EBUSY` while unmounting and `ENOENT` once unmounted.
    pub fn root(&self) -> Result<Arc<Vnode>> {
        if self.flags().contains(MountFlags::UNMOUNTING) {
            return Err(EBUSY);
        }
        self.root.lock().clone().ok_or(ENOENT)
    }

    pub(crate) fn take_root(&self) -> Option<Arc<Vnode>> {
        self.root.lock().take()
    }

    /// The vnode of the parent filesystem this mount covers. `None` for the root mount.
    pub fn mount_point(&self) -> Option<Arc<Vnode>> {
        self.mount_point.lock().clone()
    }

    pub(crate) fn take_mount_point(&self) -> Option<Arc<Vnode>> {
        self.mount_point.lock().take()
    }

    /// Returns the vnode `vnid`, loading it through the driver if it is not in memory.
    ///
    /// If the previous vnode for `vnid` is still being released, waits until its pages and
    /// driver state are written back before loading it again.
    pub fn get_vnode(self: &Arc<Self>, vnid: Vnid) -> Result<Arc<Vnode>> {
        loop {
            let mut vnodes = self.vnodes.lock();
            match vnodes.get(&vnid).map(Weak::upgrade) {
                Some(Some(vnode)) => return Ok(vnode),
                Some(None) => {
                    drop(vnodes);
                    self.wait_released(vnid);
                }
                None => {
                    let (fs_vnode, mode) = self
                        .fs
                        .calls()
                        .get_vnode(&self.sb, vnid)
                        .map_err(error::coerce)?;
                    let vnode = Vnode::new(vnid, self.clone(), fs_vnode, mode);
                    vnodes.insert(vnid, Arc::downgrade(&vnode));
                    log::trace!("mount {}: loaded vnode {vnid}", self.id);
                    return Ok(vnode);
                }
            }
        }
    }

    fn is_releasing(&self, vnid: Vnid) -> bool {
        self.vnodes
            .lock()
            .get(&vnid)
            .is_some_and(|weak| weak.strong_count() == 0)
    }

    fn wait_released(&self, vnid: Vnid) {
        while self.released.wait_while(|| self.is_releasing(vnid), None) != WaitReason::Released {}
    }

    /// Drops the index entry of a released vnode and wakes loads waiting on it.
    pub(crate) fn finish_release(&self, vnid: Vnid, vnode: &Weak<Vnode>) {
        {
            let mut vnodes = self.vnodes.lock();
            if vnodes.get(&vnid).is_some_and(|v| Weak::ptr_eq(v, vnode)) {
                vnodes.remove(&vnid);
            }
        }
        self.released.wake(WaitReason::Released);
    }

    /// Number of vnodes currently in memory, the root included.
    pub fn live_vnodes(&self) -> usize {
        self.vnodes
            .lock()
            .values()
            .filter(|v| v.strong_count() > 0)
            .count()
    }

    /// Whether any vnode other than the root is in memory or being released, or the root is
    /// referenced from outside.
    pub(crate) fn is_busy(&self) -> bool {
        let vnodes = self.vnodes.lock();
        vnodes
            .iter()
            .any(|(&vnid, vnode)| vnid != self.root_vnid || vnode.strong_count() > 1)
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("dev", &self.dev())
            .field("fs", &self.fs.name())
            .field("path", &self.path)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Mounts by id, plus the root mount.
#[derive(Debug, Default)]
pub struct MountTable {
    inner: Mutex<Mounts>,
}

#[derive(Debug, Default)]
pub(crate) struct Mounts {
    mounts: BTreeMap<MountId, Arc<Mount>>,
    last_id: MountId,
    root: Option<Arc<Mount>>,
}

impl Mounts {
    /// Allocates the next free id after the last one handed out, wrapping around.
    pub(crate) fn alloc_id(&mut self) -> Result<MountId> {
        let mut id = self.last_id;
        loop {
            id = id.wrapping_add(1);
            if id == self.last_id {
                return Err(ENOSPC);
            }
            if id != INVALID_MNTID && !self.mounts.contains_key(&id) {
                self.last_id = id;
                return Ok(id);
            }
        }
    }

    pub(crate) fn insert(&mut self, mount: Arc<Mount>) {
        if mount.mount_point().is_none() {
            self.root = Some(mount.clone());
        }
        self.mounts.insert(mount.id(), mount);
    }

    pub(crate) fn remove(&mut self, id: MountId) -> Option<Arc<Mount>> {
        let mount = self.mounts.remove(&id)?;
        if self.root.as_ref().is_some_and(|root| Arc::ptr_eq(root, &mount)) {
            self.root = None;
        }
        Some(mount)
    }

    pub(crate) fn root(&self) -> Option<&Arc<Mount>> {
        self.root.as_ref()
    }

    /// Whether a mount already uses device `devid`.
    pub(crate) fn uses_device(&self, devid: DevId) -> bool {
        devid.is_valid() && self.mounts.values().any(|m| m.dev() == devid)
    }

    /// Whether any mount sits on a vnode of mount `id`.
    pub(crate) fn has_children(&self, id: MountId) -> bool {
        self.mounts.values().any(|m| {
            m.mount_point()
                .is_some_and(|mount_point| mount_point.mount().id() == id)
        })
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Mounts> {
        self.inner.lock()
    }

    pub fn get(&self, id: MountId) -> Option<Arc<Mount>> {
        self.inner.lock().mounts.get(&id).cloned()
    }

    pub fn root(&self) -> Option<Arc<Mount>> {
        self.inner.lock().root.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every mount in ascending order.
    pub fn ids(&self) -> Vec<MountId> {
        self.inner.lock().mounts.keys().copied().collect()
    }
}
