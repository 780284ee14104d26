//! The operation table a filesystem driver implements.

use std::{any::Any, sync::Arc};

use libc::ENOSYS;

use crate::{
    block::{BlockDevice, IoDirection},
    error::Result,
    pcache::PageCache,
    vfs::{Mode, OpenFlags, Stat, StatMask, Vnid},
};

/// Driver state of one mounted filesystem.
pub type FsSuper = Arc<dyn Any + Send + Sync>;

/// Driver state of one vnode.
pub type FsVnode = Arc<dyn Any + Send + Sync>;

/// Driver state of one open file, if the driver keeps any.
pub type FsFile = Option<Box<dyn Any + Send + Sync>>;

/// Filesystem driver operations.
///
/// `lookup`, `get_vnode` and `put_vnode` are required. Every other operation defaults to
/// `ENOSYS`, which the VFS reports as "not supported".
#[allow(unused_variables)]
pub trait FsCalls: Send + Sync {
    /// Mounts an instance, returning its state and the vnid of its root directory.
    ///
    /// `dev` is `None` only for filesystems registered as pseudo filesystems.
    fn mount(&self, dev: Option<Arc<BlockDevice>>, args: &str) -> Result<(FsSuper, Vnid)> {
        Err(ENOSYS)
    }

    fn unmount(&self, sb: &FsSuper) -> Result<()> {
        Err(ENOSYS)
    }

    /// Writes back everything the instance has cached.
    fn sync(&self, sb: &FsSuper) -> Result<()> {
        Err(ENOSYS)
    }

    /// Returns the vnid of `name` in the directory `dir`.
    fn lookup(&self, sb: &FsSuper, dir: &FsVnode, name: &str) -> Result<Vnid>;

    /// Loads a vnode, returning its state and mode.
    fn get_vnode(&self, sb: &FsSuper, vnid: Vnid) -> Result<(FsVnode, Mode)>;

    /// Releases a vnode that is still linked.
    fn put_vnode(&self, sb: &FsSuper, vnode: &FsVnode) -> Result<()>;

    /// Releases a vnode that was unlinked while it was referenced.
    fn remove_vnode(&self, sb: &FsSuper, vnode: &FsVnode) -> Result<()> {
        Err(ENOSYS)
    }

    fn open(&self, sb: &FsSuper, vnode: &FsVnode, flags: OpenFlags) -> Result<FsFile> {
        Err(ENOSYS)
    }

    fn close(&self, sb: &FsSuper, vnode: &FsVnode, file: &mut FsFile) -> Result<()> {
        Err(ENOSYS)
    }

    /// Frees the per-open state after the last reference to the descriptor is gone.
    fn release_fd(&self, sb: &FsSuper, vnode: &FsVnode, file: FsFile) -> Result<()> {
        Err(ENOSYS)
    }

    fn fsync(&self, sb: &FsSuper, vnode: &FsVnode) -> Result<()> {
        Err(ENOSYS)
    }

    /// Reads at `pos`, returning the number of bytes read. Zero means end of file.
    fn read(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        file: &mut FsFile,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        Err(ENOSYS)
    }

    /// Writes at `pos`, returning the number of bytes written.
    fn write(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        file: &mut FsFile,
        pos: u64,
        buf: &[u8],
    ) -> Result<usize> {
        Err(ENOSYS)
    }

    /// Repositions an open file.
    ///
    /// `offset` and `whence` are the caller's arguments and `pos` the position the VFS computed
    /// from them. `ENOSYS` keeps `pos`; a negative result is clamped to zero.
    fn seek(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        file: &mut FsFile,
        offset: i64,
        whence: libc::c_int,
        pos: u64,
    ) -> Result<i64> {
        Err(ENOSYS)
    }

    fn ioctl(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        file: &mut FsFile,
        op: u64,
        arg: &mut [u8],
    ) -> Result<i64> {
        Err(ENOSYS)
    }

    /// Fills `page` from the file or writes it back, for page-cached filesystems.
    fn strategy(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        page: &PageCache,
        dir: IoDirection,
    ) -> Result<()> {
        Err(ENOSYS)
    }

    /// Packs directory entries starting at position `pos` into `buf`.
    ///
    /// Returns the bytes written and the position to continue from.
    fn getdents(
        &self,
        sb: &FsSuper,
        dir: &FsVnode,
        file: &mut FsFile,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<(usize, u64)> {
        Err(ENOSYS)
    }

    /// Creates a regular file, returning its vnid.
    fn create(&self, sb: &FsSuper, dir: &FsVnode, name: &str, stat: &Stat) -> Result<Vnid> {
        Err(ENOSYS)
    }

    fn unlink(&self, sb: &FsSuper, dir: &FsVnode, name: &str) -> Result<()> {
        Err(ENOSYS)
    }

    fn rename(
        &self,
        sb: &FsSuper,
        old_dir: &FsVnode,
        old_name: &str,
        new_dir: &FsVnode,
        new_name: &str,
    ) -> Result<()> {
        Err(ENOSYS)
    }

    /// Creates a directory, returning its vnid.
    fn mkdir(&self, sb: &FsSuper, dir: &FsVnode, name: &str, stat: &Stat) -> Result<Vnid> {
        Err(ENOSYS)
    }

    fn rmdir(&self, sb: &FsSuper, dir: &FsVnode, name: &str) -> Result<()> {
        Err(ENOSYS)
    }

    /// Fills the fields of `stat` selected by `mask`.
    fn getattr(&self, sb: &FsSuper, vnode: &FsVnode, mask: StatMask, stat: &mut Stat) -> Result<()> {
        Err(ENOSYS)
    }

    /// Applies the fields of `stat` selected by `mask`.
    fn setattr(&self, sb: &FsSuper, vnode: &FsVnode, stat: &Stat, mask: StatMask) -> Result<()> {
        Err(ENOSYS)
    }
}
