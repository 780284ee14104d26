use libc::{EINVAL, EISDIR, ENOSYS};

use crate::{
    error::{self, Result},
    vfs::{
        Fd, IoContext, Stat, StatMask,
        ops::{check_writable, truncate},
    },
};

impl IoContext {
    /// Returns the attributes of `path` selected by `mask`. Unselected fields are zero.
    pub fn getattr(&self, path: &str, mask: StatMask) -> Result<Stat> {
        self.path_to_vnode(path)?.getattr(mask)
    }

    /// Returns the attributes of the file open as `fd`.
    pub fn fstat(&self, fd: Fd, mask: StatMask) -> Result<Stat> {
        self.get_fd(fd)?.vnode().getattr(mask)
    }

    /// Updates the attributes of `path` selected by `mask`, leaving the others untouched.
    ///
    /// Setting the size truncates or extends the file.
    pub fn setattr(&self, path: &str, stat: &Stat, mask: StatMask) -> Result<()> {
        if !StatMask::SETATTR.contains(mask) {
            return Err(EINVAL);
        }
        let vnode = self.path_to_vnode(path)?;
        check_writable(&vnode)?;

        let _guard = vnode.lock();
        if mask.contains(StatMask::SIZE) {
            if vnode.mode().is_dir() {
                return Err(EISDIR);
            }
            truncate(&vnode, stat.size)?;
        }
        let rest = mask - StatMask::SIZE;
        if rest.is_empty() {
            return Ok(());
        }
        vnode.setattr(stat, rest)
    }

    /// Writes back the cached data of `fd` and asks the driver to make it durable.
    pub fn fsync(&self, fd: Fd) -> Result<()> {
        let file = self.get_fd(fd)?;
        let vnode = file.vnode();
        check_writable(vnode)?;

        let _guard = vnode.lock();
        let pool = vnode.cached_pool();
        if let Some(pool) = &pool {
            pool.sync_all()?;
        }
        match vnode.calls().fsync(vnode.sb(), vnode.fs_vnode()) {
            Ok(()) => {}
            Err(ENOSYS) if pool.is_some() => {}
            Err(e) => return Err(error::coerce(e)),
        }
        vnode.clear_dirty();
        Ok(())
    }
}
