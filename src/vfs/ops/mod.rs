//! The process-facing file operations, as methods of [`IoContext`](crate::vfs::IoContext).

mod attr;
mod namei;
mod open;
mod rw;


use libc::{ENOSYS, EROFS};

use crate::{
    error::Result,
    vfs::{Stat, StatMask, Vnode, now},
};

fn check_writable(vnode: &Vnode) -> Result<()> {
    if vnode.mount().is_read_only() {
        return Err(EROFS);
    }
    Ok(())
}

/// Stamps the times selected by `mask` with the current time. Drivers without `setattr` are
/// left alone.
fn touch(vnode: &Vnode, mask: StatMask) -> Result<()> {
    let t = now();
    let stat = Stat {
        atime: t,
        mtime: t,
        ctime: t,
        ..Default::default()
    };
    match vnode.setattr(&stat, mask & StatMask::TIMES) {
        Ok(()) | Err(ENOSYS) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sets the size of a file and drops cached pages past it.
fn truncate(vnode: &Vnode, size: u64) -> Result<()> {
    let stat = Stat {
        size,
        ..Default::default()
    };
    vnode.setattr(&stat, StatMask::SIZE)?;
    if let Some(pool) = vnode.cached_pool() {
        pool.truncate(size)?;
    }
    Ok(())
}
