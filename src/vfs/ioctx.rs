//! Per-process I/O contexts: root and working directories and the descriptor table.

use std::sync::Arc;

use bitvec::prelude::*;
use libc::{EBADF, EBUSY, EINVAL, EMFILE, ENOENT, ENOTDIR};
use parking_lot::Mutex;

use crate::{
    error::Result,
    vfs::{Fd, FileDescriptor, OpenFlags, Vnode},
};

/// Default number of descriptor slots.
pub const FD_TABLE_DEFAULT: usize = 128;
/// Largest descriptor table a context may grow to.
pub const FD_TABLE_MAX: usize = 2048;

/// The file-system view of one process.
///
/// Dropping the context closes every descriptor still open and releases its root and working
/// directory.
#[derive(Debug)]
pub struct IoContext {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: Option<Arc<Vnode>>,
    cwd: Option<Arc<Vnode>>,
    fds: Vec<Option<Arc<FileDescriptor>>>,
    used: BitVec,
}

impl IoContext {
    /// Creates a context with `table_size` descriptor slots.
    pub fn new(root: Arc<Vnode>, cwd: Arc<Vnode>, table_size: usize) -> Result<Self> {
        if table_size == 0 || table_size > FD_TABLE_MAX {
            return Err(EINVAL);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                root: Some(root),
                cwd: Some(cwd),
                fds: vec![None; table_size],
                used: bitvec![0; table_size],
            }),
        })
    }

    pub fn root(&self) -> Result<Arc<Vnode>> {
        self.inner.lock().root.clone().ok_or(ENOENT)
    }

    pub fn cwd(&self) -> Result<Arc<Vnode>> {
        self.inner.lock().cwd.clone().ok_or(ENOENT)
    }

    pub(crate) fn root_and_cwd(&self) -> Result<(Arc<Vnode>, Arc<Vnode>)> {
        let inner = self.inner.lock();
        match (&inner.root, &inner.cwd) {
            (Some(root), Some(cwd)) => Ok((root.clone(), cwd.clone())),
            _ => Err(ENOENT),
        }
    }

    /// Replaces the working directory.
    pub fn set_cwd(&self, vnode: Arc<Vnode>) -> Result<()> {
        if !vnode.mode().is_dir() {
            return Err(ENOTDIR);
        }
        let old = self.inner.lock().cwd.replace(vnode);
        drop(old);
        Ok(())
    }

    /// Number of descriptor slots.
    pub fn table_size(&self) -> usize {
        self.inner.lock().fds.len()
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.inner.lock().used.count_ones()
    }

    /// Installs `file` in the lowest free slot.
    pub fn alloc_fd(&self, file: FileDescriptor) -> Result<Fd> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.used.first_zero() else {
            drop(inner);
            drop(file);
            return Err(EMFILE);
        };
        inner.used.set(slot, true);
        inner.fds[slot] = Some(Arc::new(file));
        Ok(slot as Fd)
    }

    fn slot(&self, fd: Fd) -> Result<usize> {
        usize::try_from(fd).map_err(|_| EBADF)
    }

    /// Borrows the descriptor in slot `fd`.
    pub fn get_fd(&self, fd: Fd) -> Result<Arc<FileDescriptor>> {
        let slot = self.slot(fd)?;
        let inner = self.inner.lock();
        inner.fds.get(slot).cloned().flatten().ok_or(EBADF)
    }

    /// Empties slot `fd`. The descriptor is released once no borrowed handle remains.
    pub fn remove_fd(&self, fd: Fd) -> Result<()> {
        let slot = self.slot(fd)?;
        let file = {
            let mut inner = self.inner.lock();
            let file = inner.fds.get_mut(slot).and_then(Option::take).ok_or(EBADF)?;
            inner.used.set(slot, false);
            file
        };
        drop(file);
        Ok(())
    }

    /// Grows or shrinks the descriptor table.
    ///
    /// Shrinking fails with `EBUSY` while a descriptor is open past the new end.
    pub fn resize(&self, size: usize) -> Result<()> {
        if size == 0 || size > FD_TABLE_MAX {
            return Err(EINVAL);
        }
        let mut inner = self.inner.lock();
        if inner.used.iter_ones().any(|slot| slot >= size) {
            return Err(EBUSY);
        }
        inner.fds.resize(size, None);
        inner.used.resize(size, false);
        Ok(())
    }

    /// Closes every descriptor opened with `CLOEXEC`, returning how many were closed.
    pub fn close_on_exec(&self) -> usize {
        let closed: Vec<Arc<FileDescriptor>> = {
            let mut inner = self.inner.lock();
            let slots: Vec<usize> = inner
                .used
                .iter_ones()
                .filter(|&slot| {
                    inner.fds[slot]
                        .as_ref()
                        .is_some_and(|f| f.flags().contains(OpenFlags::CLOEXEC))
                })
                .collect();
            slots
                .into_iter()
                .filter_map(|slot| {
                    inner.used.set(slot, false);
                    inner.fds[slot].take()
                })
                .collect()
        };
        closed.len()
    }
}
