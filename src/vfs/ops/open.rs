use std::sync::Arc;

use libc::{EEXIST, EINVAL, EISDIR, ENOENT, ENOTDIR};

use crate::{
    error::{self, Result},
    vfs::{
        Fd, FileDescriptor, IoContext, Mode, OpenFlags, Stat, Vnode, now,
        ops::{check_writable, truncate},
    },
};

impl IoContext {
    /// Opens `path` and returns the lowest free descriptor.
    ///
    /// With `CREAT` a missing regular file is created with access bits `mode`.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd> {
        if (flags & OpenFlags::ACCMODE).is_empty() {
            return Err(EINVAL);
        }
        let vnode = if flags.contains(OpenFlags::CREAT) {
            self.lookup_or_create(path, flags, mode)?
        } else {
            self.path_to_vnode(path)?
        };
        self.open_vnode(vnode, flags)
    }

    /// Opens the directory `path` for reading its entries.
    pub fn opendir(&self, path: &str) -> Result<Fd> {
        self.open(path, OpenFlags::RDONLY | OpenFlags::DIRECTORY, 0)
    }

    /// Closes a descriptor of a file. Directories are closed with [`IoContext::closedir`].
    pub fn close(&self, fd: Fd) -> Result<()> {
        if self.get_fd(fd)?.vnode().mode().is_dir() {
            return Err(EISDIR);
        }
        self.remove_fd(fd)
    }

    pub fn closedir(&self, fd: Fd) -> Result<()> {
        if !self.get_fd(fd)?.vnode().mode().is_dir() {
            return Err(ENOTDIR);
        }
        self.remove_fd(fd)
    }

    /// Creates the regular file `path` with the attributes of `stat`.
    pub fn create(&self, path: &str, stat: &Stat) -> Result<()> {
        if stat.mode.is_dir() {
            return Err(EISDIR);
        }
        let (dir, name) = self.path_to_dir_vnode(path)?;
        check_writable(&dir)?;
        let _guard = dir.lock();
        create_locked(&dir, &name, stat)?;
        Ok(())
    }

    fn lookup_or_create(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Arc<Vnode>> {
        let (dir, name) = self.path_to_dir_vnode(path)?;
        let guard = dir.lock();
        match dir.lookup_locked(&guard, &name) {
            Ok(vnode) => {
                if flags.contains(OpenFlags::EXCL) {
                    return Err(EEXIST);
                }
                drop(guard);
                // The name may be a mount point.
                match vnode.covered_by() {
                    Some(mount) => mount.root(),
                    None => Ok(vnode),
                }
            }
            Err(ENOENT) => {
                check_writable(&dir)?;
                let t = now();
                let stat = Stat {
                    mode: Mode::regular(mode),
                    atime: t,
                    mtime: t,
                    ctime: t,
                    ..Default::default()
                };
                create_locked(&dir, &name, &stat)
            }
            Err(e) => Err(e),
        }
    }

    fn open_vnode(&self, vnode: Arc<Vnode>, flags: OpenFlags) -> Result<Fd> {
        if vnode.mode().is_dir() {
            if flags.writable() {
                return Err(EISDIR);
            }
        } else if flags.contains(OpenFlags::DIRECTORY) {
            return Err(ENOTDIR);
        }
        if flags.writable() {
            check_writable(&vnode)?;
        }
        if flags.contains(OpenFlags::TRUNC) && flags.writable() && vnode.mode().is_regular() {
            let _guard = vnode.lock();
            truncate(&vnode, 0)?;
        }

        let file = vnode
            .calls()
            .open(vnode.sb(), vnode.fs_vnode(), flags)
            .map_err(error::coerce)?;
        self.alloc_fd(FileDescriptor::new(vnode, flags, file))
    }
}

/// Creates `name` in `dir`, whose lock the caller holds.
fn create_locked(dir: &Arc<Vnode>, name: &str, stat: &Stat) -> Result<Arc<Vnode>> {
    let mut stat = *stat;
    stat.mode = Mode::regular(stat.mode.access());
    let vnid = dir
        .calls()
        .create(dir.sb(), dir.fs_vnode(), name, &stat)
        .map_err(error::coerce)?;
    let vnode = dir.mount().get_vnode(vnid)?;
    log::debug!("created {name} as vnode {vnid}");
    Ok(vnode)
}
