use std::sync::Arc;

use libc::{EBUSY, EINVAL, EISDIR, ENOENT, ENOTDIR, EROFS, EXDEV};

use crate::{
    error::{self, Result},
    vfs::{IoContext, Mode, Stat, StatMask, Vnode, now, ops::check_writable},
};

/// Rejects names a directory operation may not target.
fn check_name(name: &str) -> Result<()> {
    if name == "." || name == ".." {
        return Err(EINVAL);
    }
    Ok(())
}

impl IoContext {
    /// Removes the file `path`. A vnode still referenced is removed on its last release.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let target = self.path_to_vnode(path)?;
        if target.mode().is_dir() {
            return Err(EISDIR);
        }
        let (dir, name) = self.path_to_dir_vnode(path)?;
        check_writable(&dir)?;

        let _guard = dir.lock();
        dir.calls()
            .unlink(dir.sb(), dir.fs_vnode(), &name)
            .map_err(error::coerce)?;
        target.mark_delete();
        log::debug!("unlinked {path}");
        Ok(())
    }

    /// Creates the directory `path` with access bits `mode`.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (dir, name) = self.path_to_dir_vnode(path)?;
        check_name(&name)?;
        check_writable(&dir)?;

        let t = now();
        let stat = Stat {
            mode: Mode::dir(mode),
            atime: t,
            mtime: t,
            ctime: t,
            ..Default::default()
        };
        let _guard = dir.lock();
        dir.calls()
            .mkdir(dir.sb(), dir.fs_vnode(), &name, &stat)
            .map_err(error::coerce)?;
        Ok(())
    }

    /// Removes the empty directory `path`.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let target = self.path_to_vnode(path)?;
        if !target.mode().is_dir() {
            return Err(ENOTDIR);
        }
        if target.is_mount_root() || target.covered_by().is_some() {
            return Err(EBUSY);
        }
        let (dir, name) = self.path_to_dir_vnode(path)?;
        check_name(&name)?;
        check_writable(&dir)?;

        let _guard = dir.lock();
        dir.calls()
            .rmdir(dir.sb(), dir.fs_vnode(), &name)
            .map_err(error::coerce)?;
        target.mark_delete();
        Ok(())
    }

    /// Moves `old_path` to `new_path` within one mount, replacing a file at `new_path`.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let (old_dir, old_name) = self.path_to_dir_vnode(old_path)?;
        let (new_dir, new_name) = self.path_to_dir_vnode(new_path)?;
        check_name(&old_name)?;
        check_name(&new_name)?;
        if !Arc::ptr_eq(old_dir.mount(), new_dir.mount()) {
            return Err(EXDEV);
        }
        if old_dir.mount().is_read_only() {
            return Err(EROFS);
        }

        let replaced = new_dir.lookup(&new_name).ok();
        if let Some(vnode) = &replaced {
            if vnode.is_mount_root() || vnode.covered_by().is_some() {
                return Err(EBUSY);
            }
        }

        // Both parents are locked in address order so opposing renames cannot deadlock.
        let _guards = if Arc::ptr_eq(&old_dir, &new_dir) {
            (old_dir.lock(), None)
        } else if Arc::as_ptr(&old_dir) < Arc::as_ptr(&new_dir) {
            let first = old_dir.lock();
            (first, Some(new_dir.lock()))
        } else {
            let first = new_dir.lock();
            (first, Some(old_dir.lock()))
        };
        old_dir
            .calls()
            .rename(
                old_dir.sb(),
                old_dir.fs_vnode(),
                &old_name,
                new_dir.fs_vnode(),
                &new_name,
            )
            .map_err(error::coerce)?;

        if let Some(vnode) = replaced {
            mark_replaced(&vnode);
        }
        log::debug!("renamed {old_path} to {new_path}");
        Ok(())
    }

    /// Changes the working directory to `path`.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let vnode = self.path_to_vnode(path)?;
        self.set_cwd(vnode)
    }
}

/// The vnode a rename replaced loses its last link unless the driver kept it.
fn mark_replaced(vnode: &Vnode) {
    match vnode.getattr(StatMask::NLINK) {
        Ok(stat) if stat.nlink > 0 => {}
        Ok(_) | Err(ENOENT) => vnode.mark_delete(),
        Err(_) => {}
    }
}
