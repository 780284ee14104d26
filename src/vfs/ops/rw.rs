use libc::{EBADF, EFBIG, EINVAL, EISDIR, ENOSYS, ENOTDIR};

use crate::{
    error::{self, Result},
    vfs::{
        Fd, IoContext, MAX_FILE_SIZE, MountFlags, OpenFlags, SEEK_CUR, SEEK_DATA, SEEK_END,
        SEEK_HOLE, SEEK_SET, StatMask, Vnode,
        ops::{check_writable, touch, truncate},
    },
};

/// Fails with `EFBIG` if `len` bytes at `pos` would pass the largest file offset.
fn check_range(pos: u64, len: usize) -> Result<()> {
    match pos.checked_add(len as u64) {
        Some(end) if end <= MAX_FILE_SIZE => Ok(()),
        _ => Err(EFBIG),
    }
}

/// Splits the byte range at `pos` into per-page pieces of `(page offset, offset in page, len)`.
fn page_chunks(pos: u64, len: usize, page_size: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let mut done = 0;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let off = pos + done as u64;
        let in_page = (off % page_size as u64) as usize;
        let chunk = (page_size - in_page).min(len - done);
        done += chunk;
        Some((off - in_page as u64, in_page, chunk))
    })
}

/// Reads through the vnode's page cache, stopping at end of file.
fn cached_read(vnode: &Vnode, pos: u64, buf: &mut [u8]) -> Result<usize> {
    let size = vnode.size()?;
    if pos >= size {
        return Ok(0);
    }
    let len = buf.len().min((size - pos).min(usize::MAX as u64) as usize);
    let pool = vnode.page_cache_pool();

    let mut done = 0;
    for (page_off, in_page, chunk) in page_chunks(pos, len, pool.page_size()) {
        let res = pool
            .get(page_off)
            .and_then(|page| page.read(in_page, &mut buf[done..done + chunk]));
        if let Err(e) = res {
            return if done > 0 { Ok(done) } else { Err(e) };
        }
        done += chunk;
    }
    Ok(done)
}

/// Writes through the vnode's page cache, extending the file size when writing past it.
///
/// The size grows before any page is dirtied: a write-back only covers bytes inside the file.
fn cached_write(vnode: &Vnode, pos: u64, buf: &[u8]) -> Result<usize> {
    let _guard = vnode.lock();
    let size = vnode.size()?;
    let want = pos + buf.len() as u64;
    if want > size {
        truncate(vnode, want)?;
    }
    let pool = vnode.page_cache_pool();

    let mut done = 0;
    let mut failed = None;
    for (page_off, in_page, chunk) in page_chunks(pos, buf.len(), pool.page_size()) {
        let res = pool
            .get(page_off)
            .and_then(|page| page.write(in_page, &buf[done..done + chunk]));
        if let Err(e) = res {
            failed = Some(e);
            break;
        }
        done += chunk;
    }

    let Some(e) = failed else {
        return Ok(done);
    };
    let end = size.max(pos + done as u64);
    if end < want {
        truncate(vnode, end)?;
    }
    if done == 0 { Err(e) } else { Ok(done) }
}

impl IoContext {
    /// Reads from `fd` at its position and advances the position by the bytes read.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let file = self.get_fd(fd)?;
        if !file.flags().readable() {
            return Err(EBADF);
        }
        let vnode = file.vnode();
        if vnode.mode().is_dir() {
            return Err(EISDIR);
        }

        let mut pos = file.lock_pos();
        check_range(*pos, buf.len())?;
        let n = if vnode.mount().fs().uses_page_cache() {
            cached_read(vnode, *pos, buf)?
        } else {
            vnode
                .calls()
                .read(vnode.sb(), vnode.fs_vnode(), &mut file.lock_file(), *pos, buf)
                .map_err(error::coerce)?
        };
        *pos += n as u64;

        let noatime = file.flags().contains(OpenFlags::NOATIME)
            || vnode.mount().flags().intersects(MountFlags::NOATIME | MountFlags::RDONLY);
        if n > 0 && !noatime {
            touch(vnode, StatMask::ATIME)?;
        }
        Ok(n)
    }

    /// Writes to `fd` at its position, or at end of file with `APPEND`, and advances the position.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let file = self.get_fd(fd)?;
        if !file.flags().writable() {
            return Err(EBADF);
        }
        let vnode = file.vnode();
        if vnode.mode().is_dir() {
            return Err(EISDIR);
        }
        check_writable(vnode)?;

        let mut pos = file.lock_pos();
        let start = if file.flags().contains(OpenFlags::APPEND) {
            vnode.size()?
        } else {
            *pos
        };
        check_range(start, buf.len())?;
        let n = if vnode.mount().fs().uses_page_cache() {
            cached_write(vnode, start, buf)?
        } else {
            vnode
                .calls()
                .write(vnode.sb(), vnode.fs_vnode(), &mut file.lock_file(), start, buf)
                .map_err(error::coerce)?
        };
        *pos = start + n as u64;

        if n > 0 {
            vnode.mark_dirty();
            touch(vnode, StatMask::MTIME | StatMask::CTIME)?;
        }
        Ok(n)
    }

    /// Repositions `fd` and returns the new position.
    ///
    /// If the size of the file cannot be read, `SEEK_END` and `SEEK_HOLE` keep the current
    /// position. Negative positions are clamped to zero.
    pub fn lseek(&self, fd: Fd, offset: i64, whence: libc::c_int) -> Result<u64> {
        if ![SEEK_SET, SEEK_CUR, SEEK_END, SEEK_DATA, SEEK_HOLE].contains(&whence) {
            return Err(EINVAL);
        }
        let file = self.get_fd(fd)?;
        let vnode = file.vnode();
        let mut pos = file.lock_pos();

        let cur = *pos as i64;
        let size = vnode.size().ok().map(|size| size as i64);
        let target = match whence {
            SEEK_SET => offset,
            SEEK_CUR => cur.saturating_add(offset),
            SEEK_END => size.map_or(cur, |size| size.saturating_add(offset)),
            SEEK_DATA => size.map_or(cur, |_| offset),
            _ => size.unwrap_or(cur),
        };
        let mut new_pos = target.max(0) as u64;

        let res = {
            let _guard = vnode.lock();
            vnode.calls().seek(
                vnode.sb(),
                vnode.fs_vnode(),
                &mut file.lock_file(),
                offset,
                whence,
                new_pos,
            )
        };
        match res {
            Ok(driver_pos) => new_pos = driver_pos.max(0) as u64,
            Err(ENOSYS) => {}
            Err(e) => return Err(error::coerce(e)),
        }
        *pos = new_pos;
        Ok(new_pos)
    }

    /// Passes a device-specific request to the driver.
    pub fn ioctl(&self, fd: Fd, op: u64, arg: &mut [u8]) -> Result<i64> {
        let file = self.get_fd(fd)?;
        let vnode = file.vnode();
        vnode
            .calls()
            .ioctl(vnode.sb(), vnode.fs_vnode(), &mut file.lock_file(), op, arg)
            .map_err(error::coerce)
    }

    /// Reads directory entries at the position of `fd` into `buf` and advances the position.
    ///
    /// Returns the number of bytes filled; zero at the end of the directory.
    pub fn getdents(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let file = self.get_fd(fd)?;
        let vnode = file.vnode();
        if !vnode.mode().is_dir() {
            return Err(ENOTDIR);
        }
        let mut pos = file.lock_pos();
        let (n, next) = {
            let _guard = vnode.lock();
            vnode
                .calls()
                .getdents(vnode.sb(), vnode.fs_vnode(), &mut file.lock_file(), *pos, buf)
                .map_err(error::coerce)?
        };
        *pos = next;
        Ok(n)
    }
}
