//! A small block-backed filesystem.
//!
//! Metadata lives in memory and every mount starts empty; file data is stored in device blocks
//! through the block buffer cache. Mounting without a device (when registered as a pseudo
//! filesystem) backs the instance with a private RAM disk sized by the `size=` option.

pub mod error;
pub mod inode;

pub use error::Error;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{
    block::{
        BlockDevice, DevId, Geometry, IoDirection, SECTOR_SIZE_MIN, bio,
        storage::{MemStorage, StorageDevice},
    },
    pcache::{PAGE_SIZE, PageCache},
    vfs::{
        FsCalls, FsFile, FsSuper, FsVnode, Mode, OpenFlags, ROOT_VNID, Stat, StatMask, Vnid,
        dirent::{DirentWriter, kind_of},
        now,
    },
};
use inode::Volume;

/// Size of the RAM disk of a mount without a device.
pub const DEFAULT_RAMDISK_SIZE: u64 = 1 << 20;

/// The driver. One value serves any number of mounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleFs;

/// State of one mounted instance.
struct Superblock {
    volume: Mutex<Volume>,
}

/// Driver state of a loaded vnode.
struct Handle(Vnid);

fn superblock(sb: &FsSuper) -> error::Result<&Superblock> {
    (**sb).downcast_ref::<Superblock>().ok_or(Error::ForeignHandle)
}

fn volume(sb: &FsSuper) -> error::Result<MutexGuard<'_, Volume>> {
    Ok(superblock(sb)?.volume.lock())
}

fn vnid(vnode: &FsVnode) -> error::Result<Vnid> {
    (**vnode)
        .downcast_ref::<Handle>()
        .map(|handle| handle.0)
        .ok_or(Error::ForeignHandle)
}

/// Reads the `size=` option, rounded up to whole pages.
fn ramdisk_size(args: &str) -> error::Result<u64> {
    let Some(value) = args
        .split(',')
        .map(str::trim)
        .find_map(|opt| opt.strip_prefix("size="))
    else {
        return Ok(DEFAULT_RAMDISK_SIZE);
    };
    let size: u64 = value.parse().map_err(|_| Error::InvalidArgs)?;
    if size == 0 {
        return Err(Error::InvalidArgs);
    }
    size.checked_next_multiple_of(PAGE_SIZE as u64)
        .ok_or(Error::InvalidArgs)
}

fn ramdisk(args: &str) -> error::Result<Arc<BlockDevice>> {
    let size = ramdisk_size(args)?;
    let geometry = Geometry::new(SECTOR_SIZE_MIN, PAGE_SIZE as u32, size);
    let ops = Arc::new(StorageDevice::new(MemStorage::new(size)));
    Ok(BlockDevice::new(DevId::INVALID, geometry, ops, PAGE_SIZE))
}

fn sync(sb: &FsSuper) -> error::Result<()> {
    let dev = volume(sb)?.dev().clone();
    bio::sync_device(&dev)?;
    Ok(())
}

impl FsCalls for SimpleFs {
    fn mount(&self, dev: Option<Arc<BlockDevice>>, args: &str) -> crate::Result<(FsSuper, Vnid)> {
        let dev = match dev {
            Some(dev) => dev,
            None => ramdisk(args)?,
        };
        log::debug!(
            "simplefs: formatting {} blocks of {} bytes on {}",
            dev.geometry().block_count(),
            dev.block_size(),
            dev.id()
        );
        let sb = Superblock {
            volume: Mutex::new(Volume::format(dev)),
        };
        Ok((Arc::new(sb), ROOT_VNID))
    }

    fn unmount(&self, sb: &FsSuper) -> crate::Result<()> {
        Ok(sync(sb)?)
    }

    fn sync(&self, sb: &FsSuper) -> crate::Result<()> {
        Ok(sync(sb)?)
    }

    fn lookup(&self, sb: &FsSuper, dir: &FsVnode, name: &str) -> crate::Result<Vnid> {
        Ok(volume(sb)?.lookup(vnid(dir)?, name)?)
    }

    fn get_vnode(&self, sb: &FsSuper, id: Vnid) -> crate::Result<(FsVnode, Mode)> {
        let mode = volume(sb)?.get(id)?.mode;
        Ok((Arc::new(Handle(id)), mode))
    }

    fn put_vnode(&self, _sb: &FsSuper, _vnode: &FsVnode) -> crate::Result<()> {
        Ok(())
    }

    fn remove_vnode(&self, sb: &FsSuper, vnode: &FsVnode) -> crate::Result<()> {
        Ok(volume(sb)?.remove(vnid(vnode)?)?)
    }

    fn open(&self, _sb: &FsSuper, _vnode: &FsVnode, _flags: OpenFlags) -> crate::Result<FsFile> {
        Ok(None)
    }

    fn close(&self, _sb: &FsSuper, _vnode: &FsVnode, _file: &mut FsFile) -> crate::Result<()> {
        Ok(())
    }

    fn release_fd(&self, _sb: &FsSuper, _vnode: &FsVnode, _file: FsFile) -> crate::Result<()> {
        Ok(())
    }

    fn fsync(&self, sb: &FsSuper, _vnode: &FsVnode) -> crate::Result<()> {
        Ok(sync(sb)?)
    }

    fn read(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        _file: &mut FsFile,
        pos: u64,
        buf: &mut [u8],
    ) -> crate::Result<usize> {
        Ok(volume(sb)?.read(vnid(vnode)?, pos, buf)?)
    }

    fn write(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        _file: &mut FsFile,
        pos: u64,
        buf: &[u8],
    ) -> crate::Result<usize> {
        Ok(volume(sb)?.write(vnid(vnode)?, pos, buf)?)
    }

    fn strategy(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        page: &PageCache,
        dir: IoDirection,
    ) -> crate::Result<()> {
        let id = vnid(vnode)?;
        let offset = page.offset();
        match dir {
            IoDirection::Read => {
                let volume = volume(sb)?;
                page.with_data_mut(|data| volume.read_page(id, offset, data))?;
            }
            IoDirection::Write => {
                let mut volume = volume(sb)?;
                page.with_data(|data| volume.write_page(id, offset, data))?;
            }
        }
        Ok(())
    }

    fn getdents(
        &self,
        sb: &FsSuper,
        dir: &FsVnode,
        _file: &mut FsFile,
        pos: u64,
        buf: &mut [u8],
    ) -> crate::Result<(usize, u64)> {
        let volume = volume(sb)?;
        let id = vnid(dir)?;
        let inode = volume.get(id)?;
        if !inode.mode.is_dir() {
            return Err(Error::NotDir.into());
        }

        let dots = [(".", id), ("..", inode.parent)];
        let entries = dots
            .into_iter()
            .chain(inode.entries.iter().map(|(name, &vnid)| (name.as_str(), vnid)));

        let mut writer = DirentWriter::new(buf);
        let mut next = pos;
        for (index, (name, vnid)) in entries.enumerate().skip(pos as usize) {
            let kind = kind_of(volume.get(vnid)?.mode);
            if !writer.push(vnid, index as u64 + 1, kind, name) {
                if writer.written() == 0 {
                    return Err(Error::InvalidArgs.into());
                }
                break;
            }
            next = index as u64 + 1;
        }
        Ok((writer.written(), next))
    }

    fn create(&self, sb: &FsSuper, dir: &FsVnode, name: &str, stat: &Stat) -> crate::Result<Vnid> {
        let stat = Stat {
            mode: Mode::regular(stat.mode.access()),
            ..*stat
        };
        Ok(volume(sb)?.link_new(vnid(dir)?, name, &stat)?)
    }

    fn unlink(&self, sb: &FsSuper, dir: &FsVnode, name: &str) -> crate::Result<()> {
        Ok(volume(sb)?.unlink(vnid(dir)?, name)?)
    }

    fn rename(
        &self,
        sb: &FsSuper,
        old_dir: &FsVnode,
        old_name: &str,
        new_dir: &FsVnode,
        new_name: &str,
    ) -> crate::Result<()> {
        Ok(volume(sb)?.rename(vnid(old_dir)?, old_name, vnid(new_dir)?, new_name)?)
    }

    fn mkdir(&self, sb: &FsSuper, dir: &FsVnode, name: &str, stat: &Stat) -> crate::Result<Vnid> {
        let stat = Stat {
            mode: Mode::dir(stat.mode.access()),
            ..*stat
        };
        Ok(volume(sb)?.link_new(vnid(dir)?, name, &stat)?)
    }

    fn rmdir(&self, sb: &FsSuper, dir: &FsVnode, name: &str) -> crate::Result<()> {
        Ok(volume(sb)?.rmdir(vnid(dir)?, name)?)
    }

    fn getattr(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        _mask: StatMask,
        stat: &mut Stat,
    ) -> crate::Result<()> {
        *stat = volume(sb)?.stat(vnid(vnode)?)?;
        Ok(())
    }

    fn setattr(
        &self,
        sb: &FsSuper,
        vnode: &FsVnode,
        stat: &Stat,
        mask: StatMask,
    ) -> crate::Result<()> {
        let mut volume = volume(sb)?;
        let id = vnid(vnode)?;
        if mask.contains(StatMask::SIZE) {
            volume.truncate(id, stat.size)?;
        }

        let inode = volume.get_mut(id)?;
        if mask.contains(StatMask::MODE_ACS) {
            inode.mode = inode.mode.with_access(stat.mode.access());
        }
        if mask.contains(StatMask::UID) {
            inode.uid = stat.uid;
        }
        if mask.contains(StatMask::GID) {
            inode.gid = stat.gid;
        }
        if mask.intersects(StatMask::MODE_ACS | StatMask::UID | StatMask::GID) {
            inode.ctime = now();
        }
        if mask.contains(StatMask::ATIME) {
            inode.atime = stat.atime;
        }
        if mask.contains(StatMask::MTIME) {
            inode.mtime = stat.mtime;
        }
        if mask.contains(StatMask::CTIME) {
            inode.ctime = stat.ctime;
        }
        Ok(())
    }
}
