//! Inodes and their data blocks.

use std::{collections::BTreeMap, sync::Arc};

use super::error::{Error, Result};
use crate::{
    block::{Allocator, BitmapAllocator, BlockDevice, allocator::BlockNo},
    vfs::{MAX_FILE_SIZE, Mode, NAME_MAX, ROOT_VNID, Stat, Vnid, now},
};

/// One file or directory.
#[derive(Debug, Clone)]
pub struct Inode {
    pub mode: Mode,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Device block of each file block; `None` is a hole.
    pub blocks: Vec<Option<BlockNo>>,
    pub entries: BTreeMap<String, Vnid>,
    pub parent: Vnid,
}

impl Inode {
    fn new(mode: Mode, parent: Vnid) -> Self {
        let t = now();
        Self {
            mode,
            nlink: if mode.is_dir() { 2 } else { 1 },
            uid: 0,
            gid: 0,
            size: 0,
            atime: t,
            mtime: t,
            ctime: t,
            blocks: Vec::new(),
            entries: BTreeMap::new(),
            parent,
        }
    }

    fn touch_modified(&mut self) {
        let t = now();
        self.mtime = t;
        self.ctime = t;
    }
}

/// Checks a name for a new directory entry.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidName);
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// The mutable state of a mounted instance.
pub struct Volume {
    dev: Arc<BlockDevice>,
    block_size: u64,
    inodes: BTreeMap<Vnid, Inode>,
    next_vnid: Vnid,
    allocator: BitmapAllocator,
}

impl Volume {
    /// Creates an empty filesystem on `dev` holding only the root directory.
    pub fn format(dev: Arc<BlockDevice>) -> Self {
        let geometry = dev.geometry();
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT_VNID, Inode::new(Mode::dir(0o755), ROOT_VNID));
        Self {
            block_size: geometry.block_size as u64,
            allocator: BitmapAllocator::new(geometry.block_count()),
            dev,
            inodes,
            next_vnid: ROOT_VNID + 1,
        }
    }

    pub fn dev(&self) -> &Arc<BlockDevice> {
        &self.dev
    }

    pub fn get(&self, vnid: Vnid) -> Result<&Inode> {
        self.inodes.get(&vnid).ok_or(Error::InodeNotFound)
    }

    pub fn get_mut(&mut self, vnid: Vnid) -> Result<&mut Inode> {
        self.inodes.get_mut(&vnid).ok_or(Error::InodeNotFound)
    }

    fn dir(&self, vnid: Vnid) -> Result<&Inode> {
        let inode = self.get(vnid)?;
        if !inode.mode.is_dir() {
            return Err(Error::NotDir);
        }
        Ok(inode)
    }

    fn regular(&self, vnid: Vnid) -> Result<&Inode> {
        let inode = self.get(vnid)?;
        if inode.mode.is_dir() {
            return Err(Error::IsDir);
        }
        Ok(inode)
    }

    pub fn lookup(&self, dir: Vnid, name: &str) -> Result<Vnid> {
        let inode = self.dir(dir)?;
        match name {
            "." => Ok(dir),
            ".." => Ok(inode.parent),
            _ => inode
                .entries
                .get(name)
                .copied()
                .ok_or(Error::DirEntryNotFound),
        }
    }

    /// Adds a new inode named `name` to `dir`.
    pub fn link_new(&mut self, dir: Vnid, name: &str, stat: &Stat) -> Result<Vnid> {
        check_name(name)?;
        if self.dir(dir)?.entries.contains_key(name) {
            return Err(Error::DirEntryExists);
        }

        let vnid = self.next_vnid;
        self.next_vnid += 1;
        let mut inode = Inode::new(stat.mode, dir);
        inode.uid = stat.uid;
        inode.gid = stat.gid;
        self.inodes.insert(vnid, inode);

        let parent = self.get_mut(dir)?;
        parent.entries.insert(name.to_owned(), vnid);
        if stat.mode.is_dir() {
            parent.nlink += 1;
        }
        parent.touch_modified();
        Ok(vnid)
    }

    pub fn unlink(&mut self, dir: Vnid, name: &str) -> Result<()> {
        let vnid = self.lookup(dir, name)?;
        if self.get(vnid)?.mode.is_dir() {
            return Err(Error::IsDir);
        }
        self.get_mut(dir)?.entries.remove(name);
        self.get_mut(dir)?.touch_modified();
        let inode = self.get_mut(vnid)?;
        inode.nlink = inode.nlink.saturating_sub(1);
        inode.ctime = now();
        Ok(())
    }

    pub fn rmdir(&mut self, dir: Vnid, name: &str) -> Result<()> {
        check_name(name)?;
        let vnid = self.lookup(dir, name)?;
        let target = self.dir(vnid)?;
        if !target.entries.is_empty() {
            return Err(Error::DirNotEmpty);
        }
        self.get_mut(vnid)?.nlink = 0;
        let parent = self.get_mut(dir)?;
        parent.entries.remove(name);
        parent.nlink -= 1;
        parent.touch_modified();
        Ok(())
    }

    /// Whether `vnid` is `ancestor` or lies below it.
    fn is_within(&self, mut vnid: Vnid, ancestor: Vnid) -> Result<bool> {
        loop {
            if vnid == ancestor {
                return Ok(true);
            }
            if vnid == ROOT_VNID {
                return Ok(false);
            }
            vnid = self.get(vnid)?.parent;
        }
    }

    pub fn rename(
        &mut self,
        old_dir: Vnid,
        old_name: &str,
        new_dir: Vnid,
        new_name: &str,
    ) -> Result<()> {
        check_name(old_name)?;
        check_name(new_name)?;
        self.dir(new_dir)?;
        let vnid = self.lookup(old_dir, old_name)?;
        if old_dir == new_dir && old_name == new_name {
            return Ok(());
        }
        let is_dir = self.get(vnid)?.mode.is_dir();
        if is_dir && self.is_within(new_dir, vnid)? {
            return Err(Error::InvalidMove);
        }

        if let Ok(target) = self.lookup(new_dir, new_name) {
            if target == vnid {
                return Ok(());
            }
            let target_inode = self.get(target)?;
            match (is_dir, target_inode.mode.is_dir()) {
                (true, true) if !target_inode.entries.is_empty() => {
                    return Err(Error::DirNotEmpty);
                }
                (true, true) => {
                    self.get_mut(target)?.nlink = 0;
                    self.get_mut(new_dir)?.nlink -= 1;
                }
                (false, true) => return Err(Error::IsDir),
                (true, false) => return Err(Error::NotDir),
                (false, false) => {
                    let inode = self.get_mut(target)?;
                    inode.nlink = inode.nlink.saturating_sub(1);
                }
            }
            self.get_mut(new_dir)?.entries.remove(new_name);
        }

        let old = self.get_mut(old_dir)?;
        old.entries.remove(old_name);
        if is_dir {
            old.nlink -= 1;
        }
        old.touch_modified();
        let new = self.get_mut(new_dir)?;
        new.entries.insert(new_name.to_owned(), vnid);
        if is_dir {
            new.nlink += 1;
        }
        new.touch_modified();

        let inode = self.get_mut(vnid)?;
        inode.parent = new_dir;
        inode.ctime = now();
        Ok(())
    }

    /// Frees an inode whose last link is gone.
    pub fn remove(&mut self, vnid: Vnid) -> Result<()> {
        if self.get(vnid)?.nlink > 0 {
            return Ok(());
        }
        let inode = self.inodes.remove(&vnid).ok_or(Error::InodeNotFound)?;
        for blkno in inode.blocks.into_iter().flatten() {
            self.allocator.deallocate(blkno, 1)?;
        }
        log::debug!("freed inode {vnid}");
        Ok(())
    }

    fn fill(&self, stat: &mut Stat, vnid: Vnid) -> Result<()> {
        let inode = self.get(vnid)?;
        *stat = Stat {
            vnid,
            dev: self.dev.id().raw(),
            mode: inode.mode,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            rdev: 0,
            size: inode.size,
            blksize: self.block_size as u32,
            blocks: inode.blocks.iter().flatten().count() as u64 * self.block_size / 512,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        };
        Ok(())
    }

    pub fn stat(&self, vnid: Vnid) -> Result<Stat> {
        let mut stat = Stat::default();
        self.fill(&mut stat, vnid)?;
        Ok(stat)
    }

    /// Number of free data blocks.
    pub fn available(&self) -> u64 {
        self.allocator.available()
    }

    /// Device block holding file block `index`, allocating a zeroed one if needed.
    fn block_for_write(&mut self, vnid: Vnid, index: usize) -> Result<BlockNo> {
        if let Some(Some(blkno)) = self.get(vnid)?.blocks.get(index) {
            return Ok(*blkno);
        }
        let blkno = self.allocator.allocate(1)?;
        let zeroes = vec![0u8; self.block_size as usize];
        if let Err(e) = self.dev.buffer_get(blkno).and_then(|buf| buf.write(0, &zeroes)) {
            self.allocator.deallocate(blkno, 1)?;
            return Err(e.into());
        }

        let inode = self.get_mut(vnid)?;
        if inode.blocks.len() <= index {
            inode.blocks.resize(index + 1, None);
        }
        inode.blocks[index] = Some(blkno);
        Ok(blkno)
    }

    /// Splits a byte range into `(file block, offset in block, len)` pieces.
    fn chunks(&self, pos: u64, len: usize) -> Vec<(usize, usize, usize)> {
        let bs = self.block_size;
        let mut out = Vec::new();
        let mut done = 0;
        while done < len {
            let off = pos + done as u64;
            let in_block = (off % bs) as usize;
            let chunk = (bs as usize - in_block).min(len - done);
            out.push(((off / bs) as usize, in_block, chunk));
            done += chunk;
        }
        out
    }

    pub fn read(&self, vnid: Vnid, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.regular(vnid)?;
        if pos >= inode.size {
            return Ok(0);
        }
        let len = buf.len().min((inode.size - pos).min(usize::MAX as u64) as usize);

        let mut done = 0;
        for (index, in_block, chunk) in self.chunks(pos, len) {
            let out = &mut buf[done..done + chunk];
            match inode.blocks.get(index).copied().flatten() {
                Some(blkno) => self.dev.buffer_get(blkno)?.read(in_block, out)?,
                None => out.fill(0),
            }
            done += chunk;
        }
        Ok(done)
    }

    pub fn write(&mut self, vnid: Vnid, pos: u64, buf: &[u8]) -> Result<usize> {
        self.regular(vnid)?;
        if pos.checked_add(buf.len() as u64).is_none_or(|end| end > MAX_FILE_SIZE) {
            return Err(Error::FileTooLarge);
        }

        let mut done = 0;
        for (index, in_block, chunk) in self.chunks(pos, buf.len()) {
            let res = self
                .block_for_write(vnid, index)
                .and_then(|blkno| Ok(self.dev.buffer_get(blkno)?))
                .and_then(|b| Ok(b.write(in_block, &buf[done..done + chunk])?));
            if let Err(e) = res {
                if done == 0 {
                    return Err(e);
                }
                break;
            }
            done += chunk;
        }

        let inode = self.get_mut(vnid)?;
        inode.size = inode.size.max(pos + done as u64);
        inode.touch_modified();
        Ok(done)
    }

    /// Sets the size of a file. Blocks past the end are freed and the tail of the last block is
    /// zeroed.
    pub fn truncate(&mut self, vnid: Vnid, size: u64) -> Result<()> {
        self.regular(vnid)?;
        let bs = self.block_size;
        let keep = size.div_ceil(bs) as usize;

        let inode = self.get_mut(vnid)?;
        let freed: Vec<BlockNo> = if inode.blocks.len() > keep {
            inode.blocks.drain(keep..).flatten().collect()
        } else {
            Vec::new()
        };
        inode.size = size;
        inode.touch_modified();
        let tail_block = inode.blocks.get(keep.wrapping_sub(1)).copied().flatten();

        for blkno in freed {
            self.allocator.deallocate(blkno, 1)?;
        }
        let tail = (size % bs) as usize;
        if let (Some(blkno), true) = (tail_block, tail != 0) {
            let zeroes = vec![0u8; bs as usize - tail];
            self.dev.buffer_get(blkno)?.write(tail, &zeroes)?;
        }
        Ok(())
    }

    /// Fills `data`, the cached page at file offset `offset`, from the file's blocks.
    pub fn read_page(&self, vnid: Vnid, offset: u64, data: &mut [u8]) -> Result<()> {
        let inode = self.regular(vnid)?;
        let bs = self.block_size as usize;
        for (i, out) in data.chunks_mut(bs).enumerate() {
            let index = (offset / self.block_size) as usize + i;
            match inode.blocks.get(index).copied().flatten() {
                Some(blkno) => self.dev.buffer_get(blkno)?.read(0, out)?,
                None => out.fill(0),
            }
        }
        Ok(())
    }

    /// Stores `data`, the cached page at file offset `offset`, into blocks below the file size.
    pub fn write_page(&mut self, vnid: Vnid, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.regular(vnid)?.size;
        let bs = self.block_size as usize;
        for (i, chunk) in data.chunks(bs).enumerate() {
            let start = offset + (i * bs) as u64;
            if start >= size {
                break;
            }
            let index = (start / self.block_size) as usize;
            let blkno = self.block_for_write(vnid, index)?;
            self.dev.buffer_get(blkno)?.write(0, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{
        DevId, DeviceRegistry, Geometry, allocator,
        storage::{MemStorage, StorageDevice},
    };

    fn volume(block_size: u32, capacity: u64) -> Volume {
        let registry = DeviceRegistry::default();
        let dev = registry
            .register(
                DevId::new(1, 0),
                Geometry::new(512, block_size, capacity),
                Arc::new(StorageDevice::new(MemStorage::new(capacity))),
            )
            .unwrap();
        Volume::format(dev)
    }

    fn file(vol: &mut Volume, name: &str) -> Vnid {
        let stat = Stat {
            mode: Mode::regular(0o644),
            ..Default::default()
        };
        vol.link_new(ROOT_VNID, name, &stat).unwrap()
    }

    fn dir(vol: &mut Volume, parent: Vnid, name: &str) -> Vnid {
        let stat = Stat {
            mode: Mode::dir(0o755),
            ..Default::default()
        };
        vol.link_new(parent, name, &stat).unwrap()
    }

    #[test]
    fn write_spanning_blocks() {
        let mut vol = volume(1024, 1 << 16);
        let vnid = file(&mut vol, "a");
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        assert_eq!(vol.write(vnid, 500, &data).unwrap(), 3000);
        assert_eq!(vol.get(vnid).unwrap().size, 3500);

        let mut out = vec![0xFFu8; 3500];
        assert_eq!(vol.read(vnid, 0, &mut out).unwrap(), 3500);
        assert!(out[..500].iter().all(|&b| b == 0));
        assert_eq!(&out[500..], &data[..]);
    }

    #[test]
    fn holes_read_as_zeroes() {
        let mut vol = volume(1024, 1 << 16);
        let vnid = file(&mut vol, "a");
        vol.write(vnid, 5000, b"x").unwrap();
        assert_eq!(vol.get(vnid).unwrap().blocks.iter().flatten().count(), 1);

        let mut out = [0xFFu8; 10];
        vol.read(vnid, 100, &mut out).unwrap();
        assert_eq!(out, [0; 10]);
    }

    #[test]
    fn truncate_frees_blocks_and_zeroes_tail() {
        let mut vol = volume(1024, 1 << 16);
        let before = vol.available();
        let vnid = file(&mut vol, "a");
        vol.write(vnid, 0, &[7u8; 4096]).unwrap();
        assert_eq!(vol.available(), before - 4);

        vol.truncate(vnid, 1500).unwrap();
        assert_eq!(vol.available(), before - 2);
        vol.truncate(vnid, 4096).unwrap();

        let mut out = [0u8; 4096];
        vol.read(vnid, 0, &mut out).unwrap();
        assert!(out[..1500].iter().all(|&b| b == 7));
        assert!(out[1500..].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_space() {
        let mut vol = volume(1024, 4096);
        let vnid = file(&mut vol, "a");
        assert_eq!(vol.write(vnid, 0, &[1u8; 8192]).unwrap(), 4096);
        assert_eq!(
            vol.write(vnid, 8192, b"x"),
            Err(Error::Allocator(allocator::Error::NoSpace))
        );
    }

    #[test]
    fn directory_entries() {
        let mut vol = volume(1024, 1 << 16);
        let sub = dir(&mut vol, ROOT_VNID, "sub");
        assert_eq!(vol.get(ROOT_VNID).unwrap().nlink, 3);
        assert_eq!(vol.lookup(sub, "..").unwrap(), ROOT_VNID);
        assert_eq!(vol.lookup(sub, ".").unwrap(), sub);
        assert_eq!(vol.lookup(ROOT_VNID, "nope"), Err(Error::DirEntryNotFound));

        let vnid = file(&mut vol, "f");
        assert_eq!(vol.lookup(vnid, "x"), Err(Error::NotDir));
        assert_eq!(vol.link_new(ROOT_VNID, "f", &Stat::default()), Err(Error::DirEntryExists));
        assert_eq!(vol.link_new(ROOT_VNID, "a/b", &Stat::default()), Err(Error::InvalidName));
    }

    #[test]
    fn unlink_defers_free_until_remove() {
        let mut vol = volume(1024, 1 << 16);
        let before = vol.available();
        let vnid = file(&mut vol, "f");
        vol.write(vnid, 0, b"data").unwrap();
        vol.unlink(ROOT_VNID, "f").unwrap();
        assert_eq!(vol.get(vnid).unwrap().nlink, 0);
        assert_eq!(vol.available(), before - 1);

        vol.remove(vnid).unwrap();
        assert_eq!(vol.available(), before);
        assert_eq!(vol.get(vnid).unwrap_err(), Error::InodeNotFound);
    }

    #[test]
    fn rmdir_requires_empty_dir() {
        let mut vol = volume(1024, 1 << 16);
        let sub = dir(&mut vol, ROOT_VNID, "sub");
        dir(&mut vol, sub, "inner");
        assert_eq!(vol.rmdir(ROOT_VNID, "sub"), Err(Error::DirNotEmpty));
        vol.rmdir(sub, "inner").unwrap();
        vol.rmdir(ROOT_VNID, "sub").unwrap();
        assert_eq!(vol.get(ROOT_VNID).unwrap().nlink, 2);
    }

    #[test]
    fn rename_moves_and_replaces() {
        let mut vol = volume(1024, 1 << 16);
        let a = dir(&mut vol, ROOT_VNID, "a");
        let b = dir(&mut vol, ROOT_VNID, "b");
        let f = file(&mut vol, "f");
        let g = file(&mut vol, "g");

        vol.rename(ROOT_VNID, "f", a, "f2").unwrap();
        assert_eq!(vol.lookup(a, "f2").unwrap(), f);
        assert_eq!(vol.lookup(ROOT_VNID, "f"), Err(Error::DirEntryNotFound));

        vol.rename(ROOT_VNID, "g", a, "f2").unwrap();
        assert_eq!(vol.lookup(a, "f2").unwrap(), g);
        assert_eq!(vol.get(f).unwrap().nlink, 0);

        vol.rename(ROOT_VNID, "b", a, "b").unwrap();
        assert_eq!(vol.lookup(b, "..").unwrap(), a);
        assert_eq!(vol.rename(ROOT_VNID, "a", b, "a"), Err(Error::InvalidMove));
        assert_eq!(vol.rename(a, "f2", ROOT_VNID, "a"), Err(Error::IsDir));
    }
}
