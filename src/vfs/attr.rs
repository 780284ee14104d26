//! File attributes and the masks that select them.

use std::fmt;

use bitflags::bitflags;

use crate::vfs::Vnid;

/// File type and access bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Mode(pub u32);

impl Mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
    /// Permission, setuid, setgid and sticky bits.
    pub const ACCESS_MASK: u32 = 0o7777;

    pub const fn new(file_type: u32, access: u32) -> Self {
        Self((file_type & Self::S_IFMT) | (access & Self::ACCESS_MASK))
    }

    pub const fn dir(access: u32) -> Self {
        Self::new(Self::S_IFDIR, access)
    }

    pub const fn regular(access: u32) -> Self {
        Self::new(Self::S_IFREG, access)
    }

    pub const fn file_type(self) -> u32 {
        self.0 & Self::S_IFMT
    }

    pub const fn access(self) -> u32 {
        self.0 & Self::ACCESS_MASK
    }

    pub const fn is_dir(self) -> bool {
        self.file_type() == Self::S_IFDIR
    }

    pub const fn is_regular(self) -> bool {
        self.file_type() == Self::S_IFREG
    }

    /// Keeps the file type and replaces the access bits.
    pub const fn with_access(self, access: u32) -> Self {
        Self::new(self.file_type(), access)
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mode({:#o})", self.0)
    }
}

bitflags! {
    /// Selects the fields of a [`Stat`] an operation reads or writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatMask: u32 {
        const VNID = 0x0001;
        const DEV = 0x0002;
        const MODE_FMT = 0x0004;
        const MODE_ACS = 0x0008;
        const NLINK = 0x0010;
        const UID = 0x0020;
        const GID = 0x0040;
        const RDEV = 0x0080;
        const SIZE = 0x0100;
        const BLKSIZE = 0x0200;
        const NRBLKS = 0x0400;
        const ATIME = 0x0800;
        const MTIME = 0x1000;
        const CTIME = 0x2000;
    }
}

impl StatMask {
    /// Fields copied from the caller when a file is created.
    pub const CREATE: Self = Self::MODE_FMT
        .union(Self::MODE_ACS)
        .union(Self::UID)
        .union(Self::GID);
    pub const TIMES: Self = Self::ATIME.union(Self::MTIME).union(Self::CTIME);
    /// Fields `setattr` accepts.
    pub const SETATTR: Self = Self::MODE_ACS
        .union(Self::UID)
        .union(Self::GID)
        .union(Self::SIZE)
        .union(Self::TIMES);
    /// Fields `getattr` may return.
    pub const GETATTR: Self = Self::all();
}

/// Attributes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub vnid: Vnid,
    pub dev: u64,
    pub mode: Mode,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Stat {
    /// Copies the fields of `src` selected by `mask` into `self`, leaving the others alone.
    pub fn copy_masked(&mut self, src: &Stat, mask: StatMask) {
        if mask.contains(StatMask::VNID) {
            self.vnid = src.vnid;
        }
        if mask.contains(StatMask::DEV) {
            self.dev = src.dev;
        }
        if mask.contains(StatMask::MODE_FMT) {
            self.mode = Mode::new(src.mode.file_type(), self.mode.access());
        }
        if mask.contains(StatMask::MODE_ACS) {
            self.mode = self.mode.with_access(src.mode.access());
        }
        if mask.contains(StatMask::NLINK) {
            self.nlink = src.nlink;
        }
        if mask.contains(StatMask::UID) {
            self.uid = src.uid;
        }
        if mask.contains(StatMask::GID) {
            self.gid = src.gid;
        }
        if mask.contains(StatMask::RDEV) {
            self.rdev = src.rdev;
        }
        if mask.contains(StatMask::SIZE) {
            self.size = src.size;
        }
        if mask.contains(StatMask::BLKSIZE) {
            self.blksize = src.blksize;
        }
        if mask.contains(StatMask::NRBLKS) {
            self.blocks = src.blocks;
        }
        if mask.contains(StatMask::ATIME) {
            self.atime = src.atime;
        }
        if mask.contains(StatMask::MTIME) {
            self.mtime = src.mtime;
        }
        if mask.contains(StatMask::CTIME) {
            self.ctime = src.ctime;
        }
    }
}
