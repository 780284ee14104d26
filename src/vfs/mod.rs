//! The virtual file system: vnodes, mounts, the filesystem table, I/O contexts and the
//! process-facing operations.

pub mod attr;
pub mod calls;
pub mod dirent;
pub mod file;
pub mod fstbl;
pub mod ioctx;
pub mod mount;
pub mod ops;
pub mod path;
pub mod vnode;

pub use attr::{Mode, Stat, StatMask};
pub use calls::{FsCalls, FsFile, FsSuper, FsVnode};
pub use file::{Fd, FileDescriptor};
pub use fstbl::{FsContainer, FsFlags, FsTable};
pub use ioctx::IoContext;
pub use mount::{Mount, MountFlags, MountTable};
pub use vnode::{Vnode, VnodeFlags, VnodeGuard};

use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

/// Identifies a vnode within its mount.
pub type Vnid = u64;

/// Identifies a mount.
pub type MountId = u32;

pub const ROOT_VNID: Vnid = 1;
pub const INVALID_VNID: Vnid = 0;
pub const INVALID_MNTID: MountId = 0;

/// Longest accepted path, in bytes.
pub const PATH_MAX: usize = 1024;
/// Longest accepted path component, in bytes.
pub const NAME_MAX: usize = 255;

/// Largest file offset a read or write may reach.
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

bitflags! {
    /// Flags accepted by `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x0000_0001;
        const WRONLY = 0x0000_0002;
        const RDWR = 0x0000_0003;
        const CREAT = 0x0000_0010;
        const EXCL = 0x0000_0020;
        const NOCTTY = 0x0000_0040;
        const TRUNC = 0x0000_0100;
        const APPEND = 0x0000_0200;
        const NONBLOCK = 0x0000_0400;
        const SYNC = 0x0000_1000;
        const DIRECTORY = 0x0002_0000;
        const NOFOLLOW = 0x0004_0000;
        const NOATIME = 0x0008_0000;
        const CLOEXEC = 0x0080_0000;
    }
}

impl OpenFlags {
    /// Mask of the access-mode bits.
    pub const ACCMODE: Self = Self::RDWR;

    pub fn readable(self) -> bool {
        self.contains(Self::RDONLY)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRONLY)
    }
}

/// `lseek` origins, including the data/hole extensions.
pub const SEEK_SET: libc::c_int = libc::SEEK_SET;
pub const SEEK_CUR: libc::c_int = libc::SEEK_CUR;
pub const SEEK_END: libc::c_int = libc::SEEK_END;
pub const SEEK_DATA: libc::c_int = libc::SEEK_DATA;
pub const SEEK_HOLE: libc::c_int = libc::SEEK_HOLE;

/// Seconds since the UNIX epoch, used for file timestamps.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_modes() {
        assert!(OpenFlags::RDONLY.readable());
        assert!(!OpenFlags::RDONLY.writable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::RDWR.readable() && OpenFlags::RDWR.writable());
        assert!(!OpenFlags::CREAT.readable());
    }

    #[test]
    fn flag_values() {
        assert_eq!(OpenFlags::CLOEXEC.bits(), 0x80_0000);
        assert_eq!(OpenFlags::DIRECTORY.bits(), 0x2_0000);
        assert_eq!((OpenFlags::RDWR | OpenFlags::APPEND).bits(), 0x203);
    }
}
