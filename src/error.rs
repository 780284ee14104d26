use std::io;

use libc::{
    EBADF, EBUSY, EEXIST, EFBIG, EINVAL, EIO, EISDIR, ENAMETOOLONG, ENOENT, ENOMEM, ENOSPC, ENOSYS,
    ENOTDIR, ENOTEMPTY, EROFS, EXDEV,
};

/// Errno-carrying result used throughout the crate.
pub type Result<T> = core::result::Result<T, libc::c_int>;

/// Error codes a caller of the VFS may observe.
pub const TAXONOMY: &[libc::c_int] = &[
    EBADF,
    ENOENT,
    ENOTDIR,
    EISDIR,
    ENOSYS,
    ENOMEM,
    EIO,
    EROFS,
    EXDEV,
    EFBIG,
    EINVAL,
    EBUSY,
    EEXIST,
    ENOTEMPTY,
    ENOSPC,
    ENAMETOOLONG,
];

/// Maps a driver error outside of [`TAXONOMY`] to `EIO`.
pub fn coerce(errno: libc::c_int) -> libc::c_int {
    if TAXONOMY.contains(&errno) {
        errno
    } else {
        log::warn!("coercing driver error {errno} to EIO");
        EIO
    }
}

/// Maps a driver error outside of `allowed` to `EIO`.
pub fn coerce_to(errno: libc::c_int, allowed: &[libc::c_int]) -> libc::c_int {
    if errno == EIO || allowed.contains(&errno) {
        errno
    } else {
        log::warn!("coercing driver error {errno} to EIO");
        EIO
    }
}

pub trait IntoErrno {
    type T;

    fn into_errno(self) -> Result<Self::T>;
}

impl<T> IntoErrno for io::Result<T> {
    type T = T;

    fn into_errno(self) -> Result<Self::T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(e.raw_os_error().unwrap_or(EIO)),
        }
    }
}
