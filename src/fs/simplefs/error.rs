use crate::block::allocator;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Device(libc::c_int),
    Allocator(allocator::Error),

    /// A handle of another filesystem was passed in.
    ForeignHandle,
    InvalidArgs,

    // Inode
    InodeNotFound,

    // Dir entry
    InvalidName,
    NameTooLong,
    DirEntryNotFound,
    DirEntryExists,

    // Dir
    DirNotEmpty,
    IsDir,
    NotDir,
    InvalidMove,

    FileTooLarge,
}

impl From<libc::c_int> for Error {
    fn from(errno: libc::c_int) -> Self {
        Self::Device(errno)
    }
}

impl From<allocator::Error> for Error {
    fn from(err: allocator::Error) -> Self {
        Self::Allocator(err)
    }
}

impl From<Error> for libc::c_int {
    fn from(err: Error) -> Self {
        match err {
            Error::Device(errno) => errno,
            Error::Allocator(err) => err.into(),
            Error::ForeignHandle => libc::EINVAL,
            Error::InvalidArgs => libc::EINVAL,
            Error::InodeNotFound => libc::ENOENT,
            Error::InvalidName => libc::EINVAL,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::DirEntryNotFound => libc::ENOENT,
            Error::DirEntryExists => libc::EEXIST,
            Error::DirNotEmpty => libc::ENOTEMPTY,
            Error::IsDir => libc::EISDIR,
            Error::NotDir => libc::ENOTDIR,
            Error::InvalidMove => libc::EINVAL,
            Error::FileTooLarge => libc::EFBIG,
        }
    }
}
