use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use libc::EIO;

use crate::{
    block::storage::Storage,
    error::{IntoErrno, Result},
};

/// Storage that uses a file to store data.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Opens a file to be used as `FileStorage`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .into_errno()?;
        Ok(Self { file })
    }

    /// Creates a file of `capacity` bytes to be used as `FileStorage`.
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .into_errno()?;
        Self::from_file(file, capacity)
    }

    /// Wraps an already open file, resizing it to `capacity` bytes.
    pub fn from_file(file: File, capacity: u64) -> Result<Self> {
        file.set_len(capacity).into_errno()?;
        Ok(Self { file })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64).ok_or(EIO)?;
        if end > self.capacity()? {
            return Err(EIO);
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file.read_exact_at(buf, offset).into_errno()
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.file.write_all_at(buf, offset).into_errno()
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.file.metadata().into_errno()?.len())
    }
}
