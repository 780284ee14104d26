//! Byte-addressed backing stores and the device driver that serves block requests from them.

pub mod file;
pub mod mem;

pub use file::FileStorage;
pub use mem::MemStorage;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{
    block::{DevId, DeviceOps, IoDirection},
    error::Result,
    pcache::PageCache,
};

/// An implementation of `Storage` allows reading and writing bytes at device offsets, as well as
/// determining the capacity.
pub trait Storage: Send {
    /// Fills `buf` with the bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Writes `buf` at `offset`.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Returns the number of bytes the storage can hold.
    fn capacity(&self) -> Result<u64>;
}

/// A block device driver backed by a [`Storage`].
#[derive(Debug)]
pub struct StorageDevice<S> {
    storage: Mutex<S>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<S: Storage> StorageDevice<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage: Mutex::new(storage),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn with_storage<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.storage.lock())
    }

    pub fn with_storage_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.storage.lock())
    }

    /// Number of blocks read from the storage so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of blocks written to the storage so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<S: Storage> DeviceOps for StorageDevice<S> {
    fn strategy(&self, devid: DevId, page: &PageCache, dir: IoDirection) -> Result<()> {
        let buffers = page.buffers();
        log::trace!(
            "{devid}: {dir:?} page {:#x} ({} blocks)",
            page.offset(),
            buffers.len()
        );

        page.with_data_mut(|data| {
            let mut storage = self.storage.lock();
            for buf in &buffers {
                let window = &mut data[buf.range()];
                match dir {
                    IoDirection::Read => {
                        storage.read_at(window, buf.dev_offset())?;
                        self.reads.fetch_add(1, Ordering::Relaxed);
                    }
                    IoDirection::Write => {
                        storage.write_at(window, buf.dev_offset())?;
                        self.writes.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(())
        })
    }
}


#[macro_export]
macro_rules! test_storage {
    ($storage:ty) => {
        #[test]
        fn capacity() {
            $crate::block::storage::tests::capacity::<$storage>();
        }

        #[test]
        fn write_and_read() {
            $crate::block::storage::tests::write_and_read::<$storage>();
        }

        #[test]
        fn starts_zeroed() {
            $crate::block::storage::tests::starts_zeroed::<$storage>();
        }

        #[test]
        fn no_interference() {
            $crate::block::storage::tests::no_interference::<$storage>();
        }

        #[test]
        fn out_of_bounds() {
            $crate::block::storage::tests::out_of_bounds::<$storage>();
        }

        #[test]
        fn overwrite() {
            $crate::block::storage::tests::overwrite::<$storage>();
        }
    };
}
