//! Free-space tracking for filesystems that store data in device blocks.

pub mod bitmap;

/// Index of a block on a device.
pub type BlockNo = u64;

/// An implementation of `Allocator` can manage block allocation.
pub trait Allocator {
    /// Allocates `count` contiguous blocks, returning the first block number.
    fn allocate(&mut self, count: u64) -> Result<BlockNo>;

    /// Deallocates `count` blocks starting at `start`.
    fn deallocate(&mut self, start: BlockNo, count: u64) -> Result<()>;

    /// Returns the number of blocks available for allocation.
    fn available(&self) -> u64;

    /// Returns the number of blocks the allocator manages.
    fn capacity(&self) -> u64;
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    NoSpace,
    OutOfBounds,
    NotAllocated,
}

impl From<Error> for libc::c_int {
    fn from(err: Error) -> Self {
        match err {
            Error::NoSpace => libc::ENOSPC,
            Error::OutOfBounds => libc::EIO,
            Error::NotAllocated => libc::EIO,
        }
    }
}


#[macro_export]
macro_rules! test_allocator {
    ($allocator:ty) => {
        #[test]
        fn allocate() {
            $crate::block::allocator::tests::allocate::<$allocator>();
        }

        #[test]
        fn allocate_all() {
            $crate::block::allocator::tests::allocate_all::<$allocator>();
        }

        #[test]
        fn allocate_fragmented() {
            $crate::block::allocator::tests::allocate_fragmented::<$allocator>();
        }

        #[test]
        fn allocate_no_space() {
            $crate::block::allocator::tests::allocate_no_space::<$allocator>();
        }

        #[test]
        #[should_panic]
        fn allocate_zero() {
            $crate::block::allocator::tests::allocate_zero::<$allocator>();
        }

        #[test]
        fn deallocate_part() {
            $crate::block::allocator::tests::deallocate_part::<$allocator>();
        }

        #[test]
        fn deallocate_out_of_bounds() {
            $crate::block::allocator::tests::deallocate_out_of_bounds::<$allocator>();
        }

        #[test]
        fn deallocate_not_allocated() {
            $crate::block::allocator::tests::deallocate_not_allocated::<$allocator>();
        }

        #[test]
        fn available() {
            $crate::block::allocator::tests::available::<$allocator>();
        }
    };
}
