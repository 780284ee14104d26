use bitvec::prelude::*;

use crate::block::allocator::{Allocator, BlockNo, Error, Result};

/// A bitmap-backed `Allocator` with a next-fit cursor.
#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    bits: BitBox<u64>,
    available: usize,
    cursor: usize,
}

impl BitmapAllocator {
    /// Constructs a bitmap for `block_count` blocks, all free.
    pub fn new(block_count: u64) -> Self {
        let count = block_count as usize;
        Self {
            bits: bitbox![u64, Lsb0; 0; count],
            available: count,
            cursor: 0,
        }
    }

    pub fn is_allocated(&self, blkno: BlockNo) -> bool {
        self.bits.get(blkno as usize).is_some_and(|bit| *bit)
    }

    fn span(&self, start: BlockNo, count: u64) -> Result<std::ops::Range<usize>> {
        let start = start as usize;
        let end = start.checked_add(count as usize).ok_or(Error::OutOfBounds)?;
        if end > self.bits.len() {
            return Err(Error::OutOfBounds);
        }
        Ok(start..end)
    }

    /// Marks an explicit span as allocated.
    pub fn reserve(&mut self, start: BlockNo, count: u64) -> Result<()> {
        let span = self.span(start, count)?;
        if self.bits[span.clone()].any() {
            return Err(Error::NoSpace);
        }
        self.bits[span].fill(true);
        self.available -= count as usize;
        Ok(())
    }

    /// Finds `count` contiguous free blocks, scanning from the cursor and wrapping once.
    fn find_free(&self, count: usize) -> Option<usize> {
        assert!(count != 0, "cannot allocate zero blocks");

        let len = self.bits.len();
        let mut start = self.cursor;
        for i in (self.cursor..len).chain(0..self.cursor) {
            if i == 0 {
                start = 0;
            }
            if self.bits[i] {
                start = i + 1;
                continue;
            }
            if i + 1 - start == count {
                return Some(start);
            }
        }
        None
    }
}

impl Allocator for BitmapAllocator {
    fn allocate(&mut self, count: u64) -> Result<BlockNo> {
        let count = count as usize;
        if count > self.available {
            return Err(Error::NoSpace);
        }
        let start = self.find_free(count).ok_or(Error::NoSpace)?;
        let end = start + count;
        self.bits[start..end].fill(true);
        self.available -= count;
        self.cursor = if end == self.bits.len() { 0 } else { end };
        Ok(start as BlockNo)
    }

    fn deallocate(&mut self, start: BlockNo, count: u64) -> Result<()> {
        let span = self.span(start, count)?;
        if self.bits[span.clone()].not_all() {
            return Err(Error::NotAllocated);
        }
        self.bits[span].fill(false);
        self.available += count as usize;
        Ok(())
    }

    fn available(&self) -> u64 {
        self.available as u64
    }

    fn capacity(&self) -> u64 {
        self.bits.len() as u64
    }
}
