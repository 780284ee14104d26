//! Block buffers: device-block-sized windows onto cached pages.

use std::{
    ops::Range,
    sync::{Arc, Weak},
};

use libc::{EINVAL, EIO};

use crate::{
    block::{BlockDevice, Geometry},
    error::Result,
    pcache::{PageCache, PageRef},
};

/// Maps one device block onto a region of a cached page.
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    page_offset: usize,
    dev_offset: u64,
    len: usize,
    page: Weak<PageCache>,
}

impl BlockBuffer {
    /// Byte offset of the block within its page.
    pub fn page_offset(&self) -> usize {
        self.page_offset
    }

    /// Byte offset of the block on the device.
    pub fn dev_offset(&self) -> u64 {
        self.dev_offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Range of the page covered by this block.
    pub fn range(&self) -> Range<usize> {
        self.page_offset..self.page_offset + self.len
    }

    /// The page this buffer belongs to, if it is still alive.
    pub fn page(&self) -> Option<Arc<PageCache>> {
        self.page.upgrade()
    }
}

/// Creates one buffer per device block in the page unless the page is already mapped.
///
/// Blocks past the device capacity are left unmapped. Returns the number of mapped buffers.
pub(crate) fn map_to_page(page: &PageRef, geometry: &Geometry) -> usize {
    let size = page.size();
    let block = geometry.block_size as usize;
    let mut buffers = page.buffers_mut();
    if !buffers.is_empty() {
        return buffers.len();
    }

    let owner = Arc::downgrade(page.page_arc());
    for page_offset in (0..size).step_by(block) {
        let dev_offset = page.offset() + page_offset as u64;
        if dev_offset + block as u64 > geometry.capacity {
            break;
        }
        buffers.push(BlockBuffer {
            page_offset,
            dev_offset,
            len: block,
            page: owner.clone(),
        });
    }
    buffers.len()
}

/// Frees every buffer mapped on `page`.
pub fn unmap(page: &PageCache) {
    page.buffers_mut().clear();
}

/// A held block buffer. The page stays cached until this is dropped.
#[derive(Debug)]
pub struct BufferRef {
    page: PageRef,
    range: Range<usize>,
    blkno: u64,
}

impl BufferRef {
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    pub fn page(&self) -> &PageRef {
        &self.page
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.range.len()
    }

    fn window(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        if offset + len > self.size() {
            return Err(EINVAL);
        }
        let start = self.range.start + offset;
        Ok(start..start + len)
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.page.with_data(|data| f(&data[self.range.clone()]))
    }

    /// Copies block bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let window = self.window(offset, buf.len())?;
        self.page.read(window.start, buf)
    }

    /// Copies `buf` into the block at `offset` and marks the page dirty.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let window = self.window(offset, buf.len())?;
        self.page.write(window.start, buf)
    }

    pub fn mark_dirty(&self) -> Result<()> {
        self.page.mark_dirty()
    }
}

impl BlockDevice {
    /// Returns the buffer of block `blkno`, reading its page on a miss.
    pub fn buffer_get(&self, blkno: u64) -> Result<BufferRef> {
        let geometry = self.geometry();
        if blkno >= geometry.block_count() {
            return Err(EINVAL);
        }

        let block = geometry.block_size as u64;
        let dev_offset = blkno * block;
        let page_offset = dev_offset - dev_offset % self.page_size() as u64;
        let page = self.page_cache_get(page_offset)?;
        map_to_page(&page, &geometry);

        let index = ((dev_offset - page_offset) / block) as usize;
        let range = page.buffers_mut().get(index).map(BlockBuffer::range).ok_or(EIO)?;
        Ok(BufferRef { page, range, blkno })
    }
}
