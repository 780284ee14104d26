use libc::EIO;

use crate::{block::storage::Storage, error::Result};

/// Zero-initialized storage held in memory.
#[derive(Debug)]
pub struct MemStorage {
    bytes: Box<[u8]>,
}

impl MemStorage {
    pub fn new(capacity: u64) -> Self {
        Self {
            bytes: vec![0u8; capacity as usize].into_boxed_slice(),
        }
    }

    fn window(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| EIO)?;
        let end = start.checked_add(len).ok_or(EIO)?;
        if end > self.bytes.len() {
            return Err(EIO);
        }
        Ok(start..end)
    }
}

impl Storage for MemStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let window = self.window(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[window]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let window = self.window(offset, buf.len())?;
        self.bytes[window].copy_from_slice(buf);
        Ok(())
    }

    fn capacity(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}
