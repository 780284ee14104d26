//! Directory-entry records returned by `getdents`.
//!
//! Each record is a fixed header followed by the name, padded to an 8-byte boundary.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{U16, U64},
};

use crate::vfs::{Mode, NAME_MAX, Vnid};

const RECORD_ALIGN: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DirentHeader {
    pub vnid: U64,
    /// Directory position of the entry after this one.
    pub next: U64,
    pub reclen: U16,
    /// File type bits of the entry, shifted down like `DT_*`.
    pub kind: u8,
    pub namelen: u8,
    reserved: [u8; 4],
}

pub const HEADER_SIZE: usize = size_of::<DirentHeader>();

/// Length of the record that holds `name`.
pub fn record_len(name: &str) -> usize {
    (HEADER_SIZE + name.len()).next_multiple_of(RECORD_ALIGN)
}

/// Directory-entry type of a mode, as stored in [`DirentHeader::kind`].
pub fn kind_of(mode: Mode) -> u8 {
    (mode.file_type() >> 12) as u8
}

/// Packs directory entries into a caller buffer.
pub struct DirentWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> DirentWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, used: 0 }
    }

    /// Appends one entry. Returns `false` if it does not fit.
    ///
    /// # Panics
    /// Panics if `name` is longer than [`NAME_MAX`].
    pub fn push(&mut self, vnid: Vnid, next: u64, kind: u8, name: &str) -> bool {
        assert!(name.len() <= NAME_MAX, "directory entry name too long");
        let reclen = record_len(name);
        let Some(record) = self.buf.get_mut(self.used..self.used + reclen) else {
            return false;
        };

        let header = DirentHeader {
            vnid: U64::new(vnid),
            next: U64::new(next),
            reclen: U16::new(reclen as u16),
            kind,
            namelen: name.len() as u8,
            reserved: [0; 4],
        };
        record.fill(0);
        let (head, tail) = record.split_at_mut(HEADER_SIZE);
        head.copy_from_slice(header.as_bytes());
        tail[..name.len()].copy_from_slice(name.as_bytes());
        self.used += reclen;
        true
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.used
    }
}

/// A decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent<'a> {
    pub vnid: Vnid,
    pub next: u64,
    pub kind: u8,
    pub name: &'a str,
}

/// Iterates over the records in a `getdents` buffer.
pub struct DirentIter<'a> {
    bytes: &'a [u8],
}

impl<'a> DirentIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl<'a> Iterator for DirentIter<'a> {
    type Item = Dirent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (header, _) = DirentHeader::read_from_prefix(self.bytes).ok()?;
        let reclen = header.reclen.get() as usize;
        let namelen = header.namelen as usize;
        if reclen < HEADER_SIZE + namelen || reclen > self.bytes.len() {
            return None;
        }
        let name = str::from_utf8(&self.bytes[HEADER_SIZE..HEADER_SIZE + namelen]).ok()?;
        let entry = Dirent {
            vnid: header.vnid.get(),
            next: header.next.get(),
            kind: header.kind,
            name,
        };
        self.bytes = &self.bytes[reclen..];
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_aligned() {
        assert_eq!(HEADER_SIZE, 24);
        assert_eq!(record_len("a"), 32);
        assert_eq!(record_len("12345678"), 32);
        assert_eq!(record_len("123456789"), 40);
    }

    #[test]
    fn writes_until_full() {
        let mut buf = [0u8; 70];
        let mut writer = DirentWriter::new(&mut buf);
        assert!(writer.push(1, 1, kind_of(Mode::dir(0o755)), "."));
        assert!(writer.push(1, 2, kind_of(Mode::dir(0o755)), ".."));
        assert!(!writer.push(5, 3, kind_of(Mode::regular(0o644)), "foo"));
        assert_eq!(writer.written(), 64);

        let entries: Vec<_> = DirentIter::new(&buf[..64]).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].next, 2);
        assert_eq!(entries[0].kind, 4);
    }
}
