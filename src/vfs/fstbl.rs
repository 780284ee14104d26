//! The table of registered filesystem drivers.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bitflags::bitflags;
use libc::{EBUSY, EEXIST, EINVAL, ENOENT};
use parking_lot::Mutex;

use crate::{error::Result, vfs::FsCalls};

bitflags! {
    /// Properties of a registered filesystem.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsFlags: u32 {
        /// Mounts without a backing device.
        const PSEUDO = 1;
        /// File data goes through the per-vnode page cache and the driver's `strategy`.
        const PAGE_CACHE = 2;
    }
}

/// A registered filesystem: its name, operations and flags.
pub struct FsContainer {
    name: String,
    calls: Arc<dyn FsCalls>,
    flags: FsFlags,
}

impl FsContainer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn calls(&self) -> &dyn FsCalls {
        self.calls.as_ref()
    }

    pub fn flags(&self) -> FsFlags {
        self.flags
    }

    pub fn is_pseudo(&self) -> bool {
        self.flags.contains(FsFlags::PSEUDO)
    }

    pub fn uses_page_cache(&self) -> bool {
        self.flags.contains(FsFlags::PAGE_CACHE)
    }
}

impl fmt::Debug for FsContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsContainer")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Filesystems by name. Every mount holds a reference to its container.
#[derive(Debug, Default)]
pub struct FsTable {
    entries: Mutex<BTreeMap<String, Arc<FsContainer>>>,
}

impl FsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, calls: Arc<dyn FsCalls>, flags: FsFlags) -> Result<()> {
        if name.is_empty() {
            return Err(EINVAL);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(EEXIST);
        }
        let container = FsContainer {
            name: name.to_owned(),
            calls,
            flags,
        };
        entries.insert(name.to_owned(), Arc::new(container));
        log::info!("registered filesystem {name} {flags:?}");
        Ok(())
    }

    /// Removes a filesystem. Fails with `EBUSY` while any mount uses it.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let container = entries.get(name).ok_or(ENOENT)?;
        if Arc::strong_count(container) > 1 {
            return Err(EBUSY);
        }
        entries.remove(name);
        log::info!("unregistered filesystem {name}");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<FsContainer>> {
        self.entries.lock().get(name).cloned().ok_or(ENOENT)
    }

    /// Names of every registered filesystem in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}
