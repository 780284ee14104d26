//! Open file descriptors.

use std::{fmt, sync::Arc};

use libc::ENOSYS;
use parking_lot::{Mutex, MutexGuard};

use crate::vfs::{FsFile, OpenFlags, Vnode};

/// Index of a descriptor in an I/O context's table.
pub type Fd = i32;

/// An open file: the vnode, the open flags, the position and the driver's per-open state.
///
/// The descriptor lives while its table slot or any borrowed handle holds it. The last release
/// calls the driver's `close` and then `release_fd`.
pub struct FileDescriptor {
    vnode: Arc<Vnode>,
    flags: Mutex<OpenFlags>,
    pos: Mutex<u64>,
    file: Mutex<FsFile>,
}

impl FileDescriptor {
    pub(crate) fn new(vnode: Arc<Vnode>, flags: OpenFlags, file: FsFile) -> Self {
        Self {
            vnode,
            flags: Mutex::new(flags),
            pos: Mutex::new(0),
            file: Mutex::new(file),
        }
    }

    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    pub fn flags(&self) -> OpenFlags {
        *self.flags.lock()
    }

    pub fn set_close_on_exec(&self, on: bool) {
        self.flags.lock().set(OpenFlags::CLOEXEC, on);
    }

    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }

    /// Locks the position, serialising I/O through this descriptor.
    pub(crate) fn lock_pos(&self) -> MutexGuard<'_, u64> {
        self.pos.lock()
    }

    pub(crate) fn lock_file(&self) -> MutexGuard<'_, FsFile> {
        self.file.lock()
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        let vnode = &self.vnode;
        let file = self.file.get_mut();
        match vnode.calls().close(vnode.sb(), vnode.fs_vnode(), file) {
            Ok(()) | Err(ENOSYS) => {}
            Err(e) => log::warn!("vnode {}: close failed: {e}", vnode.id()),
        }

        let file = self.file.get_mut().take();
        match vnode.calls().release_fd(vnode.sb(), vnode.fs_vnode(), file) {
            Ok(()) | Err(ENOSYS) => {}
            Err(e) => log::warn!("vnode {}: release of descriptor failed: {e}", vnode.id()),
        }
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("vnode", &self.vnode.id())
            .field("flags", &self.flags())
            .field("pos", &self.pos())
            .finish()
    }
}
