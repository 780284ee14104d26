//! The top-level context owning the device registry, the filesystem table and the mounts.

use std::sync::{Arc, Weak};

use libc::{EBUSY, EINVAL, ENODEV, ENOENT, ENOSYS, ENOTDIR};

use crate::{
    block::{DevId, DeviceRegistry, SECTOR_SIZE_MIN},
    error::{self, Result},
    pcache::PAGE_SIZE,
    vfs::{
        FsTable, IoContext, Mount, MountFlags, MountId, MountTable,
        ioctx::{FD_TABLE_DEFAULT, FD_TABLE_MAX},
        path::resolve_dotdirs,
    },
};

/// Tunables of a [`Kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Descriptor slots of a new I/O context.
    pub fd_table_size: usize,
    /// Size of the pages cached for devices and files.
    pub page_size: usize,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.fd_table_size == 0 || self.fd_table_size > FD_TABLE_MAX {
            return Err(EINVAL);
        }
        if !self.page_size.is_power_of_two() || self.page_size < SECTOR_SIZE_MIN as usize {
            return Err(EINVAL);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fd_table_size: FD_TABLE_DEFAULT,
            page_size: PAGE_SIZE,
        }
    }
}

/// Splits the mount options a kernel understands out of a mount argument string.
///
/// Options are comma-separated; `ro` and `noatime` set mount flags. The whole string is still
/// passed to the driver.
fn mount_flags(args: &str) -> MountFlags {
    args.split(',')
        .map(str::trim)
        .fold(MountFlags::empty(), |flags, opt| match opt {
            "ro" => flags | MountFlags::RDONLY,
            "noatime" => flags | MountFlags::NOATIME,
            _ => flags,
        })
}

/// A kernel's storage stack: block devices, registered filesystems and the mount tree.
///
/// Dropping the kernel unmounts whatever is still mounted.
#[derive(Debug)]
pub struct Kernel {
    config: Config,
    devices: DeviceRegistry,
    fs_table: FsTable,
    mounts: MountTable,
}

impl Kernel {
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            config,
            devices: DeviceRegistry::new(config.page_size),
            fs_table: FsTable::new(),
            mounts: MountTable::new(),
        }
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            devices: DeviceRegistry::new(config.page_size),
            fs_table: FsTable::new(),
            mounts: MountTable::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn fs_table(&self) -> &FsTable {
        &self.fs_table
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Creates an I/O context. It starts at the parent's root and working directory, or at the
    /// root of the root mount.
    pub fn create_ioctx(&self, parent: Option<&IoContext>) -> Result<IoContext> {
        let (root, cwd) = match parent {
            Some(parent) => parent.root_and_cwd()?,
            None => {
                let root = self.mounts.root().ok_or(ENOENT)?.root()?;
                (root.clone(), root)
            }
        };
        IoContext::new(root, cwd, self.config.fd_table_size)
    }

    /// Mounts filesystem `fs_name` from device `devid` on the directory `path`.
    ///
    /// The first mount becomes the root mount and must be on `/`. Paths are resolved through
    /// `ioctx`, or from the root when it is `None`.
    pub fn mount(
        &self,
        ioctx: Option<&IoContext>,
        path: &str,
        devid: DevId,
        fs_name: &str,
        args: &str,
    ) -> Result<MountId> {
        let fs = self.fs_table.get(fs_name)?;
        let device = if fs.is_pseudo() && !devid.is_valid() {
            None
        } else {
            Some(self.devices.get(devid).map_err(|_| ENODEV)?)
        };

        let mut mounts = self.mounts.lock();
        if mounts.uses_device(devid) {
            return Err(EBUSY);
        }
        let (mount_point, mount_path) = if mounts.root().is_none() {
            if path != "/" {
                return Err(ENOENT);
            }
            (None, "/".to_owned())
        } else {
            let owned;
            let ioctx = match (ioctx, mounts.root()) {
                (Some(ioctx), _) => ioctx,
                (None, root) => {
                    let root = root.ok_or(ENOENT)?.root()?;
                    owned = IoContext::new(root.clone(), root, 1)?;
                    &owned
                }
            };
            let vnode = ioctx.path_to_vnode(path)?;
            if !vnode.mode().is_dir() {
                return Err(ENOTDIR);
            }
            if vnode.is_mount_root() || vnode.covered_by().is_some() {
                return Err(EBUSY);
            }
            let mount_path = if path.starts_with('/') {
                resolve_dotdirs(path)
            } else {
                path.to_owned()
            };
            (Some(vnode), mount_path)
        };

        let id = mounts.alloc_id()?;
        let calls = fs.calls();
        let (sb, root_vnid) = calls.mount(device.clone(), args).map_err(error::coerce)?;
        let mount = Mount::new(
            id,
            device,
            fs.clone(),
            sb.clone(),
            root_vnid,
            mount_point.clone(),
            mount_path,
            mount_flags(args),
            self.config.page_size,
        );
        let mount = match mount {
            Ok(mount) => mount,
            Err(e) => {
                if let Err(e) = calls.unmount(&sb) {
                    log::warn!("{fs_name}: unmount after failed mount: {e}");
                }
                return Err(e);
            }
        };

        if let Some(mount_point) = &mount_point {
            mount_point.set_covered_by(Arc::downgrade(&mount));
        }
        log::info!("mounted {fs_name} from {devid} on {} as mount {id}", mount.path());
        mounts.insert(mount);
        Ok(id)
    }

    /// Unmounts the filesystem whose root `path` names.
    pub fn unmount(&self, ioctx: Option<&IoContext>, path: &str) -> Result<()> {
        let mount = {
            let owned;
            let ioctx = match ioctx {
                Some(ioctx) => ioctx,
                None => {
                    owned = self.create_ioctx(None)?;
                    &owned
                }
            };
            let vnode = ioctx.path_to_vnode(path)?;
            if !vnode.is_mount_root() {
                return Err(EINVAL);
            }
            vnode.mount().clone()
        };
        self.unmount_mount(&mount)
    }

    /// Unmounts the root mount. Every other mount must be gone.
    pub fn unmount_root(&self) -> Result<()> {
        let root = self.mounts.root().ok_or(EINVAL)?;
        self.unmount_mount(&root)
    }

    fn unmount_mount(&self, mount: &Arc<Mount>) -> Result<()> {
        let mut mounts = self.mounts.lock();
        if mounts.has_children(mount.id()) || mount.is_busy() {
            return Err(EBUSY);
        }

        mount.insert_flags(MountFlags::UNMOUNTING);
        let calls = mount.calls();
        match calls.sync(mount.sb()) {
            Ok(()) | Err(ENOSYS) => {}
            Err(e) => {
                mount.remove_flags(MountFlags::UNMOUNTING);
                return Err(error::coerce(e));
            }
        }

        drop(mount.take_root());
        if let Err(e) = calls.unmount(mount.sb()) {
            if e != ENOSYS {
                log::warn!("mount {}: driver unmount failed: {e}", mount.id());
            }
        }
        if let Some(mount_point) = mount.take_mount_point() {
            mount_point.set_covered_by(Weak::new());
        }
        mounts.remove(mount.id());
        log::info!("unmounted {} from {}", mount.fs().name(), mount.path());
        Ok(())
    }

    /// Writes back every mounted filesystem and every device cache.
    ///
    /// Every mount and device is attempted; the first failure is returned.
    pub fn sync(&self) -> Result<()> {
        let mut first_err = None;
        for id in self.mounts.ids() {
            let Some(mount) = self.mounts.get(id) else {
                continue;
            };
            match mount.calls().sync(mount.sb()) {
                Ok(()) | Err(ENOSYS) => {}
                Err(e) => {
                    first_err.get_or_insert(error::coerce(e));
                }
            }
        }
        for id in self.devices.ids() {
            let res = self.devices.get(id).and_then(|dev| dev.flush());
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        // Mounts get increasing ids, so children go before their parents.
        for id in self.mounts.ids().into_iter().rev() {
            let Some(mount) = self.mounts.get(id) else {
                continue;
            };
            if let Err(e) = self.unmount_mount(&mount) {
                log::warn!("mount {id} still in use at shutdown: {e}");
            }
        }
        for id in self.devices.ids() {
            self.devices.unregister(id);
        }
    }
}
