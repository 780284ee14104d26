use std::{collections::BTreeMap, sync::Arc};

use libc::{EBUSY, EINVAL, ENODEV};
use parking_lot::Mutex;

use crate::{
    block::{BlockDevice, DevId, DeviceOps, Geometry},
    error::Result,
    pcache::PAGE_SIZE,
};

/// The set of registered block devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    page_size: usize,
    devices: Mutex<BTreeMap<DevId, Arc<BlockDevice>>>,
}

impl DeviceRegistry {
    /// Creates a registry whose devices cache pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a device and attaches a fresh page-cache pool to it.
    pub fn register(
        &self,
        id: DevId,
        geometry: Geometry,
        ops: Arc<dyn DeviceOps>,
    ) -> Result<Arc<BlockDevice>> {
        if !id.is_valid() {
            return Err(EINVAL);
        }
        geometry.validate(self.page_size)?;

        let mut devices = self.devices.lock();
        if devices.contains_key(&id) {
            return Err(EBUSY);
        }
        let dev = BlockDevice::new(id, geometry, ops, self.page_size);
        devices.insert(id, dev.clone());
        log::info!(
            "registered block device {id}: sector {} block {} capacity {}",
            geometry.sector_size,
            geometry.block_size,
            geometry.capacity
        );
        Ok(dev)
    }

    /// Removes a device. Unknown ids are ignored.
    pub fn unregister(&self, id: DevId) {
        let removed = self.devices.lock().remove(&id);
        if let Some(dev) = removed {
            dev.shutdown();
            log::info!("unregistered block device {id}");
        }
    }

    /// Returns a handle to a registered device. Dropping the handle releases it.
    pub fn get(&self, id: DevId) -> Result<Arc<BlockDevice>> {
        if !id.is_valid() {
            return Err(EINVAL);
        }
        self.devices.lock().get(&id).cloned().ok_or(ENODEV)
    }

    pub fn contains(&self, id: DevId) -> bool {
        self.devices.lock().contains_key(&id)
    }

    /// Ids of every registered device in ascending order.
    pub fn ids(&self) -> Vec<DevId> {
        self.devices.lock().keys().copied().collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(PAGE_SIZE)
    }
}
