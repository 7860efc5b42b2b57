use std::sync::Arc;
use indexmap::IndexMap;

use crate::device::types::Device;
use crate::error::RegistryError;

/// Discovered devices keyed by id, in the order they were first seen.
///
/// The registry is owned by a single session actor and is not synchronized on its own.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry { devices: IndexMap::new() }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    fn address_owner(&self, address: &str) -> Option<&Device> {
        self.devices.values().find(|device| device.address == address)
    }

    pub fn upsert(&mut self, device: Device) -> Result<(), RegistryError> {
        if self.devices.contains_key(&device.id) || self.address_owner(&device.address).is_some() {
            return Err(RegistryError::DuplicateDevice { id: device.id, address: device.address });
        }

        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    /// Updates name and address of an already registered device in place. The position and the
    /// connection flag are kept.
    pub fn refresh(&mut self, device: Device) -> Result<(), RegistryError> {
        if let Some(owner) = self.address_owner(&device.address) {
            if owner.id != device.id {
                return Err(RegistryError::DuplicateDevice { id: device.id, address: device.address });
            }
        }

        match self.devices.get_mut(&device.id) {
            None => Err(RegistryError::UnknownDevice { id: device.id }),
            Some(existing) => {
                if existing.name != device.name || existing.address != device.address {
                    *existing = Device { is_connected: existing.is_connected, ..device };
                }
                Ok(())
            },
        }
    }

    pub fn mark_connected(&mut self, id: &str) -> Result<(), RegistryError> {
        match self.devices.get_mut(id) {
            None => Err(RegistryError::UnknownDevice { id: id.to_string() }),
            Some(existing) => {
                *existing = Device { is_connected: true, ..existing.clone() };
                Ok(())
            },
        }
    }

    /// Clears the connection flag of every device and returns the devices that were connected.
    pub fn clear_connections(&mut self) -> Vec<Device> {
        let mut previously_connected = Vec::new();

        for device in self.devices.values_mut().filter(|device| device.is_connected) {
            previously_connected.push(device.clone());
            *device = Device { is_connected: false, ..device.clone() };
        }

        previously_connected
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn snapshot(&self) -> Arc<[Device]> {
        self.devices.values().cloned().collect()
    }
}
