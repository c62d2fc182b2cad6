//! Device descriptors and the available-device collection
//!
//! A [`Device`] is identified by its type and, for types that support several
//! simultaneous instances, its address. [`DeviceVector`] stores devices in an
//! arena keyed by port handle with a secondary index on that identity.

use crate::domain::audio::{
    AudioFormat, ChannelMask, DeviceType, DeviceTypeSet, ModuleHandle, PortHandle, StreamConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Hardware gain stage of a device port
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainDescriptor {
    pub min_db: f32,
    pub max_db: f32,
    pub default_db: f32,
    pub step_db: f32,
}

impl GainDescriptor {
    /// Validate a requested gain against the stage limits
    pub fn accepts(&self, db: f32) -> bool {
        if db < self.min_db || db > self.max_db {
            return false;
        }
        if self.step_db <= 0.0 {
            return true;
        }
        let steps = (db - self.min_db) / self.step_db;
        (steps - steps.round()).abs() < 1e-3
    }
}

/// A hardware endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub port_id: PortHandle,
    pub name: String,
    pub device_type: DeviceType,
    pub address: String,
    /// Empty means dynamic: query the hardware once a stream is open
    pub sample_rates: Vec<u32>,
    pub formats: Vec<AudioFormat>,
    pub channel_masks: Vec<ChannelMask>,
    pub gain: Option<GainDescriptor>,
    pub module: Option<ModuleHandle>,
}

impl Device {
    pub fn new(port_id: PortHandle, device_type: DeviceType, address: impl Into<String>) -> Self {
        Self {
            port_id,
            name: format!("{}", device_type),
            device_type,
            address: address.into(),
            sample_rates: Vec::new(),
            formats: Vec::new(),
            channel_masks: Vec::new(),
            gain: None,
            module: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn attach(&mut self, module: ModuleHandle) {
        self.module = Some(module);
    }

    /// Identity match following the address rule of the device type
    pub fn matches(&self, device_type: DeviceType, address: &str) -> bool {
        self.device_type == device_type
            && (!device_type.distinguishes_on_address() || address.is_empty() || self.address == address)
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.device_type, &self.address)
    }

    /// Whether a stream configuration is accepted by this device; dynamic
    /// capability lists accept anything
    pub fn supports_config(&self, config: &StreamConfig) -> bool {
        (self.sample_rates.is_empty() || self.sample_rates.contains(&config.sample_rate))
            && (self.formats.is_empty() || self.formats.contains(&config.format))
            && (self.channel_masks.is_empty() || self.channel_masks.contains(&config.channel_mask))
    }
}

/// Secondary index key of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    device_type: DeviceType,
    address: String,
}

impl DeviceKey {
    pub fn new(device_type: DeviceType, address: &str) -> Self {
        let address = if device_type.distinguishes_on_address() {
            address.to_string()
        } else {
            String::new()
        };
        Self {
            device_type,
            address,
        }
    }
}

/// Collection of devices keyed by port handle
#[derive(Debug, Clone, Default)]
pub struct DeviceVector {
    slots: BTreeMap<PortHandle, Device>,
    by_key: HashMap<DeviceKey, PortHandle>,
}

impl DeviceVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device; returns false when an identical one is already present
    pub fn add(&mut self, device: Device) -> bool {
        let key = device.key();
        if self.by_key.contains_key(&key) {
            return false;
        }
        self.by_key.insert(key, device.port_id);
        self.slots.insert(device.port_id, device);
        true
    }

    pub fn remove(&mut self, device_type: DeviceType, address: &str) -> Option<Device> {
        let port = self.find(device_type, address)?.port_id;
        let device = self.slots.remove(&port)?;
        self.by_key.remove(&device.key());
        Some(device)
    }

    /// Look a device up by identity; an empty address matches the first
    /// instance of a multi-instance type
    pub fn find(&self, device_type: DeviceType, address: &str) -> Option<&Device> {
        if let Some(port) = self.by_key.get(&DeviceKey::new(device_type, address)) {
            return self.slots.get(port);
        }
        if address.is_empty() {
            return self.first_of_type(device_type);
        }
        None
    }

    pub fn contains(&self, device_type: DeviceType, address: &str) -> bool {
        self.find(device_type, address).is_some()
    }

    pub fn first_of_type(&self, device_type: DeviceType) -> Option<&Device> {
        self.slots.values().find(|d| d.device_type == device_type)
    }

    pub fn get(&self, port: PortHandle) -> Option<&Device> {
        self.slots.get(&port)
    }

    pub fn get_mut(&mut self, port: PortHandle) -> Option<&mut Device> {
        self.slots.get_mut(&port)
    }

    pub fn types(&self) -> DeviceTypeSet {
        self.slots.values().map(|d| d.device_type).collect()
    }

    pub fn has_type(&self, device_type: DeviceType) -> bool {
        self.first_of_type(device_type).is_some()
    }

    /// All devices whose type belongs to the set
    pub fn devices_from_types(&self, types: &DeviceTypeSet) -> Vec<&Device> {
        self.slots
            .values()
            .filter(|d| types.contains(d.device_type))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(port: u32, device_type: DeviceType, address: &str) -> Device {
        Device::new(PortHandle(port), device_type, address)
    }

    #[test]
    fn test_identity_ignores_address_for_single_instance_types() {
        let mut devices = DeviceVector::new();
        assert!(devices.add(device(1, DeviceType::Speaker, "")));
        assert!(!devices.add(device(2, DeviceType::Speaker, "whatever")));
        assert!(devices.contains(DeviceType::Speaker, "other"));
    }

    #[test]
    fn test_address_distinguishes_usb_instances() {
        let mut devices = DeviceVector::new();
        assert!(devices.add(device(1, DeviceType::UsbDevice, "card=1;device=0")));
        assert!(devices.add(device(2, DeviceType::UsbDevice, "card=2;device=0")));
        assert_eq!(devices.len(), 2);

        let found = devices.find(DeviceType::UsbDevice, "card=2;device=0").unwrap();
        assert_eq!(found.port_id, PortHandle(2));
        assert!(devices.find(DeviceType::UsbDevice, "card=3;device=0").is_none());
        // empty address falls back to the first instance
        assert!(devices.find(DeviceType::UsbDevice, "").is_some());

        let removed = devices.remove(DeviceType::UsbDevice, "card=1;device=0").unwrap();
        assert_eq!(removed.port_id, PortHandle(1));
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn test_devices_from_types() {
        let mut devices = DeviceVector::new();
        devices.add(device(1, DeviceType::Speaker, ""));
        devices.add(device(2, DeviceType::WiredHeadset, ""));
        devices.add(device(3, DeviceType::Earpiece, ""));

        let wanted: DeviceTypeSet = [DeviceType::Speaker, DeviceType::WiredHeadset].into_iter().collect();
        let found = devices.devices_from_types(&wanted);
        assert_eq!(found.len(), 2);
        assert_eq!(devices.types().len(), 3);
    }

    #[test]
    fn test_gain_descriptor_steps() {
        let gain = GainDescriptor {
            min_db: -12.0,
            max_db: 12.0,
            default_db: 0.0,
            step_db: 0.5,
        };
        assert!(gain.accepts(1.5));
        assert!(!gain.accepts(1.3));
        assert!(!gain.accepts(20.0));
    }
}
