//! Hardware modules and I/O profiles
//!
//! A [`HwModule`] is one hardware backend. It declares the devices it can
//! reach and the [`IoProfile`]s through which streams can be opened. Profiles
//! describe capabilities only; how many streams are open against a profile is
//! derived from the descriptor collections, never stored here.

use crate::domain::audio::{
    AudioFormat, ChannelMask, DeviceType, DeviceTypeSet, Direction, InputFlags, ModuleHandle,
    OutputFlags, PortHandle, StreamConfig,
};
use crate::domain::device::Device;
use serde::{Deserialize, Serialize};

/// Identifies a profile inside the module collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileId {
    pub module: usize,
    pub direction: Direction,
    pub index: usize,
}

/// Role-specific flags of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileFlags {
    Output(OutputFlags),
    Input(InputFlags),
}

/// Which capability lists were declared empty and must be filled from the
/// hardware after opening a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicCaps {
    pub sample_rates: bool,
    pub formats: bool,
    pub channel_masks: bool,
}

impl DynamicCaps {
    pub fn any(&self) -> bool {
        self.sample_rates || self.formats || self.channel_masks
    }
}

/// Capability set through which streams are opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoProfile {
    pub name: String,
    pub flags: ProfileFlags,
    pub supported_devices: DeviceTypeSet,
    pub sample_rates: Vec<u32>,
    pub formats: Vec<AudioFormat>,
    pub channel_masks: Vec<ChannelMask>,
    pub dynamic: DynamicCaps,
    /// Maximum simultaneously open streams, 0 for unlimited
    pub max_open_count: u32,
    /// Maximum simultaneously active streams, 0 for unlimited
    pub max_active_count: u32,
}

impl IoProfile {
    pub fn new(name: impl Into<String>, flags: ProfileFlags) -> Self {
        let (max_open_count, max_active_count) = match flags {
            ProfileFlags::Output(_) => (0, 0),
            ProfileFlags::Input(_) => (0, 1),
        };
        Self {
            name: name.into(),
            flags,
            supported_devices: DeviceTypeSet::new(),
            sample_rates: Vec::new(),
            formats: Vec::new(),
            channel_masks: Vec::new(),
            dynamic: DynamicCaps {
                sample_rates: true,
                formats: true,
                channel_masks: true,
            },
            max_open_count,
            max_active_count,
        }
    }

    /// Declare static capabilities; an empty list keeps that capability dynamic
    pub fn with_caps(
        mut self,
        sample_rates: Vec<u32>,
        formats: Vec<AudioFormat>,
        channel_masks: Vec<ChannelMask>,
    ) -> Self {
        self.dynamic = DynamicCaps {
            sample_rates: sample_rates.is_empty(),
            formats: formats.is_empty(),
            channel_masks: channel_masks.is_empty(),
        };
        self.sample_rates = sample_rates;
        self.formats = formats;
        self.channel_masks = channel_masks;
        self
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceType>) -> Self {
        self.supported_devices = devices.into_iter().collect();
        self
    }

    pub fn direction(&self) -> Direction {
        match self.flags {
            ProfileFlags::Output(_) => Direction::Output,
            ProfileFlags::Input(_) => Direction::Input,
        }
    }

    pub fn output_flags(&self) -> OutputFlags {
        match self.flags {
            ProfileFlags::Output(flags) => flags,
            ProfileFlags::Input(_) => OutputFlags::NONE,
        }
    }

    pub fn input_flags(&self) -> InputFlags {
        match self.flags {
            ProfileFlags::Input(flags) => flags,
            ProfileFlags::Output(_) => InputFlags::NONE,
        }
    }

    pub fn supports_device(&self, device: DeviceType) -> bool {
        self.supported_devices.contains(device)
    }

    pub fn is_direct(&self) -> bool {
        self.output_flags().requires_direct()
    }

    /// True when every capability list holds at least one value
    pub fn has_valid_caps(&self) -> bool {
        !self.sample_rates.is_empty() && !self.formats.is_empty() && !self.channel_masks.is_empty()
    }

    pub fn has_dynamic_caps(&self) -> bool {
        self.dynamic.any()
    }

    pub fn supports_config(&self, config: &StreamConfig) -> bool {
        (self.sample_rates.is_empty() || self.sample_rates.contains(&config.sample_rate))
            && (self.formats.is_empty() || self.formats.contains(&config.format))
            && (self.channel_masks.is_empty() || self.channel_masks.contains(&config.channel_mask))
    }

    /// Whether a client request can be served by this profile
    pub fn is_compatible_output(
        &self,
        devices: &DeviceTypeSet,
        config: Option<&StreamConfig>,
        flags: &OutputFlags,
    ) -> bool {
        let ProfileFlags::Output(own) = self.flags else {
            return false;
        };
        !devices.is_empty()
            && devices.is_subset(&self.supported_devices)
            && config.map_or(true, |c| self.supports_config(c))
            && own.contains(flags)
    }

    pub fn is_compatible_input(
        &self,
        device: DeviceType,
        config: Option<&StreamConfig>,
        flags: &InputFlags,
    ) -> bool {
        let ProfileFlags::Input(own) = self.flags else {
            return false;
        };
        self.supports_device(device) && config.map_or(true, |c| self.supports_config(c)) && own.contains(flags)
    }

    /// Preferred stream configuration when opening against this profile
    pub fn pick_config(&self) -> StreamConfig {
        let default = StreamConfig::default();
        let sample_rate = if self.sample_rates.contains(&default.sample_rate) {
            default.sample_rate
        } else {
            self.sample_rates
                .iter()
                .copied()
                .filter(|r| *r <= 48000)
                .max()
                .or_else(|| self.sample_rates.first().copied())
                .unwrap_or(default.sample_rate)
        };
        let format = if self.formats.contains(&default.format) || self.formats.is_empty() {
            default.format
        } else {
            self.formats[0]
        };
        let channel_mask = if self.channel_masks.contains(&default.channel_mask) || self.channel_masks.is_empty() {
            default.channel_mask
        } else {
            self.channel_masks[0]
        };
        StreamConfig {
            sample_rate,
            format,
            channel_mask,
        }
    }

    /// Store capabilities reported by the hardware for the dynamic lists
    pub fn import_dynamic(
        &mut self,
        sample_rates: Vec<u32>,
        formats: Vec<AudioFormat>,
        channel_masks: Vec<ChannelMask>,
    ) {
        if self.dynamic.sample_rates {
            self.sample_rates = sample_rates;
        }
        if self.dynamic.formats {
            self.formats = formats;
        }
        if self.dynamic.channel_masks {
            self.channel_masks = channel_masks;
        }
    }

    /// Forget hardware-reported capabilities, e.g. after the device left
    pub fn clear_dynamic(&mut self) {
        if self.dynamic.sample_rates {
            self.sample_rates.clear();
        }
        if self.dynamic.formats {
            self.formats.clear();
        }
        if self.dynamic.channel_masks {
            self.channel_masks.clear();
        }
    }
}

/// A hardware backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwModule {
    pub name: String,
    /// Assigned by the hardware client when the module is loaded
    pub handle: Option<ModuleHandle>,
    pub hal_version_major: u32,
    pub declared_devices: Vec<Device>,
    pub attached_devices: Vec<PortHandle>,
    pub default_output_device: Option<PortHandle>,
    pub output_profiles: Vec<IoProfile>,
    pub input_profiles: Vec<IoProfile>,
}

impl HwModule {
    pub fn new(name: impl Into<String>, hal_version_major: u32) -> Self {
        Self {
            name: name.into(),
            handle: None,
            hal_version_major,
            declared_devices: Vec::new(),
            attached_devices: Vec::new(),
            default_output_device: None,
            output_profiles: Vec::new(),
            input_profiles: Vec::new(),
        }
    }

    pub fn profiles(&self, direction: Direction) -> &[IoProfile] {
        match direction {
            Direction::Output => &self.output_profiles,
            Direction::Input => &self.input_profiles,
        }
    }

    fn profiles_mut(&mut self, direction: Direction) -> &mut Vec<IoProfile> {
        match direction {
            Direction::Output => &mut self.output_profiles,
            Direction::Input => &mut self.input_profiles,
        }
    }

    /// Whether any profile of the device's direction reaches it
    pub fn supports_device(&self, device: DeviceType) -> bool {
        self.profiles(device.direction())
            .iter()
            .any(|p| p.supports_device(device))
    }

    pub fn declared_device(&self, device_type: DeviceType, address: &str) -> Option<&Device> {
        self.declared_devices
            .iter()
            .find(|d| d.device_type == device_type && (address.is_empty() || d.address == address))
            .or_else(|| {
                self.declared_devices
                    .iter()
                    .find(|d| d.matches(device_type, address))
            })
    }

    /// Devices attached at boot, i.e. always present
    pub fn attached(&self) -> impl Iterator<Item = &Device> {
        self.declared_devices
            .iter()
            .filter(|d| self.attached_devices.contains(&d.port_id))
    }

    /// Devices native device-to-device patches can be created on
    pub fn supports_device_patches(&self) -> bool {
        self.hal_version_major >= 3
    }
}

/// All loaded hardware modules
#[derive(Debug, Clone, Default)]
pub struct HwModuleCollection {
    modules: Vec<HwModule>,
}

impl HwModuleCollection {
    pub fn new(modules: Vec<HwModule>) -> Self {
        Self { modules }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HwModule> {
        self.modules.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HwModule> {
        self.modules.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HwModule> {
        self.modules.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut HwModule> {
        self.modules.get_mut(index)
    }

    pub fn index_of_handle(&self, handle: ModuleHandle) -> Option<usize> {
        self.modules.iter().position(|m| m.handle == Some(handle))
    }

    pub fn by_name(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name == name)
    }

    pub fn profile(&self, id: ProfileId) -> Option<&IoProfile> {
        self.modules.get(id.module)?.profiles(id.direction).get(id.index)
    }

    pub fn profile_mut(&mut self, id: ProfileId) -> Option<&mut IoProfile> {
        self.modules
            .get_mut(id.module)?
            .profiles_mut(id.direction)
            .get_mut(id.index)
    }

    /// Every profile of the given direction with its id
    pub fn profiles(&self, direction: Direction) -> Vec<(ProfileId, &IoProfile)> {
        self.modules
            .iter()
            .enumerate()
            .flat_map(|(module, m)| {
                m.profiles(direction)
                    .iter()
                    .enumerate()
                    .map(move |(index, p)| {
                        (
                            ProfileId {
                                module,
                                direction,
                                index,
                            },
                            p,
                        )
                    })
            })
            .collect()
    }

    /// First loaded module with a profile reaching the device
    pub fn module_for_device(&self, device: DeviceType) -> Option<usize> {
        self.modules
            .iter()
            .position(|m| m.handle.is_some() && m.supports_device(device))
    }

    /// Declared descriptor for a device, searching every module
    pub fn declared_device(&self, device_type: DeviceType, address: &str) -> Option<&Device> {
        self.modules
            .iter()
            .find_map(|m| m.declared_device(device_type, address))
    }
}
