//! Explicit source to sink wiring
//!
//! An [`AudioPatch`] connects one source (a device or an output/input mix) to
//! one or more sinks. The software bridge form carries a second source: the
//! mix through which the bridged audio is played, present only as routing
//! metadata for the hardware client.

use crate::domain::audio::{
    DeviceType, DeviceTypeSet, HalPatchHandle, IoHandle, PatchHandle, PolicyError, PortHandle,
    Result, StreamConfig, Uid,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of ports on either side of a patch
pub const MAX_PATCH_PORTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    Source,
    Sink,
}

/// Port family, used to filter port listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Device,
    Mix,
}

/// What a port endpoint refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortExt {
    Device {
        device_type: DeviceType,
        #[serde(default)]
        address: String,
    },
    Mix {
        io: IoHandle,
    },
}

/// One endpoint of a patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    pub id: PortHandle,
    pub role: PortRole,
    pub ext: PortExt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<StreamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_db: Option<f32>,
}

impl PortConfig {
    pub fn device(id: PortHandle, role: PortRole, device_type: DeviceType, address: impl Into<String>) -> Self {
        Self {
            id,
            role,
            ext: PortExt::Device {
                device_type,
                address: address.into(),
            },
            config: None,
            gain_db: None,
        }
    }

    pub fn mix(id: PortHandle, role: PortRole, io: IoHandle) -> Self {
        Self {
            id,
            role,
            ext: PortExt::Mix { io },
            config: None,
            gain_db: None,
        }
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        match &self.ext {
            PortExt::Device { device_type, .. } => Some(*device_type),
            PortExt::Mix { .. } => None,
        }
    }

    pub fn kind(&self) -> PortKind {
        self.ext.kind()
    }
}

impl PortExt {
    pub fn kind(&self) -> PortKind {
        match self {
            PortExt::Device { .. } => PortKind::Device,
            PortExt::Mix { .. } => PortKind::Mix,
        }
    }
}

/// A source to sink connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPatch {
    pub handle: PatchHandle,
    /// Handle returned by the hardware client once enacted
    pub hal_handle: Option<HalPatchHandle>,
    pub uid: Uid,
    pub sources: Vec<PortConfig>,
    pub sinks: Vec<PortConfig>,
}

impl AudioPatch {
    pub fn new(handle: PatchHandle, uid: Uid, sources: Vec<PortConfig>, sinks: Vec<PortConfig>) -> Self {
        Self {
            handle,
            hal_handle: None,
            uid,
            sources,
            sinks,
        }
    }

    /// Check port counts and roles of a client-supplied patch
    pub fn validate_request(sources: &[PortConfig], sinks: &[PortConfig]) -> Result<()> {
        if sources.len() != 1 {
            return Err(PolicyError::bad_value(format!(
                "patch needs exactly one source, got {}",
                sources.len()
            )));
        }
        if sinks.is_empty() || sinks.len() > MAX_PATCH_PORTS {
            return Err(PolicyError::bad_value(format!(
                "patch needs 1..{} sinks, got {}",
                MAX_PATCH_PORTS,
                sinks.len()
            )));
        }
        if sources.iter().any(|p| p.role != PortRole::Source) {
            return Err(PolicyError::bad_value("source port does not have the source role"));
        }
        if sinks.iter().any(|p| p.role != PortRole::Sink) {
            return Err(PolicyError::bad_value("sink port does not have the sink role"));
        }
        Ok(())
    }

    /// Software bridge: a device source plus the mix carrying it
    pub fn is_bridge(&self) -> bool {
        self.sources.len() == 2
    }

    pub fn sink_devices(&self) -> DeviceTypeSet {
        self.sinks.iter().filter_map(PortConfig::device_type).collect()
    }

    pub fn source_devices(&self) -> DeviceTypeSet {
        self.sources.iter().filter_map(PortConfig::device_type).collect()
    }

    /// Whether any endpoint refers to the device type
    pub fn references_device(&self, device: DeviceType) -> bool {
        self.sources
            .iter()
            .chain(self.sinks.iter())
            .any(|p| p.device_type() == Some(device))
    }
}

/// Arena of live patches keyed by process-local handle
#[derive(Debug, Clone, Default)]
pub struct PatchCollection {
    slots: BTreeMap<PatchHandle, AudioPatch>,
}

impl PatchCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, patch: AudioPatch) {
        self.slots.insert(patch.handle, patch);
    }

    pub fn remove(&mut self, handle: PatchHandle) -> Option<AudioPatch> {
        self.slots.remove(&handle)
    }

    pub fn get(&self, handle: PatchHandle) -> Option<&AudioPatch> {
        self.slots.get(&handle)
    }

    pub fn get_mut(&mut self, handle: PatchHandle) -> Option<&mut AudioPatch> {
        self.slots.get_mut(&handle)
    }

    pub fn contains(&self, handle: PatchHandle) -> bool {
        self.slots.contains_key(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioPatch> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn referencing_device(&self, device: DeviceType) -> Vec<PatchHandle> {
        self.slots
            .values()
            .filter(|p| p.references_device(device))
            .map(|p| p.handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request_shape() {
        let source = PortConfig::mix(PortHandle(1), PortRole::Source, IoHandle(2));
        let sink = PortConfig::device(PortHandle(3), PortRole::Sink, DeviceType::Speaker, "");

        assert!(AudioPatch::validate_request(&[source.clone()], &[sink.clone()]).is_ok());
        assert!(AudioPatch::validate_request(&[], &[sink.clone()]).is_err());
        assert!(AudioPatch::validate_request(&[source.clone()], &[]).is_err());
        assert!(AudioPatch::validate_request(&[sink.clone()], &[sink.clone()]).is_err());
        assert!(AudioPatch::validate_request(&[source.clone(), source.clone()], &[sink]).is_err());
    }

    #[test]
    fn test_patch_device_queries() {
        let patch = AudioPatch::new(
            PatchHandle(9),
            Uid::SYSTEM,
            vec![PortConfig::device(PortHandle(1), PortRole::Source, DeviceType::TelephonyRx, "")],
            vec![
                PortConfig::device(PortHandle(2), PortRole::Sink, DeviceType::Speaker, ""),
                PortConfig::device(PortHandle(3), PortRole::Sink, DeviceType::WiredHeadset, ""),
            ],
        );
        assert_eq!(patch.sink_devices().len(), 2);
        assert!(patch.references_device(DeviceType::TelephonyRx));
        assert!(!patch.is_bridge());

        let mut patches = PatchCollection::new();
        patches.add(patch);
        assert_eq!(patches.referencing_device(DeviceType::WiredHeadset), vec![PatchHandle(9)]);
        assert!(patches.referencing_device(DeviceType::Earpiece).is_empty());
    }
}
