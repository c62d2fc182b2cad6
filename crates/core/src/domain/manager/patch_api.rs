//! Client patches and the port/patch mirror

use super::PolicyManager;
use crate::domain::audio::{
    AudioFormat, ChannelMask, DeviceTypeSet, PatchHandle, PolicyError, PortHandle, Result, StreamConfig, Uid,
};
use crate::domain::device::{Device, GainDescriptor};
use crate::domain::hal::HalClient;
use crate::domain::module::ProfileId;
use crate::domain::patch::{AudioPatch, PortConfig, PortExt, PortKind, PortRole};
use crate::domain::schedule::Settle;
use serde::Serialize;
use tracing::{debug, info};

/// A port as listed to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioPortInfo {
    pub id: PortHandle,
    pub role: PortRole,
    pub ext: PortExt,
    pub name: String,
    pub sample_rates: Vec<u32>,
    pub formats: Vec<AudioFormat>,
    pub channel_masks: Vec<ChannelMask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<GainDescriptor>,
}

impl AudioPortInfo {
    fn from_device(device: &Device, role: PortRole) -> Self {
        Self {
            id: device.port_id,
            role,
            ext: PortExt::Device {
                device_type: device.device_type,
                address: device.address.clone(),
            },
            name: device.name.clone(),
            sample_rates: device.sample_rates.clone(),
            formats: device.formats.clone(),
            channel_masks: device.channel_masks.clone(),
            gain: device.gain,
        }
    }

    fn from_mix(id: PortHandle, role: PortRole, ext: PortExt, name: String, config: StreamConfig) -> Self {
        Self {
            id,
            role,
            ext,
            name,
            sample_rates: vec![config.sample_rate],
            formats: vec![config.format],
            channel_masks: vec![config.channel_mask],
            gain: None,
        }
    }
}

impl<H: HalClient> PolicyManager<H> {
    fn profile_name(&self, profile: Option<ProfileId>) -> String {
        profile
            .and_then(|id| self.state.modules.profile(id))
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    /// Devices and mixes matching the filters, with the port generation
    pub fn list_audio_ports(&self, role: Option<PortRole>, kind: Option<PortKind>) -> (Vec<AudioPortInfo>, u32) {
        let mut ports = Vec::new();
        if kind != Some(PortKind::Mix) {
            ports.extend(
                self.state
                    .available_outputs
                    .iter()
                    .map(|d| AudioPortInfo::from_device(d, PortRole::Sink)),
            );
            ports.extend(
                self.state
                    .available_inputs
                    .iter()
                    .map(|d| AudioPortInfo::from_device(d, PortRole::Source)),
            );
        }
        if kind != Some(PortKind::Device) {
            ports.extend(self.state.outputs.iter().map(|o| {
                AudioPortInfo::from_mix(
                    o.port_id,
                    PortRole::Source,
                    PortExt::Mix { io: o.io },
                    self.profile_name(o.profile),
                    o.config,
                )
            }));
            ports.extend(self.state.inputs.iter().map(|i| {
                AudioPortInfo::from_mix(
                    i.port_id,
                    PortRole::Sink,
                    PortExt::Mix { io: i.io },
                    self.profile_name(Some(i.profile)),
                    i.config,
                )
            }));
        }
        ports.retain(|p| role.map_or(true, |r| p.role == r));
        (ports, self.state.port_generation)
    }

    pub fn list_audio_patches(&self) -> (Vec<AudioPatch>, u32) {
        (self.state.patches.iter().cloned().collect(), self.state.port_generation)
    }

    fn check_patch_owner(&self, handle: PatchHandle, uid: Uid) -> Result<()> {
        let patch = self
            .state
            .patches
            .get(handle)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown patch {}", handle)))?;
        if patch.uid != uid && uid != Uid::SYSTEM {
            return Err(PolicyError::invalid_operation(format!(
                "patch {} belongs to uid {}",
                handle, patch.uid.0
            )));
        }
        Ok(())
    }

    fn output_sink_devices(&self, sinks: &[PortConfig]) -> Result<Vec<Device>> {
        sinks
            .iter()
            .map(|sink| match &sink.ext {
                PortExt::Device { device_type, address } => self
                    .state
                    .available_outputs
                    .find(*device_type, address)
                    .cloned()
                    .ok_or_else(|| PolicyError::bad_value(format!("{} is not available", device_type))),
                PortExt::Mix { .. } => Err(PolicyError::bad_value("sinks mix devices and mixes")),
            })
            .collect()
    }

    /// Create or update a client patch. Mix sources reroute their output,
    /// mix sinks reroute their input, and device to device requests build
    /// a direct or bridged patch.
    pub fn create_audio_patch(
        &mut self,
        sources: &[PortConfig],
        sinks: &[PortConfig],
        handle: Option<PatchHandle>,
        uid: Uid,
    ) -> Result<PatchHandle> {
        AudioPatch::validate_request(sources, sinks)?;
        let source = &sources[0];

        let mut handle = handle.filter(|h| self.state.patches.contains(*h));
        if let Some(h) = handle {
            self.check_patch_owner(h, uid)?;
            let same_source = self
                .state
                .patches
                .get(h)
                .and_then(|p| p.sources.first())
                .is_some_and(|s| s.ext == source.ext);
            if !same_source {
                debug!(patch = %h, "Patch source changed, releasing the old patch");
                self.release_audio_patch(h, Uid::SYSTEM)?;
                handle = None;
            }
        }

        let created = match (&source.ext, &sinks[0].ext) {
            (PortExt::Mix { io }, _) => {
                let io = *io;
                if self.state.outputs.get(io).is_none() {
                    return Err(PolicyError::bad_value(format!("unknown output {}", io)));
                }
                let devices: DeviceTypeSet = self
                    .output_sink_devices(sinks)?
                    .iter()
                    .map(|d| d.device_type)
                    .collect();
                if !devices.is_subset(&self.state.outputs.supported_devices(io)) {
                    return Err(PolicyError::bad_value(format!("output {} cannot reach {}", io, devices)));
                }
                self.try_set_output_device(io, &devices, true, 0, handle)?;
                self.state
                    .outputs
                    .get(io)
                    .and_then(|d| d.patch)
                    .ok_or_else(|| PolicyError::HardwareFailure(format!("output {} was not patched", io)))?
            }
            (PortExt::Device { device_type, address }, PortExt::Mix { io }) => {
                let io = *io;
                if sinks.len() != 1 {
                    return Err(PolicyError::bad_value("an input mix takes a single source"));
                }
                if self.state.inputs.get(io).is_none() {
                    return Err(PolicyError::bad_value(format!("unknown input {}", io)));
                }
                if !self.state.available_inputs.contains(*device_type, address) {
                    return Err(PolicyError::bad_value(format!("{} is not available", device_type)));
                }
                self.set_input_device(io, *device_type, true, handle)?;
                self.state
                    .inputs
                    .get(io)
                    .and_then(|d| d.patch)
                    .ok_or_else(|| PolicyError::HardwareFailure(format!("input {} was not patched", io)))?
            }
            (PortExt::Device { device_type, address }, PortExt::Device { .. }) => {
                let from = self
                    .state
                    .available_inputs
                    .find(*device_type, address)
                    .cloned()
                    .ok_or_else(|| PolicyError::bad_value(format!("{} is not available", device_type)))?;
                let to = self.output_sink_devices(sinks)?;
                let (h, hal_existing) = match handle {
                    Some(h) => (h, self.state.patches.get(h).and_then(|p| p.hal_handle)),
                    None => (self.next_patch(), None),
                };
                let patch = self.build_device_patch(h, uid, &from, &to, hal_existing, 0)?;
                self.state.patches.add(patch);
                h
            }
        };

        if let Some(patch) = self.state.patches.get_mut(created) {
            patch.uid = uid;
        }
        self.state.next_port_generation();
        info!(patch = %created, uid = uid.0, "Client patch created");
        Ok(created)
    }

    /// Drop a client patch; the affected stream falls back to its
    /// resolved device
    pub fn release_audio_patch(&mut self, handle: PatchHandle, uid: Uid) -> Result<Settle> {
        self.check_patch_owner(handle, uid)?;
        let output = self.state.outputs.iter().find(|d| d.patch == Some(handle)).map(|d| d.io);
        let input = self.state.inputs.iter().find(|d| d.patch == Some(handle)).map(|d| d.io);
        if let Some(patch) = self.state.patches.get_mut(handle) {
            patch.uid = Uid::SYSTEM;
        }

        let mut settle = Settle::NONE;
        if let Some(io) = output {
            let devices = self.new_output_device(io, false);
            if devices.is_empty() {
                self.reset_output_device(io, 0);
            } else {
                settle = self.try_set_output_device(io, &devices, true, 0, Some(handle))?;
            }
        } else if let Some(io) = input {
            match self.new_input_device(io) {
                Some(device) => self.set_input_device(io, device, true, Some(handle))?,
                None => self.reset_input_device(io),
            }
        } else if let Some(hal_handle) = self.state.patches.remove(handle).and_then(|p| p.hal_handle) {
            self.hal.release_audio_patch(hal_handle, 0)?;
        }
        self.state.next_port_generation();
        info!(patch = %handle, uid = uid.0, "Client patch released");
        Ok(settle)
    }

    /// Release every patch a client created
    pub fn clear_audio_patches(&mut self, uid: Uid) -> Result<Settle> {
        let owned: Vec<PatchHandle> = self
            .state
            .patches
            .iter()
            .filter(|p| p.uid == uid)
            .map(|p| p.handle)
            .collect();
        let mut settle = Settle::NONE;
        for handle in owned {
            settle = settle.join(self.release_audio_patch(handle, uid)?);
        }
        Ok(settle)
    }

    /// Apply a port configuration; only device ports with a gain stage
    /// accept a gain
    pub fn set_audio_port_config(&mut self, config: &PortConfig) -> Result<()> {
        match &config.ext {
            PortExt::Device { device_type, address } => {
                let device = self
                    .state
                    .available_outputs
                    .find(*device_type, address)
                    .or_else(|| self.state.available_inputs.find(*device_type, address))
                    .ok_or_else(|| PolicyError::bad_value(format!("{} is not available", device_type)))?;
                if let Some(db) = config.gain_db {
                    let gain = device
                        .gain
                        .ok_or_else(|| PolicyError::invalid_operation(format!("{} has no gain stage", device_type)))?;
                    if !gain.accepts(db) {
                        return Err(PolicyError::bad_value(format!("gain {} dB out of range", db)));
                    }
                }
            }
            PortExt::Mix { io } => {
                if self.state.outputs.get(*io).is_none() && self.state.inputs.get(*io).is_none() {
                    return Err(PolicyError::bad_value(format!("unknown mix {}", io)));
                }
                if config.gain_db.is_some() {
                    return Err(PolicyError::invalid_operation("mix ports have no gain stage"));
                }
            }
        }
        self.hal.set_audio_port_config(config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;
    use crate::domain::audio::{ConnectionState, DeviceType, IoHandle, SessionId, StreamType};
    use crate::domain::command::OutputAttributes;

    fn sink(manager: &PolicyManager<crate::domain::hal::fake::FakeHal>, device: DeviceType) -> PortConfig {
        let d = manager.state().available_outputs.first_of_type(device).unwrap();
        PortConfig::device(d.port_id, PortRole::Sink, d.device_type, "")
    }

    fn speaker_and_headset(manager: &PolicyManager<crate::domain::hal::fake::FakeHal>) -> Vec<PortConfig> {
        vec![sink(manager, DeviceType::Speaker), sink(manager, DeviceType::WiredHeadset)]
    }

    fn music_mix(manager: &mut PolicyManager<crate::domain::hal::fake::FakeHal>) -> (IoHandle, PortConfig) {
        let io = manager
            .get_output_for_attr(&OutputAttributes::new(StreamType::Music, SessionId(1)))
            .unwrap();
        manager.start_output(io, StreamType::Music, SessionId(1)).unwrap();
        let desc = manager.state().outputs.get(io).unwrap();
        (io, PortConfig::mix(desc.port_id, PortRole::Source, io))
    }

    #[test]
    fn test_client_patch_updates_in_place() {
        let (mut manager, _) = manager();
        manager
            .set_device_connection_state(DeviceType::WiredHeadset, ConnectionState::Available, "", "")
            .unwrap();
        let (io, source) = music_mix(&mut manager);
        let both = speaker_and_headset(&manager);
        let handle = manager.create_audio_patch(&[source.clone()], &both, None, Uid(10_100)).unwrap();
        let hal_handle = manager.state().patches.get(handle).unwrap().hal_handle;
        let count = manager.state().patches.len();

        let speaker_only = vec![both[0].clone()];
        let again = manager
            .create_audio_patch(&[source], &speaker_only, Some(handle), Uid(10_100))
            .unwrap();
        assert_eq!(again, handle);
        assert_eq!(manager.state().patches.len(), count);
        let patch = manager.state().patches.get(handle).unwrap();
        assert_eq!(patch.hal_handle, hal_handle);
        assert_eq!(patch.uid, Uid(10_100));
        assert_eq!(patch.sink_devices(), DeviceTypeSet::single(DeviceType::Speaker));
        // the client patch overrides the strategy
        assert_eq!(manager.new_output_device(io, false), DeviceTypeSet::single(DeviceType::Speaker));
    }

    #[test]
    fn test_patch_owned_by_other_uid_is_protected() {
        let (mut manager, _) = manager();
        manager
            .set_device_connection_state(DeviceType::WiredHeadset, ConnectionState::Available, "", "")
            .unwrap();
        let (io, source) = music_mix(&mut manager);
        let speaker = vec![sink(&manager, DeviceType::Speaker)];
        let handle = manager.create_audio_patch(&[source.clone()], &speaker, None, Uid(10_100)).unwrap();

        let err = manager
            .create_audio_patch(&[source], &speaker, Some(handle), Uid(10_200))
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOperation(_)));
        let err = manager.release_audio_patch(handle, Uid(10_200)).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOperation(_)));

        manager.release_audio_patch(handle, Uid(10_100)).unwrap();
        // back on the resolved device
        assert_eq!(
            manager.state().outputs.get(io).unwrap().devices,
            DeviceTypeSet::single(DeviceType::WiredHeadset)
        );
        assert_eq!(manager.state().patches.get(handle).unwrap().uid, Uid::SYSTEM);
    }

    #[test]
    fn test_invalid_patch_shapes_rejected() {
        let (mut manager, _) = manager();
        let (_, source) = music_mix(&mut manager);
        assert!(matches!(
            manager.create_audio_patch(&[source.clone()], &[], None, Uid::SYSTEM),
            Err(PolicyError::BadValue(_))
        ));
        // headset not connected
        let headset = PortConfig::device(PortHandle(9_999), PortRole::Sink, DeviceType::WiredHeadset, "");
        assert!(matches!(
            manager.create_audio_patch(&[source], &[headset], None, Uid::SYSTEM),
            Err(PolicyError::BadValue(_))
        ));
    }

    #[test]
    fn test_device_to_device_patch() {
        let (mut manager, _) = manager();
        let rx = manager.state().available_inputs.first_of_type(DeviceType::TelephonyRx).unwrap().clone();
        let source = PortConfig::device(rx.port_id, PortRole::Source, rx.device_type, "");
        let speaker = vec![sink(&manager, DeviceType::Speaker)];
        let handle = manager.create_audio_patch(&[source], &speaker, None, Uid(10_100)).unwrap();

        let (patches, generation) = manager.list_audio_patches();
        assert_eq!(generation, manager.state().port_generation);
        let patch = patches.iter().find(|p| p.handle == handle).unwrap();
        // same module with native support: no bridge
        assert!(!patch.is_bridge());

        let released = manager.hal().released.len();
        manager.release_audio_patch(handle, Uid(10_100)).unwrap();
        assert!(manager.state().patches.get(handle).is_none());
        assert_eq!(manager.hal().released.len(), released + 1);
    }

    #[test]
    fn test_list_ports_filters() {
        let (manager, _) = manager();
        let (sinks, _) = manager.list_audio_ports(Some(PortRole::Sink), Some(PortKind::Device));
        assert!(sinks.iter().any(|p| p.name == "Speaker"));
        assert!(sinks.iter().all(|p| p.role == PortRole::Sink && p.ext.kind() == PortKind::Device));
        let (mixes, _) = manager.list_audio_ports(None, Some(PortKind::Mix));
        assert_eq!(mixes.len(), manager.state().outputs.len() + manager.state().inputs.len());
    }

    #[test]
    fn test_port_gain_validated() {
        let (mut manager, _) = manager();
        let speaker = manager.state().available_outputs.first_of_type(DeviceType::Speaker).unwrap().clone();
        let mut config = PortConfig::device(speaker.port_id, PortRole::Sink, DeviceType::Speaker, "");
        config.gain_db = Some(-6.0);
        assert!(matches!(
            manager.set_audio_port_config(&config),
            Err(PolicyError::InvalidOperation(_))
        ));

        if let Some(d) = manager.state.available_outputs.get_mut(speaker.port_id) {
            d.gain = Some(GainDescriptor {
                min_db: -48.0,
                max_db: 0.0,
                default_db: 0.0,
                step_db: 3.0,
            });
        }
        manager.set_audio_port_config(&config).unwrap();
        config.gain_db = Some(-7.0);
        assert!(matches!(manager.set_audio_port_config(&config), Err(PolicyError::BadValue(_))));
    }
}
