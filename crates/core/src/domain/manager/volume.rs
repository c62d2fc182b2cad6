//! Stream volume indexes, nested mutes and hardware volume writes

use super::PolicyManager;
use crate::domain::audio::{
    DeviceType, DeviceTypeSet, ForceUse, ForcedConfig, IoHandle, PhoneState, PolicyError, Result,
    StreamType,
};
use crate::domain::hal::HalClient;
use crate::domain::strategy::Strategy;
use crate::domain::volume::{
    db_to_amplitude, device_for_volume, VolumeContext, SONIFICATION_HEADSET_MUSIC_DELAY_MS,
};
use tracing::{debug, trace};

impl<H: HalClient> PolicyManager<H> {
    /// Set the index range of a stream
    pub fn init_stream_volume(&mut self, stream: StreamType, index_min: u32, index_max: u32) -> Result<()> {
        self.state.volumes.stream_mut(stream).set_range(index_min, index_max)?;
        debug!(%stream, index_min, index_max, "Stream volume range set");
        Ok(())
    }

    /// Store a volume index and apply it to the outputs playing the stream
    ///
    /// Without a device the index becomes the stream default and replaces
    /// every per-device index.
    pub fn set_stream_volume_index(&mut self, stream: StreamType, index: u32, device: Option<DeviceType>) -> Result<()> {
        let desc = self.state.volumes.stream(stream);
        if index < desc.index_min || index > desc.index_max {
            return Err(PolicyError::bad_value(format!(
                "volume index {} outside {}..{} for {}",
                index, desc.index_min, desc.index_max, stream
            )));
        }
        if let Some(device) = device {
            if !device.is_output() {
                return Err(PolicyError::bad_value(format!("{} is not an output device", device)));
            }
        }
        let index = if stream.can_be_muted() { index } else { desc.index_max };
        self.state.volumes.stream_mut(stream).set_index(device, index)?;
        debug!(%stream, index, device = ?device, "Volume index set");

        let strategy_devices = self.device_for_strategy(Strategy::for_stream(stream), true);
        let mut status = Ok(());
        for io in self.state.outputs.handles() {
            let current = self.state.outputs.devices(io);
            let Some(current_device) = device_for_volume(&current) else {
                continue;
            };
            let applies = match device {
                None => true,
                Some(d) => strategy_devices.contains(current_device) && strategy_devices.contains(d),
            };
            if !applies {
                continue;
            }
            let index = self.state.volumes.stream(stream).index_for(Some(current_device));
            if let Err(e) = self.check_and_set_volume(stream, index, io, Some(current_device), 0, false) {
                status = Err(e);
            }
            if stream == StreamType::Ring {
                let index = self
                    .state
                    .volumes
                    .stream(StreamType::Accessibility)
                    .index_for(Some(current_device));
                let _ = self.check_and_set_volume(StreamType::Accessibility, index, io, Some(current_device), 0, false);
            }
        }
        status
    }

    /// Index of a stream for a device, or for the device the stream plays on
    pub fn stream_volume_index(&self, stream: StreamType, device: Option<DeviceType>) -> Result<u32> {
        let device = match device {
            Some(d) if !d.is_output() => {
                return Err(PolicyError::bad_value(format!("{} is not an output device", d)));
            }
            Some(d) => Some(d),
            None => device_for_volume(&self.device_for_strategy(Strategy::for_stream(stream), true)),
        };
        Ok(self.state.volumes.stream(stream).index_for(device))
    }

    /// Rules that make one stream's volume depend on other streams
    fn volume_context(&self, stream: StreamType) -> VolumeContext {
        let now = self.now_ms();
        let music_devices = self.device_for_strategy(Strategy::Media, true);
        let music_db = device_for_volume(&music_devices)
            .map(|d| {
                let index = self.state.volumes.stream(StreamType::Music).index_for(Some(d));
                self.state
                    .volumes
                    .compute_volume(StreamType::Music, index, d, &VolumeContext::default())
            })
            .unwrap_or(0.0);
        let ring_audible = self.state.phone_state == PhoneState::Ringtone
            || self.state.outputs.is_stream_active(StreamType::Ring, 0, now);
        let ring_db = if stream == StreamType::Accessibility && ring_audible {
            let ring_devices = self.device_for_strategy(Strategy::Sonification, true);
            device_for_volume(&ring_devices).map(|d| {
                let index = self.state.volumes.stream(StreamType::Ring).index_for(Some(d));
                self.state
                    .volumes
                    .compute_volume(StreamType::Ring, index, d, &VolumeContext::default())
            })
        } else {
            None
        };
        VolumeContext {
            music_active: self.state.limit_ringtone_volume
                || self
                    .state
                    .outputs
                    .is_stream_active(StreamType::Music, SONIFICATION_HEADSET_MUSIC_DELAY_MS, now),
            music_db,
            ring_db,
            system_enforced: self.state.force_use(ForceUse::System) == ForcedConfig::SystemEnforced,
            in_ear_route: false,
        }
    }

    /// Write a stream volume to an output unless the stream is muted there
    ///
    /// `device` defaults to the output's current device. The write is skipped
    /// when the value did not change and `force` is not set.
    pub(crate) fn check_and_set_volume(
        &mut self,
        stream: StreamType,
        index: u32,
        io: IoHandle,
        device: Option<DeviceType>,
        delay_ms: u32,
        force: bool,
    ) -> Result<()> {
        let desc = self
            .state
            .outputs
            .get(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown output {}", io)))?;
        if desc.is_muted(stream) {
            return Ok(());
        }
        let sco_forced = self.state.force_use(ForceUse::Communication) == ForcedConfig::BtSco;
        if (stream == StreamType::VoiceCall && sco_forced) || (stream == StreamType::BluetoothSco && !sco_forced) {
            return Err(PolicyError::invalid_operation(format!(
                "{} volume not applicable with the current communication route",
                stream
            )));
        }
        let Some(device) = device.or_else(|| device_for_volume(&self.state.outputs.devices(io))) else {
            return Ok(());
        };

        let route = self.state.outputs.devices(io);
        let mut ctx = self.volume_context(stream);
        ctx.in_ear_route = route.contains(device) && route.iter().any(DeviceType::is_in_ear);
        let db = self.state.volumes.compute_volume(stream, index, device, &ctx);
        let changed = desc.cur_volume_db[stream.index()] != Some(db);
        if changed || force {
            if let Some(desc) = self.state.outputs.get_mut(io) {
                desc.cur_volume_db[stream.index()] = Some(db);
            }
            trace!(output = %io, %stream, index, %device, db, "Volume write");
            Self::hal_warn(
                self.hal.set_stream_volume(stream, db_to_amplitude(db), io, delay_ms),
                "volume write",
            );
        }

        if matches!(stream, StreamType::VoiceCall | StreamType::BluetoothSco) {
            let voice = if stream == StreamType::VoiceCall {
                index as f32 / self.state.volumes.stream(stream).index_max as f32
            } else {
                1.0
            };
            if Some(io) == self.state.primary_output && self.state.last_voice_volume != Some(voice) {
                Self::hal_warn(self.hal.set_voice_volume(voice, delay_ms), "voice volume write");
                self.state.last_voice_volume = Some(voice);
            }
        }
        Ok(())
    }

    /// Reapply every stream's volume after an output changed device
    pub(crate) fn apply_stream_volumes(&mut self, io: IoHandle, devices: &DeviceTypeSet, delay_ms: u32, force: bool) {
        let device = device_for_volume(devices);
        for stream in StreamType::ALL {
            let index = self.state.volumes.stream(stream).index_for(device);
            let _ = self.check_and_set_volume(stream, index, io, device, delay_ms, force);
        }
    }

    pub(crate) fn set_strategy_mute(
        &mut self,
        strategy: Strategy,
        on: bool,
        io: IoHandle,
        delay_ms: u32,
        device: Option<DeviceType>,
    ) {
        for stream in strategy.streams() {
            self.set_stream_mute(stream, on, io, delay_ms, device);
        }
    }

    /// Nested mute: the first mute silences the stream, the last unmute
    /// restores the index volume for `device`
    pub(crate) fn set_stream_mute(
        &mut self,
        stream: StreamType,
        on: bool,
        io: IoHandle,
        delay_ms: u32,
        device: Option<DeviceType>,
    ) {
        let Some(desc) = self.state.outputs.get(io) else {
            return;
        };
        let device = device.or_else(|| device_for_volume(&self.state.outputs.devices(io)));
        let count = desc.mute_count[stream.index()];
        if on {
            if count == 0 {
                let system_enforced = self.state.force_use(ForceUse::System) == ForcedConfig::SystemEnforced;
                if stream.can_be_muted() && (stream != StreamType::EnforcedAudible || !system_enforced) {
                    let _ = self.check_and_set_volume(stream, 0, io, device, delay_ms, false);
                }
            }
            if let Some(desc) = self.state.outputs.get_mut(io) {
                desc.mute_count[stream.index()] += 1;
            }
        } else {
            if count == 0 {
                trace!(output = %io, %stream, "Unmute of a stream that is not muted");
                return;
            }
            if let Some(desc) = self.state.outputs.get_mut(io) {
                desc.mute_count[stream.index()] -= 1;
            }
            if count == 1 {
                let index = self.state.volumes.stream(stream).index_for(device);
                let _ = self.check_and_set_volume(stream, index, io, device, delay_ms, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;
    use crate::domain::audio::SessionId;
    use crate::domain::command::OutputAttributes;
    use crate::domain::hal::fake::FakeHal;
    use crate::domain::volume::VOLUME_MIN_DB;

    #[test]
    fn test_nested_mute_suppresses_writes() {
        let (mut manager, _) = manager();
        let io = manager.primary_output().unwrap();
        manager.set_stream_mute(StreamType::Music, true, io, 0, None);
        manager.set_stream_mute(StreamType::Music, true, io, 0, None);
        assert_eq!(
            manager.state().outputs.get(io).unwrap().cur_volume_db[StreamType::Music.index()],
            Some(VOLUME_MIN_DB)
        );

        let writes_on = |m: &PolicyManager<FakeHal>| m.hal().volumes.iter().filter(|(_, _, o)| *o == io).count();
        let writes = writes_on(&manager);
        manager.set_stream_volume_index(StreamType::Music, 3, None).unwrap();
        assert_eq!(writes_on(&manager), writes);

        manager.set_stream_mute(StreamType::Music, false, io, 0, None);
        assert!(manager.state().outputs.get(io).unwrap().is_muted(StreamType::Music));
        manager.set_stream_mute(StreamType::Music, false, io, 0, None);
        assert!(!manager.state().outputs.get(io).unwrap().is_muted(StreamType::Music));
        let restored = manager.state().outputs.get(io).unwrap().cur_volume_db[StreamType::Music.index()];
        assert!(restored.unwrap() > VOLUME_MIN_DB);
    }

    #[test]
    fn test_volume_index_validation() {
        let (mut manager, _) = manager();
        assert!(matches!(
            manager.set_stream_volume_index(StreamType::Music, 99, None),
            Err(PolicyError::BadValue(_))
        ));
        assert!(matches!(
            manager.set_stream_volume_index(StreamType::Music, 5, Some(DeviceType::BuiltinMic)),
            Err(PolicyError::BadValue(_))
        ));
        manager
            .set_stream_volume_index(StreamType::Music, 5, Some(DeviceType::Speaker))
            .unwrap();
        assert_eq!(manager.stream_volume_index(StreamType::Music, Some(DeviceType::Speaker)).unwrap(), 5);
        assert_eq!(manager.stream_volume_index(StreamType::Music, None).unwrap(), 5);
        assert_eq!(manager.stream_volume_index(StreamType::Music, Some(DeviceType::WiredHeadset)).unwrap(), 15);

        manager.init_stream_volume(StreamType::Music, 0, 30).unwrap();
        assert!(manager.init_stream_volume(StreamType::Music, 4, 4).is_err());
    }

    #[test]
    fn test_non_mutable_stream_forced_to_max() {
        let (mut manager, _) = manager();
        manager.set_stream_volume_index(StreamType::Rerouting, 0, None).unwrap();
        assert_eq!(manager.stream_volume_index(StreamType::Rerouting, None).unwrap(), 1);
    }

    #[test]
    fn test_voice_volume_follows_call_index() {
        let (mut manager, _) = manager();
        let io = manager.primary_output().unwrap();
        manager.check_and_set_volume(StreamType::VoiceCall, 5, io, None, 0, false).unwrap();
        assert_eq!(manager.state().last_voice_volume, Some(1.0));
        manager.check_and_set_volume(StreamType::VoiceCall, 1, io, None, 0, false).unwrap();
        assert_eq!(manager.state().last_voice_volume, Some(0.2));
        assert!(matches!(
            manager.check_and_set_volume(StreamType::BluetoothSco, 1, io, None, 0, false),
            Err(PolicyError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_playback_start_writes_volume() {
        let (mut manager, _) = manager();
        let io = manager
            .get_output_for_attr(&OutputAttributes::new(StreamType::Alarm, SessionId(4)))
            .unwrap();
        manager.start_output(io, StreamType::Alarm, SessionId(4)).unwrap();
        let expected = manager.state().volumes.compute_volume(
            StreamType::Alarm,
            manager.state().volumes.stream(StreamType::Alarm).index_for(Some(DeviceType::Speaker)),
            DeviceType::Speaker,
            &VolumeContext::default(),
        );
        assert_eq!(
            manager.state().outputs.get(io).unwrap().cur_volume_db[StreamType::Alarm.index()],
            Some(expected)
        );
    }
}
