//! Capture lifecycle and input device routing

use super::PolicyManager;
use crate::domain::audio::{
    AudioSource, ConnectionState, DeviceType, Direction, InputFlags, IoHandle, PatchHandle,
    PhoneState, PolicyError, Result, SessionId, Uid,
};
use crate::domain::command::InputAttributes;
use crate::domain::descriptor::{InputDescriptor, InputSession};
use crate::domain::hal::{
    HalClient, InputRequest, ParameterString, KEY_ADDRESS, KEY_DEVICE_CONNECT, KEY_DEVICE_DISCONNECT,
};
use crate::domain::module::ProfileId;
use crate::domain::patch::{AudioPatch, PortConfig, PortRole};
use crate::domain::schedule::Settle;
use crate::domain::strategy::REMOTE_SUBMIX_MEDIA_ADDRESS;
use tracing::{debug, info, warn};

impl<H: HalClient> PolicyManager<H> {
    // ========================================================================
    // Probing
    // ========================================================================

    /// Register attached input devices reachable through a profile that
    /// the hardware accepts to open
    pub(crate) fn probe_attached_inputs(&mut self, module: usize) {
        let Some(m) = self.state.modules.get(module) else {
            return;
        };
        let Some(module_handle) = m.handle else {
            return;
        };
        let attached: Vec<_> = m.attached().filter(|d| d.device_type.is_input()).cloned().collect();
        let profiles: Vec<ProfileId> = (0..m.input_profiles.len())
            .map(|index| ProfileId {
                module,
                direction: Direction::Input,
                index,
            })
            .collect();

        for id in profiles {
            let Some(profile) = self.state.modules.profile(id) else {
                continue;
            };
            let reachable: Vec<_> = attached
                .iter()
                .filter(|d| profile.supports_device(d.device_type))
                .cloned()
                .collect();
            let Some(target) = reachable.first() else {
                continue;
            };
            let request = InputRequest {
                device: target.device_type,
                address: target.address.clone(),
                config: profile.pick_config(),
                flags: profile.input_flags(),
                source: AudioSource::Mic,
            };
            let io = self.next_io();
            if let Err(e) = self.hal.open_input(module_handle, io, &request) {
                warn!(module, profile = id.index, error = %e, "Cannot open input for attached device");
                continue;
            }
            for device in reachable {
                let mut device = device;
                device.attach(module_handle);
                self.state.available_inputs.add(device);
            }
            Self::hal_warn(self.hal.close_input(io), "probe input close");
        }
    }

    /// Open and close a probe input through every profile reaching a
    /// connecting device, learning dynamic capabilities on the way
    fn check_inputs_for_device(&mut self, device: DeviceType, address: &str) -> Result<()> {
        let profiles: Vec<ProfileId> = self
            .state
            .modules
            .profiles(Direction::Input)
            .into_iter()
            .filter(|(id, p)| {
                p.supports_device(device) && self.state.modules.get(id.module).is_some_and(|m| m.handle.is_some())
            })
            .map(|(id, _)| id)
            .collect();

        let mut usable = 0;
        for id in profiles {
            if self.state.inputs.iter().any(|d| d.profile == id) {
                usable += 1;
                continue;
            }
            if self.probe_input(id, device, address) {
                usable += 1;
            } else {
                warn!(%device, profile = ?id, "Could not open input for device");
            }
        }
        if usable == 0 {
            warn!(%device, "No input available for device");
            return Err(PolicyError::invalid_operation(format!("no input available for {}", device)));
        }
        Ok(())
    }

    fn probe_input(&mut self, id: ProfileId, device: DeviceType, address: &str) -> bool {
        let Some(module_handle) = self.state.modules.get(id.module).and_then(|m| m.handle) else {
            return false;
        };
        let Some(profile) = self.state.modules.profile(id) else {
            return false;
        };
        let dynamic = profile.dynamic;
        let request = InputRequest {
            device,
            address: address.to_string(),
            config: profile.pick_config(),
            flags: profile.input_flags(),
            source: AudioSource::Mic,
        };
        let io = self.next_io();
        if let Err(e) = self.hal.open_input(module_handle, io, &request) {
            warn!(%device, error = %e, "Probe input open failed");
            return false;
        }
        if !address.is_empty() {
            let mut params = ParameterString::new();
            params.add(KEY_ADDRESS, address);
            Self::hal_warn(self.hal.set_parameters(Some(io), &params.to_string(), 0), "input address");
        }
        if dynamic.any() {
            self.import_dynamic_caps(id, Some(io), dynamic);
        }
        let valid = self.state.modules.profile(id).is_some_and(|p| p.has_valid_caps());
        Self::hal_warn(self.hal.close_input(io), "probe input close");
        valid
    }

    pub(crate) fn set_input_device_connection(
        &mut self,
        device: DeviceType,
        state: ConnectionState,
        address: &str,
        name: &str,
    ) -> Result<Settle> {
        let known = self.state.available_inputs.contains(device, address);
        match state {
            ConnectionState::Available => {
                if known {
                    warn!(%device, address, "Input device already connected");
                    return Err(PolicyError::invalid_operation(format!("{} already connected", device)));
                }
                let desc = self.connecting_device(device, address, name)?;
                let address = desc.address.clone();
                self.check_inputs_for_device(device, &address)?;
                self.state.available_inputs.add(desc);
                let mut params = ParameterString::new();
                params.add(KEY_DEVICE_CONNECT, device.to_string()).add(KEY_ADDRESS, address.as_str());
                Self::hal_warn(self.hal.set_parameters(None, &params.to_string(), 0), "device connect");
            }
            ConnectionState::Unavailable => {
                if !known {
                    warn!(%device, address, "Input device not connected");
                    return Err(PolicyError::invalid_operation(format!("{} not connected", device)));
                }
                let mut params = ParameterString::new();
                params.add(KEY_DEVICE_DISCONNECT, device.to_string()).add(KEY_ADDRESS, address);
                Self::hal_warn(self.hal.set_parameters(None, &params.to_string(), 0), "device disconnect");
                self.state.available_inputs.remove(device, address);
                self.release_patches_for_device(device);
                let lost: Vec<IoHandle> = self
                    .state
                    .inputs
                    .on_device(device)
                    .into_iter()
                    .filter(|io| {
                        !device.distinguishes_on_address()
                            || self.state.inputs.get(*io).is_some_and(|d| d.address == address)
                    })
                    .collect();
                for io in lost {
                    self.close_input(io);
                }
                let profiles: Vec<ProfileId> = self
                    .state
                    .modules
                    .profiles(Direction::Input)
                    .into_iter()
                    .filter(|(_, p)| p.supports_device(device))
                    .map(|(id, _)| id)
                    .collect();
                for id in profiles {
                    if let Some(p) = self.state.modules.profile_mut(id) {
                        p.clear_dynamic();
                    }
                }
            }
        }
        self.state.touch();
        // input devices take part in output selection, e.g. SCO
        self.update_devices_and_outputs();

        let mut settle = Settle::NONE;
        if self.state.phone_state == PhoneState::InCall {
            if let Some(primary) = self.state.primary_output {
                let rx = self.new_output_device(primary, false);
                settle = self.update_call_routing(&rx, 0);
            }
        }
        for io in self.state.inputs.active_inputs(false) {
            if let Some(device) = self.new_input_device(io) {
                if let Err(e) = self.set_input_device(io, device, false, None) {
                    warn!(input = %io, error = %e, "Input routing failed");
                }
            }
        }
        Ok(settle)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Find or open an input for a capture client
    pub fn get_input_for_attr(&mut self, attrs: &InputAttributes) -> Result<IoHandle> {
        let source = if attrs.source == AudioSource::Default {
            AudioSource::Mic
        } else {
            attrs.source
        };
        let selected = attrs
            .selected_device
            .and_then(|port| self.state.available_inputs.get(port))
            .map(|d| (d.device_type, d.address.clone()));
        self.state.input_routes.add(attrs.session, None, Some(source), selected);
        self.state.touch();

        match self.input_for_source(source, attrs) {
            Ok(io) => {
                debug!(?source, session = attrs.session.0, input = %io, "Input selected");
                Ok(io)
            }
            Err(e) => {
                self.state.input_routes.remove(attrs.session);
                Err(e)
            }
        }
    }

    fn input_for_source(&mut self, source: AudioSource, attrs: &InputAttributes) -> Result<IoHandle> {
        let device = self
            .device_for_input_source(source)
            .ok_or_else(|| PolicyError::bad_value(format!("no input device for {:?}", source)))?;
        let address = if device == DeviceType::RemoteSubmixIn {
            REMOTE_SUBMIX_MEDIA_ADDRESS.to_string()
        } else {
            self.state
                .available_inputs
                .first_of_type(device)
                .map(|d| d.address.clone())
                .unwrap_or_default()
        };

        let profile = self
            .input_profile_for(device, attrs, &attrs.flags)
            .or_else(|| self.input_profile_for(device, attrs, &InputFlags::NONE))
            .ok_or_else(|| PolicyError::bad_value(format!("no input profile reaches {}", device)))?;

        // same session asking again on the same profile
        if let Some(io) = self.state.inputs.input_for_session(attrs.session) {
            let Some(desc) = self.state.inputs.get_mut(io) else {
                return Err(PolicyError::bad_value("unknown input"));
            };
            if desc.profile == profile && !desc.is_virtual() {
                let Some(existing) = desc.sessions.get_mut(&attrs.session) else {
                    return Err(PolicyError::bad_value("unknown session"));
                };
                if existing.source != source {
                    return Err(PolicyError::invalid_operation(format!(
                        "session {} already captures {:?}",
                        attrs.session.0, existing.source
                    )));
                }
                existing.open_count += 1;
                return Ok(io);
            }
        }

        let (limit, config, module_handle) = {
            let prof = self
                .state
                .modules
                .profile(profile)
                .ok_or_else(|| PolicyError::bad_value("unknown profile"))?;
            let handle = self
                .state
                .modules
                .get(profile.module)
                .and_then(|m| m.handle)
                .ok_or_else(|| PolicyError::invalid_operation("module not loaded"))?;
            (prof.max_open_count, attrs.config.unwrap_or_else(|| prof.pick_config()), handle)
        };
        if limit > 0 {
            let open: Vec<IoHandle> = self
                .state
                .inputs
                .iter()
                .filter(|d| d.profile == profile)
                .map(|d| d.io)
                .collect();
            if open.len() >= limit as usize {
                let idle = open
                    .iter()
                    .copied()
                    .find(|io| self.state.inputs.get(*io).is_some_and(|d| !d.is_active()));
                match idle {
                    Some(io) => {
                        debug!(input = %io, "Closing idle input to honour profile limit");
                        self.close_input(io);
                    }
                    None => {
                        return Err(PolicyError::invalid_operation(format!(
                            "all {} inputs of the profile are busy",
                            limit
                        )))
                    }
                }
            }
        }

        let io = self.next_io();
        let request = InputRequest {
            device,
            address: address.clone(),
            config,
            flags: attrs.flags,
            source,
        };
        let opened = self.hal.open_input(module_handle, io, &request)?;
        let port = self.next_port();
        let mut desc = InputDescriptor::new(io, port, profile.module, profile, device, address);
        desc.config = opened;
        desc.flags = attrs.flags;
        desc.sessions.insert(
            attrs.session,
            InputSession {
                source,
                uid: attrs.uid,
                open_count: 1,
                active_count: 0,
            },
        );
        self.state.inputs.add(desc);
        self.state.next_port_generation();
        info!(input = %io, %device, ?source, "Input opened");
        Ok(io)
    }

    fn input_profile_for(&self, device: DeviceType, attrs: &InputAttributes, flags: &InputFlags) -> Option<ProfileId> {
        self.state
            .modules
            .profiles(Direction::Input)
            .into_iter()
            .find(|(id, p)| {
                self.state.modules.get(id.module).is_some_and(|m| m.handle.is_some())
                    && p.is_compatible_input(device, attrs.config.as_ref(), flags)
            })
            .map(|(id, _)| id)
    }

    /// A capture client starts. Captures are exclusive except on virtual
    /// devices; an active hotword-only input is preempted once.
    pub fn start_input(&mut self, io: IoHandle, session: SessionId) -> Result<Settle> {
        let desc = self
            .state
            .inputs
            .get(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown input {}", io)))?;
        if !desc.sessions.contains_key(&session) {
            return Err(PolicyError::bad_value(format!("unknown session {} on input {}", session.0, io)));
        }
        let profile = desc.profile;

        if !desc.is_virtual() {
            let others: Vec<IoHandle> = self
                .state
                .inputs
                .active_inputs(true)
                .into_iter()
                .filter(|other| *other != io)
                .collect();
            for other in others {
                let Some(other_desc) = self.state.inputs.get(other) else {
                    continue;
                };
                if !other_desc.is_hotword_only() || other_desc.preempted_sessions.contains(&session) {
                    warn!(input = %io, active = %other, "Another capture is already running");
                    return Err(PolicyError::invalid_operation(format!("input {} already started", other)));
                }
                let Some(active_session) = other_desc
                    .sessions
                    .iter()
                    .find(|(_, s)| s.active_count > 0)
                    .map(|(id, _)| *id)
                else {
                    continue;
                };
                if let Some(desc) = self.state.inputs.get_mut(io) {
                    desc.preempted_sessions.push(active_session);
                }
                info!(input = %io, preempted = %other, "Preempting hotword capture");
                self.stop_input(other, active_session)?;
                self.release_input(other, active_session)?;
            }
        }

        let max_active = self.state.modules.profile(profile).map_or(0, |p| p.max_active_count);
        if max_active > 0 {
            let active = self
                .state
                .inputs
                .iter()
                .filter(|d| d.io != io && d.profile == profile && d.is_active())
                .count();
            if active >= max_active as usize {
                return Err(PolicyError::invalid_operation("profile has no free active stream"));
            }
        }

        let Some(desc) = self.state.inputs.get_mut(io) else {
            return Err(PolicyError::bad_value(format!("unknown input {}", io)));
        };
        let was_active = desc.is_active();
        if let Some(s) = desc.sessions.get_mut(&session) {
            s.active_count += 1;
        }
        let submix = desc.device == DeviceType::RemoteSubmixIn;
        self.state.input_routes.inc_activity(session);
        self.state.touch();
        let route_changed = self.state.input_routes.take_changed(session);

        let mut settle = Settle::NONE;
        if !was_active || route_changed {
            if let Some(device) = self.new_input_device(io) {
                self.set_input_device(io, device, true, None)?;
            }
            if !was_active && submix {
                match self.set_device_connection_state(
                    DeviceType::RemoteSubmix,
                    ConnectionState::Available,
                    REMOTE_SUBMIX_MEDIA_ADDRESS,
                    "remote-submix",
                ) {
                    Ok(s) => settle = s,
                    Err(e) => debug!(error = %e, "Remote submix output not connected"),
                }
            }
        }
        debug!(input = %io, session = session.0, "Capture started");
        Ok(settle)
    }

    pub fn stop_input(&mut self, io: IoHandle, session: SessionId) -> Result<Settle> {
        let desc = self
            .state
            .inputs
            .get_mut(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown input {}", io)))?;
        let Some(s) = desc.sessions.get_mut(&session) else {
            return Err(PolicyError::bad_value(format!("unknown session {} on input {}", session.0, io)));
        };
        if s.active_count == 0 {
            warn!(input = %io, session = session.0, "Stop of an idle capture");
            return Err(PolicyError::invalid_operation(format!("input {} is not active", io)));
        }
        s.active_count -= 1;
        let still_active = desc.is_active();
        let submix = desc.device == DeviceType::RemoteSubmixIn;
        self.state.input_routes.dec_activity(session);
        self.state.touch();

        let mut settle = Settle::NONE;
        if still_active {
            if let Some(device) = self.new_input_device(io) {
                self.set_input_device(io, device, false, None)?;
            }
        } else {
            if submix {
                match self.set_device_connection_state(
                    DeviceType::RemoteSubmix,
                    ConnectionState::Unavailable,
                    REMOTE_SUBMIX_MEDIA_ADDRESS,
                    "remote-submix",
                ) {
                    Ok(s) => settle = s,
                    Err(e) => debug!(error = %e, "Remote submix output not disconnected"),
                }
            }
            self.reset_input_device(io);
            if let Some(desc) = self.state.inputs.get_mut(io) {
                desc.preempted_sessions.clear();
            }
        }
        debug!(input = %io, session = session.0, "Capture stopped");
        Ok(settle)
    }

    /// A capture client is done; the input closes with its last session
    pub fn release_input(&mut self, io: IoHandle, session: SessionId) -> Result<()> {
        self.state.input_routes.remove(session);
        self.state.touch();
        let desc = self
            .state
            .inputs
            .get_mut(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown input {}", io)))?;
        let Some(s) = desc.sessions.get_mut(&session) else {
            return Err(PolicyError::bad_value(format!("unknown session {} on input {}", session.0, io)));
        };
        s.open_count = s.open_count.saturating_sub(1);
        if s.open_count == 0 {
            if s.active_count > 0 {
                warn!(input = %io, session = session.0, "Releasing an active capture");
            }
            desc.sessions.remove(&session);
        }
        if desc.sessions.is_empty() {
            self.close_input(io);
        }
        Ok(())
    }

    pub(crate) fn close_input(&mut self, io: IoHandle) {
        self.reset_input_device(io);
        Self::hal_warn(self.hal.close_input(io), "input close");
        if self.state.inputs.remove(io).is_some() {
            self.state.next_port_generation();
            info!(input = %io, "Input closed");
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Patch a capture device into an input, updating its patch in place
    pub(crate) fn set_input_device(
        &mut self,
        io: IoHandle,
        device: DeviceType,
        force: bool,
        patch: Option<PatchHandle>,
    ) -> Result<()> {
        let desc = self
            .state
            .inputs
            .get(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown input {}", io)))?;
        if device == desc.device && !force && desc.patch.is_some() && patch.is_none() {
            return Ok(());
        }
        let source_device = self
            .state
            .available_inputs
            .find(device, &desc.address)
            .or_else(|| self.state.available_inputs.first_of_type(device))
            .ok_or_else(|| PolicyError::invalid_operation(format!("{} is not available", device)))?;
        let source = PortConfig::device(
            source_device.port_id,
            PortRole::Source,
            source_device.device_type,
            source_device.address.clone(),
        );
        let mut sink = PortConfig::mix(desc.port_id, PortRole::Sink, io);
        sink.config = Some(desc.config);

        let existing = patch
            .filter(|h| self.state.patches.contains(*h))
            .or(desc.patch.filter(|h| self.state.patches.contains(*h)))
            .and_then(|h| self.state.patches.get(h))
            .map(|p| (p.handle, p.uid, p.hal_handle));
        let (handle, uid, hal_existing) = match existing {
            Some(found) => found,
            None => (self.next_patch(), Uid::SYSTEM, None),
        };
        let mut new_patch = AudioPatch::new(handle, uid, vec![source], vec![sink]);
        let hal_handle = self.hal.create_audio_patch(&new_patch, hal_existing, 0)?;
        new_patch.hal_handle = Some(hal_handle);
        self.state.patches.add(new_patch);
        if let Some(desc) = self.state.inputs.get_mut(io) {
            desc.device = device;
            desc.patch = Some(handle);
        }
        self.state.next_port_generation();
        debug!(input = %io, %device, patch = %handle, "Input patched");
        Ok(())
    }

    pub(crate) fn reset_input_device(&mut self, io: IoHandle) {
        let Some(handle) = self.state.inputs.get_mut(io).and_then(|d| d.patch.take()) else {
            return;
        };
        if let Some(hal_handle) = self.state.patches.remove(handle).and_then(|p| p.hal_handle) {
            Self::hal_warn(self.hal.release_audio_patch(hal_handle, 0), "patch release");
        }
        self.state.next_port_generation();
        debug!(input = %io, patch = %handle, "Input patch released");
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;

    fn capture(source: AudioSource, session: u32) -> InputAttributes {
        InputAttributes::new(source, SessionId(session))
    }

    #[test]
    fn test_attached_inputs_probed_at_boot() {
        let (manager, _) = manager();
        assert!(manager.state().available_inputs.has_type(DeviceType::BuiltinMic));
        assert!(manager.state().available_inputs.has_type(DeviceType::TelephonyRx));
        // probe inputs do not stay open
        assert!(manager.hal().open_inputs.is_empty());
        assert!(manager.state().inputs.is_empty());
    }

    #[test]
    fn test_get_input_opens_and_release_closes() {
        let (mut manager, _) = manager();
        let io = manager.get_input_for_attr(&capture(AudioSource::Default, 1)).unwrap();
        let desc = manager.state().inputs.get(io).unwrap();
        assert_eq!(desc.device, DeviceType::BuiltinMic);
        assert_eq!(desc.sessions[&SessionId(1)].source, AudioSource::Mic);

        // same session asks again
        assert_eq!(manager.get_input_for_attr(&capture(AudioSource::Mic, 1)).unwrap(), io);
        let conflict = manager.get_input_for_attr(&capture(AudioSource::Camcorder, 1));
        assert!(conflict.is_err());

        manager.release_input(io, SessionId(1)).unwrap();
        assert!(manager.state().inputs.get(io).is_some());
        manager.release_input(io, SessionId(1)).unwrap();
        assert!(manager.state().inputs.get(io).is_none());
        assert!(manager.hal().open_inputs.is_empty());
    }

    #[test]
    fn test_start_input_patches_device() {
        let (mut manager, _) = manager();
        let io = manager.get_input_for_attr(&capture(AudioSource::Mic, 1)).unwrap();
        manager.start_input(io, SessionId(1)).unwrap();
        assert!(manager.is_source_active(AudioSource::Mic));
        let patch = manager.state().inputs.get(io).unwrap().patch.unwrap();
        let patch = manager.state().patches.get(patch).unwrap();
        assert_eq!(patch.source_devices(), crate::domain::audio::DeviceTypeSet::single(DeviceType::BuiltinMic));

        manager.stop_input(io, SessionId(1)).unwrap();
        assert!(manager.state().inputs.get(io).unwrap().patch.is_none());
        let twice = manager.stop_input(io, SessionId(1));
        assert!(matches!(twice, Err(PolicyError::InvalidOperation(_))));
    }

    #[test]
    fn test_concurrent_capture_rejected() {
        let (mut manager, _) = manager();
        let mic = manager.get_input_for_attr(&capture(AudioSource::Mic, 1)).unwrap();
        manager.start_input(mic, SessionId(1)).unwrap();
        let cam = manager.get_input_for_attr(&capture(AudioSource::Camcorder, 2)).unwrap();
        assert_ne!(mic, cam);
        let err = manager.start_input(cam, SessionId(2)).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOperation(_)));
        assert!(manager.state().inputs.get(mic).unwrap().is_active());
    }

    #[test]
    fn test_hotword_is_preempted_once() {
        let (mut manager, _) = manager();
        let hotword = manager.get_input_for_attr(&capture(AudioSource::Hotword, 1)).unwrap();
        manager.start_input(hotword, SessionId(1)).unwrap();

        let mic = manager.get_input_for_attr(&capture(AudioSource::VoiceRecognition, 2)).unwrap();
        manager.start_input(mic, SessionId(2)).unwrap();
        // the hotword input was stopped and released
        assert!(manager.state().inputs.get(hotword).is_none());
        assert_eq!(manager.state().inputs.get(mic).unwrap().preempted_sessions, vec![SessionId(1)]);
        assert!(manager.is_source_active(AudioSource::VoiceRecognition));
    }

    #[test]
    fn test_submix_capture_connects_submix_output() {
        let (mut manager, _) = manager();
        let io = manager.get_input_for_attr(&capture(AudioSource::RemoteSubmix, 1)).unwrap();
        manager.start_input(io, SessionId(1)).unwrap();
        assert_eq!(
            manager.device_connection_state(DeviceType::RemoteSubmix, "0"),
            ConnectionState::Available
        );
        // media follows the submix
        assert!(manager.devices_for_stream(crate::domain::audio::StreamType::Music).contains(DeviceType::RemoteSubmix));

        manager.stop_input(io, SessionId(1)).unwrap();
        assert_eq!(
            manager.device_connection_state(DeviceType::RemoteSubmix, "0"),
            ConnectionState::Unavailable
        );
    }

    #[test]
    fn test_headset_mic_connection_reroutes_capture() {
        let (mut manager, _) = manager();
        let io = manager.get_input_for_attr(&capture(AudioSource::Mic, 1)).unwrap();
        manager.start_input(io, SessionId(1)).unwrap();
        manager
            .set_device_connection_state(DeviceType::WiredHeadsetMic, ConnectionState::Available, "", "")
            .unwrap();
        assert_eq!(manager.state().inputs.get(io).unwrap().device, DeviceType::WiredHeadsetMic);

        manager
            .set_device_connection_state(DeviceType::WiredHeadsetMic, ConnectionState::Unavailable, "", "")
            .unwrap();
        // the input on the lost device is closed
        assert!(manager.state().inputs.get(io).is_none());
    }
}
