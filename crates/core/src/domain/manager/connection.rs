//! Device connection, phone state and forced usages

use super::{PolicyManager, MUTE_TIME_MS};
use crate::domain::audio::{
    AudioSource, ConnectionState, DeviceType, DeviceTypeSet, Direction, ForceUse, ForcedConfig,
    HalPatchHandle, IoHandle, OutputFlags, PatchHandle, PhoneState, PolicyError, Result, SessionId,
    StreamType, Uid,
};
use crate::domain::descriptor::OutputDescriptor;
use crate::domain::device::Device;
use crate::domain::hal::{
    HalClient, ParameterString, ReportedCaps, KEY_ADDRESS, KEY_DEVICE_CONNECT,
    KEY_DEVICE_DISCONNECT, KEY_SUP_CHANNELS, KEY_SUP_FORMATS, KEY_SUP_SAMPLING_RATES,
};
use crate::domain::module::{DynamicCaps, ProfileId};
use crate::domain::patch::{AudioPatch, PortConfig, PortRole};
use crate::domain::schedule::Settle;
use crate::domain::strategy::{Strategy, REMOTE_SUBMIX_MEDIA_ADDRESS};
use crate::domain::volume::{device_for_volume, SONIFICATION_HEADSET_MUSIC_DELAY_MS};
use tracing::{debug, info, warn};

/// Strategies in the order their outputs are re-checked after a state change
const STRATEGY_CHECK_ORDER: [Strategy; 8] = [
    Strategy::Phone,
    Strategy::EnforcedAudible,
    Strategy::Sonification,
    Strategy::SonificationRespectful,
    Strategy::Accessibility,
    Strategy::Media,
    Strategy::Dtmf,
    Strategy::Rerouting,
];

impl<H: HalClient> PolicyManager<H> {
    // ========================================================================
    // Device connection
    // ========================================================================

    /// A device became available or went away
    pub fn set_device_connection_state(
        &mut self,
        device: DeviceType,
        state: ConnectionState,
        address: &str,
        name: &str,
    ) -> Result<Settle> {
        info!(%device, ?state, address, name, "Device connection state change");
        let settle = if device.is_output() {
            self.set_output_device_connection(device, state, address, name)?
        } else if device.is_input() {
            self.set_input_device_connection(device, state, address, name)?
        } else {
            return Err(PolicyError::bad_value(format!("{} is not a device", device)));
        };
        self.state.next_port_generation();
        Ok(settle)
    }

    /// Descriptor for a device being connected: the declared one when the
    /// topology knows it, a fresh port otherwise
    pub(crate) fn connecting_device(&mut self, device: DeviceType, address: &str, name: &str) -> Result<Device> {
        let module = self
            .state
            .modules
            .module_for_device(device)
            .ok_or_else(|| PolicyError::invalid_operation(format!("no module reaches {}", device)))?;
        let (handle, declared) = {
            let m = self
                .state
                .modules
                .get(module)
                .ok_or_else(|| PolicyError::invalid_operation("unknown module"))?;
            let handle = m
                .handle
                .ok_or_else(|| PolicyError::invalid_operation(format!("module '{}' not loaded", m.name)))?;
            (handle, m.declared_device(device, address).cloned())
        };
        let mut desc = match declared {
            Some(declared) => declared,
            None => Device::new(self.next_port(), device, address),
        };
        if device.distinguishes_on_address() {
            desc.address = address.to_string();
        }
        if !name.is_empty() {
            desc.name = name.to_string();
        }
        desc.attach(handle);
        Ok(desc)
    }

    fn set_output_device_connection(
        &mut self,
        device: DeviceType,
        state: ConnectionState,
        address: &str,
        name: &str,
    ) -> Result<Settle> {
        self.snapshot_outputs();
        let known = self.state.available_outputs.contains(device, address);
        let touched = match state {
            ConnectionState::Available => {
                if known {
                    warn!(%device, address, "Output device already connected");
                    return Err(PolicyError::invalid_operation(format!("{} already connected", device)));
                }
                let desc = self.connecting_device(device, address, name)?;
                let address = desc.address.clone();
                self.state.available_outputs.add(desc);
                self.state.touch();
                let opened = match self.check_outputs_for_device(device, &address) {
                    Ok(opened) => opened,
                    Err(e) => {
                        self.state.available_outputs.remove(device, &address);
                        self.state.touch();
                        return Err(e);
                    }
                };
                let mut params = ParameterString::new();
                params.add(KEY_DEVICE_CONNECT, device.to_string()).add(KEY_ADDRESS, address.as_str());
                Self::hal_warn(self.hal.set_parameters(None, &params.to_string(), 0), "device connect");
                opened
            }
            ConnectionState::Unavailable => {
                if !known {
                    warn!(%device, address, "Output device not connected");
                    return Err(PolicyError::invalid_operation(format!("{} not connected", device)));
                }
                let mut params = ParameterString::new();
                params.add(KEY_DEVICE_DISCONNECT, device.to_string()).add(KEY_ADDRESS, address);
                Self::hal_warn(self.hal.set_parameters(None, &params.to_string(), 0), "device disconnect");
                self.state.available_outputs.remove(device, address);
                self.state.touch();
                self.release_patches_for_device(device);
                self.outputs_lost_with_device(device, address)
            }
        };

        self.check_a2dp_suspend();
        self.check_output_for_all_strategies();
        for io in touched {
            let closable = self.state.outputs.get(io).is_some_and(|d| {
                state == ConnectionState::Unavailable || (d.is_direct() && d.direct_open_count == 0)
            });
            if closable {
                self.close_output(io);
            }
        }
        self.check_a2dp_suspend();
        self.update_devices_and_outputs();

        let mut settle = Settle::NONE;
        let in_call = self.state.phone_state == PhoneState::InCall;
        if in_call {
            if let Some(primary) = self.state.primary_output {
                let rx = self.new_output_device(primary, false);
                settle = settle.join(self.update_call_routing(&rx, 0));
            }
        }
        for io in self.state.outputs.handles() {
            if in_call && Some(io) == self.state.primary_output {
                continue;
            }
            let duplicated = self.state.outputs.get(io).is_some_and(OutputDescriptor::is_duplicated);
            let force = !duplicated && (!device.distinguishes_on_address() || state == ConnectionState::Unavailable);
            let devices = self.new_output_device(io, true);
            settle = settle.join(self.set_output_device(io, &devices, force, 0, None));
        }
        Ok(settle)
    }

    /// Open outputs through every profile reaching a newly connected device.
    /// Returns the outputs able to reach it, including ones opened only to
    /// probe dynamic capabilities.
    fn check_outputs_for_device(&mut self, device: DeviceType, address: &str) -> Result<Vec<IoHandle>> {
        let distinguishes = device.distinguishes_on_address();
        let mut outputs: Vec<IoHandle> = self
            .state
            .outputs
            .iter()
            .filter(|d| !d.is_duplicated() && self.state.outputs.supported_devices(d.io).contains(device))
            .filter(|d| !distinguishes || d.address == address)
            .map(|d| d.io)
            .collect();

        let profiles: Vec<ProfileId> = self
            .state
            .modules
            .profiles(Direction::Output)
            .into_iter()
            .filter(|(id, p)| {
                p.supports_device(device) && self.state.modules.get(id.module).is_some_and(|m| m.handle.is_some())
            })
            .map(|(id, _)| id)
            .collect();
        if profiles.is_empty() && outputs.is_empty() {
            warn!(%device, "No output profile reaches device");
            return Err(PolicyError::invalid_operation(format!("no output available for {}", device)));
        }

        let mut usable = 0;
        for profile in profiles {
            let already_open = outputs
                .iter()
                .any(|io| self.state.outputs.get(*io).is_some_and(|d| d.profile == Some(profile)));
            if already_open {
                usable += 1;
                continue;
            }
            match self.open_output_for_device(profile, device, address) {
                Some(io) => {
                    usable += 1;
                    outputs.push(io);
                    if distinguishes {
                        let _ = self.set_output_device(io, &DeviceTypeSet::single(device), true, 0, None);
                    }
                    debug!(%device, output = %io, "Output added for device");
                }
                None => warn!(%device, ?profile, "Could not open output for device"),
            }
        }
        if usable == 0 {
            warn!(%device, "No output could be opened for device");
            return Err(PolicyError::invalid_operation(format!("no output available for {}", device)));
        }
        Ok(outputs)
    }

    /// Open one output for a connecting device, resolving dynamic
    /// capabilities and pairing mixed outputs with the primary output
    fn open_output_for_device(&mut self, profile: ProfileId, device: DeviceType, address: &str) -> Option<IoHandle> {
        let devices = DeviceTypeSet::single(device);
        let mut io = match self.open_output_for_profile(profile, &devices, address, None, None) {
            Ok(io) => io,
            Err(e) => {
                warn!(%device, error = %e, "Output open failed");
                return None;
            }
        };
        if !address.is_empty() {
            let mut params = ParameterString::new();
            params.add(KEY_ADDRESS, address);
            Self::hal_warn(self.hal.set_parameters(Some(io), &params.to_string(), 0), "output address");
        }

        let dynamic = self.state.modules.profile(profile).map(|p| p.dynamic).unwrap_or_default();
        if dynamic.any() {
            self.import_dynamic_caps(profile, Some(io), dynamic);
        }
        let (valid, picked) = match self.state.modules.profile(profile) {
            Some(p) => (p.has_valid_caps(), p.pick_config()),
            None => (false, Default::default()),
        };
        if !valid {
            warn!(output = %io, %device, "Output profile misses capabilities");
            self.discard_output(io);
            return None;
        }
        if dynamic.any() {
            self.discard_output(io);
            io = match self.open_output_for_profile(profile, &devices, address, Some(picked), None) {
                Ok(io) => io,
                Err(e) => {
                    warn!(%device, error = %e, "Output reopen failed");
                    return None;
                }
            };
        }

        let flags = self.state.outputs.get(io).map(|d| d.flags).unwrap_or(OutputFlags::NONE);
        let policy_mix = device.distinguishes_on_address() && address != REMOTE_SUBMIX_MEDIA_ADDRESS;
        if flags.direct || policy_mix {
            return Some(io);
        }
        let Some(primary) = self.state.primary_output else {
            return Some(io);
        };
        self.apply_stream_volumes(io, &devices, 0, true);
        let dup = self.next_io();
        match self.hal.open_duplicate_output(dup, primary, io) {
            Ok(()) => {
                let port = self.next_port();
                self.state.outputs.add(OutputDescriptor::new_duplicated(dup, port, primary, io));
                self.apply_stream_volumes(dup, &devices, 0, true);
                debug!(output = %dup, first = %primary, second = %io, "Duplicated output opened");
                Some(io)
            }
            Err(e) => {
                warn!(output = %io, error = %e, "Could not open duplicated output");
                self.discard_output(io);
                None
            }
        }
    }

    /// Close an output opened as part of a failed sequence
    fn discard_output(&mut self, io: IoHandle) {
        Self::hal_warn(self.hal.close_output(io), "output close");
        self.state.outputs.remove(io);
        self.state.next_port_generation();
    }

    /// Ask the hardware for the capability lists a profile left empty
    pub(crate) fn import_dynamic_caps(&mut self, profile: ProfileId, io: Option<IoHandle>, dynamic: DynamicCaps) {
        let mut keys = Vec::new();
        if dynamic.sample_rates {
            keys.push(KEY_SUP_SAMPLING_RATES);
        }
        if dynamic.formats {
            keys.push(KEY_SUP_FORMATS);
        }
        if dynamic.channel_masks {
            keys.push(KEY_SUP_CHANNELS);
        }
        let Some(reply) = Self::hal_warn(self.hal.get_parameters(io, &keys.join(";")), "capability query") else {
            return;
        };
        let caps = ReportedCaps::from_reply(&reply);
        debug!(?profile, rates = ?caps.sample_rates, formats = ?caps.formats, channels = ?caps.channel_masks, "Dynamic capabilities");
        if let Some(p) = self.state.modules.profile_mut(profile) {
            p.import_dynamic(caps.sample_rates, caps.formats, caps.channel_masks);
        }
    }

    /// Outputs with no reason to stay open once a device left; also drops
    /// capabilities learnt from it
    fn outputs_lost_with_device(&mut self, device: DeviceType, address: &str) -> Vec<IoHandle> {
        let available = self.state.available_outputs.types();
        let lost: Vec<IoHandle> = self
            .state
            .outputs
            .iter()
            .filter(|d| !d.is_duplicated())
            .filter(|d| {
                let supported = self.state.outputs.supported_devices(d.io);
                (device.distinguishes_on_address() && supported.contains(device) && d.address == address)
                    || !supported.intersects(&available)
            })
            .map(|d| d.io)
            .collect();

        let profiles: Vec<ProfileId> = self
            .state
            .modules
            .profiles(Direction::Output)
            .into_iter()
            .filter(|(_, p)| p.supports_device(device))
            .map(|(id, _)| id)
            .collect();
        for id in profiles {
            if let Some(p) = self.state.modules.profile_mut(id) {
                p.clear_dynamic();
            }
        }
        lost
    }

    /// Patches still pointing at a device that went away: stream patches
    /// fall back to the policy, device to device patches are released
    pub(crate) fn release_patches_for_device(&mut self, device: DeviceType) {
        for handle in self.state.patches.referencing_device(device) {
            let owned_by_stream = self.state.outputs.iter().any(|d| d.patch == Some(handle))
                || self.state.inputs.iter().any(|d| d.patch == Some(handle));
            if owned_by_stream {
                if let Some(patch) = self.state.patches.get_mut(handle) {
                    patch.uid = Uid::SYSTEM;
                }
                continue;
            }
            if let Some(hal_handle) = self.state.patches.remove(handle).and_then(|p| p.hal_handle) {
                Self::hal_warn(self.hal.release_audio_patch(hal_handle, 0), "patch release");
            }
            debug!(patch = %handle, %device, "Patch released with its device");
        }
    }

    // ========================================================================
    // Strategy outputs
    // ========================================================================

    /// Move a strategy's tracks when its device now lives on other outputs
    pub(crate) fn check_output_for_strategy(&mut self, strategy: Strategy) {
        let old_devices = self.state.cache.committed(strategy).clone();
        let new_devices = self.device_for_strategy(strategy, false);
        let src = self.previous_outputs_for(&old_devices);
        let dst = self.state.outputs.outputs_for_devices(&new_devices);
        if src == dst {
            return;
        }
        debug!(%strategy, from = ?src, to = ?dst, "Strategy changes outputs");

        let now = self.now_ms();
        let unmute_device = device_for_volume(&new_devices);
        for io in &src {
            let active = self
                .state
                .outputs
                .get(*io)
                .is_some_and(|d| d.is_strategy_active(strategy, 0, now));
            if active {
                self.set_strategy_mute(strategy, true, *io, 0, None);
                self.set_strategy_mute(strategy, false, *io, MUTE_TIME_MS, unmute_device);
            }
        }
        if strategy == Strategy::Media {
            if let (Some(from), Some(to)) = (src.first().copied(), self.select_output_for_effects()) {
                if from != to && self.state.outputs.contains(from) {
                    Self::hal_warn(self.hal.move_effects(SessionId::OUTPUT_MIX, from, to), "effects move");
                }
            }
        }
        for stream in strategy.streams() {
            Self::hal_warn(self.hal.invalidate_stream(stream), "stream invalidation");
        }
    }

    pub(crate) fn check_output_for_all_strategies(&mut self) {
        if self.state.force_use(ForceUse::System) == ForcedConfig::SystemEnforced {
            self.check_output_for_strategy(Strategy::EnforcedAudible);
        }
        for strategy in STRATEGY_CHECK_ORDER {
            if strategy == Strategy::EnforcedAudible
                && self.state.force_use(ForceUse::System) == ForcedConfig::SystemEnforced
            {
                continue;
            }
            self.check_output_for_strategy(strategy);
        }
    }

    /// Suspend A2DP while SCO carries communication or a call rings or runs
    pub(crate) fn check_a2dp_suspend(&mut self) {
        let Some(a2dp) = self.state.outputs.a2dp_output() else {
            self.state.a2dp_suspended = false;
            return;
        };
        let sco_connected = self.state.available_inputs.has_type(DeviceType::BluetoothScoHeadsetMic)
            || self.state.available_outputs.types().find(DeviceType::is_sco).is_some();
        let sco_forced = self.state.force_use(ForceUse::Communication) == ForcedConfig::BtSco
            || self.state.force_use(ForceUse::Record) == ForcedConfig::BtSco;
        let call = matches!(self.state.phone_state, PhoneState::InCall | PhoneState::Ringtone);
        let suspend = (sco_connected && sco_forced) || call;

        if suspend && !self.state.a2dp_suspended {
            Self::hal_warn(self.hal.suspend_output(a2dp), "A2DP suspend");
            self.state.a2dp_suspended = true;
            info!(output = %a2dp, "A2DP suspended");
        } else if !suspend && self.state.a2dp_suspended {
            Self::hal_warn(self.hal.restore_output(a2dp), "A2DP restore");
            self.state.a2dp_suspended = false;
            info!(output = %a2dp, "A2DP restored");
        }
    }

    // ========================================================================
    // Phone state
    // ========================================================================

    pub fn set_phone_state(&mut self, state: PhoneState) -> Result<Settle> {
        let old = self.state.phone_state;
        if old == state {
            debug!(?state, "Phone state unchanged");
            return Ok(Settle::NONE);
        }
        info!(from = ?old, to = ?state, "Phone state change");
        self.state.phone_state = state;
        self.state.touch();

        if old.is_in_call() {
            for stream in StreamType::ALL {
                self.handle_incall_sonification(stream, false, true);
            }
            Self::hal_warn(self.hal.invalidate_stream(StreamType::Accessibility), "stream invalidation");
        }
        let force = old.is_in_call() != state.is_in_call() || state.is_in_call();

        self.check_a2dp_suspend();
        self.check_output_for_all_strategies();
        self.update_devices_and_outputs();

        let mut delay_ms = 0;
        if state.is_in_call() {
            let now = self.now_ms();
            let media = device_for_volume(&self.device_for_strategy(Strategy::Media, true));
            let sonification =
                device_for_volume(&self.device_for_strategy(Strategy::Sonification, true));
            for io in self.state.outputs.handles() {
                let busy = self.state.outputs.get(io).is_some_and(|d| {
                    d.is_strategy_active(Strategy::Media, SONIFICATION_HEADSET_MUSIC_DELAY_MS, now)
                        || d.is_strategy_active(Strategy::Sonification, SONIFICATION_HEADSET_MUSIC_DELAY_MS, now)
                });
                if busy {
                    delay_ms = delay_ms.max(self.state.outputs.latency(io) * 2);
                }
                self.set_strategy_mute(Strategy::Media, true, io, 0, None);
                self.set_strategy_mute(Strategy::Media, false, io, MUTE_TIME_MS, media);
                self.set_strategy_mute(Strategy::Sonification, true, io, 0, None);
                self.set_strategy_mute(Strategy::Sonification, false, io, MUTE_TIME_MS, sonification);
            }
        }

        let mut settle = Settle::NONE;
        if let Some(primary) = self.state.primary_output {
            let mut rx = self.new_output_device(primary, false);
            if old.is_in_call() && rx.is_empty() {
                rx = self.state.outputs.devices(primary);
            }
            if state == PhoneState::InCall {
                settle = self.update_call_routing(&rx, delay_ms);
            } else {
                if old == PhoneState::InCall {
                    self.release_call_patches();
                }
                settle = self.set_output_device(primary, &rx, force, 0, None);
            }
        }

        if state.is_in_call() {
            for stream in StreamType::ALL {
                self.handle_incall_sonification(stream, true, true);
            }
            Self::hal_warn(self.hal.invalidate_stream(StreamType::Accessibility), "stream invalidation");
        }
        self.state.limit_ringtone_volume = state == PhoneState::Ringtone
            && self
                .state
                .outputs
                .is_stream_active(StreamType::Music, SONIFICATION_HEADSET_MUSIC_DELAY_MS, self.now_ms());
        Ok(settle.join(Settle::after(delay_ms)))
    }

    /// Voice call paths: through the primary output when it reaches the rx
    /// device, otherwise with explicit telephony patches
    pub(crate) fn update_call_routing(&mut self, rx: &DeviceTypeSet, delay_ms: u32) -> Settle {
        let Some(primary) = self.state.primary_output else {
            return Settle::NONE;
        };
        let tx = self.device_for_input_source(AudioSource::VoiceCommunication);
        debug!(%rx, tx = ?tx, "Updating call routing");
        self.release_call_patches();

        let primary_outputs = self
            .state
            .outputs
            .supported_devices(primary)
            .intersection(&self.state.available_outputs.types());
        let mut settle = Settle::NONE;
        let create_tx = if rx.intersects(&primary_outputs) {
            settle = self.set_output_device(primary, rx, true, delay_ms, None);
            let primary_module = self
                .state
                .outputs
                .get(primary)
                .and_then(|d| d.module)
                .and_then(|m| self.state.modules.get(m))
                .and_then(|m| m.handle);
            !tx.is_some_and(|t| {
                self.state
                    .available_inputs
                    .first_of_type(t)
                    .is_some_and(|d| d.module.is_some() && d.module == primary_module)
            })
        } else {
            let source = self.state.available_inputs.first_of_type(DeviceType::TelephonyRx).cloned();
            let sink = rx.first().and_then(|t| self.state.available_outputs.first_of_type(t)).cloned();
            match (source, sink) {
                (Some(source), Some(sink)) => {
                    self.state.call_rx_patch = self.create_call_patch(&source, &sink, delay_ms);
                }
                _ => warn!(%rx, "Cannot build call downlink patch"),
            }
            true
        };

        if create_tx {
            let source = tx.and_then(|t| self.state.available_inputs.first_of_type(t)).cloned();
            let sink = self.state.available_outputs.first_of_type(DeviceType::TelephonyTx).cloned();
            match (source, sink) {
                (Some(source), Some(sink)) => {
                    self.state.call_tx_patch = self.create_call_patch(&source, &sink, delay_ms);
                }
                _ => warn!(tx = ?tx, "Cannot build call uplink patch"),
            }
        }
        settle
    }

    fn create_call_patch(&mut self, source: &Device, sink: &Device, delay_ms: u32) -> Option<AudioPatch> {
        let handle = self.next_patch();
        match self.build_device_patch(handle, Uid::SYSTEM, source, std::slice::from_ref(sink), None, delay_ms) {
            Ok(patch) => {
                debug!(patch = %handle, from = %source.device_type, to = %sink.device_type, "Call patch created");
                Some(patch)
            }
            Err(e) => {
                warn!(error = %e, from = %source.device_type, to = %sink.device_type, "Call patch failed");
                None
            }
        }
    }

    /// Device to device patch, bridged through an open output reaching the
    /// first sink when the hardware cannot connect the devices itself
    pub(crate) fn build_device_patch(
        &mut self,
        handle: PatchHandle,
        uid: Uid,
        source: &Device,
        sinks: &[Device],
        existing: Option<HalPatchHandle>,
        delay_ms: u32,
    ) -> Result<AudioPatch> {
        let Some(first) = sinks.first() else {
            return Err(PolicyError::bad_value("patch without sink"));
        };
        let mut sources = vec![PortConfig::device(
            source.port_id,
            PortRole::Source,
            source.device_type,
            source.address.clone(),
        )];
        if self.needs_bridge(source, first) {
            let candidates = self.state.outputs.outputs_for_devices(&DeviceTypeSet::single(first.device_type));
            if let Some(io) = self.select_output(&candidates, &OutputFlags::NONE, None) {
                if let Some(desc) = self.state.outputs.get(io) {
                    sources.push(PortConfig::mix(desc.port_id, PortRole::Source, io));
                }
            }
        }
        let sinks = sinks
            .iter()
            .map(|d| PortConfig::device(d.port_id, PortRole::Sink, d.device_type, d.address.clone()))
            .collect();
        let mut patch = AudioPatch::new(handle, uid, sources, sinks);
        patch.hal_handle = Some(self.hal.create_audio_patch(&patch, existing, delay_ms)?);
        Ok(patch)
    }

    /// Devices on different modules, or a module unable to patch devices
    /// directly, need a software bridge
    pub(crate) fn needs_bridge(&self, source: &Device, sink: &Device) -> bool {
        if source.module != sink.module {
            return true;
        }
        let native = source.module.is_some_and(|handle| {
            self.hal.supports_device_patches(handle)
                && self
                    .state
                    .modules
                    .index_of_handle(handle)
                    .and_then(|i| self.state.modules.get(i))
                    .is_some_and(|m| m.supports_device_patches())
        });
        !native
    }

    fn release_call_patches(&mut self) {
        for patch in [self.state.call_rx_patch.take(), self.state.call_tx_patch.take()]
            .into_iter()
            .flatten()
        {
            if let Some(hal_handle) = patch.hal_handle {
                Self::hal_warn(self.hal.release_audio_patch(hal_handle, 0), "call patch release");
            }
            debug!(patch = %patch.handle, "Call patch released");
        }
    }

    // ========================================================================
    // Forced usages
    // ========================================================================

    pub fn set_force_use(&mut self, usage: ForceUse, config: ForcedConfig) -> Result<Settle> {
        if !config.is_valid_for(usage) {
            return Err(PolicyError::bad_value(format!("{:?} cannot be forced to {:?}", usage, config)));
        }
        info!(?usage, ?config, "Forced use change");
        self.state.forced[usage.index()] = config;
        self.state.touch();
        let reevaluate_volume = matches!(usage, ForceUse::Communication | ForceUse::Dock | ForceUse::System);

        self.check_a2dp_suspend();
        self.check_output_for_all_strategies();
        self.update_devices_and_outputs();

        let in_call = self.state.phone_state == PhoneState::InCall;
        let mut settle = Settle::NONE;
        if in_call {
            if let Some(primary) = self.state.primary_output {
                let rx = self.new_output_device(primary, true);
                settle = settle.join(self.update_call_routing(&rx, 0));
            }
        }
        for io in self.state.outputs.handles() {
            let devices = self.new_output_device(io, true);
            if !in_call || Some(io) != self.state.primary_output {
                settle = settle.join(self.set_output_device(io, &devices, !devices.is_empty(), 0, None));
            }
            if reevaluate_volume && !devices.is_empty() {
                self.apply_stream_volumes(io, &devices, 0, true);
            }
        }

        for io in self.state.inputs.active_inputs(true) {
            let Some(device) = self.new_input_device(io) else {
                continue;
            };
            let reachable = self
                .state
                .inputs
                .get(io)
                .and_then(|d| self.state.modules.profile(d.profile))
                .is_some_and(|p| p.supports_device(device));
            if reachable {
                if let Err(e) = self.set_input_device(io, device, false, None) {
                    warn!(input = %io, error = %e, "Input routing failed");
                }
            } else {
                self.close_input(io);
            }
        }
        Ok(settle)
    }
}
