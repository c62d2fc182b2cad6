//! Output routing and playback lifecycle

use super::{PolicyManager, MAX_MIXER_SAMPLING_RATE};
use crate::domain::audio::{
    AudioFormat, DeviceTypeSet, Direction, IoHandle, OutputFlags, PatchHandle, PolicyError,
    Result, SessionId, StreamConfig, StreamType, Uid,
};
use crate::domain::command::OutputAttributes;
use crate::domain::descriptor::{OutputDescriptor, OutputKind};
use crate::domain::hal::{HalClient, OutputRequest, ParameterString, KEY_CLOSING, KEY_ROUTING};
use crate::domain::module::ProfileId;
use crate::domain::patch::{AudioPatch, PortConfig, PortRole, MAX_PATCH_PORTS};
use crate::domain::schedule::{MuteAction, MuteSchedule, ScheduledAction, Settle};
use crate::domain::strategy::Strategy;
use tracing::{debug, info, warn};

/// Beacon (TTS) bookkeeping events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeaconEvent {
    StartingOutput,
    StoppingOutput,
    StartingBeacon,
    StoppingBeacon,
}

impl<H: HalClient> PolicyManager<H> {
    // ========================================================================
    // Opening and closing
    // ========================================================================

    /// Open an output through a profile and register its descriptor
    pub(crate) fn open_output_for_profile(
        &mut self,
        profile: ProfileId,
        devices: &DeviceTypeSet,
        address: &str,
        config: Option<StreamConfig>,
        flags: Option<OutputFlags>,
    ) -> Result<IoHandle> {
        let (module_handle, request, supported) = {
            let module = self
                .state
                .modules
                .get(profile.module)
                .ok_or_else(|| PolicyError::bad_value("unknown module"))?;
            let handle = module
                .handle
                .ok_or_else(|| PolicyError::invalid_operation(format!("module '{}' not loaded", module.name)))?;
            let prof = self
                .state
                .modules
                .profile(profile)
                .ok_or_else(|| PolicyError::bad_value("unknown profile"))?;
            let request = OutputRequest {
                devices: devices.clone(),
                address: address.to_string(),
                config: config.unwrap_or_else(|| prof.pick_config()),
                flags: flags.unwrap_or_else(|| prof.output_flags()),
            };
            (handle, request, prof.supported_devices.clone())
        };

        let io = self.next_io();
        let opened = self.hal.open_output(module_handle, io, &request)?;
        let port = self.next_port();
        let mut desc = OutputDescriptor::new_simple(io, port, profile.module, profile, request.flags, supported);
        desc.config = opened.config;
        desc.latency_ms = opened.latency_ms;
        desc.address = request.address;
        desc.devices = devices.clone();
        self.state.outputs.add(desc);
        self.state.next_port_generation();
        debug!(output = %io, profile = ?profile, %devices, latency = opened.latency_ms, "Output opened");
        Ok(io)
    }

    /// Open every mixed output of a module able to reach an attached device
    pub(crate) fn open_attached_outputs(&mut self, module: usize) {
        let Some(m) = self.state.modules.get(module) else {
            return;
        };
        let Some(module_handle) = m.handle else {
            return;
        };
        let attached: Vec<_> = m.attached().filter(|d| d.device_type.is_output()).cloned().collect();
        let default_port = m.default_output_device;
        let profiles: Vec<(usize, DeviceTypeSet, bool)> = m
            .output_profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.supported_devices.clone(), p.is_direct()))
            .collect();

        for (index, supported, direct) in profiles {
            if direct {
                continue;
            }
            let reachable: Vec<_> = attached.iter().filter(|d| supported.contains(d.device_type)).collect();
            let target = reachable
                .iter()
                .find(|d| Some(d.port_id) == default_port)
                .or_else(|| reachable.first());
            let Some(target) = target else {
                continue;
            };
            let id = ProfileId {
                module,
                direction: Direction::Output,
                index,
            };
            let devices = DeviceTypeSet::single(target.device_type);
            let io = match self.open_output_for_profile(id, &devices, &target.address, None, None) {
                Ok(io) => io,
                Err(e) => {
                    warn!(module, profile = index, error = %e, "Cannot open output for attached device");
                    continue;
                }
            };
            for device in &reachable {
                let mut device = (*device).clone();
                device.attach(module_handle);
                self.state.available_outputs.add(device);
            }
            let primary = self.state.outputs.get(io).is_some_and(|d| d.flags.primary);
            if primary && self.state.primary_output.is_none() {
                self.state.primary_output = Some(io);
            }
            let _ = self.set_output_device(io, &devices, true, 0, None);
        }
    }

    /// Close an output, its duplicating outputs and its patch
    pub(crate) fn close_output(&mut self, io: IoHandle) {
        let Some(desc) = self.state.outputs.get(io) else {
            warn!(output = %io, "Closing unknown output");
            return;
        };
        let patch = desc.patch;
        let now = self.now_ms();

        for dup in self.state.outputs.duplicating(io) {
            if let Some(OutputKind::Duplicated(a, b)) = self.state.outputs.get(dup).map(|d| d.kind) {
                let other = if a == io { b } else { a };
                let counts = self.state.outputs.get(dup).map(|d| d.ref_count).unwrap_or_default();
                for stream in StreamType::ALL {
                    let count = counts[stream.index()];
                    if count > 0 {
                        let _ = self.state.outputs.change_ref_count(other, stream, -(count as i32), now);
                    }
                }
            }
            Self::hal_warn(self.hal.close_output(dup), "close of duplicated output");
            self.state.outputs.remove(dup);
            debug!(output = %dup, "Duplicated output closed");
        }

        if let Some(handle) = patch {
            if let Some(hal_handle) = self.state.patches.remove(handle).and_then(|p| p.hal_handle) {
                Self::hal_warn(self.hal.release_audio_patch(hal_handle, 0), "patch release");
            }
        }
        let mut params = ParameterString::new();
        params.add(KEY_CLOSING, "true");
        Self::hal_warn(self.hal.set_parameters(Some(io), &params.to_string(), 0), "closing notification");
        Self::hal_warn(self.hal.close_output(io), "output close");
        self.state.outputs.remove(io);
        if self.state.primary_output == Some(io) {
            self.state.primary_output = None;
        }
        self.state.next_port_generation();
        self.snapshot_outputs();
        info!(output = %io, "Output closed");
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route an output, logging rather than propagating hardware failures
    pub(crate) fn set_output_device(
        &mut self,
        io: IoHandle,
        devices: &DeviceTypeSet,
        force: bool,
        delay_ms: u32,
        patch: Option<PatchHandle>,
    ) -> Settle {
        match self.try_set_output_device(io, devices, force, delay_ms, patch) {
            Ok(settle) => settle,
            Err(e) => {
                warn!(output = %io, %devices, error = %e, "Output routing failed");
                Settle::NONE
            }
        }
    }

    /// Route an output to the supported subset of `devices`
    ///
    /// Strategies whose devices change are muted around the switch, the
    /// output's patch is created or updated in place and stream volumes are
    /// reapplied for the new device. The hardware patch is delayed until the
    /// muted audio drained; the returned [`Settle`] is what is left to wait.
    pub(crate) fn try_set_output_device(
        &mut self,
        io: IoHandle,
        devices: &DeviceTypeSet,
        force: bool,
        delay_ms: u32,
        patch: Option<PatchHandle>,
    ) -> Result<Settle> {
        let desc = self
            .state
            .outputs
            .get(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown output {}", io)))?;
        if let OutputKind::Duplicated(a, b) = desc.kind {
            let first = self.try_set_output_device(a, devices, force, delay_ms, None)?;
            let second = self.try_set_output_device(b, devices, force, delay_ms, None)?;
            return Ok(first.join(second));
        }

        let devices = devices.intersection(&self.state.outputs.supported_devices(io));
        let previous = desc.devices.clone();
        let current_patch = desc.patch;
        if !devices.is_empty() {
            if let Some(desc) = self.state.outputs.get_mut(io) {
                desc.devices = devices.clone();
            }
        }
        let schedule = self.check_device_mute_strategies(io, &previous, delay_ms);

        if (devices.is_empty() || devices == previous) && !force && current_patch.is_some() {
            return Ok(schedule.residual(delay_ms));
        }

        let hw_delay = delay_ms.max(schedule.wait_ms);
        if devices.is_empty() {
            self.reset_output_device(io, hw_delay);
        } else {
            self.create_output_patch(io, &devices, patch, hw_delay)?;
        }
        self.apply_stream_volumes(io, &devices, delay_ms, false);
        Ok(schedule.residual(delay_ms))
    }

    fn create_output_patch(
        &mut self,
        io: IoHandle,
        devices: &DeviceTypeSet,
        patch: Option<PatchHandle>,
        delay_ms: u32,
    ) -> Result<()> {
        let Some(desc) = self.state.outputs.get(io) else {
            return Ok(());
        };
        let mut source = PortConfig::mix(desc.port_id, PortRole::Source, io);
        source.config = Some(desc.config);
        let sinks: Vec<PortConfig> = if desc.address.is_empty() {
            self.state.available_outputs.devices_from_types(devices)
        } else {
            devices
                .iter()
                .filter_map(|t| self.state.available_outputs.find(t, &desc.address))
                .collect()
        }
        .into_iter()
        .take(MAX_PATCH_PORTS)
        .map(|d| PortConfig::device(d.port_id, PortRole::Sink, d.device_type, d.address.clone()))
        .collect();
        if sinks.is_empty() {
            debug!(output = %io, %devices, "No available device to patch to");
            return Ok(());
        }

        let existing = patch
            .filter(|h| self.state.patches.contains(*h))
            .or(desc.patch.filter(|h| self.state.patches.contains(*h)));
        let found = existing
            .and_then(|h| self.state.patches.get(h))
            .map(|p| (p.handle, p.uid, p.hal_handle));
        let (handle, uid, hal_existing) = match found {
            Some(found) => found,
            None => (self.next_patch(), Uid::SYSTEM, None),
        };
        let mut new_patch = AudioPatch::new(handle, uid, vec![source], sinks);
        let hal_handle = self.hal.create_audio_patch(&new_patch, hal_existing, delay_ms)?;
        new_patch.hal_handle = Some(hal_handle);
        self.state.patches.add(new_patch);
        if let Some(desc) = self.state.outputs.get_mut(io) {
            desc.patch = Some(handle);
        }
        self.state.next_port_generation();
        debug!(output = %io, patch = %handle, %devices, delay_ms, "Output patched");

        let mut params = ParameterString::new();
        params.add(KEY_ROUTING, devices.to_string());
        let params = params.to_string();
        let inputs: Vec<IoHandle> = self
            .state
            .inputs
            .iter()
            .filter(|i| !i.is_virtual())
            .map(|i| i.io)
            .collect();
        for input in inputs {
            Self::hal_warn(self.hal.set_parameters(Some(input), &params, delay_ms), "input routing update");
        }
        Ok(())
    }

    /// Drop the patch of an output, leaving it unrouted
    pub(crate) fn reset_output_device(&mut self, io: IoHandle, delay_ms: u32) {
        let Some(handle) = self.state.outputs.get_mut(io).and_then(|d| d.patch.take()) else {
            return;
        };
        if let Some(hal_handle) = self.state.patches.remove(handle).and_then(|p| p.hal_handle) {
            Self::hal_warn(self.hal.release_audio_patch(hal_handle, delay_ms), "patch release");
        }
        self.state.next_port_generation();
        debug!(output = %io, patch = %handle, "Output patch released");
    }

    /// Mute strategies whose device combination on the output is about to
    /// become inconsistent, and briefly mute everything active on it when
    /// its device actually changes
    pub(crate) fn check_device_mute_strategies(
        &mut self,
        io: IoHandle,
        previous: &DeviceTypeSet,
        delay_ms: u32,
    ) -> MuteSchedule {
        let mut schedule = MuteSchedule::new();
        let now = self.now_ms();
        let Some(desc) = self.state.outputs.get(io) else {
            return schedule;
        };
        if desc.is_duplicated() {
            return schedule;
        }
        let devices = desc.devices.clone();
        let supported = self.state.outputs.supported_devices(io);
        let active = desc.is_active(0, now);
        let latency = desc.latency_ms;
        let should_mute = active && devices.len() >= 2;

        for strategy in Strategy::ALL {
            let current = self.device_for_strategy(strategy, false).intersection(&supported);
            let mute = should_mute && current.intersects(&devices) && current != devices;
            let Some(desc) = self.state.outputs.get_mut(io) else {
                break;
            };
            let flag = &mut desc.strategy_muted_by_device[strategy.index()];
            if mute == *flag {
                continue;
            }
            *flag = mute;

            let siblings: Vec<IoHandle> = self
                .state
                .outputs
                .handles()
                .into_iter()
                .filter(|o| self.state.outputs.supported_devices(*o).intersects(&supported))
                .collect();
            for sibling in siblings {
                let delay = if mute { 0 } else { delay_ms };
                self.set_strategy_mute(strategy, mute, sibling, delay, None);
                schedule.push(ScheduledAction {
                    delay_ms: delay,
                    output: sibling,
                    strategy,
                    action: if mute { MuteAction::Mute } else { MuteAction::Unmute },
                });
                let sibling_active = self
                    .state
                    .outputs
                    .get(sibling)
                    .is_some_and(|d| d.is_strategy_active(strategy, 0, now));
                if mute && sibling_active {
                    schedule.wait_at_least(self.state.outputs.latency(sibling) * 2);
                }
            }
        }

        if active && devices != *previous {
            let hold_ms = latency * 4;
            schedule.wait_at_least(latency * 2);
            let device = crate::domain::volume::device_for_volume(&devices);
            for strategy in Strategy::ALL {
                let strategy_active = self
                    .state
                    .outputs
                    .get(io)
                    .is_some_and(|d| d.is_strategy_active(strategy, 0, now));
                if !strategy_active {
                    continue;
                }
                self.set_strategy_mute(strategy, true, io, delay_ms, None);
                self.set_strategy_mute(strategy, false, io, delay_ms + hold_ms, device);
                schedule.push(ScheduledAction {
                    delay_ms,
                    output: io,
                    strategy,
                    action: MuteAction::Mute,
                });
                schedule.push(ScheduledAction {
                    delay_ms: delay_ms + hold_ms,
                    output: io,
                    strategy,
                    action: MuteAction::Unmute,
                });
            }
        }
        if !schedule.is_empty() {
            debug!(output = %io, wait_ms = schedule.wait_ms, actions = schedule.actions.len(), "Mute sequencing");
        }
        schedule
    }

    /// Re-route active outputs of a strategy, or make its clients reconnect
    /// when the strategy's device moved to another output
    pub(crate) fn check_strategy_route(&mut self, strategy: Strategy, skip: Option<IoHandle>) {
        let devices = self.device_for_strategy(strategy, false);
        let reachable = self.state.outputs.outputs_for_devices(&devices);
        let now = self.now_ms();
        for io in self.state.outputs.handles() {
            if Some(io) == skip {
                continue;
            }
            let active = self
                .state
                .outputs
                .get(io)
                .is_some_and(|d| d.is_strategy_active(strategy, 0, now));
            if !active {
                continue;
            }
            if reachable.contains(&io) {
                let device = self.new_output_device(io, false);
                let _ = self.set_output_device(io, &device, false, 0, None);
            } else {
                for stream in strategy.streams() {
                    Self::hal_warn(self.hal.invalidate_stream(stream), "stream invalidation");
                }
            }
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Pick among candidate outputs: most flags in common, then primary,
    /// then the first one
    pub(crate) fn select_output(
        &self,
        candidates: &[IoHandle],
        flags: &OutputFlags,
        format: Option<AudioFormat>,
    ) -> Option<IoHandle> {
        if candidates.len() <= 1 {
            return candidates.first().copied();
        }
        let mut best: Option<(u32, IoHandle)> = None;
        let mut primary = None;
        for io in candidates {
            let Some(desc) = self.state.outputs.get(*io) else {
                continue;
            };
            if desc.is_duplicated() {
                continue;
            }
            if let Some(format) = format {
                if desc.is_direct() {
                    if desc.config.format != format {
                        continue;
                    }
                } else if !format.is_linear_pcm() {
                    continue;
                }
            }
            let common = desc.flags.common_count(flags);
            if common > best.map_or(0, |(c, _)| c) {
                best = Some((common, *io));
            }
            if desc.flags.primary {
                primary = Some(*io);
            }
        }
        best.map(|(_, io)| io).or(primary).or_else(|| candidates.first().copied())
    }

    /// Output global effects should live on: the one carrying media,
    /// preferring offloaded then deep buffer outputs
    pub(crate) fn select_output_for_effects(&self) -> Option<IoHandle> {
        let devices = self.device_for_strategy(Strategy::Media, false);
        let candidates = self.state.outputs.outputs_for_devices(&devices);
        let with = |pred: fn(&OutputFlags) -> bool| {
            candidates
                .iter()
                .copied()
                .find(|io| self.state.outputs.get(*io).is_some_and(|d| pred(&d.flags)))
        };
        with(|f| f.compress_offload)
            .or_else(|| with(|f| f.deep_buffer))
            .or_else(|| candidates.first().copied())
    }

    fn output_device_address(&self, devices: &DeviceTypeSet) -> String {
        devices
            .first()
            .and_then(|t| self.state.available_outputs.first_of_type(t))
            .filter(|d| d.device_type.distinguishes_on_address())
            .map(|d| d.address.clone())
            .unwrap_or_default()
    }

    /// Choose, or open a direct, output for a playback client
    pub fn get_output_for_attr(&mut self, attrs: &OutputAttributes) -> Result<IoHandle> {
        let selected = attrs
            .selected_device
            .and_then(|port| self.state.available_outputs.get(port))
            .map(|d| (d.device_type, d.address.clone()));
        self.state
            .output_routes
            .add(attrs.session, Some(attrs.stream), None, selected);
        self.state.touch();

        let strategy = Strategy::for_stream(attrs.stream);
        let devices = self.device_for_strategy(strategy, false);
        match self.output_for_device(&devices, attrs) {
            Some(io) => {
                debug!(stream = %attrs.stream, session = attrs.session.0, output = %io, %devices, "Output selected");
                Ok(io)
            }
            None => {
                self.state.output_routes.remove(attrs.session);
                Err(PolicyError::invalid_operation(format!(
                    "no output for {} on {}",
                    attrs.stream, devices
                )))
            }
        }
    }

    fn output_for_device(&mut self, devices: &DeviceTypeSet, attrs: &OutputAttributes) -> Option<IoHandle> {
        let mut flags = if attrs.stream == StreamType::Tts {
            OutputFlags::NONE
        } else {
            attrs.flags
        };
        if flags.compress_offload || flags.hw_av_sync {
            flags.direct = true;
        }
        if attrs.stream != StreamType::Music {
            flags.deep_buffer = false;
        }
        let config = attrs.config.unwrap_or_default();
        let mixable = config.format.is_linear_pcm()
            && config.sample_rate <= MAX_MIXER_SAMPLING_RATE
            && config.channel_mask.count() <= 2;

        if flags.direct || !mixable {
            match self.open_direct_output(devices, &config, &flags, attrs) {
                DirectOutcome::Opened(io) => return Some(io),
                DirectOutcome::Failed => return None,
                DirectOutcome::NoProfile | DirectOutcome::Fallback => {}
            }
        }

        if flags.hw_av_sync || !config.format.is_linear_pcm() {
            return None;
        }
        let candidates = if devices.is_empty() {
            self.state.outputs.handles()
        } else {
            self.state.outputs.outputs_for_devices(devices)
        };
        flags.direct = false;
        self.select_output(&candidates, &flags, Some(config.format))
    }

    fn open_direct_output(
        &mut self,
        devices: &DeviceTypeSet,
        config: &StreamConfig,
        flags: &OutputFlags,
        attrs: &OutputAttributes,
    ) -> DirectOutcome {
        let available = self.state.available_outputs.types();
        let profile = self
            .state
            .modules
            .profiles(Direction::Output)
            .into_iter()
            .find(|(id, p)| {
                self.state.modules.get(id.module).is_some_and(|m| m.handle.is_some())
                    && p.is_compatible_output(devices, Some(config), flags)
                    && devices.is_subset(&available)
            })
            .map(|(id, _)| id);
        let Some(profile) = profile else {
            return DirectOutcome::NoProfile;
        };

        let open = self
            .state
            .outputs
            .iter()
            .find(|d| !d.is_duplicated() && d.profile == Some(profile))
            .map(|d| (d.io, d.config == *config, d.direct_session));
        if let Some((io, same_config, session)) = open {
            if same_config {
                if session == Some(attrs.session) {
                    if let Some(desc) = self.state.outputs.get_mut(io) {
                        desc.direct_open_count += 1;
                    }
                    return DirectOutcome::Opened(io);
                }
                debug!(output = %io, "Direct output busy with another session");
                return DirectOutcome::Fallback;
            }
            self.close_output(io);
        }

        let previous_effects = self.select_output_for_effects();
        let address = self.output_device_address(devices);
        let io = match self.open_output_for_profile(profile, devices, &address, Some(*config), Some(*flags)) {
            Ok(io) => io,
            Err(e) => {
                warn!(error = %e, "Direct output open failed");
                return self.direct_fallback(config);
            }
        };
        let accepted = self.state.outputs.get(io).is_some_and(|d| {
            attrs.config.is_none() || d.config == *config
        });
        if !accepted {
            debug!(output = %io, "Direct output opened with another configuration");
            Self::hal_warn(self.hal.close_output(io), "output close");
            self.state.outputs.remove(io);
            return self.direct_fallback(config);
        }
        if let Some(desc) = self.state.outputs.get_mut(io) {
            desc.direct_open_count = 1;
            desc.direct_session = Some(attrs.session);
        }
        if let (Some(from), Some(to)) = (previous_effects, self.select_output_for_effects()) {
            if to == io && from != io {
                Self::hal_warn(self.hal.move_effects(SessionId::OUTPUT_MIX, from, to), "effects move");
            }
        }
        self.snapshot_outputs();
        info!(output = %io, %devices, "Direct output opened");
        DirectOutcome::Opened(io)
    }

    fn direct_fallback(&self, config: &StreamConfig) -> DirectOutcome {
        if config.format.is_linear_pcm() && config.sample_rate <= MAX_MIXER_SAMPLING_RATE {
            DirectOutcome::Fallback
        } else {
            DirectOutcome::Failed
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// A client starts playing a stream on an output
    pub fn start_output(&mut self, io: IoHandle, stream: StreamType, session: SessionId) -> Result<Settle> {
        if !self.state.outputs.contains(io) {
            return Err(PolicyError::bad_value(format!("unknown output {}", io)));
        }
        self.state.output_routes.inc_activity(session);
        let forced_device = if self.state.output_routes.take_changed(session) {
            let device = self.new_output_device(io, false);
            self.check_strategy_route(Strategy::for_stream(stream), Some(io));
            Some(device)
        } else {
            None
        };

        match self.start_source(io, stream, forced_device) {
            Ok(settle) => Ok(settle),
            Err(e) => {
                self.state.output_routes.dec_activity(session);
                Err(e)
            }
        }
    }

    fn start_source(&mut self, io: IoHandle, stream: StreamType, forced_device: Option<DeviceTypeSet>) -> Result<Settle> {
        let now = self.now_ms();
        let beacon_wait = if stream == StreamType::Tts {
            let other_active = StreamType::ALL
                .iter()
                .filter(|s| **s != StreamType::Tts)
                .any(|s| self.state.outputs.is_stream_active(*s, 0, now));
            if other_active {
                return Err(PolicyError::invalid_operation("TTS cannot start while other playback is active"));
            }
            self.handle_beacon_event(BeaconEvent::StartingBeacon)
        } else {
            self.handle_beacon_event(BeaconEvent::StartingOutput)
        };

        let mut force = !self.state.outputs.get(io).is_some_and(|d| d.is_active(0, now));
        let count = self.state.outputs.change_ref_count(io, stream, 1, now)?;
        self.state.touch();
        if count != 1 && forced_device.is_none() {
            return Ok(Settle::NONE);
        }

        let devices = match forced_device {
            Some(devices) => devices,
            None => self.new_output_device(io, false),
        };
        let strategy = Strategy::for_stream(stream);
        let should_wait = matches!(strategy, Strategy::Sonification | Strategy::SonificationRespectful) || beacon_wait > 0;
        let mut wait_ms = beacon_wait;
        for other in self.state.outputs.handles() {
            if other == io {
                continue;
            }
            if self.state.outputs.shares_hw_module(io, other) && self.state.outputs.devices(other) != devices {
                force = true;
            }
            let latency = self.state.outputs.latency(other);
            let recently_active = self
                .state
                .outputs
                .get(other)
                .is_some_and(|d| d.is_active(u64::from(latency) * 2, now));
            if should_wait && recently_active && wait_ms < latency {
                wait_ms = latency;
            }
        }

        let routed = self.set_output_device(io, &devices, force, 0, None);
        if self.state.is_in_call() {
            self.handle_incall_sonification(stream, true, false);
        }
        let device = crate::domain::volume::device_for_volume(&devices);
        let index = self.state.volumes.stream(stream).index_for(device);
        let _ = self.check_and_set_volume(stream, index, io, device, 0, false);
        self.handle_notification_routing(stream);
        if strategy == Strategy::Sonification {
            Self::hal_warn(self.hal.invalidate_stream(StreamType::Accessibility), "stream invalidation");
        }

        let extra = wait_ms.saturating_sub(routed.wait_ms);
        debug!(output = %io, %stream, %devices, wait_ms = extra, "Playback started");
        Ok(routed.join(Settle::after(extra)))
    }

    /// A client stops playing a stream on an output
    pub fn stop_output(&mut self, io: IoHandle, stream: StreamType, session: SessionId) -> Result<Settle> {
        let Some(desc) = self.state.outputs.get(io) else {
            return Err(PolicyError::bad_value(format!("unknown output {}", io)));
        };
        let mut force_update = false;
        if desc.ref_count[stream.index()] > 0 {
            let activity = self.state.output_routes.dec_activity(session);
            force_update = self.state.output_routes.has_device(session) && activity == 0;
            if force_update {
                self.check_strategy_route(Strategy::for_stream(stream), None);
            }
        }
        self.stop_source(io, stream, force_update)
    }

    fn stop_source(&mut self, io: IoHandle, stream: StreamType, force_update: bool) -> Result<Settle> {
        self.handle_beacon_event(if stream == StreamType::Tts {
            BeaconEvent::StoppingBeacon
        } else {
            BeaconEvent::StoppingOutput
        });
        if self.state.is_in_call() {
            self.handle_incall_sonification(stream, false, false);
        }

        let now = self.now_ms();
        let refs = self.state.outputs.get(io).map_or(0, |d| d.ref_count[stream.index()]);
        if refs == 0 {
            warn!(output = %io, %stream, "Stop with no active client");
            return Err(PolicyError::invalid_operation(format!(
                "{} is not active on output {}",
                stream, io
            )));
        }
        let count = self.state.outputs.change_ref_count(io, stream, -1, now)?;
        self.state.touch();
        if count != 0 && !force_update {
            return Ok(Settle::NONE);
        }

        let devices = self.new_output_device(io, false);
        let delay_ms = self.state.outputs.latency(io) * 2;
        let settle = self.set_output_device(io, &devices, false, delay_ms, None);

        for other in self.state.outputs.handles() {
            if other == io {
                continue;
            }
            let active = self.state.outputs.get(other).is_some_and(|d| d.is_active(0, now));
            let other_devices = self.state.outputs.devices(other);
            if active && self.state.outputs.shares_hw_module(io, other) && other_devices != devices {
                let restored = self.new_output_device(other, false);
                let _ = self.set_output_device(other, &restored, true, delay_ms, None);
            }
        }
        self.handle_notification_routing(stream);
        debug!(output = %io, %stream, %devices, "Playback stopped");
        Ok(settle)
    }

    /// A client is done with an output; direct outputs close with their
    /// last client
    pub fn release_output(&mut self, io: IoHandle, session: SessionId) -> Result<()> {
        self.state.output_routes.remove(session);
        self.state.touch();
        let Some(desc) = self.state.outputs.get_mut(io) else {
            return Err(PolicyError::bad_value(format!("unknown output {}", io)));
        };
        if !desc.is_direct() {
            return Ok(());
        }
        if desc.direct_open_count == 0 {
            warn!(output = %io, "Direct output released more often than opened");
            return Ok(());
        }
        desc.direct_open_count -= 1;
        if desc.direct_open_count == 0 {
            self.close_output(io);
            if let (Some(primary), Some(target)) = (self.state.primary_output, self.select_output_for_effects()) {
                if primary != target {
                    Self::hal_warn(self.hal.move_effects(SessionId::OUTPUT_MIX, primary, target), "effects move");
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Stream specific rules
    // ========================================================================

    /// TTS is only audible while nothing else plays. Returns the time the
    /// mute change needs to take effect.
    fn handle_beacon_event(&mut self, event: BeaconEvent) -> u32 {
        match event {
            BeaconEvent::StartingOutput => self.state.beacon_mute_ref += 1,
            BeaconEvent::StoppingOutput => self.state.beacon_mute_ref = self.state.beacon_mute_ref.saturating_sub(1),
            BeaconEvent::StartingBeacon => self.state.beacon_playing_ref += 1,
            BeaconEvent::StoppingBeacon => {
                self.state.beacon_playing_ref = self.state.beacon_playing_ref.saturating_sub(1)
            }
        }
        let mute = self.state.beacon_mute_ref > 0 || self.state.beacon_playing_ref == 0;
        if mute == self.state.beacon_muted {
            return 0;
        }
        let mut max_latency = 0;
        for io in self.state.outputs.handles() {
            self.set_stream_mute(StreamType::Tts, mute, io, 0, None);
            max_latency = max_latency.max(self.state.outputs.latency(io) * 2);
        }
        self.state.beacon_muted = mute;
        debug!(muted = mute, "Beacon mute changed");
        max_latency
    }

    /// While in call, low visibility sonification is muted on the primary
    /// output instead of interrupting the call
    pub(crate) fn handle_incall_sonification(&mut self, stream: StreamType, starting: bool, state_change: bool) {
        let strategy = Strategy::for_stream(stream);
        if !matches!(strategy, Strategy::Sonification | Strategy::SonificationRespectful) {
            return;
        }
        let Some(primary) = self.state.primary_output else {
            return;
        };
        let Some(desc) = self.state.outputs.get(primary) else {
            return;
        };
        let refs = desc.ref_count[stream.index()];
        if refs == 0 {
            return;
        }
        let mute_count = if state_change { refs } else { 1 };
        let audible_in_call = stream.is_low_visibility()
            || desc.devices.intersects(&self.device_for_strategy(Strategy::Phone, true));
        if !audible_in_call {
            return;
        }
        for _ in 0..mute_count {
            self.set_stream_mute(stream, starting, primary, 0, None);
        }
    }

    fn handle_notification_routing(&mut self, stream: StreamType) {
        if stream == StreamType::Music {
            self.check_output_for_strategy(Strategy::SonificationRespectful);
            self.update_devices_and_outputs();
        }
    }
}

enum DirectOutcome {
    Opened(IoHandle),
    /// Direct output unusable, a mixed output may serve the request
    Fallback,
    NoProfile,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;
    use crate::domain::audio::{AudioFormat, ChannelMask, ConnectionState, DeviceType};

    fn music(session: u32) -> OutputAttributes {
        OutputAttributes::new(StreamType::Music, SessionId(session))
    }

    #[test]
    fn test_same_device_without_force_keeps_patch() {
        let (mut manager, _) = manager();
        let primary = manager.primary_output().unwrap();
        let speaker = DeviceTypeSet::single(DeviceType::Speaker);
        let calls = manager.hal().patch_calls;
        let _ = manager.set_output_device(primary, &speaker, false, 0, None);
        let _ = manager.set_output_device(primary, &speaker, false, 0, None);
        assert_eq!(manager.hal().patch_calls, calls);

        let _ = manager.set_output_device(primary, &speaker, true, 0, None);
        assert_eq!(manager.hal().patch_calls, calls + 1);
        // updated in place
        let patch = manager.state().outputs.get(primary).unwrap().patch;
        assert_eq!(manager.state().patches.len(), manager.state().outputs.iter().filter(|o| o.patch.is_some()).count());
        assert!(patch.is_some());
    }

    #[test]
    fn test_unsupported_device_resets_output() {
        let (mut manager, _) = manager();
        let primary = manager.primary_output().unwrap();
        let hdmi = DeviceTypeSet::single(DeviceType::Hdmi);
        let _ = manager.set_output_device(primary, &hdmi, true, 0, None);
        assert!(manager.state().outputs.get(primary).unwrap().patch.is_none());
    }

    #[test]
    fn test_music_prefers_deep_buffer() {
        let (mut manager, _) = manager();
        let mut attrs = music(1);
        attrs.flags.deep_buffer = true;
        let io = manager.get_output_for_attr(&attrs).unwrap();
        assert!(manager.state().outputs.get(io).unwrap().flags.deep_buffer);

        let ring = OutputAttributes {
            flags: OutputFlags {
                deep_buffer: true,
                ..OutputFlags::NONE
            },
            ..OutputAttributes::new(StreamType::Ring, SessionId(2))
        };
        let io = manager.get_output_for_attr(&ring).unwrap();
        assert_eq!(Some(io), manager.primary_output());
    }

    #[test]
    fn test_start_stop_output_updates_ref_counts() {
        let (mut manager, clock) = manager();
        let io = manager.get_output_for_attr(&music(1)).unwrap();
        manager.start_output(io, StreamType::Music, SessionId(1)).unwrap();
        assert!(manager.is_stream_active(StreamType::Music, 0));
        manager.stop_output(io, StreamType::Music, SessionId(1)).unwrap();
        assert!(!manager.is_stream_active(StreamType::Music, 0));
        assert!(manager.is_stream_active(StreamType::Music, 1000));
        clock.advance(2000);
        assert!(!manager.is_stream_active(StreamType::Music, 1000));

        let err = manager.stop_output(io, StreamType::Music, SessionId(1)).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOperation(_)));
        assert!(matches!(
            manager.start_output(IoHandle(9999), StreamType::Music, SessionId(1)),
            Err(PolicyError::BadValue(_))
        ));
    }

    #[test]
    fn test_tts_rejected_while_music_plays() {
        let (mut manager, _) = manager();
        let io = manager.get_output_for_attr(&music(1)).unwrap();
        manager.start_output(io, StreamType::Music, SessionId(1)).unwrap();
        let tts = manager
            .get_output_for_attr(&OutputAttributes::new(StreamType::Tts, SessionId(2)))
            .unwrap();
        assert!(manager.start_output(tts, StreamType::Tts, SessionId(2)).is_err());
        // TTS is muted everywhere while other playback runs
        assert!(manager.state().outputs.iter().all(|o| o.is_muted(StreamType::Tts)));
    }

    #[test]
    fn test_direct_output_opens_and_closes() {
        let (mut manager, _) = manager();
        manager.hal_mut().caps_reply =
            "sup_sampling_rates=48000|44100;sup_formats=pcm_16|ac3;sup_channels=stereo|5.1".to_string();
        manager
            .set_device_connection_state(DeviceType::Hdmi, ConnectionState::Available, "", "tv")
            .unwrap();
        // the probing direct output is closed again
        assert!(manager.state().outputs.iter().all(|o| !o.is_direct()));
        let before = manager.state().outputs.len();
        let attrs = OutputAttributes {
            config: Some(StreamConfig {
                sample_rate: 48000,
                format: AudioFormat::Ac3,
                channel_mask: ChannelMask::Surround5_1,
            }),
            flags: OutputFlags::direct(),
            ..music(7)
        };
        // media now prefers HDMI
        let io = manager.get_output_for_attr(&attrs).unwrap();
        assert!(manager.state().outputs.get(io).unwrap().is_direct());
        assert_eq!(manager.state().outputs.len(), before + 1);

        // same session reuses it
        assert_eq!(manager.get_output_for_attr(&attrs).unwrap(), io);
        assert_eq!(manager.state().outputs.get(io).unwrap().direct_open_count, 2);

        manager.release_output(io, SessionId(7)).unwrap();
        assert!(manager.state().outputs.contains(io));
        manager.release_output(io, SessionId(7)).unwrap();
        assert!(!manager.state().outputs.contains(io));
    }

    #[test]
    fn test_mute_sequencing_on_device_change() {
        let (mut manager, _) = manager();
        let primary = manager.primary_output().unwrap();
        let io = manager
            .get_output_for_attr(&OutputAttributes::new(StreamType::Ring, SessionId(3)))
            .unwrap();
        assert_eq!(io, primary);
        manager.start_output(io, StreamType::Ring, SessionId(3)).unwrap();

        let previous = DeviceTypeSet::single(DeviceType::Earpiece);
        let schedule = manager.check_device_mute_strategies(io, &previous, 0);
        assert_eq!(schedule.wait_ms, 40);
        assert!(schedule
            .actions
            .iter()
            .any(|a| a.strategy == Strategy::Sonification && a.action == MuteAction::Unmute && a.delay_ms == 80));
        // the temporary mute is released in state right away
        assert!(!manager.state().outputs.get(io).unwrap().is_muted(StreamType::Ring));
    }
}
