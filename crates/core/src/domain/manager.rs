//! The audio policy manager
//!
//! [`PolicyManager`] owns every piece of routing state in a single
//! [`PolicyState`] and drives a [`HalClient`]. Operations are split by
//! concern:
//! - `connection`: device connection, phone state and forced usages
//! - `output` / `input`: stream lifecycle and device selection
//! - `patch_api`: explicit patches and the port/patch mirror
//! - `volume`: stream indexes, mutes and hardware volume writes
//!
//! All operations take `&mut self`. Nothing here sleeps: routing changes that
//! need audio to drain return a [`Settle`](crate::domain::schedule::Settle)
//! and carry their delays to the hardware client.

mod connection;
mod input;
mod output;
mod patch_api;
mod volume;

pub use patch_api::AudioPortInfo;

use crate::domain::audio::{
    AudioSource, ConnectionState, DeviceType, DeviceTypeSet, ForceUse, ForcedConfig,
    HandleAllocator, IoHandle, OutputFlags, PatchHandle, PhoneState, PolicyError, PortHandle,
    Result, SessionId, StreamType, Uid,
};
use crate::domain::config::PolicyConfig;
use crate::domain::descriptor::{InputCollection, InputSession, OutputCollection, OutputKind};
use crate::domain::device::DeviceVector;
use crate::domain::hal::{HalClient, HalResult};
use crate::domain::module::HwModuleCollection;
use crate::domain::patch::{AudioPatch, PatchCollection};
use crate::domain::schedule::{Clock, MonotonicClock};
use crate::domain::strategy::{
    DefaultEngine, Engine, EngineContext, Strategy, StrategyCache, StreamActivity,
};
use crate::domain::volume::{VolumeTable, SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY_MS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Unmute delay applied to media and sonification when a call starts
pub const MUTE_TIME_MS: u32 = 2000;

/// Highest sample rate a mixed (non direct) output accepts
pub const MAX_MIXER_SAMPLING_RATE: u32 = 48000;

/// Explicit device selection made by a client for its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRoute {
    pub stream: Option<StreamType>,
    pub source: Option<AudioSource>,
    pub device: Option<(DeviceType, String)>,
    pub ref_count: u32,
    pub activity: u32,
    /// Selection changed since the session last started
    pub changed: bool,
}

impl SessionRoute {
    pub fn is_active(&self) -> bool {
        self.device.is_some() && (self.changed || self.activity > 0)
    }
}

/// Session routes of one direction
#[derive(Debug, Clone, Default)]
pub struct SessionRoutes {
    routes: BTreeMap<SessionId, SessionRoute>,
}

impl SessionRoutes {
    pub fn add(
        &mut self,
        session: SessionId,
        stream: Option<StreamType>,
        source: Option<AudioSource>,
        device: Option<(DeviceType, String)>,
    ) {
        match self.routes.get_mut(&session) {
            Some(route) => {
                route.ref_count += 1;
                if route.device != device {
                    route.device = device;
                    route.changed = true;
                }
            }
            None => {
                let changed = device.is_some();
                self.routes.insert(
                    session,
                    SessionRoute {
                        stream,
                        source,
                        device,
                        ref_count: 1,
                        activity: 0,
                        changed,
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, session: SessionId) {
        if let Some(route) = self.routes.get_mut(&session) {
            route.ref_count = route.ref_count.saturating_sub(1);
            if route.ref_count == 0 {
                self.routes.remove(&session);
            }
        }
    }

    pub fn inc_activity(&mut self, session: SessionId) {
        if let Some(route) = self.routes.get_mut(&session) {
            route.activity += 1;
        }
    }

    /// Returns the remaining activity of the session
    pub fn dec_activity(&mut self, session: SessionId) -> u32 {
        match self.routes.get_mut(&session) {
            Some(route) => {
                route.activity = route.activity.saturating_sub(1);
                route.activity
            }
            None => 0,
        }
    }

    /// Session exists and selected an explicit device
    pub fn has_device(&self, session: SessionId) -> bool {
        self.routes.get(&session).is_some_and(|r| r.device.is_some())
    }

    /// Report and clear a pending selection change
    pub fn take_changed(&mut self, session: SessionId) -> bool {
        match self.routes.get_mut(&session) {
            Some(route) if route.changed => {
                route.changed = false;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, session: SessionId) -> Option<&SessionRoute> {
        self.routes.get(&session)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &SessionRoute)> {
        self.routes.iter()
    }

    /// Device forced by an active route for a stream of the strategy
    fn device_for_strategy(&self, strategy: Strategy) -> Option<DeviceType> {
        self.routes
            .values()
            .filter(|r| r.is_active())
            .find(|r| r.stream.is_some_and(|s| Strategy::for_stream(s) == strategy))
            .and_then(|r| r.device.as_ref().map(|(t, _)| *t))
    }

    fn device_for_source(&self, source: AudioSource) -> Option<DeviceType> {
        self.routes
            .values()
            .filter(|r| r.is_active())
            .find(|r| r.source == Some(source))
            .and_then(|r| r.device.as_ref().map(|(t, _)| *t))
    }
}

/// Everything the policy knows, owned by the manager
#[derive(Debug)]
pub struct PolicyState {
    pub name: String,
    pub modules: HwModuleCollection,
    pub available_outputs: DeviceVector,
    pub available_inputs: DeviceVector,
    pub outputs: OutputCollection,
    pub inputs: InputCollection,
    pub patches: PatchCollection,
    pub volumes: VolumeTable,
    pub phone_state: PhoneState,
    pub forced: [ForcedConfig; ForceUse::COUNT],
    pub primary_output: Option<IoHandle>,
    pub output_routes: SessionRoutes,
    pub input_routes: SessionRoutes,
    pub a2dp_suspended: bool,
    /// Ringtone capped to music while ringing over playing music
    pub limit_ringtone_volume: bool,
    /// Telephony patches, owned by the policy and not listed to clients
    pub call_rx_patch: Option<AudioPatch>,
    pub call_tx_patch: Option<AudioPatch>,
    /// Bumped whenever ports or patches change
    pub port_generation: u32,
    generation: u64,
    cache: StrategyCache,
    /// Supported devices of each output at the last routing commit
    previous_outputs: BTreeMap<IoHandle, DeviceTypeSet>,
    beacon_mute_ref: u32,
    beacon_playing_ref: u32,
    beacon_muted: bool,
    last_voice_volume: Option<f32>,
    alloc: HandleAllocator,
}

impl PolicyState {
    fn new(config: &PolicyConfig) -> Result<Self> {
        let mut alloc = HandleAllocator::new();
        let modules = config
            .build_modules(&mut alloc)
            .map_err(|e| PolicyError::bad_value(e.to_string()))?;
        let volumes = config
            .volume_table()
            .map_err(|e| PolicyError::bad_value(e.to_string()))?;
        Ok(Self {
            name: config.global.name.clone(),
            modules,
            available_outputs: DeviceVector::new(),
            available_inputs: DeviceVector::new(),
            outputs: OutputCollection::new(),
            inputs: InputCollection::new(),
            patches: PatchCollection::new(),
            volumes,
            phone_state: PhoneState::Normal,
            forced: [ForcedConfig::None; ForceUse::COUNT],
            primary_output: None,
            output_routes: SessionRoutes::default(),
            input_routes: SessionRoutes::default(),
            a2dp_suspended: false,
            limit_ringtone_volume: false,
            call_rx_patch: None,
            call_tx_patch: None,
            port_generation: 1,
            generation: 0,
            cache: StrategyCache::new(),
            previous_outputs: BTreeMap::new(),
            beacon_mute_ref: 0,
            beacon_playing_ref: 0,
            beacon_muted: false,
            last_voice_volume: None,
            alloc,
        })
    }

    /// State generation; every mutation relevant to routing bumps it
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    fn next_port_generation(&mut self) {
        self.port_generation = self.port_generation.wrapping_add(1);
    }

    fn force_use(&self, usage: ForceUse) -> ForcedConfig {
        self.forced[usage.index()]
    }

    fn is_in_call(&self) -> bool {
        self.phone_state.is_in_call()
    }
}

/// Audio routing policy driving a hardware client
pub struct PolicyManager<H: HalClient> {
    hal: H,
    engine: Box<dyn Engine>,
    clock: Box<dyn Clock>,
    state: PolicyState,
}

impl<H: HalClient> PolicyManager<H> {
    /// Build the manager from a topology; nothing is opened until
    /// [`initialize`](Self::initialize)
    pub fn new(hal: H, config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            hal,
            engine: Box::new(DefaultEngine::new()),
            clock: Box::new(MonotonicClock::new()),
            state: PolicyState::new(config)?,
        })
    }

    pub fn with_engine(mut self, engine: Box<dyn Engine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load modules, open outputs reaching attached devices and register the
    /// devices found reachable
    pub fn initialize(&mut self) -> Result<()> {
        info!(name = %self.state.name, modules = self.state.modules.len(), "Initializing audio policy");

        for index in 0..self.state.modules.len() {
            let Some(name) = self.state.modules.get(index).map(|m| m.name.clone()) else {
                continue;
            };
            match self.hal.load_hw_module(&name) {
                Ok(handle) => {
                    if let Some(module) = self.state.modules.get_mut(index) {
                        module.handle = Some(handle);
                    }
                    debug!(module = %name, %handle, "Module loaded");
                }
                Err(e) => {
                    warn!(module = %name, error = %e, "Could not load module");
                    continue;
                }
            }
            self.open_attached_outputs(index);
            self.probe_attached_inputs(index);
        }

        if self.state.outputs.is_empty() {
            return Err(PolicyError::HardwareFailure(
                "no output could be opened for any attached device".to_string(),
            ));
        }
        if self.state.primary_output.is_none() {
            warn!("No primary output opened");
        }
        self.update_devices_and_outputs();
        info!(
            outputs = self.state.outputs.len(),
            devices_out = self.state.available_outputs.len(),
            devices_in = self.state.available_inputs.len(),
            "Audio policy ready"
        );
        Ok(())
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn state(&self) -> &PolicyState {
        &self.state
    }

    pub fn primary_output(&self) -> Option<IoHandle> {
        self.state.primary_output
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ========================================================================
    // Device resolution
    // ========================================================================

    fn stream_activity(&self) -> StreamActivity {
        let now = self.now_ms();
        let mut activity = StreamActivity::default();
        for stream in StreamType::ALL {
            activity.active[stream.index()] = self.state.outputs.is_stream_active(stream, 0, now);
        }
        activity.music_recently_active =
            self.state
                .outputs
                .is_stream_active(StreamType::Music, SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY_MS, now);
        activity
    }

    fn resolve_strategy(&self, strategy: Strategy) -> DeviceTypeSet {
        let ctx = EngineContext {
            available_outputs: &self.state.available_outputs,
            available_inputs: &self.state.available_inputs,
            phone_state: self.state.phone_state,
            forced: &self.state.forced,
            activity: self.stream_activity(),
        };
        self.engine.device_for_strategy(strategy, &ctx)
    }

    /// Devices for a strategy; an active session route wins over the rules
    pub(crate) fn device_for_strategy(&self, strategy: Strategy, from_cache: bool) -> DeviceTypeSet {
        if let Some(device) = self.state.output_routes.device_for_strategy(strategy) {
            if self.state.available_outputs.has_type(device) {
                return DeviceTypeSet::single(device);
            }
        }
        if from_cache {
            if let Some(devices) = self.state.cache.lookup(strategy, self.state.generation) {
                return devices.clone();
            }
        }
        self.resolve_strategy(strategy)
    }

    pub(crate) fn device_for_input_source(&self, source: AudioSource) -> Option<DeviceType> {
        if let Some(device) = self.state.input_routes.device_for_source(source) {
            if self.state.available_inputs.has_type(device) {
                return Some(device);
            }
        }
        let ctx = EngineContext {
            available_outputs: &self.state.available_outputs,
            available_inputs: &self.state.available_inputs,
            phone_state: self.state.phone_state,
            forced: &self.state.forced,
            activity: self.stream_activity(),
        };
        self.engine.device_for_input_source(source, &ctx)
    }

    /// Recompute every strategy and commit the result at the current
    /// generation; also snapshots the outputs for the next comparison
    pub(crate) fn update_devices_and_outputs(&mut self) {
        let entries = Strategy::ALL.map(|s| self.resolve_strategy(s));
        let generation = self.state.generation;
        self.state.cache.commit(entries, generation);
        self.snapshot_outputs();
    }

    fn snapshot_outputs(&mut self) {
        self.state.previous_outputs = self
            .state
            .outputs
            .handles()
            .into_iter()
            .map(|io| (io, self.state.outputs.supported_devices(io)))
            .collect();
    }

    /// Outputs of the last snapshot able to reach every device of the set
    fn previous_outputs_for(&self, devices: &DeviceTypeSet) -> Vec<IoHandle> {
        if devices.is_empty() {
            return Vec::new();
        }
        self.state
            .previous_outputs
            .iter()
            .filter(|(_, supported)| devices.is_subset(supported))
            .map(|(io, _)| *io)
            .collect()
    }

    /// Device an output should be routed to given what plays on it
    pub(crate) fn new_output_device(&self, io: IoHandle, from_cache: bool) -> DeviceTypeSet {
        let Some(desc) = self.state.outputs.get(io) else {
            return DeviceTypeSet::new();
        };
        if let Some(patch) = desc.patch.and_then(|h| self.state.patches.get(h)) {
            if patch.uid != Uid::SYSTEM {
                debug!(output = %io, patch = %patch.handle, "Device forced by client patch");
                return self.state.outputs.devices(io);
            }
        }

        let now = self.now_ms();
        let active = |s: Strategy| desc.is_strategy_active(s, 0, now);
        let system_enforced = self.state.force_use(ForceUse::System) == ForcedConfig::SystemEnforced;

        let strategy = if active(Strategy::EnforcedAudible) && system_enforced {
            Some(Strategy::EnforcedAudible)
        } else if self.state.is_in_call() || active(Strategy::Phone) {
            Some(Strategy::Phone)
        } else {
            [
                Strategy::EnforcedAudible,
                Strategy::Sonification,
                Strategy::Accessibility,
                Strategy::SonificationRespectful,
                Strategy::Media,
                Strategy::Dtmf,
                Strategy::TransmittedThroughSpeaker,
                Strategy::Rerouting,
            ]
            .into_iter()
            .find(|s| active(*s))
        };

        match strategy {
            Some(strategy) => {
                let devices = self.device_for_strategy(strategy, from_cache);
                debug!(output = %io, %strategy, %devices, "Output device selected");
                devices
            }
            None => DeviceTypeSet::new(),
        }
    }

    /// Capture device for an input given its highest priority active session
    pub(crate) fn new_input_device(&self, io: IoHandle) -> Option<DeviceType> {
        let desc = self.state.inputs.get(io)?;
        if let Some(patch) = desc.patch.and_then(|h| self.state.patches.get(h)) {
            if patch.uid != Uid::SYSTEM {
                return Some(desc.device);
            }
        }
        let mut source = desc.highest_priority_source(true)?;
        if source == AudioSource::Default && self.state.is_in_call() {
            source = AudioSource::VoiceCommunication;
        }
        self.device_for_input_source(source)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn strategy_for_stream(&self, stream: StreamType) -> Strategy {
        Strategy::for_stream(stream)
    }

    /// Devices a stream would currently play to
    pub fn devices_for_stream(&self, stream: StreamType) -> DeviceTypeSet {
        self.device_for_strategy(Strategy::for_stream(stream), true)
    }

    /// Stream active now, or stopped less than `in_past_ms` ago
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u64) -> bool {
        self.state.outputs.is_stream_active(stream, in_past_ms, self.now_ms())
    }

    pub fn is_source_active(&self, source: AudioSource) -> bool {
        self.state.inputs.is_source_active(source)
            || (source == AudioSource::VoiceRecognition && self.state.inputs.is_source_active(AudioSource::Hotword))
    }

    pub fn device_connection_state(&self, device: DeviceType, address: &str) -> ConnectionState {
        let devices = if device.is_output() {
            &self.state.available_outputs
        } else {
            &self.state.available_inputs
        };
        if devices.contains(device, address) {
            ConnectionState::Available
        } else {
            ConnectionState::Unavailable
        }
    }

    pub fn force_use(&self, usage: ForceUse) -> ForcedConfig {
        self.state.force_use(usage)
    }

    pub fn phone_state(&self) -> PhoneState {
        self.state.phone_state
    }

    // ========================================================================
    // Hardware helpers
    // ========================================================================

    /// Log a failed fire-and-forget hardware command
    fn hal_warn<T>(result: HalResult<T>, what: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Hardware {} failed", what);
                None
            }
        }
    }

    fn next_io(&mut self) -> IoHandle {
        self.state.alloc.next_io()
    }

    fn next_port(&mut self) -> PortHandle {
        self.state.alloc.next_port()
    }

    fn next_patch(&mut self) -> PatchHandle {
        self.state.alloc.next_patch()
    }

    // ========================================================================
    // Dump
    // ========================================================================

    /// Serializable snapshot of the whole policy state
    pub fn dump(&self) -> PolicyDump {
        let state = &self.state;
        let device_dump = |devices: &DeviceVector| {
            devices
                .iter()
                .map(|d| DeviceDump {
                    port: d.port_id,
                    device_type: d.device_type,
                    address: d.address.clone(),
                    name: d.name.clone(),
                })
                .collect()
        };
        let outputs = state
            .outputs
            .iter()
            .map(|d| OutputDump {
                io: d.io,
                kind: d.kind,
                profile: d
                    .profile
                    .and_then(|p| state.modules.profile(p))
                    .map(|p| p.name.clone()),
                flags: d.flags,
                devices: state.outputs.devices(d.io),
                supported_devices: state.outputs.supported_devices(d.io),
                latency_ms: state.outputs.latency(d.io),
                active_streams: StreamType::ALL
                    .iter()
                    .filter(|s| d.ref_count[s.index()] > 0)
                    .map(|s| (*s, d.ref_count[s.index()]))
                    .collect(),
                muted_streams: StreamType::ALL.iter().copied().filter(|s| d.is_muted(*s)).collect(),
                patch: d.patch,
            })
            .collect();
        let inputs = state
            .inputs
            .iter()
            .map(|d| InputDump {
                io: d.io,
                device: d.device,
                address: d.address.clone(),
                profile: state
                    .modules
                    .profile(d.profile)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
                sessions: d.sessions.clone(),
                patch: d.patch,
            })
            .collect();
        let volumes = StreamType::ALL
            .iter()
            .map(|s| {
                let desc = state.volumes.stream(*s);
                StreamVolumeDump {
                    stream: *s,
                    index_min: desc.index_min,
                    index_max: desc.index_max,
                    default_index: desc.index_for(None),
                    per_device: desc.per_device().collect(),
                }
            })
            .collect();

        PolicyDump {
            name: state.name.clone(),
            phone_state: state.phone_state,
            forced: [
                ForceUse::Communication,
                ForceUse::Media,
                ForceUse::Record,
                ForceUse::Dock,
                ForceUse::System,
                ForceUse::HdmiSystemAudio,
                ForceUse::EncodedSurround,
            ]
            .into_iter()
            .map(|u| (u, state.force_use(u)))
            .filter(|(_, c)| *c != ForcedConfig::None)
            .collect(),
            available_outputs: device_dump(&state.available_outputs),
            available_inputs: device_dump(&state.available_inputs),
            outputs,
            inputs,
            patches: state.patches.iter().cloned().collect(),
            strategies: Strategy::ALL
                .iter()
                .map(|s| (*s, self.device_for_strategy(*s, true)))
                .collect(),
            volumes,
            a2dp_suspended: state.a2dp_suspended,
            primary_output: state.primary_output,
            generation: state.generation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDump {
    pub port: PortHandle,
    pub device_type: DeviceType,
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDump {
    pub io: IoHandle,
    pub kind: OutputKind,
    pub profile: Option<String>,
    pub flags: OutputFlags,
    pub devices: DeviceTypeSet,
    pub supported_devices: DeviceTypeSet,
    pub latency_ms: u32,
    pub active_streams: BTreeMap<StreamType, u32>,
    pub muted_streams: Vec<StreamType>,
    pub patch: Option<PatchHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputDump {
    pub io: IoHandle,
    pub device: DeviceType,
    pub address: String,
    pub profile: String,
    pub sessions: BTreeMap<SessionId, InputSession>,
    pub patch: Option<PatchHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamVolumeDump {
    pub stream: StreamType,
    pub index_min: u32,
    pub index_max: u32,
    pub default_index: u32,
    pub per_device: BTreeMap<DeviceType, u32>,
}

/// Snapshot of the policy state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDump {
    pub name: String,
    pub phone_state: PhoneState,
    pub forced: BTreeMap<ForceUse, ForcedConfig>,
    pub available_outputs: Vec<DeviceDump>,
    pub available_inputs: Vec<DeviceDump>,
    pub outputs: Vec<OutputDump>,
    pub inputs: Vec<InputDump>,
    pub patches: Vec<AudioPatch>,
    pub strategies: BTreeMap<Strategy, DeviceTypeSet>,
    pub volumes: Vec<StreamVolumeDump>,
    pub a2dp_suspended: bool,
    pub primary_output: Option<IoHandle>,
    pub generation: u64,
}

impl fmt::Display for PolicyDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Policy '{}' (generation {})", self.name, self.generation)?;
        writeln!(f, "  phone state: {:?}", self.phone_state)?;
        for (usage, config) in &self.forced {
            writeln!(f, "  forced {:?}: {:?}", usage, config)?;
        }
        if self.a2dp_suspended {
            writeln!(f, "  a2dp suspended")?;
        }

        writeln!(f, "Available output devices:")?;
        for d in &self.available_outputs {
            writeln!(f, "  [{}] {} {:?} '{}'", d.port, d.device_type, d.address, d.name)?;
        }
        writeln!(f, "Available input devices:")?;
        for d in &self.available_inputs {
            writeln!(f, "  [{}] {} {:?} '{}'", d.port, d.device_type, d.address, d.name)?;
        }

        writeln!(f, "Outputs:")?;
        for o in &self.outputs {
            let primary = if Some(o.io) == self.primary_output { " primary" } else { "" };
            let kind = match o.kind {
                OutputKind::Simple => o.profile.clone().unwrap_or_default(),
                OutputKind::Duplicated(a, b) => format!("duplicating {} + {}", a, b),
            };
            writeln!(f, "  output {}{} ({}): devices {} latency {} ms", o.io, primary, kind, o.devices, o.latency_ms)?;
            for (stream, count) in &o.active_streams {
                writeln!(f, "    {} x{}", stream, count)?;
            }
            if !o.muted_streams.is_empty() {
                let muted: Vec<String> = o.muted_streams.iter().map(|s| s.to_string()).collect();
                writeln!(f, "    muted: {}", muted.join(", "))?;
            }
        }
        writeln!(f, "Inputs:")?;
        for i in &self.inputs {
            writeln!(f, "  input {} ({}): {} {:?}, {} session(s)", i.io, i.profile, i.device, i.address, i.sessions.len())?;
        }

        writeln!(f, "Patches:")?;
        for p in &self.patches {
            let sources: Vec<String> = p.sources.iter().map(|s| format!("{:?}", s.ext)).collect();
            writeln!(f, "  patch {} uid {}: {} -> {}", p.handle, p.uid.0, sources.join(" + "), p.sink_devices())?;
        }

        writeln!(f, "Strategies:")?;
        for (strategy, devices) in &self.strategies {
            writeln!(f, "  {}: {}", strategy, devices)?;
        }
        writeln!(f, "Volumes:")?;
        for v in &self.volumes {
            write!(f, "  {}: {}..{} default {}", v.stream, v.index_min, v.index_max, v.default_index)?;
            for (device, index) in &v.per_device {
                write!(f, " {}={}", device, index)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::manager;
    use super::*;
    use crate::domain::hal::fake::FakeHal;

    #[test]
    fn test_initialize_opens_attached_outputs() {
        let (manager, _) = manager();
        let state = manager.state();
        assert!(state.primary_output.is_some());
        assert!(state.available_outputs.has_type(DeviceType::Speaker));
        assert!(state.available_outputs.has_type(DeviceType::Earpiece));
        assert!(!state.available_outputs.has_type(DeviceType::WiredHeadset));
        assert!(state.available_inputs.has_type(DeviceType::BuiltinMic));
        assert!(state.available_inputs.has_type(DeviceType::RemoteSubmixIn));
        // direct outputs are opened on demand only
        assert!(state.outputs.iter().all(|o| !o.is_direct()));
    }

    #[test]
    fn test_initialize_routes_primary_to_speaker() {
        let (manager, _) = manager();
        let primary = manager.primary_output().unwrap();
        let desc = manager.state().outputs.get(primary).unwrap();
        assert_eq!(desc.devices, DeviceTypeSet::single(DeviceType::Speaker));
        let patch = manager.state().patches.get(desc.patch.unwrap()).unwrap();
        assert_eq!(patch.uid, Uid::SYSTEM);
        assert_eq!(patch.sink_devices(), DeviceTypeSet::single(DeviceType::Speaker));
    }

    #[test]
    fn test_initialize_without_outputs_fails() {
        let mut hal = FakeHal::default();
        hal.fail_open_for = Some(DeviceType::Speaker);
        let mut config = PolicyConfig::factory_default();
        config.modules.truncate(1);
        for module in &mut config.modules {
            module.attached_devices.retain(|d| d == "Speaker" || d.contains("Mic"));
        }
        let mut manager = PolicyManager::new(hal, &config).unwrap();
        assert!(matches!(manager.initialize(), Err(PolicyError::HardwareFailure(_))));
    }

    #[test]
    fn test_strategy_cache_tracks_generation() {
        let (mut manager, _) = manager();
        let media = manager.device_for_strategy(Strategy::Media, true);
        assert_eq!(media, DeviceTypeSet::single(DeviceType::Speaker));
        manager.state.touch();
        assert!(manager
            .state
            .cache
            .lookup(Strategy::Media, manager.state.generation)
            .is_none());
        // stale entries fall through to recomputation
        assert_eq!(manager.device_for_strategy(Strategy::Media, true), media);
    }

    #[test]
    fn test_session_routes_activity() {
        let mut routes = SessionRoutes::default();
        let session = SessionId(5);
        routes.add(session, Some(StreamType::Music), None, Some((DeviceType::Speaker, String::new())));
        assert!(routes.get(session).unwrap().is_active());
        assert!(routes.take_changed(session));
        assert!(!routes.get(session).unwrap().is_active());
        routes.inc_activity(session);
        assert_eq!(routes.device_for_strategy(Strategy::Media), Some(DeviceType::Speaker));
        routes.dec_activity(session);
        routes.remove(session);
        assert!(routes.get(session).is_none());
    }

    #[test]
    fn test_dump_serializes() {
        let (manager, _) = manager();
        let dump = manager.dump();
        assert_eq!(dump.name, "factory default");
        assert_eq!(dump.strategies[&Strategy::Media], DeviceTypeSet::single(DeviceType::Speaker));
        let json = serde_json::to_string(&dump).unwrap();
        assert!(json.contains("\"phone_state\":\"normal\""));
        let text = dump.to_string();
        assert!(text.contains("Strategies:"));
        assert!(text.contains("primary"));
    }
}
