//! Runtime descriptors of opened outputs and inputs
//!
//! Descriptors live in handle-keyed arenas. A duplicated output does not own
//! devices of its own: every device, latency and reference-count query goes
//! through [`OutputCollection`], which matches on [`OutputKind`] and recurses
//! into the two sub outputs.

use crate::domain::audio::{
    AudioSource, DeviceType, DeviceTypeSet, InputFlags, IoHandle, OutputFlags, PatchHandle,
    PolicyError, PortHandle, Result, SessionId, StreamConfig, StreamType, Uid,
};
use crate::domain::module::ProfileId;
use crate::domain::strategy::Strategy;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Shape of an opened output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputKind {
    /// Opened against a single profile
    Simple,
    /// Software mix written to two outputs at once
    Duplicated(IoHandle, IoHandle),
}

/// Runtime state of one opened output stream
#[derive(Debug, Clone)]
pub struct OutputDescriptor {
    pub io: IoHandle,
    pub port_id: PortHandle,
    pub kind: OutputKind,
    /// Module index, `None` for duplicated outputs
    pub module: Option<usize>,
    pub profile: Option<ProfileId>,
    pub flags: OutputFlags,
    pub config: StreamConfig,
    pub latency_ms: u32,
    /// Devices currently routed; meaningful for simple outputs only
    pub devices: DeviceTypeSet,
    /// Address the output was opened for, empty unless the device needs one
    pub address: String,
    supported_devices: DeviceTypeSet,
    pub ref_count: [u32; StreamType::COUNT],
    /// Last volume written to the hardware, `None` until the first write
    pub cur_volume_db: [Option<f32>; StreamType::COUNT],
    pub mute_count: [u32; StreamType::COUNT],
    pub stop_time_ms: [Option<u64>; StreamType::COUNT],
    pub strategy_muted_by_device: [bool; Strategy::COUNT],
    pub patch: Option<PatchHandle>,
    /// Clients sharing a direct output
    pub direct_open_count: u32,
    pub direct_session: Option<SessionId>,
}

impl OutputDescriptor {
    pub fn new_simple(
        io: IoHandle,
        port_id: PortHandle,
        module: usize,
        profile: ProfileId,
        flags: OutputFlags,
        supported_devices: DeviceTypeSet,
    ) -> Self {
        Self {
            module: Some(module),
            profile: Some(profile),
            flags,
            supported_devices,
            ..Self::blank(io, port_id, OutputKind::Simple)
        }
    }

    pub fn new_duplicated(io: IoHandle, port_id: PortHandle, first: IoHandle, second: IoHandle) -> Self {
        Self::blank(io, port_id, OutputKind::Duplicated(first, second))
    }

    fn blank(io: IoHandle, port_id: PortHandle, kind: OutputKind) -> Self {
        Self {
            io,
            port_id,
            kind,
            module: None,
            profile: None,
            flags: OutputFlags::NONE,
            config: StreamConfig::default(),
            latency_ms: 0,
            devices: DeviceTypeSet::new(),
            address: String::new(),
            supported_devices: DeviceTypeSet::new(),
            ref_count: [0; StreamType::COUNT],
            cur_volume_db: [None; StreamType::COUNT],
            mute_count: [0; StreamType::COUNT],
            stop_time_ms: [None; StreamType::COUNT],
            strategy_muted_by_device: [false; Strategy::COUNT],
            patch: None,
            direct_open_count: 0,
            direct_session: None,
        }
    }

    pub fn is_duplicated(&self) -> bool {
        matches!(self.kind, OutputKind::Duplicated(..))
    }

    pub fn is_direct(&self) -> bool {
        self.flags.requires_direct()
    }

    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u64, now_ms: u64) -> bool {
        if self.ref_count[stream.index()] != 0 {
            return true;
        }
        if in_past_ms == 0 {
            return false;
        }
        match self.stop_time_ms[stream.index()] {
            Some(stopped) => now_ms.saturating_sub(stopped) < in_past_ms,
            None => false,
        }
    }

    pub fn is_active(&self, in_past_ms: u64, now_ms: u64) -> bool {
        StreamType::ALL
            .iter()
            .any(|s| self.is_stream_active(*s, in_past_ms, now_ms))
    }

    pub fn is_strategy_active(&self, strategy: Strategy, in_past_ms: u64, now_ms: u64) -> bool {
        StreamType::ALL
            .iter()
            .filter(|s| Strategy::for_stream(**s) == strategy)
            .any(|s| self.is_stream_active(*s, in_past_ms, now_ms))
    }

    pub fn is_muted(&self, stream: StreamType) -> bool {
        self.mute_count[stream.index()] > 0
    }

    fn change_own_ref_count(&mut self, stream: StreamType, delta: i32, now_ms: u64) -> Result<u32> {
        let slot = &mut self.ref_count[stream.index()];
        if delta < 0 && (-delta) as u32 > *slot {
            warn!(output = %self.io, %stream, "reference count would go negative");
            return Err(PolicyError::bad_value(format!(
                "reference count underflow for {} on output {}",
                stream, self.io
            )));
        }
        *slot = (*slot as i64 + delta as i64) as u32;
        let count = *slot;
        if delta < 0 && count == 0 {
            self.stop_time_ms[stream.index()] = Some(now_ms);
        }
        trace!(output = %self.io, %stream, count, "reference count changed");
        Ok(count)
    }
}

/// Arena of opened outputs keyed by I/O handle
#[derive(Debug, Clone, Default)]
pub struct OutputCollection {
    slots: BTreeMap<IoHandle, OutputDescriptor>,
}

impl OutputCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: OutputDescriptor) {
        self.slots.insert(desc.io, desc);
    }

    pub fn remove(&mut self, io: IoHandle) -> Option<OutputDescriptor> {
        self.slots.remove(&io)
    }

    pub fn get(&self, io: IoHandle) -> Option<&OutputDescriptor> {
        self.slots.get(&io)
    }

    pub fn get_mut(&mut self, io: IoHandle) -> Option<&mut OutputDescriptor> {
        self.slots.get_mut(&io)
    }

    pub fn contains(&self, io: IoHandle) -> bool {
        self.slots.contains_key(&io)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputDescriptor> {
        self.slots.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutputDescriptor> {
        self.slots.values_mut()
    }

    pub fn handles(&self) -> Vec<IoHandle> {
        self.slots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn by_port(&self, port: PortHandle) -> Option<&OutputDescriptor> {
        self.slots.values().find(|d| d.port_id == port)
    }

    /// Devices the output can ever be routed to
    pub fn supported_devices(&self, io: IoHandle) -> DeviceTypeSet {
        match self.get(io) {
            Some(desc) => match desc.kind {
                OutputKind::Simple => desc.supported_devices.clone(),
                OutputKind::Duplicated(a, b) => self.supported_devices(a).union(&self.supported_devices(b)),
            },
            None => DeviceTypeSet::new(),
        }
    }

    /// Devices the output is currently routed to
    pub fn devices(&self, io: IoHandle) -> DeviceTypeSet {
        match self.get(io) {
            Some(desc) => match desc.kind {
                OutputKind::Simple => desc.devices.clone(),
                OutputKind::Duplicated(a, b) => self.devices(a).union(&self.devices(b)),
            },
            None => DeviceTypeSet::new(),
        }
    }

    pub fn latency(&self, io: IoHandle) -> u32 {
        match self.get(io) {
            Some(desc) => match desc.kind {
                OutputKind::Simple => desc.latency_ms,
                OutputKind::Duplicated(a, b) => self.latency(a).max(self.latency(b)),
            },
            None => 0,
        }
    }

    /// Apply a reference-count change, forwarding it to the sub outputs of a
    /// duplicated output. Returns the new count of the addressed output.
    pub fn change_ref_count(&mut self, io: IoHandle, stream: StreamType, delta: i32, now_ms: u64) -> Result<u32> {
        let kind = self
            .get(io)
            .map(|d| d.kind)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown output {}", io)))?;
        if let OutputKind::Duplicated(a, b) = kind {
            self.change_ref_count(a, stream, delta, now_ms)?;
            self.change_ref_count(b, stream, delta, now_ms)?;
        }
        match self.get_mut(io) {
            Some(desc) => desc.change_own_ref_count(stream, delta, now_ms),
            None => Err(PolicyError::bad_value(format!("unknown output {}", io))),
        }
    }

    /// Modules backing an output, two for a duplicated one
    pub fn modules_of(&self, io: IoHandle) -> Vec<usize> {
        match self.get(io) {
            Some(desc) => match desc.kind {
                OutputKind::Simple => desc.module.into_iter().collect(),
                OutputKind::Duplicated(a, b) => {
                    let mut modules = self.modules_of(a);
                    modules.extend(self.modules_of(b));
                    modules
                }
            },
            None => Vec::new(),
        }
    }

    pub fn shares_hw_module(&self, a: IoHandle, b: IoHandle) -> bool {
        let left = self.modules_of(a);
        self.modules_of(b).iter().any(|m| left.contains(m))
    }

    /// Whether any non-duplicated output has the stream active
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u64, now_ms: u64) -> bool {
        self.slots
            .values()
            .any(|d| !d.is_duplicated() && d.is_stream_active(stream, in_past_ms, now_ms))
    }

    pub fn primary(&self) -> Option<IoHandle> {
        self.slots.values().find(|d| d.flags.primary).map(|d| d.io)
    }

    /// Non-duplicated output able to reach an A2DP device
    pub fn a2dp_output(&self) -> Option<IoHandle> {
        self.slots
            .values()
            .find(|d| !d.is_duplicated() && d.supported_devices.find(DeviceType::is_a2dp).is_some())
            .map(|d| d.io)
    }

    /// Outputs able to reach every requested device
    pub fn outputs_for_devices(&self, devices: &DeviceTypeSet) -> Vec<IoHandle> {
        if devices.is_empty() {
            return Vec::new();
        }
        self.slots
            .keys()
            .copied()
            .filter(|io| devices.is_subset(&self.supported_devices(*io)))
            .collect()
    }

    /// Duplicated outputs using the given output as one of their halves
    pub fn duplicating(&self, io: IoHandle) -> Vec<IoHandle> {
        self.slots
            .values()
            .filter(|d| matches!(d.kind, OutputKind::Duplicated(a, b) if a == io || b == io))
            .map(|d| d.io)
            .collect()
    }
}

/// Capture session attached to an input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSession {
    pub source: AudioSource,
    pub uid: Uid,
    pub open_count: u32,
    pub active_count: u32,
}

/// Runtime state of one opened input stream
#[derive(Debug, Clone)]
pub struct InputDescriptor {
    pub io: IoHandle,
    pub port_id: PortHandle,
    pub module: usize,
    pub profile: ProfileId,
    pub flags: InputFlags,
    pub config: StreamConfig,
    pub device: DeviceType,
    pub address: String,
    pub sessions: BTreeMap<SessionId, InputSession>,
    pub patch: Option<PatchHandle>,
    /// Sessions stopped to let a higher priority capture through
    pub preempted_sessions: Vec<SessionId>,
}

impl InputDescriptor {
    pub fn new(
        io: IoHandle,
        port_id: PortHandle,
        module: usize,
        profile: ProfileId,
        device: DeviceType,
        address: impl Into<String>,
    ) -> Self {
        Self {
            io,
            port_id,
            module,
            profile,
            flags: InputFlags::NONE,
            config: StreamConfig::default(),
            device,
            address: address.into(),
            sessions: BTreeMap::new(),
            patch: None,
            preempted_sessions: Vec::new(),
        }
    }

    pub fn active_count(&self) -> u32 {
        self.sessions.values().map(|s| s.active_count).sum()
    }

    pub fn is_active(&self) -> bool {
        self.active_count() > 0
    }

    pub fn is_virtual(&self) -> bool {
        self.device.is_virtual_input()
    }

    /// Highest priority source among the (active) sessions
    pub fn highest_priority_source(&self, active_only: bool) -> Option<AudioSource> {
        self.sessions
            .values()
            .filter(|s| !active_only || s.active_count > 0)
            .map(|s| s.source)
            .max_by_key(|s| s.priority())
    }

    /// Only hotword capture is running on this input
    pub fn is_hotword_only(&self) -> bool {
        self.is_active()
            && self
                .sessions
                .values()
                .filter(|s| s.active_count > 0)
                .all(|s| s.source == AudioSource::Hotword)
    }

    pub fn is_source_active(&self, source: AudioSource) -> bool {
        self.sessions
            .values()
            .any(|s| s.active_count > 0 && s.source == source)
    }
}

/// Arena of opened inputs keyed by I/O handle
#[derive(Debug, Clone, Default)]
pub struct InputCollection {
    slots: BTreeMap<IoHandle, InputDescriptor>,
}

impl InputCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: InputDescriptor) {
        self.slots.insert(desc.io, desc);
    }

    pub fn remove(&mut self, io: IoHandle) -> Option<InputDescriptor> {
        self.slots.remove(&io)
    }

    pub fn get(&self, io: IoHandle) -> Option<&InputDescriptor> {
        self.slots.get(&io)
    }

    pub fn get_mut(&mut self, io: IoHandle) -> Option<&mut InputDescriptor> {
        self.slots.get_mut(&io)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputDescriptor> {
        self.slots.values()
    }

    pub fn handles(&self) -> Vec<IoHandle> {
        self.slots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn by_port(&self, port: PortHandle) -> Option<&InputDescriptor> {
        self.slots.values().find(|d| d.port_id == port)
    }

    pub fn input_for_session(&self, session: SessionId) -> Option<IoHandle> {
        self.slots
            .values()
            .find(|d| d.sessions.contains_key(&session))
            .map(|d| d.io)
    }

    /// Active inputs, optionally skipping virtual ones
    pub fn active_inputs(&self, ignore_virtual: bool) -> Vec<IoHandle> {
        self.slots
            .values()
            .filter(|d| d.is_active() && !(ignore_virtual && d.is_virtual()))
            .map(|d| d.io)
            .collect()
    }

    pub fn is_source_active(&self, source: AudioSource) -> bool {
        self.slots.values().any(|d| d.is_source_active(source))
    }

    pub fn on_device(&self, device: DeviceType) -> Vec<IoHandle> {
        self.slots
            .values()
            .filter(|d| d.device == device)
            .map(|d| d.io)
            .collect()
    }
}
