//! Recording hardware client

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use switchyard_core::domain::audio::{
    AudioSource, DeviceType, DeviceTypeSet, HalPatchHandle, IoHandle, ModuleHandle, OutputFlags, PortHandle,
    SessionId, StreamConfig, StreamType,
};
use switchyard_core::domain::hal::{
    HalClient, HalError, HalResult, InputRequest, OpenedOutput, OutputRequest,
};
use switchyard_core::domain::patch::{AudioPatch, PortConfig};
use tracing::{debug, trace};

/// Output latency reported when none is scripted
pub const DEFAULT_LATENCY_MS: u32 = 20;

/// One request received from the policy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum HalCall {
    LoadModule {
        name: String,
        module: ModuleHandle,
    },
    OpenOutput {
        io: IoHandle,
        devices: DeviceTypeSet,
        flags: OutputFlags,
    },
    OpenDuplicateOutput {
        io: IoHandle,
        first: IoHandle,
        second: IoHandle,
    },
    CloseOutput {
        io: IoHandle,
    },
    OpenInput {
        io: IoHandle,
        device: DeviceType,
        source: AudioSource,
    },
    CloseInput {
        io: IoHandle,
    },
    CreatePatch {
        handle: HalPatchHandle,
        sources: DeviceTypeSet,
        sinks: DeviceTypeSet,
        bridge: bool,
        delay_ms: u32,
    },
    ReleasePatch {
        handle: HalPatchHandle,
        delay_ms: u32,
    },
    SetPortConfig {
        port: PortHandle,
        gain_db: Option<f32>,
    },
    SetParameters {
        io: Option<IoHandle>,
        params: String,
        delay_ms: u32,
    },
    GetParameters {
        io: Option<IoHandle>,
        keys: String,
    },
    SetStreamVolume {
        stream: StreamType,
        amplitude: f32,
        io: IoHandle,
        delay_ms: u32,
    },
    SetVoiceVolume {
        volume: f32,
        delay_ms: u32,
    },
    InvalidateStream {
        stream: StreamType,
    },
    MoveEffects {
        session: SessionId,
        from: IoHandle,
        to: IoHandle,
    },
    SuspendOutput {
        io: IoHandle,
    },
    RestoreOutput {
        io: IoHandle,
    },
}

/// A hardware client that accepts requests and records them
#[derive(Debug)]
pub struct RecordingHal {
    calls: Vec<HalCall>,
    next_module: u32,
    next_patch: u32,
    modules: HashMap<String, ModuleHandle>,
    /// Device each open stream was opened on
    streams: BTreeMap<IoHandle, DeviceTypeSet>,
    patches: BTreeMap<HalPatchHandle, AudioPatch>,
    latency_ms: u32,
    caps: HashMap<DeviceType, String>,
    fail_open: HashSet<DeviceType>,
    fail_patches: bool,
    missing_modules: HashSet<String>,
    device_patches: bool,
}

impl Default for RecordingHal {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingHal {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            next_module: 0,
            next_patch: 0,
            modules: HashMap::new(),
            streams: BTreeMap::new(),
            patches: BTreeMap::new(),
            latency_ms: DEFAULT_LATENCY_MS,
            caps: HashMap::new(),
            fail_open: HashSet::new(),
            fail_patches: false,
            missing_modules: HashSet::new(),
            device_patches: true,
        }
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Latency reported for every output opened from now on
    pub fn with_latency(mut self, latency_ms: u32) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Capability reply for streams opened on `device`, in the
    /// `sup_*=a|b;...` form
    pub fn script_caps(&mut self, device: DeviceType, reply: impl Into<String>) {
        self.caps.insert(device, reply.into());
    }

    /// Refuse to open streams reaching `device`
    pub fn fail_open(&mut self, device: DeviceType) {
        self.fail_open.insert(device);
    }

    pub fn clear_failures(&mut self) {
        self.fail_open.clear();
        self.fail_patches = false;
    }

    pub fn fail_patches(&mut self, fail: bool) {
        self.fail_patches = fail;
    }

    /// Pretend a module is not present in the hardware
    pub fn remove_module(&mut self, name: impl Into<String>) {
        self.missing_modules.insert(name.into());
    }

    /// Whether modules can connect two devices natively
    pub fn set_device_patches(&mut self, supported: bool) {
        self.device_patches = supported;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn calls(&self) -> &[HalCall] {
        &self.calls
    }

    /// Drain the log, e.g. between scenario steps
    pub fn take_calls(&mut self) -> Vec<HalCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn count(&self, pred: impl Fn(&HalCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn open_streams(&self) -> Vec<IoHandle> {
        self.streams.keys().copied().collect()
    }

    pub fn is_open(&self, io: IoHandle) -> bool {
        self.streams.contains_key(&io)
    }

    pub fn live_patches(&self) -> impl Iterator<Item = &AudioPatch> {
        self.patches.values()
    }

    /// Last amplitude written for a stream on an output
    pub fn last_volume(&self, stream: StreamType, io: IoHandle) -> Option<f32> {
        self.calls.iter().rev().find_map(|c| match c {
            HalCall::SetStreamVolume {
                stream: s,
                amplitude,
                io: i,
                ..
            } if *s == stream && *i == io => Some(*amplitude),
            _ => None,
        })
    }

    /// Parameters strings sent, in order
    pub fn parameters(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                HalCall::SetParameters { params, .. } => Some(params.as_str()),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, call: HalCall) {
        trace!(?call, "HAL call");
        self.calls.push(call);
    }

    fn check_open(&self, devices: &DeviceTypeSet) -> HalResult<()> {
        match devices.iter().find(|d| self.fail_open.contains(d)) {
            Some(device) => Err(HalError::OpenFailed(device.to_string())),
            None => Ok(()),
        }
    }
}

impl HalClient for RecordingHal {
    fn load_hw_module(&mut self, name: &str) -> HalResult<ModuleHandle> {
        if self.missing_modules.contains(name) {
            return Err(HalError::ModuleNotFound(name.to_string()));
        }
        let module = match self.modules.get(name) {
            Some(handle) => *handle,
            None => {
                self.next_module += 1;
                let handle = ModuleHandle(self.next_module * 10);
                self.modules.insert(name.to_string(), handle);
                handle
            }
        };
        self.record(HalCall::LoadModule {
            name: name.to_string(),
            module,
        });
        Ok(module)
    }

    fn open_output(&mut self, _module: ModuleHandle, io: IoHandle, request: &OutputRequest) -> HalResult<OpenedOutput> {
        self.check_open(&request.devices)?;
        self.record(HalCall::OpenOutput {
            io,
            devices: request.devices.clone(),
            flags: request.flags,
        });
        self.streams.insert(io, request.devices.clone());
        debug!(output = %io, devices = %request.devices, "Output opened");
        Ok(OpenedOutput {
            config: request.config,
            latency_ms: self.latency_ms,
        })
    }

    fn open_duplicate_output(&mut self, io: IoHandle, first: IoHandle, second: IoHandle) -> HalResult<()> {
        if !self.is_open(first) || !self.is_open(second) {
            return Err(HalError::UnknownHandle(io.0));
        }
        let devices = self.streams[&first].union(&self.streams[&second]);
        self.record(HalCall::OpenDuplicateOutput { io, first, second });
        self.streams.insert(io, devices);
        Ok(())
    }

    fn close_output(&mut self, io: IoHandle) -> HalResult<()> {
        self.streams.remove(&io).ok_or(HalError::UnknownHandle(io.0))?;
        self.record(HalCall::CloseOutput { io });
        Ok(())
    }

    fn open_input(&mut self, _module: ModuleHandle, io: IoHandle, request: &InputRequest) -> HalResult<StreamConfig> {
        let devices = DeviceTypeSet::single(request.device);
        self.check_open(&devices)?;
        self.record(HalCall::OpenInput {
            io,
            device: request.device,
            source: request.source,
        });
        self.streams.insert(io, devices);
        Ok(request.config)
    }

    fn close_input(&mut self, io: IoHandle) -> HalResult<()> {
        self.streams.remove(&io).ok_or(HalError::UnknownHandle(io.0))?;
        self.record(HalCall::CloseInput { io });
        Ok(())
    }

    fn create_audio_patch(
        &mut self,
        patch: &AudioPatch,
        existing: Option<HalPatchHandle>,
        delay_ms: u32,
    ) -> HalResult<HalPatchHandle> {
        if self.fail_patches {
            return Err(HalError::PatchFailed(patch.handle.to_string()));
        }
        let handle = match existing.filter(|h| self.patches.contains_key(h)) {
            Some(h) => h,
            None => {
                self.next_patch += 1;
                HalPatchHandle(self.next_patch)
            }
        };
        self.record(HalCall::CreatePatch {
            handle,
            sources: patch.source_devices(),
            sinks: patch.sink_devices(),
            bridge: patch.is_bridge(),
            delay_ms,
        });
        self.patches.insert(handle, patch.clone());
        Ok(handle)
    }

    fn release_audio_patch(&mut self, handle: HalPatchHandle, delay_ms: u32) -> HalResult<()> {
        self.patches.remove(&handle).ok_or(HalError::UnknownHandle(handle.0))?;
        self.record(HalCall::ReleasePatch { handle, delay_ms });
        Ok(())
    }

    fn set_audio_port_config(&mut self, config: &PortConfig) -> HalResult<()> {
        self.record(HalCall::SetPortConfig {
            port: config.id,
            gain_db: config.gain_db,
        });
        Ok(())
    }

    fn set_parameters(&mut self, io: Option<IoHandle>, params: &str, delay_ms: u32) -> HalResult<()> {
        self.record(HalCall::SetParameters {
            io,
            params: params.to_string(),
            delay_ms,
        });
        Ok(())
    }

    fn get_parameters(&mut self, io: Option<IoHandle>, keys: &str) -> HalResult<String> {
        self.record(HalCall::GetParameters {
            io,
            keys: keys.to_string(),
        });
        let reply = io
            .and_then(|io| self.streams.get(&io))
            .and_then(|devices| devices.iter().find_map(|d| self.caps.get(&d)))
            .cloned()
            .unwrap_or_default();
        Ok(reply)
    }

    fn set_stream_volume(&mut self, stream: StreamType, amplitude: f32, io: IoHandle, delay_ms: u32) -> HalResult<()> {
        self.record(HalCall::SetStreamVolume {
            stream,
            amplitude,
            io,
            delay_ms,
        });
        Ok(())
    }

    fn set_voice_volume(&mut self, volume: f32, delay_ms: u32) -> HalResult<()> {
        self.record(HalCall::SetVoiceVolume { volume, delay_ms });
        Ok(())
    }

    fn invalidate_stream(&mut self, stream: StreamType) -> HalResult<()> {
        self.record(HalCall::InvalidateStream { stream });
        Ok(())
    }

    fn move_effects(&mut self, session: SessionId, from: IoHandle, to: IoHandle) -> HalResult<()> {
        self.record(HalCall::MoveEffects { session, from, to });
        Ok(())
    }

    fn suspend_output(&mut self, io: IoHandle) -> HalResult<()> {
        self.record(HalCall::SuspendOutput { io });
        Ok(())
    }

    fn restore_output(&mut self, io: IoHandle) -> HalResult<()> {
        self.record(HalCall::RestoreOutput { io });
        Ok(())
    }

    fn supports_device_patches(&self, _module: ModuleHandle) -> bool {
        self.device_patches
    }
}
