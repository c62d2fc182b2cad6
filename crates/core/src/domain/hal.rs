//! Boundary to the hardware abstraction layer
//!
//! The policy never touches audio hardware itself. Every side effect goes
//! through a [`HalClient`]: opening and closing streams, enacting patches,
//! writing volumes and exchanging `key=value` parameter strings.

use crate::domain::audio::{
    AudioFormat, AudioSource, ChannelMask, DeviceType, DeviceTypeSet, HalPatchHandle, InputFlags,
    IoHandle, ModuleHandle, OutputFlags, PolicyError, SessionId, StreamConfig, StreamType,
};
use crate::domain::patch::{AudioPatch, PortConfig};
use std::fmt;
use thiserror::Error;

pub const KEY_ROUTING: &str = "routing";
pub const KEY_SUP_SAMPLING_RATES: &str = "sup_sampling_rates";
pub const KEY_SUP_FORMATS: &str = "sup_formats";
pub const KEY_SUP_CHANNELS: &str = "sup_channels";
pub const KEY_A2DP_SUSPENDED: &str = "A2dpSuspended";
pub const KEY_DEVICE_CONNECT: &str = "connect";
pub const KEY_DEVICE_DISCONNECT: &str = "disconnect";
pub const KEY_ADDRESS: &str = "address";
pub const KEY_CLOSING: &str = "closing";

/// Errors reported by a hardware client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Patch failed: {0}")]
    PatchFailed(String),

    #[error("Unknown handle: {0}")]
    UnknownHandle(u32),

    #[error("Rejected: {0}")]
    Rejected(String),
}

pub type HalResult<T> = std::result::Result<T, HalError>;

impl From<HalError> for PolicyError {
    fn from(err: HalError) -> Self {
        PolicyError::HardwareFailure(err.to_string())
    }
}

/// Parameters of an output open request
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRequest {
    pub devices: DeviceTypeSet,
    pub address: String,
    pub config: StreamConfig,
    pub flags: OutputFlags,
}

/// What the hardware actually opened
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenedOutput {
    pub config: StreamConfig,
    pub latency_ms: u32,
}

/// Parameters of an input open request
#[derive(Debug, Clone, PartialEq)]
pub struct InputRequest {
    pub device: DeviceType,
    pub address: String,
    pub config: StreamConfig,
    pub flags: InputFlags,
    pub source: AudioSource,
}

/// Hardware side of the policy
pub trait HalClient: Send {
    fn load_hw_module(&mut self, name: &str) -> HalResult<ModuleHandle>;

    fn open_output(&mut self, module: ModuleHandle, io: IoHandle, request: &OutputRequest) -> HalResult<OpenedOutput>;

    /// Mix written to two already opened outputs
    fn open_duplicate_output(&mut self, io: IoHandle, first: IoHandle, second: IoHandle) -> HalResult<()>;

    fn close_output(&mut self, io: IoHandle) -> HalResult<()>;

    fn open_input(&mut self, module: ModuleHandle, io: IoHandle, request: &InputRequest) -> HalResult<StreamConfig>;

    fn close_input(&mut self, io: IoHandle) -> HalResult<()>;

    /// Enact a patch, replacing `existing` when given
    fn create_audio_patch(
        &mut self,
        patch: &AudioPatch,
        existing: Option<HalPatchHandle>,
        delay_ms: u32,
    ) -> HalResult<HalPatchHandle>;

    fn release_audio_patch(&mut self, handle: HalPatchHandle, delay_ms: u32) -> HalResult<()>;

    fn set_audio_port_config(&mut self, config: &PortConfig) -> HalResult<()>;

    fn set_parameters(&mut self, io: Option<IoHandle>, params: &str, delay_ms: u32) -> HalResult<()>;

    /// Read `key=value` pairs; values of list keys are separated by `|`
    fn get_parameters(&mut self, io: Option<IoHandle>, keys: &str) -> HalResult<String>;

    fn set_stream_volume(&mut self, stream: StreamType, amplitude: f32, io: IoHandle, delay_ms: u32) -> HalResult<()>;

    fn set_voice_volume(&mut self, volume: f32, delay_ms: u32) -> HalResult<()>;

    /// Ask clients of a stream type to reconnect so they pick up a new output
    fn invalidate_stream(&mut self, stream: StreamType) -> HalResult<()>;

    fn move_effects(&mut self, session: SessionId, from: IoHandle, to: IoHandle) -> HalResult<()>;

    fn suspend_output(&mut self, io: IoHandle) -> HalResult<()>;

    fn restore_output(&mut self, io: IoHandle) -> HalResult<()>;

    /// Module implements native device-to-device patches
    fn supports_device_patches(&self, module: ModuleHandle) -> bool;
}

/// Ordered `key=value;key=value` list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterString {
    pairs: Vec<(String, String)>,
}

impl ParameterString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        let pairs = raw
            .split(';')
            .filter(|kv| !kv.trim().is_empty())
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (kv.trim().to_string(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `|` separated values of a key, skipping entries that fail to parse
    pub fn get_list<T: std::str::FromStr>(&self, key: &str) -> Vec<T> {
        self.get(key)
            .map(|v| v.split('|').filter_map(|item| item.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for ParameterString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", joined.join(";"))
    }
}

/// Capabilities reported by the hardware for an open stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedCaps {
    pub sample_rates: Vec<u32>,
    pub formats: Vec<AudioFormat>,
    pub channel_masks: Vec<ChannelMask>,
}

impl ReportedCaps {
    pub fn from_reply(reply: &str) -> Self {
        let params = ParameterString::parse(reply);
        Self {
            sample_rates: params.get_list(KEY_SUP_SAMPLING_RATES),
            formats: params.get_list(KEY_SUP_FORMATS),
            channel_masks: params.get_list(KEY_SUP_CHANNELS),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Minimal in-crate hardware client for manager unit tests

    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    pub struct FakeHal {
        next_module: u32,
        next_patch: u32,
        pub patches: BTreeMap<HalPatchHandle, AudioPatch>,
        pub patch_calls: u32,
        pub released: Vec<HalPatchHandle>,
        pub open_outputs: Vec<IoHandle>,
        pub open_inputs: Vec<IoHandle>,
        pub volumes: Vec<(StreamType, f32, IoHandle)>,
        pub invalidated: Vec<StreamType>,
        pub parameters: Vec<(Option<IoHandle>, String)>,
        pub caps_reply: String,
        pub fail_open_for: Option<DeviceType>,
        pub legacy_modules: bool,
    }

    impl HalClient for FakeHal {
        fn load_hw_module(&mut self, _name: &str) -> HalResult<ModuleHandle> {
            self.next_module += 1;
            Ok(ModuleHandle(self.next_module * 10))
        }

        fn open_output(&mut self, _module: ModuleHandle, io: IoHandle, request: &OutputRequest) -> HalResult<OpenedOutput> {
            if let Some(device) = self.fail_open_for {
                if request.devices.contains(device) {
                    return Err(HalError::OpenFailed(device.to_string()));
                }
            }
            self.open_outputs.push(io);
            Ok(OpenedOutput {
                config: request.config,
                latency_ms: 20,
            })
        }

        fn open_duplicate_output(&mut self, io: IoHandle, _first: IoHandle, _second: IoHandle) -> HalResult<()> {
            self.open_outputs.push(io);
            Ok(())
        }

        fn close_output(&mut self, io: IoHandle) -> HalResult<()> {
            self.open_outputs.retain(|o| *o != io);
            Ok(())
        }

        fn open_input(&mut self, _module: ModuleHandle, io: IoHandle, request: &InputRequest) -> HalResult<StreamConfig> {
            self.open_inputs.push(io);
            Ok(request.config)
        }

        fn close_input(&mut self, io: IoHandle) -> HalResult<()> {
            self.open_inputs.retain(|i| *i != io);
            Ok(())
        }

        fn create_audio_patch(
            &mut self,
            patch: &AudioPatch,
            existing: Option<HalPatchHandle>,
            _delay_ms: u32,
        ) -> HalResult<HalPatchHandle> {
            self.patch_calls += 1;
            let handle = match existing {
                Some(h) => h,
                None => {
                    self.next_patch += 1;
                    HalPatchHandle(self.next_patch)
                }
            };
            self.patches.insert(handle, patch.clone());
            Ok(handle)
        }

        fn release_audio_patch(&mut self, handle: HalPatchHandle, _delay_ms: u32) -> HalResult<()> {
            self.patches
                .remove(&handle)
                .map(|_| self.released.push(handle))
                .ok_or(HalError::UnknownHandle(handle.0))
        }

        fn set_audio_port_config(&mut self, _config: &PortConfig) -> HalResult<()> {
            Ok(())
        }

        fn set_parameters(&mut self, io: Option<IoHandle>, params: &str, _delay_ms: u32) -> HalResult<()> {
            self.parameters.push((io, params.to_string()));
            Ok(())
        }

        fn get_parameters(&mut self, _io: Option<IoHandle>, _keys: &str) -> HalResult<String> {
            Ok(self.caps_reply.clone())
        }

        fn set_stream_volume(&mut self, stream: StreamType, amplitude: f32, io: IoHandle, _delay_ms: u32) -> HalResult<()> {
            self.volumes.push((stream, amplitude, io));
            Ok(())
        }

        fn set_voice_volume(&mut self, _volume: f32, _delay_ms: u32) -> HalResult<()> {
            Ok(())
        }

        fn invalidate_stream(&mut self, stream: StreamType) -> HalResult<()> {
            self.invalidated.push(stream);
            Ok(())
        }

        fn move_effects(&mut self, _session: SessionId, _from: IoHandle, _to: IoHandle) -> HalResult<()> {
            Ok(())
        }

        fn suspend_output(&mut self, _io: IoHandle) -> HalResult<()> {
            Ok(())
        }

        fn restore_output(&mut self, _io: IoHandle) -> HalResult<()> {
            Ok(())
        }

        fn supports_device_patches(&self, _module: ModuleHandle) -> bool {
            !self.legacy_modules
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_string_roundtrip() {
        let mut params = ParameterString::new();
        params.add(KEY_ROUTING, "Speaker").add(KEY_A2DP_SUSPENDED, "true");
        assert_eq!(params.to_string(), "routing=Speaker;A2dpSuspended=true");

        let parsed = ParameterString::parse("routing=Speaker; A2dpSuspended=true;");
        assert_eq!(parsed.get(KEY_A2DP_SUSPENDED), Some("true"));
        assert_eq!(parsed.get("missing"), None);
    }

    #[test]
    fn test_reported_caps() {
        let caps = ReportedCaps::from_reply("sup_sampling_rates=44100|48000;sup_formats=pcm_16|bogus;sup_channels=stereo|5.1");
        assert_eq!(caps.sample_rates, vec![44100, 48000]);
        assert_eq!(caps.formats, vec![AudioFormat::Pcm16]);
        assert_eq!(caps.channel_masks, vec![ChannelMask::Stereo, ChannelMask::Surround5_1]);
    }

    #[test]
    fn test_hal_error_maps_to_hardware_failure() {
        let err: PolicyError = HalError::OpenFailed("hdmi".into()).into();
        assert!(matches!(err, PolicyError::HardwareFailure(_)));
    }
}
