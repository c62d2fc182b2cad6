//! Routing strategies and device resolution
//!
//! Every stream type maps statically onto a [`Strategy`]. Devices are
//! resolved per strategy by a pluggable [`Engine`] from an immutable
//! [`EngineContext`] snapshot. Resolved sets are memoised in a
//! [`StrategyCache`] keyed by the state generation they were computed at.

use crate::domain::audio::{
    AudioSource, DeviceType, DeviceTypeSet, ForceUse, ForcedConfig, PhoneState, StreamType,
};
use crate::domain::device::DeviceVector;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of the remote submix that captures media when connected
pub const REMOTE_SUBMIX_MEDIA_ADDRESS: &str = "0";

/// Priority class a stream is routed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Media,
    Phone,
    Sonification,
    SonificationRespectful,
    Dtmf,
    EnforcedAudible,
    TransmittedThroughSpeaker,
    Accessibility,
    Rerouting,
}

impl Strategy {
    pub const COUNT: usize = 9;

    pub const ALL: [Strategy; Strategy::COUNT] = [
        Strategy::Media,
        Strategy::Phone,
        Strategy::Sonification,
        Strategy::SonificationRespectful,
        Strategy::Dtmf,
        Strategy::EnforcedAudible,
        Strategy::TransmittedThroughSpeaker,
        Strategy::Accessibility,
        Strategy::Rerouting,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn for_stream(stream: StreamType) -> Strategy {
        match stream {
            StreamType::VoiceCall | StreamType::BluetoothSco => Strategy::Phone,
            StreamType::Ring | StreamType::Alarm => Strategy::Sonification,
            StreamType::Notification => Strategy::SonificationRespectful,
            StreamType::Dtmf => Strategy::Dtmf,
            StreamType::EnforcedAudible => Strategy::EnforcedAudible,
            StreamType::Tts => Strategy::TransmittedThroughSpeaker,
            StreamType::Accessibility => Strategy::Accessibility,
            StreamType::Rerouting | StreamType::Patch => Strategy::Rerouting,
            StreamType::System | StreamType::Music => Strategy::Media,
        }
    }

    /// Stream types routed by this strategy
    pub fn streams(self) -> impl Iterator<Item = StreamType> {
        StreamType::ALL
            .into_iter()
            .filter(move |s| Strategy::for_stream(*s) == self)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Stream activity as seen by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamActivity {
    pub active: [bool; StreamType::COUNT],
    /// Music played within the respectful-sonification window
    pub music_recently_active: bool,
}

impl StreamActivity {
    pub fn is_active(&self, stream: StreamType) -> bool {
        self.active[stream.index()]
    }
}

/// Immutable view of the state the engine resolves against
#[derive(Debug, Clone, Copy)]
pub struct EngineContext<'a> {
    pub available_outputs: &'a DeviceVector,
    pub available_inputs: &'a DeviceVector,
    pub phone_state: PhoneState,
    pub forced: &'a [ForcedConfig; ForceUse::COUNT],
    pub activity: StreamActivity,
}

impl<'a> EngineContext<'a> {
    pub fn forced(&self, usage: ForceUse) -> ForcedConfig {
        self.forced[usage.index()]
    }

    fn has_output(&self, device: DeviceType) -> bool {
        self.available_outputs.has_type(device)
    }

    fn first_output(&self, candidates: &[DeviceType]) -> Option<DeviceType> {
        candidates.iter().copied().find(|d| self.has_output(*d))
    }

    fn first_input(&self, candidates: &[DeviceType]) -> Option<DeviceType> {
        candidates
            .iter()
            .copied()
            .find(|d| self.available_inputs.has_type(*d))
    }
}

/// Resolves strategies and capture sources to devices
pub trait Engine: Send + Sync {
    fn device_for_strategy(&self, strategy: Strategy, ctx: &EngineContext<'_>) -> DeviceTypeSet;

    fn device_for_input_source(&self, source: AudioSource, ctx: &EngineContext<'_>) -> Option<DeviceType>;
}

/// Built-in routing rules for a phone-like device
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEngine;

impl DefaultEngine {
    pub fn new() -> Self {
        Self
    }

    fn phone(&self, ctx: &EngineContext<'_>) -> DeviceTypeSet {
        use DeviceType::*;
        let forced = ctx.forced(ForceUse::Communication);
        if forced == ForcedConfig::BtSco {
            if let Some(d) = ctx.first_output(&[BluetoothScoCarkit, BluetoothScoHeadset, BluetoothSco]) {
                return DeviceTypeSet::single(d);
            }
        }
        if forced == ForcedConfig::Speaker {
            if let Some(d) = ctx.first_output(&[Speaker]) {
                return DeviceTypeSet::single(d);
            }
        }
        let mut candidates = vec![WiredHeadphone, WiredHeadset, UsbHeadset, UsbDevice];
        if forced != ForcedConfig::Speaker {
            candidates.push(Earpiece);
        }
        candidates.push(Speaker);
        ctx.first_output(&candidates)
            .map(DeviceTypeSet::single)
            .unwrap_or_default()
    }

    fn media(&self, ctx: &EngineContext<'_>) -> DeviceTypeSet {
        use DeviceType::*;
        if ctx.phone_state.is_in_call() {
            return self.phone(ctx);
        }
        if ctx
            .available_outputs
            .find(RemoteSubmix, REMOTE_SUBMIX_MEDIA_ADDRESS)
            .is_some_and(|d| d.address == REMOTE_SUBMIX_MEDIA_ADDRESS)
        {
            return DeviceTypeSet::single(RemoteSubmix);
        }
        if ctx.forced(ForceUse::Media) == ForcedConfig::Speaker && ctx.has_output(Speaker) {
            return DeviceTypeSet::single(Speaker);
        }
        let mut candidates = Vec::new();
        if ctx.forced(ForceUse::Media) != ForcedConfig::NoBtA2dp {
            candidates.extend([BluetoothA2dp, BluetoothA2dpHeadphones, BluetoothA2dpSpeaker]);
        }
        candidates.extend([WiredHeadphone, WiredHeadset, Line, UsbHeadset, UsbAccessory, UsbDevice, Hdmi]);
        match ctx.forced(ForceUse::Dock) {
            ForcedConfig::AnalogDock => candidates.push(AnalogDockHeadset),
            ForcedConfig::DigitalDock => candidates.push(DigitalDockHeadset),
            _ => {}
        }
        candidates.push(Speaker);
        ctx.first_output(&candidates)
            .map(DeviceTypeSet::single)
            .unwrap_or_default()
    }

    fn sonification(&self, ctx: &EngineContext<'_>) -> DeviceTypeSet {
        if ctx.phone_state.is_in_call() {
            return self.phone(ctx);
        }
        let mut devices = DeviceTypeSet::new();
        if ctx.has_output(DeviceType::Speaker) {
            devices.insert(DeviceType::Speaker);
        }
        let media = self.media(ctx);
        if media.iter().any(|d| d.is_in_ear() || d.is_sco()) || devices.is_empty() {
            devices.extend(&media);
        }
        devices
    }

    fn enforced_audible(&self, ctx: &EngineContext<'_>) -> DeviceTypeSet {
        let enforced = ctx.forced(ForceUse::System) == ForcedConfig::SystemEnforced;
        let mut devices = self.sonification(ctx);
        if enforced && ctx.has_output(DeviceType::Speaker) {
            devices.insert(DeviceType::Speaker);
        }
        devices
    }
}

impl Engine for DefaultEngine {
    fn device_for_strategy(&self, strategy: Strategy, ctx: &EngineContext<'_>) -> DeviceTypeSet {
        match strategy {
            Strategy::Phone => self.phone(ctx),
            Strategy::Media => self.media(ctx),
            Strategy::Sonification => self.sonification(ctx),
            Strategy::SonificationRespectful => {
                if ctx.activity.music_recently_active && !ctx.phone_state.is_in_call() {
                    self.media(ctx)
                } else {
                    self.sonification(ctx)
                }
            }
            Strategy::EnforcedAudible => self.enforced_audible(ctx),
            Strategy::Dtmf => {
                if ctx.phone_state.is_in_call() {
                    self.phone(ctx)
                } else {
                    self.media(ctx)
                }
            }
            Strategy::Accessibility | Strategy::Rerouting => {
                if ctx.phone_state.is_in_call() || ctx.phone_state == PhoneState::Ringtone {
                    self.phone(ctx)
                } else {
                    self.media(ctx)
                }
            }
            Strategy::TransmittedThroughSpeaker => {
                if ctx.activity.is_active(StreamType::Tts) && ctx.has_output(DeviceType::Speaker) {
                    DeviceTypeSet::single(DeviceType::Speaker)
                } else {
                    DeviceTypeSet::new()
                }
            }
        }
    }

    fn device_for_input_source(&self, source: AudioSource, ctx: &EngineContext<'_>) -> Option<DeviceType> {
        use DeviceType::*;
        match source {
            AudioSource::VoiceUplink | AudioSource::VoiceDownlink | AudioSource::VoiceCall => {
                ctx.first_input(&[TelephonyRx])
            }
            AudioSource::RemoteSubmix => ctx.first_input(&[RemoteSubmixIn]),
            AudioSource::FmTuner => ctx.first_input(&[FmTuner]),
            AudioSource::Camcorder => ctx.first_input(&[BackMic, BuiltinMic]),
            AudioSource::VoiceCommunication => match ctx.forced(ForceUse::Communication) {
                ForcedConfig::BtSco => ctx.first_input(&[BluetoothScoHeadsetMic, WiredHeadsetMic, UsbDeviceIn, BuiltinMic]),
                ForcedConfig::Speaker => ctx.first_input(&[BackMic, BuiltinMic]),
                _ => ctx.first_input(&[WiredHeadsetMic, UsbHeadsetIn, UsbDeviceIn, BuiltinMic]),
            },
            AudioSource::Default
            | AudioSource::Mic
            | AudioSource::VoiceRecognition
            | AudioSource::Unprocessed
            | AudioSource::Hotword => {
                if ctx.forced(ForceUse::Record) == ForcedConfig::BtSco {
                    if let Some(d) = ctx.first_input(&[BluetoothScoHeadsetMic]) {
                        return Some(d);
                    }
                }
                ctx.first_input(&[WiredHeadsetMic, UsbHeadsetIn, UsbDeviceIn, BuiltinMic])
            }
        }
    }
}

/// Per-strategy device sets memoised at a state generation
///
/// `lookup` only answers for the generation the entries were committed at.
/// `committed` always returns the last committed set and is how callers
/// compare a previous settled routing against a freshly computed one.
#[derive(Debug, Clone, Default)]
pub struct StrategyCache {
    entries: [DeviceTypeSet; Strategy::COUNT],
    generation: Option<u64>,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, strategy: Strategy, generation: u64) -> Option<&DeviceTypeSet> {
        (self.generation == Some(generation)).then(|| &self.entries[strategy.index()])
    }

    pub fn committed(&self, strategy: Strategy) -> &DeviceTypeSet {
        &self.entries[strategy.index()]
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn commit(&mut self, entries: [DeviceTypeSet; Strategy::COUNT], generation: u64) {
        self.entries = entries;
        self.generation = Some(generation);
    }
}
