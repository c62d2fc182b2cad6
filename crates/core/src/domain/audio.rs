//! Audio primitives shared by every policy component
//!
//! This module defines the vocabulary of the routing engine: device types,
//! stream types, input sources, formats, forced-use settings and the handle
//! types used to identify live objects. Nothing in here holds runtime state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors returned by the policy engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Malformed request: unknown device, invalid patch shape, index out of range
    #[error("Bad value: {0}")]
    BadValue(String),

    /// Valid request that is currently disallowed
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A resource could not be allocated
    #[error("No memory: {0}")]
    NoMemory(String),

    /// The hardware client refused or failed a request
    #[error("Hardware failure: {0}")]
    HardwareFailure(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

impl PolicyError {
    pub fn bad_value(msg: impl Into<String>) -> Self {
        PolicyError::BadValue(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        PolicyError::InvalidOperation(msg.into())
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn id(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(
    /// Handle of an opened output or input stream
    IoHandle
);
handle_type!(
    /// Process-local handle of an audio patch
    PatchHandle
);
handle_type!(
    /// Identifier of an audio port (device or mix) exposed for introspection
    PortHandle
);
handle_type!(
    /// Handle of a loaded hardware module
    ModuleHandle
);
handle_type!(
    /// Opaque patch handle returned by the hardware client
    HalPatchHandle
);
handle_type!(
    /// Audio session identifier
    SessionId
);

impl SessionId {
    /// Session used for effects attached to the output mix
    pub const OUTPUT_MIX: SessionId = SessionId(0);
}

/// User id of a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    /// Uid of the policy engine itself; patches it owns are not user pinned
    pub const SYSTEM: Uid = Uid(1000);
}

/// Allocator of process-unique, monotonically increasing handles
///
/// One counter serves ports, patches and I/O handles so that no value is ever
/// handed out twice for different live objects.
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    next: u32,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    fn bump(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn next_io(&mut self) -> IoHandle {
        IoHandle(self.bump())
    }

    pub fn next_patch(&mut self) -> PatchHandle {
        PatchHandle(self.bump())
    }

    pub fn next_port(&mut self) -> PortHandle {
        PortHandle(self.bump())
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Direction of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Output,
    Input,
}

/// Coarse device classification used to select a volume curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Headset,
    Speaker,
    Earpiece,
    ExtMedia,
}

impl DeviceCategory {
    pub const ALL: [DeviceCategory; 4] = [
        DeviceCategory::Headset,
        DeviceCategory::Speaker,
        DeviceCategory::Earpiece,
        DeviceCategory::ExtMedia,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Type of a hardware endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    // Output devices
    Earpiece,
    Speaker,
    SpeakerSafe,
    WiredHeadset,
    WiredHeadphone,
    BluetoothSco,
    BluetoothScoHeadset,
    BluetoothScoCarkit,
    BluetoothA2dp,
    BluetoothA2dpHeadphones,
    BluetoothA2dpSpeaker,
    Hdmi,
    AnalogDockHeadset,
    DigitalDockHeadset,
    UsbAccessory,
    UsbDevice,
    UsbHeadset,
    RemoteSubmix,
    TelephonyTx,
    Line,
    Bus,
    // Input devices
    BuiltinMic,
    BackMic,
    WiredHeadsetMic,
    BluetoothScoHeadsetMic,
    UsbDeviceIn,
    UsbHeadsetIn,
    TelephonyRx,
    RemoteSubmixIn,
    FmTuner,
    LineIn,
    BusIn,
}

impl DeviceType {
    pub fn direction(self) -> Direction {
        use DeviceType::*;
        match self {
            BuiltinMic | BackMic | WiredHeadsetMic | BluetoothScoHeadsetMic | UsbDeviceIn
            | UsbHeadsetIn | TelephonyRx | RemoteSubmixIn | FmTuner | LineIn | BusIn => {
                Direction::Input
            }
            _ => Direction::Output,
        }
    }

    pub fn is_output(self) -> bool {
        self.direction() == Direction::Output
    }

    pub fn is_input(self) -> bool {
        self.direction() == Direction::Input
    }

    /// Device types that may exist as several simultaneous instances, told
    /// apart by their address
    pub fn distinguishes_on_address(self) -> bool {
        use DeviceType::*;
        matches!(
            self,
            RemoteSubmix | RemoteSubmixIn | Bus | BusIn | UsbDevice | UsbHeadset | UsbAccessory
                | UsbDeviceIn | UsbHeadsetIn
        )
    }

    pub fn is_a2dp(self) -> bool {
        matches!(
            self,
            DeviceType::BluetoothA2dp
                | DeviceType::BluetoothA2dpHeadphones
                | DeviceType::BluetoothA2dpSpeaker
        )
    }

    pub fn is_sco(self) -> bool {
        matches!(
            self,
            DeviceType::BluetoothSco
                | DeviceType::BluetoothScoHeadset
                | DeviceType::BluetoothScoCarkit
        )
    }

    /// Software endpoints that do not compete with physical capture devices
    pub fn is_virtual_input(self) -> bool {
        matches!(self, DeviceType::RemoteSubmixIn | DeviceType::TelephonyRx | DeviceType::FmTuner)
    }

    /// Devices on which ringtones and notifications are attenuated to protect
    /// the listener's ears
    pub fn is_in_ear(self) -> bool {
        matches!(
            self,
            DeviceType::BluetoothA2dp
                | DeviceType::BluetoothA2dpHeadphones
                | DeviceType::WiredHeadset
                | DeviceType::WiredHeadphone
                | DeviceType::UsbHeadset
        )
    }

    pub fn category(self) -> DeviceCategory {
        use DeviceType::*;
        match self {
            Earpiece => DeviceCategory::Earpiece,
            WiredHeadset | WiredHeadphone | BluetoothSco | BluetoothScoHeadset | BluetoothA2dp
            | BluetoothA2dpHeadphones | UsbHeadset => DeviceCategory::Headset,
            Line | Hdmi | UsbDevice => DeviceCategory::ExtMedia,
            _ => DeviceCategory::Speaker,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered set of device types, the unit in which routing decisions are made
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTypeSet(BTreeSet<DeviceType>);

impl DeviceTypeSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn single(device: DeviceType) -> Self {
        let mut set = Self::new();
        set.insert(device);
        set
    }

    pub fn insert(&mut self, device: DeviceType) -> bool {
        self.0.insert(device)
    }

    pub fn remove(&mut self, device: DeviceType) -> bool {
        self.0.remove(&device)
    }

    pub fn contains(&self, device: DeviceType) -> bool {
        self.0.contains(&device)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceType> + '_ {
        self.0.iter().copied()
    }

    pub fn first(&self) -> Option<DeviceType> {
        self.0.iter().next().copied()
    }

    pub fn intersection(&self, other: &DeviceTypeSet) -> DeviceTypeSet {
        self.0.intersection(&other.0).copied().collect()
    }

    pub fn union(&self, other: &DeviceTypeSet) -> DeviceTypeSet {
        self.0.union(&other.0).copied().collect()
    }

    pub fn intersects(&self, other: &DeviceTypeSet) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }

    pub fn is_subset(&self, other: &DeviceTypeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn extend(&mut self, other: &DeviceTypeSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// First type of the set matching the predicate
    pub fn find(&self, pred: impl Fn(DeviceType) -> bool) -> Option<DeviceType> {
        self.iter().find(|d| pred(*d))
    }
}

impl FromIterator<DeviceType> for DeviceTypeSet {
    fn from_iter<I: IntoIterator<Item = DeviceType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for DeviceTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Logical stream type of a playback client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
    BluetoothSco,
    EnforcedAudible,
    Dtmf,
    Tts,
    Accessibility,
    Rerouting,
    Patch,
}

impl StreamType {
    pub const COUNT: usize = 13;

    pub const ALL: [StreamType; StreamType::COUNT] = [
        StreamType::VoiceCall,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
        StreamType::BluetoothSco,
        StreamType::EnforcedAudible,
        StreamType::Dtmf,
        StreamType::Tts,
        StreamType::Accessibility,
        StreamType::Rerouting,
        StreamType::Patch,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Streams whose volume a user may bring down to silence
    pub fn can_be_muted(self) -> bool {
        !matches!(self, StreamType::Rerouting | StreamType::Patch)
    }

    /// Streams that are muted rather than replaced by a tone while in call
    pub fn is_low_visibility(self) -> bool {
        matches!(
            self,
            StreamType::System | StreamType::Dtmf | StreamType::Notification | StreamType::Ring
        )
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Capture use case of an input client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    Default,
    Mic,
    VoiceUplink,
    VoiceDownlink,
    VoiceCall,
    Camcorder,
    VoiceRecognition,
    VoiceCommunication,
    RemoteSubmix,
    Unprocessed,
    FmTuner,
    Hotword,
}

impl AudioSource {
    /// Relative priority when several sources share one input
    pub fn priority(self) -> u32 {
        match self {
            AudioSource::VoiceCommunication => 9,
            AudioSource::Camcorder => 8,
            AudioSource::VoiceRecognition => 7,
            AudioSource::Unprocessed => 6,
            AudioSource::Mic | AudioSource::Default => 5,
            AudioSource::FmTuner => 4,
            AudioSource::VoiceUplink | AudioSource::VoiceDownlink | AudioSource::VoiceCall => 3,
            AudioSource::Hotword => 2,
            AudioSource::RemoteSubmix => 1,
        }
    }
}

/// Sample format of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
    Pcm24Packed,
    Pcm32,
    PcmFloat,
    Aac,
    Mp3,
    Ac3,
    Eac3,
}

impl AudioFormat {
    pub fn is_linear_pcm(self) -> bool {
        matches!(
            self,
            AudioFormat::Pcm16 | AudioFormat::Pcm24Packed | AudioFormat::Pcm32 | AudioFormat::PcmFloat
        )
    }
}

impl FromStr for AudioFormat {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pcm_16" => Ok(AudioFormat::Pcm16),
            "pcm_24_packed" => Ok(AudioFormat::Pcm24Packed),
            "pcm_32" => Ok(AudioFormat::Pcm32),
            "pcm_float" => Ok(AudioFormat::PcmFloat),
            "aac" => Ok(AudioFormat::Aac),
            "mp3" => Ok(AudioFormat::Mp3),
            "ac3" => Ok(AudioFormat::Ac3),
            "eac3" => Ok(AudioFormat::Eac3),
            other => Err(PolicyError::bad_value(format!("unknown format '{}'", other))),
        }
    }
}

/// Channel layout of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMask {
    Mono,
    Stereo,
    Quad,
    Surround5_1,
    Surround7_1,
}

impl ChannelMask {
    pub fn count(self) -> u16 {
        match self {
            ChannelMask::Mono => 1,
            ChannelMask::Stereo => 2,
            ChannelMask::Quad => 4,
            ChannelMask::Surround5_1 => 6,
            ChannelMask::Surround7_1 => 8,
        }
    }
}

impl FromStr for ChannelMask {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mono" => Ok(ChannelMask::Mono),
            "stereo" => Ok(ChannelMask::Stereo),
            "quad" => Ok(ChannelMask::Quad),
            "5.1" => Ok(ChannelMask::Surround5_1),
            "7.1" => Ok(ChannelMask::Surround7_1),
            other => Err(PolicyError::bad_value(format!("unknown channel mask '{}'", other))),
        }
    }
}

/// Stream configuration negotiated with the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::Stereo,
        }
    }
}

/// Capabilities of an output mix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFlags {
    pub primary: bool,
    pub direct: bool,
    pub fast: bool,
    pub deep_buffer: bool,
    pub compress_offload: bool,
    pub hw_av_sync: bool,
}

impl OutputFlags {
    pub const NONE: OutputFlags = OutputFlags {
        primary: false,
        direct: false,
        fast: false,
        deep_buffer: false,
        compress_offload: false,
        hw_av_sync: false,
    };

    pub fn direct() -> Self {
        Self {
            direct: true,
            ..Self::NONE
        }
    }

    /// True when every flag set in `other` is also set in `self`
    pub fn contains(&self, other: &OutputFlags) -> bool {
        (!other.primary || self.primary)
            && (!other.direct || self.direct)
            && (!other.fast || self.fast)
            && (!other.deep_buffer || self.deep_buffer)
            && (!other.compress_offload || self.compress_offload)
            && (!other.hw_av_sync || self.hw_av_sync)
    }

    /// Number of flags shared with `other`, used to rank candidate outputs
    pub fn common_count(&self, other: &OutputFlags) -> u32 {
        [
            self.fast && other.fast,
            self.deep_buffer && other.deep_buffer,
            self.compress_offload && other.compress_offload,
            self.hw_av_sync && other.hw_av_sync,
        ]
        .iter()
        .filter(|b| **b)
        .count() as u32
    }

    pub fn requires_direct(&self) -> bool {
        self.direct || self.compress_offload || self.hw_av_sync
    }
}

/// Capabilities of an input mix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFlags {
    pub fast: bool,
    pub hw_hotword: bool,
    pub raw: bool,
}

impl InputFlags {
    pub const NONE: InputFlags = InputFlags {
        fast: false,
        hw_hotword: false,
        raw: false,
    };

    pub fn contains(&self, other: &InputFlags) -> bool {
        (!other.fast || self.fast) && (!other.hw_hotword || self.hw_hotword) && (!other.raw || self.raw)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// Telephony mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneState {
    #[default]
    Normal,
    Ringtone,
    InCall,
    InCommunication,
}

impl PhoneState {
    pub fn is_in_call(self) -> bool {
        matches!(self, PhoneState::InCall | PhoneState::InCommunication)
    }
}

/// Usage category a forced routing decision applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceUse {
    Communication,
    Media,
    Record,
    Dock,
    System,
    HdmiSystemAudio,
    EncodedSurround,
}

impl ForceUse {
    pub const COUNT: usize = 7;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Value of a forced-use setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedConfig {
    #[default]
    None,
    Speaker,
    Headphones,
    BtSco,
    BtA2dp,
    WiredAccessory,
    BtCarDock,
    BtDeskDock,
    AnalogDock,
    DigitalDock,
    NoBtA2dp,
    SystemEnforced,
    HdmiSystemAudioEnforced,
    EncodedSurroundNever,
    EncodedSurroundAlways,
}

impl ForcedConfig {
    /// Whether this value is meaningful for the given usage
    pub fn is_valid_for(self, usage: ForceUse) -> bool {
        use ForcedConfig::*;
        match usage {
            ForceUse::Communication => matches!(self, None | Speaker | BtSco),
            ForceUse::Media => matches!(
                self,
                None | Headphones | BtA2dp | WiredAccessory | AnalogDock | DigitalDock | NoBtA2dp | Speaker
            ),
            ForceUse::Record => matches!(self, None | BtSco | WiredAccessory),
            ForceUse::Dock => matches!(
                self,
                None | BtCarDock | BtDeskDock | WiredAccessory | AnalogDock | DigitalDock
            ),
            ForceUse::System => matches!(self, None | SystemEnforced),
            ForceUse::HdmiSystemAudio => matches!(self, None | HdmiSystemAudioEnforced),
            ForceUse::EncodedSurround => {
                matches!(self, None | EncodedSurroundNever | EncodedSurroundAlways)
            }
        }
    }
}

/// Device connection state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Available,
    Unavailable,
}
