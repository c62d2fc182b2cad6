//! Domain entities and business rules

pub mod audio;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod hal;
pub mod manager;
pub mod module;
pub mod patch;
pub mod schedule;
pub mod strategy;
pub mod volume;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioFormat, AudioSource, ChannelMask, ConnectionState, DeviceCategory, DeviceType, DeviceTypeSet,
    Direction, ForceUse, ForcedConfig, HalPatchHandle, InputFlags, IoHandle, ModuleHandle, OutputFlags,
    PatchHandle, PhoneState, PolicyError, PortHandle, SessionId, StreamConfig, StreamType, Uid,
};
pub use command::{CommandExecutor, CommandResult, InputAttributes, OutputAttributes, PolicyCommand};
pub use config::{ConfigError, ConfigManager, ConfigWatcher, PolicyConfig};
pub use descriptor::{InputDescriptor, OutputDescriptor};
pub use device::{Device, DeviceVector, GainDescriptor};
pub use hal::{HalClient, HalError, HalResult, InputRequest, OpenedOutput, OutputRequest};
pub use manager::{AudioPortInfo, PolicyDump, PolicyManager, PolicyState};
pub use patch::{AudioPatch, PortConfig, PortExt, PortKind, PortRole};
pub use schedule::{Clock, ManualClock, MonotonicClock, Settle};
pub use strategy::{DefaultEngine, Engine, Strategy};
pub use volume::{VolumeCurve, VolumeTable};
