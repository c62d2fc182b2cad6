//! Policy topology configuration
//!
//! This module provides:
//! - The TOML schema of the hardware topology (modules, devices, profiles)
//! - Volume curve and stream range overrides
//! - A factory default describing a phone-like device
//! - `ConfigManager` for the user configuration file and `ConfigWatcher`
//!   for hot-reload

use crate::domain::audio::{
    AudioFormat, ChannelMask, DeviceCategory, DeviceType, HandleAllocator, InputFlags, OutputFlags,
    PolicyError, StreamType,
};
use crate::domain::device::{Device, GainDescriptor};
use crate::domain::module::{HwModule, HwModuleCollection, IoProfile, ProfileFlags};
use crate::domain::volume::{CurvePoint, VolumeCurve, VolumeTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Settings that apply to the whole topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Human readable name shown in dumps
    pub name: String,

    /// Speaker has dynamic range compression; selects louder speaker curves
    pub speaker_drc_enabled: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".to_string(),
            speaker_drc_enabled: false,
        }
    }
}

/// A device port declared by a module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub sample_rates: Vec<u32>,
    #[serde(default)]
    pub formats: Vec<AudioFormat>,
    #[serde(default)]
    pub channel_masks: Vec<ChannelMask>,
    #[serde(default)]
    pub gain: Option<GainDescriptor>,
}

/// An output or input profile; empty capability lists are queried from the
/// hardware once a stream is open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    /// Names of declared devices reachable through this profile
    pub devices: Vec<String>,
    #[serde(default)]
    pub sample_rates: Vec<u32>,
    #[serde(default)]
    pub formats: Vec<AudioFormat>,
    #[serde(default)]
    pub channel_masks: Vec<ChannelMask>,
    #[serde(default)]
    pub max_open_count: Option<u32>,
    #[serde(default)]
    pub max_active_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputProfileConfig {
    #[serde(flatten)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub flags: OutputFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputProfileConfig {
    #[serde(flatten)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub flags: InputFlags,
}

/// One hardware module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    #[serde(default = "default_hal_version")]
    pub hal_version: u32,
    /// Devices present from boot
    #[serde(default)]
    pub attached_devices: Vec<String>,
    #[serde(default)]
    pub default_output_device: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputProfileConfig>,
    #[serde(default)]
    pub inputs: Vec<InputProfileConfig>,
}

fn default_hal_version() -> u32 {
    3
}

/// Replacement curve for one stream on one device category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveConfig {
    pub stream: StreamType,
    pub category: DeviceCategory,
    pub points: Vec<CurvePoint>,
}

/// Index range of a stream type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRangeConfig {
    pub stream: StreamType,
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default)]
    pub curves: Vec<CurveConfig>,
    #[serde(default)]
    pub streams: Vec<StreamRangeConfig>,
}

/// Complete policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub volume: VolumeConfig,
}

impl PolicyConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy configuration");

        let contents = fs::read_to_string(path).await?;
        let config = Self::from_toml(&contents)?;

        debug!(modules = config.modules.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving policy configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need handles
    pub fn validate(&self) -> Result<()> {
        if self.modules.is_empty() {
            return Err(ConfigError::Invalid("no hardware module declared".to_string()));
        }
        for module in &self.modules {
            let known = |name: &String| module.devices.iter().any(|d| &d.name == name);
            let profiles = module
                .outputs
                .iter()
                .map(|o| &o.profile)
                .chain(module.inputs.iter().map(|i| &i.profile));
            for profile in profiles {
                if let Some(missing) = profile.devices.iter().find(|n| !known(*n)) {
                    return Err(ConfigError::Invalid(format!(
                        "profile '{}' of module '{}' references unknown device '{}'",
                        profile.name, module.name, missing
                    )));
                }
            }
            for name in module.attached_devices.iter().chain(module.default_output_device.iter()) {
                if !known(name) {
                    return Err(ConfigError::Invalid(format!(
                        "module '{}' attaches unknown device '{}'",
                        module.name, name
                    )));
                }
            }
            for output in &module.outputs {
                if let Some(d) = self.device_types(module, &output.profile).into_iter().find(|d| d.is_input()) {
                    return Err(ConfigError::Invalid(format!(
                        "output profile '{}' lists input device {}",
                        output.profile.name, d
                    )));
                }
            }
            for input in &module.inputs {
                if let Some(d) = self.device_types(module, &input.profile).into_iter().find(|d| d.is_output()) {
                    return Err(ConfigError::Invalid(format!(
                        "input profile '{}' lists output device {}",
                        input.profile.name, d
                    )));
                }
            }
        }
        Ok(())
    }

    fn device_types(&self, module: &ModuleConfig, profile: &ProfileConfig) -> Vec<DeviceType> {
        profile
            .devices
            .iter()
            .filter_map(|name| module.devices.iter().find(|d| &d.name == name))
            .map(|d| d.device_type)
            .collect()
    }

    /// Instantiate modules, allocating a port handle per declared device
    pub fn build_modules(&self, alloc: &mut HandleAllocator) -> Result<HwModuleCollection> {
        self.validate()?;
        let mut modules = Vec::with_capacity(self.modules.len());
        for module_cfg in &self.modules {
            let mut module = HwModule::new(module_cfg.name.clone(), module_cfg.hal_version);
            for dev in &module_cfg.devices {
                let mut device = Device::new(alloc.next_port(), dev.device_type, dev.address.clone())
                    .with_name(dev.name.clone());
                device.sample_rates = dev.sample_rates.clone();
                device.formats = dev.formats.clone();
                device.channel_masks = dev.channel_masks.clone();
                device.gain = dev.gain;
                module.declared_devices.push(device);
            }
            let port_of = |name: &String| {
                module
                    .declared_devices
                    .iter()
                    .find(|d| &d.name == name)
                    .map(|d| d.port_id)
            };
            module.attached_devices = module_cfg.attached_devices.iter().filter_map(port_of).collect();
            module.default_output_device = module_cfg.default_output_device.as_ref().and_then(port_of);

            for output in &module_cfg.outputs {
                let profile = build_profile(
                    &output.profile,
                    ProfileFlags::Output(output.flags),
                    self.device_types(module_cfg, &output.profile),
                );
                module.output_profiles.push(profile);
            }
            for input in &module_cfg.inputs {
                let profile = build_profile(
                    &input.profile,
                    ProfileFlags::Input(input.flags),
                    self.device_types(module_cfg, &input.profile),
                );
                module.input_profiles.push(profile);
            }
            debug!(
                module = %module.name,
                devices = module.declared_devices.len(),
                outputs = module.output_profiles.len(),
                inputs = module.input_profiles.len(),
                "Module built"
            );
            modules.push(module);
        }
        Ok(HwModuleCollection::new(modules))
    }

    /// Default curves with the configured overrides applied
    pub fn volume_table(&self) -> Result<VolumeTable> {
        let mut table = VolumeTable::new();
        if self.global.speaker_drc_enabled {
            table.apply_speaker_drc();
        }
        for curve in &self.volume.curves {
            table.set_curve(curve.stream, curve.category, VolumeCurve::new(curve.points.clone())?);
        }
        for range in &self.volume.streams {
            table.stream_mut(range.stream).set_range(range.min, range.max)?;
        }
        Ok(table)
    }

    /// Phone-like topology: primary, A2DP, USB and remote submix modules
    pub fn factory_default() -> Self {
        use DeviceType::*;

        let primary = ModuleConfig {
            name: "primary".to_string(),
            hal_version: 3,
            attached_devices: names(&["Earpiece", "Speaker", "Telephony Tx", "Built-In Mic", "Built-In Back Mic", "Telephony Rx"]),
            default_output_device: Some("Speaker".to_string()),
            devices: vec![
                device("Earpiece", Earpiece),
                device("Speaker", Speaker),
                device("Wired Headset", WiredHeadset),
                device("Wired Headphones", WiredHeadphone),
                device("BT SCO", BluetoothSco),
                device("BT SCO Headset", BluetoothScoHeadset),
                device("BT SCO Car Kit", BluetoothScoCarkit),
                device("HDMI", Hdmi),
                device("Telephony Tx", TelephonyTx),
                device("Built-In Mic", BuiltinMic),
                device("Built-In Back Mic", BackMic),
                device("Wired Headset Mic", WiredHeadsetMic),
                device("BT SCO Headset Mic", BluetoothScoHeadsetMic),
                device("Telephony Rx", TelephonyRx),
                device("FM Tuner", FmTuner),
            ],
            outputs: vec![
                OutputProfileConfig {
                    profile: profile(
                        "primary output",
                        &["Earpiece", "Speaker", "Wired Headset", "Wired Headphones", "BT SCO", "BT SCO Headset", "BT SCO Car Kit", "Telephony Tx"],
                        &[48000],
                    ),
                    flags: OutputFlags {
                        primary: true,
                        fast: true,
                        ..OutputFlags::NONE
                    },
                },
                OutputProfileConfig {
                    profile: profile("deep buffer", &["Speaker", "Wired Headset", "Wired Headphones"], &[48000]),
                    flags: OutputFlags {
                        deep_buffer: true,
                        ..OutputFlags::NONE
                    },
                },
                OutputProfileConfig {
                    profile: ProfileConfig {
                        name: "hdmi".to_string(),
                        devices: names(&["HDMI"]),
                        sample_rates: Vec::new(),
                        formats: Vec::new(),
                        channel_masks: Vec::new(),
                        max_open_count: Some(1),
                        max_active_count: Some(1),
                    },
                    flags: OutputFlags::direct(),
                },
            ],
            inputs: vec![
                InputProfileConfig {
                    profile: ProfileConfig {
                        channel_masks: vec![ChannelMask::Mono, ChannelMask::Stereo],
                        ..profile(
                            "primary input",
                            &["Built-In Mic", "Built-In Back Mic", "Wired Headset Mic", "BT SCO Headset Mic", "Telephony Rx"],
                            &[8000, 16000, 48000],
                        )
                    },
                    flags: InputFlags::NONE,
                },
                InputProfileConfig {
                    profile: profile("fm input", &["FM Tuner"], &[48000]),
                    flags: InputFlags::NONE,
                },
            ],
        };

        let a2dp = ModuleConfig {
            name: "a2dp".to_string(),
            hal_version: 2,
            attached_devices: Vec::new(),
            default_output_device: None,
            devices: vec![
                device("BT A2DP Out", BluetoothA2dp),
                device("BT A2DP Headphones", BluetoothA2dpHeadphones),
                device("BT A2DP Speaker", BluetoothA2dpSpeaker),
            ],
            outputs: vec![OutputProfileConfig {
                profile: profile("a2dp output", &["BT A2DP Out", "BT A2DP Headphones", "BT A2DP Speaker"], &[44100]),
                flags: OutputFlags::NONE,
            }],
            inputs: Vec::new(),
        };

        let usb = ModuleConfig {
            name: "usb".to_string(),
            hal_version: 2,
            attached_devices: Vec::new(),
            default_output_device: None,
            devices: vec![
                device("USB Device Out", UsbDevice),
                device("USB Headset Out", UsbHeadset),
                device("USB Device In", UsbDeviceIn),
                device("USB Headset In", UsbHeadsetIn),
            ],
            outputs: vec![OutputProfileConfig {
                profile: dynamic_profile("usb output", &["USB Device Out", "USB Headset Out"]),
                flags: OutputFlags::NONE,
            }],
            inputs: vec![InputProfileConfig {
                profile: dynamic_profile("usb input", &["USB Device In", "USB Headset In"]),
                flags: InputFlags::NONE,
            }],
        };

        let submix = ModuleConfig {
            name: "r_submix".to_string(),
            hal_version: 2,
            attached_devices: names(&["Remote Submix In"]),
            default_output_device: None,
            devices: vec![
                DeviceConfig {
                    address: "0".to_string(),
                    ..device("Remote Submix Out", RemoteSubmix)
                },
                DeviceConfig {
                    address: "0".to_string(),
                    ..device("Remote Submix In", RemoteSubmixIn)
                },
            ],
            outputs: vec![OutputProfileConfig {
                profile: profile("submix output", &["Remote Submix Out"], &[48000]),
                flags: OutputFlags::NONE,
            }],
            inputs: vec![InputProfileConfig {
                profile: profile("submix input", &["Remote Submix In"], &[48000]),
                flags: InputFlags::NONE,
            }],
        };

        Self {
            global: GlobalConfig {
                name: "factory default".to_string(),
                speaker_drc_enabled: false,
            },
            modules: vec![primary, a2dp, usb, submix],
            volume: VolumeConfig::default(),
        }
    }
}

fn build_profile(cfg: &ProfileConfig, flags: ProfileFlags, devices: Vec<DeviceType>) -> IoProfile {
    let mut profile = IoProfile::new(cfg.name.clone(), flags)
        .with_devices(devices)
        .with_caps(cfg.sample_rates.clone(), cfg.formats.clone(), cfg.channel_masks.clone());
    if let Some(max) = cfg.max_open_count {
        profile.max_open_count = max;
    }
    if let Some(max) = cfg.max_active_count {
        profile.max_active_count = max;
    }
    profile
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn device(name: &str, device_type: DeviceType) -> DeviceConfig {
    DeviceConfig {
        name: name.to_string(),
        device_type,
        address: String::new(),
        sample_rates: Vec::new(),
        formats: Vec::new(),
        channel_masks: Vec::new(),
        gain: None,
    }
}

fn profile(name: &str, devices: &[&str], sample_rates: &[u32]) -> ProfileConfig {
    ProfileConfig {
        name: name.to_string(),
        devices: names(devices),
        sample_rates: sample_rates.to_vec(),
        formats: vec![AudioFormat::Pcm16],
        channel_masks: vec![ChannelMask::Stereo],
        max_open_count: None,
        max_active_count: None,
    }
}

fn dynamic_profile(name: &str, devices: &[&str]) -> ProfileConfig {
    ProfileConfig {
        name: name.to_string(),
        devices: names(devices),
        sample_rates: Vec::new(),
        formats: Vec::new(),
        channel_masks: Vec::new(),
        max_open_count: None,
        max_active_count: None,
    }
}

/// File system watcher for hot-reload
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    config_tx: broadcast::Sender<PathBuf>,
}

impl ConfigWatcher {
    /// Watch a directory for created or modified `*.toml` files
    pub async fn new(config_dir: PathBuf) -> Result<Self> {
        use notify::Watcher;

        let (config_tx, _config_rx) = broadcast::channel(32);

        fs::create_dir_all(&config_dir).await?;

        let tx_clone = config_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Config watch error");
                    return;
                }
            };
            if !matches!(event.kind, notify::EventKind::Create(_) | notify::EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                    // no receiver is not an error worth more than a debug line
                    if tx_clone.send(path).is_err() {
                        debug!("Config change dropped, no subscriber");
                    }
                }
            }
        })?;

        watcher.watch(&config_dir, notify::RecursiveMode::NonRecursive)?;

        info!(path = %config_dir.display(), "Config watcher started");

        Ok(Self {
            _watcher: watcher,
            config_tx,
        })
    }

    /// Subscribe to config change events
    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.config_tx.subscribe()
    }
}

/// Manages the user policy file at `~/.config/switchyard/policy.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("policy.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// `~/.config/switchyard` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("switchyard"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the policy file
    ///
    /// A missing file is created from the factory default. A corrupt file is
    /// backed up next to itself and the factory default is used instead.
    #[instrument(skip(self))]
    pub async fn load(&self) -> PolicyConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Policy file not found, creating factory default"
            );

            let config = PolicyConfig::factory_default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default policy"
                );
            }
            return config;
        }

        match PolicyConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load policy, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt policy"
                    );
                }

                PolicyConfig::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &PolicyConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    /// Delete the policy file
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.config_path.exists() {
            fs::remove_file(&self.config_path).await?;
            info!(path = %self.config_path.display(), "Policy file cleared");
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::Direction;
    use tempfile::TempDir;

    #[test]
    fn test_factory_default_serialization() {
        let config = PolicyConfig::factory_default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = PolicyConfig::from_toml(&toml_str).unwrap();

        assert_eq!(parsed.modules.len(), 4);
        assert_eq!(parsed.modules[0].outputs.len(), config.modules[0].outputs.len());
        assert_eq!(parsed.modules[0].outputs[0].flags, config.modules[0].outputs[0].flags);
    }

    #[test]
    fn test_build_modules_assigns_ports() {
        let config = PolicyConfig::factory_default();
        let mut alloc = HandleAllocator::new();
        let modules = config.build_modules(&mut alloc).unwrap();

        let primary = modules.get(0).unwrap();
        assert_eq!(primary.attached_devices.len(), 6);
        assert!(primary.default_output_device.is_some());
        assert!(primary.supports_device(DeviceType::Speaker));
        assert!(primary.supports_device(DeviceType::BuiltinMic));

        let usb = modules.by_name("usb").unwrap();
        let profiles = modules.profiles(Direction::Output);
        let (_, usb_out) = profiles.iter().find(|(id, _)| id.module == usb).unwrap();
        assert!(usb_out.has_dynamic_caps());

        let ports: Vec<_> = modules.iter().flat_map(|m| m.declared_devices.iter().map(|d| d.port_id)).collect();
        let mut dedup = ports.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(ports.len(), dedup.len());
    }

    #[test]
    fn test_unknown_device_reference_is_rejected() {
        let mut config = PolicyConfig::factory_default();
        config.modules[1].outputs[0].profile.devices.push("Nowhere".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_direction_mismatch_is_rejected() {
        let mut config = PolicyConfig::factory_default();
        config.modules[0].outputs[1].profile.devices.push("Built-In Mic".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_volume_overrides() {
        let toml_str = r#"
            [[modules]]
            name = "primary"

            [[modules.devices]]
            name = "Speaker"
            type = "speaker"

            [[modules.outputs]]
            name = "out"
            devices = ["Speaker"]
            flags = { primary = true }

            [[volume.curves]]
            stream = "music"
            category = "speaker"
            points = [{ index = 0, db = -40.0 }, { index = 100, db = 0.0 }]

            [[volume.streams]]
            stream = "music"
            min = 0
            max = 25
        "#;
        let config = PolicyConfig::from_toml(toml_str).unwrap();
        let table = config.volume_table().unwrap();
        assert_eq!(table.stream(StreamType::Music).index_max, 25);
        assert_eq!(table.curve(StreamType::Music, DeviceCategory::Speaker).points().len(), 2);
        assert_eq!(config.modules[0].hal_version, 3);
    }

    #[test]
    fn test_empty_config_is_invalid() {
        assert!(PolicyConfig::from_toml("").is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("policy.toml");

        let config = PolicyConfig::factory_default();
        config.save_to_file(&config_path).await.unwrap();
        assert!(config_path.exists());

        let loaded = PolicyConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(loaded.global.name, config.global.name);
        assert_eq!(loaded.modules.len(), config.modules.len());
    }

    #[tokio::test]
    async fn test_config_manager_recovers_from_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().to_path_buf());

        let created = manager.load().await;
        assert!(manager.exists());
        assert_eq!(created.modules.len(), 4);

        tokio::fs::write(manager.config_path(), "this is [not toml").await.unwrap();
        let recovered = manager.load().await;
        assert_eq!(recovered.global.name, "factory default");
        assert!(manager.config_path().with_extension("toml.corrupt").exists());

        manager.clear().await.unwrap();
        assert!(!manager.exists());
    }

    #[tokio::test]
    async fn test_watcher_reports_policy_changes() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = ConfigWatcher::new(temp_dir.path().to_path_buf()).await.unwrap();
        let mut rx = watcher.subscribe();

        let path = temp_dir.path().join("policy.toml");
        PolicyConfig::factory_default().save_to_file(&path).await.unwrap();
        tokio::fs::write(temp_dir.path().join("notes.txt"), "ignored").await.unwrap();

        let changed = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("no change reported")
            .unwrap();
        assert_eq!(changed.file_name(), path.file_name());
    }
}
