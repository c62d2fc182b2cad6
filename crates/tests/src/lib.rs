//! Scenario helpers shared by the integration tests
//!
//! [`Harness`] drives a [`PolicyManager`] over a [`RecordingHal`] loaded with
//! the factory topology, so a test reads as a sequence of device and client
//! events followed by checks on the recorded hardware requests.

use switchyard_core::domain::audio::{
    AudioSource, ConnectionState, DeviceType, DeviceTypeSet, IoHandle, PolicyError, Result, SessionId, StreamType,
};
use switchyard_core::domain::command::{InputAttributes, OutputAttributes};
use switchyard_core::domain::config::PolicyConfig;
use switchyard_core::domain::manager::PolicyManager;
use switchyard_core::domain::patch::{PortConfig, PortRole};
use switchyard_core::domain::schedule::Settle;
use switchyard_core::domain::strategy::Engine;
use switchyard_infra::RecordingHal;

/// Capability reply of a stereo USB DAC
pub const USB_CAPS: &str = "sup_sampling_rates=48000|44100;sup_formats=pcm_16;sup_channels=stereo";
pub const USB_ADDRESS: &str = "card=1;device=0";
pub const A2DP_ADDRESS: &str = "00:11:22:33:44:55";

pub struct Harness {
    pub manager: PolicyManager<RecordingHal>,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_config(&PolicyConfig::factory_default())
    }

    pub fn with_config(config: &PolicyConfig) -> Result<Self> {
        Self::with_hal(RecordingHal::new(), config)
    }

    pub fn with_hal(hal: RecordingHal, config: &PolicyConfig) -> Result<Self> {
        Self::boot(PolicyManager::new(hal, config)?)
    }

    /// Factory topology routed by a custom engine
    pub fn with_engine(engine: Box<dyn Engine>) -> Result<Self> {
        Self::boot(PolicyManager::new(RecordingHal::new(), &PolicyConfig::factory_default())?.with_engine(engine))
    }

    fn boot(mut manager: PolicyManager<RecordingHal>) -> Result<Self> {
        manager.initialize()?;
        Ok(Self { manager })
    }

    pub fn hal(&self) -> &RecordingHal {
        self.manager.hal()
    }

    pub fn hal_mut(&mut self) -> &mut RecordingHal {
        self.manager.hal_mut()
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn connect(&mut self, device: DeviceType, address: &str) -> Result<Settle> {
        self.manager
            .set_device_connection_state(device, ConnectionState::Available, address, "")
    }

    pub fn disconnect(&mut self, device: DeviceType, address: &str) -> Result<Settle> {
        self.manager
            .set_device_connection_state(device, ConnectionState::Unavailable, address, "")
    }

    /// Get an output for `stream` and start it
    pub fn play(&mut self, stream: StreamType, session: u32) -> Result<IoHandle> {
        let io = self
            .manager
            .get_output_for_attr(&OutputAttributes::new(stream, SessionId(session)))?;
        self.manager.start_output(io, stream, SessionId(session))?;
        Ok(io)
    }

    pub fn stop(&mut self, io: IoHandle, stream: StreamType, session: u32) -> Result<Settle> {
        self.manager.stop_output(io, stream, SessionId(session))
    }

    /// Get an input for `source` without starting it
    pub fn open_capture(&mut self, source: AudioSource, session: u32) -> Result<IoHandle> {
        self.manager
            .get_input_for_attr(&InputAttributes::new(source, SessionId(session)))
    }

    pub fn capture(&mut self, source: AudioSource, session: u32) -> Result<IoHandle> {
        let io = self.open_capture(source, session)?;
        self.manager.start_input(io, SessionId(session))?;
        Ok(io)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn output_devices(&self, io: IoHandle) -> DeviceTypeSet {
        self.manager.state().outputs.devices(io)
    }

    /// Port config of an available output device as a patch sink
    pub fn sink(&self, device: DeviceType) -> Result<PortConfig> {
        let d = self
            .manager
            .state()
            .available_outputs
            .first_of_type(device)
            .ok_or_else(|| PolicyError::bad_value(format!("{} not available", device)))?;
        Ok(PortConfig::device(d.port_id, PortRole::Sink, d.device_type, d.address.clone()))
    }

    /// Port config of an open output as a patch source
    pub fn mix_source(&self, io: IoHandle) -> Result<PortConfig> {
        let desc = self
            .manager
            .state()
            .outputs
            .get(io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown output {}", io)))?;
        Ok(PortConfig::mix(desc.port_id, PortRole::Source, io))
    }

    /// Whether any live hardware patch plays to `device`
    pub fn patched_to(&self, device: DeviceType) -> bool {
        self.hal().live_patches().any(|p| p.sink_devices().contains(device))
    }
}
