//! Async host of the policy
//!
//! [`PolicyService`] owns a [`PolicyManager`] behind a `tokio::sync::Mutex`
//! so that every entry point runs to completion before the next one starts.
//! Routing commands report a [`Settle`] time; the service waits it out after
//! releasing the lock, so callers see a change only once it is audible while
//! other clients keep being served.

use std::sync::Arc;
use std::time::Duration;
use switchyard_core::domain::audio::Result;
use switchyard_core::domain::command::{CommandExecutor, CommandResult, PolicyCommand};
use switchyard_core::domain::config::PolicyConfig;
use switchyard_core::domain::hal::HalClient;
use switchyard_core::domain::manager::{PolicyDump, PolicyManager};
use switchyard_core::domain::schedule::Settle;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// How the service treats settle times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    /// Sleep until the change is audible before replying
    Wait,
    /// Reply at once and report the settle time only
    Report,
}

pub struct PolicyService<H: HalClient> {
    manager: Arc<Mutex<PolicyManager<H>>>,
    settle_mode: SettleMode,
}

impl<H: HalClient> Clone for PolicyService<H> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            settle_mode: self.settle_mode,
        }
    }
}

impl<H: HalClient + 'static> PolicyService<H> {
    pub fn new(manager: PolicyManager<H>) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
            settle_mode: SettleMode::Wait,
        }
    }

    /// Build a manager over `hal`, load its modules and wrap it
    #[instrument(skip(hal, config), fields(name = %config.global.name))]
    pub fn start(hal: H, config: &PolicyConfig) -> Result<Self> {
        let mut manager = PolicyManager::new(hal, config)?;
        manager.initialize()?;
        info!(outputs = manager.state().outputs.len(), "Policy service started");
        Ok(Self::new(manager))
    }

    pub fn with_settle_mode(mut self, mode: SettleMode) -> Self {
        self.settle_mode = mode;
        self
    }

    /// Run a closure with exclusive access to the manager
    pub async fn with_manager<R>(&self, f: impl FnOnce(&mut PolicyManager<H>) -> R) -> R {
        let mut manager = self.manager.lock().await;
        f(&mut manager)
    }

    pub async fn dump(&self) -> PolicyDump {
        self.manager.lock().await.dump()
    }

    async fn settle(&self, settle: Settle) {
        if self.settle_mode == SettleMode::Wait && !settle.is_immediate() {
            debug!(wait_ms = settle.wait_ms, "Waiting for routing to settle");
            tokio::time::sleep(Duration::from_millis(u64::from(settle.wait_ms))).await;
        }
    }

    /// Apply one command under the lock
    fn apply(manager: &mut PolicyManager<H>, command: PolicyCommand) -> Result<CommandResult> {
        let routed = |settle: Settle| CommandResult::Routed { settle };
        let result = match command {
            PolicyCommand::SetDeviceConnectionState {
                device,
                state,
                address,
                name,
            } => routed(manager.set_device_connection_state(device, state, &address, &name)?),
            PolicyCommand::SetPhoneState { state } => routed(manager.set_phone_state(state)?),
            PolicyCommand::SetForceUse { usage, config } => routed(manager.set_force_use(usage, config)?),
            PolicyCommand::InitStreamVolume {
                stream,
                index_min,
                index_max,
            } => {
                manager.init_stream_volume(stream, index_min, index_max)?;
                CommandResult::Ok
            }
            PolicyCommand::SetStreamVolumeIndex { stream, index, device } => {
                manager.set_stream_volume_index(stream, index, device)?;
                CommandResult::Ok
            }
            PolicyCommand::GetOutput { attributes } => CommandResult::Output {
                output: manager.get_output_for_attr(&attributes)?,
            },
            PolicyCommand::StartOutput {
                output,
                stream,
                session,
            } => routed(manager.start_output(output, stream, session)?),
            PolicyCommand::StopOutput {
                output,
                stream,
                session,
            } => routed(manager.stop_output(output, stream, session)?),
            PolicyCommand::ReleaseOutput { output, session } => {
                manager.release_output(output, session)?;
                CommandResult::Ok
            }
            PolicyCommand::GetInput { attributes } => CommandResult::Input {
                input: manager.get_input_for_attr(&attributes)?,
            },
            PolicyCommand::StartInput { input, session } => routed(manager.start_input(input, session)?),
            PolicyCommand::StopInput { input, session } => routed(manager.stop_input(input, session)?),
            PolicyCommand::ReleaseInput { input, session } => {
                manager.release_input(input, session)?;
                CommandResult::Ok
            }
            PolicyCommand::CreateAudioPatch {
                sources,
                sinks,
                handle,
                uid,
            } => CommandResult::PatchCreated {
                handle: manager.create_audio_patch(&sources, &sinks, handle, uid)?,
            },
            PolicyCommand::ReleaseAudioPatch { handle, uid } => routed(manager.release_audio_patch(handle, uid)?),
            PolicyCommand::ClearAudioPatches { uid } => routed(manager.clear_audio_patches(uid)?),
            PolicyCommand::SetAudioPortConfig { config } => {
                manager.set_audio_port_config(&config)?;
                CommandResult::Ok
            }
            PolicyCommand::ListAudioPorts { role, kind } => {
                let (ports, generation) = manager.list_audio_ports(role, kind);
                CommandResult::Ports { generation, ports }
            }
            PolicyCommand::ListAudioPatches => {
                let (patches, generation) = manager.list_audio_patches();
                CommandResult::Patches { generation, patches }
            }
            PolicyCommand::Dump => CommandResult::Dump {
                dump: Box::new(manager.dump()),
            },
        };
        Ok(result)
    }
}

#[async_trait::async_trait]
impl<H: HalClient + 'static> CommandExecutor for PolicyService<H> {
    #[instrument(skip(self))]
    async fn execute(&self, command: PolicyCommand) -> CommandResult {
        let result = {
            let mut manager = self.manager.lock().await;
            Self::apply(&mut manager, command)
        };
        match result {
            Ok(result) => {
                if let CommandResult::Routed { settle } = &result {
                    self.settle(*settle).await;
                }
                result
            }
            Err(e) => {
                warn!(error = %e, "Command failed");
                CommandResult::Error { message: e.to_string() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{HalCall, RecordingHal};
    use switchyard_core::domain::audio::{ConnectionState, DeviceType, SessionId, StreamType};
    use switchyard_core::domain::command::OutputAttributes;

    fn service() -> PolicyService<RecordingHal> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        PolicyService::start(RecordingHal::new(), &PolicyConfig::factory_default()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_routes_music() {
        let service = service();
        let output = match service
            .execute(PolicyCommand::GetOutput {
                attributes: OutputAttributes::new(StreamType::Music, SessionId(1)),
            })
            .await
        {
            CommandResult::Output { output } => output,
            other => panic!("unexpected result {:?}", other),
        };
        let started = service
            .execute(PolicyCommand::StartOutput {
                output,
                stream: StreamType::Music,
                session: SessionId(1),
            })
            .await;
        assert!(matches!(started, CommandResult::Routed { .. }));
        let active = service.with_manager(|m| m.is_stream_active(StreamType::Music, 0)).await;
        assert!(active);
    }

    #[tokio::test]
    async fn test_errors_are_reported_not_raised() {
        let service = service();
        let result = service
            .execute(PolicyCommand::SetDeviceConnectionState {
                device: DeviceType::WiredHeadset,
                state: ConnectionState::Unavailable,
                address: String::new(),
                name: String::new(),
            })
            .await;
        assert!(result.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_mode_sleeps_for_settle() {
        let service = service();
        let output = service
            .with_manager(|m| {
                let io = m
                    .get_output_for_attr(&OutputAttributes::new(StreamType::Music, SessionId(1)))
                    .unwrap();
                m.start_output(io, StreamType::Music, SessionId(1)).unwrap();
                io
            })
            .await;
        let before = tokio::time::Instant::now();
        let result = service
            .execute(PolicyCommand::SetDeviceConnectionState {
                device: DeviceType::WiredHeadset,
                state: ConnectionState::Available,
                address: String::new(),
                name: String::new(),
            })
            .await;
        let CommandResult::Routed { settle } = result else {
            panic!("unexpected result {:?}", result);
        };
        assert!(before.elapsed() >= Duration::from_millis(u64::from(settle.wait_ms)));
        let patched = service
            .with_manager(|m| {
                m.hal()
                    .count(|c| matches!(c, HalCall::CreatePatch { sinks, .. } if sinks.contains(DeviceType::WiredHeadset)))
            })
            .await;
        assert!(patched >= 1);
        let devices = service.with_manager(|m| m.state().outputs.get(output).map(|d| d.devices.clone())).await;
        assert!(devices.is_some());
    }

    #[tokio::test]
    async fn test_clones_share_the_manager() {
        let service = service().with_settle_mode(SettleMode::Report);
        let other = service.clone();
        other
            .execute(PolicyCommand::SetDeviceConnectionState {
                device: DeviceType::WiredHeadset,
                state: ConnectionState::Available,
                address: String::new(),
                name: String::new(),
            })
            .await;
        let dump = service.dump().await;
        assert!(dump.available_outputs.iter().any(|d| d.device_type == DeviceType::WiredHeadset));
    }
}
