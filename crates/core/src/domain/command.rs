//! Command bus in front of the policy manager
//!
//! Every upward operation has a serialisable [`PolicyCommand`] form so that
//! scenarios can be scripted in TOML or JSON and replayed through any
//! [`CommandExecutor`].

use crate::domain::audio::{
    AudioSource, ConnectionState, DeviceType, ForceUse, ForcedConfig, InputFlags, IoHandle,
    OutputFlags, PatchHandle, PhoneState, PortHandle, SessionId, StreamConfig, StreamType, Uid,
};
use crate::domain::manager::{AudioPortInfo, PolicyDump};
use crate::domain::patch::{AudioPatch, PortConfig, PortKind, PortRole};
use crate::domain::schedule::Settle;
use serde::{Deserialize, Serialize};

/// Who plays what, and how, when asking for an output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputAttributes {
    pub stream: StreamType,
    #[serde(default = "default_session")]
    pub session: SessionId,
    #[serde(default = "default_uid")]
    pub uid: Uid,
    #[serde(default)]
    pub config: Option<StreamConfig>,
    #[serde(default)]
    pub flags: OutputFlags,
    /// Explicit device port the client wants to play to
    #[serde(default)]
    pub selected_device: Option<PortHandle>,
}

impl OutputAttributes {
    pub fn new(stream: StreamType, session: SessionId) -> Self {
        Self {
            stream,
            session,
            uid: default_uid(),
            config: None,
            flags: OutputFlags::NONE,
            selected_device: None,
        }
    }
}

/// Capture request of an input client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAttributes {
    pub source: AudioSource,
    #[serde(default = "default_session")]
    pub session: SessionId,
    #[serde(default = "default_uid")]
    pub uid: Uid,
    #[serde(default)]
    pub config: Option<StreamConfig>,
    #[serde(default)]
    pub flags: InputFlags,
    #[serde(default)]
    pub selected_device: Option<PortHandle>,
}

impl InputAttributes {
    pub fn new(source: AudioSource, session: SessionId) -> Self {
        Self {
            source,
            session,
            uid: default_uid(),
            config: None,
            flags: InputFlags::NONE,
            selected_device: None,
        }
    }
}

fn default_session() -> SessionId {
    SessionId(1)
}

fn default_uid() -> Uid {
    Uid(10_000)
}

fn system_uid() -> Uid {
    Uid::SYSTEM
}

/// Operations accepted by the policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PolicyCommand {
    SetDeviceConnectionState {
        device: DeviceType,
        state: ConnectionState,
        #[serde(default)]
        address: String,
        #[serde(default)]
        name: String,
    },
    SetPhoneState {
        state: PhoneState,
    },
    SetForceUse {
        usage: ForceUse,
        config: ForcedConfig,
    },
    InitStreamVolume {
        stream: StreamType,
        index_min: u32,
        index_max: u32,
    },
    SetStreamVolumeIndex {
        stream: StreamType,
        index: u32,
        #[serde(default)]
        device: Option<DeviceType>,
    },
    GetOutput {
        #[serde(flatten)]
        attributes: OutputAttributes,
    },
    StartOutput {
        output: IoHandle,
        stream: StreamType,
        #[serde(default = "default_session")]
        session: SessionId,
    },
    StopOutput {
        output: IoHandle,
        stream: StreamType,
        #[serde(default = "default_session")]
        session: SessionId,
    },
    ReleaseOutput {
        output: IoHandle,
        #[serde(default = "default_session")]
        session: SessionId,
    },
    GetInput {
        #[serde(flatten)]
        attributes: InputAttributes,
    },
    StartInput {
        input: IoHandle,
        #[serde(default = "default_session")]
        session: SessionId,
    },
    StopInput {
        input: IoHandle,
        #[serde(default = "default_session")]
        session: SessionId,
    },
    ReleaseInput {
        input: IoHandle,
        #[serde(default = "default_session")]
        session: SessionId,
    },
    CreateAudioPatch {
        sources: Vec<PortConfig>,
        sinks: Vec<PortConfig>,
        #[serde(default)]
        handle: Option<PatchHandle>,
        #[serde(default = "system_uid")]
        uid: Uid,
    },
    ReleaseAudioPatch {
        handle: PatchHandle,
        #[serde(default = "system_uid")]
        uid: Uid,
    },
    /// Drop every patch a client created
    ClearAudioPatches {
        uid: Uid,
    },
    SetAudioPortConfig {
        config: PortConfig,
    },
    ListAudioPorts {
        #[serde(default)]
        role: Option<PortRole>,
        #[serde(default)]
        kind: Option<PortKind>,
    },
    ListAudioPatches,
    Dump,
}

/// Result of command execution
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResult {
    Ok,
    /// Routing applied; audible once the settle time has passed
    Routed { settle: Settle },
    Output { output: IoHandle },
    Input { input: IoHandle },
    PatchCreated { handle: PatchHandle },
    Ports { generation: u32, ports: Vec<AudioPortInfo> },
    Patches { generation: u32, patches: Vec<AudioPatch> },
    Dump { dump: Box<PolicyDump> },
    Error { message: String },
}

impl CommandResult {
    pub fn is_error(&self) -> bool {
        matches!(self, CommandResult::Error { .. })
    }
}

/// Trait for command execution
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: PolicyCommand) -> CommandResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_json() {
        let raw = r#"{"op":"set_device_connection_state","device":"wired_headset","state":"available"}"#;
        let cmd: PolicyCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            PolicyCommand::SetDeviceConnectionState {
                device: DeviceType::WiredHeadset,
                state: ConnectionState::Available,
                address: String::new(),
                name: String::new(),
            }
        );
    }

    #[test]
    fn test_get_output_flattens_attributes() {
        let raw = r#"{"op":"get_output","stream":"music","session":7}"#;
        let cmd: PolicyCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            PolicyCommand::GetOutput { attributes } => {
                assert_eq!(attributes.stream, StreamType::Music);
                assert_eq!(attributes.session, SessionId(7));
                assert_eq!(attributes.flags, OutputFlags::NONE);
                assert!(attributes.selected_device.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_commands_from_toml_list() {
        #[derive(Deserialize)]
        struct Script {
            step: Vec<PolicyCommand>,
        }
        let raw = r#"
            [[step]]
            op = "set_phone_state"
            state = "in_call"

            [[step]]
            op = "set_force_use"
            usage = "communication"
            config = "speaker"
        "#;
        let script: Script = toml::from_str(raw).unwrap();
        assert_eq!(script.step.len(), 2);
        assert_eq!(
            script.step[1],
            PolicyCommand::SetForceUse {
                usage: ForceUse::Communication,
                config: ForcedConfig::Speaker,
            }
        );
    }

    #[test]
    fn test_error_result_serializes_tagged() {
        let result = CommandResult::Error {
            message: "nope".into(),
        };
        assert!(result.is_error());
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"result\":\"error\""));
    }
}
