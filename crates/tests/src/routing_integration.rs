//! Integration tests for the routing policy
//!
//! Each test plays a device and client scenario against the factory topology
//! and checks the routing decisions and the requests seen by the hardware.

use switchyard_core::domain::audio::{
    AudioSource, ConnectionState, DeviceType, DeviceTypeSet, ForceUse, ForcedConfig, IoHandle, PhoneState,
    PolicyError, SessionId, StreamType, Uid,
};
use switchyard_core::domain::command::{CommandExecutor, CommandResult, OutputAttributes, PolicyCommand};
use switchyard_core::domain::config::{ConfigManager, PolicyConfig};
use switchyard_core::domain::patch::{PortConfig, PortRole};
use switchyard_core::domain::strategy::{DefaultEngine, Engine, EngineContext, Strategy};
use switchyard_core::domain::volume::{db_to_amplitude, VolumeContext, SONIFICATION_HEADSET_VOLUME_MIN_DB};
use switchyard_infra::{HalCall, PolicyService, RecordingHal, SettleMode};
use switchyard_tests::{Harness, A2DP_ADDRESS, USB_ADDRESS, USB_CAPS};

fn harness() -> Harness {
    Harness::new().expect("factory topology loads")
}

fn patch_count(h: &Harness) -> usize {
    h.hal().count(|c| matches!(c, HalCall::CreatePatch { .. }))
}

/// Delays of the recorded patch requests for an output's current patch
fn patch_delays(h: &Harness, io: IoHandle) -> Vec<u32> {
    let state = h.manager.state();
    let Some(hal_handle) = state
        .outputs
        .get(io)
        .and_then(|d| d.patch)
        .and_then(|p| state.patches.get(p))
        .and_then(|p| p.hal_handle)
    else {
        return Vec::new();
    };
    h.hal()
        .calls()
        .iter()
        .filter_map(|c| match c {
            HalCall::CreatePatch { handle, delay_ms, .. } if *handle == hal_handle => Some(*delay_ms),
            _ => None,
        })
        .collect()
}

// ============================================================================
// STRATEGY PRIORITY
// ============================================================================

#[test]
fn test_ringtone_over_music_takes_sonification_route() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let music = h.play(StreamType::Music, 1).unwrap();
    assert_eq!(h.output_devices(music), DeviceTypeSet::single(DeviceType::WiredHeadset));

    let ring = h.play(StreamType::Ring, 2).unwrap();
    assert_eq!(ring, music);
    let expected = h.manager.devices_for_stream(StreamType::Ring);
    assert!(expected.contains(DeviceType::Speaker));
    assert!(expected.contains(DeviceType::WiredHeadset));
    assert_eq!(h.output_devices(ring), expected);
    assert!(h.patched_to(DeviceType::Speaker));

    // back on the headset once the ringtone stops
    h.stop(ring, StreamType::Ring, 2).unwrap();
    assert_eq!(h.output_devices(music), DeviceTypeSet::single(DeviceType::WiredHeadset));
}

#[test]
fn test_stopping_ringtone_delays_switch_back() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let music = h.play(StreamType::Music, 1).unwrap();
    let ring = h.play(StreamType::Ring, 2).unwrap();
    assert_eq!(ring, music);
    h.hal_mut().take_calls();

    h.stop(ring, StreamType::Ring, 2).unwrap();
    assert_eq!(h.output_devices(music), DeviceTypeSet::single(DeviceType::WiredHeadset));
    // the ringtone drains through the old route first
    let latency = h.manager.state().outputs.latency(music);
    assert_eq!(patch_delays(&h, music), vec![latency * 2]);
}

#[test]
fn test_stop_reroutes_sibling_on_same_module() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let mut attrs = OutputAttributes::new(StreamType::Music, SessionId(1));
    attrs.flags.deep_buffer = true;
    let deep = h.manager.get_output_for_attr(&attrs).unwrap();
    h.manager.start_output(deep, StreamType::Music, SessionId(1)).unwrap();
    let primary = h.play(StreamType::Ring, 2).unwrap();
    assert_ne!(deep, primary);
    assert!(h.output_devices(primary).contains(DeviceType::Speaker));
    h.hal_mut().take_calls();

    h.stop(primary, StreamType::Ring, 2).unwrap();
    assert_eq!(h.output_devices(deep), DeviceTypeSet::single(DeviceType::WiredHeadset));
    let latency = h.manager.state().outputs.latency(primary);
    assert_eq!(patch_delays(&h, deep), vec![latency * 2]);
}

struct PriorityCase {
    name: &'static str,
    lower: StreamType,
    higher: StreamType,
    /// Entered once the lower stream plays
    phone_state: PhoneState,
    system_enforced: bool,
}

const PRIORITY_CASES: &[PriorityCase] = &[
    PriorityCase {
        name: "enforced audible over phone",
        lower: StreamType::VoiceCall,
        higher: StreamType::EnforcedAudible,
        phone_state: PhoneState::InCall,
        system_enforced: true,
    },
    PriorityCase {
        name: "phone over sonification",
        lower: StreamType::Ring,
        higher: StreamType::VoiceCall,
        phone_state: PhoneState::InCall,
        system_enforced: false,
    },
    PriorityCase {
        name: "sonification over accessibility",
        lower: StreamType::Accessibility,
        higher: StreamType::Ring,
        phone_state: PhoneState::Normal,
        system_enforced: false,
    },
    PriorityCase {
        name: "accessibility over respectful sonification",
        lower: StreamType::Notification,
        higher: StreamType::Accessibility,
        phone_state: PhoneState::Normal,
        system_enforced: false,
    },
    PriorityCase {
        name: "media over dtmf",
        lower: StreamType::Dtmf,
        higher: StreamType::Music,
        phone_state: PhoneState::Normal,
        system_enforced: false,
    },
    PriorityCase {
        name: "dtmf over tts",
        lower: StreamType::Tts,
        higher: StreamType::Dtmf,
        phone_state: PhoneState::Normal,
        system_enforced: false,
    },
];

#[test]
fn test_strategy_priority_table() {
    for case in PRIORITY_CASES {
        let mut h = harness();
        h.connect(DeviceType::WiredHeadset, "").unwrap();
        if case.system_enforced {
            h.manager.set_force_use(ForceUse::System, ForcedConfig::SystemEnforced).unwrap();
        }
        h.play(case.lower, 1).unwrap();
        if case.phone_state != PhoneState::Normal {
            h.manager.set_phone_state(case.phone_state).unwrap();
        }
        let io = h.play(case.higher, 2).unwrap();

        let expected = h.manager.devices_for_stream(case.higher);
        assert!(!expected.is_empty(), "{}: no device for {}", case.name, case.higher);
        assert_eq!(h.output_devices(io), expected, "{}", case.name);
    }
}

#[test]
fn test_strategy_priority_ignores_start_order() {
    // TTS refuses to start over other playback
    let cases = PRIORITY_CASES
        .iter()
        .filter(|c| c.phone_state == PhoneState::Normal && c.lower != StreamType::Tts);
    for case in cases {
        let mut h = harness();
        h.connect(DeviceType::WiredHeadset, "").unwrap();
        let io = h.play(case.higher, 1).unwrap();
        let routed = h.output_devices(io);
        h.play(case.lower, 2).unwrap();
        assert_eq!(h.output_devices(io), routed, "{}", case.name);
        assert_eq!(routed, h.manager.devices_for_stream(case.higher), "{}", case.name);
    }
}

#[test]
fn test_ringtone_capped_to_music_on_headset() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    h.manager.set_stream_volume_index(StreamType::Music, 3, None).unwrap();
    h.manager.set_stream_volume_index(StreamType::Ring, 7, None).unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    h.manager.set_phone_state(PhoneState::Ringtone).unwrap();
    assert!(h.manager.state().limit_ringtone_volume);
    h.play(StreamType::Ring, 2).unwrap();

    // the cap follows the music level on the headset, never below the floor
    let volumes = &h.manager.state().volumes;
    let index = volumes.stream(StreamType::Music).index_for(Some(DeviceType::WiredHeadset));
    let music_db = volumes.compute_volume(StreamType::Music, index, DeviceType::WiredHeadset, &VolumeContext::default());
    let cap = db_to_amplitude(music_db.max(SONIFICATION_HEADSET_VOLUME_MIN_DB));

    let ring = h.hal().last_volume(StreamType::Ring, io).unwrap();
    assert!(ring > 0.0);
    assert!(ring <= cap + 1e-6, "ring {} above cap {}", ring, cap);
}

#[test]
fn test_repeated_routing_does_not_repatch() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    let devices = h.output_devices(io);
    h.hal_mut().take_calls();

    // a second client of the same stream lands on the already routed output
    let again = h.play(StreamType::Music, 2).unwrap();
    assert_eq!(again, io);
    assert_eq!(patch_count(&h), 0);
    assert_eq!(h.output_devices(io), devices);
}

#[test]
fn test_forced_speaker_overrides_headset() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    h.manager.set_force_use(ForceUse::Media, ForcedConfig::Speaker).unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::Speaker));
    h.manager.set_force_use(ForceUse::Media, ForcedConfig::None).unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::WiredHeadset));
}

/// Media always on the loudspeaker, everything else as usual
struct SpeakerMediaEngine(DefaultEngine);

impl Engine for SpeakerMediaEngine {
    fn device_for_strategy(&self, strategy: Strategy, ctx: &EngineContext<'_>) -> DeviceTypeSet {
        if strategy == Strategy::Media {
            return DeviceTypeSet::single(DeviceType::Speaker);
        }
        self.0.device_for_strategy(strategy, ctx)
    }

    fn device_for_input_source(&self, source: AudioSource, ctx: &EngineContext<'_>) -> Option<DeviceType> {
        self.0.device_for_input_source(source, ctx)
    }
}

#[test]
fn test_custom_engine_decides_routing() {
    let mut h = Harness::with_engine(Box::new(SpeakerMediaEngine(DefaultEngine::new()))).unwrap();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::Speaker));
    assert!(!h.patched_to(DeviceType::WiredHeadset));
}

// ============================================================================
// DEVICE CONNECTION
// ============================================================================

#[test]
fn test_usb_dac_gets_its_own_output() {
    let mut h = harness();
    h.hal_mut().script_caps(DeviceType::UsbDevice, USB_CAPS);
    h.connect(DeviceType::UsbDevice, USB_ADDRESS).unwrap();
    assert_eq!(h.manager.strategy_for_stream(StreamType::Music), Strategy::Media);

    let io = h.play(StreamType::Music, 1).unwrap();
    assert!(h.output_devices(io).contains(DeviceType::UsbDevice));
    assert_ne!(Some(io), h.manager.primary_output());

    h.disconnect(DeviceType::UsbDevice, USB_ADDRESS).unwrap();
    assert!(!h.hal().is_open(io));
    assert!(!h.patched_to(DeviceType::UsbDevice));
}

#[test]
fn test_usb_without_caps_is_refused() {
    let mut h = harness();
    let streams = h.hal().open_streams().len();
    let result = h.connect(DeviceType::UsbDevice, USB_ADDRESS);
    assert!(matches!(result, Err(PolicyError::InvalidOperation(_))));
    assert_eq!(h.hal().open_streams().len(), streams);
}

#[test]
fn test_failed_open_leaves_device_unavailable() {
    let mut h = harness();
    h.hal_mut().script_caps(DeviceType::UsbDevice, USB_CAPS);
    h.hal_mut().fail_open(DeviceType::UsbDevice);
    assert!(h.connect(DeviceType::UsbDevice, USB_ADDRESS).is_err());
    assert_eq!(
        h.manager.device_connection_state(DeviceType::UsbDevice, USB_ADDRESS),
        ConnectionState::Unavailable
    );

    h.hal_mut().clear_failures();
    h.connect(DeviceType::UsbDevice, USB_ADDRESS).unwrap();
    assert_eq!(
        h.manager.device_connection_state(DeviceType::UsbDevice, USB_ADDRESS),
        ConnectionState::Available
    );
}

#[test]
fn test_a2dp_suspended_while_ringing() {
    let mut h = harness();
    h.connect(DeviceType::BluetoothA2dp, A2DP_ADDRESS).unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    assert!(h.output_devices(io).contains(DeviceType::BluetoothA2dp));
    assert!(!h.manager.state().a2dp_suspended);

    h.manager.set_phone_state(PhoneState::Ringtone).unwrap();
    assert!(h.manager.state().a2dp_suspended);
    assert_eq!(h.hal().count(|c| matches!(c, HalCall::SuspendOutput { .. })), 1);

    h.manager.set_phone_state(PhoneState::Normal).unwrap();
    assert!(!h.manager.state().a2dp_suspended);
    assert_eq!(h.hal().count(|c| matches!(c, HalCall::RestoreOutput { .. })), 1);
}

#[test]
fn test_missing_module_is_skipped() {
    let mut hal = RecordingHal::new();
    hal.remove_module("usb");
    let h = Harness::with_hal(hal, &PolicyConfig::factory_default()).unwrap();
    assert!(h.manager.primary_output().is_some());
    assert!(!h.hal().calls().iter().any(|c| matches!(c, HalCall::LoadModule { name, .. } if name == "usb")));
}

// ============================================================================
// CLIENT PATCHES
// ============================================================================

#[test]
fn test_client_patch_updated_in_place() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    let source = h.mix_source(io).unwrap();
    let both = vec![h.sink(DeviceType::Speaker).unwrap(), h.sink(DeviceType::WiredHeadset).unwrap()];

    let handle = h
        .manager
        .create_audio_patch(&[source.clone()], &both, None, Uid(10_050))
        .unwrap();
    let supported = h.manager.state().outputs.supported_devices(io);
    assert!(supported.contains(DeviceType::Speaker) && supported.contains(DeviceType::WiredHeadset));
    let (patches, _) = h.manager.list_audio_patches();
    let count = patches.len();
    let patch = patches.iter().find(|p| p.handle == handle).unwrap();
    assert_eq!(patch.sink_devices().len(), 2);

    let speaker = vec![both[0].clone()];
    let again = h
        .manager
        .create_audio_patch(&[source], &speaker, Some(handle), Uid(10_050))
        .unwrap();
    assert_eq!(again, handle);
    let (patches, _) = h.manager.list_audio_patches();
    assert_eq!(patches.len(), count);
    let patch = patches.iter().find(|p| p.handle == handle).unwrap();
    assert_eq!(patch.sink_devices(), DeviceTypeSet::single(DeviceType::Speaker));
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::Speaker));
}

#[test]
fn test_disconnecting_patched_device_reroutes_output() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    let source = h.mix_source(io).unwrap();
    let headset = h.sink(DeviceType::WiredHeadset).unwrap();
    h.manager
        .create_audio_patch(&[source], &[headset], None, Uid(10_050))
        .unwrap();
    assert!(h.patched_to(DeviceType::WiredHeadset));

    h.disconnect(DeviceType::WiredHeadset, "").unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::Speaker));
    assert!(!h.patched_to(DeviceType::WiredHeadset));
    let (patches, _) = h.manager.list_audio_patches();
    assert!(patches
        .iter()
        .all(|p| !p.sink_devices().contains(DeviceType::WiredHeadset)));
}

#[test]
fn test_device_patch_bridged_without_native_support() {
    let mut h = harness();
    h.hal_mut().set_device_patches(false);
    let rx = h
        .manager
        .state()
        .available_inputs
        .first_of_type(DeviceType::TelephonyRx)
        .cloned()
        .unwrap();
    let source = PortConfig::device(rx.port_id, PortRole::Source, rx.device_type, "");
    let speaker = h.sink(DeviceType::Speaker).unwrap();
    let handle = h
        .manager
        .create_audio_patch(&[source], &[speaker], None, Uid(10_050))
        .unwrap();

    let (patches, _) = h.manager.list_audio_patches();
    assert!(patches.iter().find(|p| p.handle == handle).unwrap().is_bridge());
    assert_eq!(h.hal().count(|c| matches!(c, HalCall::CreatePatch { bridge: true, .. })), 1);
}

#[test]
fn test_clear_patches_of_departed_client() {
    let mut h = harness();
    h.connect(DeviceType::WiredHeadset, "").unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    let source = h.mix_source(io).unwrap();
    let speaker = h.sink(DeviceType::Speaker).unwrap();
    h.manager
        .create_audio_patch(&[source], &[speaker], None, Uid(10_050))
        .unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::Speaker));

    h.manager.clear_audio_patches(Uid(10_050)).unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::WiredHeadset));
    let (patches, _) = h.manager.list_audio_patches();
    assert!(patches.iter().all(|p| p.uid != Uid(10_050)));
}

// ============================================================================
// CAPTURE
// ============================================================================

#[test]
fn test_second_capture_rejected_while_recording() {
    let mut h = harness();
    h.capture(AudioSource::Mic, 1).unwrap();
    let camcorder = h.open_capture(AudioSource::Camcorder, 2).unwrap();
    let result = h.manager.start_input(camcorder, SessionId(2));
    assert!(matches!(result, Err(PolicyError::InvalidOperation(_))));
    assert!(h.manager.is_source_active(AudioSource::Mic));
    assert!(!h.manager.is_source_active(AudioSource::Camcorder));
}

#[test]
fn test_hotword_yields_to_voice_recognition() {
    let mut h = harness();
    let hotword = h.capture(AudioSource::Hotword, 1).unwrap();
    let recognition = h.capture(AudioSource::VoiceRecognition, 2).unwrap();
    assert!(h.manager.state().inputs.get(hotword).is_none());
    assert!(!h.hal().is_open(hotword));
    assert!(h.manager.is_source_active(AudioSource::VoiceRecognition));

    h.manager.stop_input(recognition, SessionId(2)).unwrap();
    assert!(h.manager.state().inputs.get(recognition).unwrap().preempted_sessions.is_empty());
}

#[test]
fn test_capture_follows_headset_mic() {
    let mut h = harness();
    let io = h.capture(AudioSource::Mic, 1).unwrap();
    h.connect(DeviceType::WiredHeadsetMic, "").unwrap();
    assert_eq!(h.manager.state().inputs.get(io).unwrap().device, DeviceType::WiredHeadsetMic);
    h.disconnect(DeviceType::WiredHeadsetMic, "").unwrap();
    assert!(h.manager.state().inputs.get(io).is_none());
}

// ============================================================================
// CONFIGURATION AND SERVICE
// ============================================================================

#[tokio::test]
async fn test_saved_topology_drives_the_policy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ConfigManager::new(dir.path().to_path_buf());
    let mut config = PolicyConfig::factory_default();
    config.global.name = "bench phone".to_string();
    manager.save(&config).await.unwrap();

    let loaded = manager.load().await;
    assert_eq!(loaded.global.name, "bench phone");
    let mut h = Harness::with_config(&loaded).unwrap();
    let io = h.play(StreamType::Music, 1).unwrap();
    assert_eq!(h.output_devices(io), DeviceTypeSet::single(DeviceType::Speaker));
}

#[tokio::test]
async fn test_service_replays_a_headset_session() {
    let service = PolicyService::start(RecordingHal::new(), &PolicyConfig::factory_default())
        .unwrap()
        .with_settle_mode(SettleMode::Report);

    let connect = service
        .execute(PolicyCommand::SetDeviceConnectionState {
            device: DeviceType::WiredHeadset,
            state: ConnectionState::Available,
            address: String::new(),
            name: "wired".to_string(),
        })
        .await;
    assert!(!connect.is_error());

    let output = match service
        .execute(PolicyCommand::GetOutput {
            attributes: OutputAttributes::new(StreamType::Music, SessionId(7)),
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
            session: SessionId(7),
        })
        .await;
    assert!(matches!(started, CommandResult::Routed { .. }));

    let CommandResult::Patches { patches, .. } = service.execute(PolicyCommand::ListAudioPatches).await else {
        panic!("expected patches");
    };
    assert!(patches
        .iter()
        .any(|p| p.sink_devices() == DeviceTypeSet::single(DeviceType::WiredHeadset)));

    let dump = service.dump().await;
    assert!(dump.available_outputs.iter().any(|d| d.name == "wired"));
}
