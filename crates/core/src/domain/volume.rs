//! Volume curves and stream volume state
//!
//! A [`VolumeCurve`] maps a position on a 0..=100 scale to an attenuation
//! in dB. Each (stream, device category) pair has one curve. A stream's UI
//! index is first scaled into curve space, then clamped to the curve borders
//! and linearly interpolated between the bounding breakpoints.

use crate::domain::audio::{DeviceCategory, DeviceType, DeviceTypeSet, PolicyError, Result, StreamType};
use crate::domain::strategy::Strategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attenuation written for a muted stream
pub const VOLUME_MIN_DB: f32 = -758.0;
/// Extra attenuation of sonification streams on in-ear devices
pub const SONIFICATION_HEADSET_VOLUME_FACTOR_DB: f32 = -6.0;
/// Floor of sonification volume when capped to music volume
pub const SONIFICATION_HEADSET_VOLUME_MIN_DB: f32 = -36.0;
/// Music stopped less than this long ago still counts as playing
pub const SONIFICATION_HEADSET_MUSIC_DELAY_MS: u64 = 5000;
/// Notifications follow media routing while music played this recently
pub const SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY_MS: u64 = 5000;
/// Accessibility prompts stay within this distance of the ringtone
pub const ACCESSIBILITY_RING_HEADROOM_DB: f32 = 4.0;
/// Upper end of curve index space
pub const CURVE_INDEX_MAX: u32 = 100;

/// One breakpoint of a volume curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub index: u32,
    pub db: f32,
}

const fn pt(index: u32, db: f32) -> CurvePoint {
    CurvePoint { index, db }
}

pub const DEFAULT_CURVE: [CurvePoint; 4] = [pt(1, -49.5), pt(33, -33.5), pt(66, -17.0), pt(100, 0.0)];
pub const DEFAULT_MEDIA_CURVE: [CurvePoint; 4] = [pt(1, -58.0), pt(20, -40.0), pt(60, -17.0), pt(100, 0.0)];
pub const SPEAKER_MEDIA_CURVE: [CurvePoint; 4] = [pt(1, -56.0), pt(20, -34.0), pt(60, -11.0), pt(100, 0.0)];
pub const SPEAKER_SONIFICATION_CURVE: [CurvePoint; 4] = [pt(1, -29.7), pt(33, -20.1), pt(66, -10.2), pt(100, 0.0)];
pub const DEFAULT_SYSTEM_CURVE: [CurvePoint; 4] = [pt(1, -24.0), pt(33, -18.0), pt(66, -12.0), pt(100, -6.0)];
pub const HEADSET_SYSTEM_CURVE: [CurvePoint; 4] = [pt(1, -30.0), pt(33, -26.0), pt(66, -22.0), pt(100, -18.0)];
pub const DEFAULT_VOICE_CURVE: [CurvePoint; 4] = [pt(0, -42.0), pt(33, -28.0), pt(66, -14.0), pt(100, 0.0)];
pub const SPEAKER_VOICE_CURVE: [CurvePoint; 4] = [pt(0, -24.0), pt(33, -16.0), pt(66, -8.0), pt(100, 0.0)];
pub const NON_MUTABLE_CURVE: [CurvePoint; 4] = [pt(0, -58.0), pt(20, -40.0), pt(60, -17.0), pt(100, 0.0)];
pub const SILENT_CURVE: [CurvePoint; 4] = [pt(0, -96.0), pt(1, -96.0), pt(2, -96.0), pt(100, -96.0)];
pub const FULL_SCALE_CURVE: [CurvePoint; 4] = [pt(0, 0.0), pt(1, 0.0), pt(2, 0.0), pt(100, 0.0)];
pub const SPEAKER_SONIFICATION_DRC_CURVE: [CurvePoint; 4] = [pt(1, -35.7), pt(33, -26.1), pt(66, -13.2), pt(100, 0.0)];
pub const SPEAKER_MEDIA_DRC_CURVE: [CurvePoint; 4] = [pt(1, -55.0), pt(20, -43.0), pt(86, -12.0), pt(100, 0.0)];
pub const DEFAULT_SYSTEM_DRC_CURVE: [CurvePoint; 4] = [pt(1, -34.0), pt(33, -24.0), pt(66, -15.0), pt(100, -6.0)];

/// Sorted breakpoints mapping curve index to attenuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeCurve {
    points: Vec<CurvePoint>,
}

impl VolumeCurve {
    /// Build a curve; breakpoints must be strictly increasing in index and
    /// lie within 0..=100
    pub fn new(points: Vec<CurvePoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(PolicyError::bad_value("volume curve has no points"));
        }
        if points.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(PolicyError::bad_value("volume curve indexes must be strictly increasing"));
        }
        if points.iter().any(|p| p.index > CURVE_INDEX_MAX) {
            return Err(PolicyError::bad_value("volume curve index above 100"));
        }
        Ok(Self { points })
    }

    fn from_const(points: &[CurvePoint]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Attenuation at a position in curve space, clamped to the borders
    pub fn db_at(&self, position: f32) -> f32 {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return 0.0,
        };
        if position <= first.index as f32 {
            return first.db;
        }
        if position >= last.index as f32 {
            return last.db;
        }
        if let Some(exact) = self.points.iter().find(|p| p.index as f32 == position) {
            return exact.db;
        }
        for pair in self.points.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if position < hi.index as f32 {
                let span = (hi.index - lo.index) as f32;
                let t = (position - lo.index as f32) / span;
                return lo.db + t * (hi.db - lo.db);
            }
        }
        last.db
    }
}

/// Scale a UI index into curve space and read the attenuation
pub fn vol_index_to_db(curve: &VolumeCurve, index: u32, index_min: u32, index_max: u32) -> f32 {
    let position = if index_max <= index_min {
        CURVE_INDEX_MAX as f32
    } else {
        let clamped = index.clamp(index_min, index_max);
        (clamped - index_min) as f32 * CURVE_INDEX_MAX as f32 / (index_max - index_min) as f32
    };
    curve.db_at(position)
}

pub fn db_to_amplitude(db: f32) -> f32 {
    if db <= VOLUME_MIN_DB {
        return 0.0;
    }
    10f32.powf(db / 20.0)
}

/// Single device whose curve applies when a stream plays on several devices
pub fn device_for_volume(devices: &DeviceTypeSet) -> Option<DeviceType> {
    if devices.contains(DeviceType::Speaker) {
        return Some(DeviceType::Speaker);
    }
    if devices.contains(DeviceType::SpeakerSafe) {
        return Some(DeviceType::SpeakerSafe);
    }
    devices.find(DeviceType::is_a2dp).or_else(|| devices.first())
}

/// Index range and current indexes of one stream type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub index_min: u32,
    pub index_max: u32,
    default_index: u32,
    indexes: BTreeMap<DeviceType, u32>,
}

impl StreamDescriptor {
    pub fn new(index_min: u32, index_max: u32) -> Self {
        Self {
            index_min,
            index_max,
            default_index: index_max,
            indexes: BTreeMap::new(),
        }
    }

    pub fn default_for(stream: StreamType) -> Self {
        let (min, max) = match stream {
            StreamType::VoiceCall => (1, 5),
            StreamType::System | StreamType::Ring | StreamType::Notification => (0, 7),
            StreamType::EnforcedAudible => (0, 7),
            StreamType::Alarm => (1, 7),
            StreamType::Music | StreamType::BluetoothSco | StreamType::Dtmf | StreamType::Tts => (0, 15),
            StreamType::Accessibility => (1, 15),
            StreamType::Rerouting | StreamType::Patch => (0, 1),
        };
        Self::new(min, max)
    }

    pub fn set_range(&mut self, index_min: u32, index_max: u32) -> Result<()> {
        if index_min >= index_max {
            return Err(PolicyError::bad_value(format!(
                "invalid volume range {}..{}",
                index_min, index_max
            )));
        }
        self.index_min = index_min;
        self.index_max = index_max;
        self.default_index = self.default_index.clamp(index_min, index_max);
        for index in self.indexes.values_mut() {
            *index = (*index).clamp(index_min, index_max);
        }
        Ok(())
    }

    /// Index for a device, falling back to the default index
    pub fn index_for(&self, device: Option<DeviceType>) -> u32 {
        device
            .and_then(|d| self.indexes.get(&d).copied())
            .unwrap_or(self.default_index)
    }

    /// Store an index; without a device it becomes the default and clears
    /// every per-device override
    pub fn set_index(&mut self, device: Option<DeviceType>, index: u32) -> Result<()> {
        if index < self.index_min || index > self.index_max {
            return Err(PolicyError::bad_value(format!(
                "volume index {} outside {}..{}",
                index, self.index_min, self.index_max
            )));
        }
        match device {
            Some(d) => {
                self.indexes.insert(d, index);
            }
            None => {
                self.indexes.clear();
                self.default_index = index;
            }
        }
        Ok(())
    }

    pub fn per_device(&self) -> impl Iterator<Item = (DeviceType, u32)> + '_ {
        self.indexes.iter().map(|(d, i)| (*d, *i))
    }
}

/// Inputs to the special volume rules that depend on other streams
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeContext {
    /// Music played recently or ringtone volume is being limited
    pub music_active: bool,
    /// Attenuation of music on its current device
    pub music_db: f32,
    /// Attenuation of the ringtone when one is audible
    pub ring_db: Option<f32>,
    /// System enforced-audible forced use is set
    pub system_enforced: bool,
    /// The output also plays on an in-ear device besides the curve device
    pub in_ear_route: bool,
}

/// Curves and stream descriptors for every stream type
#[derive(Debug, Clone)]
pub struct VolumeTable {
    curves: Vec<[VolumeCurve; 4]>,
    streams: Vec<StreamDescriptor>,
}

impl Default for VolumeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeTable {
    pub fn new() -> Self {
        let curves = StreamType::ALL
            .iter()
            .map(|s| default_curves(*s).map(|c| VolumeCurve::from_const(c)))
            .collect();
        let streams = StreamType::ALL
            .iter()
            .map(|s| StreamDescriptor::default_for(*s))
            .collect();
        Self { curves, streams }
    }

    pub fn curve(&self, stream: StreamType, category: DeviceCategory) -> &VolumeCurve {
        &self.curves[stream.index()][category.index()]
    }

    pub fn set_curve(&mut self, stream: StreamType, category: DeviceCategory, curve: VolumeCurve) {
        self.curves[stream.index()][category.index()] = curve;
    }

    /// Speaker curves for hardware applying dynamic range compression
    pub fn apply_speaker_drc(&mut self) {
        let speaker = DeviceCategory::Speaker;
        self.set_curve(StreamType::System, speaker, VolumeCurve::from_const(&DEFAULT_SYSTEM_DRC_CURVE));
        for stream in [StreamType::Ring, StreamType::Alarm, StreamType::Notification] {
            self.set_curve(stream, speaker, VolumeCurve::from_const(&SPEAKER_SONIFICATION_DRC_CURVE));
        }
        self.set_curve(StreamType::Music, speaker, VolumeCurve::from_const(&SPEAKER_MEDIA_DRC_CURVE));
    }

    pub fn stream(&self, stream: StreamType) -> &StreamDescriptor {
        &self.streams[stream.index()]
    }

    pub fn stream_mut(&mut self, stream: StreamType) -> &mut StreamDescriptor {
        &mut self.streams[stream.index()]
    }

    /// Raw curve lookup for a stream index on a device
    pub fn vol_index_to_db(&self, stream: StreamType, index: u32, device: DeviceType) -> f32 {
        let desc = self.stream(stream);
        vol_index_to_db(
            self.curve(stream, device.category()),
            index,
            desc.index_min,
            desc.index_max,
        )
    }

    /// Attenuation to apply for a stream index on a device
    pub fn compute_volume(&self, stream: StreamType, index: u32, device: DeviceType, ctx: &VolumeContext) -> f32 {
        if index == 0 && stream.can_be_muted() {
            return VOLUME_MIN_DB;
        }
        let mut db = self.vol_index_to_db(stream, index, device);

        if stream == StreamType::Accessibility {
            if let Some(ring_db) = ctx.ring_db {
                let floor = ring_db - ACCESSIBILITY_RING_HEADROOM_DB;
                if floor > db {
                    db = floor;
                }
            }
        }

        let strategy = Strategy::for_stream(stream);
        let sonification_family = matches!(strategy, Strategy::Sonification | Strategy::SonificationRespectful)
            || stream == StreamType::System
            || (strategy == Strategy::EnforcedAudible && !ctx.system_enforced);
        if (device.is_in_ear() || ctx.in_ear_route) && sonification_family && stream.can_be_muted() {
            db += SONIFICATION_HEADSET_VOLUME_FACTOR_DB;
            if ctx.music_active {
                let cap = ctx.music_db.max(SONIFICATION_HEADSET_VOLUME_MIN_DB);
                if db > cap {
                    db = cap;
                }
            }
        }
        db
    }
}

fn default_curves(stream: StreamType) -> [&'static [CurvePoint]; 4] {
    // order: headset, speaker, earpiece, ext media
    match stream {
        StreamType::VoiceCall | StreamType::BluetoothSco => {
            [&DEFAULT_VOICE_CURVE, &SPEAKER_VOICE_CURVE, &DEFAULT_VOICE_CURVE, &DEFAULT_MEDIA_CURVE]
        }
        StreamType::System | StreamType::EnforcedAudible | StreamType::Dtmf => {
            [&HEADSET_SYSTEM_CURVE, &DEFAULT_SYSTEM_CURVE, &DEFAULT_SYSTEM_CURVE, &DEFAULT_MEDIA_CURVE]
        }
        StreamType::Ring | StreamType::Alarm | StreamType::Notification => {
            [&DEFAULT_CURVE, &SPEAKER_SONIFICATION_CURVE, &DEFAULT_CURVE, &DEFAULT_MEDIA_CURVE]
        }
        StreamType::Music => [&DEFAULT_MEDIA_CURVE, &SPEAKER_MEDIA_CURVE, &DEFAULT_MEDIA_CURVE, &DEFAULT_MEDIA_CURVE],
        StreamType::Tts => [&SILENT_CURVE, &FULL_SCALE_CURVE, &SILENT_CURVE, &SILENT_CURVE],
        StreamType::Accessibility => [&NON_MUTABLE_CURVE[..]; 4],
        StreamType::Rerouting | StreamType::Patch => [&FULL_SCALE_CURVE[..]; 4],
    }
}
