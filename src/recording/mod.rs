// Recording module - captured motion windows used as calibration input
//
// This module provides three components:
// 1. Recording: per-tracker frame sequences captured in one window
// 2. Recorder: samples a TrackerSource into a Recording on its own thread
// 3. RecordingStore: versioned on-disk containers for recordings

use nalgebra::{UnitQuaternion, Vector3};

use crate::error::CalibrationError;
use crate::tracking::{BodyPart, TrackerInfo};

pub mod recorder;
pub mod store;

pub use recorder::{CaptureControl, CaptureHandle, CaptureOutcome, PendingRecording, Recorder};
pub use store::RecordingStore;

/// Presence bitset describing which data a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDataFlags(u8);

impl FrameDataFlags {
    pub const ROTATION: u8 = 1;
    pub const POSITION: u8 = 1 << 1;
    pub const ACCELERATION: u8 = 1 << 2;
    pub const RAW_ROTATION: u8 = 1 << 3;
    const ALL: u8 = Self::ROTATION | Self::POSITION | Self::ACCELERATION | Self::RAW_ROTATION;

    /// Rejects bits outside the known set.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Where a frame's resolved rotation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationSource {
    /// Rotation after mounting/drift adjustment
    Adjusted,
    /// Rotation as reported by the sensor
    Raw,
}

/// One sample of one tracker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackerFrame {
    pub rotation: Option<UnitQuaternion<f32>>,
    pub position: Option<Vector3<f32>>,
    pub acceleration: Option<Vector3<f32>>,
    pub raw_rotation: Option<UnitQuaternion<f32>>,
}

impl TrackerFrame {
    /// Frame with no data, used when a tracker misses a sample.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> FrameDataFlags {
        let mut bits = 0;
        if self.rotation.is_some() {
            bits |= FrameDataFlags::ROTATION;
        }
        if self.position.is_some() {
            bits |= FrameDataFlags::POSITION;
        }
        if self.acceleration.is_some() {
            bits |= FrameDataFlags::ACCELERATION;
        }
        if self.raw_rotation.is_some() {
            bits |= FrameDataFlags::RAW_ROTATION;
        }
        FrameDataFlags(bits)
    }

    /// Rotation to use for kinematics.
    ///
    /// Precedence: adjusted rotation, then raw rotation, then `None`. The
    /// caller decides the default for `None` (the skeleton uses identity).
    pub fn resolved_rotation(&self) -> Option<(UnitQuaternion<f32>, RotationSource)> {
        if let Some(rotation) = self.rotation {
            return Some((rotation, RotationSource::Adjusted));
        }
        if let Some(raw) = self.raw_rotation {
            return Some((raw, RotationSource::Raw));
        }
        None
    }
}

/// Frame sequence of one tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerFrames {
    pub tracker: TrackerInfo,
    pub frames: Vec<TrackerFrame>,
}

impl TrackerFrames {
    pub fn new(tracker: TrackerInfo) -> Self {
        Self {
            tracker,
            frames: Vec::new(),
        }
    }

    pub fn body_part(&self) -> Option<BodyPart> {
        self.tracker.body_part
    }

    pub fn frame(&self, index: usize) -> Option<&TrackerFrame> {
        self.frames.get(index)
    }

    /// True when at least one frame carries a usable rotation.
    pub fn has_rotation(&self) -> bool {
        self.frames.iter().any(|f| f.resolved_rotation().is_some())
    }
}

/// Captured window of per-tracker motion samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Recording {
    pub trackers: Vec<TrackerFrames>,
}

impl Recording {
    pub fn new(trackers: Vec<TrackerFrames>) -> Self {
        Self { trackers }
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn max_frame_count(&self) -> usize {
        self.trackers
            .iter()
            .map(|t| t.frames.len())
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.max_frame_count() == 0
    }

    /// Check the processing invariant: at least one tracker and at least
    /// one frame.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.trackers.is_empty() {
            return Err(CalibrationError::empty("recording has no trackers"));
        }
        if self.max_frame_count() == 0 {
            return Err(CalibrationError::empty(format!(
                "all {} trackers have zero frames",
                self.trackers.len()
            )));
        }
        Ok(())
    }

    /// First tracker sequence assigned to `part`.
    pub fn tracker_for(&self, part: BodyPart) -> Option<&TrackerFrames> {
        self.trackers.iter().find(|t| t.body_part() == Some(part))
    }
}
