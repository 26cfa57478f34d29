// Skeleton model - segment catalogue and forward kinematics
//
// The calibration core only needs a small slice of the full skeleton: the
// chain from the head down to both feet. Each segment is oriented by the
// first body part in its precedence list that has a tracker; segments with
// no tracker at all are "unmeasured" and keep their prior length.

use std::collections::BTreeMap;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::recording::Recording;
use crate::tracking::BodyPart;

pub mod config_store;

pub use config_store::{SkeletonConfigApplier, SkeletonConfigStore};

/// Skeletal segment whose length calibration estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkeletonSegment {
    Neck,
    UpperChest,
    Chest,
    Waist,
    Hip,
    HipsWidth,
    UpperLeg,
    LowerLeg,
}

impl SkeletonSegment {
    pub const ALL: [SkeletonSegment; 8] = [
        SkeletonSegment::Neck,
        SkeletonSegment::UpperChest,
        SkeletonSegment::Chest,
        SkeletonSegment::Waist,
        SkeletonSegment::Hip,
        SkeletonSegment::HipsWidth,
        SkeletonSegment::UpperLeg,
        SkeletonSegment::LowerLeg,
    ];

    /// Prior length in meters, used when a segment cannot be measured.
    pub fn default_length(&self) -> f32 {
        match self {
            SkeletonSegment::Neck => 0.10,
            SkeletonSegment::UpperChest => 0.16,
            SkeletonSegment::Chest => 0.16,
            SkeletonSegment::Waist => 0.20,
            SkeletonSegment::Hip => 0.04,
            SkeletonSegment::HipsWidth => 0.26,
            SkeletonSegment::UpperLeg => 0.42,
            SkeletonSegment::LowerLeg => 0.50,
        }
    }

    /// Plausible (min, max) length in meters; optimizer steps are clamped
    /// into this range.
    pub fn bounds(&self) -> (f32, f32) {
        match self {
            SkeletonSegment::Neck => (0.02, 0.30),
            SkeletonSegment::UpperChest => (0.02, 0.50),
            SkeletonSegment::Chest => (0.02, 0.50),
            SkeletonSegment::Waist => (0.02, 0.60),
            SkeletonSegment::Hip => (0.01, 0.30),
            SkeletonSegment::HipsWidth => (0.10, 0.60),
            SkeletonSegment::UpperLeg => (0.10, 1.00),
            SkeletonSegment::LowerLeg => (0.10, 1.00),
        }
    }

    /// Whether the segment contributes to standing eye height.
    pub fn is_vertical(&self) -> bool {
        !matches!(self, SkeletonSegment::HipsWidth)
    }

    /// Body parts whose rotation orients this segment, highest priority
    /// first. Leg segments list the left side; the right side mirrors it.
    pub fn orientation_parts(&self, side: Side) -> &'static [BodyPart] {
        match (self, side) {
            (SkeletonSegment::Neck, _) => &[BodyPart::Neck, BodyPart::Head],
            (SkeletonSegment::UpperChest, _) => &[BodyPart::UpperChest, BodyPart::Chest],
            (SkeletonSegment::Chest, _) => &[BodyPart::Chest, BodyPart::UpperChest],
            (SkeletonSegment::Waist, _) => &[BodyPart::Waist, BodyPart::Hip],
            (SkeletonSegment::Hip, _) => &[BodyPart::Hip, BodyPart::Waist],
            (SkeletonSegment::HipsWidth, _) => &[BodyPart::Hip, BodyPart::Waist],
            (SkeletonSegment::UpperLeg, Side::Left) => &[BodyPart::LeftUpperLeg],
            (SkeletonSegment::UpperLeg, Side::Right) => &[BodyPart::RightUpperLeg],
            (SkeletonSegment::LowerLeg, Side::Left) => {
                &[BodyPart::LeftLowerLeg, BodyPart::LeftUpperLeg]
            }
            (SkeletonSegment::LowerLeg, Side::Right) => {
                &[BodyPart::RightLowerLeg, BodyPart::RightUpperLeg]
            }
        }
    }

    /// A segment is measured when the recording holds rotation data for at
    /// least one of its orientation parts. Hips width additionally needs
    /// both upper legs, since it only shows up in the left/right offset.
    pub fn is_measured_by(&self, recording: &Recording) -> bool {
        let covered = |parts: &[BodyPart]| {
            parts.iter().any(|part| {
                recording
                    .tracker_for(*part)
                    .map(|t| t.has_rotation())
                    .unwrap_or(false)
            })
        };

        match self {
            SkeletonSegment::HipsWidth => {
                covered(self.orientation_parts(Side::Left))
                    && covered(&[BodyPart::LeftUpperLeg])
                    && covered(&[BodyPart::RightUpperLeg])
            }
            _ => {
                covered(self.orientation_parts(Side::Left))
                    || covered(self.orientation_parts(Side::Right))
            }
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SkeletonSegment::Neck => "NECK",
            SkeletonSegment::UpperChest => "UPPER CHEST",
            SkeletonSegment::Chest => "CHEST",
            SkeletonSegment::Waist => "WAIST",
            SkeletonSegment::Hip => "HIP",
            SkeletonSegment::HipsWidth => "HIPS WIDTH",
            SkeletonSegment::UpperLeg => "UPPER LEG",
            SkeletonSegment::LowerLeg => "LOWER LEG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Length per segment in meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentLengths(BTreeMap<SkeletonSegment, f32>);

impl SegmentLengths {
    /// Every segment at its prior length.
    pub fn defaults() -> Self {
        Self(
            SkeletonSegment::ALL
                .iter()
                .map(|s| (*s, s.default_length()))
                .collect(),
        )
    }

    /// Length of `segment`, falling back to its prior when absent.
    pub fn get(&self, segment: SkeletonSegment) -> f32 {
        self.0
            .get(&segment)
            .copied()
            .unwrap_or_else(|| segment.default_length())
    }

    pub fn set(&mut self, segment: SkeletonSegment, length: f32) {
        self.0.insert(segment, length);
    }

    pub fn iter(&self) -> impl Iterator<Item = (SkeletonSegment, f32)> + '_ {
        self.0.iter().map(|(s, l)| (*s, *l))
    }

    /// Standing eye height implied by the vertical segments.
    pub fn estimated_height(&self) -> f32 {
        SkeletonSegment::ALL
            .iter()
            .filter(|s| s.is_vertical())
            .map(|s| self.get(*s))
            .sum()
    }

    pub fn is_finite(&self) -> bool {
        self.0.values().all(|l| l.is_finite())
    }
}

impl Default for SegmentLengths {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Resolved rotations of every body part at one frame index.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePose {
    rotations: [Option<UnitQuaternion<f32>>; BodyPart::COUNT],
    /// Head position, when the head tracker reports one.
    pub root: Option<Vector3<f32>>,
}

impl FramePose {
    pub fn new() -> Self {
        Self {
            rotations: [None; BodyPart::COUNT],
            root: None,
        }
    }

    /// Build the pose at `index`. When several trackers share a body part
    /// the first one in the recording wins.
    pub fn from_recording(recording: &Recording, index: usize) -> Self {
        let mut pose = Self::new();
        for part in BodyPart::ALL {
            let Some(frame) = recording.tracker_for(part).and_then(|t| t.frame(index)) else {
                continue;
            };
            if let Some((rotation, _)) = frame.resolved_rotation() {
                pose.rotations[part.index()] = Some(rotation);
            }
            if part == BodyPart::Head {
                pose.root = frame.position;
            }
        }
        pose
    }

    pub fn with_rotation(mut self, part: BodyPart, rotation: UnitQuaternion<f32>) -> Self {
        self.rotations[part.index()] = Some(rotation);
        self
    }

    pub fn rotation(&self, part: BodyPart) -> Option<UnitQuaternion<f32>> {
        self.rotations[part.index()]
    }

    /// First available rotation in `parts`, identity when none is present.
    pub fn orientation(&self, parts: &[BodyPart]) -> UnitQuaternion<f32> {
        parts
            .iter()
            .find_map(|part| self.rotation(*part))
            .unwrap_or_else(UnitQuaternion::identity)
    }

    fn segment_orientation(&self, segment: SkeletonSegment, side: Side) -> UnitQuaternion<f32> {
        self.orientation(segment.orientation_parts(side))
    }
}

impl Default for FramePose {
    fn default() -> Self {
        Self::new()
    }
}

/// World-space foot positions produced by forward kinematics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeetPositions {
    pub left: Vector3<f32>,
    pub right: Vector3<f32>,
}

fn bone_down(rotation: UnitQuaternion<f32>, length: f32) -> Vector3<f32> {
    rotation * Vector3::new(0.0, -length, 0.0)
}

/// Walk the chain head → hip → both feet. Left is -X.
pub fn feet_positions(lengths: &SegmentLengths, pose: &FramePose) -> FeetPositions {
    let root = pose.root.unwrap_or_else(Vector3::zeros);

    let spine = [
        SkeletonSegment::Neck,
        SkeletonSegment::UpperChest,
        SkeletonSegment::Chest,
        SkeletonSegment::Waist,
        SkeletonSegment::Hip,
    ]
    .iter()
    .fold(Vector3::zeros(), |acc, segment| {
        acc + bone_down(
            pose.segment_orientation(*segment, Side::Left),
            lengths.get(*segment),
        )
    });
    let hip_center = root + spine;

    let hip_rotation = pose.segment_orientation(SkeletonSegment::HipsWidth, Side::Left);
    let half_width = hip_rotation
        * Vector3::new(lengths.get(SkeletonSegment::HipsWidth) / 2.0, 0.0, 0.0);

    let leg = |side: Side| {
        bone_down(
            pose.segment_orientation(SkeletonSegment::UpperLeg, side),
            lengths.get(SkeletonSegment::UpperLeg),
        ) + bone_down(
            pose.segment_orientation(SkeletonSegment::LowerLeg, side),
            lengths.get(SkeletonSegment::LowerLeg),
        )
    };

    FeetPositions {
        left: hip_center - half_width + leg(Side::Left),
        right: hip_center + half_width + leg(Side::Right),
    }
}
