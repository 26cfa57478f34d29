use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::recording::TrackerFrame;
use crate::skeleton::{feet_positions, FramePose, SegmentLengths, SkeletonSegment};

use super::{BodyPart, TrackerInfo, TrackerReading, TrackerSource};

/// Phase advance per poll, in radians.
const PHASE_STEP: f32 = 0.15;

/// Deterministic tracker source used for testing and CLI tooling.
///
/// Simulates a person with known segment lengths doing slow squats while
/// leaning and swaying, feet planted. The head tracker reports the position
/// that keeps both feet fixed on the floor, so a recording taken from this
/// source is consistent with the true lengths.
pub struct SyntheticTrackerSource {
    true_lengths: SegmentLengths,
    parts: Vec<BodyPart>,
    tick: AtomicU64,
    not_ready: Mutex<Option<String>>,
    jitter: Option<(f32, Mutex<StdRng>)>,
}

impl SyntheticTrackerSource {
    /// Source with trackers on `parts` only.
    pub fn new(true_lengths: SegmentLengths, parts: &[BodyPart]) -> Self {
        Self {
            true_lengths,
            parts: parts.to_vec(),
            tick: AtomicU64::new(0),
            not_ready: Mutex::new(None),
            jitter: None,
        }
    }

    /// Head, chest, hip and both legs.
    pub fn full_body(true_lengths: SegmentLengths) -> Self {
        Self::new(
            true_lengths,
            &[
                BodyPart::Head,
                BodyPart::Chest,
                BodyPart::Hip,
                BodyPart::LeftUpperLeg,
                BodyPart::RightUpperLeg,
                BodyPart::LeftLowerLeg,
                BodyPart::RightLowerLeg,
            ],
        )
    }

    /// Add seeded uniform noise of +-`amplitude` meters to head positions.
    pub fn with_jitter(mut self, amplitude: f32, seed: u64) -> Self {
        self.jitter = Some((amplitude, Mutex::new(StdRng::seed_from_u64(seed))));
        self
    }

    /// Make `readiness` fail with `reason` until [`set_ready`] is called.
    ///
    /// [`set_ready`]: SyntheticTrackerSource::set_ready
    pub fn set_not_ready(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.not_ready.lock() {
            *guard = Some(reason.into());
        }
    }

    pub fn set_ready(&self) {
        if let Ok(mut guard) = self.not_ready.lock() {
            *guard = None;
        }
    }

    pub fn true_lengths(&self) -> &SegmentLengths {
        &self.true_lengths
    }

    /// Number of polls served so far.
    pub fn ticks(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Ground-truth pose at `tick`, with every body part rotated and the
    /// head placed so the feet stay planted.
    pub fn pose_at(&self, tick: u64) -> FramePose {
        let phase = tick as f32 * PHASE_STEP;
        let lean = 0.30 * phase.sin();
        let sway = 0.12 * (phase * 0.45).sin();
        let bend = 0.45 * (1.0 - (phase * 0.7).cos());

        let pitch = |angle: f32| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), angle);
        let roll = |angle: f32| UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle);

        let head = pitch(0.5 * lean);
        let torso = roll(sway) * pitch(lean);
        let pelvis = pitch(0.6 * lean);
        let thigh = pitch(-bend);
        let shin = pitch(bend);

        let mut pose = FramePose::new()
            .with_rotation(BodyPart::Head, head)
            .with_rotation(BodyPart::Neck, head)
            .with_rotation(BodyPart::UpperChest, torso)
            .with_rotation(BodyPart::Chest, torso)
            .with_rotation(BodyPart::Waist, pelvis)
            .with_rotation(BodyPart::Hip, pelvis)
            .with_rotation(BodyPart::LeftUpperLeg, thigh)
            .with_rotation(BodyPart::RightUpperLeg, thigh)
            .with_rotation(BodyPart::LeftLowerLeg, shin)
            .with_rotation(BodyPart::RightLowerLeg, shin)
            .with_rotation(BodyPart::LeftFoot, UnitQuaternion::identity())
            .with_rotation(BodyPart::RightFoot, UnitQuaternion::identity());

        // Left foot planted at (-w/2, 0, 0); legs move symmetrically so the
        // right foot stays planted too.
        let relative = feet_positions(&self.true_lengths, &pose);
        let planted = Vector3::new(
            -self.true_lengths.get(SkeletonSegment::HipsWidth) / 2.0,
            0.0,
            0.0,
        );
        pose.root = Some(planted - relative.left);
        pose
    }

    fn frame_for(&self, part: BodyPart, pose: &FramePose) -> TrackerFrame {
        let mut frame = TrackerFrame {
            rotation: pose.rotation(part),
            ..TrackerFrame::default()
        };
        if part == BodyPart::Head {
            frame.position = pose.root.map(|root| root + self.jitter_offset());
        }
        frame
    }

    fn jitter_offset(&self) -> Vector3<f32> {
        let Some((amplitude, rng)) = &self.jitter else {
            return Vector3::zeros();
        };
        match rng.lock() {
            Ok(mut rng) => Vector3::new(
                rng.gen_range(-*amplitude..=*amplitude),
                rng.gen_range(-*amplitude..=*amplitude),
                rng.gen_range(-*amplitude..=*amplitude),
            ),
            Err(_) => Vector3::zeros(),
        }
    }
}

impl TrackerSource for SyntheticTrackerSource {
    fn readiness(&self) -> Result<(), String> {
        match self.not_ready.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(reason) => Err(reason.clone()),
                None => Ok(()),
            },
            Err(_) => Err("synthetic source state poisoned".to_string()),
        }
    }

    fn trackers(&self) -> Vec<TrackerInfo> {
        self.parts
            .iter()
            .enumerate()
            .map(|(index, part)| TrackerInfo::new(index as u32 + 1, part.display_name(), Some(*part)))
            .collect()
    }

    fn poll(&self) -> Vec<TrackerReading> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        let pose = self.pose_at(tick);
        self.parts
            .iter()
            .enumerate()
            .map(|(index, part)| TrackerReading {
                tracker_id: index as u32 + 1,
                frame: self.frame_for(*part, &pose),
            })
            .collect()
    }
}
