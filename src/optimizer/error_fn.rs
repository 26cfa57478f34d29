// Error terms scored for one frame pair
//
// All terms are in meters (proportion is a squared ratio deviation). The
// optimizer minimises the weighted sum by finite differences, so every term
// must stay continuous in the segment lengths.

use crate::config::OptimizerConfig;
use crate::skeleton::{feet_positions, FeetPositions, FramePose, SegmentLengths, SkeletonSegment};

/// Mean displacement of each foot between two frames.
///
/// Feet are assumed planted during calibration, so any movement means the
/// lengths disagree with the recorded rotations.
pub fn slide_error(a: &FeetPositions, b: &FeetPositions) -> f32 {
    ((a.left - b.left).norm() + (a.right - b.right).norm()) / 2.0
}

/// Change of the left-to-right foot vector between two frames.
pub fn offset_slide_error(a: &FeetPositions, b: &FeetPositions) -> f32 {
    ((a.right - a.left) - (b.right - b.left)).norm()
}

/// Absolute difference between estimated and target height.
pub fn height_error(lengths: &SegmentLengths, target_height: f32) -> f32 {
    (lengths.estimated_height() - target_height).abs()
}

/// Squared excess of each vertical segment's length/height ratio over the
/// tolerance band around its default ratio.
pub fn proportion_error(lengths: &SegmentLengths, target_height: f32, tolerance: f32) -> f32 {
    if target_height <= 0.0 {
        return 0.0;
    }
    let default_height = SegmentLengths::defaults().estimated_height();

    SkeletonSegment::ALL
        .iter()
        .filter(|segment| segment.is_vertical())
        .map(|segment| {
            let expected = segment.default_length() / default_height;
            let ratio = lengths.get(*segment) / target_height;
            let excess = (ratio - expected).abs() - tolerance;
            if excess > 0.0 {
                excess * excess
            } else {
                0.0
            }
        })
        .sum()
}

/// Weighted error of `lengths` for the frame pair (`a`, `b`).
pub fn pair_error(
    config: &OptimizerConfig,
    lengths: &SegmentLengths,
    a: &FramePose,
    b: &FramePose,
    target_height: f32,
) -> f32 {
    let feet_a = feet_positions(lengths, a);
    let feet_b = feet_positions(lengths, b);

    let mut error = 0.0;
    if config.slide_error_factor != 0.0 {
        error += config.slide_error_factor * slide_error(&feet_a, &feet_b);
    }
    if config.offset_slide_error_factor != 0.0 {
        error += config.offset_slide_error_factor * offset_slide_error(&feet_a, &feet_b);
    }
    if config.height_error_factor != 0.0 {
        error += config.height_error_factor * height_error(lengths, target_height);
    }
    if config.body_proportion_error_factor != 0.0 {
        error += config.body_proportion_error_factor
            * proportion_error(lengths, target_height, config.body_proportion_tolerance);
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn feet(left: [f32; 3], right: [f32; 3]) -> FeetPositions {
        FeetPositions {
            left: Vector3::from(left),
            right: Vector3::from(right),
        }
    }

    #[test]
    fn test_slide_error_is_mean_of_both_feet() {
        let a = feet([0.0, 0.0, 0.0], [0.3, 0.0, 0.0]);
        let b = feet([0.0, 0.0, 0.2], [0.3, 0.0, 0.0]);
        assert!((slide_error(&a, &b) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_offset_slide_ignores_common_translation() {
        let a = feet([0.0, 0.0, 0.0], [0.3, 0.0, 0.0]);
        let b = feet([0.5, 0.1, 0.0], [0.8, 0.1, 0.0]);
        assert!(offset_slide_error(&a, &b) < 1e-6);
        assert!(slide_error(&a, &b) > 0.4);
    }

    #[test]
    fn test_default_proportions_inside_band() {
        let lengths = SegmentLengths::defaults();
        let height = lengths.estimated_height();
        assert_eq!(proportion_error(&lengths, height, 0.02), 0.0);
    }

    #[test]
    fn test_distorted_proportions_penalised() {
        let mut lengths = SegmentLengths::defaults();
        let height = lengths.estimated_height();
        lengths.set(SkeletonSegment::Neck, 0.40);
        assert!(proportion_error(&lengths, height, 0.02) > 0.0);
    }

    #[test]
    fn test_static_pose_has_only_height_error() {
        let config = OptimizerConfig::default();
        let lengths = SegmentLengths::defaults();
        let pose = FramePose::new().with_rotation(
            crate::tracking::BodyPart::Hip,
            UnitQuaternion::from_euler_angles(0.2, 0.0, 0.0),
        );

        let error = pair_error(&config, &lengths, &pose, &pose, 1.48);
        assert!((error - 0.10).abs() < 1e-4);
    }
}
