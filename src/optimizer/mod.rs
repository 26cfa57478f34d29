// Optimizer - iterative segment-length estimation from a recording
//
// Each epoch walks frame pairs (i, j) and nudges every measured segment
// against the central finite-difference gradient of the pair error. The
// pair order is shuffled with a seeded RNG, so a given recording and
// configuration always produce the same result.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::OptimizerConfig;
use crate::error::CalibrationError;
use crate::recording::Recording;
use crate::skeleton::{FramePose, SegmentLengths, SkeletonSegment};
use crate::tracking::BodyPart;

pub mod aggregate;
pub mod error_fn;
pub mod stats;

pub use aggregate::{BatchFailure, BatchOutcome, BodyRatios, RecordingOutcome, ResultAggregator};
pub use stats::ErrorStatistics;

/// Whether a length was estimated or kept from the prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSource {
    Measured,
    /// No tracker orients the segment; the initial length was kept.
    Default,
}

/// Where the target height came from, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHeightSource {
    /// `target_hmd_height` from the optimizer configuration
    Configured,
    /// Mean head tracker height over the recording
    HeadTracker,
    /// Height implied by the initial lengths
    SkeletonDefault,
}

/// Progress after one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// 1-based
    pub epoch: u32,
    pub total_epochs: u32,
    /// Mean pair error over the epoch
    pub epoch_error: f32,
    pub adjust_rate: f32,
    pub lengths: SegmentLengths,
}

/// Output of one optimizer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub lengths: SegmentLengths,
    pub sources: BTreeMap<SkeletonSegment, LengthSource>,
    /// Estimated height minus target height, in meters
    pub height_difference: f32,
    pub target_height: f32,
    pub target_source: TargetHeightSource,
    /// Mean pair error of the final lengths
    pub final_error: f32,
    pub epochs: u32,
}

impl CalibrationResult {
    pub fn estimated_height(&self) -> f32 {
        self.lengths.estimated_height()
    }

    pub fn source(&self, segment: SkeletonSegment) -> LengthSource {
        self.sources
            .get(&segment)
            .copied()
            .unwrap_or(LengthSource::Default)
    }
}

/// Pure numerical engine; holds no state between runs.
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Resolve the target height.
    ///
    /// Precedence: configured `target_hmd_height`, then the mean height of
    /// the head tracker's reported positions, then the height implied by
    /// `initial`.
    pub fn target_height(
        &self,
        recording: &Recording,
        initial: &SegmentLengths,
    ) -> (f32, TargetHeightSource) {
        if let Some(height) = self.config.target_hmd_height.filter(|h| h.is_finite() && *h > 0.0) {
            return (height, TargetHeightSource::Configured);
        }

        let head_heights: Vec<f32> = recording
            .tracker_for(BodyPart::Head)
            .map(|head| {
                head.frames
                    .iter()
                    .filter_map(|frame| frame.position.map(|p| p.y))
                    .filter(|y| y.is_finite())
                    .collect()
            })
            .unwrap_or_default();
        if !head_heights.is_empty() {
            let mean = head_heights.iter().sum::<f32>() / head_heights.len() as f32;
            if mean > 0.0 {
                return (mean, TargetHeightSource::HeadTracker);
            }
        }

        (initial.estimated_height(), TargetHeightSource::SkeletonDefault)
    }

    /// Frame pairs walked every epoch, in unshuffled order.
    fn frame_pairs(&self, frame_count: usize) -> Result<Vec<(usize, usize)>, CalibrationError> {
        let min_distance = self.config.min_data_distance.max(1);
        let max_distance = self.config.max_data_distance.max(min_distance);
        let step = self.config.cursor_increment.max(1);

        let mut pairs = Vec::new();
        for distance in min_distance..=max_distance {
            let mut cursor = 0;
            while cursor + distance < frame_count {
                pairs.push((cursor, cursor + distance));
                cursor += step;
            }
        }

        if pairs.is_empty() {
            return Err(CalibrationError::optimization(format!(
                "recording has {} frames; at least {} are needed to form a frame pair",
                frame_count,
                min_distance + 1
            )));
        }
        Ok(pairs)
    }

    /// Mean pair error of `lengths` over `recording`, with the resolved
    /// target height.
    pub fn evaluate(
        &self,
        recording: &Recording,
        lengths: &SegmentLengths,
    ) -> Result<f32, CalibrationError> {
        recording.validate()?;
        let poses = poses_of(recording);
        let pairs = self.frame_pairs(poses.len())?;
        let (target, _) = self.target_height(recording, lengths);
        Ok(self.mean_error(&poses, &pairs, lengths, target))
    }

    fn mean_error(
        &self,
        poses: &[FramePose],
        pairs: &[(usize, usize)],
        lengths: &SegmentLengths,
        target: f32,
    ) -> f32 {
        let total: f32 = pairs
            .iter()
            .map(|(i, j)| error_fn::pair_error(&self.config, lengths, &poses[*i], &poses[*j], target))
            .sum();
        total / pairs.len() as f32
    }

    /// Estimate segment lengths from `recording`, starting at `initial`.
    ///
    /// Runs exactly `num_epochs` epochs and calls `on_epoch` after each one.
    ///
    /// # Errors
    /// `EmptyRecording` if the recording fails validation;
    /// `OptimizationFailure` if it is too short to form a frame pair or a
    /// non-finite error or length appears.
    pub fn process<F>(
        &self,
        recording: &Recording,
        initial: &SegmentLengths,
        mut on_epoch: F,
    ) -> Result<CalibrationResult, CalibrationError>
    where
        F: FnMut(&EpochReport),
    {
        recording.validate()?;

        let poses = poses_of(recording);
        let mut pairs = self.frame_pairs(poses.len())?;
        let (target, target_source) = self.target_height(recording, initial);

        let measured: Vec<SkeletonSegment> = SkeletonSegment::ALL
            .iter()
            .copied()
            .filter(|segment| segment.is_measured_by(recording))
            .collect();
        let sources = SkeletonSegment::ALL
            .iter()
            .map(|segment| {
                let source = if measured.contains(segment) {
                    LengthSource::Measured
                } else {
                    LengthSource::Default
                };
                (*segment, source)
            })
            .collect();

        tracing::info!(
            "[Optimizer] {} frames, {} pairs, {} measured segments, target height {:.3} m ({:?})",
            poses.len(),
            pairs.len(),
            measured.len(),
            target,
            target_source
        );

        let mut lengths = initial.clone();
        let mut rng = StdRng::seed_from_u64(self.config.random_seed);
        let step = self.config.gradient_step.max(f32::EPSILON);
        let total_epochs = self.config.num_epochs;

        for epoch in 0..total_epochs {
            let adjust_rate =
                self.config.initial_adjust_rate * self.config.adjust_rate_decay.powi(epoch as i32);
            if self.config.randomize_frame_order {
                pairs.shuffle(&mut rng);
            }

            let mut epoch_total = 0.0;
            for (i, j) in pairs.iter() {
                let (a, b) = (&poses[*i], &poses[*j]);
                epoch_total += error_fn::pair_error(&self.config, &lengths, a, b, target);

                for segment in measured.iter() {
                    let base = lengths.get(*segment);

                    lengths.set(*segment, base + step);
                    let above = error_fn::pair_error(&self.config, &lengths, a, b, target);
                    lengths.set(*segment, base - step);
                    let below = error_fn::pair_error(&self.config, &lengths, a, b, target);

                    let gradient = (above - below) / (2.0 * step);
                    let (min, max) = segment.bounds();
                    lengths.set(*segment, (base - adjust_rate * gradient).clamp(min, max));
                }
            }

            let epoch_error = epoch_total / pairs.len() as f32;
            if !epoch_error.is_finite() || !lengths.is_finite() {
                return Err(CalibrationError::optimization(format!(
                    "non-finite error or length in epoch {}",
                    epoch + 1
                )));
            }

            let every = self.config.log_every_n_epochs;
            if every > 0 && (epoch + 1) % every == 0 {
                tracing::info!(
                    "[Optimizer] Epoch {}/{}: error {:.6}, rate {:.6}",
                    epoch + 1,
                    total_epochs,
                    epoch_error,
                    adjust_rate
                );
            }

            on_epoch(&EpochReport {
                epoch: epoch + 1,
                total_epochs,
                epoch_error,
                adjust_rate,
                lengths: lengths.clone(),
            });
        }

        let final_error = self.mean_error(&poses, &pairs, &lengths, target);
        if !final_error.is_finite() {
            return Err(CalibrationError::optimization("non-finite final error"));
        }

        let height_difference = lengths.estimated_height() - target;
        tracing::info!(
            "[Optimizer] Done: height {:.3} m, difference {:+.4} m, error {:.6}",
            lengths.estimated_height(),
            height_difference,
            final_error
        );

        Ok(CalibrationResult {
            lengths,
            sources,
            height_difference,
            target_height: target,
            target_source,
            final_error,
            epochs: total_epochs,
        })
    }
}

fn poses_of(recording: &Recording) -> Vec<FramePose> {
    (0..recording.max_frame_count())
        .map(|index| FramePose::from_recording(recording, index))
        .collect()
}

#[cfg(test)]
#[path = "optimizer_tests.rs"]
mod tests;
