// ResultAggregator - runs the optimizer over a batch of recordings
//
// Height differences feed the error statistics; body ratios are computed per
// recording for reporting only and never fed back into the optimizer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::recording::Recording;
use crate::skeleton::{SegmentLengths, SkeletonSegment};

use super::{CalibrationResult, EpochReport, ErrorStatistics, LengthSource, Optimizer};

/// Diagnostic body ratios of one result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyRatios {
    pub neck_torso: f32,
    pub chest_torso: f32,
    pub waist_torso: f32,
    pub leg_torso: f32,
    pub leg_body: f32,
    pub knee_leg: f32,
}

impl BodyRatios {
    /// Torso is upper chest + chest + waist + hip, leg is upper + lower leg,
    /// body is neck + torso + leg.
    pub fn from_lengths(lengths: &SegmentLengths) -> Self {
        let torso = lengths.get(SkeletonSegment::UpperChest)
            + lengths.get(SkeletonSegment::Chest)
            + lengths.get(SkeletonSegment::Waist)
            + lengths.get(SkeletonSegment::Hip);
        let leg = lengths.get(SkeletonSegment::UpperLeg) + lengths.get(SkeletonSegment::LowerLeg);
        let body = lengths.get(SkeletonSegment::Neck) + torso + leg;

        let ratio = |a: f32, b: f32| if b > 0.0 { a / b } else { 0.0 };
        Self {
            neck_torso: ratio(lengths.get(SkeletonSegment::Neck), torso),
            chest_torso: ratio(lengths.get(SkeletonSegment::Chest), torso),
            waist_torso: ratio(lengths.get(SkeletonSegment::Waist), torso),
            leg_torso: ratio(leg, torso),
            leg_body: ratio(leg, body),
            knee_leg: ratio(lengths.get(SkeletonSegment::LowerLeg), leg),
        }
    }
}

/// Result for one recording of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingOutcome {
    pub label: String,
    pub result: CalibrationResult,
    pub ratios: BodyRatios,
}

/// Accepted result of a successful batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Per-segment mean of the batch's lengths
    pub lengths: SegmentLengths,
    /// Measured if measured in any recording of the batch
    pub sources: BTreeMap<SkeletonSegment, LengthSource>,
    /// Statistics over the per-recording height differences
    pub statistics: ErrorStatistics,
    pub recordings: Vec<RecordingOutcome>,
}

impl BatchOutcome {
    /// Mean height difference across the batch.
    pub fn height_difference(&self) -> f32 {
        self.statistics.mean()
    }
}

/// First failure of a batch; partial statistics are discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub index: usize,
    pub label: String,
    pub error: CalibrationError,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recording {} ({}) failed: {}",
            self.index, self.label, self.error
        )
    }
}

impl std::error::Error for BatchFailure {}

pub struct ResultAggregator {
    optimizer: Optimizer,
}

impl ResultAggregator {
    pub fn new(optimizer: Optimizer) -> Self {
        Self { optimizer }
    }

    /// Optimize every recording in order, starting each from `initial`.
    ///
    /// `on_epoch(index, report)` receives the epoch reports of the recording
    /// at `index`.
    pub fn process_batch<F>(
        &self,
        batch: &[(String, Arc<Recording>)],
        initial: &SegmentLengths,
        mut on_epoch: F,
    ) -> Result<BatchOutcome, BatchFailure>
    where
        F: FnMut(usize, &EpochReport),
    {
        if batch.is_empty() {
            return Err(BatchFailure {
                index: 0,
                label: "batch".to_string(),
                error: CalibrationError::empty("no recordings to process"),
            });
        }

        let mut statistics = ErrorStatistics::new();
        let mut recordings = Vec::with_capacity(batch.len());

        for (index, (label, recording)) in batch.iter().enumerate() {
            tracing::info!(
                "[ResultAggregator] Processing recording {}/{} ({})",
                index + 1,
                batch.len(),
                label
            );

            let result = self
                .optimizer
                .process(recording, initial, |report| on_epoch(index, report))
                .map_err(|error| BatchFailure {
                    index,
                    label: label.clone(),
                    error,
                })?;

            statistics.add(result.height_difference);
            let ratios = BodyRatios::from_lengths(&result.lengths);
            tracing::info!(
                "[ResultAggregator] {}: height diff {:+.4} m, neck/torso {:.3}, chest/torso {:.3}, waist/torso {:.3}, leg/torso {:.3}, leg/body {:.3}, knee/leg {:.3}",
                label,
                result.height_difference,
                ratios.neck_torso,
                ratios.chest_torso,
                ratios.waist_torso,
                ratios.leg_torso,
                ratios.leg_body,
                ratios.knee_leg
            );

            recordings.push(RecordingOutcome {
                label: label.clone(),
                result,
                ratios,
            });
        }

        let count = recordings.len() as f32;
        let mut lengths = SegmentLengths::defaults();
        let mut sources = BTreeMap::new();
        for segment in SkeletonSegment::ALL {
            let mean = recordings
                .iter()
                .map(|r| r.result.lengths.get(segment))
                .sum::<f32>()
                / count;
            lengths.set(segment, mean);

            let measured = recordings
                .iter()
                .any(|r| r.result.source(segment) == LengthSource::Measured);
            sources.insert(
                segment,
                if measured {
                    LengthSource::Measured
                } else {
                    LengthSource::Default
                },
            );
        }

        tracing::info!(
            "[ResultAggregator] Batch of {}: mean height diff {:+.4} m, std dev {:.4} m",
            recordings.len(),
            statistics.mean(),
            statistics.std_dev()
        );

        Ok(BatchOutcome {
            lengths,
            sources,
            statistics,
            recordings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::recording::TrackerFrames;
    use crate::tracking::{SyntheticTrackerSource, TrackerSource};

    fn record(source: &SyntheticTrackerSource, frames: usize) -> Arc<Recording> {
        let mut sequences: Vec<TrackerFrames> =
            source.trackers().into_iter().map(TrackerFrames::new).collect();
        for _ in 0..frames {
            for (sequence, reading) in sequences.iter_mut().zip(source.poll()) {
                sequence.frames.push(reading.frame);
            }
        }
        Arc::new(Recording::new(sequences))
    }

    fn aggregator() -> ResultAggregator {
        ResultAggregator::new(Optimizer::new(OptimizerConfig {
            num_epochs: 5,
            log_every_n_epochs: 0,
            ..OptimizerConfig::default()
        }))
    }

    #[test]
    fn test_default_ratios() {
        let ratios = BodyRatios::from_lengths(&SegmentLengths::defaults());
        assert!((ratios.neck_torso - 0.10 / 0.56).abs() < 1e-5);
        assert!((ratios.leg_torso - 0.92 / 0.56).abs() < 1e-5);
        assert!((ratios.leg_body - 0.92 / 1.58).abs() < 1e-5);
        assert!((ratios.knee_leg - 0.50 / 0.92).abs() < 1e-5);
    }

    #[test]
    fn test_statistics_over_batch() {
        let source = SyntheticTrackerSource::full_body(SegmentLengths::defaults());
        let batch: Vec<(String, Arc<Recording>)> = (0..3)
            .map(|i| (format!("take-{}", i), record(&source, 30 + i * 10)))
            .collect();

        let outcome = aggregator()
            .process_batch(&batch, &SegmentLengths::defaults(), |_, _| {})
            .unwrap();

        let diffs: Vec<f32> = outcome
            .recordings
            .iter()
            .map(|r| r.result.height_difference)
            .collect();
        let mean = diffs.iter().sum::<f32>() / 3.0;
        let std = (diffs.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / 3.0).sqrt();

        assert_eq!(outcome.statistics.count(), 3);
        assert!((outcome.statistics.mean() - mean).abs() < 1e-5);
        assert!((outcome.statistics.std_dev() - std).abs() < 1e-5);
        assert!((outcome.height_difference() - mean).abs() < 1e-5);

        let mean_leg = outcome
            .recordings
            .iter()
            .map(|r| r.result.lengths.get(SkeletonSegment::UpperLeg))
            .sum::<f32>()
            / 3.0;
        assert!((outcome.lengths.get(SkeletonSegment::UpperLeg) - mean_leg).abs() < 1e-6);
    }

    #[test]
    fn test_first_failure_reports_label_and_index() {
        let source = SyntheticTrackerSource::full_body(SegmentLengths::defaults());
        let batch = vec![
            ("good".to_string(), record(&source, 20)),
            ("empty".to_string(), Arc::new(Recording::default())),
            ("never-reached".to_string(), record(&source, 20)),
        ];

        let mut seen = Vec::new();
        let failure = aggregator()
            .process_batch(&batch, &SegmentLengths::defaults(), |index, _| seen.push(index))
            .unwrap_err();

        assert_eq!(failure.index, 1);
        assert_eq!(failure.label, "empty");
        assert!(matches!(failure.error, CalibrationError::EmptyRecording { .. }));
        assert!(seen.iter().all(|index| *index == 0));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let failure = aggregator()
            .process_batch(&[], &SegmentLengths::defaults(), |_, _| {})
            .unwrap_err();
        assert!(matches!(failure.error, CalibrationError::EmptyRecording { .. }));
    }
}
