// AutoBone Core - automatic bone-length calibration
// Record motion, persist recordings, optimize segment lengths, report progress

// Module declarations
pub mod calibration;
pub mod config;
pub mod error;
pub mod managers;
pub mod optimizer;
pub mod recording;
pub mod skeleton;
pub mod tracking;

// Re-exports for convenience
pub use calibration::{CalibrationEvent, CalibrationListener, ProcessStatus, SessionKind};
pub use config::AppConfig;
pub use error::{CalibrationError, ErrorCode};
pub use managers::{EventBroadcaster, ListenerId, SessionController};
pub use optimizer::{BatchOutcome, CalibrationResult, Optimizer, ResultAggregator};
pub use recording::{Recorder, Recording, RecordingStore};
pub use skeleton::{SegmentLengths, SkeletonConfigApplier, SkeletonConfigStore, SkeletonSegment};
pub use tracking::{BodyPart, SyntheticTrackerSource, TrackerSource};
