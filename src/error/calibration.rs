// Calibration error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Calibration error code constants
///
/// Single source of truth for the numeric codes carried in terminal
/// session events so remote clients can branch on them.
///
/// Error code range: 3001-3008
pub struct CalibrationErrorCodes {}

impl CalibrationErrorCodes {
    /// Live tracking cannot supply valid samples
    pub const NOT_READY: i32 = 3001;

    /// Recording has no trackers or no frames
    pub const EMPTY_RECORDING: i32 = 3002;

    /// Persistence read/write or format version failure
    pub const IO_FAILURE: i32 = 3003;

    /// Numerical failure inside the optimizer
    pub const OPTIMIZATION_FAILURE: i32 = 3004;

    /// A session of the requested kind is already active
    pub const ALREADY_RUNNING: i32 = 3005;

    /// apply requested before any successful process session
    pub const NO_RESULT_AVAILABLE: i32 = 3006;

    /// Recording discarded by the operator
    pub const CANCELLED: i32 = 3007;

    /// Shared state lock was poisoned
    pub const STATE_POISONED: i32 = 3008;
}

/// Log a calibration error with structured context
///
/// This function logs calibration errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - message: Human-readable error message
/// - context: Operation in which the error surfaced
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_calibration_error(err: &CalibrationError, context: &str) {
    error!(
        "Calibration error in {}: code={}, component=AutoBone, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Calibration-related errors
///
/// These errors cover the whole record / save / process pipeline. Only
/// `AlreadyRunning` and `NoResultAvailable` are ever returned synchronously
/// to callers; everything else travels inside terminal session events.
///
/// Error code range: 3001-3008
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Capture requested while live tracking cannot supply valid samples
    NotReady { reason: String },

    /// Zero trackers or zero frames presented to save/process
    EmptyRecording { context: String },

    /// Persistence read/write/version mismatch
    IoFailure { reason: String },

    /// Numerical failure inside the optimizer
    OptimizationFailure { reason: String },

    /// A session of the requested kind is active
    AlreadyRunning { kind: String },

    /// apply_values called with nothing to apply
    NoResultAvailable,

    /// Recording was cancelled before completion
    Cancelled,

    /// Mutex/RwLock was poisoned
    StatePoisoned { component: String },
}

impl CalibrationError {
    pub fn io(reason: impl Into<String>) -> Self {
        CalibrationError::IoFailure {
            reason: reason.into(),
        }
    }

    pub fn optimization(reason: impl Into<String>) -> Self {
        CalibrationError::OptimizationFailure {
            reason: reason.into(),
        }
    }

    pub fn empty(context: impl Into<String>) -> Self {
        CalibrationError::EmptyRecording {
            context: context.into(),
        }
    }
}

impl ErrorCode for CalibrationError {
    fn code(&self) -> i32 {
        match self {
            CalibrationError::NotReady { .. } => CalibrationErrorCodes::NOT_READY,
            CalibrationError::EmptyRecording { .. } => CalibrationErrorCodes::EMPTY_RECORDING,
            CalibrationError::IoFailure { .. } => CalibrationErrorCodes::IO_FAILURE,
            CalibrationError::OptimizationFailure { .. } => {
                CalibrationErrorCodes::OPTIMIZATION_FAILURE
            }
            CalibrationError::AlreadyRunning { .. } => CalibrationErrorCodes::ALREADY_RUNNING,
            CalibrationError::NoResultAvailable => CalibrationErrorCodes::NO_RESULT_AVAILABLE,
            CalibrationError::Cancelled => CalibrationErrorCodes::CANCELLED,
            CalibrationError::StatePoisoned { .. } => CalibrationErrorCodes::STATE_POISONED,
        }
    }

    fn message(&self) -> String {
        match self {
            CalibrationError::NotReady { reason } => {
                format!("Tracking is not ready for recording: {}", reason)
            }
            CalibrationError::EmptyRecording { context } => {
                format!("Recording is empty: {}", context)
            }
            CalibrationError::IoFailure { reason } => {
                format!("Recording storage failure: {}", reason)
            }
            CalibrationError::OptimizationFailure { reason } => {
                format!("Optimization failed: {}", reason)
            }
            CalibrationError::AlreadyRunning { kind } => {
                format!("{} session already running", kind)
            }
            CalibrationError::NoResultAvailable => {
                "No calibration result available. Run a process session first.".to_string()
            }
            CalibrationError::Cancelled => "Recording cancelled".to_string(),
            CalibrationError::StatePoisoned { component } => {
                format!("Lock poisoned for component: {}", component)
            }
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for CalibrationError {}

/// Convert from std::io::Error to CalibrationError
impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::IoFailure {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::IoFailure {
            reason: format!("malformed container: {}", err),
        }
    }
}
