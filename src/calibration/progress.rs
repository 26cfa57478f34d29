// Progress reporting for calibration sessions
//
// This module provides the event payloads emitted while a session runs:
// ProcessStatus for coarse session progress and EpochUpdate for optimizer
// epochs.

use serde::{Deserialize, Serialize};

use crate::skeleton::SegmentLengths;

/// Kind of background session. At most one session per kind runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Capture a motion window from live tracking
    Record,
    /// Store the most recent recording permanently
    Save,
    /// Optimize segment lengths over one or more recordings
    Process,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [SessionKind::Record, SessionKind::Save, SessionKind::Process];

    /// Dense index used by per-kind state tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SessionKind::Record => "Record",
            SessionKind::Save => "Save",
            SessionKind::Process => "Process",
        }
    }
}

/// Progress of one session.
///
/// A session emits zero or more non-terminal statuses followed by exactly
/// one terminal status (`completed == true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub session_id: u64,
    pub kind: SessionKind,
    pub message: String,
    pub current: u32,
    pub total: u32,
    /// Estimated seconds remaining; 0.0 when unknown
    pub eta_secs: f32,
    pub completed: bool,
    /// Only meaningful on the terminal status
    pub success: bool,
}

impl ProcessStatus {
    /// Non-terminal progress status
    pub fn progress(
        session_id: u64,
        kind: SessionKind,
        message: impl Into<String>,
        current: u32,
        total: u32,
        eta_secs: f32,
    ) -> Self {
        Self {
            session_id,
            kind,
            message: message.into(),
            current,
            total,
            eta_secs,
            completed: false,
            success: false,
        }
    }

    /// Terminal status
    pub fn finished(session_id: u64, kind: SessionKind, success: bool, message: impl Into<String>) -> Self {
        Self {
            session_id,
            kind,
            message: message.into(),
            current: 0,
            total: 0,
            eta_secs: 0.0,
            completed: true,
            success,
        }
    }

    /// Calculate completion percentage (0-100)
    pub fn percentage(&self) -> u8 {
        if self.completed {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        ((self.current.min(self.total) as f32 / self.total as f32) * 100.0) as u8
    }
}

/// Optimizer progress after one epoch of one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochUpdate {
    pub session_id: u64,
    /// Position of the recording in the processed batch
    pub recording_index: usize,
    /// 1-based
    pub epoch: u32,
    pub total_epochs: u32,
    pub epoch_error: f32,
    pub lengths: SegmentLengths,
}
