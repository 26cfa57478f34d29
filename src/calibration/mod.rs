// Calibration module - session event model
//
// Every observable outcome of a session is a CalibrationEvent delivered to
// CalibrationListener implementations:
// 1. Status: session progress and the single terminal status
// 2. Epoch: optimizer progress during a process session
// 3. Results: accepted lengths after a successful process session
// 4. ValuesApplied: outcome of applying the accepted lengths

use serde::{Deserialize, Serialize};

use crate::optimizer::BatchOutcome;

pub mod progress;

pub use progress::{EpochUpdate, ProcessStatus, SessionKind};

/// Accepted result of a process session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResults {
    pub session_id: u64,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CalibrationEvent {
    Status(ProcessStatus),
    Epoch(EpochUpdate),
    Results(CalibrationResults),
    ValuesApplied { success: bool, message: String },
}

impl CalibrationEvent {
    /// The terminal status of a session, if this is one.
    pub fn as_terminal(&self) -> Option<&ProcessStatus> {
        match self {
            CalibrationEvent::Status(status) if status.completed => Some(status),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<u64> {
        match self {
            CalibrationEvent::Status(status) => Some(status.session_id),
            CalibrationEvent::Epoch(update) => Some(update.session_id),
            CalibrationEvent::Results(results) => Some(results.session_id),
            CalibrationEvent::ValuesApplied { .. } => None,
        }
    }
}

/// Observer of calibration events.
///
/// Called synchronously on the emitting session thread; implementations
/// should return quickly.
pub trait CalibrationListener: Send + Sync {
    fn on_event(&self, event: &CalibrationEvent);
}

impl<F> CalibrationListener for F
where
    F: Fn(&CalibrationEvent) + Send + Sync,
{
    fn on_event(&self, event: &CalibrationEvent) {
        self(event)
    }
}
