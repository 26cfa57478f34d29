//! Boundary to the live tracking subsystem.
//!
//! The recorder only needs two things from live tracking: whether it can
//! currently produce valid samples, and a snapshot of every tracker's latest
//! frame. [`TrackerSource`] captures exactly that so the hardware side stays
//! outside this crate.

use serde::{Deserialize, Serialize};

use crate::recording::TrackerFrame;

pub mod synthetic;

pub use synthetic::SyntheticTrackerSource;

/// Body part a tracker can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyPart {
    Head,
    Neck,
    UpperChest,
    Chest,
    Waist,
    Hip,
    LeftUpperLeg,
    RightUpperLeg,
    LeftLowerLeg,
    RightLowerLeg,
    LeftFoot,
    RightFoot,
}

impl BodyPart {
    pub const COUNT: usize = 12;

    pub const ALL: [BodyPart; BodyPart::COUNT] = [
        BodyPart::Head,
        BodyPart::Neck,
        BodyPart::UpperChest,
        BodyPart::Chest,
        BodyPart::Waist,
        BodyPart::Hip,
        BodyPart::LeftUpperLeg,
        BodyPart::RightUpperLeg,
        BodyPart::LeftLowerLeg,
        BodyPart::RightLowerLeg,
        BodyPart::LeftFoot,
        BodyPart::RightFoot,
    ];

    /// Dense index used by per-frame lookup tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BodyPart::Head => "HEAD",
            BodyPart::Neck => "NECK",
            BodyPart::UpperChest => "UPPER CHEST",
            BodyPart::Chest => "CHEST",
            BodyPart::Waist => "WAIST",
            BodyPart::Hip => "HIP",
            BodyPart::LeftUpperLeg => "LEFT UPPER LEG",
            BodyPart::RightUpperLeg => "RIGHT UPPER LEG",
            BodyPart::LeftLowerLeg => "LEFT LOWER LEG",
            BodyPart::RightLowerLeg => "RIGHT LOWER LEG",
            BodyPart::LeftFoot => "LEFT FOOT",
            BodyPart::RightFoot => "RIGHT FOOT",
        }
    }
}

/// Identity of one physical tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerInfo {
    pub id: u32,
    pub name: String,
    pub body_part: Option<BodyPart>,
}

impl TrackerInfo {
    pub fn new(id: u32, name: impl Into<String>, body_part: Option<BodyPart>) -> Self {
        Self {
            id,
            name: name.into(),
            body_part,
        }
    }
}

/// Latest frame reported by one tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerReading {
    pub tracker_id: u32,
    pub frame: TrackerFrame,
}

/// Trait implemented by the live tracking subsystem.
///
/// Implementations must be cheap to poll; the recorder calls [`poll`] once
/// per sample interval from its capture thread.
///
/// [`poll`]: TrackerSource::poll
pub trait TrackerSource: Send + Sync {
    /// `Err(reason)` when valid samples cannot currently be produced, e.g.
    /// no trackers are assigned to the body parts calibration needs.
    fn readiness(&self) -> Result<(), String>;

    /// Trackers currently active.
    fn trackers(&self) -> Vec<TrackerInfo>;

    /// Snapshot of the latest frame of every active tracker.
    fn poll(&self) -> Vec<TrackerReading>;
}
