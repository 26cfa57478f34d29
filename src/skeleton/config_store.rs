// Live skeleton configuration and its persistence

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::CalibrationError;
use crate::recording::store::write_atomic;
use crate::skeleton::SegmentLengths;

/// Receives accepted calibration results.
pub trait SkeletonConfigApplier: Send + Sync {
    /// Replace the live segment lengths with `lengths` and persist them.
    fn apply(&self, lengths: &SegmentLengths) -> Result<(), CalibrationError>;

    /// Lengths the optimizer starts from.
    fn current_lengths(&self) -> SegmentLengths {
        SegmentLengths::defaults()
    }
}

/// Live segment lengths persisted as JSON.
pub struct SkeletonConfigStore {
    path: PathBuf,
    lengths: Arc<RwLock<SegmentLengths>>,
}

impl SkeletonConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P, lengths: SegmentLengths) -> Self {
        Self {
            path: path.into(),
            lengths: Arc::new(RwLock::new(lengths)),
        }
    }

    /// Load the persisted lengths, or start from the defaults when the file
    /// is missing or unreadable.
    pub fn load_or_default<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let lengths = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<SegmentLengths>(&contents) {
                Ok(lengths) => {
                    tracing::info!("[SkeletonConfig] Loaded segment lengths from {}", path.display());
                    lengths
                }
                Err(err) => {
                    tracing::warn!(
                        "[SkeletonConfig] Failed to parse {}: {}. Using defaults.",
                        path.display(),
                        err
                    );
                    SegmentLengths::defaults()
                }
            },
            Err(_) => SegmentLengths::defaults(),
        };
        Self::new(path, lengths)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the live lengths.
    pub fn current(&self) -> Result<SegmentLengths, CalibrationError> {
        self.lengths
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| CalibrationError::StatePoisoned {
                component: "skeleton_config".to_string(),
            })
    }
}

impl SkeletonConfigApplier for SkeletonConfigStore {
    fn current_lengths(&self) -> SegmentLengths {
        self.current().unwrap_or_default()
    }

    fn apply(&self, lengths: &SegmentLengths) -> Result<(), CalibrationError> {
        if !lengths.is_finite() {
            return Err(CalibrationError::optimization(
                "refusing to apply non-finite segment lengths",
            ));
        }

        let json = serde_json::to_vec_pretty(lengths)?;
        write_atomic(&self.path, &json)?;

        let mut guard = self
            .lengths
            .write()
            .map_err(|_| CalibrationError::StatePoisoned {
                component: "skeleton_config".to_string(),
            })?;
        *guard = lengths.clone();

        tracing::info!(
            "[SkeletonConfig] Applied segment lengths (height {:.3} m)",
            lengths.estimated_height()
        );
        Ok(())
    }
}
