//! Configuration management for the calibration core
//!
//! This module provides runtime configuration loading from JSON files so
//! capture windows and optimizer parameters can be tuned without
//! recompilation. Missing fields fall back to their defaults, and a missing
//! or malformed file falls back to the full default configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the configuration file for desktop runs.
pub const DEFAULT_CONFIG_PATH: &str = "assets/autobone_config.json";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub recording: RecordingConfig,
    pub optimizer: OptimizerConfig,
    pub skeleton: SkeletonConfigPaths,
}

/// Capture window and recording persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Number of samples captured per record session
    pub sample_count: u32,
    /// Delay between two samples in milliseconds
    pub sample_interval_ms: u64,
    /// Keep a permanently named copy of every recording
    pub save_recordings: bool,
    /// Directory holding permanently saved recordings
    pub recordings_dir: PathBuf,
    /// File overwritten by every completed record session
    pub last_recording_path: PathBuf,
    /// Include every stored recording in process sessions
    pub process_saved_recordings: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            sample_count: 1000,
            sample_interval_ms: 20,
            save_recordings: false,
            recordings_dir: PathBuf::from("recordings"),
            last_recording_path: PathBuf::from("last_recording.mrec"),
            process_saved_recordings: false,
        }
    }
}

impl RecordingConfig {
    /// Expected capture duration in milliseconds
    pub fn capture_duration_ms(&self) -> u64 {
        self.sample_count as u64 * self.sample_interval_ms
    }
}

/// Optimizer parameters
///
/// The optimizer always runs exactly `num_epochs` epochs; there is no
/// convergence heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub num_epochs: u32,
    /// Learning rate applied in the first epoch
    pub initial_adjust_rate: f32,
    /// Multiplicative learning-rate decay per epoch
    pub adjust_rate_decay: f32,
    /// Frame cursor advance between two pair anchors
    pub cursor_increment: usize,
    /// Minimum frame distance inside a pair
    pub min_data_distance: usize,
    /// Maximum frame distance inside a pair
    pub max_data_distance: usize,
    /// Step used for the central finite difference, in meters
    pub gradient_step: f32,
    pub slide_error_factor: f32,
    pub offset_slide_error_factor: f32,
    pub height_error_factor: f32,
    pub body_proportion_error_factor: f32,
    /// Allowed deviation of a segment/height ratio before it is penalised
    pub body_proportion_tolerance: f32,
    /// Reference eye height in meters; derived from the recording when unset
    pub target_hmd_height: Option<f32>,
    pub randomize_frame_order: bool,
    pub random_seed: u64,
    /// Log the epoch error every N epochs (0 disables)
    pub log_every_n_epochs: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            initial_adjust_rate: 0.01,
            adjust_rate_decay: 0.95,
            cursor_increment: 2,
            min_data_distance: 1,
            max_data_distance: 1,
            gradient_step: 0.001,
            slide_error_factor: 1.0,
            offset_slide_error_factor: 0.5,
            height_error_factor: 1.0,
            body_proportion_error_factor: 0.25,
            body_proportion_tolerance: 0.02,
            target_hmd_height: None,
            randomize_frame_order: true,
            random_seed: 4,
            log_every_n_epochs: 10,
        }
    }
}

/// Where the live skeleton configuration is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeletonConfigPaths {
    pub config_path: PathBuf,
}

impl Default for SkeletonConfigPaths {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("skeleton_config.json"),
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The loaded configuration. If the file doesn't exist or the JSON is
    /// invalid, the default configuration is returned and a warning logged.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default location
    pub fn load() -> Self {
        Self::load_from_file(DEFAULT_CONFIG_PATH)
    }
}
