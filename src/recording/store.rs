// RecordingStore - versioned on-disk containers for recordings
//
// A container is a JSON envelope {magic, version, recording}. Quaternions
// are stored as [x, y, z, w] and vectors as [x, y, z]; every frame carries
// an explicit flags byte that must agree with the fields present.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::recording::{FrameDataFlags, Recording, TrackerFrame, TrackerFrames};
use crate::tracking::{BodyPart, TrackerInfo};

/// Identifies a recording container.
pub const CONTAINER_MAGIC: &str = "AUTOBONE-REC";

/// Current container format version. Any other version is rejected.
pub const CONTAINER_VERSION: u32 = 1;

/// File extension of recording containers.
pub const RECORDING_EXTENSION: &str = "mrec";

const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Suffixes tried per timestamp before `save_permanent` gives up.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

#[derive(Deserialize)]
struct ContainerHeader {
    magic: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct ContainerDto {
    magic: String,
    version: u32,
    recording: RecordingDto,
}

#[derive(Serialize, Deserialize)]
struct RecordingDto {
    trackers: Vec<TrackerDto>,
}

#[derive(Serialize, Deserialize)]
struct TrackerDto {
    id: u32,
    name: String,
    body_part: Option<BodyPart>,
    frames: Vec<FrameDto>,
}

#[derive(Serialize, Deserialize)]
struct FrameDto {
    flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rotation: Option<[f32; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acceleration: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_rotation: Option<[f32; 4]>,
}

fn quat_to_array(q: &UnitQuaternion<f32>) -> [f32; 4] {
    [q.i, q.j, q.k, q.w]
}

fn array_to_quat(a: [f32; 4]) -> Result<UnitQuaternion<f32>, String> {
    let q = Quaternion::new(a[3], a[0], a[1], a[2]);
    if !a.iter().all(|c| c.is_finite()) || (q.norm() - 1.0).abs() > UNIT_NORM_TOLERANCE {
        return Err(format!("invalid rotation {:?}", a));
    }
    // Stored values were unit quaternions; keep their exact bits.
    Ok(UnitQuaternion::new_unchecked(q))
}

fn vec_to_array(v: &Vector3<f32>) -> [f32; 3] {
    [v.x, v.y, v.z]
}

impl From<&TrackerFrame> for FrameDto {
    fn from(frame: &TrackerFrame) -> Self {
        Self {
            flags: frame.flags().bits(),
            rotation: frame.rotation.as_ref().map(quat_to_array),
            position: frame.position.as_ref().map(vec_to_array),
            acceleration: frame.acceleration.as_ref().map(vec_to_array),
            raw_rotation: frame.raw_rotation.as_ref().map(quat_to_array),
        }
    }
}

impl FrameDto {
    fn into_frame(self) -> Result<TrackerFrame, String> {
        let flags = FrameDataFlags::from_bits(self.flags)
            .ok_or_else(|| format!("unknown frame flags {:#04x}", self.flags))?;

        let check = |flag: u8, present: bool, field: &str| {
            if flags.contains(flag) == present {
                Ok(())
            } else {
                Err(format!(
                    "flags {:#04x} disagree with {} field presence",
                    self.flags, field
                ))
            }
        };
        check(FrameDataFlags::ROTATION, self.rotation.is_some(), "rotation")?;
        check(FrameDataFlags::POSITION, self.position.is_some(), "position")?;
        check(
            FrameDataFlags::ACCELERATION,
            self.acceleration.is_some(),
            "acceleration",
        )?;
        check(
            FrameDataFlags::RAW_ROTATION,
            self.raw_rotation.is_some(),
            "raw_rotation",
        )?;

        Ok(TrackerFrame {
            rotation: self.rotation.map(array_to_quat).transpose()?,
            position: self.position.map(Vector3::from),
            acceleration: self.acceleration.map(Vector3::from),
            raw_rotation: self.raw_rotation.map(array_to_quat).transpose()?,
        })
    }
}

/// Encode a recording as a container document.
pub fn encode(recording: &Recording) -> Result<Vec<u8>, CalibrationError> {
    let dto = ContainerDto {
        magic: CONTAINER_MAGIC.to_string(),
        version: CONTAINER_VERSION,
        recording: RecordingDto {
            trackers: recording
                .trackers
                .iter()
                .map(|t| TrackerDto {
                    id: t.tracker.id,
                    name: t.tracker.name.clone(),
                    body_part: t.tracker.body_part,
                    frames: t.frames.iter().map(FrameDto::from).collect(),
                })
                .collect(),
        },
    };
    Ok(serde_json::to_vec(&dto)?)
}

/// Decode a container document. Nothing is returned unless the whole
/// document is valid.
pub fn decode(bytes: &[u8]) -> Result<Recording, CalibrationError> {
    let header: ContainerHeader = serde_json::from_slice(bytes)?;
    if header.magic != CONTAINER_MAGIC {
        return Err(CalibrationError::io(format!(
            "not a recording container (magic {:?})",
            header.magic
        )));
    }
    if header.version != CONTAINER_VERSION {
        return Err(CalibrationError::io(format!(
            "unsupported container version {} (expected {})",
            header.version, CONTAINER_VERSION
        )));
    }

    let dto: ContainerDto = serde_json::from_slice(bytes)?;
    let mut trackers = Vec::with_capacity(dto.recording.trackers.len());
    for tracker in dto.recording.trackers {
        let frames = tracker
            .frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                frame.into_frame().map_err(|reason| {
                    CalibrationError::io(format!(
                        "tracker {} frame {}: {}",
                        tracker.id, index, reason
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        trackers.push(TrackerFrames {
            tracker: TrackerInfo::new(tracker.id, tracker.name, tracker.body_part),
            frames,
        });
    }
    Ok(Recording::new(trackers))
}

/// Persists and loads recordings.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    recordings_dir: PathBuf,
    last_recording_path: PathBuf,
}

impl RecordingStore {
    pub fn new<D: Into<PathBuf>, L: Into<PathBuf>>(recordings_dir: D, last_recording_path: L) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
            last_recording_path: last_recording_path.into(),
        }
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    pub fn last_recording_path(&self) -> &Path {
        &self.last_recording_path
    }

    /// Write `recording`. `None` overwrites the "last recording" file;
    /// `Some(name)` writes `<recordings_dir>/<name>.mrec`.
    ///
    /// # Errors
    /// `EmptyRecording` for a recording that fails validation, `IoFailure`
    /// for invalid names and filesystem errors.
    pub fn save(&self, recording: &Recording, name: Option<&str>) -> Result<PathBuf, CalibrationError> {
        recording.validate()?;

        let path = match name {
            None => self.last_recording_path.clone(),
            Some(name) => {
                if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                    return Err(CalibrationError::io(format!(
                        "invalid recording name {:?}",
                        name
                    )));
                }
                self.path_for(name)
            }
        };

        write_atomic(&path, &encode(recording)?)?;
        tracing::debug!(
            "[RecordingStore] Saved {} trackers / {} frames to {}",
            recording.tracker_count(),
            recording.max_frame_count(),
            path.display()
        );
        Ok(path)
    }

    /// Save under a generated, unique timestamped name.
    ///
    /// Concurrent callers never share a name: a candidate is claimed only if
    /// no file exists under it at the moment of publishing.
    pub fn save_permanent(&self, recording: &Recording) -> Result<PathBuf, CalibrationError> {
        recording.validate()?;
        let bytes = encode(recording)?;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let base = format!("recording-{}", millis);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => base.clone(),
                n => format!("{}-{}", base, n),
            };
            let path = self.path_for(&name);
            if write_new(&path, &bytes)? {
                tracing::debug!("[RecordingStore] Saved permanent recording {}", path.display());
                return Ok(path);
            }
        }
        Err(CalibrationError::io(format!(
            "no free recording name for {} in {}",
            base,
            self.recordings_dir.display()
        )))
    }

    /// Load a single container file.
    pub fn load(&self, path: &Path) -> Result<Recording, CalibrationError> {
        let bytes = fs::read(path).map_err(|err| {
            CalibrationError::io(format!("reading {}: {}", path.display(), err))
        })?;
        decode(&bytes).map_err(|err| match err {
            CalibrationError::IoFailure { reason } => {
                CalibrationError::io(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
    }

    /// Load the "last recording" file.
    pub fn load_last(&self) -> Result<Recording, CalibrationError> {
        self.load(&self.last_recording_path)
    }

    /// Load every container in the recordings directory, sorted by file
    /// name, as `(label, recording)` pairs. A missing directory yields an
    /// empty list.
    pub fn load_all(&self) -> Result<Vec<(String, Recording)>, CalibrationError> {
        if !self.recordings_dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.recordings_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(RECORDING_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut recordings = Vec::with_capacity(paths.len());
        for path in paths {
            let label = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let recording = self.load(&path)?;
            recordings.push((label, recording));
        }

        tracing::info!(
            "[RecordingStore] Loaded {} recordings from {}",
            recordings.len(),
            self.recordings_dir.display()
        );
        Ok(recordings)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.recordings_dir
            .join(format!("{}.{}", name, RECORDING_EXTENSION))
    }
}

/// Sibling temp path, unique per process and call.
fn temp_path(path: &Path) -> PathBuf {
    static NEXT_TEMP: AtomicU64 = AtomicU64::new(0);

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(
        ".{}-{}.tmp",
        std::process::id(),
        NEXT_TEMP.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(tmp_name)
}

fn ensure_parent(path: &Path) -> Result<(), CalibrationError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            CalibrationError::io(format!("creating {}: {}", parent.display(), err))
        })?;
    }
    Ok(())
}

fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf, CalibrationError> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    fs::write(&tmp, bytes)
        .map_err(|err| CalibrationError::io(format!("writing {}: {}", tmp.display(), err)))?;
    Ok(tmp)
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CalibrationError> {
    let tmp = write_temp(path, bytes)?;
    fs::rename(&tmp, path).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        CalibrationError::io(format!("renaming into {}: {}", path.display(), err))
    })
}

/// Publish `bytes` at `path` only if nothing exists there yet. Returns
/// false, leaving the existing file untouched, when the name is taken.
fn write_new(path: &Path, bytes: &[u8]) -> Result<bool, CalibrationError> {
    let tmp = write_temp(path, bytes)?;
    // Linking fails with AlreadyExists instead of replacing the target.
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(CalibrationError::io(format!(
            "publishing {}: {}",
            path.display(),
            err
        ))),
    }
}
