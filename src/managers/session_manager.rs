// SessionController: record / save / process sessions
//
// Single Responsibility: session lifecycle, exclusivity and failure recovery
//
// Each session kind has an AtomicBool run flag that is the only authority on
// whether a session of that kind is active. `start` claims the flag with a
// compare-exchange and hands it to a RunGuard owned by the session thread;
// the guard releases it on every exit path, including panics.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Instant;

use crate::calibration::{
    CalibrationEvent, CalibrationListener, CalibrationResults, EpochUpdate, ProcessStatus,
    SessionKind,
};
use crate::config::AppConfig;
use crate::error::{log_calibration_error, CalibrationError, ErrorCode};
use crate::managers::broadcast_manager::{EventBroadcaster, ListenerId};
use crate::optimizer::{BatchOutcome, Optimizer, ResultAggregator};
use crate::recording::recorder::panic_message;
use crate::recording::{CaptureControl, CaptureOutcome, PendingRecording, Recorder, Recording, RecordingStore};
use crate::skeleton::SkeletonConfigApplier;
use crate::tracking::TrackerSource;

/// Label of the most recent recording inside a process batch.
const LATEST_RECORDING_LABEL: &str = "latest";

/// Failure of a background session, with the message for its terminal
/// status.
struct SessionFailure {
    error: CalibrationError,
    detail: String,
}

impl From<CalibrationError> for SessionFailure {
    fn from(error: CalibrationError) -> Self {
        let detail = error.message();
        Self { error, detail }
    }
}

type SessionResult = Result<String, SessionFailure>;

/// Work run on a session thread.
type SessionBody = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureRequest {
    Stop,
    Cancel,
}

/// Capture control of the running record session. A stop or cancel that
/// arrives before the capture thread exists is parked in `requested` and
/// delivered as soon as the control is installed.
#[derive(Default)]
struct CaptureSlot {
    control: Option<CaptureControl>,
    requested: Option<CaptureRequest>,
}

impl CaptureSlot {
    fn deliver(control: &CaptureControl, request: CaptureRequest) -> bool {
        match request {
            CaptureRequest::Stop => control.stop(),
            CaptureRequest::Cancel => control.cancel(),
        }
    }
}

/// Releases a session kind's run flag when dropped.
struct RunGuard {
    inner: Arc<ControllerInner>,
    kind: SessionKind,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running[self.kind.index()].store(false, Ordering::SeqCst);
    }
}

struct ControllerInner {
    config: AppConfig,
    recorder: Recorder,
    store: RecordingStore,
    applier: Arc<dyn SkeletonConfigApplier>,
    broadcaster: Arc<EventBroadcaster>,
    running: [AtomicBool; 3],
    next_session_id: AtomicU64,
    latest_recording: Mutex<Option<PendingRecording>>,
    capture: Mutex<CaptureSlot>,
    last_result: RwLock<Option<Arc<BatchOutcome>>>,
}

/// Runs calibration sessions on background threads.
///
/// At most one session per [`SessionKind`] runs at a time; sessions of
/// different kinds may overlap. Every session emits exactly one terminal
/// [`ProcessStatus`] as its last event.
///
/// # Example
/// ```ignore
/// let controller = SessionController::new(config, source, applier);
/// controller.subscribe(listener);
/// controller.start(SessionKind::Record);
/// // ... wait for the terminal status ...
/// controller.start(SessionKind::Process);
/// controller.apply_values()?;
/// ```
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        source: Arc<dyn TrackerSource>,
        applier: Arc<dyn SkeletonConfigApplier>,
    ) -> Self {
        let store = RecordingStore::new(
            config.recording.recordings_dir.clone(),
            config.recording.last_recording_path.clone(),
        );
        Self {
            inner: Arc::new(ControllerInner {
                recorder: Recorder::new(source),
                store,
                applier,
                broadcaster: Arc::new(EventBroadcaster::new()),
                running: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
                next_session_id: AtomicU64::new(1),
                latest_recording: Mutex::new(None),
                capture: Mutex::new(CaptureSlot::default()),
                last_result: RwLock::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &RecordingStore {
        &self.inner.store
    }

    pub fn broadcaster(&self) -> Arc<EventBroadcaster> {
        Arc::clone(&self.inner.broadcaster)
    }

    /// Start a session of `kind`. Returns false, without side effects, when
    /// one is already running or its thread cannot be spawned.
    pub fn start(&self, kind: SessionKind) -> bool {
        self.try_start(kind).is_ok()
    }

    /// Start a session of `kind` and return its session id.
    ///
    /// # Errors
    /// `AlreadyRunning` when a session of `kind` is active. `IoFailure` when
    /// the session thread cannot be spawned; no session exists then and no
    /// event is emitted.
    pub fn try_start(&self, kind: SessionKind) -> Result<u64, CalibrationError> {
        self.start_with(kind, |builder, body| builder.spawn(body).map(drop))
    }

    /// Claim the run flag of `kind` and hand the session body to `spawn`.
    fn start_with<S>(&self, kind: SessionKind, spawn: S) -> Result<u64, CalibrationError>
    where
        S: FnOnce(thread::Builder, SessionBody) -> io::Result<()>,
    {
        if self.inner.running[kind.index()]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("[SessionController] {} session already running", kind.display_name());
            return Err(CalibrationError::AlreadyRunning {
                kind: kind.display_name().to_string(),
            });
        }

        let guard = RunGuard {
            inner: Arc::clone(&self.inner),
            kind,
        };
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);

        tracing::info!(
            "[SessionController] Starting {} session {}",
            kind.display_name(),
            session_id
        );

        let builder =
            thread::Builder::new().name(format!("autobone-{}", kind.display_name().to_lowercase()));
        // On failure the body, and with it the guard, is dropped.
        spawn(builder, Box::new(move || inner.run_session(kind, session_id, guard))).map_err(
            |err| {
                let error =
                    CalibrationError::io(format!("failed to spawn session thread: {}", err));
                log_calibration_error(&error, "start_session");
                error
            },
        )?;
        Ok(session_id)
    }

    pub fn is_running(&self, kind: SessionKind) -> bool {
        self.inner.running[kind.index()].load(Ordering::SeqCst)
    }

    /// End the running capture early and keep the partial recording.
    /// Returns false when no record session is running.
    pub fn stop_recording(&self) -> bool {
        self.signal_capture(CaptureRequest::Stop)
    }

    /// Discard the running capture; the record session fails and nothing
    /// is persisted. Returns false when no record session is running.
    pub fn cancel_recording(&self) -> bool {
        self.signal_capture(CaptureRequest::Cancel)
    }

    fn signal_capture(&self, request: CaptureRequest) -> bool {
        let mut slot = match self.inner.lock_capture() {
            Ok(slot) => slot,
            Err(err) => {
                log_calibration_error(&err, "signal_capture");
                return false;
            }
        };
        // Checked under the slot lock: the record session releases its run
        // flag while holding it.
        if !self.is_running(SessionKind::Record) {
            return false;
        }

        match slot.control.as_ref() {
            Some(control) => CaptureSlot::deliver(control, request),
            None => {
                if slot.requested != Some(CaptureRequest::Cancel) {
                    slot.requested = Some(request);
                }
                true
            }
        }
    }

    /// Hand the last accepted result to the skeleton configuration.
    ///
    /// Applier failures are logged and reported through a
    /// `ValuesApplied { success: false }` event.
    ///
    /// # Errors
    /// `NoResultAvailable` when no process session has succeeded yet.
    pub fn apply_values(&self) -> Result<(), CalibrationError> {
        let outcome = self.last_result().ok_or_else(|| {
            let err = CalibrationError::NoResultAvailable;
            log_calibration_error(&err, "apply_values");
            err
        })?;

        let event = match self.inner.applier.apply(&outcome.lengths) {
            Ok(()) => CalibrationEvent::ValuesApplied {
                success: true,
                message: format!(
                    "Applied segment lengths (height {:.3} m)",
                    outcome.lengths.estimated_height()
                ),
            },
            Err(err) => {
                log_calibration_error(&err, "apply_values");
                CalibrationEvent::ValuesApplied {
                    success: false,
                    message: err.message(),
                }
            }
        };
        self.inner.broadcaster.emit(event);
        Ok(())
    }

    /// Accepted result of the last successful process session.
    pub fn last_result(&self) -> Option<Arc<BatchOutcome>> {
        let guard = self
            .inner
            .last_result
            .read()
            .unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Most recent recording, possibly still being captured.
    pub fn latest_recording(&self) -> Option<PendingRecording> {
        self.inner
            .lock_latest_recording()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Make the "last recording" file the most recent recording, e.g. after
    /// a restart.
    pub fn restore_last_recording(&self) -> Result<(), CalibrationError> {
        let recording = self.inner.store.load_last().inspect_err(|err| {
            log_calibration_error(err, "restore_last_recording");
        })?;
        self.inner.publish_recording(PendingRecording::ready(CaptureOutcome::Completed(
            Arc::new(recording),
        )))
    }

    pub fn subscribe(&self, listener: Arc<dyn CalibrationListener>) -> ListenerId {
        self.inner.broadcaster.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.broadcaster.unsubscribe(id)
    }
}

impl ControllerInner {
    fn run_session(&self, kind: SessionKind, session_id: u64, guard: RunGuard) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            SessionKind::Record => self.run_record(session_id),
            SessionKind::Save => self.run_save(session_id),
            SessionKind::Process => self.run_process(session_id),
        }));

        let terminal = match outcome {
            Ok(Ok(message)) => {
                tracing::info!(
                    "[SessionController] {} session {} finished: {}",
                    kind.display_name(),
                    session_id,
                    message
                );
                ProcessStatus::finished(session_id, kind, true, message)
            }
            Ok(Err(failure)) => {
                log_calibration_error(&failure.error, kind.display_name());
                ProcessStatus::finished(session_id, kind, false, failure.detail)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(
                    "[SessionController] {} session {} panicked: {}",
                    kind.display_name(),
                    session_id,
                    message
                );
                ProcessStatus::finished(session_id, kind, false, message)
            }
        };

        // Idle before the terminal event, so listeners may start the next
        // session from inside their callback.
        let mut slot = match kind {
            SessionKind::Record => self.lock_capture().ok(),
            _ => None,
        };
        if let Some(slot) = slot.as_mut() {
            **slot = CaptureSlot::default();
        }
        drop(guard);
        drop(slot);
        self.broadcaster.emit(CalibrationEvent::Status(terminal));
    }

    fn emit_progress(
        &self,
        session_id: u64,
        kind: SessionKind,
        message: impl Into<String>,
        current: u32,
        total: u32,
        eta_secs: f32,
    ) {
        self.broadcaster.emit(CalibrationEvent::Status(ProcessStatus::progress(
            session_id, kind, message, current, total, eta_secs,
        )));
    }

    fn run_record(&self, session_id: u64) -> SessionResult {
        let settings = &self.config.recording;
        let broadcaster = Arc::clone(&self.broadcaster);

        let handle = self.recorder.start_capture(
            settings.sample_count,
            settings.sample_interval_ms,
            move |current, total, eta_secs| {
                broadcaster.emit(CalibrationEvent::Status(ProcessStatus::progress(
                    session_id,
                    SessionKind::Record,
                    "Recording",
                    current,
                    total,
                    eta_secs,
                )));
            },
        )?;

        self.publish_recording(handle.pending.clone())?;
        {
            let mut slot = self.lock_capture()?;
            if let Some(request) = slot.requested.take() {
                CaptureSlot::deliver(&handle.control, request);
            }
            slot.control = Some(handle.control.clone());
        }

        let recording = match handle.pending.wait() {
            CaptureOutcome::Completed(recording) => recording,
            CaptureOutcome::Cancelled => return Err(CalibrationError::Cancelled.into()),
            CaptureOutcome::Failed(reason) => {
                return Err(CalibrationError::NotReady { reason }.into())
            }
        };
        recording.validate()?;

        self.store.save(&recording, None)?;
        if settings.save_recordings {
            let path = self.store.save_permanent(&recording)?;
            tracing::info!("[SessionController] Recording kept at {}", path.display());
        }

        Ok(format!(
            "Recording finished: {} trackers, {} frames",
            recording.tracker_count(),
            recording.max_frame_count()
        ))
    }

    fn run_save(&self, session_id: u64) -> SessionResult {
        let pending = self
            .lock_latest_recording()?
            .clone()
            .ok_or_else(|| CalibrationError::empty("no recording to save"))?;

        if pending.peek().is_none() {
            self.emit_progress(session_id, SessionKind::Save, "Waiting for recording", 0, 1, 0.0);
        }
        let recording = match pending.wait() {
            CaptureOutcome::Completed(recording) => recording,
            CaptureOutcome::Cancelled => return Err(CalibrationError::Cancelled.into()),
            CaptureOutcome::Failed(reason) => {
                return Err(CalibrationError::NotReady { reason }.into())
            }
        };

        let path = self.store.save_permanent(&recording)?;
        Ok(format!("Recording saved to {}", path.display()))
    }

    fn collect_batch(&self, session_id: u64) -> Result<Vec<(String, Arc<Recording>)>, CalibrationError> {
        let mut batch = Vec::new();

        let pending = self.lock_latest_recording()?.clone();
        if let Some(pending) = pending {
            if pending.peek().is_none() {
                self.emit_progress(session_id, SessionKind::Process, "Waiting for recording", 0, 0, 0.0);
            }
            match pending.wait() {
                CaptureOutcome::Completed(recording) => {
                    batch.push((LATEST_RECORDING_LABEL.to_string(), recording))
                }
                CaptureOutcome::Cancelled => {
                    tracing::warn!("[SessionController] Latest recording was cancelled; skipping it")
                }
                CaptureOutcome::Failed(reason) => tracing::warn!(
                    "[SessionController] Latest recording failed ({}); skipping it",
                    reason
                ),
            }
        }

        if self.config.recording.process_saved_recordings {
            // Permanent copies of the latest recording (from Record with
            // save_recordings, or from Save) are the same sample.
            let latest = batch.first().map(|(_, recording)| Arc::clone(recording));
            for (label, recording) in self.store.load_all()? {
                if latest.as_deref() == Some(&recording) {
                    tracing::debug!(
                        "[SessionController] Stored recording {} is the latest recording; counted once",
                        label
                    );
                    continue;
                }
                batch.push((label, Arc::new(recording)));
            }
        }

        if batch.is_empty() {
            return Err(CalibrationError::empty("no recordings to process"));
        }
        Ok(batch)
    }

    fn run_process(&self, session_id: u64) -> SessionResult {
        let batch = self.collect_batch(session_id)?;
        let initial = self.applier.current_lengths();

        let epochs_per_recording = self.config.optimizer.num_epochs;
        let total = epochs_per_recording.saturating_mul(batch.len() as u32);
        let batch_len = batch.len();
        self.emit_progress(session_id, SessionKind::Process, "Processing", 0, total, 0.0);

        let started = Instant::now();
        let aggregator = ResultAggregator::new(Optimizer::new(self.config.optimizer.clone()));
        let outcome = aggregator
            .process_batch(&batch, &initial, |index, report| {
                self.broadcaster.emit(CalibrationEvent::Epoch(EpochUpdate {
                    session_id,
                    recording_index: index,
                    epoch: report.epoch,
                    total_epochs: report.total_epochs,
                    epoch_error: report.epoch_error,
                    lengths: report.lengths.clone(),
                }));

                let done = index as u32 * epochs_per_recording + report.epoch;
                let per_epoch = started.elapsed().as_secs_f32() / done.max(1) as f32;
                self.emit_progress(
                    session_id,
                    SessionKind::Process,
                    format!("Processing recording {}/{}", index + 1, batch_len),
                    done,
                    total,
                    per_epoch * total.saturating_sub(done) as f32,
                );
            })
            .map_err(|failure| SessionFailure {
                detail: format!(
                    "Recording {} ({}) failed: {}",
                    failure.index,
                    failure.label,
                    failure.error.message()
                ),
                error: failure.error,
            })?;

        let message = format!(
            "Calibration finished over {} recordings: mean height difference {:+.4} m, std dev {:.4} m",
            outcome.recordings.len(),
            outcome.statistics.mean(),
            outcome.statistics.std_dev()
        );

        let outcome = Arc::new(outcome);
        {
            let mut slot = self
                .last_result
                .write()
                .map_err(|_| CalibrationError::StatePoisoned {
                    component: "last_result".to_string(),
                })?;
            *slot = Some(Arc::clone(&outcome));
        }
        self.broadcaster.emit(CalibrationEvent::Results(CalibrationResults {
            session_id,
            outcome: (*outcome).clone(),
        }));

        Ok(message)
    }

    fn publish_recording(&self, pending: PendingRecording) -> Result<(), CalibrationError> {
        *self.lock_latest_recording()? = Some(pending);
        Ok(())
    }

    // ========================================================================
    // HELPER METHODS - Lock management
    // ========================================================================

    fn lock_latest_recording(
        &self,
    ) -> Result<MutexGuard<'_, Option<PendingRecording>>, CalibrationError> {
        self.latest_recording
            .lock()
            .map_err(|_| CalibrationError::StatePoisoned {
                component: "latest_recording".to_string(),
            })
    }

    fn lock_capture(&self) -> Result<MutexGuard<'_, CaptureSlot>, CalibrationError> {
        self.capture
            .lock()
            .map_err(|_| CalibrationError::StatePoisoned {
                component: "capture".to_string(),
            })
    }
}

#[cfg(test)]
#[path = "session_manager_tests.rs"]
mod tests;
