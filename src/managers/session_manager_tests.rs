use super::*;
use crate::config::{OptimizerConfig, RecordingConfig, SkeletonConfigPaths};
use crate::skeleton::{SegmentLengths, SkeletonConfigStore, SkeletonSegment};
use crate::tracking::{SyntheticTrackerSource, TrackerInfo, TrackerReading};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards every event into a channel the test thread can block on.
struct ChannelListener {
    tx: Mutex<Sender<CalibrationEvent>>,
}

impl CalibrationListener for ChannelListener {
    fn on_event(&self, event: &CalibrationEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event.clone());
        }
    }
}

struct Harness {
    _dir: TempDir,
    controller: SessionController,
    source: Arc<SyntheticTrackerSource>,
    skeleton: Arc<SkeletonConfigStore>,
    events: Receiver<CalibrationEvent>,
}

fn harness(sample_count: u32, sample_interval_ms: u64, save_recordings: bool) -> Harness {
    harness_with(sample_count, sample_interval_ms, save_recordings, |_| {})
}

fn harness_with(
    sample_count: u32,
    sample_interval_ms: u64,
    save_recordings: bool,
    configure: impl FnOnce(&mut AppConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig {
        recording: RecordingConfig {
            sample_count,
            sample_interval_ms,
            save_recordings,
            recordings_dir: dir.path().join("recordings"),
            last_recording_path: dir.path().join("last.mrec"),
            process_saved_recordings: false,
        },
        optimizer: OptimizerConfig {
            num_epochs: 5,
            log_every_n_epochs: 0,
            ..OptimizerConfig::default()
        },
        skeleton: SkeletonConfigPaths {
            config_path: dir.path().join("skeleton.json"),
        },
    };
    configure(&mut config);

    let source = Arc::new(SyntheticTrackerSource::full_body(SegmentLengths::defaults()));
    let skeleton = Arc::new(SkeletonConfigStore::load_or_default(
        config.skeleton.config_path.clone(),
    ));
    let controller = SessionController::new(
        config,
        Arc::clone(&source) as Arc<dyn TrackerSource>,
        Arc::clone(&skeleton) as Arc<dyn SkeletonConfigApplier>,
    );

    let (tx, events) = mpsc::channel();
    controller.subscribe(Arc::new(ChannelListener { tx: Mutex::new(tx) }));

    Harness {
        _dir: dir,
        controller,
        source,
        skeleton,
        events,
    }
}

/// Events of each session in `ids`, up to and including its terminal
/// status.
fn collect_sessions(
    events: &Receiver<CalibrationEvent>,
    ids: &[u64],
) -> HashMap<u64, Vec<CalibrationEvent>> {
    let deadline = Instant::now() + TIMEOUT;
    let mut collected: HashMap<u64, Vec<CalibrationEvent>> = HashMap::new();
    let mut open = ids.len();
    while open > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .expect("session should emit a terminal status");
        let Some(id) = event.session_id().filter(|id| ids.contains(id)) else {
            continue;
        };
        if event.as_terminal().is_some() {
            open -= 1;
        }
        collected.entry(id).or_default().push(event);
    }
    collected
}

fn collect_session(events: &Receiver<CalibrationEvent>, session_id: u64) -> Vec<CalibrationEvent> {
    collect_sessions(events, &[session_id])
        .remove(&session_id)
        .unwrap_or_default()
}

/// Block until the first record progress event with `current >= 1`.
fn wait_for_first_sample(events: &Receiver<CalibrationEvent>) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining).expect("record progress") {
            CalibrationEvent::Status(status) if status.current >= 1 => return,
            _ => continue,
        }
    }
}

fn terminal(events: &[CalibrationEvent]) -> &ProcessStatus {
    events
        .last()
        .and_then(|e| e.as_terminal())
        .expect("last event is terminal")
}

fn assert_single_terminal(events: &[CalibrationEvent]) {
    let terminals = events.iter().filter(|e| e.as_terminal().is_some()).count();
    assert_eq!(terminals, 1);
    assert!(events.last().unwrap().as_terminal().is_some());
}

#[test]
fn test_start_while_running_returns_false() {
    let h = harness(100_000, 5, false);

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(h.controller.is_running(SessionKind::Record));
    assert!(!h.controller.start(SessionKind::Record));
    assert!(matches!(
        h.controller.try_start(SessionKind::Record),
        Err(CalibrationError::AlreadyRunning { .. })
    ));

    assert!(h.controller.cancel_recording());
    let events = collect_session(&h.events, id);
    assert_single_terminal(&events);
    assert!(!h.controller.is_running(SessionKind::Record));
}

#[test]
fn test_record_persists_last_recording() {
    let h = harness(20, 1, false);

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    let events = collect_session(&h.events, id);
    assert_single_terminal(&events);
    assert!(terminal(&events).success, "{}", terminal(&events).message);

    let currents: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            CalibrationEvent::Status(s) if !s.completed => Some(s.current),
            _ => None,
        })
        .collect();
    assert_eq!(currents, (0..=20).collect::<Vec<u32>>());

    let saved = h.controller.store().load_last().unwrap();
    assert_eq!(saved.max_frame_count(), 20);
    assert_eq!(saved.tracker_count(), 7);
    assert!(!h.controller.store().recordings_dir().exists());
}

#[test]
fn test_record_not_ready_fails_immediately() {
    let h = harness(20, 1, true);
    h.source.set_not_ready("no trackers assigned to the legs");

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    let events = collect_session(&h.events, id);

    assert_eq!(events.len(), 1);
    let status = terminal(&events);
    assert!(!status.success);
    assert!(status.message.contains("not ready"));
    assert!(h.controller.latest_recording().is_none());
    assert!(!h.controller.store().last_recording_path().exists());
}

#[test]
fn test_cancel_persists_nothing() {
    let h = harness(100_000, 5, true);

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    wait_for_first_sample(&h.events);
    assert!(h.controller.cancel_recording());

    let events = collect_session(&h.events, id);
    let status = terminal(&events);
    assert!(!status.success);
    assert!(status.message.contains("cancelled"));
    assert!(!h.controller.store().last_recording_path().exists());
    assert!(h.controller.store().load_all().unwrap().is_empty());
}

#[test]
fn test_cancel_before_capture_starts_is_honoured() {
    let h = harness(100_000, 5, false);

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(h.controller.cancel_recording());

    let events = collect_session(&h.events, id);
    assert!(!terminal(&events).success);
}

#[test]
fn test_stop_keeps_partial_recording() {
    let h = harness(100_000, 5, false);

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    wait_for_first_sample(&h.events);
    assert!(h.controller.stop_recording());

    let events = collect_session(&h.events, id);
    assert!(terminal(&events).success);
    let saved = h.controller.store().load_last().unwrap();
    assert!(saved.max_frame_count() >= 1);
    assert!(saved.max_frame_count() < 100_000);
}

#[test]
fn test_stop_without_record_session() {
    let h = harness(20, 1, false);
    assert!(!h.controller.stop_recording());
    assert!(!h.controller.cancel_recording());
}

#[test]
fn test_save_without_recording_fails() {
    let h = harness(20, 1, false);

    let id = h.controller.try_start(SessionKind::Save).unwrap();
    let events = collect_session(&h.events, id);
    let status = terminal(&events);
    assert!(!status.success);
    assert!(status.message.contains("empty"));
}

#[test]
fn test_save_after_record() {
    let h = harness(15, 1, false);

    let record = h.controller.try_start(SessionKind::Record).unwrap();
    // Save waits on the pending recording while the capture runs.
    let save = loop {
        if h.controller.latest_recording().is_some() {
            break h.controller.try_start(SessionKind::Save).unwrap();
        }
        thread::sleep(Duration::from_millis(1));
    };

    let mut sessions = collect_sessions(&h.events, &[record, save]);
    assert!(terminal(&sessions.remove(&record).unwrap()).success);
    let events = sessions.remove(&save).unwrap();
    assert!(terminal(&events).success, "{}", terminal(&events).message);

    let stored = h.controller.store().load_all().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].1.max_frame_count(), 15);
}

#[test]
fn test_process_and_apply() {
    let h = harness(40, 1, false);

    let record = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(terminal(&collect_session(&h.events, record)).success);

    let process = h.controller.try_start(SessionKind::Process).unwrap();
    let events = collect_session(&h.events, process);
    assert_single_terminal(&events);
    let status = terminal(&events);
    assert!(status.success, "{}", status.message);

    let epochs = events
        .iter()
        .filter(|e| matches!(e, CalibrationEvent::Epoch(_)))
        .count();
    assert_eq!(epochs, 5);
    let results_at = events
        .iter()
        .position(|e| matches!(e, CalibrationEvent::Results(_)))
        .expect("results event");
    assert_eq!(results_at, events.len() - 2);

    let accepted = h.controller.last_result().expect("accepted result");
    assert_eq!(accepted.recordings.len(), 1);
    assert_eq!(accepted.recordings[0].label, LATEST_RECORDING_LABEL);

    h.controller.apply_values().unwrap();
    match h.events.recv_timeout(TIMEOUT).unwrap() {
        CalibrationEvent::ValuesApplied { success, .. } => assert!(success),
        other => panic!("expected ValuesApplied, got {:?}", other),
    }
    assert_eq!(
        h.skeleton.current().unwrap().get(SkeletonSegment::UpperLeg),
        accepted.lengths.get(SkeletonSegment::UpperLeg)
    );
}

#[test]
fn test_process_without_recordings_fails() {
    let h = harness(20, 1, false);

    let id = h.controller.try_start(SessionKind::Process).unwrap();
    let events = collect_session(&h.events, id);
    assert!(!terminal(&events).success);
    assert!(h.controller.last_result().is_none());
}

#[test]
fn test_apply_without_result() {
    let h = harness(20, 1, false);
    assert_eq!(
        h.controller.apply_values(),
        Err(CalibrationError::NoResultAvailable)
    );
}

struct FailingApplier;

impl SkeletonConfigApplier for FailingApplier {
    fn apply(&self, _lengths: &SegmentLengths) -> Result<(), CalibrationError> {
        Err(CalibrationError::io("read-only filesystem"))
    }

    fn current_lengths(&self) -> SegmentLengths {
        panic!("skeleton unavailable");
    }
}

#[test]
fn test_session_panic_is_terminal_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.recording.last_recording_path = dir.path().join("last.mrec");
    config.recording.recordings_dir = dir.path().join("recordings");

    let controller = SessionController::new(
        config,
        Arc::new(SyntheticTrackerSource::full_body(SegmentLengths::defaults())),
        Arc::new(FailingApplier),
    );
    let (tx, events) = mpsc::channel();
    controller.subscribe(Arc::new(ChannelListener { tx: Mutex::new(tx) }));

    let mut recording = Recording::default();
    recording.trackers.push(crate::recording::TrackerFrames::new(TrackerInfo::new(1, "hip", None)));
    controller
        .inner
        .publish_recording(PendingRecording::ready(CaptureOutcome::Completed(Arc::new(recording))))
        .unwrap();

    let id = controller.try_start(SessionKind::Process).unwrap();
    let collected = collect_session(&events, id);
    let status = terminal(&collected);
    assert!(!status.success);
    assert!(status.message.contains("skeleton unavailable"));
    assert!(!controller.is_running(SessionKind::Process));
    assert!(controller.try_start(SessionKind::Process).is_ok());
}

struct PanickingSource;

impl TrackerSource for PanickingSource {
    fn readiness(&self) -> Result<(), String> {
        Ok(())
    }

    fn trackers(&self) -> Vec<TrackerInfo> {
        vec![TrackerInfo::new(1, "hip", None)]
    }

    fn poll(&self) -> Vec<TrackerReading> {
        panic!("driver crashed");
    }
}

#[test]
fn test_capture_panic_releases_record_flag() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.recording.last_recording_path = dir.path().join("last.mrec");

    let controller = SessionController::new(
        config,
        Arc::new(PanickingSource),
        Arc::new(SkeletonConfigStore::load_or_default(dir.path().join("skeleton.json"))),
    );
    let (tx, events) = mpsc::channel();
    controller.subscribe(Arc::new(ChannelListener { tx: Mutex::new(tx) }));

    let id = controller.try_start(SessionKind::Record).unwrap();
    let collected = collect_session(&events, id);
    assert!(!terminal(&collected).success);
    assert!(terminal(&collected).message.contains("driver crashed"));
    assert!(!controller.is_running(SessionKind::Record));
}

#[test]
fn test_apply_failure_reported_as_event() {
    let controller = SessionController::new(
        AppConfig::default(),
        Arc::new(SyntheticTrackerSource::full_body(SegmentLengths::defaults())),
        Arc::new(FailingApplier),
    );
    let (tx, events) = mpsc::channel();
    controller.subscribe(Arc::new(ChannelListener { tx: Mutex::new(tx) }));

    *controller.inner.last_result.write().unwrap() = Some(Arc::new(BatchOutcome {
        lengths: SegmentLengths::defaults(),
        sources: Default::default(),
        statistics: Default::default(),
        recordings: Vec::new(),
    }));

    assert!(controller.apply_values().is_ok());
    match events.recv_timeout(TIMEOUT).unwrap() {
        CalibrationEvent::ValuesApplied { success, message } => {
            assert!(!success);
            assert!(message.contains("read-only"));
        }
        other => panic!("expected ValuesApplied, got {:?}", other),
    }
}

#[test]
fn test_saved_copy_of_latest_recording_counted_once() {
    let h = harness_with(20, 1, true, |config| {
        config.recording.process_saved_recordings = true;
    });

    let record = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(terminal(&collect_session(&h.events, record)).success);
    // A Save session adds a second permanent copy of the same recording.
    let save = h.controller.try_start(SessionKind::Save).unwrap();
    assert!(terminal(&collect_session(&h.events, save)).success);
    assert_eq!(h.controller.store().load_all().unwrap().len(), 2);

    let process = h.controller.try_start(SessionKind::Process).unwrap();
    let events = collect_session(&h.events, process);
    assert!(terminal(&events).success, "{}", terminal(&events).message);

    let outcome = h.controller.last_result().unwrap();
    assert_eq!(outcome.statistics.count(), 1);
    assert_eq!(outcome.recordings.len(), 1);
    assert_eq!(outcome.recordings[0].label, LATEST_RECORDING_LABEL);
    assert_eq!(outcome.statistics.std_dev(), 0.0);
}

#[test]
fn test_stored_recordings_other_than_latest_are_kept() {
    let h = harness_with(20, 1, false, |config| {
        config.recording.process_saved_recordings = true;
    });

    // An older, different recording already on disk.
    let older = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(terminal(&collect_session(&h.events, older)).success);
    let save = h.controller.try_start(SessionKind::Save).unwrap();
    assert!(terminal(&collect_session(&h.events, save)).success);

    // The synthetic motion keeps advancing, so this capture differs.
    let latest = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(terminal(&collect_session(&h.events, latest)).success);

    let process = h.controller.try_start(SessionKind::Process).unwrap();
    assert!(terminal(&collect_session(&h.events, process)).success);

    let outcome = h.controller.last_result().unwrap();
    assert_eq!(outcome.statistics.count(), 2);
    assert_eq!(outcome.recordings[0].label, LATEST_RECORDING_LABEL);
}

#[test]
fn test_spawn_failure_is_returned_and_releases_flag() {
    let h = harness(10, 1, false);

    let result = h.controller.start_with(SessionKind::Record, |_, _| {
        Err(io::Error::new(io::ErrorKind::Other, "thread limit reached"))
    });
    assert!(matches!(result, Err(CalibrationError::IoFailure { .. })));
    assert!(!h.controller.is_running(SessionKind::Record));
    assert!(h.events.try_recv().is_err(), "no session, no events");

    let id = h.controller.try_start(SessionKind::Record).unwrap();
    assert!(terminal(&collect_session(&h.events, id)).success);
}
