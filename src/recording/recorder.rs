// Recorder - samples live tracking into a Recording on a capture thread
//
// The capture result is published through a single-assignment shared future
// so the record session, a later save session and a process session can all
// wait on the same recording without copying it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::CalibrationError;
use crate::recording::{Recording, TrackerFrame, TrackerFrames};
use crate::tracking::TrackerSource;

/// Final state of a capture.
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// Full window, or the samples taken before an early stop
    Completed(Arc<Recording>),
    /// Discarded by the operator
    Cancelled,
    /// The capture thread failed (e.g. the tracker source panicked)
    Failed(String),
}

impl CaptureOutcome {
    pub fn recording(&self) -> Option<&Arc<Recording>> {
        match self {
            CaptureOutcome::Completed(recording) => Some(recording),
            _ => None,
        }
    }
}

/// Shared handle to a recording that may still be in progress.
///
/// Cloning is cheap; every clone resolves to the same outcome.
#[derive(Clone)]
pub struct PendingRecording {
    inner: Shared<BoxFuture<'static, CaptureOutcome>>,
}

impl PendingRecording {
    fn from_receiver(rx: oneshot::Receiver<CaptureOutcome>) -> Self {
        let inner = rx
            .map(|result| {
                result.unwrap_or_else(|_| {
                    CaptureOutcome::Failed("capture thread exited without a result".to_string())
                })
            })
            .boxed()
            .shared();
        Self { inner }
    }

    /// Already-resolved handle, e.g. for a recording loaded from disk.
    pub fn ready(outcome: CaptureOutcome) -> Self {
        Self {
            inner: futures::future::ready(outcome).boxed().shared(),
        }
    }

    /// Block the calling thread until the capture resolves.
    pub fn wait(&self) -> CaptureOutcome {
        futures::executor::block_on(self.inner.clone())
    }

    /// Outcome if already resolved, without blocking.
    pub fn peek(&self) -> Option<CaptureOutcome> {
        self.inner.peek().cloned()
    }
}

impl std::fmt::Debug for PendingRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRecording")
            .field("resolved", &self.inner.peek().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureSignal {
    Stop,
    Cancel,
}

/// Early stop / cancel for a running capture.
#[derive(Debug, Clone)]
pub struct CaptureControl {
    signals: Sender<CaptureSignal>,
}

impl CaptureControl {
    /// End the window now and keep the samples taken so far.
    /// Returns false when the capture already finished.
    pub fn stop(&self) -> bool {
        self.signals.send(CaptureSignal::Stop).is_ok()
    }

    /// Discard the recording. Returns false when the capture already finished.
    pub fn cancel(&self) -> bool {
        self.signals.send(CaptureSignal::Cancel).is_ok()
    }
}

/// Handle returned by [`Recorder::start_capture`].
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    pub pending: PendingRecording,
    pub control: CaptureControl,
}

/// Samples a [`TrackerSource`] for a fixed-length window.
pub struct Recorder {
    source: Arc<dyn TrackerSource>,
}

impl Recorder {
    pub fn new(source: Arc<dyn TrackerSource>) -> Self {
        Self { source }
    }

    /// Start capturing `sample_count` samples, one every
    /// `sample_interval_ms`.
    ///
    /// `on_progress(current, total, eta_secs)` is called once with
    /// `current = 0` before the first sample and then after every sample,
    /// from the capture thread.
    ///
    /// # Errors
    /// `NotReady` when the source cannot currently produce valid samples or
    /// has no trackers. `IoFailure` if the capture thread cannot be spawned.
    pub fn start_capture<F>(
        &self,
        sample_count: u32,
        sample_interval_ms: u64,
        on_progress: F,
    ) -> Result<CaptureHandle, CalibrationError>
    where
        F: FnMut(u32, u32, f32) + Send + 'static,
    {
        self.source
            .readiness()
            .map_err(|reason| CalibrationError::NotReady { reason })?;

        let trackers = self.source.trackers();
        if trackers.is_empty() {
            return Err(CalibrationError::NotReady {
                reason: "no trackers are active".to_string(),
            });
        }

        let (signal_tx, signal_rx) = mpsc::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let source = Arc::clone(&self.source);
        let interval = Duration::from_millis(sample_interval_ms);

        tracing::info!(
            "[Recorder] Starting capture: {} trackers, {} samples every {} ms",
            trackers.len(),
            sample_count,
            sample_interval_ms
        );

        thread::Builder::new()
            .name("autobone-capture".to_string())
            .spawn(move || {
                let sequences: Vec<TrackerFrames> =
                    trackers.into_iter().map(TrackerFrames::new).collect();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    capture_loop(
                        source.as_ref(),
                        sequences,
                        sample_count,
                        interval,
                        &signal_rx,
                        on_progress,
                    )
                }))
                .unwrap_or_else(|payload| {
                    let reason = panic_message(payload.as_ref());
                    tracing::warn!("[Recorder] Capture thread panicked: {}", reason);
                    CaptureOutcome::Failed(reason)
                });
                // Receiver side may be gone if nobody kept the handle.
                let _ = outcome_tx.send(outcome);
            })
            .map_err(|err| CalibrationError::io(format!("failed to spawn capture thread: {}", err)))?;

        Ok(CaptureHandle {
            pending: PendingRecording::from_receiver(outcome_rx),
            control: CaptureControl { signals: signal_tx },
        })
    }
}

fn capture_loop<F>(
    source: &dyn TrackerSource,
    mut sequences: Vec<TrackerFrames>,
    sample_count: u32,
    interval: Duration,
    signals: &Receiver<CaptureSignal>,
    mut on_progress: F,
) -> CaptureOutcome
where
    F: FnMut(u32, u32, f32),
{
    let eta = |current: u32| (sample_count - current) as f32 * interval.as_secs_f32();

    for sequence in sequences.iter_mut() {
        sequence.frames.reserve(sample_count as usize);
    }
    on_progress(0, sample_count, eta(0));

    for current in 1..=sample_count {
        let readings = source.poll();
        for sequence in sequences.iter_mut() {
            let frame = readings
                .iter()
                .find(|r| r.tracker_id == sequence.tracker.id)
                .map(|r| r.frame.clone())
                .unwrap_or_else(TrackerFrame::empty);
            sequence.frames.push(frame);
        }
        on_progress(current, sample_count, eta(current));

        if current == sample_count {
            break;
        }

        match signals.recv_timeout(interval) {
            Ok(CaptureSignal::Stop) => {
                tracing::info!(
                    "[Recorder] Stopped early after {}/{} samples",
                    current,
                    sample_count
                );
                break;
            }
            Ok(CaptureSignal::Cancel) => {
                tracing::info!("[Recorder] Capture cancelled after {} samples", current);
                return CaptureOutcome::Cancelled;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(interval),
        }
    }

    CaptureOutcome::Completed(Arc::new(Recording::new(sequences)))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic with non-string payload".to_string()
    }
}
