// EventBroadcaster: fan-out of calibration events
// Single Responsibility: listener registry and event delivery

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::calibration::{CalibrationEvent, CalibrationListener};
use crate::recording::recorder::panic_message;

/// Buffer of the async event channel; slow receivers lag beyond this.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle returned by [`EventBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, Arc<dyn CalibrationListener>)>;

pub type EventStream = Pin<Box<dyn Stream<Item = CalibrationEvent> + Send>>;

/// Delivers events to registered listeners and to an async channel.
///
/// Listeners are called synchronously on the emitting thread, in
/// registration order. The registry is copy-on-write: `emit` clones the
/// current list handle and delivers without holding the lock, so listeners
/// may subscribe or unsubscribe from inside `on_event`.
pub struct EventBroadcaster {
    listeners: RwLock<Arc<ListenerList>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<CalibrationEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn CalibrationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // A poisoned registry still holds a consistent list: writers only
        // swap the Arc.
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let mut updated = Vec::with_capacity(guard.len() + 1);
        updated.extend(guard.iter().cloned());
        updated.push((id, listener));
        *guard = Arc::new(updated);
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let updated: ListenerList = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::new(updated);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Receiver of every event emitted after this call.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.channel.subscribe()
    }

    /// Stream of events emitted after this call; lagged events are skipped.
    pub fn event_stream(&self) -> EventStream {
        let stream = BroadcastStream::new(self.channel.subscribe()).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!("[EventBroadcaster] Event stream lagged: {}", err);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn emit(&self, event: CalibrationEvent) {
        for (id, listener) in self.snapshot().iter() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if let Err(payload) = delivered {
                tracing::warn!(
                    "[EventBroadcaster] Listener {:?} panicked: {}",
                    id,
                    panic_message(payload.as_ref())
                );
            }
        }

        // No receivers is not an error.
        let _ = self.channel.send(event);
    }

    fn snapshot(&self) -> Arc<ListenerList> {
        let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{ProcessStatus, SessionKind};
    use std::sync::Mutex;

    fn status(session_id: u64) -> CalibrationEvent {
        CalibrationEvent::Status(ProcessStatus::progress(
            session_id,
            SessionKind::Record,
            "Recording",
            0,
            1,
            0.0,
        ))
    }

    struct TagListener {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CalibrationListener for TagListener {
        fn on_event(&self, _event: &CalibrationEvent) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let broadcaster = EventBroadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            broadcaster.subscribe(Arc::new(TagListener {
                tag,
                log: Arc::clone(&log),
            }));
        }

        broadcaster.emit(status(1));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = EventBroadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = broadcaster.subscribe(Arc::new(TagListener {
            tag: "gone",
            log: Arc::clone(&log),
        }));

        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
        broadcaster.emit(status(1));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[test]
    fn test_listener_panic_is_contained() {
        let broadcaster = EventBroadcaster::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        broadcaster.subscribe(Arc::new(|_: &CalibrationEvent| {
            panic!("listener bug");
        }));
        broadcaster.subscribe(Arc::new(TagListener {
            tag: "after",
            log: Arc::clone(&log),
        }));

        broadcaster.emit(status(1));
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&broadcaster);
        let own_id = Arc::clone(&slot);
        let id = broadcaster.subscribe(Arc::new(move |_: &CalibrationEvent| {
            if let (Some(b), Some(id)) = (weak.upgrade(), *own_id.lock().unwrap()) {
                b.unsubscribe(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        broadcaster.emit(status(1));
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[test]
    fn test_channel_receives_events() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe_channel();
        broadcaster.emit(status(7));
        assert_eq!(rx.try_recv().unwrap().session_id(), Some(7));
    }

    #[tokio::test]
    async fn test_event_stream() {
        let broadcaster = EventBroadcaster::new();
        let mut stream = broadcaster.event_stream();
        broadcaster.emit(status(1));
        broadcaster.emit(status(2));

        assert_eq!(stream.next().await.unwrap().session_id(), Some(1));
        assert_eq!(stream.next().await.unwrap().session_id(), Some(2));
    }
}
