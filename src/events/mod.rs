//! Typed pub/sub for progress and lifecycle events.
//!
//! Events are a closed enum with one typed payload per variant, so
//! consumers can never observe a tag/payload mismatch. The bus supports
//! two consumption styles:
//!
//! - **Handlers** — closures dispatched on spawned tasks in priority
//!   order. A slow or panicking handler never stalls the hot path; panics
//!   are caught and logged.
//! - **Named channels** — bounded queues for streaming consumers reading
//!   in order. When a channel is full the event is dropped (explicit
//!   policy: the producer must never block).
//!
//! The bus is threaded through constructors as an explicit dependency;
//! there is no process-wide singleton.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::store::SessionStatus;

/// Payload for file lifecycle events (started / completed / skipped).
#[derive(Debug, Clone, Serialize)]
pub struct FileEvent {
    /// Local file ID.
    pub file_id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Display name.
    pub name: String,
    /// Path relative to the destination.
    pub path: String,
    /// Declared size; `None` for exports, which advertise no size.
    pub size: Option<u64>,
}

/// Payload for streaming transfer progress.
#[derive(Debug, Clone, Serialize)]
pub struct FileProgressEvent {
    /// Local file ID.
    pub file_id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Path relative to the destination.
    pub path: String,
    /// Bytes written so far.
    pub bytes_downloaded: u64,
    /// Declared total; `None` for exports, so consumers report only
    /// `bytes_downloaded` and never a percentage.
    pub total_bytes: Option<u64>,
}

/// Payload for a terminal file failure.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailureEvent {
    /// Local file ID.
    pub file_id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Path relative to the destination.
    pub path: String,
    /// Taxonomy kind string.
    pub error_kind: String,
    /// Last error message.
    pub error: String,
}

/// Payload for folder discovery events.
#[derive(Debug, Clone, Serialize)]
pub struct FolderEvent {
    /// Local folder ID.
    pub folder_id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Path relative to the destination.
    pub path: String,
    /// Files discovered in the folder (set on completion).
    pub file_count: usize,
}

/// Point-in-time session counters for UI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session ID.
    pub session_id: i64,
    /// Current status.
    pub status: SessionStatus,
    /// Files discovered.
    pub total_files: i64,
    /// Files completed.
    pub completed_files: i64,
    /// Files failed.
    pub failed_files: i64,
    /// Files skipped.
    pub skipped_files: i64,
    /// Bytes discovered.
    pub total_bytes: i64,
    /// Bytes completed.
    pub completed_bytes: i64,
    /// Current throughput in bytes/second.
    pub current_speed_bps: u64,
    /// Estimated seconds to completion; 0 when unknown or done.
    pub eta_seconds: u64,
}

/// A typed engine event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A file transfer began.
    FileStarted(FileEvent),
    /// A file transfer made progress.
    FileProgress(FileProgressEvent),
    /// A file was verified and published.
    FileCompleted(FileEvent),
    /// A file failed terminally.
    FileFailed(FileFailureEvent),
    /// A file was skipped by policy.
    FileSkipped(FileEvent),
    /// A folder listing began.
    FolderStarted(FolderEvent),
    /// A folder was fully listed.
    FolderCompleted(FolderEvent),
    /// Session counters changed meaningfully.
    SessionUpdate(SessionSnapshot),
}

impl Event {
    /// Stable variant name for logging and filtering.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FileStarted(_) => "file_started",
            Self::FileProgress(_) => "file_progress",
            Self::FileCompleted(_) => "file_completed",
            Self::FileFailed(_) => "file_failed",
            Self::FileSkipped(_) => "file_skipped",
            Self::FolderStarted(_) => "folder_started",
            Self::FolderCompleted(_) => "folder_completed",
            Self::SessionUpdate(_) => "session_update",
        }
    }
}

/// Handler invoked for every published event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    priority: i32,
    handler: EventHandler,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    channels: Mutex<HashMap<String, mpsc::Sender<Event>>>,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// Typed, priority-ordered event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                channels: Mutex::new(HashMap::new()),
                dropped: AtomicU64::new(0),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Registers a handler with a priority (lower runs first).
    pub fn subscribe(&self, priority: i32, handler: EventHandler) {
        #[allow(clippy::unwrap_used)]
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.push(Subscriber { priority, handler });
        subscribers.sort_by_key(|s| s.priority);
    }

    /// Opens a named bounded channel; the receiver reads events in publish
    /// order. Re-opening a name replaces the previous channel.
    #[must_use]
    pub fn channel(&self, name: &str, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        #[allow(clippy::unwrap_used)]
        let mut channels = self.inner.channels.lock().unwrap();
        channels.insert(name.to_string(), tx);
        rx
    }

    /// Publishes an event to all handlers and channels. Never blocks:
    /// handlers run on spawned tasks and full channels drop the event.
    pub fn publish(&self, event: &Event) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        // Copy handlers out so none are invoked under the lock (a handler
        // may re-enter the bus).
        let handlers: Vec<EventHandler> = {
            #[allow(clippy::unwrap_used)]
            let subscribers = self.inner.subscribers.lock().unwrap();
            subscribers.iter().map(|s| Arc::clone(&s.handler)).collect()
        };
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
                if result.is_err() {
                    warn!(event = event.name(), "event handler panicked");
                }
            });
        }

        #[allow(clippy::unwrap_used)]
        let channels = self.inner.channels.lock().unwrap();
        for (name, tx) in channels.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                self.inner.dropped.fetch_add(1, Ordering::SeqCst);
                warn!(channel = %name, event = event.name(), "event channel full, dropping");
            }
        }
    }

    /// Events dropped due to full channels since the bus was created.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Closes the bus: further publishes are ignored and channel senders
    /// are released so receivers drain what is already queued and then
    /// observe end-of-stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        let mut channels = self.inner.channels.lock().unwrap();
        channels.clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[allow(clippy::unwrap_used)]
        let subscribers = self.inner.subscribers.lock().unwrap().len();
        f.debug_struct("EventBus")
            .field("subscribers", &subscribers)
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn file_event(id: i64) -> Event {
        Event::FileStarted(FileEvent {
            file_id: id,
            session_id: 1,
            name: "x.bin".to_string(),
            path: "a/x.bin".to_string(),
            size: Some(10),
        })
    }

    #[test]
    fn test_event_names_are_stable() {
        assert_eq!(file_event(1).name(), "file_started");
        let snapshot = Event::SessionUpdate(SessionSnapshot {
            session_id: 1,
            status: SessionStatus::Active,
            total_files: 0,
            completed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            total_bytes: 0,
            completed_bytes: 0,
            current_speed_bps: 0,
            eta_seconds: 0,
        });
        assert_eq!(snapshot.name(), "session_update");
    }

    #[tokio::test]
    async fn test_handlers_receive_published_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(
            0,
            Arc::new(move |_event| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(&file_event(1));
        bus.publish(&file_event(2));

        // Handlers run on spawned tasks; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stall_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(0, Arc::new(|_event| panic!("handler bug")));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(
            1,
            Arc::new(move |_event| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(&file_event(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.channel("ui", 16);

        bus.publish(&file_event(1));
        bus.publish(&file_event(2));
        bus.publish(&file_event(3));

        for expected in [1, 2, 3] {
            match rx.recv().await.unwrap() {
                Event::FileStarted(e) => assert_eq!(e.file_id, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.channel("slow", 1);

        bus.publish(&file_event(1));
        bus.publish(&file_event(2)); // dropped: capacity 1, nothing consumed

        assert_eq!(bus.dropped_events(), 1);
        match rx.recv().await.unwrap() {
            Event::FileStarted(e) => assert_eq!(e.file_id, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_drains_queued_events_then_ends_stream() {
        let bus = EventBus::new();
        let mut rx = bus.channel("ui", 8);

        bus.publish(&file_event(1));
        bus.close();
        bus.publish(&file_event(2)); // ignored after close

        match rx.recv().await.unwrap() {
            Event::FileStarted(e) => assert_eq!(e.file_id, 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.recv().await.is_none(), "stream should end after drain");
    }
}
