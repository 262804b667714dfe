//! Session-scoped progress accounting, throughput sampling, ETA, and
//! bandwidth shaping.
//!
//! The tracker mirrors the session counters in memory (the store stays
//! authoritative), samples per-second throughput over a 10-second sliding
//! window, and emits typed events through the [`EventBus`]. Session-update
//! events are throttled to roughly one per second during progress
//! streaming; meaningful transitions (completion, failure, discovery)
//! always emit.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::SyncError;
use crate::events::{
    Event, EventBus, FileEvent, FileFailureEvent, FileProgressEvent, FolderEvent,
    SessionSnapshot,
};
use crate::store::{FileRecord, Folder, SessionStatus};

/// Sliding window length for speed samples, in seconds.
const SPEED_WINDOW_SECS: u64 = 10;

/// Minimum interval between streamed session-update events.
const SESSION_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// One-second throughput samples keyed by elapsed whole seconds.
#[derive(Debug)]
struct SpeedWindow {
    started: tokio::time::Instant,
    samples: VecDeque<(u64, u64)>,
}

impl SpeedWindow {
    fn new() -> Self {
        Self {
            started: tokio::time::Instant::now(),
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, bytes: u64) {
        let second = self.started.elapsed().as_secs();
        match self.samples.back_mut() {
            Some((s, total)) if *s == second => *total += bytes,
            _ => self.samples.push_back((second, bytes)),
        }
        let cutoff = second.saturating_sub(SPEED_WINDOW_SECS - 1);
        while self.samples.front().is_some_and(|(s, _)| *s < cutoff) {
            self.samples.pop_front();
        }
    }

    /// Average bytes/second over the covered portion of the window.
    fn current_speed(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        #[allow(clippy::unwrap_used)]
        let span = {
            let first = self.samples.front().unwrap().0;
            let last = self.samples.back().unwrap().0;
            (last - first + 1).min(SPEED_WINDOW_SECS)
        };
        total / span
    }
}

/// Rolling one-second bandwidth window.
#[derive(Debug)]
struct BandwidthWindow {
    window_start: tokio::time::Instant,
    used: u64,
}

/// Session-scoped progress tracker.
#[derive(Debug)]
pub struct ProgressTracker {
    session_id: i64,
    bus: EventBus,
    status: Mutex<SessionStatus>,
    total_files: AtomicI64,
    completed_files: AtomicI64,
    failed_files: AtomicI64,
    skipped_files: AtomicI64,
    total_bytes: AtomicI64,
    completed_bytes: AtomicI64,
    /// Bytes/second cap; 0 disables shaping.
    bandwidth_limit: AtomicU64,
    bandwidth: Mutex<BandwidthWindow>,
    speed: Mutex<SpeedWindow>,
    last_session_update: Mutex<Option<tokio::time::Instant>>,
}

impl ProgressTracker {
    /// Creates a tracker for a session, emitting on the given bus.
    /// `bandwidth_limit` is in bytes/second; 0 disables shaping.
    #[must_use]
    pub fn new(session_id: i64, bus: EventBus, bandwidth_limit: u64) -> Self {
        Self {
            session_id,
            bus,
            status: Mutex::new(SessionStatus::Active),
            total_files: AtomicI64::new(0),
            completed_files: AtomicI64::new(0),
            failed_files: AtomicI64::new(0),
            skipped_files: AtomicI64::new(0),
            total_bytes: AtomicI64::new(0),
            completed_bytes: AtomicI64::new(0),
            bandwidth_limit: AtomicU64::new(bandwidth_limit),
            bandwidth: Mutex::new(BandwidthWindow {
                window_start: tokio::time::Instant::now(),
                used: 0,
            }),
            speed: Mutex::new(SpeedWindow::new()),
            last_session_update: Mutex::new(None),
        }
    }

    /// Seeds the mirror counters from a loaded session (resume path).
    pub fn seed(&self, total_files: i64, completed: i64, failed: i64, skipped: i64, total_bytes: i64, completed_bytes: i64) {
        self.total_files.store(total_files, Ordering::SeqCst);
        self.completed_files.store(completed, Ordering::SeqCst);
        self.failed_files.store(failed, Ordering::SeqCst);
        self.skipped_files.store(skipped, Ordering::SeqCst);
        self.total_bytes.store(total_bytes, Ordering::SeqCst);
        self.completed_bytes.store(completed_bytes, Ordering::SeqCst);
    }

    /// Updates the mirrored session status.
    pub fn set_status(&self, status: SessionStatus) {
        #[allow(clippy::unwrap_used)]
        let mut current = self.status.lock().unwrap();
        *current = status;
    }

    /// Records newly discovered files; always emits a session update.
    pub fn add_discovered(&self, files: i64, bytes: i64) {
        self.total_files.fetch_add(files, Ordering::SeqCst);
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.emit_session_update(true);
    }

    /// Reports a transfer starting.
    pub fn file_started(&self, file: &FileRecord) {
        self.bus.publish(&Event::FileStarted(self.file_event(file)));
    }

    /// Reports transfer progress: `delta` newly written bytes,
    /// `bytes_downloaded` the cumulative offset, `total` the declared size
    /// (`None` for exports).
    pub fn file_progress(
        &self,
        file: &FileRecord,
        delta: u64,
        bytes_downloaded: u64,
        total: Option<u64>,
    ) {
        {
            #[allow(clippy::unwrap_used)]
            let mut speed = self.speed.lock().unwrap();
            speed.record(delta);
        }
        self.bus.publish(&Event::FileProgress(FileProgressEvent {
            file_id: file.id,
            session_id: self.session_id,
            path: file.path.clone(),
            bytes_downloaded,
            total_bytes: total,
        }));
        self.emit_session_update(false);
    }

    /// Reports a file published; bumps the completion mirrors.
    pub fn file_completed(&self, file: &FileRecord, final_size: u64, declared_size: u64) {
        self.completed_files.fetch_add(1, Ordering::SeqCst);
        self.completed_bytes
            .fetch_add(i64::try_from(final_size).unwrap_or(0), Ordering::SeqCst);
        // Exports finalize their size post-hoc.
        let growth = i64::try_from(final_size).unwrap_or(0) - i64::try_from(declared_size).unwrap_or(0);
        if growth != 0 {
            self.total_bytes.fetch_add(growth, Ordering::SeqCst);
        }
        self.bus.publish(&Event::FileCompleted(self.file_event(file)));
        self.emit_session_update(true);
    }

    /// Reports a terminal file failure.
    pub fn file_failed(&self, file: &FileRecord, error: &SyncError) {
        self.failed_files.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(&Event::FileFailed(FileFailureEvent {
            file_id: file.id,
            session_id: self.session_id,
            path: file.path.clone(),
            error_kind: error.kind.as_str().to_string(),
            error: error.message.clone(),
        }));
        self.emit_session_update(true);
    }

    /// Reports a skipped file.
    pub fn file_skipped(&self, file: &FileRecord) {
        self.skipped_files.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(&Event::FileSkipped(self.file_event(file)));
        self.emit_session_update(true);
    }

    /// Reports a folder listing starting.
    pub fn folder_started(&self, folder: &Folder) {
        self.bus.publish(&Event::FolderStarted(FolderEvent {
            folder_id: folder.id,
            session_id: self.session_id,
            path: folder.path.clone(),
            file_count: 0,
        }));
    }

    /// Reports a folder fully listed.
    pub fn folder_completed(&self, folder: &Folder, file_count: usize) {
        self.bus.publish(&Event::FolderCompleted(FolderEvent {
            folder_id: folder.id,
            session_id: self.session_id,
            path: folder.path.clone(),
            file_count,
        }));
    }

    /// Current throughput over the sliding window, bytes/second.
    #[must_use]
    pub fn current_speed(&self) -> u64 {
        #[allow(clippy::unwrap_used)]
        let speed = self.speed.lock().unwrap();
        speed.current_speed()
    }

    /// `remaining_bytes / current_speed`; zero when either is zero.
    #[must_use]
    pub fn eta_seconds(&self) -> u64 {
        let remaining = (self.total_bytes.load(Ordering::SeqCst)
            - self.completed_bytes.load(Ordering::SeqCst))
        .max(0) as u64;
        let speed = self.current_speed();
        if remaining == 0 || speed == 0 {
            0
        } else {
            remaining / speed
        }
    }

    /// Point-in-time snapshot of the mirror counters.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        #[allow(clippy::unwrap_used)]
        let status = *self.status.lock().unwrap();
        SessionSnapshot {
            session_id: self.session_id,
            status,
            total_files: self.total_files.load(Ordering::SeqCst),
            completed_files: self.completed_files.load(Ordering::SeqCst),
            failed_files: self.failed_files.load(Ordering::SeqCst),
            skipped_files: self.skipped_files.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            completed_bytes: self.completed_bytes.load(Ordering::SeqCst),
            current_speed_bps: self.current_speed(),
            eta_seconds: self.eta_seconds(),
        }
    }

    /// Sets the bandwidth cap (bytes/second; 0 disables).
    pub fn set_bandwidth_limit(&self, limit: u64) {
        self.bandwidth_limit.store(limit, Ordering::SeqCst);
    }

    /// Admits `bytes` against the bandwidth cap, waiting for the current
    /// one-second window to roll when admitting them would exceed it. The
    /// transfer hot loop calls this with each chunk's size so throttling
    /// stays smooth.
    ///
    /// # Errors
    ///
    /// Returns a context-kind error if the wait is cancelled.
    #[instrument(skip(self, cancel), fields(bytes))]
    pub async fn check_bandwidth_limit(
        &self,
        cancel: &CancellationToken,
        bytes: u64,
    ) -> Result<(), SyncError> {
        let limit = self.bandwidth_limit.load(Ordering::SeqCst);
        if limit == 0 {
            return Ok(());
        }

        loop {
            let wait = {
                #[allow(clippy::unwrap_used)]
                let mut window = self.bandwidth.lock().unwrap();
                let elapsed = window.window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    window.window_start = tokio::time::Instant::now();
                    window.used = 0;
                }
                // Oversized single chunks are admitted into a fresh window
                // rather than waiting forever.
                if window.used + bytes <= limit || (window.used == 0 && bytes > limit) {
                    window.used += bytes;
                    return Ok(());
                }
                Duration::from_secs(1).saturating_sub(window.window_start.elapsed())
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(SyncError::cancelled("bandwidth wait cancelled"));
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn file_event(&self, file: &FileRecord) -> FileEvent {
        FileEvent {
            file_id: file.id,
            session_id: self.session_id,
            name: file.name.clone(),
            path: file.path.clone(),
            size: if file.is_native_document {
                None
            } else {
                Some(file.size_bytes())
            },
        }
    }

    /// Emits a session update; streamed (non-forced) updates are throttled
    /// to roughly one per second.
    fn emit_session_update(&self, force: bool) {
        {
            #[allow(clippy::unwrap_used)]
            let mut last = self.last_session_update.lock().unwrap();
            let due = last.is_none_or(|at| at.elapsed() >= SESSION_UPDATE_INTERVAL);
            if !force && !due {
                return;
            }
            *last = Some(tokio::time::Instant::now());
        }
        self.bus.publish(&Event::SessionUpdate(self.snapshot()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn file_record(id: i64, size: i64) -> FileRecord {
        FileRecord {
            id,
            remote_id: format!("r{id}"),
            folder_id: 1,
            session_id: 1,
            name: format!("f{id}.bin"),
            path: format!("a/f{id}.bin"),
            size,
            md5_checksum: None,
            content_type: None,
            is_native_document: false,
            export_content_type: None,
            status_str: "pending".to_string(),
            bytes_downloaded: 0,
            download_attempts: 0,
            error_message: None,
            remote_modified_at: None,
            local_modified_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(1, EventBus::new(), 0)
    }

    #[tokio::test]
    async fn test_speed_window_averages_recent_samples() {
        tokio::time::pause();
        let tracker = tracker();
        let file = file_record(1, 1000);

        tracker.file_progress(&file, 100, 100, Some(1000));
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.file_progress(&file, 300, 400, Some(1000));

        // 400 bytes over a 2-second span.
        assert_eq!(tracker.current_speed(), 200);
    }

    #[tokio::test]
    async fn test_speed_window_drops_stale_samples() {
        tokio::time::pause();
        let tracker = tracker();
        let file = file_record(1, 1000);

        tracker.file_progress(&file, 10_000, 10_000, Some(1_000_000));
        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.file_progress(&file, 100, 10_100, Some(1_000_000));

        // The 30s-old burst is out of the window.
        assert_eq!(tracker.current_speed(), 100);
    }

    #[tokio::test]
    async fn test_eta_zero_when_idle_or_done() {
        let tracker = tracker();
        assert_eq!(tracker.eta_seconds(), 0, "no work, no speed");

        tracker.add_discovered(1, 1000);
        assert_eq!(tracker.eta_seconds(), 0, "no speed yet");
    }

    #[tokio::test]
    async fn test_eta_derives_from_remaining_and_speed() {
        tokio::time::pause();
        let tracker = tracker();
        let file = file_record(1, 2000);
        tracker.add_discovered(1, 2000);

        tracker.file_progress(&file, 100, 100, Some(2000));
        assert_eq!(tracker.current_speed(), 100);
        assert_eq!(tracker.eta_seconds(), 20);
    }

    #[tokio::test]
    async fn test_counters_track_completion_failure_skip() {
        let tracker = tracker();
        tracker.add_discovered(3, 600);
        tracker.file_completed(&file_record(1, 200), 200, 200);
        tracker.file_failed(&file_record(2, 200), &SyncError::network("x"));
        tracker.file_skipped(&file_record(3, 200));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_files, 3);
        assert_eq!(snapshot.completed_files, 1);
        assert_eq!(snapshot.failed_files, 1);
        assert_eq!(snapshot.skipped_files, 1);
        assert_eq!(snapshot.completed_bytes, 200);
    }

    #[tokio::test]
    async fn test_export_completion_grows_total_bytes() {
        let tracker = tracker();
        tracker.add_discovered(1, 0);
        tracker.file_completed(&file_record(1, 0), 4242, 0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_bytes, 4242);
        assert_eq!(snapshot.completed_bytes, 4242);
    }

    #[tokio::test]
    async fn test_session_update_throttled_to_one_per_second() {
        tokio::time::pause();
        let bus = EventBus::new();
        let mut rx = bus.channel("updates", 64);
        let tracker = ProgressTracker::new(1, bus, 0);
        let file = file_record(1, 10_000);

        // Many progress calls within the same second: one session update.
        for i in 1..=5 {
            tracker.file_progress(&file, 100, i * 100, Some(10_000));
        }
        let mut session_updates = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::SessionUpdate(_)) {
                session_updates += 1;
            }
        }
        assert_eq!(session_updates, 1);
    }

    #[tokio::test]
    async fn test_bandwidth_gate_disabled_when_zero() {
        let tracker = tracker();
        let cancel = CancellationToken::new();
        // Limit 0: no waiting regardless of volume.
        for _ in 0..100 {
            tracker
                .check_bandwidth_limit(&cancel, 10_000_000)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_bandwidth_gate_waits_for_window_roll() {
        tokio::time::pause();
        let tracker = ProgressTracker::new(1, EventBus::new(), 1000);
        let cancel = CancellationToken::new();

        tracker.check_bandwidth_limit(&cancel, 800).await.unwrap();
        let start = tokio::time::Instant::now();
        // 800 + 400 > 1000: must wait for the window to roll.
        tracker.check_bandwidth_limit(&cancel, 400).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_bandwidth_gate_cancellation() {
        tokio::time::pause();
        let tracker = ProgressTracker::new(1, EventBus::new(), 100);
        let cancel = CancellationToken::new();
        tracker.check_bandwidth_limit(&cancel, 100).await.unwrap();

        cancel.cancel();
        let err = tracker
            .check_bandwidth_limit(&cancel, 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::SyncErrorKind::Context);
    }

    #[tokio::test]
    async fn test_oversized_chunk_admitted_into_fresh_window() {
        tokio::time::pause();
        let tracker = ProgressTracker::new(1, EventBus::new(), 100);
        let cancel = CancellationToken::new();
        // A chunk larger than the cap must not wait forever.
        tracker.check_bandwidth_limit(&cancel, 500).await.unwrap();
    }
}
