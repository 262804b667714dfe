//! Priority-queued download worker pool.
//!
//! A min-heap of [`DownloadTask`]s feeds a fixed set of workers through a
//! bounded channel. A 100 ms dispatcher tick drains the heap into the
//! channel; when the channel is full the task goes back on the heap for
//! the next tick. Failures are retried with taxonomy-driven backoff until
//! the retry budget runs out, then the file is failed terminally.
//!
//! Cancellation: in-flight tasks observe the token at their next
//! suspension point and exit; queued tasks are discarded. Their files stay
//! `pending`/`downloading` in the store and are picked up on resume.

mod task;

pub use task::{DownloadTask, RETRY_PRIORITY_PENALTY, priority_for_size};

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{SyncError, SyncErrorKind, delay_for_attempt};
use crate::progress::ProgressTracker;
use crate::store::{FileRecord, ItemType, NewErrorRecord, StateStore};

/// Default number of download workers.
pub const DEFAULT_WORKERS: usize = 3;

/// Default retry budget per file.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Dispatcher tick interval.
const DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Default shutdown grace period.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes one file transfer; implemented by the download manager.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Transfers one file to completion (download, verify, publish).
    async fn execute(
        &self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>;
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers.
    pub workers: usize,
    /// Retry budget per file (attempts beyond the first).
    pub max_retries: u32,
    /// Grace period for shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

struct PoolInner {
    config: WorkerPoolConfig,
    store: StateStore,
    tracker: Arc<ProgressTracker>,
    executor: Arc<dyn TaskExecutor>,
    heap: Mutex<BinaryHeap<Reverse<DownloadTask>>>,
    seq: AtomicU64,
    /// Tasks handed to the channel but not yet picked up by a worker.
    in_channel: AtomicUsize,
    /// Tasks currently executing.
    active: AtomicUsize,
    /// Tasks sleeping out a retry backoff before re-enqueue.
    pending_retries: AtomicUsize,
    /// Terminal failures, reported to the engine's error monitor.
    error_tx: mpsc::Sender<SyncError>,
}

/// Fixed-size pool of download workers over a priority queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    work_tx: mpsc::Sender<DownloadTask>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DownloadTask>>>,
}

impl WorkerPool {
    /// Creates a pool. `error_tx` receives each terminal file failure.
    #[must_use]
    pub fn new(
        config: WorkerPoolConfig,
        store: StateStore,
        tracker: Arc<ProgressTracker>,
        executor: Arc<dyn TaskExecutor>,
        error_tx: mpsc::Sender<SyncError>,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(config.workers.max(1));
        Self {
            inner: Arc::new(PoolInner {
                config,
                store,
                tracker,
                executor,
                heap: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                in_channel: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                pending_retries: AtomicUsize::new(0),
                error_tx,
            }),
            work_tx,
            work_rx: Arc::new(tokio::sync::Mutex::new(work_rx)),
        }
    }

    /// Enqueues one task.
    pub fn submit(&self, mut task: DownloadTask) {
        task.seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        #[allow(clippy::unwrap_used)]
        let mut heap = self.inner.heap.lock().unwrap();
        heap.push(Reverse(task));
    }

    /// Enqueues a batch of files with size-bucketed priorities.
    pub fn submit_batch(&self, files: Vec<FileRecord>) {
        for (index, file) in files.into_iter().enumerate() {
            let priority = priority_for_size(file.size_bytes(), index);
            self.submit(DownloadTask::new(file, priority));
        }
    }

    /// Tasks waiting in the heap or the dispatch channel.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let heap_len = self.inner.heap.lock().unwrap().len();
        heap_len
            + self.inner.in_channel.load(Ordering::SeqCst)
            + self.inner.pending_retries.load(Ordering::SeqCst)
    }

    /// Tasks currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether the pool has no queued or executing work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queued_count() == 0 && self.active_count() == 0
    }

    /// Starts the dispatcher and workers under the given token. Returns a
    /// handle resolving once every worker has exited.
    #[instrument(skip(self, cancel))]
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let workers = self.inner.config.workers.max(1);
        info!(workers, "starting worker pool");

        // Dispatcher: drain the heap into the bounded channel each tick.
        let dispatcher = {
            let pool = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(DISPATCH_INTERVAL);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = tick.tick() => pool.dispatch_ready(),
                    }
                }
                debug!("dispatcher stopped");
            })
        };

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let pool = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker, cancel).await;
            }));
        }

        tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "download worker panicked");
                }
            }
            dispatcher.abort();
            debug!("worker pool stopped");
        })
    }

    /// Cancels the given token and waits for workers to wind down, up to
    /// the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns a context-kind error when workers are still busy at the
    /// deadline.
    #[instrument(skip(self, cancel, join))]
    pub async fn shutdown(
        &self,
        cancel: &CancellationToken,
        join: tokio::task::JoinHandle<()>,
    ) -> Result<(), SyncError> {
        cancel.cancel();
        match tokio::time::timeout(self.inner.config.shutdown_timeout, join).await {
            Ok(_) => Ok(()),
            Err(_) => Err(SyncError::cancelled(format!(
                "worker pool did not stop within {:?}",
                self.inner.config.shutdown_timeout
            ))),
        }
    }

    /// Moves ready tasks from the heap into the worker channel. A full
    /// channel puts the task back for the next tick.
    fn dispatch_ready(&self) {
        loop {
            let task = {
                #[allow(clippy::unwrap_used)]
                let mut heap = self.inner.heap.lock().unwrap();
                match heap.pop() {
                    Some(Reverse(task)) => task,
                    None => return,
                }
            };

            match self.work_tx.try_send(task) {
                Ok(()) => {
                    self.inner.in_channel.fetch_add(1, Ordering::SeqCst);
                }
                Err(mpsc::error::TrySendError::Full(task)) => {
                    #[allow(clippy::unwrap_used)]
                    let mut heap = self.inner.heap.lock().unwrap();
                    heap.push(Reverse(task));
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "download worker started");
        loop {
            let task = {
                let mut rx = self.work_rx.lock().await;
                tokio::select! {
                    () = cancel.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else { break };
            self.inner.in_channel.fetch_sub(1, Ordering::SeqCst);
            self.inner.active.fetch_add(1, Ordering::SeqCst);
            self.run_task(task, &cancel).await;
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(worker, "download worker stopped");
    }

    #[instrument(skip(self, task, cancel), fields(file_id = task.file.id, path = %task.file.path, attempt = task.attempt))]
    async fn run_task(&self, task: DownloadTask, cancel: &CancellationToken) {
        if let Err(e) = self.inner.store.files().mark_downloading(task.file.id).await {
            warn!(error = %e, "failed to mark file downloading");
        }

        match self.inner.executor.execute(&task.file, cancel).await {
            Ok(()) => {
                debug!("task completed");
            }
            Err(error) if error.kind == SyncErrorKind::Context => {
                // Cancellation: leave the row as-is; the orchestrator's
                // final checkpoint normalizes it for resume.
                debug!("task cancelled in flight");
            }
            Err(error) => self.handle_failure(task, error).await,
        }
    }

    async fn handle_failure(&self, task: DownloadTask, error: SyncError) {
        let attempts_made = task.attempt + 1;
        let record = NewErrorRecord::from_sync_error(
            task.file.session_id,
            task.file.id,
            ItemType::File,
            &error,
            i64::from(task.attempt),
        );
        if let Err(e) = self.inner.store.errors().append(&record).await {
            warn!(error = %e, "failed to append error record");
        }

        if error.is_retryable() && attempts_made < self.inner.config.max_retries {
            let delay = delay_for_attempt(error.kind, attempts_made);
            info!(
                file_id = task.file.id,
                attempt = attempts_made,
                max = self.inner.config.max_retries,
                delay_ms = delay.as_millis(),
                error = %error,
                "retrying download"
            );
            let retry = task.retry(&error.message);
            self.inner.pending_retries.fetch_add(1, Ordering::SeqCst);
            let pool = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                pool.submit(retry);
                pool.inner.pending_retries.fetch_sub(1, Ordering::SeqCst);
            });
            return;
        }

        warn!(
            file_id = task.file.id,
            attempts = attempts_made,
            error = %error,
            "download failed terminally"
        );
        if let Err(e) = self
            .inner
            .store
            .files()
            .fail_file(task.file.id, task.file.session_id, &error.message)
            .await
        {
            warn!(error = %e, "failed to mark file failed");
        }
        self.inner.tracker.file_failed(&task.file, &error);
        let _ = self.inner.error_tx.try_send(error);
    }
}
