//! Session lifecycle orchestration.
//!
//! The engine wires walker → download manager → worker pool under one
//! hierarchical cancellation token and runs four cooperative loops:
//!
//! - *sync loop* — drains walker results into the pool in batches of 100
//!   (small batches keep the queue bounded and surface progress early);
//! - *checkpoint saver* — periodic liveness checkpoint and session-update
//!   emission (counters themselves are persisted transactionally at each
//!   transition);
//! - *error monitor* — counts per-item failures against the session error
//!   budget and cancels the run when it is exceeded;
//! - *completion checker* — polls for the conjunction "walk complete ∧
//!   counters closed ∧ pool idle ∧ no active transfers" and triggers
//!   shutdown.
//!
//! Final status on shutdown: user cancel → `cancelled`; any failed files
//! or a blown error budget → `failed`; otherwise `completed`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::CloudClient;
use crate::config::SyncConfig;
use crate::errors::SyncError;
use crate::events::{Event, EventBus, SessionSnapshot};
use crate::pool::{TaskExecutor, WorkerPool};
use crate::progress::ProgressTracker;
use crate::ratelimit::{AdaptiveLimiter, ApiRateLimiter};
use crate::store::{FileRecord, FileStatus, SessionStatus, StateStore, StoreError};
use crate::transfer::DownloadManager;
use crate::walker::{FolderWalker, WalkResult};

/// Files per batch handed to the worker pool.
const SUBMIT_BATCH_SIZE: usize = 100;

/// Completion-checker poll interval.
const COMPLETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Pause-flag poll interval in the sync loop.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for `stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Batched query size when resubmitting pending files on resume.
const RESUME_BATCH_LIMIT: i64 = 1000;

/// State shared by the engine loops for one run.
struct RunState {
    session_id: i64,
    cancel: CancellationToken,
    paused: AtomicBool,
    user_cancelled: AtomicBool,
    budget_exceeded: AtomicBool,
    walking_complete: AtomicBool,
    error_count: AtomicUsize,
    error_tx: mpsc::Sender<SyncError>,
    tracker: Arc<ProgressTracker>,
    pool: WorkerPool,
    manager: Arc<DownloadManager>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Orchestrates one sync session end to end.
pub struct SyncEngine {
    store: StateStore,
    client: Arc<dyn CloudClient>,
    bus: EventBus,
    config: SyncConfig,
    run: std::sync::Mutex<Option<Arc<RunState>>>,
}

impl SyncEngine {
    /// Creates an engine over explicit collaborators.
    #[must_use]
    pub fn new(
        store: StateStore,
        client: Arc<dyn CloudClient>,
        bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            client,
            bus,
            config,
            run: std::sync::Mutex::new(None),
        }
    }

    /// The event bus this engine publishes to.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Starts a new session mirroring `root_id` into `destination`.
    /// Returns the session ID; the run proceeds in the background until
    /// completion, cancellation, or failure.
    ///
    /// # Errors
    ///
    /// Returns the failure from validating config, resolving the root, or
    /// setting up the scratch directory.
    #[instrument(skip(self), fields(root = %root_id, destination = %destination.display()))]
    pub async fn start(&self, root_id: &str, destination: PathBuf) -> Result<i64, SyncError> {
        self.config.validate()?;
        self.ensure_no_active_run()?;

        let cancel = CancellationToken::new();
        let limiter = self.build_limiter();

        // The root resolves specially by sentinel; its display name goes
        // on the session row.
        limiter.limiter().wait_batch(&cancel).await?;
        let root_entry = self.client.metadata(root_id).await?;

        let session = self
            .store
            .sessions()
            .create(
                &root_entry.id,
                &root_entry.name,
                &destination.to_string_lossy(),
            )
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        info!(session_id = session.id, root = %root_entry.name, "session started");
        if let Err(e) = self
            .store
            .settings()
            .set("last_session_id", &session.id.to_string())
            .await
        {
            warn!(error = %e, "failed to record last session id");
        }

        let run = self
            .build_run(session.id, destination, cancel, Arc::clone(&limiter))
            .await?;

        // Discovery feeds the pool through the sync loop.
        let walker = FolderWalker::new(
            Arc::clone(&self.client),
            self.store.clone(),
            Arc::clone(&run.tracker),
            limiter,
            self.config.walker_config(),
        );
        let walk_rx = match walker
            .walk(session.id, &root_entry.id, run.cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                // The session can never make progress; close it out.
                let _ = self.store.sessions().fail(session.id).await;
                run.cancel.cancel();
                return Err(e);
            }
        };
        self.spawn_sync_loop(Arc::clone(&run), walk_rx);

        Ok(session.id)
    }

    /// Resumes a previously interrupted session: failed items under the
    /// attempt cap go back to pending, the already-scanned tree is NOT
    /// re-walked, and resumable files are re-submitted in batches.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error for completed/failed/cancelled
    /// sessions.
    #[instrument(skip(self))]
    pub async fn resume(&self, session_id: i64) -> Result<(), SyncError> {
        self.config.validate()?;
        self.ensure_no_active_run()?;

        let cancel = CancellationToken::new();
        let limiter = self.build_limiter();

        match self
            .store
            .sessions()
            .resume_session(session_id, i64::from(self.config.max_retries))
            .await
        {
            Ok((files_reset, folders_reset)) => {
                info!(session_id, files_reset, folders_reset, "session resumed");
            }
            Err(StoreError::InvalidTransition { .. }) => {
                return Err(SyncError::config(format!(
                    "session {session_id} is already terminal and cannot be resumed"
                )));
            }
            Err(e) => return Err(SyncError::storage(e.to_string())),
        }

        let session = self
            .store
            .sessions()
            .get(session_id)
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;

        let run = self
            .build_run(
                session_id,
                PathBuf::from(&session.destination_path),
                cancel,
                limiter,
            )
            .await?;
        run.tracker.seed(
            session.total_files,
            session.completed_files,
            session.failed_files,
            session.skipped_files,
            session.total_bytes,
            session.completed_bytes,
        );

        // Interrupted transfers resume from their temps (the sweep in
        // build_run preserved them); now their rows rest as pending.
        if let Err(e) = self.store.files().normalize_in_flight(session_id).await {
            warn!(error = %e, "failed to normalize in-flight rows");
        }

        // The tree is already scanned; feed pending work straight in.
        run.walking_complete.store(true, Ordering::SeqCst);
        self.spawn_resume_feeder(Arc::clone(&run));

        Ok(())
    }

    /// Pauses the active run: discovery stalls at the next result, queued
    /// work keeps dispatching nothing new once the sync loop blocks, and
    /// in-flight downloads run to their natural end.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error when no run is active.
    #[instrument(skip(self))]
    pub async fn pause(&self) -> Result<(), SyncError> {
        let run = self.active_run()?;
        run.paused.store(true, Ordering::SeqCst);
        self.store
            .sessions()
            .pause(run.session_id)
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        run.tracker.set_status(SessionStatus::Paused);
        self.bus
            .publish(&Event::SessionUpdate(run.tracker.snapshot()));
        info!(session_id = run.session_id, "session paused");
        Ok(())
    }

    /// Clears the pause flag and restores the session to active.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error when no run is active.
    #[instrument(skip(self))]
    pub async fn resume_paused(&self) -> Result<(), SyncError> {
        let run = self.active_run()?;
        self.store
            .sessions()
            .activate(run.session_id)
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        run.paused.store(false, Ordering::SeqCst);
        run.tracker.set_status(SessionStatus::Active);
        self.bus
            .publish(&Event::SessionUpdate(run.tracker.snapshot()));
        info!(session_id = run.session_id, "session unpaused");
        Ok(())
    }

    /// Stops the active run: cancels the root token and waits up to 60 s
    /// for the loops to wind down, logging a warning on timeout.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error when no run is active.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SyncError> {
        let run = self.active_run()?;
        run.user_cancelled.store(true, Ordering::SeqCst);
        run.cancel.cancel();

        let mut done = run.done_rx.clone();
        let wait = async {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(STOP_TIMEOUT, wait).await.is_err() {
            warn!(session_id = run.session_id, "stop timed out waiting for shutdown");
        }
        Ok(())
    }

    /// Current progress snapshot of the active run.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error when no run is active.
    pub fn progress(&self) -> Result<SessionSnapshot, SyncError> {
        Ok(self.active_run()?.tracker.snapshot())
    }

    /// Waits until the active run reaches a terminal state and returns
    /// the final session status.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error when no run is active, or a
    /// storage-kind error reading the final session row.
    pub async fn wait_for_completion(&self) -> Result<SessionStatus, SyncError> {
        let run = self.active_run()?;
        let mut done = run.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        let session = self
            .store
            .sessions()
            .get(run.session_id)
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        Ok(session.status())
    }

    /// Builds the per-run rate-limit stack from the configured general
    /// rate, with batch and export buckets in the standard proportions.
    fn build_limiter(&self) -> Arc<AdaptiveLimiter> {
        let rate = self.config.rate_limit.max(1);
        Arc::new(AdaptiveLimiter::new(Arc::new(ApiRateLimiter::with_rates(
            (rate, rate * 2),
            ((rate / 2).max(1), rate),
            ((rate * 3 / 10).max(1), (rate * 3 / 10).max(1)),
        ))))
    }

    fn active_run(&self) -> Result<Arc<RunState>, SyncError> {
        #[allow(clippy::unwrap_used)]
        let run = self.run.lock().unwrap();
        run.as_ref()
            .cloned()
            .ok_or_else(|| SyncError::config("no active sync session"))
    }

    fn ensure_no_active_run(&self) -> Result<(), SyncError> {
        #[allow(clippy::unwrap_used)]
        let run = self.run.lock().unwrap();
        if let Some(existing) = run.as_ref() {
            if !*existing.done_rx.borrow() {
                return Err(SyncError::config(format!(
                    "session {} is still running",
                    existing.session_id
                )));
            }
        }
        Ok(())
    }

    /// Assembles the per-run stack (tracker, manager, pool) and spawns the
    /// cross-cutting loops. The scratch sweep runs here, before any row is
    /// normalized, so temps of still-`downloading` files survive.
    async fn build_run(
        &self,
        session_id: i64,
        destination: PathBuf,
        cancel: CancellationToken,
        limiter: Arc<AdaptiveLimiter>,
    ) -> Result<Arc<RunState>, SyncError> {
        let tracker = Arc::new(ProgressTracker::new(
            session_id,
            self.bus.clone(),
            self.config.bandwidth_limit,
        ));

        let manager = Arc::new(DownloadManager::new(
            Arc::clone(&self.client),
            self.store.clone(),
            Arc::clone(&tracker),
            limiter,
            destination,
            self.config.transfer_config(),
        )?);
        manager.sweep_scratch().await?;

        let (error_tx, error_rx) = mpsc::channel(256);
        let pool = WorkerPool::new(
            self.config.pool_config(),
            self.store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&manager) as Arc<dyn TaskExecutor>,
            error_tx.clone(),
        );
        let pool_join = pool.start(cancel.clone());

        let (done_tx, done_rx) = watch::channel(false);
        let run = Arc::new(RunState {
            session_id,
            cancel,
            paused: AtomicBool::new(false),
            user_cancelled: AtomicBool::new(false),
            budget_exceeded: AtomicBool::new(false),
            walking_complete: AtomicBool::new(false),
            error_count: AtomicUsize::new(0),
            error_tx,
            tracker,
            pool,
            manager,
            done_tx,
            done_rx,
        });

        self.spawn_checkpoint_loop(Arc::clone(&run));
        self.spawn_error_monitor(Arc::clone(&run), error_rx);
        self.spawn_completion_checker(Arc::clone(&run));
        self.spawn_finalizer(Arc::clone(&run), pool_join);

        #[allow(clippy::unwrap_used)]
        let mut slot = self.run.lock().unwrap();
        *slot = Some(Arc::clone(&run));
        Ok(run)
    }

    /// Drains walker results into the pool in small batches. The pause
    /// flag is polled once a second here; pausing stalls discovery and new
    /// submissions without cancelling in-flight downloads.
    fn spawn_sync_loop(&self, run: Arc<RunState>, mut walk_rx: mpsc::Receiver<WalkResult>) {
        tokio::spawn(async move {
            let mut batch: Vec<FileRecord> = Vec::with_capacity(SUBMIT_BATCH_SIZE);
            loop {
                while run.paused.load(Ordering::SeqCst) && !run.cancel.is_cancelled() {
                    tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                }
                let result = tokio::select! {
                    () = run.cancel.cancelled() => None,
                    result = walk_rx.recv() => result,
                };
                let Some(result) = result else { break };

                if let Some(error) = result.error {
                    warn!(folder = %result.folder.path, error = %error, "folder walk failed");
                    let _ = run.error_tx.try_send(error);
                }
                batch.extend(
                    result
                        .files
                        .into_iter()
                        .filter(|f| f.status() == FileStatus::Pending),
                );
                if batch.len() >= SUBMIT_BATCH_SIZE {
                    run.pool.submit_batch(std::mem::take(&mut batch));
                }
            }
            if !batch.is_empty() {
                run.pool.submit_batch(batch);
            }
            run.walking_complete.store(true, Ordering::SeqCst);
            debug!("sync loop finished");
        });
    }

    /// On resume there is no walk: pending files are re-submitted in
    /// batches of up to 1000, querying again once the pool drains.
    fn spawn_resume_feeder(&self, run: Arc<RunState>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                if run.cancel.is_cancelled() {
                    break;
                }
                let batch = match store
                    .files()
                    .pending_batch(run.session_id, RESUME_BATCH_LIMIT)
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "resume feeder query failed");
                        break;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                let more_expected = batch.len() as i64 == RESUME_BATCH_LIMIT;
                run.pool.submit_batch(batch);
                if !more_expected {
                    break;
                }
                // Let the current batch drain before querying the next, so
                // still-queued rows are not re-submitted.
                while !run.pool.is_idle() && !run.cancel.is_cancelled() {
                    tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                }
            }
            debug!("resume feeder finished");
        });
    }

    /// Periodic liveness checkpoint. Counters are already durable (every
    /// transition commits them transactionally); the checkpoint records
    /// engine liveness and republishes a snapshot.
    fn spawn_checkpoint_loop(&self, run: Arc<RunState>) {
        let store = self.store.clone();
        let bus = self.bus.clone();
        let interval = Duration::from_secs(self.config.checkpoint_interval_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // immediate first tick is not a checkpoint
            loop {
                tokio::select! {
                    () = run.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = store.sessions().touch(run.session_id).await {
                            warn!(error = %e, "checkpoint failed");
                        }
                        bus.publish(&Event::SessionUpdate(run.tracker.snapshot()));
                        debug!(session_id = run.session_id, "checkpoint saved");
                    }
                }
            }
        });
    }

    /// Counts non-fatal errors; exceeding the budget cancels the run with
    /// a failed status.
    fn spawn_error_monitor(&self, run: Arc<RunState>, mut error_rx: mpsc::Receiver<SyncError>) {
        let max_errors = self.config.max_errors;
        tokio::spawn(async move {
            loop {
                let error = tokio::select! {
                    () = run.cancel.cancelled() => None,
                    error = error_rx.recv() => error,
                };
                let Some(error) = error else { break };
                debug!(error = %error, "item error recorded");
                let count = run.note_error();
                if count > max_errors {
                    warn!(count, max_errors, "error budget exceeded, failing session");
                    run.budget_exceeded.store(true, Ordering::SeqCst);
                    run.cancel.cancel();
                    break;
                }
            }
        });
    }

    /// Polls for full completion and triggers shutdown. Polling is the
    /// right shape here: the condition is a conjunction across the walker,
    /// the store, the pool, and the transfer manager.
    fn spawn_completion_checker(&self, run: Arc<RunState>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(COMPLETION_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    () = run.cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if run.cancel.is_cancelled() {
                    break;
                }
                if run.paused.load(Ordering::SeqCst)
                    || !run.walking_complete.load(Ordering::SeqCst)
                {
                    continue;
                }
                let session = match store.sessions().get(run.session_id).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(error = %e, "completion check failed");
                        continue;
                    }
                };
                let settled =
                    session.completed_files + session.failed_files + session.skipped_files;
                if session.total_files >= 1
                    && settled >= session.total_files
                    && run.pool.is_idle()
                    && run.manager.active_count() == 0
                {
                    info!(
                        session_id = run.session_id,
                        completed = session.completed_files,
                        failed = session.failed_files,
                        skipped = session.skipped_files,
                        "all work settled, shutting down"
                    );
                    run.cancel.cancel();
                    break;
                }
            }
        });
    }

    /// Runs once the root token fires: waits for the pool, normalizes
    /// in-flight rows, computes the final status, and persists the end
    /// time transactionally.
    fn spawn_finalizer(&self, run: Arc<RunState>, pool_join: tokio::task::JoinHandle<()>) {
        let store = self.store.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            run.cancel.cancelled().await;

            if tokio::time::timeout(STOP_TIMEOUT, pool_join).await.is_err() {
                warn!(session_id = run.session_id, "worker pool did not stop in time");
            }

            // No file may rest in `downloading`; keep offsets for resume.
            match store.files().normalize_in_flight(run.session_id).await {
                Ok(normalized) if normalized > 0 => {
                    debug!(normalized, "normalized in-flight files");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to normalize in-flight files"),
            }

            let final_status = match store.sessions().get(run.session_id).await {
                Ok(session) => {
                    if session.status().is_terminal() {
                        session.status()
                    } else if run.user_cancelled.load(Ordering::SeqCst) {
                        let _ = store.sessions().cancel(run.session_id).await;
                        SessionStatus::Cancelled
                    } else if run.budget_exceeded.load(Ordering::SeqCst)
                        || session.failed_files > 0
                    {
                        let _ = store.sessions().fail(run.session_id).await;
                        SessionStatus::Failed
                    } else {
                        let _ = store.sessions().complete(run.session_id).await;
                        SessionStatus::Completed
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to load session for finalization");
                    SessionStatus::Failed
                }
            };

            run.tracker.set_status(final_status);
            bus.publish(&Event::SessionUpdate(run.tracker.snapshot()));
            info!(session_id = run.session_id, status = %final_status, "session finished");
            let _ = run.done_tx.send(true);
        });
    }
}

impl RunState {
    /// Bumps the shared error counter, returning the new total.
    fn note_error(&self) -> usize {
        self.error_count.fetch_add(1, Ordering::SeqCst) + 1
    }
}
