//! Streaming discovery of the remote folder tree.
//!
//! The walker turns a root folder ID into a lazy, finite sequence of
//! [`WalkResult`] records on a bounded channel, inserting folder and file
//! rows as it goes. Memory stays bounded: listing pages are materialized a
//! folder at a time and results back-pressure the consumer.
//!
//! Two strategies:
//!
//! - **BFS** (default) — a queue of folder tasks feeds a small pool of
//!   worker tasks. The queue closes when the outstanding-task counter
//!   (incremented before enqueue, decremented when a task finishes) hits
//!   zero; closing earlier would lose subtrees.
//! - **DFS** — strictly-ordered recursive descent on a single task.
//!
//! A failed folder never aborts its siblings: the failure is recorded on
//! the folder row, logged to the error log, and emitted as a result with
//! a non-`None` error.

mod filter;

pub use filter::PathFilter;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::api::{CloudClient, Entry, ROOT_SENTINEL, export_target};
use crate::errors::SyncError;
use crate::progress::ProgressTracker;
use crate::ratelimit::AdaptiveLimiter;
use crate::store::{
    FileRecord, Folder, FolderStatus, ItemType, NewErrorRecord, NewFile, NewFolder, StateStore,
};

/// Default number of BFS listing workers.
pub const DEFAULT_WALK_WORKERS: usize = 3;

/// Capacity of the BFS folder-task queue.
const TASK_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of the result channel.
const DEFAULT_RESULT_BUFFER: usize = 32;

/// Traversal strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkStrategy {
    /// Parallel breadth-first traversal (default).
    #[default]
    Bfs,
    /// Single-task depth-first traversal with strictly ordered output.
    Dfs,
}

/// Walker configuration.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Traversal strategy.
    pub strategy: WalkStrategy,
    /// BFS listing workers.
    pub workers: usize,
    /// Maximum depth below the root; 0 means unlimited.
    pub max_depth: u32,
    /// Whether shortcuts are followed as subfolders.
    pub follow_shortcuts: bool,
    /// Include regex patterns (at least one must match when present).
    pub include: Vec<String>,
    /// Exclude regex patterns (any match prunes the subtree).
    pub exclude: Vec<String>,
    /// Result channel capacity.
    pub result_buffer: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            strategy: WalkStrategy::Bfs,
            workers: DEFAULT_WALK_WORKERS,
            max_depth: 0,
            follow_shortcuts: false,
            include: Vec::new(),
            exclude: Vec::new(),
            result_buffer: DEFAULT_RESULT_BUFFER,
        }
    }
}

/// One processed folder: its record, the files discovered directly in it,
/// the depth below the root, and the listing error if it failed.
#[derive(Debug)]
pub struct WalkResult {
    /// The folder row (status scanned, or failed).
    pub folder: Folder,
    /// File rows materialized for this folder, in listing order.
    pub files: Vec<FileRecord>,
    /// Depth below the root (root is 0).
    pub depth: u32,
    /// Listing failure, when the folder could not be fully listed.
    pub error: Option<SyncError>,
}

/// A folder queued for listing.
#[derive(Debug, Clone)]
struct FolderTask {
    remote_id: String,
    parent_id: Option<i64>,
    name: String,
    path: String,
    depth: u32,
}

/// Message on the BFS task queue.
enum TaskMsg {
    Folder(FolderTask),
    Shutdown,
}

/// Shared state for one walk.
struct WalkContext {
    client: Arc<dyn CloudClient>,
    store: StateStore,
    tracker: Arc<ProgressTracker>,
    limiter: Arc<AdaptiveLimiter>,
    filter: PathFilter,
    config: WalkerConfig,
    session_id: i64,
    cancel: CancellationToken,
    outstanding: AtomicUsize,
    result_tx: mpsc::Sender<WalkResult>,
    task_tx: mpsc::Sender<TaskMsg>,
}

/// Streaming folder-tree walker.
pub struct FolderWalker {
    client: Arc<dyn CloudClient>,
    store: StateStore,
    tracker: Arc<ProgressTracker>,
    limiter: Arc<AdaptiveLimiter>,
    config: WalkerConfig,
}

impl FolderWalker {
    /// Creates a walker with explicit collaborators.
    #[must_use]
    pub fn new(
        client: Arc<dyn CloudClient>,
        store: StateStore,
        tracker: Arc<ProgressTracker>,
        limiter: Arc<AdaptiveLimiter>,
        config: WalkerConfig,
    ) -> Self {
        Self {
            client,
            store,
            tracker,
            limiter,
            config,
        }
    }

    /// Starts the walk and returns the result channel. The channel closes
    /// once every reachable folder has been processed or the token is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error for invalid filter patterns, or the
    /// failure from resolving the root folder's metadata.
    #[instrument(skip(self, cancel), fields(session_id, root = %root_remote_id))]
    pub async fn walk(
        &self,
        session_id: i64,
        root_remote_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WalkResult>, SyncError> {
        let filter = PathFilter::new(&self.config.include, &self.config.exclude)?;

        // The root resolves specially through the sentinel.
        let root_entry = self.resolve_root(root_remote_id, &cancel).await?;
        let root_task = FolderTask {
            remote_id: root_entry.id.clone(),
            parent_id: None,
            name: root_entry.name.clone(),
            path: String::new(),
            depth: 0,
        };

        let (result_tx, result_rx) = mpsc::channel(self.config.result_buffer.max(1));
        let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_CAPACITY);

        let ctx = Arc::new(WalkContext {
            client: Arc::clone(&self.client),
            store: self.store.clone(),
            tracker: Arc::clone(&self.tracker),
            limiter: Arc::clone(&self.limiter),
            filter,
            config: self.config.clone(),
            session_id,
            cancel,
            outstanding: AtomicUsize::new(0),
            result_tx,
            task_tx,
        });

        match self.config.strategy {
            WalkStrategy::Bfs => spawn_bfs(ctx, root_task, task_rx).await,
            WalkStrategy::Dfs => spawn_dfs(ctx, root_task),
        }

        Ok(result_rx)
    }

    async fn resolve_root(
        &self,
        root_remote_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Entry, SyncError> {
        self.limiter.limiter().wait_batch(cancel).await?;
        let result = self.client.metadata(root_remote_id).await;
        self.record_outcome(&result);
        let mut entry = result?;
        if root_remote_id == ROOT_SENTINEL && entry.name.is_empty() {
            entry.name = "My Drive".to_string();
        }
        Ok(entry)
    }

    fn record_outcome<T>(&self, result: &Result<T, SyncError>) {
        match result {
            Ok(_) => self.limiter.record_success(),
            Err(e) if e.kind == crate::errors::SyncErrorKind::Quota => {
                self.limiter.record_quota_error();
            }
            Err(_) => {}
        }
    }
}

/// Spawns the BFS worker pool and seeds it with the root task.
async fn spawn_bfs(
    ctx: Arc<WalkContext>,
    root_task: FolderTask,
    task_rx: mpsc::Receiver<TaskMsg>,
) {
    ctx.outstanding.fetch_add(1, Ordering::SeqCst);
    // Seeding cannot fail: the queue is empty and capacity > 0.
    let _ = ctx.task_tx.send(TaskMsg::Folder(root_task)).await;

    let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
    let workers = ctx.config.workers.max(1);
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let ctx = Arc::clone(&ctx);
        let task_rx = Arc::clone(&task_rx);
        handles.push(tokio::spawn(async move {
            debug!(worker, "walk worker started");
            loop {
                let msg = {
                    let mut rx = task_rx.lock().await;
                    tokio::select! {
                        () = ctx.cancel.cancelled() => None,
                        msg = rx.recv() => msg,
                    }
                };
                match msg {
                    Some(TaskMsg::Folder(task)) => {
                        process_folder(&ctx, task).await;
                        finish_task(&ctx);
                    }
                    Some(TaskMsg::Shutdown) | None => break,
                }
            }
            debug!(worker, "walk worker stopped");
        }));
    }

    // Supervisor: once the workers exit, every result sender clone is gone
    // and the consumer sees end-of-stream.
    tokio::spawn(async move {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "walk worker panicked");
            }
        }
        debug!("walk complete");
    });
}

/// Decrements the outstanding counter; at zero, tells every worker to
/// shut down.
fn finish_task(ctx: &Arc<WalkContext>) {
    if ctx.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
        let task_tx = ctx.task_tx.clone();
        let workers = ctx.config.workers.max(1);
        tokio::spawn(async move {
            for _ in 0..workers {
                if task_tx.send(TaskMsg::Shutdown).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Spawns the single-task DFS traversal.
fn spawn_dfs(ctx: Arc<WalkContext>, root_task: FolderTask) {
    tokio::spawn(async move {
        walk_dfs(&ctx, root_task).await;
        debug!("walk complete");
    });
}

async fn walk_dfs(ctx: &Arc<WalkContext>, task: FolderTask) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    let children = process_folder(ctx, task).await;
    for child in children {
        Box::pin(walk_dfs(ctx, child)).await;
    }
}

/// Lists one folder to completion: filter, record, paginate, batch-insert
/// files, emit a result. Returns discovered subfolder tasks (BFS enqueues
/// them itself; DFS descends into the returned list).
async fn process_folder(ctx: &Arc<WalkContext>, task: FolderTask) -> Vec<FolderTask> {
    // Filters operate on the full relative path; the root ("") is exempt.
    if task.depth > 0 && !ctx.filter.matches(&task.path) {
        debug!(path = %task.path, "folder pruned by filter");
        return Vec::new();
    }

    let folder = match ctx
        .store
        .folders()
        .insert(
            &NewFolder {
                remote_id: task.remote_id.clone(),
                parent_id: task.parent_id,
                session_id: ctx.session_id,
                name: task.name.clone(),
                path: task.path.clone(),
            },
            FolderStatus::Scanning,
        )
        .await
    {
        Ok(folder) => folder,
        Err(e) => {
            warn!(path = %task.path, error = %e, "failed to record folder");
            return Vec::new();
        }
    };

    // A resumed walk can land on a folder that is already fully listed.
    if folder.status() == FolderStatus::Scanned {
        debug!(path = %task.path, "folder already scanned");
        return Vec::new();
    }

    ctx.tracker.folder_started(&folder);

    let mut subfolders = Vec::new();
    let mut pending_files = Vec::new();
    let mut listing_error: Option<SyncError> = None;
    let mut page_token: Option<String> = None;

    loop {
        let page = match list_page_with_retry(ctx, &task.remote_id, page_token.as_deref()).await
        {
            Ok(page) => page,
            Err(e) => {
                listing_error = Some(e);
                break;
            }
        };

        for entry in page.entries {
            if entry.is_folder() || entry.is_shortcut() {
                if entry.is_shortcut() && !ctx.config.follow_shortcuts {
                    debug!(name = %entry.name, "skipping shortcut");
                    continue;
                }
                let child_depth = task.depth + 1;
                if ctx.config.max_depth > 0 && child_depth > ctx.config.max_depth {
                    debug!(name = %entry.name, depth = child_depth, "depth limit reached");
                    continue;
                }
                subfolders.push(FolderTask {
                    remote_id: entry.id,
                    parent_id: Some(folder.id),
                    name: entry.name.clone(),
                    path: join_path(&task.path, &entry.name),
                    depth: child_depth,
                });
            } else {
                pending_files.push(file_from_entry(ctx.session_id, folder.id, &task.path, entry));
            }
        }

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    // Materialize the folder's files in one transaction, even when the
    // listing failed part-way: whatever was seen is real work.
    let files = match ctx.store.files().insert_batch(&pending_files).await {
        Ok(batch) => {
            if batch.new_files > 0 {
                ctx.tracker.add_discovered(batch.new_files, batch.new_bytes);
            }
            batch.records
        }
        Err(e) => {
            warn!(path = %task.path, error = %e, "failed to record files");
            if listing_error.is_none() {
                listing_error =
                    Some(SyncError::storage(format!("failed to record files: {e}")));
            }
            Vec::new()
        }
    };

    let folder = match &listing_error {
        None => {
            let _ = ctx.store.folders().mark_scanned(folder.id).await;
            ctx.tracker.folder_completed(&folder, files.len());
            folder
        }
        Some(error) => {
            let _ = ctx.store.folders().mark_failed(folder.id, &error.message).await;
            let record = NewErrorRecord::from_sync_error(
                ctx.session_id,
                folder.id,
                ItemType::Folder,
                error,
                0,
            );
            if let Err(e) = ctx.store.errors().append(&record).await {
                warn!(error = %e, "failed to append folder error record");
            }
            folder
        }
    };

    let depth = task.depth;
    let result = WalkResult {
        folder,
        files,
        depth,
        error: listing_error,
    };
    if ctx.result_tx.send(result).await.is_err() {
        debug!("walk consumer dropped, discarding result");
        return Vec::new();
    }

    // BFS: enqueue children through the task queue. Increment the counter
    // for every child before any send so it cannot hit zero early; the
    // sends happen off-worker so a full queue never wedges the pool.
    if ctx.config.strategy == WalkStrategy::Bfs && !subfolders.is_empty() {
        ctx.outstanding
            .fetch_add(subfolders.len(), Ordering::SeqCst);
        let ctx_clone = Arc::clone(ctx);
        let children = subfolders.clone();
        tokio::spawn(async move {
            for child in children {
                if ctx_clone.cancel.is_cancelled()
                    || ctx_clone.task_tx.send(TaskMsg::Folder(child)).await.is_err()
                {
                    finish_task(&ctx_clone);
                }
            }
        });
    }

    subfolders
}

/// Lists one page, retrying transient failures so a brief quota storm
/// does not lose listing data. Quota errors feed the adaptive limiter,
/// which slows subsequent requests; only a non-retryable failure or an
/// exhausted budget fails the folder.
async fn list_page_with_retry(
    ctx: &Arc<WalkContext>,
    remote_id: &str,
    page_token: Option<&str>,
) -> Result<crate::api::FileList, SyncError> {
    const LIST_RETRIES: u32 = 3;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        ctx.limiter.limiter().wait(&ctx.cancel).await?;
        match ctx.client.list(remote_id, page_token).await {
            Ok(page) => {
                ctx.limiter.record_success();
                return Ok(page);
            }
            Err(e) => {
                if e.kind == crate::errors::SyncErrorKind::Quota {
                    ctx.limiter.record_quota_error();
                }
                if !e.is_retryable() || attempt > LIST_RETRIES {
                    return Err(e);
                }
                let delay = crate::errors::delay_for_attempt(e.kind, attempt);
                debug!(attempt, delay_ms = delay.as_millis(), error = %e, "retrying listing");
                tokio::select! {
                    () = ctx.cancel.cancelled() => {
                        return Err(SyncError::cancelled("walk cancelled"));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Builds a file row from a listing entry.
fn file_from_entry(session_id: i64, folder_id: i64, folder_path: &str, entry: Entry) -> NewFile {
    let is_native = entry.is_native_document();
    let export = if is_native {
        export_target(&entry.content_type).map(|(mime, _)| mime.to_string())
    } else {
        None
    };
    NewFile {
        path: join_path(folder_path, &entry.name),
        remote_id: entry.id,
        folder_id,
        session_id,
        name: entry.name,
        size: i64::try_from(entry.size.unwrap_or(0)).unwrap_or(0),
        md5_checksum: entry.md5,
        content_type: if entry.content_type.is_empty() {
            None
        } else {
            Some(entry.content_type)
        },
        is_native_document: is_native,
        export_content_type: export,
        remote_modified_at: entry.modified_time,
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path_root_and_nested() {
        assert_eq!(join_path("", "docs"), "docs");
        assert_eq!(join_path("docs", "guides"), "docs/guides");
    }

    #[test]
    fn test_walker_config_defaults() {
        let config = WalkerConfig::default();
        assert_eq!(config.strategy, WalkStrategy::Bfs);
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_depth, 0);
        assert!(!config.follow_shortcuts);
    }

    #[test]
    fn test_file_from_entry_native_document_gets_export_target() {
        let entry = Entry {
            id: "d1".to_string(),
            name: "Notes".to_string(),
            content_type: "application/vnd.google-apps.document".to_string(),
            size: None,
            md5: None,
            modified_time: None,
            parents: Vec::new(),
        };
        let file = file_from_entry(1, 2, "docs", entry);
        assert!(file.is_native_document);
        assert_eq!(
            file.export_content_type.as_deref(),
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        );
        assert_eq!(file.path, "docs/Notes");
        assert_eq!(file.size, 0);
    }

    #[test]
    fn test_file_from_entry_regular_file() {
        let entry = Entry {
            id: "f1".to_string(),
            name: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: Some(1234),
            md5: Some("abc".to_string()),
            modified_time: Some("2026-03-01T12:00:00Z".to_string()),
            parents: Vec::new(),
        };
        let file = file_from_entry(1, 2, "", entry);
        assert!(!file.is_native_document);
        assert!(file.export_content_type.is_none());
        assert_eq!(file.size, 1234);
        assert_eq!(file.path, "report.pdf");
        assert_eq!(file.md5_checksum.as_deref(), Some("abc"));
    }
}
