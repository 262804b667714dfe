//! Per-file resumable transfer: ranged chunks, checksum verification, and
//! atomic publish.
//!
//! The manager owns the scratch directory. Partial downloads live there as
//! `{file_id}_{name}` temps; the temp's size is the resume offset, so an
//! interrupted transfer continues from its last fully-written byte. A file
//! only ever appears at its final path via an atomic rename of a verified
//! temp — never partially.
//!
//! Native editor documents take the export branch: server-side conversion
//! streamed to the temp with no size advertised, published the same way.

mod checksum;

pub use checksum::md5_path;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ByteStream, CloudClient, export_extension};
use crate::errors::{SyncError, SyncErrorKind};
use crate::pool::TaskExecutor;
use crate::progress::ProgressTracker;
use crate::ratelimit::AdaptiveLimiter;
use crate::store::{ChunkStatus, FileRecord, FileStatus, StateStore};

/// Scratch directory name under the configured base.
pub const SCRATCH_DIR_NAME: &str = "cloudpull-downloads";

/// Default ranged-chunk size (10 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Per-chunk retry attempts with linear backoff.
const CHUNK_RETRIES: u32 = 3;

/// Directory mode for the scratch and destination trees.
#[cfg(unix)]
const DIR_MODE: u32 = 0o750;

/// Download-manager configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Base directory for the scratch dir (defaults to the system temp).
    pub scratch_base: PathBuf,
    /// Ranged-chunk size in bytes.
    pub chunk_size: u64,
    /// Whether declared checksums are verified before publish.
    pub verify_checksums: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scratch_base: std::env::temp_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify_checksums: true,
        }
    }
}

/// Removes the active-downloads entry when a transfer ends.
struct ActiveGuard {
    active: Arc<DashMap<i64, ()>>,
    file_id: i64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.file_id);
    }
}

/// Owns the scratch directory and per-file transfer state.
pub struct DownloadManager {
    client: Arc<dyn CloudClient>,
    store: StateStore,
    tracker: Arc<ProgressTracker>,
    limiter: Arc<AdaptiveLimiter>,
    destination: PathBuf,
    scratch_dir: PathBuf,
    config: TransferConfig,
    active: Arc<DashMap<i64, ()>>,
}

impl DownloadManager {
    /// Creates a manager, creating the scratch directory if needed.
    ///
    /// # Errors
    ///
    /// Returns a storage-kind error if the scratch directory cannot be
    /// created.
    pub fn new(
        client: Arc<dyn CloudClient>,
        store: StateStore,
        tracker: Arc<ProgressTracker>,
        limiter: Arc<AdaptiveLimiter>,
        destination: PathBuf,
        config: TransferConfig,
    ) -> Result<Self, SyncError> {
        let scratch_dir = config.scratch_base.join(SCRATCH_DIR_NAME);
        create_dir_restricted(&scratch_dir)?;
        Ok(Self {
            client,
            store,
            tracker,
            limiter,
            destination,
            scratch_dir,
            config,
            active: Arc::new(DashMap::new()),
        })
    }

    /// The scratch directory in use.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Number of transfers currently in flight.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sweeps orphaned temps from previous runs, preserving those whose
    /// `{file_id}_` prefix matches a file still marked `downloading` so
    /// their partial progress survives the restart.
    ///
    /// # Errors
    ///
    /// Returns a storage-kind error if the directory cannot be read.
    #[instrument(skip(self))]
    pub async fn sweep_scratch(&self) -> Result<usize, SyncError> {
        let preserve = self
            .store
            .files()
            .downloading_ids()
            .await
            .map_err(|e| SyncError::storage(format!("listing resumable files: {e}")))?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.scratch_dir)
            .await
            .map_err(|e| SyncError::storage(format!("reading scratch dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::storage(format!("reading scratch dir: {e}")))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let keep = temp_file_id(&name).is_some_and(|id| preserve.contains(&id));
            if keep {
                debug!(temp = %name, "preserving resumable temp");
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!(temp = %name, error = %e, "failed to remove orphan temp");
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept orphan temps from scratch dir");
        }
        Ok(removed)
    }

    /// Transfers one file end to end: resume, download or export, verify,
    /// publish, and record completion. Idempotent for already-completed
    /// files; refuses to run concurrently with itself for the same file.
    ///
    /// # Errors
    ///
    /// Returns the categorized failure; the caller (worker pool) owns the
    /// retry policy.
    #[instrument(skip(self, file, cancel), fields(file_id = file.id, path = %file.path))]
    pub async fn download_file(
        &self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if self.active.insert(file.id, ()).is_some() {
            warn!(file_id = file.id, "transfer already in flight, refusing duplicate");
            return Ok(());
        }
        let _guard = ActiveGuard {
            active: Arc::clone(&self.active),
            file_id: file.id,
        };

        // Reload: a resume submission can race a finished transfer.
        let current = self
            .store
            .files()
            .get(file.id)
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        if current.status() == FileStatus::Completed {
            debug!(file_id = file.id, "already completed");
            return Ok(());
        }

        if current.is_native_document {
            self.export_file(&current, cancel).await
        } else {
            self.transfer_regular(&current, cancel).await
        }
    }

    /// Regular-file transfer: byte-range resume off the temp size.
    async fn transfer_regular(
        &self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let declared = file.size_bytes();
        let temp_path = self.temp_path(file);
        let final_path = self.final_path(&file.path);

        let mut offset = match tokio::fs::metadata(&temp_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if offset > declared {
            // The temp cannot be longer than the declared size unless the
            // remote changed; start over.
            warn!(file_id = file.id, offset, declared, "oversized temp, restarting");
            tokio::fs::remove_file(&temp_path).await.ok();
            offset = 0;
        }

        if offset < declared || declared == 0 {
            self.tracker.file_started(file);

            let mut out = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&temp_path)
                .await
                .map_err(|e| {
                    SyncError::storage(format!("open temp {}: {e}", temp_path.display()))
                })?;

            // Advisory range plan; ranges already on disk are completed.
            let ranges = plan_ranges(declared, self.config.chunk_size);
            if let Err(e) = self.store.chunks().plan(file.id, &ranges).await {
                warn!(file_id = file.id, error = %e, "failed to persist chunk plan");
            }
            for (index, (_, end)) in ranges.iter().enumerate() {
                if *end < offset {
                    let _ = self
                        .store
                        .chunks()
                        .mark(file.id, index as i64, ChunkStatus::Completed)
                        .await;
                }
            }

            while offset < declared {
                if cancel.is_cancelled() {
                    return Err(SyncError::cancelled("transfer cancelled"));
                }
                let end = (offset + self.config.chunk_size - 1).min(declared - 1);
                let planned = end - offset + 1;
                let chunk_index = (offset / self.config.chunk_size) as i64;

                self.tracker.check_bandwidth_limit(cancel, planned).await?;

                match self
                    .fetch_range_with_retry(file, &mut out, offset, end, cancel)
                    .await
                {
                    Ok(written) => {
                        offset += written;
                        let _ = self
                            .store
                            .chunks()
                            .mark(file.id, chunk_index, ChunkStatus::Completed)
                            .await;
                    }
                    Err((e, written)) => {
                        offset += written;
                        let _ = self
                            .store
                            .chunks()
                            .mark(file.id, chunk_index, ChunkStatus::Failed)
                            .await;
                        let _ = self
                            .store
                            .files()
                            .update_progress(file.id, i64::try_from(offset).unwrap_or(0))
                            .await;
                        return Err(e);
                    }
                }

                let _ = self
                    .store
                    .files()
                    .update_progress(file.id, i64::try_from(offset).unwrap_or(0))
                    .await;
                self.tracker
                    .file_progress(file, planned, offset, Some(declared));
            }

            out.flush().await.map_err(|e| {
                SyncError::storage(format!("flush {}: {e}", temp_path.display()))
            })?;
        }

        // Verify against the declared checksum before anything becomes
        // visible at the final path.
        if self.config.verify_checksums {
            if let Some(expected) = file.md5_checksum.as_deref() {
                let actual = md5_path(&temp_path).await?;
                if !actual.eq_ignore_ascii_case(expected) {
                    tokio::fs::remove_file(&temp_path).await.ok();
                    let _ = self.store.files().update_progress(file.id, 0).await;
                    return Err(SyncError::corruption(format!(
                        "checksum mismatch for {}: expected {expected}, got {actual}",
                        file.path
                    )));
                }
            }
        }

        self.publish(&temp_path, &final_path).await?;
        self.store
            .files()
            .complete_file(
                file.id,
                file.session_id,
                i64::try_from(declared).unwrap_or(0),
                file.size,
            )
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        self.tracker.file_completed(file, declared, declared);
        info!(file_id = file.id, path = %file.path, bytes = declared, "file published");
        Ok(())
    }

    /// Fetches one byte range into the temp, retrying transient failures
    /// up to three times with 1×/2×/3× second linear backoff. Returns the
    /// bytes written (also on failure, so the caller can account for a
    /// partially-written range — writes are strictly in-order).
    async fn fetch_range_with_retry(
        &self,
        file: &FileRecord,
        out: &mut tokio::fs::File,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, (SyncError, u64)> {
        let mut written_total: u64 = 0;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let range_start = start + written_total;

            let result = self
                .fetch_range_once(file, out, range_start, end, cancel)
                .await;
            match result {
                Ok(written) => return Ok(written_total + written),
                Err((e, written)) => {
                    written_total += written;
                    if e.kind == SyncErrorKind::Context || !e.is_retryable() {
                        return Err((e, written_total));
                    }
                    if attempt >= CHUNK_RETRIES {
                        return Err((e, written_total));
                    }
                    let backoff = Duration::from_secs(u64::from(attempt));
                    debug!(
                        file_id = file.id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "retrying range"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err((
                                SyncError::cancelled("transfer cancelled"),
                                written_total,
                            ));
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn fetch_range_once(
        &self,
        file: &FileRecord,
        out: &mut tokio::fs::File,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, (SyncError, u64)> {
        self.limiter
            .limiter()
            .wait(cancel)
            .await
            .map_err(|e| (e, 0))?;

        let stream = match self.client.download_range(&file.remote_id, start, end).await {
            Ok(stream) => {
                self.limiter.record_success();
                stream
            }
            Err(e) => {
                if e.kind == SyncErrorKind::Quota {
                    self.limiter.record_quota_error();
                }
                return Err((e, 0));
            }
        };

        self.copy_stream(stream, out, cancel).await
    }

    /// Copies a body stream to the temp file, returning bytes written.
    async fn copy_stream(
        &self,
        mut stream: ByteStream,
        out: &mut tokio::fs::File,
        cancel: &CancellationToken,
    ) -> Result<u64, (SyncError, u64)> {
        let mut written: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err((SyncError::cancelled("transfer cancelled"), written));
            }
            match stream.try_next().await {
                Ok(Some(bytes)) => {
                    if let Err(e) = out.write_all(&bytes).await {
                        return Err((
                            SyncError::storage(format!("write temp: {e}")),
                            written,
                        ));
                    }
                    written += bytes.len() as u64;
                }
                Ok(None) => return Ok(written),
                Err(e) => return Err((e, written)),
            }
        }
    }

    /// Export branch for native documents: no declared size, no resume —
    /// the conversion restarts from scratch on retry.
    async fn export_file(
        &self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let Some(target) = file.export_content_type.clone() else {
            // No portable form and no export mapping: skip by policy.
            info!(file_id = file.id, path = %file.path, "no export target, skipping");
            self.store
                .files()
                .skip_file(file.id, file.session_id)
                .await
                .map_err(|e| SyncError::storage(e.to_string()))?;
            self.tracker.file_skipped(file);
            return Ok(());
        };

        let temp_path = self.temp_path(file);
        let final_path = export_final_path(&self.final_path(&file.path), &target);

        self.tracker.file_started(file);
        self.limiter.limiter().wait_export(cancel).await?;

        let stream = match self.client.export(&file.remote_id, &target).await {
            Ok(stream) => {
                self.limiter.record_success();
                stream
            }
            Err(e) => {
                if e.kind == SyncErrorKind::Quota {
                    self.limiter.record_quota_error();
                }
                return Err(e);
            }
        };

        // Exports cannot resume; truncate any leftover.
        let mut out = tokio::fs::File::create(&temp_path).await.map_err(|e| {
            SyncError::storage(format!("create temp {}: {e}", temp_path.display()))
        })?;
        let written = match self.copy_stream(stream, &mut out, cancel).await {
            Ok(written) => written,
            Err((e, _)) => return Err(e),
        };
        out.flush()
            .await
            .map_err(|e| SyncError::storage(format!("flush temp: {e}")))?;
        drop(out);

        self.tracker.file_progress(file, written, written, None);

        // The converted size is only known now.
        let final_size = tokio::fs::metadata(&temp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(written);

        self.publish(&temp_path, &final_path).await?;
        self.store
            .files()
            .complete_file(
                file.id,
                file.session_id,
                i64::try_from(final_size).unwrap_or(0),
                file.size,
            )
            .await
            .map_err(|e| SyncError::storage(e.to_string()))?;
        self.tracker.file_completed(file, final_size, file.size_bytes());
        info!(file_id = file.id, path = %final_path.display(), bytes = final_size, "export published");
        Ok(())
    }

    /// Atomically publishes a verified temp at its final path: ensure the
    /// parent directory, then rename; a cross-device rename falls back to
    /// copy-then-delete, removing the partial target if the copy fails.
    async fn publish(&self, temp_path: &Path, final_path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = final_path.parent() {
            create_dir_restricted(parent)?;
        }

        match tokio::fs::rename(temp_path, final_path).await {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                debug!(from = %temp_path.display(), to = %final_path.display(), "cross-device rename, copying");
                if let Err(copy_err) = tokio::fs::copy(temp_path, final_path).await {
                    tokio::fs::remove_file(final_path).await.ok();
                    return Err(SyncError::storage(format!(
                        "copy to {}: {copy_err}",
                        final_path.display()
                    )));
                }
                tokio::fs::remove_file(temp_path).await.ok();
                Ok(())
            }
            Err(e) => Err(SyncError::storage(format!(
                "rename to {}: {e}",
                final_path.display()
            ))),
        }
    }

    fn temp_path(&self, file: &FileRecord) -> PathBuf {
        self.scratch_dir
            .join(format!("{}_{}", file.id, sanitize_temp_name(&file.name)))
    }

    fn final_path(&self, relative: &str) -> PathBuf {
        self.destination.join(relative)
    }
}

#[async_trait]
impl TaskExecutor for DownloadManager {
    async fn execute(
        &self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.download_file(file, cancel).await
    }
}

/// Inclusive chunk ranges covering `size` bytes.
fn plan_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + chunk_size - 1).min(size - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Parses the `{file_id}_` prefix of a temp name.
fn temp_file_id(name: &str) -> Option<i64> {
    name.split_once('_')?.0.parse().ok()
}

/// Keeps temp names flat: path separators in display names become
/// underscores.
fn sanitize_temp_name(name: &str) -> String {
    name.replace(['/', '\\', '\0'], "_")
}

/// Appends the export extension when the final name lacks one.
fn export_final_path(path: &Path, export_content_type: &str) -> PathBuf {
    if path.extension().is_some() {
        return path.to_path_buf();
    }
    match export_extension(export_content_type) {
        Some(ext) => {
            let mut name = path.file_name().map_or_else(String::new, |n| {
                n.to_string_lossy().into_owned()
            });
            name.push_str(ext);
            path.with_file_name(name)
        }
        None => path.to_path_buf(),
    }
}

fn create_dir_restricted(dir: &Path) -> Result<(), SyncError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| SyncError::storage(format!("create dir {}: {e}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(DIR_MODE);
        std::fs::set_permissions(dir, perms)
            .map_err(|e| SyncError::storage(format!("chmod {}: {e}", dir.display())))?;
    }
    Ok(())
}

/// Whether a rename failed because source and target are on different
/// filesystems.
fn is_cross_device(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::CrossesDevices
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_ranges_exact_multiple() {
        assert_eq!(plan_ranges(20, 10), vec![(0, 9), (10, 19)]);
    }

    #[test]
    fn test_plan_ranges_with_tail() {
        assert_eq!(plan_ranges(25, 10), vec![(0, 9), (10, 19), (20, 24)]);
    }

    #[test]
    fn test_plan_ranges_zero_size_is_empty() {
        assert!(plan_ranges(0, 10).is_empty());
    }

    #[test]
    fn test_plan_ranges_single_small_file() {
        assert_eq!(plan_ranges(5, 10), vec![(0, 4)]);
    }

    #[test]
    fn test_temp_file_id_parses_prefix() {
        assert_eq!(temp_file_id("42_report.pdf"), Some(42));
        assert_eq!(temp_file_id("42_with_underscores.bin"), Some(42));
        assert_eq!(temp_file_id("noprefix.pdf"), None);
        assert_eq!(temp_file_id("x_y"), None);
    }

    #[test]
    fn test_sanitize_temp_name_flattens_separators() {
        assert_eq!(sanitize_temp_name("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_temp_name("plain.pdf"), "plain.pdf");
    }

    #[test]
    fn test_export_final_path_appends_missing_extension() {
        let path = Path::new("/dest/docs/Notes");
        let out = export_final_path(
            path,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        );
        assert_eq!(out, Path::new("/dest/docs/Notes.docx"));
    }

    #[test]
    fn test_export_final_path_keeps_existing_extension() {
        let path = Path::new("/dest/docs/Notes.docx");
        let out = export_final_path(
            path,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        );
        assert_eq!(out, Path::new("/dest/docs/Notes.docx"));
    }

    #[test]
    fn test_export_final_path_pdf_target() {
        let out = export_final_path(Path::new("/dest/Drawing"), "application/pdf");
        assert_eq!(out, Path::new("/dest/Drawing.pdf"));
    }
}
