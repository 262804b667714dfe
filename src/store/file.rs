//! File entity and repository.
//!
//! Files are the unit of transfer. Completion, failure, and skip all pair
//! the file-row update with the owning session's counter bump inside one
//! transaction so the counters are a valid partial order of completions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, StoreError, check_affected};
use crate::db::Database;

/// Status of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Waiting to be downloaded.
    Pending,
    /// Transfer in progress (or interrupted mid-transfer).
    Downloading,
    /// Downloaded, verified, and published.
    Completed,
    /// Failed after all retries exhausted.
    Failed,
    /// Skipped by policy.
    Skipped,
}

impl FileStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid file status: {s}")),
        }
    }
}

/// A single file to mirror.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    /// Unique local identifier.
    pub id: i64,
    /// Remote identifier.
    pub remote_id: String,
    /// Owning folder (local ID).
    pub folder_id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Display name.
    pub name: String,
    /// Path relative to the session destination.
    pub path: String,
    /// Declared size in bytes. Authoritative for regular files; updated
    /// post-hoc for exported native documents.
    pub size: i64,
    /// Declared MD5 of the content, when the remote computed one.
    pub md5_checksum: Option<String>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Whether this is a cloud-native document requiring export.
    pub is_native_document: bool,
    /// Export target content type, for native documents.
    pub export_content_type: Option<String>,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Bytes written to the temp file so far.
    pub bytes_downloaded: i64,
    /// Download attempts made.
    pub download_attempts: i64,
    /// Last error message, when failed.
    pub error_message: Option<String>,
    /// Remote modification time (RFC 3339).
    pub remote_modified_at: Option<String>,
    /// Local publish time.
    pub local_modified_at: Option<String>,
    /// When the row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
}

impl FileRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> FileStatus {
        self.status_str.parse().unwrap_or(FileStatus::Pending)
    }

    /// Declared size as unsigned bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileRecord {{ id: {}, path: {}, status: {} }}",
            self.id,
            self.path,
            self.status()
        )
    }
}

/// Fields for inserting a file.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Remote identifier.
    pub remote_id: String,
    /// Owning folder (local ID).
    pub folder_id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Display name.
    pub name: String,
    /// Path relative to the session destination.
    pub path: String,
    /// Declared size in bytes (0 for native documents).
    pub size: i64,
    /// Declared MD5.
    pub md5_checksum: Option<String>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Whether export is required.
    pub is_native_document: bool,
    /// Export target content type.
    pub export_content_type: Option<String>,
    /// Remote modification time.
    pub remote_modified_at: Option<String>,
}

/// Outcome of a batch insert: the records in listing order plus how many
/// of them (and how many bytes) were genuinely new to the session.
#[derive(Debug, Clone)]
pub struct BatchInsert {
    /// Stored records, one per input, in listing order.
    pub records: Vec<FileRecord>,
    /// Files not previously known to the session.
    pub new_files: i64,
    /// Declared bytes of the new files.
    pub new_bytes: i64,
}

/// Repository for file rows.
#[derive(Debug, Clone)]
pub struct FileRepo {
    db: Database,
}

impl FileRepo {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a folder's files in one transaction, bumping the session's
    /// `total_files`/`total_bytes` in the same transaction. Returns the
    /// inserted records in listing order.
    ///
    /// Re-walked files (same `(remote_id, session_id)`) are left untouched
    /// and returned as already stored, so a resumed walk never resets
    /// transfer progress.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any insert fails; nothing is
    /// committed in that case.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub async fn insert_batch(&self, files: &[NewFile]) -> Result<BatchInsert> {
        if files.is_empty() {
            return Ok(BatchInsert {
                records: Vec::new(),
                new_files: 0,
                new_bytes: 0,
            });
        }

        let mut tx = self.db.pool().begin().await?;
        let mut inserted = Vec::with_capacity(files.len());
        let mut new_files: i64 = 0;
        let mut new_bytes: i64 = 0;
        let session_id = files[0].session_id;

        for file in files {
            let existing = sqlx::query_as::<_, FileRecord>(
                r"SELECT * FROM files WHERE remote_id = ? AND session_id = ?",
            )
            .bind(&file.remote_id)
            .bind(file.session_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(record) = existing {
                inserted.push(record);
                continue;
            }

            let record = sqlx::query_as::<_, FileRecord>(
                r"INSERT INTO files (
                    remote_id,
                    folder_id,
                    session_id,
                    name,
                    path,
                    size,
                    md5_checksum,
                    content_type,
                    is_native_document,
                    export_content_type,
                    remote_modified_at,
                    status
                  )
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')
                  RETURNING *",
            )
            .bind(&file.remote_id)
            .bind(file.folder_id)
            .bind(file.session_id)
            .bind(&file.name)
            .bind(&file.path)
            .bind(file.size)
            .bind(&file.md5_checksum)
            .bind(&file.content_type)
            .bind(file.is_native_document)
            .bind(&file.export_content_type)
            .bind(&file.remote_modified_at)
            .fetch_one(&mut *tx)
            .await?;

            new_files += 1;
            new_bytes += record.size;
            inserted.push(record);
        }

        if new_files > 0 {
            sqlx::query(
                r"UPDATE sessions
                  SET total_files = total_files + ?,
                      total_bytes = total_bytes + ?,
                      updated_at = datetime('now')
                  WHERE id = ?",
            )
            .bind(new_files)
            .bind(new_bytes)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(BatchInsert {
            records: inserted,
            new_files,
            new_bytes,
        })
    }

    /// Gets a file by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no file exists with the ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<FileRecord> {
        sqlx::query_as::<_, FileRecord>(r"SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(StoreError::NotFound { entity: "files", id })
    }

    /// Returns the next file to work on for a session.
    ///
    /// Prefers an interrupted partial (`downloading` with progress),
    /// most progress first, so in-flight work finishes before new work
    /// starts; otherwise the smallest pending file for quick visible wins.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn next_pending(&self, session_id: i64) -> Result<Option<FileRecord>> {
        let partial = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE session_id = ? AND status = 'downloading' AND bytes_downloaded > 0
              ORDER BY bytes_downloaded DESC
              LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await?;

        if partial.is_some() {
            return Ok(partial);
        }

        let pending = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE session_id = ? AND status = 'pending'
              ORDER BY size ASC
              LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(pending)
    }

    /// Returns a batch of resumable files (pending plus interrupted
    /// partials), partials first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn pending_batch(&self, session_id: i64, limit: i64) -> Result<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(
            r"SELECT * FROM files
              WHERE session_id = ? AND status IN ('pending', 'downloading')
              ORDER BY bytes_downloaded DESC, size ASC
              LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(files)
    }

    /// Marks a file downloading and increments its attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no file exists with the ID.
    #[instrument(skip(self))]
    pub async fn mark_downloading(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE files
              SET status = 'downloading',
                  download_attempts = download_attempts + 1,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected("files", id, result.rows_affected())
    }

    /// Updates partial progress for a file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no file exists with the ID.
    #[instrument(skip(self))]
    pub async fn update_progress(&self, id: i64, bytes_downloaded: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE files
              SET bytes_downloaded = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(bytes_downloaded)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected("files", id, result.rows_affected())
    }

    /// Transactionally marks a file completed and bumps the session
    /// counters by `(+1 file, +final_size bytes)`.
    ///
    /// For exported documents the declared size was unknown until now, so
    /// the file's `size` is finalized and the session's `total_bytes` is
    /// adjusted by the difference in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no file exists with the ID.
    #[instrument(skip(self))]
    pub async fn complete_file(
        &self,
        id: i64,
        session_id: i64,
        final_size: i64,
        declared_size: i64,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            r"UPDATE files
              SET status = 'completed',
                  size = ?,
                  bytes_downloaded = ?,
                  error_message = NULL,
                  local_modified_at = datetime('now'),
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(final_size)
        .bind(final_size)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        check_affected("files", id, result.rows_affected())?;

        sqlx::query(
            r"UPDATE sessions
              SET completed_files = completed_files + 1,
                  completed_bytes = completed_bytes + ?,
                  total_bytes = total_bytes + ?,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(final_size)
        .bind(final_size - declared_size)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Transactionally marks a file failed and bumps the session's
    /// `failed_files`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no file exists with the ID.
    #[instrument(skip(self), fields(error = %error))]
    pub async fn fail_file(&self, id: i64, session_id: i64, error: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            r"UPDATE files
              SET status = 'failed', error_message = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        check_affected("files", id, result.rows_affected())?;

        sqlx::query(
            r"UPDATE sessions
              SET failed_files = failed_files + 1, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Transactionally marks a file skipped and bumps the session's
    /// `skipped_files`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no file exists with the ID.
    #[instrument(skip(self))]
    pub async fn skip_file(&self, id: i64, session_id: i64) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            r"UPDATE files
              SET status = 'skipped', updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        check_affected("files", id, result.rows_affected())?;

        sqlx::query(
            r"UPDATE sessions
              SET skipped_files = skipped_files + 1, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Resets failed files under the attempt cap back to pending, clearing
    /// their error messages. Returns the number of files reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_failed_files(&self, session_id: i64, max_attempts: i64) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE files
              SET status = 'pending', error_message = NULL, updated_at = datetime('now')
              WHERE session_id = ? AND status = 'failed' AND download_attempts < ?",
        )
        .bind(session_id)
        .bind(max_attempts)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns interrupted `downloading` rows to `pending` at rest,
    /// keeping their byte offsets for resume. Returns the number of rows
    /// normalized.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn normalize_in_flight(&self, session_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE files
              SET status = 'pending', updated_at = datetime('now')
              WHERE session_id = ? AND status = 'downloading'",
        )
        .bind(session_id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// IDs of files currently marked `downloading`, across all sessions.
    /// The scratch sweep preserves their temps.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn downloading_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as(r"SELECT id FROM files WHERE status = 'downloading'")
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Counts files in a status for a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, session_id: i64, status: FileStatus) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as(r"SELECT COUNT(*) FROM files WHERE session_id = ? AND status = ?")
                .bind(session_id)
                .bind(status.as_str())
                .fetch_one(self.db.pool())
                .await?;
        Ok(count)
    }
}
