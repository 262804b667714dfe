//! Session entity and repository.
//!
//! A session is one sync run: a root folder, a destination path, rolling
//! counters, and a status that moves `active → paused ⇄ active →
//! {completed | failed | cancelled}`. Counter updates are signed deltas
//! applied under transaction so concurrent completions never lose updates.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use tracing::instrument;

use super::{Result, StoreError, check_affected};
use crate::db::Database;

/// Status of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Actively discovering and downloading.
    Active,
    /// Paused by the user; resumable.
    Paused,
    /// All work finished with no failed files.
    Completed,
    /// Finished with failures, or the error budget was exceeded.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl SessionStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the session can still make progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid session status: {s}")),
        }
    }
}

/// A single sync run.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    /// Unique identifier.
    pub id: i64,
    /// Remote ID of the root folder being mirrored.
    pub root_folder_id: String,
    /// Display name of the root folder.
    pub root_folder_name: String,
    /// Local destination path.
    pub destination_path: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Files discovered so far.
    pub total_files: i64,
    /// Files downloaded and published.
    pub completed_files: i64,
    /// Files that exhausted retries.
    pub failed_files: i64,
    /// Files skipped by policy.
    pub skipped_files: i64,
    /// Bytes discovered so far.
    pub total_bytes: i64,
    /// Bytes of completed files.
    pub completed_bytes: i64,
    /// When the run started.
    pub started_at: String,
    /// When the run reached a terminal state.
    pub ended_at: Option<String>,
    /// When the row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
}

impl Session {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Failed` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status_str.parse().unwrap_or(SessionStatus::Failed)
    }

    /// Bytes still to download, saturating at zero.
    #[must_use]
    pub fn remaining_bytes(&self) -> u64 {
        u64::try_from(self.total_bytes - self.completed_bytes).unwrap_or(0)
    }
}

/// Signed deltas applied atomically to a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    /// Change to `total_files`.
    pub total_files: i64,
    /// Change to `completed_files`.
    pub completed_files: i64,
    /// Change to `failed_files`.
    pub failed_files: i64,
    /// Change to `skipped_files`.
    pub skipped_files: i64,
    /// Change to `total_bytes`.
    pub total_bytes: i64,
    /// Change to `completed_bytes`.
    pub completed_bytes: i64,
}

/// Repository for session rows.
#[derive(Debug, Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new active session and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self), fields(root = %root_folder_id))]
    pub async fn create(
        &self,
        root_folder_id: &str,
        root_folder_name: &str,
        destination_path: &str,
    ) -> Result<Session> {
        let session = sqlx::query_as::<_, Session>(
            r"INSERT INTO sessions (root_folder_id, root_folder_name, destination_path, status)
              VALUES (?, ?, ?, 'active')
              RETURNING *",
        )
        .bind(root_folder_id)
        .bind(root_folder_name)
        .bind(destination_path)
        .fetch_one(self.db.pool())
        .await?;

        Ok(session)
    }

    /// Gets a session by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no session exists with the ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Session> {
        sqlx::query_as::<_, Session>(r"SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(StoreError::NotFound {
                entity: "sessions",
                id,
            })
    }

    /// Lists all sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Session>> {
        let sessions =
            sqlx::query_as::<_, Session>(r"SELECT * FROM sessions ORDER BY id DESC")
                .fetch_all(self.db.pool())
                .await?;
        Ok(sessions)
    }

    /// Applies signed deltas to the session counters atomically.
    ///
    /// Uses `counter = counter + ?` so concurrent completions compose
    /// instead of clobbering each other.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no session exists with the ID.
    #[instrument(skip(self, delta))]
    pub async fn apply_progress_delta(&self, id: i64, delta: ProgressDelta) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET total_files = total_files + ?,
                  completed_files = completed_files + ?,
                  failed_files = failed_files + ?,
                  skipped_files = skipped_files + ?,
                  total_bytes = total_bytes + ?,
                  completed_bytes = completed_bytes + ?,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(delta.total_files)
        .bind(delta.completed_files)
        .bind(delta.failed_files)
        .bind(delta.skipped_files)
        .bind(delta.total_bytes)
        .bind(delta.completed_bytes)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected("sessions", id, result.rows_affected())
    }

    /// Pauses an active session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the session is not
    /// active.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = 'paused', updated_at = datetime('now')
              WHERE id = ? AND status = 'active'",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "sessions",
                id,
                to: "paused",
            });
        }
        Ok(())
    }

    /// Restores a paused session to active. Idempotent for a session that
    /// is already active.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the session is
    /// terminal.
    #[instrument(skip(self))]
    pub async fn activate(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = 'active', updated_at = datetime('now')
              WHERE id = ? AND status IN ('active', 'paused')",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "sessions",
                id,
                to: "active",
            });
        }
        Ok(())
    }

    /// Cancels a session. Only applies from {active, paused}.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the session is already
    /// terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = 'cancelled', ended_at = datetime('now'), updated_at = datetime('now')
              WHERE id = ? AND status IN ('active', 'paused')",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "sessions",
                id,
                to: "cancelled",
            });
        }
        Ok(())
    }

    /// Completes a session. Only applies from active.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the session is not
    /// active.
    #[instrument(skip(self))]
    pub async fn complete(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = 'completed', ended_at = datetime('now'), updated_at = datetime('now')
              WHERE id = ? AND status = 'active'",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "sessions",
                id,
                to: "completed",
            });
        }
        Ok(())
    }

    /// Marks a session failed. Applies from {active, paused}.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the session is already
    /// terminal.
    #[instrument(skip(self))]
    pub async fn fail(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = 'failed', ended_at = datetime('now'), updated_at = datetime('now')
              WHERE id = ? AND status IN ('active', 'paused')",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "sessions",
                id,
                to: "failed",
            });
        }
        Ok(())
    }

    /// Updates the status only if `updated_at` still matches what the
    /// caller read, detecting concurrent writers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConcurrentUpdate`] if another writer modified
    /// the row since it was read.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn update_status_guarded(
        &self,
        id: i64,
        status: SessionStatus,
        expected_updated_at: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = ?, updated_at = datetime('now')
              WHERE id = ? AND updated_at = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .bind(expected_updated_at)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrentUpdate {
                entity: "sessions",
                id,
            });
        }
        Ok(())
    }

    /// Bumps `updated_at`, recording engine liveness at checkpoint time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no session exists with the ID.
    #[instrument(skip(self))]
    pub async fn touch(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions SET updated_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected("sessions", id, result.rows_affected())
    }

    /// Reactivates a paused (or still-active) session and resets failed
    /// items for another pass, all in one transaction:
    ///
    /// 1. status → active (refused from terminal states);
    /// 2. failed files under the attempt cap → pending, error cleared,
    ///    session `failed_files` decremented accordingly;
    /// 3. failed folders → pending, error cleared.
    ///
    /// Returns `(files_reset, folders_reset)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] if the session is
    /// completed, failed, or cancelled.
    #[instrument(skip(self))]
    pub async fn resume_session(&self, id: i64, max_attempts: i64) -> Result<(u64, u64)> {
        let mut tx = self.db.pool().begin().await?;

        let activated = sqlx::query(
            r"UPDATE sessions
              SET status = 'active', ended_at = NULL, updated_at = datetime('now')
              WHERE id = ? AND status IN ('active', 'paused')",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if activated.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "sessions",
                id,
                to: "active",
            });
        }

        let files = sqlx::query(
            r"UPDATE files
              SET status = 'pending', error_message = NULL, updated_at = datetime('now')
              WHERE session_id = ? AND status = 'failed' AND download_attempts < ?",
        )
        .bind(id)
        .bind(max_attempts)
        .execute(&mut *tx)
        .await?;
        let files_reset = files.rows_affected();

        if files_reset > 0 {
            sqlx::query(
                r"UPDATE sessions
                  SET failed_files = failed_files - ?, updated_at = datetime('now')
                  WHERE id = ?",
            )
            .bind(i64::try_from(files_reset).unwrap_or(0))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let folders = sqlx::query(
            r"UPDATE folders
              SET status = 'pending', error_message = NULL, updated_at = datetime('now')
              WHERE session_id = ? AND status = 'failed'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((files_reset, folders.rows_affected()))
    }

    /// Reads the derived `session_summary` view row for a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no session exists with the ID.
    #[instrument(skip(self))]
    pub async fn summary(&self, id: i64) -> Result<(f64, f64, i64)> {
        let row = sqlx::query(
            r"SELECT files_percent, bytes_percent, duration_seconds
              FROM session_summary WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or(StoreError::NotFound {
            entity: "sessions",
            id,
        })?;

        Ok((
            row.get("files_percent"),
            row.get("bytes_percent"),
            row.get("duration_seconds"),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> SessionRepo {
        let db = Database::new_in_memory().await.unwrap();
        SessionRepo::new(db)
    }

    #[test]
    fn test_session_status_round_trip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_session_status_terminality() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let repo = repo().await;
        let session = repo.create("root", "My Drive", "/mnt/mirror").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.total_files, 0);

        let loaded = repo.get(session.id).await.unwrap();
        assert_eq!(loaded.root_folder_id, "root");
        assert_eq!(loaded.destination_path, "/mnt/mirror");
    }

    #[tokio::test]
    async fn test_get_missing_session_is_not_found() {
        let repo = repo().await;
        let result = repo.get(999).await;
        assert!(matches!(
            result,
            Err(StoreError::NotFound { entity: "sessions", id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_progress_delta_applies_and_inverts_exactly() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();

        let delta = ProgressDelta {
            total_files: 12,
            completed_files: 3,
            total_bytes: 4096,
            completed_bytes: 1024,
            ..ProgressDelta::default()
        };
        repo.apply_progress_delta(session.id, delta).await.unwrap();

        let mid = repo.get(session.id).await.unwrap();
        assert_eq!(mid.total_files, 12);
        assert_eq!(mid.completed_files, 3);
        assert_eq!(mid.completed_bytes, 1024);

        let inverse = ProgressDelta {
            total_files: -delta.total_files,
            completed_files: -delta.completed_files,
            failed_files: -delta.failed_files,
            skipped_files: -delta.skipped_files,
            total_bytes: -delta.total_bytes,
            completed_bytes: -delta.completed_bytes,
        };
        repo.apply_progress_delta(session.id, inverse).await.unwrap();

        let restored = repo.get(session.id).await.unwrap();
        assert_eq!(restored.total_files, 0);
        assert_eq!(restored.completed_files, 0);
        assert_eq!(restored.total_bytes, 0);
        assert_eq!(restored.completed_bytes, 0);
    }

    #[tokio::test]
    async fn test_cancel_from_active_and_paused_only() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();

        repo.cancel(session.id).await.unwrap();
        let cancelled = repo.get(session.id).await.unwrap();
        assert_eq!(cancelled.status(), SessionStatus::Cancelled);
        assert!(cancelled.ended_at.is_some());

        // Second cancel must be refused: already terminal.
        let again = repo.cancel(session.id).await;
        assert!(matches!(again, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_complete_only_from_active() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();
        repo.pause(session.id).await.unwrap();

        let result = repo.complete(session.id).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_pause_then_resume_is_idempotent_after_first() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();

        repo.pause(session.id).await.unwrap();
        repo.resume_session(session.id, 3).await.unwrap();
        // Resuming an already-active session succeeds again (idempotent).
        repo.resume_session(session.id, 3).await.unwrap();
        assert_eq!(
            repo.get(session.id).await.unwrap().status(),
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_resume_rejected_for_terminal_session() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();
        repo.complete(session.id).await.unwrap();

        let result = repo.resume_session(session.id, 3).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_update_status_guarded_detects_concurrent_writer() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();

        // Another writer bumps updated_at to a different value.
        sqlx::query("UPDATE sessions SET updated_at = '2001-01-01 00:00:00' WHERE id = ?")
            .bind(session.id)
            .execute(repo.db.pool())
            .await
            .unwrap();

        let result = repo
            .update_status_guarded(session.id, SessionStatus::Paused, &session.updated_at)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrentUpdate { entity: "sessions", .. })
        ));
    }

    #[tokio::test]
    async fn test_summary_view_reports_percentages() {
        let repo = repo().await;
        let session = repo.create("root", "r", "/d").await.unwrap();
        repo.apply_progress_delta(
            session.id,
            ProgressDelta {
                total_files: 10,
                completed_files: 4,
                total_bytes: 1000,
                completed_bytes: 250,
                ..ProgressDelta::default()
            },
        )
        .await
        .unwrap();

        let (files_pct, bytes_pct, duration) = repo.summary(session.id).await.unwrap();
        assert!((files_pct - 40.0).abs() < f64::EPSILON);
        assert!((bytes_pct - 25.0).abs() < f64::EPSILON);
        assert!(duration >= 0);
    }
}
