//! Folder entity and repository.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, StoreError, check_affected};
use crate::db::Database;

/// Status of a folder in the discovery walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStatus {
    /// Discovered but not yet listed.
    Pending,
    /// Listing in progress.
    Scanning,
    /// Fully listed; all children recorded.
    Scanned,
    /// Listing failed terminally.
    Failed,
}

impl FolderStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Scanned => "scanned",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FolderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FolderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scanning" => Ok(Self::Scanning),
            "scanned" => Ok(Self::Scanned),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid folder status: {s}")),
        }
    }
}

/// A node of the mirrored folder tree.
#[derive(Debug, Clone, FromRow)]
pub struct Folder {
    /// Unique local identifier.
    pub id: i64,
    /// Remote identifier.
    pub remote_id: String,
    /// Local ID of the parent folder; `None` at the root.
    pub parent_id: Option<i64>,
    /// Owning session.
    pub session_id: i64,
    /// Display name.
    pub name: String,
    /// Path relative to the session destination.
    pub path: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Terminal listing error, when failed.
    pub error_message: Option<String>,
    /// When the row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
}

impl Folder {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> FolderStatus {
        self.status_str.parse().unwrap_or(FolderStatus::Pending)
    }
}

/// Fields for inserting a folder.
#[derive(Debug, Clone)]
pub struct NewFolder {
    /// Remote identifier.
    pub remote_id: String,
    /// Local ID of the parent folder; `None` at the root.
    pub parent_id: Option<i64>,
    /// Owning session.
    pub session_id: i64,
    /// Display name.
    pub name: String,
    /// Path relative to the session destination.
    pub path: String,
}

/// Repository for folder rows.
#[derive(Debug, Clone)]
pub struct FolderRepo {
    db: Database,
}

impl FolderRepo {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a folder with the given initial status and returns it.
    ///
    /// If the `(remote_id, session_id)` pair already exists (a resumed walk
    /// revisiting a known folder), the row is returned with its status
    /// refreshed — except a `scanned` folder, which keeps that status so
    /// callers can short-circuit re-listing it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, folder), fields(remote_id = %folder.remote_id, path = %folder.path))]
    pub async fn insert(&self, folder: &NewFolder, status: FolderStatus) -> Result<Folder> {
        let inserted = sqlx::query_as::<_, Folder>(
            r"INSERT INTO folders (remote_id, parent_id, session_id, name, path, status)
              VALUES (?, ?, ?, ?, ?, ?)
              ON CONFLICT (remote_id, session_id) DO UPDATE
                  SET status = CASE WHEN folders.status = 'scanned'
                                    THEN folders.status
                                    ELSE excluded.status END,
                      updated_at = datetime('now')
              RETURNING *",
        )
        .bind(&folder.remote_id)
        .bind(folder.parent_id)
        .bind(folder.session_id)
        .bind(&folder.name)
        .bind(&folder.path)
        .bind(status.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(inserted)
    }

    /// Gets a folder by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no folder exists with the ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Folder> {
        sqlx::query_as::<_, Folder>(r"SELECT * FROM folders WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(StoreError::NotFound {
                entity: "folders",
                id,
            })
    }

    /// Marks a folder fully listed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no folder exists with the ID.
    #[instrument(skip(self))]
    pub async fn mark_scanned(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE folders
              SET status = 'scanned', error_message = NULL, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected("folders", id, result.rows_affected())
    }

    /// Marks a folder failed with a terminal listing error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no folder exists with the ID.
    #[instrument(skip(self), fields(error = %error))]
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE folders
              SET status = 'failed', error_message = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected("folders", id, result.rows_affected())
    }

    /// Returns the next pending folder for a session, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn next_pending(&self, session_id: i64) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(
            r"SELECT * FROM folders
              WHERE session_id = ? AND status = 'pending'
              ORDER BY path ASC
              LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(folder)
    }

    /// Counts folders in a status for a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(
        &self,
        session_id: i64,
        status: FolderStatus,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r"SELECT COUNT(*) FROM folders WHERE session_id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(status.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::SessionRepo;

    async fn fixtures() -> (FolderRepo, i64) {
        let db = Database::new_in_memory().await.unwrap();
        let session = SessionRepo::new(db.clone())
            .create("root", "r", "/d")
            .await
            .unwrap();
        (FolderRepo::new(db), session.id)
    }

    fn new_folder(session_id: i64, remote_id: &str, path: &str) -> NewFolder {
        NewFolder {
            remote_id: remote_id.to_string(),
            parent_id: None,
            session_id,
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_folder_status_round_trip() {
        for status in [
            FolderStatus::Pending,
            FolderStatus::Scanning,
            FolderStatus::Scanned,
            FolderStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<FolderStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<FolderStatus>().is_err());
    }

    #[tokio::test]
    async fn test_insert_and_status_transitions() {
        let (repo, session_id) = fixtures().await;
        let folder = repo
            .insert(&new_folder(session_id, "f1", "docs"), FolderStatus::Scanning)
            .await
            .unwrap();
        assert_eq!(folder.status(), FolderStatus::Scanning);

        repo.mark_scanned(folder.id).await.unwrap();
        assert_eq!(repo.get(folder.id).await.unwrap().status(), FolderStatus::Scanned);

        repo.mark_failed(folder.id, "listing exploded").await.unwrap();
        let failed = repo.get(folder.id).await.unwrap();
        assert_eq!(failed.status(), FolderStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("listing exploded"));
    }

    #[tokio::test]
    async fn test_insert_conflict_returns_existing_row() {
        let (repo, session_id) = fixtures().await;
        let first = repo
            .insert(&new_folder(session_id, "f1", "docs"), FolderStatus::Scanning)
            .await
            .unwrap();
        let second = repo
            .insert(&new_folder(session_id, "f1", "docs"), FolderStatus::Scanning)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_insert_conflict_preserves_scanned_status() {
        let (repo, session_id) = fixtures().await;
        let folder = repo
            .insert(&new_folder(session_id, "f1", "docs"), FolderStatus::Scanning)
            .await
            .unwrap();
        repo.mark_scanned(folder.id).await.unwrap();

        // A resumed walk re-inserting the folder must see it scanned.
        let again = repo
            .insert(&new_folder(session_id, "f1", "docs"), FolderStatus::Scanning)
            .await
            .unwrap();
        assert_eq!(again.status(), FolderStatus::Scanned);
    }

    #[tokio::test]
    async fn test_next_pending_orders_by_path() {
        let (repo, session_id) = fixtures().await;
        repo.insert(&new_folder(session_id, "fz", "zeta"), FolderStatus::Pending)
            .await
            .unwrap();
        repo.insert(&new_folder(session_id, "fa", "alpha"), FolderStatus::Pending)
            .await
            .unwrap();
        repo.insert(&new_folder(session_id, "fs", "scanned"), FolderStatus::Scanned)
            .await
            .unwrap();

        let next = repo.next_pending(session_id).await.unwrap().unwrap();
        assert_eq!(next.path, "alpha");
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let (repo, session_id) = fixtures().await;
        repo.insert(&new_folder(session_id, "f1", "a"), FolderStatus::Scanned)
            .await
            .unwrap();
        repo.insert(&new_folder(session_id, "f2", "b"), FolderStatus::Scanned)
            .await
            .unwrap();
        repo.insert(&new_folder(session_id, "f3", "c"), FolderStatus::Pending)
            .await
            .unwrap();

        assert_eq!(
            repo.count_by_status(session_id, FolderStatus::Scanned).await.unwrap(),
            2
        );
        assert_eq!(
            repo.count_by_status(session_id, FolderStatus::Pending).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_get_missing_folder_is_not_found() {
        let (repo, _) = fixtures().await;
        assert!(matches!(
            repo.get(42).await,
            Err(StoreError::NotFound { entity: "folders", id: 42 })
        ));
    }
}
