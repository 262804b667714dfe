//! Advisory per-file range plans.
//!
//! The transfer path writes a chunk plan before a file's first range
//! request and updates each row as the range lands. Ranges are written
//! strictly in order, so the on-disk temp size stays the resume authority;
//! these rows exist for observability and post-mortems.

use std::fmt;

use sqlx::FromRow;
use tracing::instrument;

use super::Result;
use crate::db::Database;

/// Status of a planned range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Not yet transferred.
    Pending,
    /// Transferred and written.
    Completed,
    /// Last attempt failed.
    Failed,
}

impl ChunkStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A planned byte range of one file.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadChunk {
    /// Unique identifier.
    pub id: i64,
    /// Owning file (local ID).
    pub file_id: i64,
    /// Zero-based index within the plan.
    pub chunk_index: i64,
    /// First byte of the range (inclusive).
    pub start_byte: i64,
    /// Last byte of the range (inclusive).
    pub end_byte: i64,
    /// Current status (stored as text).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Transfer attempts for this range.
    pub attempts: i64,
    /// When the row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
}

/// Repository for chunk plans.
#[derive(Debug, Clone)]
pub struct ChunkRepo {
    db: Database,
}

impl ChunkRepo {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replaces the plan for a file with the given inclusive ranges, in
    /// one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the writes fail.
    #[instrument(skip(self, ranges), fields(count = ranges.len()))]
    pub async fn plan(&self, file_id: i64, ranges: &[(u64, u64)]) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(r"DELETE FROM download_chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for (index, (start, end)) in ranges.iter().enumerate() {
            sqlx::query(
                r"INSERT INTO download_chunks (file_id, chunk_index, start_byte, end_byte)
                  VALUES (?, ?, ?, ?)",
            )
            .bind(file_id)
            .bind(index as i64)
            .bind(i64::try_from(*start).unwrap_or(i64::MAX))
            .bind(i64::try_from(*end).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Marks one planned range with a status, bumping its attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark(&self, file_id: i64, chunk_index: i64, status: ChunkStatus) -> Result<()> {
        sqlx::query(
            r"UPDATE download_chunks
              SET status = ?, attempts = attempts + 1, updated_at = datetime('now')
              WHERE file_id = ? AND chunk_index = ?",
        )
        .bind(status.as_str())
        .bind(file_id)
        .bind(chunk_index)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Lists the plan for a file in range order.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self, file_id: i64) -> Result<Vec<DownloadChunk>> {
        let chunks = sqlx::query_as::<_, DownloadChunk>(
            r"SELECT * FROM download_chunks WHERE file_id = ? ORDER BY chunk_index ASC",
        )
        .bind(file_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(chunks)
    }
}
