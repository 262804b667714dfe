//! Append-only audit log of per-item failures.

use std::fmt;

use sqlx::FromRow;
use tracing::instrument;

use super::Result;
use crate::db::Database;
use crate::errors::SyncError;

/// What kind of item an error record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// A file row.
    File,
    /// A folder row.
    Folder,
}

impl ItemType {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted failure record.
#[derive(Debug, Clone, FromRow)]
pub struct ErrorRecord {
    /// Unique identifier.
    pub id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Local ID of the failed item.
    pub item_id: i64,
    /// Whether the item is a file or a folder.
    pub item_type: String,
    /// Taxonomy kind string.
    pub error_kind: String,
    /// Upstream error code, when one exists.
    pub error_code: Option<String>,
    /// Human-readable message.
    pub error_message: String,
    /// Rendered cause chain.
    pub stack_trace: Option<String>,
    /// Retries performed before this record was written.
    pub retry_count: i64,
    /// Whether the failure was classified retryable.
    pub is_retryable: bool,
    /// When the record was written.
    pub created_at: String,
}

/// Fields for appending an error record.
#[derive(Debug, Clone)]
pub struct NewErrorRecord {
    /// Owning session.
    pub session_id: i64,
    /// Local ID of the failed item.
    pub item_id: i64,
    /// Whether the item is a file or a folder.
    pub item_type: ItemType,
    /// Taxonomy kind string.
    pub error_kind: String,
    /// Upstream error code, when one exists.
    pub error_code: Option<String>,
    /// Human-readable message.
    pub error_message: String,
    /// Rendered cause chain.
    pub stack_trace: Option<String>,
    /// Retries performed before this record was written.
    pub retry_count: i64,
    /// Whether the failure was classified retryable.
    pub is_retryable: bool,
}

impl NewErrorRecord {
    /// Builds a record from a [`SyncError`] for a failed item.
    #[must_use]
    pub fn from_sync_error(
        session_id: i64,
        item_id: i64,
        item_type: ItemType,
        error: &SyncError,
        retry_count: i64,
    ) -> Self {
        Self {
            session_id,
            item_id,
            item_type,
            error_kind: error.kind.as_str().to_string(),
            error_code: None,
            error_message: error.message.clone(),
            stack_trace: Some(error.cause_chain()),
            retry_count,
            is_retryable: error.is_retryable(),
        }
    }
}

/// Repository for the error log.
#[derive(Debug, Clone)]
pub struct ErrorLogRepo {
    db: Database,
}

impl ErrorLogRepo {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Appends an error record.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the insert fails.
    #[instrument(skip(self, record), fields(kind = %record.error_kind, item = record.item_id))]
    pub async fn append(&self, record: &NewErrorRecord) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO error_log (
                session_id, item_id, item_type, error_kind, error_code,
                error_message, stack_trace, retry_count, is_retryable
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(record.session_id)
        .bind(record.item_id)
        .bind(record.item_type.as_str())
        .bind(&record.error_kind)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(&record.stack_trace)
        .bind(record.retry_count)
        .bind(record.is_retryable)
        .fetch_one(self.db.pool())
        .await?;

        Ok(id)
    }

    /// Counts error records for a session.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_for_session(&self, session_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as(r"SELECT COUNT(*) FROM error_log WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(self.db.pool())
                .await?;
        Ok(count)
    }

    /// Returns the most recent error records for a session.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn recent(&self, session_id: i64, limit: i64) -> Result<Vec<ErrorRecord>> {
        let records = sqlx::query_as::<_, ErrorRecord>(
            r"SELECT * FROM error_log WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }
}
