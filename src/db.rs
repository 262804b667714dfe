//! SQLite-backed state database.
//!
//! The sync engine leans on three SQLite behaviours, so they are set as
//! typed connection options rather than left to defaults:
//!
//! - **Foreign keys** must be enforced on every connection. Sessions own
//!   folders and files through `ON DELETE CASCADE`; without the pragma,
//!   dropping a session would strand its whole subtree.
//! - **WAL journaling** lets progress readers (status queries, the
//!   completion checker) run alongside the writer transactions that
//!   record completions.
//! - **A busy timeout** absorbs short write contention between the
//!   walker's batch inserts and worker completion transactions instead
//!   of surfacing `SQLITE_BUSY` to callers.
//!
//! Migrations are embedded and applied on open, so a database file from
//! an older run is upgraded before the engine touches it.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use thiserror::Error;
use tracing::instrument;

/// Connections in the pool. SQLite serializes writers anyway, so a small
/// pool covers the engine's loops without piling up lock waiters.
const POOL_SIZE: u32 = 5;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures opening or migrating the state database.
#[derive(Error, Debug)]
pub enum DbError {
    /// The database could not be opened or a connection failed.
    #[error("cannot open state database: {0}")]
    Open(#[from] sqlx::Error),

    /// The embedded schema migrations did not apply cleanly.
    #[error("schema migration failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the state database.
///
/// Cheap to clone; all clones share one pool. Repositories in
/// [`crate::store`] borrow the pool through [`Database::pool`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the state database at `db_path` and
    /// applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the file cannot be opened or
    /// [`DbError::Schema`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        Self::open(options, POOL_SIZE).await
    }

    /// Opens a private in-memory database for tests.
    ///
    /// A single connection keeps the whole database alive for the
    /// handle's lifetime; WAL is pointless without a file, so the only
    /// option carried over is foreign-key enforcement — cascade behaviour
    /// must match production.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] or [`DbError::Schema`] as for
    /// [`Database::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        Self::open(options, 1).await
    }

    async fn open(options: SqliteConnectOptions, pool_size: u32) -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// The shared connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection. Call on shutdown; the handle is unusable
    /// afterwards.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn seeded() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO sessions (root_folder_id, destination_path) VALUES ('root', '/d')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO folders (remote_id, session_id, name, path) VALUES ('f1', 1, 'a', 'a')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_open_applies_schema() {
        let db = Database::new_in_memory().await.unwrap();

        // The sessions table only exists if migrations ran.
        let result = sqlx::query(
            "INSERT INTO sessions (root_folder_id, destination_path) VALUES ('root', '/tmp/dest')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_ok(), "migrated schema should accept a session row");
    }

    #[tokio::test]
    async fn test_wal_enabled_for_file_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("state.db")).await.unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_status_check_constraint_rejects_unknown_values() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO sessions (root_folder_id, destination_path, status)
             VALUES ('root', '/tmp/dest', 'bogus')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err(), "unknown status must violate the CHECK");
    }

    #[tokio::test]
    async fn test_session_delete_cascades_to_folders_and_files() {
        let db = seeded().await;
        sqlx::query(
            "INSERT INTO files (remote_id, folder_id, session_id, name, path)
             VALUES ('x1', 1, 1, 'x', 'a/x')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        sqlx::query("DELETE FROM sessions WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();

        for table in ["folders", "files"] {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} rows must cascade with their session");
        }
    }

    #[tokio::test]
    async fn test_duplicate_remote_id_within_session_rejected() {
        let db = seeded().await;

        let dup = sqlx::query(
            "INSERT INTO folders (remote_id, session_id, name, path) VALUES ('f1', 1, 'b', 'b')",
        )
        .execute(db.pool())
        .await;
        assert!(dup.is_err(), "(remote_id, session_id) must be unique");
    }

    #[tokio::test]
    async fn test_pending_downloads_view_orders_by_size() {
        let db = seeded().await;
        for (remote, size) in [("big", 5000), ("small", 10), ("mid", 500)] {
            sqlx::query(
                "INSERT INTO files (remote_id, folder_id, session_id, name, path, size)
                 VALUES (?, 1, 1, ?, ?, ?)",
            )
            .bind(remote)
            .bind(remote)
            .bind(format!("a/{remote}"))
            .bind(size)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pending_downloads")
            .fetch_all(db.pool())
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, ["small", "mid", "big"]);
    }

    #[tokio::test]
    async fn test_close_releases_the_pool() {
        let db = Database::new_in_memory().await.unwrap();
        db.close().await;
    }
}
