//! Durable state store for sessions, folders, files, and their satellites.
//!
//! Every entity gets a typed repository over the shared SQLite pool. All
//! multi-row invariants (completing a file and bumping its session's
//! counters, resetting failures on resume) run inside a single transaction;
//! the store's transaction isolation is the ordering authority for
//! observable counters.
//!
//! # Example
//!
//! ```ignore
//! use cloudpull_core::store::StateStore;
//! use cloudpull_core::Database;
//!
//! let db = Database::new_in_memory().await?;
//! let store = StateStore::new(db);
//! let session = store.sessions().create("root", "My Drive", "/mnt/mirror").await?;
//! ```

mod chunk;
mod error;
mod error_log;
mod file;
mod folder;
mod session;
mod settings;

pub use chunk::{ChunkRepo, ChunkStatus, DownloadChunk};
pub use error::StoreError;
pub use error_log::{ErrorLogRepo, ErrorRecord, ItemType, NewErrorRecord};
pub use file::{BatchInsert, FileRecord, FileRepo, FileStatus, NewFile};
pub use folder::{Folder, FolderRepo, FolderStatus, NewFolder};
pub use session::{ProgressDelta, Session, SessionRepo, SessionStatus};
pub use settings::SettingsRepo;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise the given
/// not-found error.
fn check_affected(entity: &'static str, id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::NotFound { entity, id })
    } else {
        Ok(())
    }
}

/// Facade over the per-entity repositories.
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Creates a state store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Session repository.
    #[must_use]
    pub fn sessions(&self) -> SessionRepo {
        SessionRepo::new(self.db.clone())
    }

    /// Folder repository.
    #[must_use]
    pub fn folders(&self) -> FolderRepo {
        FolderRepo::new(self.db.clone())
    }

    /// File repository.
    #[must_use]
    pub fn files(&self) -> FileRepo {
        FileRepo::new(self.db.clone())
    }

    /// Download-chunk repository (advisory range plans).
    #[must_use]
    pub fn chunks(&self) -> ChunkRepo {
        ChunkRepo::new(self.db.clone())
    }

    /// Error-log repository.
    #[must_use]
    pub fn errors(&self) -> ErrorLogRepo {
        ErrorLogRepo::new(self.db.clone())
    }

    /// Cross-run key/value settings repository.
    #[must_use]
    pub fn settings(&self) -> SettingsRepo {
        SettingsRepo::new(self.db.clone())
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }
}
