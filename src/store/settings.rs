//! Cross-run key/value settings.

use tracing::instrument;

use super::Result;
use crate::db::Database;

/// Repository for the `config` key/value table.
#[derive(Debug, Clone)]
pub struct SettingsRepo {
    db: Database,
}

impl SettingsRepo {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Sets a key, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the write fails.
    #[instrument(skip(self, value))]
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO config (key, value, updated_at)
              VALUES (?, ?, datetime('now'))
              ON CONFLICT (key) DO UPDATE
                  SET value = excluded.value, updated_at = datetime('now')",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Gets a key's value, or `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as(r"SELECT value FROM config WHERE key = ?")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(v,)| v))
    }
}
