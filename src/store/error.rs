//! Error types for state-store operations.

use thiserror::Error;

/// Errors that can occur during state-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Single-key lookup found no row.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity table name.
        entity: &'static str,
        /// Primary key that was looked up.
        id: i64,
    },

    /// A guarded update matched zero rows because another writer got there
    /// first (the `updated_at` the caller read is stale).
    #[error("concurrent update detected on {entity} {id}")]
    ConcurrentUpdate {
        /// Entity table name.
        entity: &'static str,
        /// Primary key of the contested row.
        id: i64,
    },

    /// A status-conditional transition did not apply because the row is not
    /// in a permitted source state.
    #[error("invalid {entity} transition to {to} for id {id}")]
    InvalidTransition {
        /// Entity table name.
        entity: &'static str,
        /// Primary key of the row.
        id: i64,
        /// Target status that was refused.
        to: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound {
            entity: "sessions",
            id: 7,
        };
        assert_eq!(err.to_string(), "sessions 7 not found");

        let err = StoreError::InvalidTransition {
            entity: "sessions",
            id: 3,
            to: "completed",
        };
        assert!(err.to_string().contains("completed"));
        assert!(err.to_string().contains("3"));
    }
}
