//! Failures raised while connecting to or preparing the inventory database.
//!
//! Row-level reads and writes surface `sqlx::Error` directly; the
//! reconciliation store decides which of those to retry via [`is_transient`].

use thiserror::Error;

/// Errors from pool setup and schema migration.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool could not open or hand out a connection.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// An embedded migration did not apply; the worker refuses to start.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),
}

impl DbError {
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_))
    }

    /// Whether waiting and reconnecting could clear this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::ConnectionFailed(_) => true,
            DbError::QueryFailed(err) => is_transient(err),
            DbError::MigrationFailed(_) => false,
        }
    }
}

/// Whether a failed statement may succeed if simply re-issued.
///
/// Covers pool exhaustion, I/O failures, serialization failures (`40001`)
/// and deadlocks (`40P01`). A snapshot replace or canonical batch hitting one
/// of these is retried by the store with backoff.
#[must_use]
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbError::ConnectionFailed(err)
            }
            other => DbError::QueryFailed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_maps_to_connection_error() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_connection_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::PoolClosed));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_row_not_found_is_a_permanent_query_error() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::QueryFailed(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("Query failed: "));
    }
}
