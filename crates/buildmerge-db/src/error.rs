//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for buildmerge_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => buildmerge_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => buildmerge_core::Error::Conflict(msg),
            DbError::Decode(msg) => buildmerge_core::Error::Internal(msg),
            _ => buildmerge_core::Error::Store(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmerge_core::Error;

    #[test]
    fn test_corrupt_rows_are_internal_and_not_retried() {
        let err = Error::from(DbError::Decode("property 'platform': expected a pair".to_string()));
        assert_eq!(err, Error::Internal("property 'platform': expected a pair".to_string()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_database_failures_are_retryable_store_errors() {
        let err = Error::from(DbError::Database(sqlx::Error::PoolTimedOut));
        assert!(matches!(err, Error::Store(_)));
        assert!(err.is_retryable());

        let err = Error::from(DbError::Duplicate("buildset".to_string()));
        assert_eq!(err, Error::Conflict("buildset".to_string()));
        assert!(!err.is_retryable());
    }
}
