use sea_orm::DbErr;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from sea-orm.
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// Record not found.
    #[error("Not found: {context}")]
    NotFound { context: String },

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn subject_not_found(id: i64) -> Self {
        Self::NotFound {
            context: format!("subject id={id}"),
        }
    }

    pub fn activity_not_found(id: i64) -> Self {
        Self::NotFound {
            context: format!("activity id={id}"),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(db_err) => is_retryable_db_error(db_err),
            _ => false,
        }
    }
}

fn is_retryable_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let err_str = err.to_string().to_lowercase();
            // SQLite reports lock contention as "database is locked" / "busy"
            err_str.contains("locked")
                || err_str.contains("busy")
                || err_str.contains("timeout")
                || err_str.contains("temporarily unavailable")
        }
        _ => false,
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::RuntimeErr;

    #[test]
    fn not_found_messages_carry_id() {
        let msg = StoreError::activity_not_found(42).to_string();
        assert!(msg.contains("Not found"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn locked_database_is_retryable() {
        let err = StoreError::Database(DbErr::Exec(RuntimeErr::Internal(
            "database is locked".to_string(),
        )));
        assert!(err.is_retryable());
    }

    #[test]
    fn record_not_found_is_not_retryable() {
        let err = StoreError::Database(DbErr::RecordNotFound("x".to_string()));
        assert!(!err.is_retryable());
        assert!(!StoreError::subject_not_found(1).is_retryable());
    }
}
