//! Centralized error handling.
//!
//! Provides a unified error type for the data-access layer. Cache misses are
//! not errors (they are `Option::None`); the variants below are reserved for
//! conditions a caller has to react to.

use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::DbErr;
use thiserror::Error;

/// Driver messages that indicate the operation may succeed if retried.
static TRANSIENT_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)deadlock|could not serialize|serialization failure|lock wait timeout|connection (reset|refused|closed)|broken pipe|server closed the connection",
    )
    .expect("transient error pattern is valid")
});

/// Data-access error types
/// SOLID - Open/Closed: Extend via new variants without modifying behavior
#[derive(Error, Debug)]
pub enum DataError {
    // Connectivity
    #[error("{database} connection error during {operation} (retries: {retries}): {message}")]
    Connection {
        database: String,
        operation: String,
        retries: u32,
        message: String,
    },

    // Cache
    #[error("cache error during {operation}: {message}")]
    Cache { operation: String, message: String },

    // Transactions
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<DataError>>,
    },

    #[error("unit of work misuse: {0}")]
    UnitOfWork(String),

    #[error("{entity} {id} was modified concurrently (expected version {expected_version})")]
    Concurrency {
        entity: String,
        id: String,
        expected_version: i64,
    },

    // External library errors
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Input
    #[error("{0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias
pub type DataResult<T> = Result<T, DataError>;

impl DataError {
    /// Stable error code for logs and operator tooling
    pub fn code(&self) -> &'static str {
        match self {
            DataError::Connection { .. } => "CONNECTION_ERROR",
            DataError::Cache { .. } => "CACHE_ERROR",
            DataError::Transaction { .. } => "TRANSACTION_ERROR",
            DataError::UnitOfWork(_) => "UNIT_OF_WORK_ERROR",
            DataError::Concurrency { .. } => "CONCURRENCY_ERROR",
            DataError::Database(_) => "DATABASE_ERROR",
            DataError::Serialization(_) => "SERIALIZATION_ERROR",
            DataError::Validation(_) => "VALIDATION_ERROR",
            DataError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether retrying the failed operation in a fresh transaction may succeed.
    ///
    /// Optimistic-version conflicts are deliberately not transient: they are
    /// surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            DataError::Connection { .. } => true,
            DataError::Database(err) => is_transient_db_error(err),
            DataError::Transaction {
                source: Some(source),
                ..
            } => source.is_transient(),
            _ => false,
        }
    }
}

fn is_transient_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        other => TRANSIENT_MESSAGE.is_match(&other.to_string()),
    }
}

/// Convenience constructors
impl DataError {
    pub fn connection(
        database: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        DataError::Connection {
            database: database.into(),
            operation: operation.into(),
            retries: 0,
            message: message.into(),
        }
    }

    pub fn cache(operation: impl Into<String>, message: impl Into<String>) -> Self {
        DataError::Cache {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        DataError::Transaction {
            message: message.into(),
            source: None,
        }
    }

    pub fn transaction_caused_by(message: impl Into<String>, cause: DataError) -> Self {
        DataError::Transaction {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn unit_of_work(msg: impl Into<String>) -> Self {
        DataError::UnitOfWork(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DataError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DataError::Config(msg.into())
    }

    /// Attach the retry count to a connection error; other variants pass through.
    pub fn with_retries(self, count: u32) -> Self {
        match self {
            DataError::Connection {
                database,
                operation,
                message,
                ..
            } => DataError::Connection {
                database,
                operation,
                retries: count,
                message,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_transient() {
        let err = DataError::connection("postgres", "get_session", "pool exhausted");
        assert!(err.is_transient());
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_deadlock_message_is_transient() {
        let err = DataError::Database(DbErr::Exec(sea_orm::RuntimeErr::Internal(
            "ERROR: deadlock detected".to_string(),
        )));
        assert!(err.is_transient());
    }

    #[test]
    fn test_concurrency_conflict_is_not_transient() {
        let err = DataError::Concurrency {
            entity: "orders".to_string(),
            id: "7".to_string(),
            expected_version: 3,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transaction_error_inherits_transience_from_cause() {
        let cause = DataError::connection("postgres", "commit", "connection reset");
        let err = DataError::transaction_caused_by("commit failed", cause);
        assert!(err.is_transient());
        assert!(!DataError::transaction("timed out").is_transient());
    }

    #[test]
    fn test_with_retries_sets_count() {
        let err = DataError::connection("postgres", "reconnect", "refused").with_retries(3);
        match err {
            DataError::Connection { retries, .. } => assert_eq!(retries, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
