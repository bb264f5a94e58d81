//! Error types for the SQL client engine.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants follow the failure classes the engine distinguishes: connection problems
//! (retried with backoff), statement failures (always carrying the offending SQL),
//! protocol misuse by the caller, and capacity/timeout conditions.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SqlError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Statement failed: {message} (statement: {statement})")]
    Statement {
        message: String,
        statement: String,
        /// e.g., "23505" for a unique violation, when the driver reports one
        sql_state: Option<String>,
    },

    #[error("Expected exactly one record from: {statement}")]
    EmptyResult { statement: String },

    #[error("Misuse: {message}")]
    Misuse { message: String },

    #[error("Timeout: {operation} exceeded {waited_ms}ms")]
    Timeout { operation: String, waited_ms: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SqlError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a statement error for the given SQL text.
    pub fn statement(message: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            statement: statement.into(),
            sql_state: None,
        }
    }

    /// Create a statement error carrying a driver SQLSTATE code.
    pub fn statement_with_state(
        message: impl Into<String>,
        statement: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::Statement {
            message: message.into(),
            statement: statement.into(),
            sql_state,
        }
    }

    /// Create an empty-result error.
    pub fn empty_result(statement: impl Into<String>) -> Self {
        Self::EmptyResult {
            statement: statement.into(),
        }
    }

    /// Create a protocol misuse error.
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, waited_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_ms,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach statement text to an error raised while running it.
    ///
    /// Statement errors that already name a statement keep it; other variants
    /// pass through untouched so connection failures stay retryable.
    pub fn with_statement(self, text: &str) -> Self {
        match self {
            Self::Statement {
                message,
                statement,
                sql_state,
            } if statement.is_empty() => Self::Statement {
                message,
                statement: text.to_string(),
                sql_state,
            },
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// The statement text this error refers to, if any.
    pub fn statement_text(&self) -> Option<&str> {
        match self {
            Self::Statement { statement, .. } | Self::EmptyResult { statement } => {
                Some(statement)
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error reports a caller programming error.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse { .. })
    }
}

/// Convert sqlx errors to SqlError.
#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for SqlError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => SqlError::connection(
                msg.to_string(),
                "Check the database path and connection options",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                SqlError::statement_with_state(db_err.message(), "", code)
            }
            sqlx::Error::RowNotFound => SqlError::empty_result(""),
            sqlx::Error::PoolTimedOut => SqlError::timeout("connection acquire", 0),
            sqlx::Error::PoolClosed => {
                SqlError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => SqlError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file is reachable and writable",
            ),
            sqlx::Error::Tls(tls_err) => SqlError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => SqlError::connection(
                format!("Protocol error: {}", msg),
                "Check database driver compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                SqlError::statement(format!("Column not found: {}", col), "")
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => SqlError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                SqlError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => SqlError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => SqlError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => SqlError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for engine operations.
pub type SqlResult<T> = Result<T, SqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SqlError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_statement_error_carries_text() {
        let err = SqlError::statement("syntax error", "SELEC 1");
        assert_eq!(err.statement_text(), Some("SELEC 1"));
        assert!(err.to_string().contains("SELEC 1"));
    }

    #[test]
    fn test_with_statement_fills_missing_text() {
        let err = SqlError::statement("no such table", "").with_statement("SELECT * FROM t");
        assert_eq!(err.statement_text(), Some("SELECT * FROM t"));

        let err = SqlError::statement("boom", "A").with_statement("B");
        assert_eq!(err.statement_text(), Some("A"));

        let err = SqlError::connection("down", "retry").with_statement("B");
        assert!(err.is_retryable());
        assert_eq!(err.statement_text(), None);
    }

    #[test]
    fn test_error_suggestion() {
        let err = SqlError::connection("refused", "Start the server");
        assert_eq!(err.suggestion(), Some("Start the server"));
        assert_eq!(SqlError::misuse("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(SqlError::timeout("pool checkout", 30).is_retryable());
        assert!(SqlError::connection("err", "sugg").is_retryable());
        assert!(!SqlError::misuse("begin inside transaction").is_retryable());
        assert!(!SqlError::statement("bad", "x").is_retryable());
    }

    #[test]
    fn test_misuse_flag() {
        assert!(SqlError::misuse("nested begin").is_misuse());
        assert!(!SqlError::internal("x").is_misuse());
    }
}
