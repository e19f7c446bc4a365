//! Error types for CashHandle

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Identity provider error: {0}")]
    IdentityError(String),
    #[error("Chain error: {0}")]
    ChainError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
}

impl StoreError {
    /// The message without the variant prefix, suitable for API clients.
    pub fn message(&self) -> &str {
        match self {
            StoreError::DatabaseError(msg)
            | StoreError::NotFound(msg)
            | StoreError::InvalidInput(msg)
            | StoreError::Conflict(msg)
            | StoreError::InsufficientBalance(msg)
            | StoreError::Forbidden(msg)
            | StoreError::IdentityError(msg)
            | StoreError::ChainError(msg)
            | StoreError::CryptoError(msg)
            | StoreError::ConfigError(msg)
            | StoreError::IoError(msg) => msg,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            other => StoreError::DatabaseError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidInput(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (k TEXT PRIMARY KEY)", []).unwrap();
        conn.execute("INSERT INTO t (k) VALUES ('a')", []).unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO t (k) VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn message_strips_prefix() {
        let err = StoreError::NotFound("Token not found".to_string());
        assert_eq!(err.message(), "Token not found");
        assert_eq!(err.to_string(), "Not found: Token not found");
    }
}
