//! Database error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unsupported database engine: {0}")]
    UnsupportedEngine(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Connection pool exhausted ({current}/{max})")]
    PoolExhausted { current: usize, max: usize },

    #[error("Connection closed")]
    Closed,
}

/// SQLSTATE class 28: invalid authorization specification
fn is_auth_failure(code: &str) -> bool {
    code.starts_with("28")
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if is_auth_failure(&code) => {
                    DbError::AuthenticationFailed(db.message().to_string())
                }
                _ => DbError::QueryFailed(err.to_string()),
            },
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                DbError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::PoolTimedOut => DbError::Timeout(err.to_string()),
            sqlx::Error::Configuration(_) => DbError::ConnectionFailed(err.to_string()),
            _ => DbError::QueryFailed(err.to_string()),
        }
    }
}
