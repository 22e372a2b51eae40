//! Caller-facing session errors

use thiserror::Error;

use super::store::StoreError;
use crate::db::DbError;
use crate::ssh::SshError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller is not entitled to the resource
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Auth rejected, network unreachable or timeout while connecting
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String, retryable: bool },

    /// Remote host key does not match the trusted one
    #[error("Host trust violation: {0}")]
    HostTrustViolation(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Connection pool exhausted ({current}/{max})")]
    PoolExhausted { current: usize, max: usize },

    #[error("Metadata store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SessionError {
    pub fn connection(message: impl Into<String>, retryable: bool) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Whether the caller may retry the same request after backing off
    pub fn retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { retryable, .. } => *retryable,
            Self::PoolExhausted { .. } | Self::StoreUnavailable(_) => true,
            Self::AccessDenied(_)
            | Self::HostTrustViolation(_)
            | Self::SessionNotFound => false,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::StoreUnavailable(err.to_string())
    }
}

impl From<SshError> for SessionError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::HostKeyChanged { .. } | SshError::HostKeyRejected { .. } => {
                SessionError::HostTrustViolation(err.to_string())
            }
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => {
                SessionError::connection(err.to_string(), false)
            }
            _ => SessionError::connection(err.to_string(), true),
        }
    }
}

impl From<DbError> for SessionError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::PoolExhausted { current, max } => SessionError::PoolExhausted { current, max },
            DbError::AuthenticationFailed(_) | DbError::UnsupportedEngine(_) => {
                SessionError::connection(err.to_string(), false)
            }
            _ => SessionError::connection(err.to_string(), true),
        }
    }
}
