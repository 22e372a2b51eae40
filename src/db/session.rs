//! Database session handles
//!
//! A DB session's local handle is its slice of the [`ConnectionPool`]:
//! alive while the pool for its key is, closed by closing every pooled
//! connection for the key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::config::DbTarget;
use super::error::DbError;
use super::pool::{ConnectionPool, PooledConnection};
use crate::session::{Activity, LocalHandle, SessionKey};

pub struct DbSession {
    key: SessionKey,
    target: DbTarget,
    pool: Arc<ConnectionPool>,
    activity: Activity,
}

impl DbSession {
    pub fn new(key: SessionKey, target: DbTarget, pool: Arc<ConnectionPool>) -> Self {
        Self {
            key,
            target,
            pool,
            activity: Activity::new(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn target(&self) -> &DbTarget {
        &self.target
    }

    /// Borrow a pooled connection. Concurrent callers get different connections.
    pub async fn acquire(&self) -> Result<PooledConnection, DbError> {
        if self.activity.is_closed() {
            return Err(DbError::Closed);
        }
        self.activity.touch();
        self.pool.acquire(&self.key, &self.target).await
    }
}

#[async_trait]
impl LocalHandle for DbSession {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    async fn is_alive(&self, timeout: Duration) -> bool {
        !self.activity.is_closed() && self.pool.probe(&self.key, timeout).await
    }

    async fn shutdown(&self) {
        let closed = self.pool.close_all(&self.key).await;
        debug!("DB session {} closed {} pooled connections", self.key, closed);
    }
}
