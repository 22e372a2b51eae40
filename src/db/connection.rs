//! Database connections
//!
//! [`DbConnector`] opens one physical connection per call, with no retries.
//! [`DbConnection`] is the pool's view of it: an id, an in-use latch and
//! activity timestamps around a boxed [`DbLink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::config::{DbEngine, DbTarget};
use super::error::DbError;
use crate::session::Activity;

/// One live physical connection
#[async_trait]
pub trait DbLink: Send {
    async fn ping(&mut self) -> Result<(), DbError>;

    /// Run one statement, returning the affected row count
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError>;

    async fn close(&mut self);
}

/// Opens database connections
#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self, target: &DbTarget) -> Result<Box<dyn DbLink>, DbError>;
}

enum Backend {
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

/// sqlx-backed link. MariaDB goes through the MySQL driver.
pub struct SqlxLink {
    backend: Option<Backend>,
}

#[async_trait]
impl DbLink for SqlxLink {
    async fn ping(&mut self) -> Result<(), DbError> {
        match self.backend.as_mut() {
            Some(Backend::Postgres(conn)) => conn.ping().await?,
            Some(Backend::MySql(conn)) => conn.ping().await?,
            None => return Err(DbError::Closed),
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        let affected = match self.backend.as_mut() {
            Some(Backend::Postgres(conn)) => {
                sqlx::query(sql).execute(&mut *conn).await?.rows_affected()
            }
            Some(Backend::MySql(conn)) => {
                sqlx::query(sql).execute(&mut *conn).await?.rows_affected()
            }
            None => return Err(DbError::Closed),
        };
        Ok(affected)
    }

    async fn close(&mut self) {
        let result = match self.backend.take() {
            Some(Backend::Postgres(conn)) => conn.close().await,
            Some(Backend::MySql(conn)) => conn.close().await,
            None => return,
        };
        if let Err(e) = result {
            debug!("Database connection did not close cleanly: {}", e);
        }
    }
}

pub struct SqlxConnector {
    connect_timeout: Duration,
}

impl SqlxConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, target: &DbTarget) -> Result<Backend, DbError> {
        match target.engine {
            DbEngine::PostgreSql => {
                let options = PgConnectOptions::new()
                    .host(&target.host)
                    .port(target.port())
                    .username(&target.username)
                    .password(&target.password)
                    .database(&target.database)
                    .ssl_mode(if target.ssl_enabled {
                        PgSslMode::Prefer
                    } else {
                        PgSslMode::Disable
                    });
                Ok(Backend::Postgres(PgConnection::connect_with(&options).await?))
            }
            DbEngine::MySql | DbEngine::MariaDb => {
                let options = MySqlConnectOptions::new()
                    .host(&target.host)
                    .port(target.port())
                    .username(&target.username)
                    .password(&target.password)
                    .database(&target.database)
                    .ssl_mode(if target.ssl_enabled {
                        MySqlSslMode::Preferred
                    } else {
                        MySqlSslMode::Disabled
                    });
                Ok(Backend::MySql(MySqlConnection::connect_with(&options).await?))
            }
            DbEngine::SqlServer => Err(DbError::UnsupportedEngine(
                target.engine.as_str().to_string(),
            )),
        }
    }
}

#[async_trait]
impl DbConnector for SqlxConnector {
    async fn connect(&self, target: &DbTarget) -> Result<Box<dyn DbLink>, DbError> {
        target.engine.ensure_supported()?;
        info!(
            "Connecting to {} at {}:{}/{} as {}",
            target.engine,
            target.host,
            target.port(),
            target.database,
            target.username
        );

        let backend = tokio::time::timeout(self.connect_timeout, self.open(target))
            .await
            .map_err(|_| {
                DbError::Timeout(format!(
                    "connection to {}:{} timed out after {:?}",
                    target.host,
                    target.port(),
                    self.connect_timeout
                ))
            })??;

        Ok(Box::new(SqlxLink {
            backend: Some(backend),
        }))
    }
}

/// A pooled physical connection
pub struct DbConnection {
    id: String,
    link: Mutex<Option<Box<dyn DbLink>>>,
    in_use: AtomicBool,
    activity: Activity,
}

impl DbConnection {
    /// New connections start claimed by their creator
    pub fn new(id: impl Into<String>, link: Box<dyn DbLink>) -> Self {
        Self {
            id: id.into(),
            link: Mutex::new(Some(link)),
            in_use: AtomicBool::new(true),
            activity: Activity::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.activity.is_closed()
    }

    /// Take exclusive use. Fails if someone else holds it or it is closed.
    pub fn try_claim(&self) -> bool {
        !self.is_closed()
            && self
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Hand the connection back as idle
    pub fn unclaim(&self) {
        self.activity.touch();
        self.in_use.store(false, Ordering::Release);
    }

    /// Hand back after a health check, leaving the idle clock running
    pub fn unclaim_quiet(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Ping bounded by `timeout`
    pub async fn validate(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let check = async {
            let mut link = self.link.lock().await;
            match link.as_mut() {
                Some(link) => link.ping().await,
                None => Err(DbError::Closed),
            }
        };
        match tokio::time::timeout(timeout, check).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Connection {} failed validation: {}", self.id, e);
                false
            }
            Err(_) => {
                debug!("Connection {} validation timed out", self.id);
                false
            }
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, DbError> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        self.activity.touch();
        let mut link = self.link.lock().await;
        match link.as_mut() {
            Some(link) => link.execute(sql).await,
            None => Err(DbError::Closed),
        }
    }

    /// Idempotent
    pub async fn close(&self) {
        if !self.activity.mark_closed() {
            return;
        }
        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            link.close().await;
        }
        debug!("Closed database connection {}", self.id);
    }
}
