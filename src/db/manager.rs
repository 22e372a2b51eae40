//! DB Session Manager
//!
//! Same lifecycle as SSH sessions, with the [`ConnectionPool`] standing in
//! for the single connection. Sessions are addressed by connection alias.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use super::config::DbTarget;
use super::connection::{DbConnector, SqlxConnector};
use super::pool::{ConnectionPool, PoolStats, PooledConnection};
use super::session::DbSession;
use crate::config::DbSettings;
use crate::session::{
    spawn_periodic, AccessGuard, CleanupReport, ConnectionAttributes, KeepaliveGrant,
    LifecycleCore, MetadataStore, PeriodicTask, RegistryStats, SessionError, SessionGrant,
    SessionKey, SessionKind, SessionMetadata, SessionStore, TokenCodec,
};

pub struct DbSessionManager {
    core: LifecycleCore<DbSession>,
    pool: Arc<ConnectionPool>,
}

impl DbSessionManager {
    pub fn new(core: LifecycleCore<DbSession>, pool: Arc<ConnectionPool>) -> Self {
        Self { core, pool }
    }

    /// Production wiring: sqlx connector behind the configured pool
    pub fn from_settings(
        settings: &DbSettings,
        instance_id: &str,
        codec: Arc<TokenCodec>,
        backend: Arc<dyn MetadataStore>,
        store_timeout: Duration,
    ) -> Self {
        let connector: Arc<dyn DbConnector> =
            Arc::new(SqlxConnector::new(settings.connect_timeout()));
        let pool = Arc::new(ConnectionPool::new(connector, settings.pool.clone()));

        let store = SessionStore::new(backend, SessionKind::Db, store_timeout);
        let core = LifecycleCore::new(
            instance_id,
            settings.idle_timeout(),
            settings.probe_timeout(),
            codec,
            store,
        );

        info!(
            "DB session manager ready (pool cap {}, idle {:?})",
            settings.pool.max_connections_per_session,
            settings.idle_timeout()
        );
        Self::new(core, pool)
    }

    pub fn with_access_guard(mut self, guard: Arc<dyn AccessGuard>) -> Self {
        self.core = self.core.with_access_guard(guard);
        self
    }

    pub fn core(&self) -> &LifecycleCore<DbSession> {
        &self.core
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Open a database session for `user_id` on the connection named `alias`.
    ///
    /// One pooled connection is opened and returned to the pool straight
    /// away, so a bad target fails here rather than on first use.
    pub async fn init(
        &self,
        user_id: Uuid,
        alias: &str,
        target: DbTarget,
    ) -> Result<SessionGrant, SessionError> {
        target.engine.ensure_supported()?;

        let key = SessionKey::from_alias(user_id, alias, target.engine.resource_type());
        let attributes = ConnectionAttributes::Db {
            engine: target.engine.as_str().to_string(),
            host: target.host.clone(),
            port: target.port(),
            database: target.database.clone(),
            username: target.username.clone(),
        };

        let pool = Arc::clone(&self.pool);
        let session_key = key.clone();
        self.core
            .establish(key, attributes, move || async move {
                let session = DbSession::new(session_key.clone(), target, Arc::clone(&pool));
                match session.acquire().await {
                    Ok(conn) => pool.release(conn),
                    Err(e) => {
                        pool.close_all(&session_key).await;
                        return Err(SessionError::from(e));
                    }
                }
                Ok(Arc::new(session))
            })
            .await
    }

    pub async fn keepalive(&self, token: &str) -> Result<Option<KeepaliveGrant>, SessionError> {
        self.core.keepalive(token).await
    }

    /// Release the session; closing the local handle closes its pool
    pub async fn release(&self, token: &str) -> Result<(), SessionError> {
        self.core.release(token).await
    }

    /// Borrow a pooled connection of the live local session for `key`
    pub async fn acquire(&self, key: &SessionKey) -> Result<PooledConnection, SessionError> {
        let session = self
            .core
            .local_session(key)
            .await
            .ok_or(SessionError::SessionNotFound)?;
        Ok(session.acquire().await?)
    }

    pub async fn local_session(&self, key: &SessionKey) -> Option<Arc<DbSession>> {
        self.core.local_session(key).await
    }

    pub async fn update_access_time(&self, key: &SessionKey) -> Result<bool, SessionError> {
        self.core.update_access_time(key).await
    }

    pub async fn session_metadata(
        &self,
        key: &SessionKey,
    ) -> Result<Option<SessionMetadata>, SessionError> {
        self.core.session_metadata(key).await
    }

    pub fn has_any_session_for_user(&self, user_id: Uuid) -> bool {
        self.core.has_any_session_for_user(user_id)
    }

    pub async fn cleanup(&self) -> CleanupReport {
        self.core.cleanup().await
    }

    pub fn stats(&self) -> RegistryStats {
        self.core.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Periodic session cleanup, one pass per idle timeout
    pub fn spawn_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let manager = Arc::clone(self);
        spawn_periodic("db-session-cleanup", self.core.idle_timeout(), move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.cleanup().await;
            }
        })
    }

    /// Periodic pool health sweep
    pub fn spawn_pool_health(self: &Arc<Self>) -> PeriodicTask {
        let pool = Arc::clone(&self.pool);
        let period = pool.config().health_check_interval();
        spawn_periodic("db-pool-health", period, move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.sweep().await;
            }
        })
    }

    pub async fn shutdown(&self) -> usize {
        let closed = self.core.shutdown().await;
        let stragglers = self.pool.shutdown().await;
        if stragglers > 0 {
            warn!("Closed {} pooled connections with no session", stragglers);
        }
        closed
    }
}
