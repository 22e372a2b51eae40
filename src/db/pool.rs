//! Database Connection Pool
//!
//! Bounded set of reusable physical connections per [`SessionKey`].
//!
//! ```text
//! ConnectionPool
//! └── pools: DashMap<SessionKey, KeyPool>
//!     ├── target: DbTarget           (credentials for new connections)
//!     ├── connections: DashMap<id, DbConnection>
//!     └── live: AtomicUsize          (open + being opened, never > cap)
//! ```
//!
//! # Admission
//!
//! `acquire` first scans for an idle connection and claims it with a CAS on
//! its in-use latch. Only when none validates does it reserve a slot by
//! compare-and-increment on `live`; a failed connect gives the slot back.
//! No global lock is taken and the cap holds under any interleaving.
//! Exhaustion fails immediately with [`DbError::PoolExhausted`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::DbTarget;
use super::connection::{DbConnection, DbConnector};
use super::error::DbError;
use crate::config::PoolConfig;
use crate::session::SessionKey;

struct KeyPool {
    target: DbTarget,
    connections: DashMap<String, Arc<DbConnection>>,
    live: AtomicUsize,
    sequence: AtomicU64,
}

impl KeyPool {
    fn new(target: DbTarget) -> Self {
        Self {
            target,
            connections: DashMap::new(),
            live: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Vec<Arc<DbConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Reserve a slot for a new connection
    fn reserve(&self, max: usize) -> Result<(), DbError> {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            if current >= max {
                return Err(DbError::PoolExhausted { current, max });
            }
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{}-{}", Utc::now().timestamp_millis(), seq)
    }

    /// Drop `conn` from the table; only the caller that removed it frees the slot
    fn forget(&self, conn: &DbConnection) -> bool {
        if self.connections.remove(conn.id()).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }
}

/// A borrowed connection. Returns to the pool when dropped.
pub struct PooledConnection {
    key: SessionKey,
    conn: Arc<DbConnection>,
}

impl PooledConnection {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, DbError> {
        self.conn.execute(sql).await
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("id", &self.conn.id())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.conn.unclaim();
    }
}

/// Per-key pool counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPoolStats {
    pub key: SessionKey,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
}

/// Pool-wide counters (monitoring)
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pools: Vec<KeyPoolStats>,
    pub total_connections: usize,
    pub idle_connections: usize,
    pub in_use_connections: usize,
    /// Per-key cap
    pub max_connections_per_session: usize,
}

/// Outcome of one health sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub evicted_invalid: usize,
    pub evicted_idle: usize,
}

pub struct ConnectionPool {
    connector: Arc<dyn DbConnector>,
    config: PoolConfig,
    pools: DashMap<SessionKey, Arc<KeyPool>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn DbConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            pools: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn max(&self) -> usize {
        self.config.max_connections_per_session.max(1)
    }

    fn pool_for(&self, key: &SessionKey) -> Option<Arc<KeyPool>> {
        self.pools.get(key).map(|p| Arc::clone(p.value()))
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.pools.contains_key(key)
    }

    /// Borrow a connection for `key`, reusing an idle one when it validates
    pub async fn acquire(
        &self,
        key: &SessionKey,
        target: &DbTarget,
    ) -> Result<PooledConnection, DbError> {
        let pool = Arc::clone(
            self.pools
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyPool::new(target.clone())))
                .value(),
        );

        for conn in pool.snapshot() {
            if !conn.try_claim() {
                continue;
            }
            if conn.validate(self.config.validation_timeout()).await {
                conn.activity().touch();
                debug!("Reusing connection {} for {}", conn.id(), key);
                return Ok(PooledConnection {
                    key: key.clone(),
                    conn,
                });
            }
            debug!("Discarding invalid connection {} for {}", conn.id(), key);
            pool.forget(&conn);
            conn.close().await;
        }

        let max = self.max();
        if let Err(e) = pool.reserve(max) {
            warn!("Maximum database connections reached for {}", key);
            return Err(e);
        }

        let link = match self.connector.connect(&pool.target).await {
            Ok(link) => link,
            Err(e) => {
                pool.live.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        let conn = Arc::new(DbConnection::new(pool.next_id(), link));
        pool.connections
            .insert(conn.id().to_string(), Arc::clone(&conn));

        // close_all may have run while we were connecting
        let still_registered = self
            .pool_for(key)
            .is_some_and(|current| Arc::ptr_eq(&current, &pool));
        if !still_registered {
            pool.forget(&conn);
            conn.close().await;
            return Err(DbError::Closed);
        }

        info!(
            "Created database connection {} for {} ({}/{})",
            conn.id(),
            key,
            pool.live.load(Ordering::Acquire),
            max
        );
        Ok(PooledConnection {
            key: key.clone(),
            conn,
        })
    }

    /// Return a borrowed connection. Same as dropping the guard.
    pub fn release(&self, conn: PooledConnection) {
        debug!("Returned connection {} for {}", conn.id(), conn.key());
        drop(conn);
    }

    /// Close and drop every connection for `key`
    pub async fn close_all(&self, key: &SessionKey) -> usize {
        let Some((_, pool)) = self.pools.remove(key) else {
            return 0;
        };
        let connections = pool.snapshot();
        for conn in &connections {
            pool.forget(conn);
            conn.close().await;
        }
        if !connections.is_empty() {
            info!("Closed {} database connections for {}", connections.len(), key);
        }
        connections.len()
    }

    /// Close every pool
    pub async fn shutdown(&self) -> usize {
        let keys: Vec<SessionKey> = self.pools.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            closed += self.close_all(&key).await;
        }
        closed
    }

    /// Liveness of the pool behind `key`.
    ///
    /// A borrowed connection counts as alive. An empty pool is alive too,
    /// since `acquire` reopens on demand; only a pool whose every idle
    /// connection fails validation is dead. Idle connections are checked
    /// without claiming them, so a probe never makes `acquire` skip one.
    pub async fn probe(&self, key: &SessionKey, timeout: Duration) -> bool {
        let Some(pool) = self.pool_for(key) else {
            return false;
        };
        let connections = pool.snapshot();
        if connections.is_empty() || connections.iter().any(|c| c.is_in_use()) {
            return true;
        }

        for conn in connections {
            if conn.validate(timeout).await {
                return true;
            }
            // Leave it to whoever claimed it meanwhile; acquire re-validates
            if conn.try_claim() {
                debug!("Evicting invalid connection {} for {}", conn.id(), key);
                pool.forget(&conn);
                conn.close().await;
            }
        }
        false
    }

    /// Health sweep: evict invalid connections, and idle ones past the pool
    /// idle timeout beyond the `min_idle` most recently used
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let pools: Vec<(SessionKey, Arc<KeyPool>)> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (key, pool) in pools {
            let mut idle_valid = Vec::new();
            for conn in pool.snapshot() {
                report.examined += 1;
                if !conn.try_claim() {
                    continue;
                }
                if conn.validate(self.config.validation_timeout()).await {
                    idle_valid.push(conn);
                } else {
                    debug!("Removing invalid connection {} for {}", conn.id(), key);
                    pool.forget(&conn);
                    conn.close().await;
                    report.evicted_invalid += 1;
                }
            }

            // Most recently used first; the head is kept regardless of age
            idle_valid.sort_by_key(|c| std::cmp::Reverse(c.activity().last_accessed()));
            for (index, conn) in idle_valid.into_iter().enumerate() {
                let expired = conn.activity().idle_for() > self.config.idle_timeout();
                if index >= self.config.min_idle && expired {
                    debug!("Removing idle connection {} for {}", conn.id(), key);
                    pool.forget(&conn);
                    conn.close().await;
                    report.evicted_idle += 1;
                } else {
                    conn.unclaim_quiet();
                }
            }
        }

        if report.evicted_invalid + report.evicted_idle > 0 {
            info!(
                "Pool sweep: examined {}, evicted {} invalid / {} idle",
                report.examined, report.evicted_invalid, report.evicted_idle
            );
        }
        report
    }

    pub fn stats_for(&self, key: &SessionKey) -> Option<KeyPoolStats> {
        let pool = self.pool_for(key)?;
        Some(Self::key_stats(key, &pool))
    }

    fn key_stats(key: &SessionKey, pool: &KeyPool) -> KeyPoolStats {
        let connections = pool.snapshot();
        let in_use = connections.iter().filter(|c| c.is_in_use()).count();
        KeyPoolStats {
            key: key.clone(),
            live: connections.len(),
            idle: connections.len() - in_use,
            in_use,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            max_connections_per_session: self.max(),
            ..Default::default()
        };
        for entry in self.pools.iter() {
            let key_stats = Self::key_stats(entry.key(), entry.value());
            stats.total_connections += key_stats.live;
            stats.idle_connections += key_stats.idle;
            stats.in_use_connections += key_stats.in_use;
            stats.pools.push(key_stats);
        }
        stats
    }
}
