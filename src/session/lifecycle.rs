//! Session Lifecycle Core
//!
//! Shared orchestration behind both session managers. It reconciles the
//! process-local [`LocalRegistry`] with the fleet-wide [`SessionStore`]:
//!
//! ```text
//! absent ──establish──► live (local) ──keepalive elsewhere──► live (remote-owned)
//!   ▲                        │                                      │
//!   └──── release / cleanup ─┴──────────────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! Store writes are last-writer-wins per key. Two processes servicing a
//! keepalive for the same token at the same moment will both mint a token;
//! only the last metadata write is honoured and the other caller gets
//! "session gone" on its next keepalive. No distributed lock is taken.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SessionError;
use super::handle::LocalHandle;
use super::key::{SessionKey, SessionKind};
use super::metadata::{ConnectionAttributes, SessionMetadata, SessionStore};
use super::registry::{LocalRegistry, RegistryStats};
use super::token::{token_hint, TokenCodec};

/// Entitlement check consulted before any connection is opened
pub trait AccessGuard: Send + Sync {
    /// `Err(reason)` denies the request
    fn authorize(&self, key: &SessionKey) -> Result<(), String>;
}

/// Default guard; the real policy lives outside this crate
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessGuard for AllowAll {
    fn authorize(&self, _key: &SessionKey) -> Result<(), String> {
        Ok(())
    }
}

/// Result of a successful `init`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub token: String,
    pub expires_at: i64,
    pub expires_in_ms: i64,
    pub user_id: Uuid,
    pub resource_id: Uuid,
    pub resource_type: String,
}

impl SessionGrant {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id, self.resource_id, self.resource_type.clone())
    }
}

/// Result of a successful `keepalive`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepaliveGrant {
    pub token: String,
    pub expires_at: i64,
    pub expires_in_ms: i64,
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Another pass was already running
    pub skipped: bool,
    pub examined: usize,
    pub evicted_idle: usize,
    pub evicted_dead: usize,
    pub store_failures: usize,
}

impl CleanupReport {
    pub fn evicted(&self) -> usize {
        self.evicted_idle + self.evicted_dead
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictReason {
    Idle,
    Dead,
}

pub struct LifecycleCore<H: LocalHandle> {
    kind: SessionKind,
    instance_id: String,
    idle_timeout: Duration,
    codec: Arc<TokenCodec>,
    store: SessionStore,
    registry: LocalRegistry<H>,
    access: Arc<dyn AccessGuard>,
    /// Single-flight guard for cleanup passes
    sweep: Mutex<()>,
}

impl<H: LocalHandle> LifecycleCore<H> {
    pub fn new(
        instance_id: impl Into<String>,
        idle_timeout: Duration,
        probe_timeout: Duration,
        codec: Arc<TokenCodec>,
        store: SessionStore,
    ) -> Self {
        Self {
            kind: store.kind(),
            instance_id: instance_id.into(),
            idle_timeout,
            codec,
            store,
            registry: LocalRegistry::new(probe_timeout),
            access: Arc::new(AllowAll),
            sweep: Mutex::new(()),
        }
    }

    pub fn with_access_guard(mut self, guard: Arc<dyn AccessGuard>) -> Self {
        self.access = guard;
        self
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &LocalRegistry<H> {
        &self.registry
    }

    // ═══════════════════════════════════════════════════════════════════════
    // init
    // ═══════════════════════════════════════════════════════════════════════

    /// Open a session for `key`, replacing any existing one.
    ///
    /// `connect` runs only after authorization and the forced release of the
    /// previous session. If the store writes fail, the fresh handle is
    /// closed and unregistered before the error is returned.
    pub async fn establish<F, Fut>(
        &self,
        key: SessionKey,
        attributes: ConnectionAttributes,
        connect: F,
    ) -> Result<SessionGrant, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<H>, SessionError>>,
    {
        if !self.kind.accepts(&key) {
            return Err(SessionError::AccessDenied(format!(
                "resource type {} is not a {} session",
                key.resource_type, self.kind
            )));
        }
        self.access
            .authorize(&key)
            .map_err(SessionError::AccessDenied)?;

        self.force_release(&key).await?;

        let handle = connect().await?;
        if let Some(displaced) = self.registry.insert(key.clone(), Arc::clone(&handle)) {
            // A concurrent init for the same key got here first
            warn!("Replacing concurrently registered session {}", key);
            displaced.close().await;
        }

        let issued = self.codec.issue(&key);
        let metadata = SessionMetadata::new(
            key.clone(),
            handle.activity().session_id(),
            issued.token.clone(),
            issued.expires_at,
            self.instance_id.clone(),
            attributes,
        );

        if let Err(e) = self.publish(&issued.token, &metadata).await {
            warn!("Rolling back {} session {}: {}", self.kind, key, e);
            self.registry.remove_if_same(&key, &handle);
            handle.close().await;
            if let Err(cleanup) = self.store.delete_token(&issued.token).await {
                debug!("Token cleanup after failed init also failed: {}", cleanup);
            }
            return Err(e);
        }

        info!(
            "{} session {} established (token {})",
            self.kind,
            key,
            token_hint(&issued.token)
        );

        Ok(SessionGrant {
            expires_in_ms: issued.expires_in_ms(),
            token: issued.token,
            expires_at: issued.expires_at,
            user_id: key.user_id,
            resource_id: key.resource_id,
            resource_type: key.resource_type,
        })
    }

    async fn publish(&self, token: &str, metadata: &SessionMetadata) -> Result<(), SessionError> {
        self.store
            .put_token(token, &metadata.key, self.codec.ttl())
            .await?;
        self.store.put_metadata(metadata, self.idle_timeout).await?;
        Ok(())
    }

    /// Tear down whatever currently exists for `key`, locally and in the store
    async fn force_release(&self, key: &SessionKey) -> Result<(), SessionError> {
        if let Some(handle) = self.registry.remove(key) {
            debug!("Closing previous local session {}", key);
            handle.close().await;
        }
        if let Some(previous) = self.store.metadata(key).await? {
            debug!("Dropping previous session record {}", key);
            self.store.delete_token(&previous.active_token).await?;
            self.store.delete_metadata(key).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // keepalive
    // ═══════════════════════════════════════════════════════════════════════

    /// Rotate `token`. `Ok(None)` means the session is gone.
    pub async fn keepalive(&self, token: &str) -> Result<Option<KeepaliveGrant>, SessionError> {
        let Some(key) = self.codec.validate(token) else {
            self.purge_token(token).await;
            return Ok(None);
        };
        if !self.kind.accepts(&key) {
            return Ok(None);
        }

        let mapped = self.store.token_key(token).await?;
        if mapped.as_ref() != Some(&key) {
            debug!("No live mapping for token {}", token_hint(token));
            self.purge_token(token).await;
            return Ok(None);
        }

        let mut metadata = match self.store.metadata(&key).await? {
            Some(m) if m.active_token == token => m,
            Some(_) => {
                debug!("Token {} superseded for {}", token_hint(token), key);
                self.purge_token(token).await;
                return Ok(None);
            }
            None => {
                debug!("Session {} reaped elsewhere", key);
                self.purge_token(token).await;
                return Ok(None);
            }
        };

        let issued = self.codec.issue(&key);
        metadata.touch(&self.instance_id);
        metadata.active_token = issued.token.clone();
        metadata.expires_at = issued.expires_at;

        // New mapping first: the record never names a token nobody can resolve
        self.store
            .put_token(&issued.token, &key, self.codec.ttl())
            .await?;
        if let Err(e) = self.store.put_metadata(&metadata, self.idle_timeout).await {
            warn!("Keepalive for {} failed, old token stays valid: {}", key, e);
            self.purge_token(&issued.token).await;
            return Err(SessionError::from(e));
        }
        self.purge_token(token).await;

        if let Some(handle) = self.registry.peek(&key) {
            if handle.activity().session_id() != metadata.session_id {
                debug!("Local connection for {} belongs to a superseded session", key);
            } else if self.registry.get(&key).await.is_some() {
                handle.activity().touch();
            } else {
                warn!(
                    "Local connection for {} is dead; record kept until re-established",
                    key
                );
            }
        }

        info!(
            "Rotated token for {} ({} -> {})",
            key,
            token_hint(token),
            token_hint(&issued.token)
        );

        Ok(Some(KeepaliveGrant {
            expires_in_ms: issued.expires_in_ms(),
            token: issued.token,
            expires_at: issued.expires_at,
        }))
    }

    /// Best-effort removal of a dangling token mapping
    async fn purge_token(&self, token: &str) {
        match self.store.delete_token(token).await {
            Ok(true) => debug!("Purged stale token mapping {}", token_hint(token)),
            Ok(false) => {}
            Err(e) => debug!("Could not purge token {}: {}", token_hint(token), e),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // release
    // ═══════════════════════════════════════════════════════════════════════

    /// Release the session behind `token`. Unknown or expired tokens are not an error.
    ///
    /// The token mapping is always dropped. The connection and its record are
    /// torn down only while `token` is still the session's active token, so a
    /// rotated-out token cannot end the session that replaced it.
    pub async fn release(&self, token: &str) -> Result<(), SessionError> {
        let key = match self.codec.validate(token) {
            Some(key) if self.kind.accepts(&key) => key,
            _ => {
                self.store.delete_token(token).await?;
                return Ok(());
            }
        };

        let mapped = self.store.token_key(token).await?;
        self.store.delete_token(token).await?;

        let record = self.store.metadata(&key).await?;
        let current = match &record {
            Some(metadata) => metadata.active_token == token,
            None => mapped.as_ref() == Some(&key),
        };
        if !current {
            debug!(
                "Token {} is not current for {}; session left running",
                token_hint(token),
                key
            );
            return Ok(());
        }

        if let Some(handle) = self.registry.peek(&key) {
            let owned = record
                .as_ref()
                .map_or(true, |m| m.session_id == handle.activity().session_id());
            if owned && self.registry.remove_if_same(&key, &handle) {
                handle.close().await;
            }
        }
        if record.is_some() {
            self.store.delete_metadata(&key).await?;
        }

        info!("{} session {} released", self.kind, key);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // cleanup
    // ═══════════════════════════════════════════════════════════════════════

    /// Evict idle or dead local sessions and mirror the removal into the store.
    ///
    /// Single-flight: a call made while another pass runs returns a skipped report.
    pub async fn cleanup(&self) -> CleanupReport {
        let Ok(_guard) = self.sweep.try_lock() else {
            debug!("{} cleanup already in progress", self.kind);
            return CleanupReport {
                skipped: true,
                ..Default::default()
            };
        };

        let mut report = CleanupReport::default();
        for (key, handle) in self.registry.snapshot() {
            report.examined += 1;
            let Some(reason) = self.eviction_reason(&key, &handle).await else {
                continue;
            };
            // Replaced by a concurrent init in the meantime
            if !self.registry.remove_if_same(&key, &handle) {
                continue;
            }
            handle.close().await;

            match reason {
                EvictReason::Idle => report.evicted_idle += 1,
                EvictReason::Dead => report.evicted_dead += 1,
            }
            info!("Evicted {:?} {} session {}", reason, self.kind, key);

            if let Err(e) = self.purge_record(&key, handle.activity().session_id()).await {
                warn!("Store cleanup for {} failed: {}", key, e);
                report.store_failures += 1;
            }
        }

        if report.evicted() > 0 {
            info!(
                "{} cleanup: examined {}, evicted {} idle / {} dead",
                self.kind, report.examined, report.evicted_idle, report.evicted_dead
            );
        }
        report
    }

    async fn eviction_reason(&self, key: &SessionKey, handle: &Arc<H>) -> Option<EvictReason> {
        let session_id = handle.activity().session_id();
        if handle.activity().idle_for() > self.idle_timeout
            && !self.recent_remote_access(key, session_id).await
        {
            return Some(EvictReason::Idle);
        }
        if !handle.is_alive(self.registry.probe_timeout()).await {
            return Some(EvictReason::Dead);
        }
        None
    }

    /// Whether a keepalive on any process refreshed this session's record within the idle window
    async fn recent_remote_access(&self, key: &SessionKey, session_id: Uuid) -> bool {
        match self.store.metadata(key).await {
            Ok(Some(metadata)) if metadata.session_id == session_id => {
                let idle_ms = Utc::now().timestamp_millis() - metadata.last_accessed_at;
                idle_ms >= 0 && (idle_ms as u128) <= self.idle_timeout.as_millis()
            }
            Ok(_) => false,
            Err(e) => {
                debug!("Metadata read for {} failed during sweep: {}", key, e);
                false
            }
        }
    }

    /// Delete the record of `key` and its token mapping, if the record
    /// still describes `session_id`. A newer session for the key is left alone.
    async fn purge_record(&self, key: &SessionKey, session_id: Uuid) -> Result<(), SessionError> {
        let Some(metadata) = self.store.metadata(key).await? else {
            return Ok(());
        };
        if metadata.session_id != session_id {
            debug!("Record for {} belongs to a newer session; kept", key);
            return Ok(());
        }
        self.store.delete_token(&metadata.active_token).await?;
        self.store.delete_metadata(key).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operational-layer helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Live local handle for `key`, if this process holds one
    pub async fn local_session(&self, key: &SessionKey) -> Option<Arc<H>> {
        self.registry.get(key).await
    }

    /// Record an operation on `key`: touches the local handle and takes
    /// ownership in the metadata record. Returns whether a record existed.
    pub async fn update_access_time(&self, key: &SessionKey) -> Result<bool, SessionError> {
        if let Some(handle) = self.registry.peek(key) {
            handle.activity().touch();
        }
        let Some(mut metadata) = self.store.metadata(key).await? else {
            debug!("No session record to touch for {}", key);
            return Ok(false);
        };
        metadata.touch(&self.instance_id);
        self.store.put_metadata(&metadata, self.idle_timeout).await?;
        Ok(true)
    }

    pub async fn session_metadata(
        &self,
        key: &SessionKey,
    ) -> Result<Option<SessionMetadata>, SessionError> {
        Ok(self.store.metadata(key).await?)
    }

    pub fn has_any_session_for_user(&self, user_id: Uuid) -> bool {
        self.registry.has_user(user_id)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Close every local session and drop its records (best effort)
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for (key, handle) in self.registry.snapshot() {
            if !self.registry.remove_if_same(&key, &handle) {
                continue;
            }
            handle.close().await;
            closed += 1;
            if let Err(e) = self.purge_record(&key, handle.activity().session_id()).await {
                warn!("Could not drop record for {} at shutdown: {}", key, e);
            }
        }
        info!("{} sessions shut down ({} closed)", self.kind, closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handle::Activity;
    use crate::session::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const SECRET: &[u8] = b"lifecycle-test-secret-0123456789";

    struct FakeHandle {
        activity: Activity,
        alive: AtomicBool,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl LocalHandle for FakeHandle {
        fn activity(&self) -> &Activity {
            &self.activity
        }
        async fn is_alive(&self, _timeout: Duration) -> bool {
            !self.activity.is_closed() && self.alive.load(Ordering::SeqCst)
        }
        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake() -> Arc<FakeHandle> {
        Arc::new(FakeHandle {
            activity: Activity::new(),
            alive: AtomicBool::new(true),
            shutdowns: AtomicUsize::new(0),
        })
    }

    fn core(idle: Duration) -> (LifecycleCore<FakeHandle>, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        let store = SessionStore::new(backend.clone(), SessionKind::Ssh, Duration::from_secs(1));
        let codec = Arc::new(TokenCodec::new(SECRET, Duration::from_secs(600)).unwrap());
        (
            LifecycleCore::new("node-a", idle, Duration::from_secs(1), codec, store),
            backend,
        )
    }

    fn attrs() -> ConnectionAttributes {
        ConnectionAttributes::Ssh {
            host: "h".into(),
            port: 22,
            username: "u".into(),
        }
    }

    #[tokio::test]
    async fn test_init_rejects_foreign_kind() {
        let (core, _) = core(Duration::from_secs(60));
        let key = SessionKey::new(Uuid::new_v4(), Uuid::new_v4(), "DB:MYSQL");
        let err = core
            .establish(key, attrs(), || async { Ok(fake()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_access_guard_denial_skips_connect() {
        struct DenyAll;
        impl AccessGuard for DenyAll {
            fn authorize(&self, _key: &SessionKey) -> Result<(), String> {
                Err("not entitled".into())
            }
        }

        let (core, _) = core(Duration::from_secs(60));
        let core = core.with_access_guard(Arc::new(DenyAll));
        let connected = AtomicBool::new(false);
        let err = core
            .establish(SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4()), attrs(), || async {
                connected.store(true, Ordering::SeqCst);
                Ok(fake())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AccessDenied(_)));
        assert!(!connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reinit_replaces_previous_session() {
        let (core, backend) = core(Duration::from_secs(60));
        let key = SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4());
        let first = fake();
        let first_clone = first.clone();
        let g1 = core
            .establish(key.clone(), attrs(), || async move { Ok(first_clone) })
            .await
            .unwrap();
        let g2 = core
            .establish(key.clone(), attrs(), || async { Ok(fake()) })
            .await
            .unwrap();

        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);
        assert!(core.keepalive(&g1.token).await.unwrap().is_none());
        assert!(core.keepalive(&g2.token).await.unwrap().is_some());
        // one token mapping + one metadata record
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_release_with_rotated_out_token_keeps_session() {
        let (core, _) = core(Duration::from_secs(60));
        let key = SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4());
        let handle = fake();
        let h = handle.clone();
        let g1 = core
            .establish(key.clone(), attrs(), || async move { Ok(h) })
            .await
            .unwrap();
        let g2 = core.keepalive(&g1.token).await.unwrap().unwrap();

        core.release(&g1.token).await.unwrap();

        assert_eq!(handle.shutdowns.load(Ordering::SeqCst), 0);
        assert!(core.local_session(&key).await.is_some());
        let g3 = core.keepalive(&g2.token).await.unwrap();
        assert!(g3.is_some());

        core.release(&g3.unwrap().token).await.unwrap();
        assert_eq!(handle.shutdowns.load(Ordering::SeqCst), 1);
        assert!(core.session_metadata(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_after_record_expired_closes_local_handle() {
        let (core, backend) = core(Duration::from_secs(60));
        let key = SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4());
        let handle = fake();
        let h = handle.clone();
        let grant = core
            .establish(key.clone(), attrs(), || async move { Ok(h) })
            .await
            .unwrap();
        core.store().delete_metadata(&key).await.unwrap();

        core.release(&grant.token).await.unwrap();
        assert_eq!(handle.shutdowns.load(Ordering::SeqCst), 1);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_update_access_time_takes_ownership() {
        let (core, _) = core(Duration::from_secs(60));
        let key = SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4());
        core.establish(key.clone(), attrs(), || async { Ok(fake()) })
            .await
            .unwrap();

        let mut meta = core.session_metadata(&key).await.unwrap().unwrap();
        meta.owning_process_id = "node-b".into();
        core.store()
            .put_metadata(&meta, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(core.update_access_time(&key).await.unwrap());
        let meta = core.session_metadata(&key).await.unwrap().unwrap();
        assert_eq!(meta.owning_process_id, "node-a");

        let unknown = SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4());
        assert!(!core.update_access_time(&unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_cleanup_is_single_flight() {
        let (core, _) = core(Duration::from_secs(60));
        let guard = core.sweep.lock().await;
        let report = core.cleanup().await;
        assert!(report.skipped);
        drop(guard);
        assert!(!core.cleanup().await.skipped);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_drops_records() {
        let (core, backend) = core(Duration::from_secs(60));
        let handle = fake();
        let h = handle.clone();
        let user = Uuid::new_v4();
        core.establish(SessionKey::ssh(user, Uuid::new_v4()), attrs(), || async move { Ok(h) })
            .await
            .unwrap();
        assert!(core.has_any_session_for_user(user));

        assert_eq!(core.shutdown().await, 1);
        assert_eq!(handle.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!core.has_any_session_for_user(user));
        assert!(backend.is_empty());
    }
}
