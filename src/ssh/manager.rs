//! SSH Session Manager
//!
//! Lifecycle of brokered shell sessions: host trust + connector on the way
//! in, the shared [`LifecycleCore`] for everything after.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::client::{HostKeyGate, HostKeyPrompt, RusshConnector, SshConnector};
use super::config::SshTarget;
use super::known_hosts::HostTrustStore;
use super::shell::ShellSession;
use crate::config::SshSettings;
use crate::session::{
    spawn_periodic, AccessGuard, CleanupReport, ConnectionAttributes, KeepaliveGrant,
    LifecycleCore, MetadataStore, PeriodicTask, RegistryStats, SessionError, SessionGrant,
    SessionKey, SessionKind, SessionMetadata, SessionStore, TokenCodec,
};
use crate::state::HostKeyStoreError;

pub struct SshSessionManager {
    core: LifecycleCore<ShellSession>,
    connector: Arc<dyn SshConnector>,
    trust: Arc<HostTrustStore>,
}

impl SshSessionManager {
    pub fn new(
        core: LifecycleCore<ShellSession>,
        connector: Arc<dyn SshConnector>,
        trust: Arc<HostTrustStore>,
    ) -> Self {
        Self {
            core,
            connector,
            trust,
        }
    }

    /// Production wiring: russh connector gated by the configured host key policy
    pub fn from_settings(
        settings: &SshSettings,
        instance_id: &str,
        codec: Arc<TokenCodec>,
        backend: Arc<dyn MetadataStore>,
        store_timeout: std::time::Duration,
        prompt: Option<Arc<dyn HostKeyPrompt>>,
    ) -> Result<Self, HostKeyStoreError> {
        let trust = Arc::new(match &settings.known_hosts_db {
            Some(path) => HostTrustStore::open(path)?,
            None => HostTrustStore::in_memory(),
        });
        let gate = HostKeyGate::new(trust.clone(), settings.host_key_policy, prompt);
        let connector = Arc::new(RusshConnector::new(gate, settings.connect_timeout()));

        let store = SessionStore::new(backend, SessionKind::Ssh, store_timeout);
        let core = LifecycleCore::new(
            instance_id,
            settings.idle_timeout(),
            settings.probe_timeout(),
            codec,
            store,
        );

        info!(
            "SSH session manager ready (policy {:?}, idle {:?})",
            settings.host_key_policy,
            settings.idle_timeout()
        );
        Ok(Self::new(core, connector, trust))
    }

    pub fn with_access_guard(mut self, guard: Arc<dyn AccessGuard>) -> Self {
        self.core = self.core.with_access_guard(guard);
        self
    }

    pub fn core(&self) -> &LifecycleCore<ShellSession> {
        &self.core
    }

    pub fn trust_store(&self) -> &Arc<HostTrustStore> {
        &self.trust
    }

    /// Open a shell session to `server_id` for `user_id`
    pub async fn init(
        &self,
        user_id: Uuid,
        server_id: Uuid,
        target: SshTarget,
    ) -> Result<SessionGrant, SessionError> {
        let key = SessionKey::ssh(user_id, server_id);
        let attributes = ConnectionAttributes::Ssh {
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
        };

        let connector = Arc::clone(&self.connector);
        let session_key = key.clone();
        self.core
            .establish(key, attributes, move || async move {
                let transport = connector.connect(user_id, &target).await?;
                Ok(Arc::new(ShellSession::new(
                    session_key,
                    target.host,
                    target.port,
                    target.username,
                    transport,
                )))
            })
            .await
    }

    pub async fn keepalive(&self, token: &str) -> Result<Option<KeepaliveGrant>, SessionError> {
        self.core.keepalive(token).await
    }

    pub async fn release(&self, token: &str) -> Result<(), SessionError> {
        self.core.release(token).await
    }

    pub async fn local_session(&self, key: &SessionKey) -> Option<Arc<ShellSession>> {
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

    /// Periodic cleanup, one pass per idle timeout
    pub fn spawn_cleanup(self: &Arc<Self>) -> PeriodicTask {
        let manager = Arc::clone(self);
        spawn_periodic("ssh-session-cleanup", self.core.idle_timeout(), move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.cleanup().await;
            }
        })
    }

    pub async fn shutdown(&self) -> usize {
        self.core.shutdown().await
    }
}
