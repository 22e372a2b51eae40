//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{SshAuth, SshTarget};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostKey, HostKeyStatus, HostTrustStore};
use super::shell::ShellTransport;
use crate::config::HostKeyPolicy;

/// Interactive confirmation for unknown host keys (`prompt` policy)
#[async_trait]
pub trait HostKeyPrompt: Send + Sync {
    /// `true` trusts and remembers the key
    async fn confirm(&self, user_id: Uuid, host: &str, port: u16, key: &HostKey) -> bool;
}

/// Opens one live shell transport. No retries.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        user_id: Uuid,
        target: &SshTarget,
    ) -> Result<Box<dyn ShellTransport>, SshError>;
}

/// Decides whether a presented host key may be used
#[derive(Clone)]
pub struct HostKeyGate {
    trust: Arc<HostTrustStore>,
    policy: HostKeyPolicy,
    prompt: Option<Arc<dyn HostKeyPrompt>>,
}

impl HostKeyGate {
    pub fn new(
        trust: Arc<HostTrustStore>,
        policy: HostKeyPolicy,
        prompt: Option<Arc<dyn HostKeyPrompt>>,
    ) -> Self {
        Self {
            trust,
            policy,
            prompt,
        }
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    pub fn trust_store(&self) -> &Arc<HostTrustStore> {
        &self.trust
    }

    /// `Ok(())` admits the key. A changed key is rejected under every policy.
    pub async fn admit(
        &self,
        user_id: Uuid,
        host: &str,
        port: u16,
        key: &HostKey,
    ) -> Result<(), SshError> {
        match self.trust.check(user_id, host, port, key) {
            HostKeyStatus::Ok => {
                debug!("Host key verified for {}:{}", host, port);
                Ok(())
            }
            HostKeyStatus::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyChanged {
                    host: host.to_string(),
                    port,
                    expected: expected_fingerprint,
                    actual: actual_fingerprint,
                })
            }
            HostKeyStatus::NotIncluded { fingerprint } => {
                let rejected = |reason: &str| SshError::HostKeyRejected {
                    host: host.to_string(),
                    port,
                    fingerprint: fingerprint.clone(),
                    reason: reason.to_string(),
                };

                match self.policy {
                    HostKeyPolicy::Strict => {
                        warn!(
                            "Unknown host key for {}:{} ({}), strict policy, rejecting",
                            host, port, fingerprint
                        );
                        Err(rejected("unknown host under strict policy"))
                    }
                    HostKeyPolicy::AutoAccept => {
                        info!(
                            "New host {}:{}, trusting on first use ({})",
                            host, port, fingerprint
                        );
                        self.trust.add(user_id, host, port, key);
                        Ok(())
                    }
                    HostKeyPolicy::Prompt => {
                        let Some(prompt) = &self.prompt else {
                            warn!("No host key prompt installed; rejecting {}:{}", host, port);
                            return Err(rejected("no prompt available to confirm unknown host"));
                        };
                        if prompt.confirm(user_id, host, port, key).await {
                            info!("Host key for {}:{} confirmed ({})", host, port, fingerprint);
                            self.trust.add(user_id, host, port, key);
                            Ok(())
                        } else {
                            Err(rejected("declined"))
                        }
                    }
                }
            }
        }
    }
}

/// Client handler for russh callbacks: host key verification only
pub struct ClientHandler {
    user_id: Uuid,
    host: String,
    port: u16,
    gate: HostKeyGate,
}

impl ClientHandler {
    pub fn new(user_id: Uuid, host: String, port: u16, gate: HostKeyGate) -> Self {
        Self {
            user_id,
            host,
            port,
            gate,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let key = HostKey::from_public_key(server_public_key);
        self.gate
            .admit(self.user_id, &self.host, self.port, &key)
            .await?;
        Ok(true)
    }
}

/// russh-backed connector
pub struct RusshConnector {
    gate: HostKeyGate,
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(gate: HostKeyGate, connect_timeout: Duration) -> Self {
        Self {
            gate,
            connect_timeout,
        }
    }

    async fn open(
        &self,
        user_id: Uuid,
        target: &SshTarget,
    ) -> Result<client::Handle<ClientHandler>, SshError> {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = ClientHandler::new(user_id, target.host.clone(), target.port, self.gate.clone());

        let mut handle = client::connect(
            Arc::new(ssh_config),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| match e {
            SshError::HostKeyChanged { .. } | SshError::HostKeyRejected { .. } => e,
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed with {}:{}", target.host, target.port);

        let authenticated = match &target.auth {
            SshAuth::Password { password } => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            SshAuth::PrivateKey {
                key_pem,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(key_pem, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&target.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        Ok(handle)
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(
        &self,
        user_id: Uuid,
        target: &SshTarget,
    ) -> Result<Box<dyn ShellTransport>, SshError> {
        info!(
            "Connecting to SSH server at {}:{} as {}",
            target.host, target.port, target.username
        );

        let handle = tokio::time::timeout(self.connect_timeout, self.open(user_id, target))
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "connection to {}:{} timed out after {:?}",
                    target.host, target.port, self.connect_timeout
                ))
            })??;

        info!("SSH authentication successful for {}@{}", target.username, target.host);

        let label = format!("{}@{}:{}", target.username, target.host, target.port);
        Ok(Box::new(spawn_handle_owner_task(handle, label)))
    }
}
