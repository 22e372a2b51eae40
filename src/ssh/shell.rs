//! Shell session handles
//!
//! [`ShellSession`] is the local handle for an SSH session. It wraps a
//! [`ShellTransport`] (in production a [`HandleController`]) and never
//! leaves the process that opened it.

use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use serde::Serialize;
use tracing::{debug, warn};

use super::error::SshError;
use super::handle_owner::{HandleController, PingResult};
use crate::session::{Activity, LocalHandle, SessionKey};

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

/// One live SSH connection
#[async_trait]
pub trait ShellTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Round-trip check bounded by `timeout`
    async fn probe(&self, timeout: Duration) -> bool;

    /// Run `command` on a fresh channel
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError>;

    async fn disconnect(&self);
}

#[async_trait]
impl ShellTransport for HandleController {
    fn is_connected(&self) -> bool {
        HandleController::is_connected(self)
    }

    async fn probe(&self, timeout: Duration) -> bool {
        if !HandleController::is_connected(self) {
            return false;
        }
        match tokio::time::timeout(timeout, self.ping()).await {
            Ok(PingResult::Ok) => true,
            Ok(other) => {
                debug!("SSH probe failed: {:?}", other);
                false
            }
            Err(_) => false,
        }
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        let mut channel = self.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("exec failed: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        // Exit status may arrive after EOF, so read until Close
        let drained = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                        exit_status = Some(code)
                    }
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        })
        .await;

        if drained.is_err() {
            let _ = channel.close().await;
            return Err(SshError::Timeout(format!(
                "command did not finish within {:?}",
                timeout
            )));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn disconnect(&self) {
        HandleController::disconnect(self).await;
    }
}

/// Local handle of an SSH session
pub struct ShellSession {
    key: SessionKey,
    host: String,
    port: u16,
    username: String,
    transport: Box<dyn ShellTransport>,
    activity: Activity,
}

impl ShellSession {
    pub fn new(
        key: SessionKey,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        transport: Box<dyn ShellTransport>,
    ) -> Self {
        Self {
            key,
            host: host.into(),
            port,
            username: username.into(),
            transport,
            activity: Activity::new(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_connected(&self) -> bool {
        !self.activity.is_closed() && self.transport.is_connected()
    }

    /// Run one command. Callers serialise commands per session.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        if self.activity.is_closed() {
            return Err(SshError::Disconnected);
        }
        self.activity.touch();
        let output = self.transport.exec(command, timeout).await;
        if let Err(e) = &output {
            warn!("Command on {} failed: {}", self.key, e);
        }
        output
    }
}

#[async_trait]
impl LocalHandle for ShellSession {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    async fn is_alive(&self, timeout: Duration) -> bool {
        self.is_connected() && self.transport.probe(timeout).await
    }

    async fn shutdown(&self) {
        debug!("Disconnecting shell session {}", self.key);
        self.transport.disconnect().await;
    }
}
