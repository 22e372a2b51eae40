//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Everything else
//! talks to it through a cloneable [`HandleController`] over an mpsc channel,
//! which avoids `Arc<Mutex<Handle>>` contention and locks held across `.await`.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "deploy@build-01:22".into());
//! let channel = controller.open_session_channel().await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Upper bound for a keepalive round-trip inside the owner task
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping outcome, distinguishing slow links from dead ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time (possibly just latency)
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// `keepalive@openssh.com` with want_reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task.
///
/// Cloning is cheap (copies a sender). Never hand one to code outside
/// the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a bare command channel (tests drive the other end)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receiver notified once the connection is closed
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, consuming the handle.
///
/// `label` only appears in log lines.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        info!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result =
                        match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(e)) => {
                                warn!("Keepalive failed for {}: {:?}", label, e);
                                PingResult::IoError
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {} ({:?})", label, PING_TIMEOUT);
                                PingResult::Timeout
                            }
                        };
                    debug!("Keepalive for {}: {:?}", label, result);
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        // Notify subscribers; fails harmlessly when there are none
        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
